//! Worker lifecycle manager: registry of named cooperative background tasks.
//!
//! Every worker receives a `CancellationToken` at spawn time and runs until it
//! observes cancellation. `stop` cancels and joins with a bound; a worker that
//! misses the bound stays registered as a zombie (its name cannot be reused)
//! until a later `stop` succeeds in joining it.
//!
//! The registry is a `DashMap`. No shard guard is held across an await or
//! while user task code runs: tasks are invoked inside the spawned future.

use crate::events::EventBus;
use crate::lock;
use aurabridge_core::{Error, Result, WorkerStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Boxed future produced by a worker task.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

type TaskFn = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send + 'static>;

struct WorkerEntry {
    stop: CancellationToken,
    /// Present until the worker is started.
    task: Mutex<Option<TaskFn>>,
    /// Present while started and not being joined by a `stop` call.
    handle: Option<JoinHandle<()>>,
    status: Arc<Mutex<WorkerStatus>>,
    added_at: Instant,
}

impl WorkerEntry {
    fn new(task: TaskFn) -> Self {
        Self {
            stop: CancellationToken::new(),
            task: Mutex::new(Some(task)),
            handle: None,
            status: Arc::new(Mutex::new(WorkerStatus::Idle)),
            added_at: Instant::now(),
        }
    }

    /// A registered worker is live until its task has exited.
    fn is_live(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            // Either not started yet, or a stop() is currently joining it.
            None => true,
        }
    }
}

/// Registry of named workers. At most one live worker per name.
#[derive(Default)]
pub struct WorkerManager {
    workers: DashMap<String, WorkerEntry>,
    events: Option<EventBus>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that publishes every status change on `events`.
    pub fn with_events(events: EventBus) -> Self {
        Self {
            workers: DashMap::new(),
            events: Some(events),
        }
    }

    /// Register a task under `name`. Fails with `AlreadyRunning` if a live
    /// worker (registered, running, or zombie) already holds the name.
    pub fn add<F, Fut>(&self, name: &str, task: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task: TaskFn = Box::new(move |token| Box::pin(task(token)));
        match self.workers.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    warn!(worker = %name, "Worker already exists and is live");
                    return Err(Error::already_running(name));
                }
                occupied.insert(WorkerEntry::new(task));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WorkerEntry::new(task));
            }
        }
        info!(worker = %name, "Worker added");
        Ok(())
    }

    /// Launch a registered task.
    pub fn start(&self, name: &str) -> Result<()> {
        {
            let mut entry = self
                .workers
                .get_mut(name)
                .ok_or_else(|| Error::not_found(name))?;
            let task = lock(&entry.task)
                .take()
                .ok_or_else(|| Error::already_running(name))?;
            *lock(&entry.status) = WorkerStatus::Running;
            let handle = tokio::spawn(run_worker(
                name.to_string(),
                task,
                entry.stop.clone(),
                entry.status.clone(),
                self.events.clone(),
            ));
            entry.handle = Some(handle);
        }
        info!(worker = %name, "Worker started");
        if let Some(events) = &self.events {
            events.worker(name, WorkerStatus::Running, None);
        }
        Ok(())
    }

    /// `add` followed by `start`.
    pub fn spawn<F, Fut>(&self, name: &str, task: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add(name, task)?;
        self.start(name)
    }

    /// Signal `name` to stop and wait up to `timeout` for it to exit.
    ///
    /// Returns `true` when the worker is gone (including when it was never
    /// registered). Returns `false` if it did not exit in time; the worker then
    /// remains registered as a zombie and the caller must surface that.
    pub async fn stop(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (mut handle, status) = {
            let Some(mut entry) = self.workers.get_mut(name) else {
                return true;
            };
            entry.stop.cancel();
            match entry.handle.take() {
                Some(handle) => {
                    let status = entry.status.clone();
                    {
                        let mut current = lock(&status);
                        if *current == WorkerStatus::Running {
                            *current = WorkerStatus::Stopping;
                        }
                    }
                    (handle, status)
                }
                None if lock(&entry.task).is_some() => {
                    drop(entry);
                    self.workers.remove(name);
                    info!(worker = %name, "Worker removed before start");
                    return true;
                }
                None => {
                    // Another caller is joining this worker; wait for it to finish.
                    drop(entry);
                    return self.wait_removed(name, deadline).await;
                }
            }
        };

        match tokio::time::timeout_at(deadline.into(), &mut handle).await {
            Ok(_) => {
                self.workers.remove(name);
                info!(worker = %name, status = %*lock(&status), "Worker stopped");
                true
            }
            Err(_) => {
                error!(
                    worker = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, keeping it registered"
                );
                if let Some(mut entry) = self.workers.get_mut(name) {
                    entry.handle = Some(handle);
                }
                if let Some(events) = &self.events {
                    events.worker(
                        name,
                        WorkerStatus::Stopping,
                        Some(format!("did not stop within {} ms", timeout.as_millis())),
                    );
                }
                false
            }
        }
    }

    async fn wait_removed(&self, name: &str, deadline: Instant) -> bool {
        while self.workers.contains_key(name) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop every registered worker concurrently. `true` only if all stopped.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let names = self.names();
        let results = join_all(names.iter().map(|name| self.stop(name, timeout))).await;
        results.into_iter().all(|stopped| stopped)
    }

    /// Non-blocking liveness query.
    pub fn is_running(&self, name: &str) -> bool {
        self.workers.get(name).is_some_and(|entry| {
            *lock(&entry.status) == WorkerStatus::Running
                && entry.handle.as_ref().is_some_and(|h| !h.is_finished())
        })
    }

    pub fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.workers.get(name).map(|entry| *lock(&entry.status))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of every registered worker and its status, sorted by name.
    pub fn list(&self) -> Vec<(String, WorkerStatus)> {
        let mut list: Vec<(String, WorkerStatus)> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), *lock(&e.value().status)))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Number of workers that still own a live task.
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|e| e.value().is_live()).count()
    }

    /// Workers that missed their stop bound and have not exited since.
    pub fn zombies(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .iter()
            .filter(|e| {
                *lock(&e.value().status) == WorkerStatus::Stopping
                    && e.value().handle.as_ref().is_some_and(|h| !h.is_finished())
            })
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// How long a worker has been registered.
    pub fn age(&self, name: &str) -> Option<Duration> {
        self.workers.get(name).map(|e| e.added_at.elapsed())
    }
}

async fn run_worker(
    name: String,
    task: TaskFn,
    stop: CancellationToken,
    status: Arc<Mutex<WorkerStatus>>,
    events: Option<EventBus>,
) {
    // The task body runs as its own tokio task so a panic surfaces as a JoinError.
    let outcome = tokio::spawn(async move { task(stop).await }).await;

    let (final_status, message) = match outcome {
        Ok(Ok(())) => {
            info!(worker = %name, "Worker finished");
            (WorkerStatus::Stopped, None)
        }
        Ok(Err(e)) => {
            error!(worker = %name, error = %e, "Worker failed");
            (WorkerStatus::Failed, Some(e.to_string()))
        }
        Err(join) if join.is_panic() => {
            let message = panic_message(join.into_panic().as_ref());
            error!(worker = %name, panic = %message, "Worker panicked");
            (WorkerStatus::Failed, Some(message))
        }
        Err(join) => {
            warn!(worker = %name, error = %join, "Worker task cancelled");
            (WorkerStatus::Failed, Some(join.to_string()))
        }
    };

    *lock(&status) = final_status;
    if let Some(events) = events {
        events.worker(&name, final_status, message);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP: Duration = Duration::from_millis(500);

    async fn until_cancelled(token: CancellationToken) -> Result<()> {
        token.cancelled().await;
        Ok(())
    }

    #[tokio::test]
    async fn add_start_stop() {
        let manager = WorkerManager::new();
        manager.add("aura", until_cancelled).unwrap();
        assert_eq!(manager.status("aura"), Some(WorkerStatus::Idle));
        assert!(!manager.is_running("aura"));

        manager.start("aura").unwrap();
        assert!(manager.is_running("aura"));

        assert!(manager.stop("aura", STOP).await);
        assert!(!manager.is_running("aura"));
        assert_eq!(manager.status("aura"), None);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn add_while_running_is_rejected() {
        let manager = WorkerManager::new();
        manager.spawn("gaze", until_cancelled).unwrap();
        let err = manager.add("gaze", until_cancelled).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { ref name } if name == "gaze"));
        assert!(manager.stop("gaze", STOP).await);
    }

    #[tokio::test]
    async fn start_unknown_is_not_found() {
        let manager = WorkerManager::new();
        let err = manager.start("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn stop_unknown_is_noop_success() {
        let manager = WorkerManager::new();
        assert!(manager.stop("ghost", STOP).await);
        assert!(manager.stop_all(STOP).await);
    }

    #[tokio::test]
    async fn stop_before_start_removes_registration() {
        let manager = WorkerManager::new();
        manager.add("screen", until_cancelled).unwrap();
        assert!(manager.stop("screen", STOP).await);
        assert!(manager.names().is_empty());
        manager.add("screen", until_cancelled).unwrap();
    }

    #[tokio::test]
    async fn task_error_marks_failed_without_crashing() {
        let manager = WorkerManager::new();
        manager
            .spawn("emotion", |_token| async {
                Err(Error::Internal("classifier exploded".into()))
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status("emotion"), Some(WorkerStatus::Failed));
        assert!(!manager.is_running("emotion"));
        // A failed worker does not block its name.
        manager.add("emotion", until_cancelled).unwrap();
    }

    #[tokio::test]
    async fn task_panic_marks_failed() {
        let manager = WorkerManager::new();
        manager
            .spawn("keyboard", |_token| async { panic!("listener died") })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status("keyboard"), Some(WorkerStatus::Failed));
        assert!(manager.stop("keyboard", STOP).await);
    }

    #[tokio::test]
    async fn failure_is_pushed_as_event() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let manager = WorkerManager::with_events(events);
        manager
            .spawn("aura", |_token| async {
                Err(Error::source_failure(aurabridge_core::SignalKind::Aura, "stream lost"))
            })
            .unwrap();

        let mut saw_failed = false;
        for _ in 0..2 {
            if let Ok(Ok(crate::events::AcquisitionEvent::Worker { status, signal, .. })) =
                tokio::time::timeout(Duration::from_secs(1), rx.recv()).await
            {
                if status == WorkerStatus::Failed {
                    assert_eq!(signal, Some(aurabridge_core::SignalKind::Aura));
                    saw_failed = true;
                }
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn stop_timeout_keeps_zombie_registered() {
        let manager = WorkerManager::new();
        manager
            .spawn("stuck", |_token| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            })
            .unwrap();

        assert!(!manager.stop("stuck", Duration::from_millis(20)).await);
        assert_eq!(manager.zombies(), vec!["stuck".to_string()]);
        assert!(matches!(
            manager.add("stuck", until_cancelled),
            Err(Error::AlreadyRunning { .. })
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(manager.zombies().is_empty());
        assert!(manager.stop("stuck", STOP).await);
        manager.add("stuck", until_cancelled).unwrap();
    }

    #[tokio::test]
    async fn stop_all_stops_everything() {
        let manager = WorkerManager::new();
        for name in ["aura", "pointer", "keyboard"] {
            manager.spawn(name, until_cancelled).unwrap();
        }
        assert_eq!(manager.live_count(), 3);
        assert!(manager.stop_all(STOP).await);
        assert_eq!(manager.live_count(), 0);
    }
}
