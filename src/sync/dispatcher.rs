use super::executor::RemoteSyncExecutor;
use super::scheduler::backoff;
use super::store::{StoreError, SyncStore};
use crate::config::DispatchConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is not running")]
    Unavailable,
    #[error("dispatch pass failed: {0}")]
    Failed(String),
}

/// Summary of one pass over the pending queue.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Executed requests whose outcome could not be written back.
    pub unrecorded: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub periodic: bool,
    pub executor: &'static str,
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unrecorded: u64,
    pub recovered: u64,
    pub last_run: Option<DispatchRun>,
    pub last_error: Option<String>,
}

const RECORD_ATTEMPTS: u32 = 4;

struct Wake {
    reply: Option<oneshot::Sender<Result<DispatchRun, String>>>,
}

/// Drains pending sync requests through an executor.
pub struct SyncDispatcher<E> {
    store: SyncStore,
    executor: Arc<E>,
    batch_size: usize,
}

impl<E: RemoteSyncExecutor> SyncDispatcher<E> {
    pub fn new(store: SyncStore, executor: E, batch_size: usize) -> Self {
        Self {
            store,
            executor: Arc::new(executor),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self) -> Result<DispatchRun, StoreError> {
        let mut run = DispatchRun {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            claimed: 0,
            succeeded: 0,
            failed: 0,
            unrecorded: 0,
        };

        let store = &self.store;
        while run.claimed < self.batch_size {
            let Some(request) = store.claim_next().await? else {
                break;
            };
            run.claimed += 1;
            let started = Instant::now();
            match self.executor.execute(&request).await {
                Ok(report) => {
                    let recorded = self
                        .record(run.run_id, request.id, move || {
                            store.complete(request.id, report.remote_requests)
                        })
                        .await;
                    if !recorded {
                        run.unrecorded += 1;
                        continue;
                    }
                    run.succeeded += 1;
                    crate::metrics::sync_dispatched(
                        &request.task_func_path,
                        true,
                        started.elapsed().as_millis(),
                    );
                    debug!(
                        target = "pim_sync.dispatcher",
                        run_id = %run.run_id,
                        request_id = request.id,
                        remote_requests = report.remote_requests,
                        "sync_request_done"
                    );
                }
                Err(err) => {
                    let message = err.to_string();
                    let detail = message.as_str();
                    let recorded = self
                        .record(run.run_id, request.id, move || store.fail(request.id, detail))
                        .await;
                    if !recorded {
                        run.unrecorded += 1;
                        continue;
                    }
                    run.failed += 1;
                    crate::metrics::sync_dispatched(
                        &request.task_func_path,
                        false,
                        started.elapsed().as_millis(),
                    );
                    warn!(
                        target = "pim_sync.dispatcher",
                        run_id = %run.run_id,
                        request_id = request.id,
                        task = %request.task_func_path,
                        error = %err,
                        "sync_request_failed"
                    );
                }
            }
        }

        if run.claimed > 0 {
            info!(
                target = "pim_sync.dispatcher",
                run_id = %run.run_id,
                claimed = run.claimed,
                succeeded = run.succeeded,
                failed = run.failed,
                unrecorded = run.unrecorded,
                "dispatch_pass_finished"
            );
        }
        Ok(run)
    }

    /// Writes a request outcome, retrying lock conflicts. A write that still
    /// fails is logged and the pass moves on; the row stays `PROCESSING`
    /// until start-up recovery fails it.
    async fn record<F, Fut>(&self, run_id: Uuid, request_id: i64, write: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write().await {
                Ok(()) => return true,
                Err(err) if err.is_transient() && attempt < RECORD_ATTEMPTS => {
                    let delay = backoff(attempt);
                    warn!(
                        target = "pim_sync.dispatcher",
                        %run_id,
                        request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "record_outcome_retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        target = "pim_sync.dispatcher",
                        %run_id,
                        request_id,
                        attempt,
                        error = %err,
                        "record_outcome_failed"
                    );
                    return false;
                }
            }
        }
    }

    /// Starts the worker. Automatic passes (poll interval and wake-ups) only
    /// happen when `config.enabled` is set; `run_now` always works.
    pub fn spawn(
        self,
        config: &DispatchConfig,
        executor_label: &'static str,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Wake>(config.queue_capacity.max(1));
        let stats = Arc::new(Mutex::new(DispatchStats {
            periodic: config.enabled,
            executor: executor_label,
            ..DispatchStats::default()
        }));
        let stats_bg = stats.clone();
        let periodic = config.enabled;
        let interval = config.interval;

        let handle = tokio::spawn(async move {
            match self.store.recover_interrupted().await {
                Ok(0) => {}
                Ok(recovered) => {
                    stats_bg.lock().await.recovered = recovered;
                    warn!(
                        target = "pim_sync.dispatcher",
                        recovered, "interrupted_requests_failed"
                    );
                }
                Err(err) => error!(
                    target = "pim_sync.dispatcher",
                    error = %err,
                    "recover_interrupted_failed"
                ),
            }

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let reply = if periodic {
                    tokio::select! {
                        _ = ticker.tick() => None,
                        wake = rx.recv() => match wake {
                            Some(wake) => wake.reply,
                            None => break,
                        },
                    }
                } else {
                    match rx.recv().await {
                        Some(wake) => wake.reply,
                        None => break,
                    }
                };

                let result = self.run_once().await;
                {
                    let mut guard = stats_bg.lock().await;
                    match &result {
                        Ok(run) => {
                            guard.runs += 1;
                            guard.succeeded += run.succeeded as u64;
                            guard.failed += run.failed as u64;
                            guard.unrecorded += run.unrecorded as u64;
                            guard.last_run = Some(run.clone());
                            guard.last_error = None;
                        }
                        Err(err) => guard.last_error = Some(err.to_string()),
                    }
                }
                if let Err(err) = &result {
                    error!(target = "pim_sync.dispatcher", error = %err, "dispatch_pass_failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result.map_err(|err| err.to_string()));
                }
            }
            info!(target = "pim_sync.dispatcher", "dispatcher_stopped");
        });

        (
            DispatcherHandle {
                tx,
                stats,
                automatic: periodic,
            },
            handle,
        )
    }
}

#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Wake>,
    stats: Arc<Mutex<DispatchStats>>,
    automatic: bool,
}

impl DispatcherHandle {
    /// Nudges the worker without waiting. A full queue already guarantees
    /// another pass, so the signal is dropped.
    pub fn wake(&self) -> bool {
        self.automatic && self.tx.try_send(Wake { reply: None }).is_ok()
    }

    pub async fn run_now(&self) -> Result<DispatchRun, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Wake { reply: Some(reply) })
            .await
            .map_err(|_| DispatchError::Unavailable)?;
        match rx.await {
            Ok(Ok(run)) => Ok(run),
            Ok(Err(detail)) => Err(DispatchError::Failed(detail)),
            Err(_) => Err(DispatchError::Unavailable),
        }
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::executor::{ExecutionReport, ExecutorError};
    use crate::sync::store::tests::{COMPANY, fixture};
    use crate::sync::types::{SyncRequest, SyncStatus, SyncType};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Marks every claimed row as interrupted while its task runs, so the
    /// outcome write finds no `PROCESSING` row.
    struct RecoveringExecutor {
        store: SyncStore,
    }

    impl RemoteSyncExecutor for RecoveringExecutor {
        async fn execute(&self, request: &SyncRequest) -> Result<ExecutionReport, ExecutorError> {
            if request.sync_type == SyncType::Price {
                self.store.recover_interrupted().await.expect("recover");
            }
            Ok(ExecutionReport { remote_requests: 1 })
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        seen: StdMutex<Vec<i64>>,
        fail_type: Option<SyncType>,
    }

    impl RemoteSyncExecutor for RecordingExecutor {
        async fn execute(&self, request: &SyncRequest) -> Result<ExecutionReport, ExecutorError> {
            self.seen.lock().expect("lock").push(request.id);
            if Some(request.sync_type) == self.fail_type {
                return Err(ExecutorError::Rejected {
                    status: 503,
                    body: "busy".into(),
                });
            }
            Ok(ExecutionReport { remote_requests: 3 })
        }
    }

    fn config(enabled: bool) -> DispatchConfig {
        DispatchConfig {
            enabled,
            interval: Duration::from_secs(60),
            batch_size: 10,
            queue_capacity: 4,
        }
    }

    #[tokio::test]
    async fn run_once_completes_and_fails_requests() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await;
        fx.schedule_in(5, Some(fx.view_b), SyncType::Ean).await;

        let dispatcher = SyncDispatcher::new(
            fx.store.clone(),
            RecordingExecutor {
                fail_type: Some(SyncType::Ean),
                ..RecordingExecutor::default()
            },
            10,
        );
        let run = dispatcher.run_once().await.expect("run");
        assert_eq!(run.claimed, 2);
        assert_eq!(run.succeeded, 1);
        assert_eq!(run.failed, 1);

        let requests = fx
            .store
            .list_requests(COMPANY, &Default::default())
            .await
            .expect("list");
        let price = requests
            .iter()
            .find(|r| r.sync_type == SyncType::Price)
            .expect("price row");
        assert_eq!(price.status, SyncStatus::Done);
        assert_eq!(price.number_of_remote_requests, 3);
        assert_eq!(price.attempts, 1);
        let ean = requests
            .iter()
            .find(|r| r.sync_type == SyncType::Ean)
            .expect("ean row");
        assert_eq!(ean.status, SyncStatus::Failed);
        assert!(ean.error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn run_once_respects_batch_size() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await;
        fx.schedule_in(5, Some(fx.view_b), SyncType::Price).await;

        let dispatcher = SyncDispatcher::new(fx.store.clone(), RecordingExecutor::default(), 1);
        assert_eq!(dispatcher.run_once().await.expect("run").claimed, 1);
        assert_eq!(fx.store.pending_count().await.expect("count"), 1);
        assert_eq!(dispatcher.run_once().await.expect("run").claimed, 1);
        assert_eq!(dispatcher.run_once().await.expect("run").claimed, 0);
    }

    #[tokio::test]
    async fn failed_outcome_write_does_not_end_the_pass() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await;
        fx.schedule_in(5, Some(fx.view_b), SyncType::Ean).await;

        let dispatcher = SyncDispatcher::new(
            fx.store.clone(),
            RecoveringExecutor {
                store: fx.store.clone(),
            },
            10,
        );
        let run = dispatcher.run_once().await.expect("run");
        assert_eq!(run.claimed, 2);
        assert_eq!(run.unrecorded, 1);
        assert_eq!(run.succeeded, 1);

        let requests = fx
            .store
            .list_requests(COMPANY, &Default::default())
            .await
            .expect("list");
        let ean = requests
            .iter()
            .find(|r| r.sync_type == SyncType::Ean)
            .expect("ean row");
        assert_eq!(ean.status, SyncStatus::Done);
    }

    #[tokio::test]
    async fn worker_errors_surface_as_failed_runs() {
        let fx = fixture().await;
        let dispatcher = SyncDispatcher::new(fx.store.clone(), RecordingExecutor::default(), 10);
        let (handle, _worker) = dispatcher.spawn(&config(false), "recording");
        handle.run_now().await.expect("first run");

        fx.store.close().await;
        let err = handle.run_now().await.expect_err("closed pool");
        assert!(matches!(err, DispatchError::Failed(_)));
        assert!(handle.stats().await.last_error.is_some());
    }

    #[tokio::test]
    async fn spawned_worker_answers_manual_runs() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Content).await;

        let dispatcher = SyncDispatcher::new(fx.store.clone(), RecordingExecutor::default(), 10);
        let (handle, _worker) = dispatcher.spawn(&config(false), "recording");
        let run = handle.run_now().await.expect("run");
        assert_eq!(run.claimed, 1);

        let stats = handle.stats().await;
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.executor, "recording");
        assert!(!stats.periodic);
        assert!(!handle.wake());
        assert_eq!(fx.store.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn start_up_fails_interrupted_requests() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await;
        let claimed = fx.store.claim_next().await.expect("claim").expect("row");

        let dispatcher = SyncDispatcher::new(fx.store.clone(), RecordingExecutor::default(), 10);
        let (handle, _worker) = dispatcher.spawn(&config(false), "recording");
        handle.run_now().await.expect("run");

        let request = fx.store.request(COMPANY, claimed.id).await.expect("request");
        assert_eq!(request.status, SyncStatus::Failed);
        assert_eq!(handle.stats().await.recovered, 1);
    }
}
