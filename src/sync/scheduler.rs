use super::events::ChangeEvent;
use super::planner::{DedupePolicy, Incoming};
use super::store::{StoreError, SyncStore, TargetScope};
use super::types::{ScheduleOutcome, SyncStatus};
use rand::Rng;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync request {id} is {status:?}; only failed requests can be retried")]
    NotRetryable { id: i64, status: SyncStatus },
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

#[derive(Clone)]
pub struct SyncScheduler {
    store: SyncStore,
    policy: DedupePolicy,
    max_attempts: u32,
}

impl SyncScheduler {
    pub fn new(store: SyncStore, policy: DedupePolicy, max_attempts: u32) -> Self {
        Self {
            store,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    pub async fn schedule(
        &self,
        company_id: &str,
        event: &ChangeEvent,
    ) -> Result<Vec<ScheduleOutcome>, ScheduleError> {
        let scope = TargetScope::Product {
            product_id: event.subject_product_id(),
            view_id: event.view_filter(),
        };
        let incoming = Incoming {
            sync_type: event.sync_type(),
            reason: event.reason(),
        };
        let mut kwargs = event.task_kwargs();
        kwargs.insert("event".into(), Value::from(event.kind()));

        let outcomes = self.run(company_id, scope, &incoming, &kwargs).await?;
        crate::metrics::sync_scheduled(event.kind(), outcomes.len());
        info!(
            target = "pim_sync.scheduler",
            company_id,
            event = event.kind(),
            targets = outcomes.len(),
            "change_event_scheduled"
        );
        Ok(outcomes)
    }

    /// Best-effort hook for write paths: a missed sync request means stale
    /// remote data, never a failed local write.
    pub async fn notify(&self, company_id: &str, event: &ChangeEvent) -> usize {
        match self.schedule(company_id, event).await {
            Ok(outcomes) => outcomes.len(),
            Err(err) => {
                warn!(
                    target = "pim_sync.scheduler",
                    company_id,
                    event = event.kind(),
                    error = %err,
                    "change_event_dropped"
                );
                0
            }
        }
    }

    /// Re-runs a failed request through dedupe on its exact target.
    pub async fn retry_failed(
        &self,
        company_id: &str,
        request_id: i64,
    ) -> Result<Vec<ScheduleOutcome>, ScheduleError> {
        let failed = self.store.request(company_id, request_id).await?;
        if failed.status != SyncStatus::Failed {
            return Err(ScheduleError::NotRetryable {
                id: request_id,
                status: failed.status,
            });
        }
        let incoming = Incoming {
            sync_type: failed.sync_type,
            reason: format!("retry of #{request_id}"),
        };
        let mut kwargs = match &failed.task_kwargs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        kwargs.insert("retry_of".into(), json!(request_id));

        let outcomes = self
            .run(
                company_id,
                TargetScope::Exact(failed.target()),
                &incoming,
                &kwargs,
            )
            .await?;
        info!(
            target = "pim_sync.scheduler",
            company_id,
            request_id,
            "failed_sync_request_retried"
        );
        Ok(outcomes)
    }

    async fn run(
        &self,
        company_id: &str,
        scope: TargetScope,
        incoming: &Incoming,
        kwargs: &Map<String, Value>,
    ) -> Result<Vec<ScheduleOutcome>, ScheduleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .schedule(company_id, scope, incoming, kwargs, &self.policy)
                .await
            {
                Ok(outcomes) => return Ok(outcomes),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff(attempt);
                    warn!(
                        target = "pim_sync.scheduler",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "schedule_conflict_retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(ScheduleError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    let base = 10u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::tests::{COMPANY, fixture, fixture_on};
    use crate::sync::store::RequestFilter;
    use crate::sync::types::{Disposition, SyncType};

    #[tokio::test]
    async fn schedules_events_with_event_kwargs() {
        let fx = fixture().await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 3);
        let outcomes = scheduler
            .schedule(
                COMPANY,
                &ChangeEvent::PropertyUpdated {
                    product_id: 5,
                    property_id: 77,
                },
            )
            .await
            .expect("schedule");
        assert_eq!(outcomes.len(), 2);

        let request = fx
            .store
            .request(COMPANY, outcomes[0].request_id)
            .await
            .expect("request");
        assert_eq!(request.sync_type, SyncType::Property);
        assert_eq!(request.task_kwargs["property_id"], 77);
        assert_eq!(request.task_kwargs["event"], "property_updated");
        assert_eq!(request.task_func_path, "amazon.sync_properties");
    }

    #[tokio::test]
    async fn manual_resync_can_target_one_view() {
        let fx = fixture().await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 3);
        let outcomes = scheduler
            .schedule(
                COMPANY,
                &ChangeEvent::ManualResync {
                    product_id: 5,
                    view_id: Some(fx.view_b),
                },
            )
            .await
            .expect("schedule");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].target.sales_channel_view_id, fx.view_b);
    }

    #[tokio::test]
    async fn retry_requires_failed_request() {
        let fx = fixture().await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 3);
        let outcome = scheduler
            .schedule(COMPANY, &ChangeEvent::ProductUpdated { product_id: 5 })
            .await
            .expect("schedule")
            .remove(0);

        let err = scheduler
            .retry_failed(COMPANY, outcome.request_id)
            .await
            .expect_err("pending cannot be retried");
        assert!(matches!(err, ScheduleError::NotRetryable { .. }));

        let claimed = fx.store.claim_next().await.expect("claim").expect("row");
        fx.store.fail(claimed.id, "remote 503").await.expect("fail");

        let retried = scheduler
            .retry_failed(COMPANY, claimed.id)
            .await
            .expect("retry")
            .remove(0);
        assert_eq!(retried.disposition, Disposition::Queued);
        assert_eq!(retried.target, claimed.target());
        let request = fx
            .store
            .request(COMPANY, retried.request_id)
            .await
            .expect("request");
        assert_eq!(request.reason, format!("retry of #{}", claimed.id));
        assert_eq!(request.task_kwargs["retry_of"], claimed.id);
    }

    #[tokio::test]
    async fn unknown_products_schedule_nothing() {
        let fx = fixture().await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 1);
        let outcomes = scheduler
            .schedule(COMPANY, &ChangeEvent::ProductUpdated { product_id: 999 })
            .await
            .expect("schedule");
        assert!(outcomes.is_empty());
        assert_eq!(fx.store.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn notify_swallows_errors() {
        let fx = fixture().await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 1);
        let scheduled = scheduler
            .notify(
                COMPANY,
                &ChangeEvent::ManualResync {
                    product_id: 5,
                    view_id: Some(fx.view_a),
                },
            )
            .await;
        assert_eq!(scheduled, 1);

        // a closed pool fails the write; the hook must only log it
        fx.store.close().await;
        let scheduled = scheduler
            .notify(COMPANY, &ChangeEvent::ProductUpdated { product_id: 5 })
            .await;
        assert_eq!(scheduled, 0);
    }

    #[tokio::test]
    async fn concurrent_schedulers_keep_one_pending_product() {
        let path = std::env::temp_dir().join(format!("pim-sync-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = SyncStore::connect(&url, 4).await.expect("file store");
        let fx = fixture_on(store).await;
        let scheduler = SyncScheduler::new(fx.store.clone(), DedupePolicy::default(), 25);

        let mut handles = Vec::new();
        for idx in 0..6 {
            let scheduler = scheduler.clone();
            let event = if idx % 2 == 0 {
                ChangeEvent::ProductUpdated { product_id: 5 }
            } else {
                ChangeEvent::PriceUpdated {
                    product_id: 5,
                    currency: None,
                }
            };
            handles.push(tokio::spawn(async move {
                scheduler.schedule(COMPANY, &event).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("schedule");
        }

        for view in [fx.view_a, fx.view_b] {
            let pending_products = fx
                .store
                .list_requests(
                    COMPANY,
                    &RequestFilter {
                        status: Some(SyncStatus::Pending),
                        sync_type: Some(SyncType::Product),
                        view_id: Some(view),
                        ..RequestFilter::default()
                    },
                )
                .await
                .expect("list");
            assert_eq!(pending_products.len(), 1);
        }

        let base = path.display().to_string();
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{base}{suffix}"));
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        assert!(backoff(1) >= Duration::from_millis(20));
        assert!(backoff(4) >= Duration::from_millis(160));
        assert!(backoff(40) <= Duration::from_millis(1280));
    }
}
