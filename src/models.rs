use crate::sync::{
    dispatcher::DispatchStats,
    types::{ScheduleOutcome, SyncRequest},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(error: &str, detail: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResyncRequest {
    #[serde(default)]
    pub view_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentRequest {
    pub product_id: i64,
}

/// Replayed verbatim for a repeated `Idempotency-Key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub event: String,
    pub outcomes: Vec<ScheduleOutcome>,
}

#[derive(Debug, Serialize)]
pub struct SyncRequestDetail {
    #[serde(flatten)]
    pub request: SyncRequest,
    /// Present when the request was skipped in favour of another one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective: Option<SyncRequest>,
}

#[derive(Debug, Serialize)]
pub struct DispatcherStatus {
    #[serde(flatten)]
    pub stats: DispatchStats,
    pub pending_total: i64,
    pub by_status: BTreeMap<String, i64>,
}
