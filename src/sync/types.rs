use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What part of a remote listing a request re-syncs. `Product` is the full
/// sync; every other variant is narrower and is covered by a full sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Product,
    Property,
    Price,
    Content,
    Images,
    Ean,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Product => "PRODUCT",
            SyncType::Property => "PROPERTY",
            SyncType::Price => "PRICE",
            SyncType::Content => "CONTENT",
            SyncType::Images => "IMAGES",
            SyncType::Ean => "EAN",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "PRODUCT" => Some(SyncType::Product),
            "PROPERTY" => Some(SyncType::Property),
            "PRICE" => Some(SyncType::Price),
            "CONTENT" => Some(SyncType::Content),
            "IMAGES" => Some(SyncType::Images),
            "EAN" => Some(SyncType::Ean),
            _ => None,
        }
    }

    pub fn is_product(&self) -> bool {
        matches!(self, SyncType::Product)
    }

    /// Task suffix used to build `task_func_path`.
    pub fn task_name(&self) -> &'static str {
        match self {
            SyncType::Product => "sync_product",
            SyncType::Property => "sync_properties",
            SyncType::Price => "sync_price",
            SyncType::Content => "sync_content",
            SyncType::Images => "sync_images",
            SyncType::Ean => "sync_ean_code",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Processing,
    Skipped,
    Done,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Processing => "PROCESSING",
            SyncStatus::Skipped => "SKIPPED",
            SyncStatus::Done => "DONE",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "PENDING" => Some(SyncStatus::Pending),
            "PROCESSING" => Some(SyncStatus::Processing),
            "SKIPPED" => Some(SyncStatus::Skipped),
            "DONE" => Some(SyncStatus::Done),
            "FAILED" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// The unit of dedupe: one remote product as seen through one view of one
/// sales channel. Coalescing never crosses targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SyncTarget {
    pub remote_product_id: i64,
    pub sales_channel_id: i64,
    pub sales_channel_view_id: i64,
}

impl SyncTarget {
    pub fn new(remote_product_id: i64, sales_channel_id: i64, sales_channel_view_id: i64) -> Self {
        Self {
            remote_product_id,
            sales_channel_id,
            sales_channel_view_id,
        }
    }

    /// Same channel and view, different remote product.
    pub fn with_remote_product(&self, remote_product_id: i64) -> Self {
        Self {
            remote_product_id,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: i64,
    pub remote_product_id: i64,
    pub sales_channel_id: i64,
    pub sales_channel_view_id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub reason: String,
    pub task_func_path: String,
    pub task_kwargs: Value,
    pub number_of_remote_requests: i64,
    pub skipped_for_id: Option<i64>,
    pub error: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRequest {
    pub fn target(&self) -> SyncTarget {
        SyncTarget::new(
            self.remote_product_id,
            self.sales_channel_id,
            self.sales_channel_view_id,
        )
    }
}

/// How an incoming change was folded into the pending queue of one target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new pending row was created for the change.
    Queued,
    /// An already pending full sync covers the change.
    Reused,
    /// A narrower collision was upgraded to a full sync.
    Upgraded,
    /// The change rolled up into the parent's full sync.
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub target: SyncTarget,
    /// Row that records the incoming change.
    pub request_id: i64,
    /// Pending row that will carry the change out.
    pub effective_request_id: i64,
    pub disposition: Disposition,
    pub skipped: Vec<i64>,
}
