//! Decides how one incoming change folds into the pending sync requests of a
//! target. The planner is pure: the store loads a [`Snapshot`] inside its
//! transaction, asks for a [`Plan`], then performs the writes in order.

use super::types::{Disposition, SyncStatus, SyncTarget, SyncType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupePolicy {
    /// Two narrower changes on the same target become one full sync.
    pub upgrade_on_narrow_collision: bool,
}

impl Default for DedupePolicy {
    fn default() -> Self {
        Self {
            upgrade_on_narrow_collision: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRow {
    pub id: i64,
    pub remote_product_id: i64,
    pub sync_type: SyncType,
}

/// Parent and sibling state for a variation target, all on the target's view.
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    pub parent: Option<SyncTarget>,
    pub parent_pending: Vec<PendingRow>,
    pub siblings_pending: Vec<PendingRow>,
}

impl Lineage {
    fn parent_pending_product(&self) -> Option<i64> {
        pending_product(&self.parent_pending)
    }

    fn should_escalate(&self) -> bool {
        self.parent.is_some()
            && (!self.siblings_pending.is_empty() || self.parent_pending_product().is_some())
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub target: SyncTarget,
    pub pending: Vec<PendingRow>,
    /// Present only when the target's remote product is a variation.
    pub lineage: Option<Lineage>,
}

#[derive(Debug, Clone)]
pub struct Incoming {
    pub sync_type: SyncType,
    pub reason: String,
}

/// Reference to a row that exists already or is created earlier in the plan.
/// `New(n)` is the n-th insert of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRef {
    Existing(i64),
    New(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Insert {
        target: SyncTarget,
        sync_type: SyncType,
        status: SyncStatus,
        skipped_for: Option<RowRef>,
        reason: String,
    },
    Skip {
        ids: Vec<i64>,
        skipped_for: RowRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub writes: Vec<Write>,
    pub incoming: RowRef,
    pub effective: RowRef,
    pub disposition: Disposition,
}

impl Plan {
    /// Existing rows this plan marks skipped.
    pub fn skipped_ids(&self) -> Vec<i64> {
        self.writes
            .iter()
            .filter_map(|write| match write {
                Write::Skip { ids, .. } => Some(ids.iter().copied()),
                Write::Insert { .. } => None,
            })
            .flatten()
            .collect()
    }
}

#[derive(Default)]
struct PlanBuilder {
    writes: Vec<Write>,
    inserts: usize,
}

impl PlanBuilder {
    fn insert(
        &mut self,
        target: SyncTarget,
        sync_type: SyncType,
        skipped_for: Option<RowRef>,
        reason: String,
    ) -> RowRef {
        let status = if skipped_for.is_some() {
            SyncStatus::Skipped
        } else {
            SyncStatus::Pending
        };
        self.writes.push(Write::Insert {
            target,
            sync_type,
            status,
            skipped_for,
            reason,
        });
        let slot = self.inserts;
        self.inserts += 1;
        RowRef::New(slot)
    }

    fn skip(&mut self, ids: Vec<i64>, skipped_for: RowRef) {
        if !ids.is_empty() {
            self.writes.push(Write::Skip { ids, skipped_for });
        }
    }
}

fn pending_product(rows: &[PendingRow]) -> Option<i64> {
    rows.iter()
        .find(|row| row.sync_type.is_product())
        .map(|row| row.id)
}

fn pending_narrow(rows: &[PendingRow]) -> Vec<i64> {
    rows.iter()
        .filter(|row| !row.sync_type.is_product())
        .map(|row| row.id)
        .collect()
}

pub fn plan(snapshot: &Snapshot, incoming: &Incoming, policy: &DedupePolicy) -> Plan {
    let target = snapshot.target;
    debug_assert!(
        snapshot
            .pending
            .iter()
            .all(|row| row.remote_product_id == target.remote_product_id)
    );
    let existing_product = pending_product(&snapshot.pending);
    let existing_narrow = pending_narrow(&snapshot.pending);
    let narrow_incoming = !incoming.sync_type.is_product();

    let upgrade = narrow_incoming
        && existing_product.is_none()
        && !existing_narrow.is_empty()
        && policy.upgrade_on_narrow_collision;

    let mut builder = PlanBuilder::default();

    if narrow_incoming && !upgrade {
        let row = builder.insert(target, incoming.sync_type, None, incoming.reason.clone());
        return Plan {
            writes: builder.writes,
            incoming: row,
            effective: row,
            disposition: Disposition::Queued,
        };
    }

    let lineage = snapshot
        .lineage
        .as_ref()
        .filter(|lineage| lineage.should_escalate());

    let parent = lineage.and_then(|lineage| {
        let parent_target = lineage.parent?;
        Some(match lineage.parent_pending_product() {
            Some(id) => RowRef::Existing(id),
            None => {
                let row = builder.insert(
                    parent_target,
                    SyncType::Product,
                    None,
                    format!(
                        "escalated from variation remote product {}: {}",
                        target.remote_product_id, incoming.reason
                    ),
                );
                builder.skip(pending_narrow(&lineage.parent_pending), row);
                row
            }
        })
    });

    let product = match existing_product {
        Some(id) => {
            if let Some(parent) = parent {
                builder.skip(vec![id], parent);
            }
            RowRef::Existing(id)
        }
        None => {
            let reason = if upgrade {
                format!(
                    "upgraded from {}: {}",
                    incoming.sync_type.as_str(),
                    incoming.reason
                )
            } else {
                incoming.reason.clone()
            };
            builder.insert(target, SyncType::Product, parent, reason)
        }
    };

    // Narrower rows that arrived after an existing full sync keep coexisting
    // with it unless the whole target rolls up into the parent.
    if existing_product.is_none() || parent.is_some() {
        builder.skip(existing_narrow, product);
    }

    let incoming_row = if upgrade {
        builder.insert(
            target,
            incoming.sync_type,
            Some(product),
            incoming.reason.clone(),
        )
    } else {
        product
    };

    if let (Some(parent), Some(lineage)) = (parent, lineage) {
        builder.skip(
            lineage.siblings_pending.iter().map(|row| row.id).collect(),
            parent,
        );
    }

    let disposition = if parent.is_some() {
        Disposition::Escalated
    } else if upgrade {
        Disposition::Upgraded
    } else if existing_product.is_some() {
        Disposition::Reused
    } else {
        Disposition::Queued
    };

    Plan {
        writes: builder.writes,
        incoming: incoming_row,
        effective: parent.unwrap_or(product),
        disposition,
    }
}
