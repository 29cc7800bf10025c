//! Sync request scheduling: turning local product changes into deduplicated
//! work items per remote listing, and draining them to the integrations.

pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod planner;
pub mod scheduler;
pub mod store;
pub mod types;
