//! featurestore-worker — task orchestrator and entity index for feature
//! stores.
//!
//! Producers push JSON tasks onto a durable queue; a single
//! [`TaskDispatcher`](dispatch::TaskDispatcher) pops them, runs the matching
//! [`StoreLifecycle`](store::StoreLifecycle) operation and pushes status
//! records back.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod logger;
pub mod queue;
pub mod store;
