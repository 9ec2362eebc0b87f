//! ticketflow: issue intake orchestration.
//!
//! Issues are synced from external trackers into local tasks, evaluated by
//! an AI worker, and (when judged ready) implemented by one. Work moves
//! between stages over a message broker with retry and dead-letter queues;
//! workers either consume from the broker or pull over HTTP.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod sdk;
pub mod store;
pub mod sync;
