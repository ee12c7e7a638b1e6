//! Per-run durable event log with live fan-out, and the run registry.
//!
//! The event log is the list-append + notify pattern over the broker:
//! `responses:<run_id>` holds every event in append order, and a sentinel
//! is published on `new_event:<run_id>` after each append. Subscribers
//! replay the list from a cursor and then follow notifications, so a
//! disconnecting client can resume mid-run.

mod event_log;
mod keys;
mod registry;

pub use event_log::{EventLog, LogItem};
pub use keys::*;
pub use registry::{JsonlRunRegistry, RunRegistry, TransitionResult};
