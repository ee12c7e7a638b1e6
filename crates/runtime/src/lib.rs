//! The agent-run runtime: streaming response processing, context
//! management, thread orchestration, and the run scheduler/worker
//! lifecycle.
//!
//! Wiring for one run: the scheduler enqueues a [`run::RunRequest`], a
//! worker pops it, acquires the single-flight lock, initializes MCP
//! tooling, drives the thread manager's event stream, and mirrors every
//! event into the resumable log while the registry tracks lifecycle
//! state.

pub mod cancel;
pub mod context;
pub mod processor;
pub mod reconcile;
pub mod scheduler;
pub mod thread;
pub mod worker;
pub mod xml_parser;

pub use cancel::CancelToken;
pub use context::ContextManager;
pub use processor::{ProcessorConfig, ResponseProcessor, ToolExecutionStrategy};
pub use reconcile::ReconciliationSweep;
pub use scheduler::RunScheduler;
pub use thread::{RunThreadParams, ThreadManager};
pub use worker::{consume_queue, signal_stop, RunWorker};
pub use xml_parser::{StreamingXmlParser, XmlToolCall};

pub use skein_domain::run;

/// Short random identifier for this worker process.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
