//! Orphan-run reconciliation.
//!
//! A worker that dies mid-run leaves its registry row `running` and its
//! lock to expire. The sweep finds `running` rows with no live lock and
//! fails them, so clients are never left watching a run that nobody is
//! driving.

use std::sync::Arc;
use std::time::Duration;

use skein_broker::Broker;
use skein_domain::event::{control, Event, StatusValue};
use skein_domain::run::RunStatus;
use skein_domain::Result;
use skein_runlog::{run_lock_key, EventLog, RunRegistry, TransitionResult};

use crate::cancel::CancelToken;

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const WORKER_LOST: &str = "worker lost";

pub struct ReconciliationSweep {
    broker: Arc<dyn Broker>,
    registry: Arc<dyn RunRegistry>,
    event_log: EventLog,
}

impl ReconciliationSweep {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<dyn RunRegistry>) -> Self {
        let event_log = EventLog::new(Arc::clone(&broker));
        Self {
            broker,
            registry,
            event_log,
        }
    }

    /// One pass: fail every `running` run whose lock has expired. Returns
    /// the number of runs reconciled.
    pub async fn sweep_once(&self) -> Result<usize> {
        let running = self.registry.list_running().await?;
        let mut reconciled = 0;

        for run in running {
            let lock = self.broker.get(&run_lock_key(run.run_id)).await?;
            if lock.is_some() {
                continue;
            }

            let result = self
                .registry
                .transition(run.run_id, RunStatus::Failed, Some(WORKER_LOST.into()))
                .await?;
            if matches!(result, TransitionResult::Applied(_)) {
                tracing::warn!(run_id = %run.run_id, "reconciled orphaned run");
                let event = Event::status_with_message(
                    Some(run.thread_id),
                    StatusValue::Error,
                    WORKER_LOST,
                );
                if let Err(e) = self.event_log.append(run.run_id, &event).await {
                    tracing::warn!(error = %e, "failed to append orphan error event");
                }
                if let Err(e) = self
                    .event_log
                    .publish_control(run.run_id, control::ERROR)
                    .await
                {
                    tracing::warn!(error = %e, "failed to publish orphan control token");
                }
                reconciled += 1;
            }
        }

        Ok(reconciled)
    }

    /// Run the sweep on an interval until shutdown.
    pub async fn run_forever(&self, shutdown: CancelToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if shutdown.is_cancelled() {
                return;
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reconciled = n, "orphan sweep"),
                Err(e) => tracing::warn!(error = %e, "orphan sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_broker::MemoryBroker;
    use skein_domain::config::RUN_KEY_TTL;
    use skein_domain::run::AgentRun;
    use skein_runlog::JsonlRunRegistry;
    use uuid::Uuid;

    async fn running_run(registry: &Arc<dyn RunRegistry>) -> AgentRun {
        let run = AgentRun::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "sonnet",
            serde_json::json!({}),
        );
        registry.create(run.clone()).await.unwrap();
        registry
            .transition(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn orphan_is_failed_with_worker_lost() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let registry: Arc<dyn RunRegistry> = Arc::new(JsonlRunRegistry::ephemeral());
        let run = running_run(&registry).await;

        let sweep = ReconciliationSweep::new(Arc::clone(&broker), Arc::clone(&registry));
        assert_eq!(sweep.sweep_once().await.unwrap(), 1);

        let row = registry.get(run.run_id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error.as_deref(), Some(WORKER_LOST));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn live_lock_protects_run() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let registry: Arc<dyn RunRegistry> = Arc::new(JsonlRunRegistry::ephemeral());
        let run = running_run(&registry).await;
        broker
            .set_nx(&run_lock_key(run.run_id), "instance-1", RUN_KEY_TTL)
            .await
            .unwrap();

        let sweep = ReconciliationSweep::new(Arc::clone(&broker), Arc::clone(&registry));
        assert_eq!(sweep.sweep_once().await.unwrap(), 0);

        let row = registry.get(run.run_id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let registry: Arc<dyn RunRegistry> = Arc::new(JsonlRunRegistry::ephemeral());
        running_run(&registry).await;

        let sweep = ReconciliationSweep::new(Arc::clone(&broker), Arc::clone(&registry));
        assert_eq!(sweep.sweep_once().await.unwrap(), 1);
        // The run is terminal now; a second pass touches nothing.
        assert_eq!(sweep.sweep_once().await.unwrap(), 0);
    }
}
