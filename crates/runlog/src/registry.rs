//! The run registry — persistent record of each run's status, timestamps,
//! error and response snapshot.
//!
//! Transitions are compare-and-swap against the legal lifecycle
//! (`queued → running → terminal`), so a late worker cannot clobber a
//! terminal state written by the reconciliation sweep. The bundled
//! implementation keeps every run in memory and appends each mutation to a
//! JSONL file; on load, the last record per run wins.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use skein_domain::event::Event;
use skein_domain::run::{AgentRun, RunStatus};
use skein_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a status transition request.
#[derive(Debug, Clone)]
pub enum TransitionResult {
    /// The row moved to the requested status.
    Applied(AgentRun),
    /// The row was already in the requested status, or the request was
    /// illegal against a sticky terminal state; the current row is
    /// returned unchanged.
    Unchanged(AgentRun),
}

impl TransitionResult {
    pub fn run(&self) -> &AgentRun {
        match self {
            Self::Applied(run) | Self::Unchanged(run) => run,
        }
    }
}

#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn create(&self, run: AgentRun) -> Result<()>;

    async fn get(&self, run_id: Uuid) -> Result<Option<AgentRun>>;

    /// Move a run along the lifecycle. Writes `completed_at` when the new
    /// status is terminal. Repeating a transition is a no-op; an illegal
    /// transition leaves the row untouched and reports it unchanged.
    async fn transition(
        &self,
        run_id: Uuid,
        new_status: RunStatus,
        error: Option<String>,
    ) -> Result<TransitionResult>;

    /// Store the final event log snapshot on the run row.
    async fn snapshot_responses(&self, run_id: Uuid, events: Vec<Event>) -> Result<()>;

    /// Runs currently marked `running`, for the orphan sweep.
    async fn list_running(&self) -> Result<Vec<AgentRun>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL-backed implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct JsonlRunRegistry {
    runs: RwLock<HashMap<Uuid, AgentRun>>,
    /// Absent for ephemeral (test) registries.
    log_path: Option<PathBuf>,
}

impl JsonlRunRegistry {
    /// Open (or create) a registry persisted under `dir/runs.jsonl`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("runs.jsonl");
        let runs = Self::load(&log_path)?;
        if !runs.is_empty() {
            tracing::info!(count = runs.len(), "run registry loaded");
        }
        Ok(Self {
            runs: RwLock::new(runs),
            log_path: Some(log_path),
        })
    }

    /// A registry with no disk persistence.
    pub fn ephemeral() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            log_path: None,
        }
    }

    fn load(path: &Path) -> Result<HashMap<Uuid, AgentRun>> {
        let mut runs = HashMap::new();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };
        for line in content.lines() {
            match serde_json::from_str::<AgentRun>(line) {
                // Last record per run wins.
                Ok(run) => {
                    runs.insert(run.run_id, run);
                }
                Err(e) => tracing::warn!(error = %e, "skipping undecodable registry row"),
            }
        }
        Ok(runs)
    }

    fn persist(&self, run: &AgentRun) {
        let Some(path) = &self.log_path else { return };
        let Ok(json) = serde_json::to_string(run) else {
            return;
        };
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{json}") {
                    tracing::warn!(error = %e, "registry append failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "registry open failed"),
        }
    }
}

#[async_trait]
impl RunRegistry for JsonlRunRegistry {
    async fn create(&self, run: AgentRun) -> Result<()> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(Error::Validation(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        self.persist(&run);
        runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<AgentRun>> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn transition(
        &self,
        run_id: Uuid,
        new_status: RunStatus,
        error: Option<String>,
    ) -> Result<TransitionResult> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;

        if run.status == new_status {
            return Ok(TransitionResult::Unchanged(run.clone()));
        }
        if !run.status.can_transition_to(new_status) {
            tracing::warn!(
                %run_id,
                current = run.status.as_str(),
                requested = new_status.as_str(),
                "ignoring illegal run transition"
            );
            return Ok(TransitionResult::Unchanged(run.clone()));
        }

        run.status = new_status;
        if let Some(error) = error {
            run.error = Some(error);
        }
        if new_status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        let snapshot = run.clone();
        self.persist(&snapshot);
        Ok(TransitionResult::Applied(snapshot))
    }

    async fn snapshot_responses(&self, run_id: Uuid, events: Vec<Event>) -> Result<()> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        run.responses = events;
        let snapshot = run.clone();
        self.persist(&snapshot);
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<AgentRun>> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_domain::event::StatusValue;

    fn new_run() -> AgentRun {
        AgentRun::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "sonnet",
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let reg = JsonlRunRegistry::ephemeral();
        let run = new_run();
        let run_id = run.run_id;
        reg.create(run).await.unwrap();

        assert!(matches!(
            reg.transition(run_id, RunStatus::Running, None).await.unwrap(),
            TransitionResult::Applied(_)
        ));
        let done = reg
            .transition(run_id, RunStatus::Completed, None)
            .await
            .unwrap();
        let row = done.run();
        assert_eq!(row.status, RunStatus::Completed);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let reg = JsonlRunRegistry::ephemeral();
        let run = new_run();
        let run_id = run.run_id;
        reg.create(run).await.unwrap();
        reg.transition(run_id, RunStatus::Running, None).await.unwrap();
        reg.transition(run_id, RunStatus::Stopped, None).await.unwrap();

        // A late "failed" from a dying worker must not clobber "stopped".
        let result = reg
            .transition(run_id, RunStatus::Failed, Some("late".into()))
            .await
            .unwrap();
        match result {
            TransitionResult::Unchanged(row) => {
                assert_eq!(row.status, RunStatus::Stopped);
                assert!(row.error.is_none());
            }
            TransitionResult::Applied(_) => panic!("terminal state was overwritten"),
        }
    }

    #[tokio::test]
    async fn repeated_stop_is_noop() {
        let reg = JsonlRunRegistry::ephemeral();
        let run = new_run();
        let run_id = run.run_id;
        reg.create(run).await.unwrap();
        reg.transition(run_id, RunStatus::Running, None).await.unwrap();
        reg.transition(run_id, RunStatus::Stopped, None).await.unwrap();

        let second = reg
            .transition(run_id, RunStatus::Stopped, None)
            .await
            .unwrap();
        assert!(matches!(second, TransitionResult::Unchanged(_)));
        assert_eq!(second.run().status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn error_recorded_on_failure() {
        let reg = JsonlRunRegistry::ephemeral();
        let run = new_run();
        let run_id = run.run_id;
        reg.create(run).await.unwrap();
        reg.transition(run_id, RunStatus::Running, None).await.unwrap();
        reg.transition(run_id, RunStatus::Failed, Some("worker lost".into()))
            .await
            .unwrap();
        let row = reg.get(run_id).await.unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("worker lost"));
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let reg = JsonlRunRegistry::ephemeral();
        let run = new_run();
        reg.create(run.clone()).await.unwrap();
        assert!(reg.create(run).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let run = new_run();
        let run_id = run.run_id;
        {
            let reg = JsonlRunRegistry::open(dir.path()).unwrap();
            reg.create(run).await.unwrap();
            reg.transition(run_id, RunStatus::Running, None).await.unwrap();
            reg.snapshot_responses(
                run_id,
                vec![Event::status(None, StatusValue::Completed)],
            )
            .await
            .unwrap();
            reg.transition(run_id, RunStatus::Completed, None)
                .await
                .unwrap();
        }

        let reg = JsonlRunRegistry::open(dir.path()).unwrap();
        let row = reg.get(run_id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Completed);
        assert_eq!(row.responses.len(), 1);
    }

    #[tokio::test]
    async fn list_running_filters() {
        let reg = JsonlRunRegistry::ephemeral();
        let a = new_run();
        let b = new_run();
        let a_id = a.run_id;
        reg.create(a).await.unwrap();
        reg.create(b).await.unwrap();
        reg.transition(a_id, RunStatus::Running, None).await.unwrap();

        let running = reg.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, a_id);
    }
}
