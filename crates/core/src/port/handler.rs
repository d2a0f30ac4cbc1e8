// Job Handler Port (business logic lives behind this contract)

use crate::domain::{JobId, JobPayload, Outcome};
use async_trait::async_trait;

/// Handler for one job type
///
/// Handlers must be idempotent: delivery is at-least-once, and a job whose
/// worker crashed mid-run is executed again after its lock goes stale.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job_id: JobId, payload: &JobPayload) -> Outcome;
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// What a scripted handler does on one call
    #[derive(Debug, Clone)]
    pub enum Step {
        Return(Outcome),
        Sleep(Duration, Outcome),
        Panic(String),
    }

    /// Plays back a fixed script; the last step repeats forever
    pub struct ScriptedHandler {
        steps: Mutex<Vec<Step>>,
        calls: Mutex<Vec<JobId>>,
    }

    impl ScriptedHandler {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(outcome: Outcome) -> Self {
            Self::new(vec![Step::Return(outcome)])
        }

        pub fn succeeding() -> Self {
            Self::always(Outcome::Success)
        }

        pub fn calls(&self) -> Vec<JobId> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().map(|c| c.len()).unwrap_or_default()
        }

        fn next_step(&self) -> Step {
            let mut steps = match self.steps.lock() {
                Ok(steps) => steps,
                Err(poisoned) => poisoned.into_inner(),
            };
            if steps.len() > 1 {
                steps.remove(0)
            } else {
                steps
                    .first()
                    .cloned()
                    .unwrap_or(Step::Return(Outcome::Success))
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn execute(&self, job_id: JobId, _payload: &JobPayload) -> Outcome {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(job_id);
            }
            match self.next_step() {
                Step::Return(outcome) => outcome,
                Step::Sleep(duration, outcome) => {
                    tokio::time::sleep(duration).await;
                    outcome
                }
                Step::Panic(message) => panic!("{}", message),
            }
        }
    }
}
