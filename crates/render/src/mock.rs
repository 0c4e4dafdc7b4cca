//! Mock render engine
//!
//! Programmable mock for testing worker execution:
//! - `MockRenderBehavior`: per-attempt outcomes, progress steps, step delay
//! - cancellation observed between steps
//! - request recording for assertions

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{RenderEngine, RenderError, RenderSpec};

/// What one render attempt should produce
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MockRenderOutcome {
    /// Write the output file and return its path
    #[default]
    Complete,
    /// Fail with a transient error
    FailTransient,
    /// Fail with a permanent error
    FailPermanent,
    /// Spin until cancelled (runaway render)
    Hang,
}

/// Programmable behavior for the mock render engine
#[derive(Debug)]
pub struct MockRenderBehavior {
    /// Consumed per attempt front-to-back; the final entry repeats
    pub outcomes: RwLock<Vec<MockRenderOutcome>>,
    pub progress_steps: RwLock<Vec<i16>>,
    pub step_delay: RwLock<Duration>,
}

impl Default for MockRenderBehavior {
    fn default() -> Self {
        Self {
            outcomes: RwLock::new(vec![MockRenderOutcome::Complete]),
            progress_steps: RwLock::new(vec![25, 50, 75]),
            step_delay: RwLock::new(Duration::from_millis(5)),
        }
    }
}

impl MockRenderBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue per-attempt outcomes
    pub fn set_outcomes(&self, outcomes: Vec<MockRenderOutcome>) {
        *self.outcomes.write().unwrap() = outcomes;
    }

    pub fn set_progress_steps(&self, steps: Vec<i16>) {
        *self.progress_steps.write().unwrap() = steps;
    }

    pub fn set_step_delay(&self, delay: Duration) {
        *self.step_delay.write().unwrap() = delay;
    }

    fn next_outcome(&self) -> MockRenderOutcome {
        let mut outcomes = self.outcomes.write().unwrap();
        if outcomes.is_empty() {
            return MockRenderOutcome::Complete;
        }
        if outcomes.len() == 1 {
            outcomes[0].clone()
        } else {
            outcomes.remove(0)
        }
    }
}

/// A recorded render attempt for test assertions
#[derive(Debug, Clone)]
pub struct RecordedRender {
    pub job_id: uuid::Uuid,
    pub spec: serde_json::Value,
    pub output_path: PathBuf,
}

/// Mock render engine with programmable behavior
pub struct MockRenderEngine {
    behavior: Arc<MockRenderBehavior>,
    history: Arc<Mutex<Vec<RecordedRender>>>,
}

impl Default for MockRenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRenderEngine {
    pub fn new() -> Self {
        Self::with_behavior(Arc::new(MockRenderBehavior::new()))
    }

    pub fn with_behavior(behavior: Arc<MockRenderBehavior>) -> Self {
        Self {
            behavior,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get the shared behavior for external configuration
    pub fn behavior(&self) -> &Arc<MockRenderBehavior> {
        &self.behavior
    }

    /// Get recorded render attempts
    pub fn recorded_renders(&self) -> Vec<RecordedRender> {
        self.history.lock().unwrap().clone()
    }
}

impl RenderEngine for MockRenderEngine {
    fn render(
        &self,
        spec: &RenderSpec,
        progress: &mut dyn FnMut(i16, &str),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RenderError> {
        self.history.lock().unwrap().push(RecordedRender {
            job_id: spec.job_id,
            spec: spec.spec.clone(),
            output_path: spec.output_path.clone(),
        });

        let outcome = self.behavior.next_outcome();
        let steps = self.behavior.progress_steps.read().unwrap().clone();
        let step_delay = *self.behavior.step_delay.read().unwrap();

        tracing::debug!(job_id = %spec.job_id, ?outcome, "mock render attempt");

        for step in steps {
            if cancel.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
            progress(step, "rendering");
            std::thread::sleep(step_delay);
        }

        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        match outcome {
            MockRenderOutcome::Complete => {
                if let Some(parent) = spec.output_path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RenderError::Transient(e.to_string()))?;
                }
                std::fs::write(&spec.output_path, b"mock render output")
                    .map_err(|e| RenderError::Transient(e.to_string()))?;
                Ok(spec.output_path.clone())
            }
            MockRenderOutcome::FailTransient => {
                Err(RenderError::Transient("mock transient failure".to_string()))
            }
            MockRenderOutcome::FailPermanent => {
                Err(RenderError::Invalid("mock permanent failure".to_string()))
            }
            MockRenderOutcome::Hang => {
                // Runaway render: only the cancel token gets us out
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(RenderError::Cancelled)
            }
        }
    }
}
