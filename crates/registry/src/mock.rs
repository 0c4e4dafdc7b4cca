//! Mock model fetcher
//!
//! Programmable mock for testing worker model resolution:
//! - scripted outcome per model reference (default: succeed)
//! - successful fetches materialize a small placeholder file
//! - call recording for assertions

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::{cache_path, FetchError, ModelFetcher};

/// What a fetch of a given model reference should produce
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MockFetchOutcome {
    #[default]
    Succeed,
    NotFound,
    Forbidden,
    /// Transient network failure
    Unreachable,
}

/// A recorded fetch for test assertions
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFetch {
    pub owner_id: Uuid,
    pub model_ref: String,
    pub bearer: String,
}

pub struct MockModelFetcher {
    cache_root: PathBuf,
    outcomes: Mutex<HashMap<String, MockFetchOutcome>>,
    history: Mutex<Vec<RecordedFetch>>,
}

impl MockModelFetcher {
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            outcomes: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Configure the outcome for one model reference
    pub fn set_outcome(&self, model_ref: &str, outcome: MockFetchOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(model_ref.to_string(), outcome);
    }

    /// Get recorded fetch calls
    pub fn recorded_fetches(&self) -> Vec<RecordedFetch> {
        self.history.lock().unwrap().clone()
    }

    /// Clear history
    pub fn reset_history(&self) {
        self.history.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl ModelFetcher for MockModelFetcher {
    async fn ensure_local(
        &self,
        owner_id: Uuid,
        model_ref: &str,
        bearer: &str,
    ) -> Result<PathBuf, FetchError> {
        self.history.lock().unwrap().push(RecordedFetch {
            owner_id,
            model_ref: model_ref.to_string(),
            bearer: bearer.to_string(),
        });

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(model_ref)
            .cloned()
            .unwrap_or_default();

        match outcome {
            MockFetchOutcome::Succeed => {
                let dest = cache_path(&self.cache_root, owner_id, model_ref);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| FetchError::Io(e.to_string()))?;
                }
                tokio::fs::write(&dest, format!("mock model {}", model_ref))
                    .await
                    .map_err(|e| FetchError::Io(e.to_string()))?;
                Ok(dest)
            }
            MockFetchOutcome::NotFound => Err(FetchError::NotFound(model_ref.to_string())),
            MockFetchOutcome::Forbidden => Err(FetchError::Forbidden(model_ref.to_string())),
            MockFetchOutcome::Unreachable => {
                Err(FetchError::Request("mock registry unreachable".to_string()))
            }
        }
    }
}
