//! Result sink trait

use async_trait::async_trait;

use super::run_model::Run;
use crate::Result;

/// Where finished runs are handed off to.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Durably record a run.
    ///
    /// Recording is idempotent on the run id: returns `false` without touching
    /// the stored run if one with the same id exists already.
    async fn record_run(&self, run: &Run) -> Result<bool>;
}
