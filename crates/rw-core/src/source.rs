use crate::{FetchError, ResultRow, Run, RunFilter};
use async_trait::async_trait;

/// Server-side view of runs and their rows.
///
/// Implementations perform exactly one network exchange per call and report
/// failures unchanged; callers decide whether to try again.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn get_run(&self, run_id: &str) -> Result<Run, FetchError>;

    async fn get_result_rows(&self, run_id: &str) -> Result<Vec<ResultRow>, FetchError>;

    /// Success only means the server accepted the request. Completion shows up
    /// in later row snapshots.
    async fn trigger_audit(&self, run_id: &str, row_id: &str) -> Result<(), FetchError>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, FetchError>;
}
