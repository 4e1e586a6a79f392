use crate::error::Result;
use crate::model::{BranchDescriptor, CreateBranch};

/// Branch operations of the remote provider.
///
/// Implementations retry transient failures internally; callers issue one
/// call at a time and await it to completion.
#[async_trait::async_trait]
pub trait BranchProvider: Send + Sync {
    /// Create a branch and wait until it accepts connections
    async fn create(&self, request: &CreateBranch) -> Result<BranchDescriptor>;
    /// Restore `branch_id` to the current state of `target_id`
    async fn reset(&self, branch_id: &str, target_id: &str) -> Result<()>;
    /// Delete a branch. A branch that is already gone counts as deleted.
    async fn delete(&self, branch_id: &str) -> Result<()>;
    async fn describe(&self, branch_id: &str) -> Result<BranchDescriptor>;
}
