use crate::error::Result;
use crate::model::CoordinationRecord;

/// An exclusive hold on a coordination key, released on drop.
pub trait StoreLock: Send {}

/// Backing store shared by cooperating workers.
///
/// Exactly one writer mutates a key's record at a time; readers only read.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Try to take the key's lock without waiting. `None` when another
    /// worker holds it.
    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn StoreLock>>>;
    async fn read_record(&self, key: &str) -> Result<Option<CoordinationRecord>>;
    /// Replace the key's record atomically: readers see the old or the new
    /// record, never a partial one.
    async fn write_record(&self, key: &str, record: &CoordinationRecord) -> Result<()>;
    /// Forget the key's record. Removing an absent record is not an error.
    async fn remove_record(&self, key: &str) -> Result<()>;
}
