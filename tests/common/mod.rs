#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use neon_test_branches::error::RemoteErrorKind;
use neon_test_branches::logic::fingerprint_of;
use neon_test_branches::{
    BranchDescriptor, BranchError, BranchProvider, ColumnShape, CreateBranch, Fingerprint,
    MigrationRunner, Result, SchemaInspector,
};

pub const ROOT_BRANCH: &str = "br-main";
pub const PROJECT: &str = "proj-test";

#[derive(Debug, Clone, Default)]
pub struct BranchData {
    pub parent: Option<String>,
    pub columns: Vec<ColumnShape>,
    pub rows: Vec<String>,
}

/// In-memory branch provider with copy-on-write branch contents
#[derive(Default)]
pub struct FakeProvider {
    branches: Mutex<HashMap<String, BranchData>>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub resets: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_resets: AtomicBool,
    pub orphan_branches: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        let provider = Self::default();
        provider
            .branches
            .lock()
            .insert(ROOT_BRANCH.to_string(), BranchData::default());
        Arc::new(provider)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn exists(&self, branch_id: &str) -> bool {
        self.branches.lock().contains_key(branch_id)
    }

    pub fn data(&self, branch_id: &str) -> BranchData {
        self.branches.lock().get(branch_id).cloned().unwrap_or_default()
    }

    pub fn insert_row(&self, branch_id: &str, row: &str) {
        if let Some(data) = self.branches.lock().get_mut(branch_id) {
            data.rows.push(row.to_string());
        }
    }

    pub fn add_column(&self, branch_id: &str, table: &str, column: &str) {
        if let Some(data) = self.branches.lock().get_mut(branch_id) {
            let position = data.columns.iter().filter(|c| c.table_name == table).count() as i32 + 1;
            data.columns.push(ColumnShape {
                table_schema: "public".to_string(),
                table_name: table.to_string(),
                column_name: column.to_string(),
                ordinal_position: position,
                data_type: "text".to_string(),
                is_nullable: true,
            });
        }
    }

    fn descriptor(&self, branch_id: &str, data: &BranchData, name: Option<String>) -> BranchDescriptor {
        BranchDescriptor {
            branch_id: branch_id.to_string(),
            project_id: PROJECT.to_string(),
            parent_branch_id: data.parent.clone(),
            connection_uri: format!("postgresql://fake:pw@{}.local/neondb", branch_id),
            host: format!("{}.local", branch_id),
            created_at: Utc::now(),
            name,
            endpoint_id: Some(format!("ep-{}", branch_id)),
            is_creator: false,
        }
    }
}

#[async_trait::async_trait]
impl BranchProvider for FakeProvider {
    async fn create(&self, request: &CreateBranch) -> Result<BranchDescriptor> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("br-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let parent = request.parent_id.clone().unwrap_or_else(|| ROOT_BRANCH.to_string());

        let mut branches = self.branches.lock();
        let mut data = branches.get(&parent).cloned().ok_or_else(|| BranchError::Remote {
            operation: "branch_create".to_string(),
            kind: RemoteErrorKind::NotFound,
            status: Some(404),
            message: format!("no parent {}", parent),
        })?;
        data.parent = if self.orphan_branches.load(Ordering::SeqCst) {
            None
        } else {
            Some(parent)
        };
        branches.insert(id.clone(), data.clone());

        Ok(self
            .descriptor(&id, &data, Some(request.name.clone()))
            .with_creator(true))
    }

    async fn reset(&self, branch_id: &str, target_id: &str) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_resets.load(Ordering::SeqCst) {
            return Err(BranchError::RetriesExhausted {
                operation: "branch_restore".to_string(),
                attempts: 3,
                kind: RemoteErrorKind::ServerError,
                message: "HTTP 503".to_string(),
            });
        }

        let mut branches = self.branches.lock();
        let source = branches.get(target_id).cloned().unwrap_or_default();
        if let Some(data) = branches.get_mut(branch_id) {
            data.columns = source.columns;
            data.rows = source.rows;
        }
        Ok(())
    }

    async fn delete(&self, branch_id: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.branches.lock().remove(branch_id);
        Ok(())
    }

    async fn describe(&self, branch_id: &str) -> Result<BranchDescriptor> {
        let data = self.branches.lock().get(branch_id).cloned().ok_or_else(|| {
            BranchError::Remote {
                operation: "branch_describe".to_string(),
                kind: RemoteErrorKind::NotFound,
                status: Some(404),
                message: format!("no branch {}", branch_id),
            }
        })?;
        Ok(self.descriptor(branch_id, &data, None))
    }
}

/// Fingerprints the fake provider's column lists
pub struct FakeInspector {
    pub provider: Arc<FakeProvider>,
}

#[async_trait::async_trait]
impl SchemaInspector for FakeInspector {
    async fn capture(&self, branch: &BranchDescriptor) -> Fingerprint {
        fingerprint_of(self.provider.data(&branch.branch_id).columns)
    }
}

/// Migration hook that optionally adds a column
pub struct FakeMigration {
    pub provider: Arc<FakeProvider>,
    pub changes_schema: bool,
    pub fails: bool,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeMigration {
    pub fn new(provider: &Arc<FakeProvider>, changes_schema: bool) -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::clone(provider),
            changes_schema,
            fails: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(provider: &Arc<FakeProvider>) -> Arc<Self> {
        Self::failing_after(provider, Duration::ZERO)
    }

    /// Fails only after `delay`, leaving time for followers to join
    pub fn failing_after(provider: &Arc<FakeProvider>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::clone(provider),
            changes_schema: false,
            fails: true,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MigrationRunner for FakeMigration {
    async fn run(&self, branch: &BranchDescriptor) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fails {
            anyhow::bail!("relation \"users\" already exists");
        }
        if self.changes_schema {
            self.provider.add_column(&branch.branch_id, "users", "email");
        }
        Ok(())
    }
}
