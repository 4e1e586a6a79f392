use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, info, warn};

use crate::client::{BranchProvider, NeonClient};
use crate::config::BranchConfig;
use crate::env_scope::EnvScope;
use crate::error::{BranchError, Result};
use crate::logic::coordination::Coordinator;
use crate::logic::inspect::{default_inspector, SchemaInspector};
use crate::logic::migration::MigrationRunner;
use crate::logic::naming::{branch_name, resolve_prefix, MIGRATED_SUFFIX, TEST_SUFFIX};
use crate::model::{BranchDescriptor, CreateBranch};

pub const MIGRATION_BRANCH_KEY: &str = "migration_branch";
pub const TEST_BRANCH_KEY: &str = "test_branch";
pub const MIGRATIONS_DONE: &str = "migrations_done";

/// Lifecycle of a started session. Acquiring the migration branch happens
/// inside `start`, before a session value exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    MigrationBranchReady,
    TestBranchReady,
    InTest,
    SessionTeardown,
    Finished,
}

/// Whether a test may write to the branch. Read-only tests skip the reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestAccess {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// One test session's view of its branches.
///
/// `start` provisions (or joins) the migration and test branches and points
/// the configured environment variable at the test branch. Between tests the
/// creating process resets the test branch to its parent. `finish` deletes
/// what this process created.
///
/// The migration branch record is the session's rendezvous. Everything else
/// is published under keys scoped to the migration branch id, and the creator
/// retires its records when the session ends.
pub struct BranchSession {
    config: BranchConfig,
    provider: Arc<dyn BranchProvider>,
    coordinator: Coordinator,
    migration_branch: BranchDescriptor,
    test_branch: BranchDescriptor,
    scope: Option<EnvScope>,
    state: SessionState,
}

impl BranchSession {
    /// Start a session against the Neon API described by `config`
    pub async fn from_config(
        config: BranchConfig,
        hook: Option<Arc<dyn MigrationRunner>>,
    ) -> Result<Self> {
        let provider = Arc::new(NeonClient::from_config(&config)?);
        let coordinator = Coordinator::from_config(&config)?;
        Self::start(config, provider, coordinator, default_inspector(), hook).await
    }

    pub async fn start(
        config: BranchConfig,
        provider: Arc<dyn BranchProvider>,
        coordinator: Coordinator,
        inspector: Arc<dyn SchemaInspector>,
        hook: Option<Arc<dyn MigrationRunner>>,
    ) -> Result<Self> {
        let prefix = resolve_prefix(config.branch_name_prefix.as_deref()).await;

        let request = CreateBranch::new(branch_name(prefix.as_deref(), MIGRATED_SUFFIX))
            .parent(config.parent_branch_id.clone())
            .expires_in(config.expiry());
        let attempted = AtomicBool::new(false);
        let coordinated = coordinator
            .coordinate_resource(MIGRATION_BRANCH_KEY, || {
                attempted.store(true, Ordering::SeqCst);
                provider.create(&request)
            })
            .await;
        let (migration_branch, created) = match coordinated {
            Ok(coordinated) => coordinated,
            Err(e) => {
                // Our own create failed: the failure record must not outlive this run
                if attempted.load(Ordering::SeqCst) {
                    if let Err(retire_err) = coordinator.retire(MIGRATION_BRANCH_KEY).await {
                        warn!("Could not retire {}: {}", MIGRATION_BRANCH_KEY, retire_err);
                    }
                }
                return Err(e);
            }
        };
        let migration_branch = migration_branch.with_creator(created);
        info!(
            "Migration branch {} ready ({})",
            migration_branch.branch_id,
            if created { "created" } else { "reused" }
        );

        let mut session = Self {
            test_branch: migration_branch.clone(),
            migration_branch,
            config,
            provider,
            coordinator,
            scope: None,
            state: SessionState::MigrationBranchReady,
        };

        if let Some(hook) = hook {
            let scoped = session.session_coordinator();
            let test_branch = if created {
                match session
                    .migrate(&scoped, inspector.as_ref(), hook.as_ref(), prefix.as_deref())
                    .await
                {
                    Ok(test_branch) => test_branch,
                    Err(e) => {
                        if let Err(signal_err) =
                            scoped.fail_signal(MIGRATIONS_DONE, &e.to_string()).await
                        {
                            warn!("Could not signal migration failure: {}", signal_err);
                        }
                        return Err(session.abort(e).await);
                    }
                }
            } else {
                match session.join_migrated(&scoped).await {
                    Ok(test_branch) => test_branch,
                    Err(e) => return Err(session.abort(e).await),
                }
            };
            session.test_branch = test_branch;
        }

        match EnvScope::activate(&session.config.env_var, &session.test_branch.connection_uri) {
            Ok(scope) => session.scope = Some(scope),
            Err(e) => return Err(session.abort(e).await),
        }
        session.state = SessionState::TestBranchReady;
        info!(
            "Test branch {} ready, {} points at it",
            session.test_branch.branch_id, session.config.env_var
        );
        Ok(session)
    }

    /// Creator path: run the hook once, then decide whether the schema moved
    /// enough to need a separate test branch.
    async fn migrate(
        &self,
        coordinator: &Coordinator,
        inspector: &dyn SchemaInspector,
        hook: &dyn MigrationRunner,
        prefix: Option<&str>,
    ) -> Result<BranchDescriptor> {
        let migration_branch = &self.migration_branch;
        let before = inspector.capture(migration_branch).await;

        hook.run(migration_branch)
            .await
            .map_err(|e| BranchError::Migration {
                branch_id: migration_branch.branch_id.clone(),
                message: format!("{:#}", e),
            })?;

        let after = inspector.capture(migration_branch).await;
        let unchanged = after.unchanged_from(&before);
        if unchanged {
            info!("Migrations left the schema unchanged, testing on the migration branch");
        } else {
            info!("Schema changed (or could not be compared), creating a test branch");
        }

        let request = CreateBranch::new(branch_name(prefix, TEST_SUFFIX))
            .parent(Some(migration_branch.branch_id.clone()))
            .expires_in(self.config.expiry());
        let (test_branch, created) = coordinator
            .coordinate_resource(TEST_BRANCH_KEY, || async {
                if unchanged {
                    Ok(migration_branch.clone())
                } else {
                    self.provider.create(&request).await
                }
            })
            .await?;

        coordinator.send_signal(MIGRATIONS_DONE).await?;
        let is_creator = if test_branch.same_branch(migration_branch) {
            migration_branch.is_creator
        } else {
            created
        };
        Ok(test_branch.with_creator(is_creator))
    }

    /// Follower path: wait for the creator's migrations, then read its test
    /// branch.
    async fn join_migrated(&self, coordinator: &Coordinator) -> Result<BranchDescriptor> {
        coordinator
            .wait_for_signal(MIGRATIONS_DONE, self.config.migration_timeout())
            .await?;

        let test_branch: BranchDescriptor =
            coordinator
                .published(TEST_BRANCH_KEY)
                .await?
                .ok_or_else(|| BranchError::CreatorFailed {
                    key: TEST_BRANCH_KEY.to_string(),
                    message: "migrations finished but no test branch was published".to_string(),
                })?;
        Ok(test_branch.with_creator(false))
    }

    /// Coordinator for keys that belong to this session only
    fn session_coordinator(&self) -> Coordinator {
        self.coordinator.scoped(&self.migration_branch.branch_id)
    }

    pub fn branch(&self) -> &BranchDescriptor {
        &self.test_branch
    }

    pub fn migration_branch(&self) -> &BranchDescriptor {
        &self.migration_branch
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BranchConfig {
        &self.config
    }

    /// Run one test body against the test branch, then restore the branch.
    ///
    /// The body's own outcome is returned untouched inside `Ok`; an `Err`
    /// means the reset failed and only this test should be failed for it.
    /// A panicking body still gets its reset before the panic resumes.
    pub async fn with_test<T, F, Fut>(&mut self, access: TestAccess, body: F) -> Result<T>
    where
        F: FnOnce(BranchDescriptor) -> Fut,
        Fut: Future<Output = T>,
    {
        self.state = SessionState::InTest;
        let branch = self.test_branch.clone();
        let outcome = AssertUnwindSafe(async move { body(branch).await })
            .catch_unwind()
            .await;
        let reset = self.after_test(access).await;

        match outcome {
            Ok(value) => reset.map(|()| value),
            Err(payload) => {
                if let Err(e) = reset {
                    warn!("Reset after failed test did not complete: {}", e);
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Per-test cleanup for hosts that run the body themselves.
    pub async fn after_test(&mut self, access: TestAccess) -> Result<()> {
        self.state = SessionState::TestBranchReady;

        if access == TestAccess::ReadOnly {
            return Ok(());
        }
        if !self.test_branch.is_creator {
            debug!("Not the creator of {}, skipping reset", self.test_branch.branch_id);
            return Ok(());
        }

        let parent = self
            .test_branch
            .parent_branch_id
            .as_deref()
            .ok_or_else(|| BranchError::MissingParent {
                branch_id: self.test_branch.branch_id.clone(),
            })?;
        debug!("Resetting {} to {}", self.test_branch.branch_id, parent);
        self.provider.reset(&self.test_branch.branch_id, parent).await
    }

    /// Restore the environment and delete what this process created.
    /// Failures are logged, never returned.
    pub async fn finish(mut self) {
        self.state = SessionState::SessionTeardown;

        if let Some(mut scope) = self.scope.take() {
            if let Err(e) = scope.deactivate() {
                warn!("{}", e);
            }
        }

        if self.config.keep_branches {
            info!("Keeping branches for inspection");
        } else {
            self.delete_created().await;
        }

        if self.migration_branch.is_creator {
            let scoped = self.session_coordinator();
            for result in [
                scoped.retire(TEST_BRANCH_KEY).await,
                scoped.retire_signal(MIGRATIONS_DONE).await,
                self.coordinator.retire(MIGRATION_BRANCH_KEY).await,
            ] {
                if let Err(e) = result {
                    warn!("Could not retire coordination record: {}", e);
                }
            }
        }
        self.state = SessionState::Finished;
    }

    /// Clean up after a failed `start`. The scoped failure signal stays so
    /// followers already joined to this migration branch fail fast; late
    /// arrivals find no migration record and start over.
    async fn abort(mut self, err: BranchError) -> BranchError {
        self.state = SessionState::SessionTeardown;
        if !self.config.keep_branches {
            self.delete_created().await;
        }
        if self.migration_branch.is_creator {
            if let Err(e) = self.coordinator.retire(MIGRATION_BRANCH_KEY).await {
                warn!("Could not retire {}: {}", MIGRATION_BRANCH_KEY, e);
            }
        }
        self.state = SessionState::Finished;
        err
    }

    async fn delete_created(&self) {
        let mut branches = vec![&self.test_branch];
        if !self.migration_branch.same_branch(&self.test_branch) {
            branches.push(&self.migration_branch);
        }

        for branch in branches.into_iter().filter(|b| b.is_creator) {
            match self.provider.delete(&branch.branch_id).await {
                Ok(()) => info!("Deleted branch {}", branch.branch_id),
                Err(e) => warn!("Failed to delete branch {}: {}", branch.branch_id, e),
            }
        }
    }
}

impl Drop for BranchSession {
    fn drop(&mut self) {
        if self.state != SessionState::Finished {
            warn!(
                "Session dropped without finish(); branch {} is left to expire",
                self.test_branch.branch_id
            );
        }
    }
}
