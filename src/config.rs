use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{BranchError, Result};
use crate::model::sanitize_name;

/// Default branch auto-expiry (10 minutes)
pub const DEFAULT_BRANCH_EXPIRY_SECS: u64 = 600;
pub const DEFAULT_ENV_VAR: &str = "DATABASE_URL";
pub const DEFAULT_API_BASE_URL: &str = "https://console.neon.tech/api/v2/";
pub const DEFAULT_INI_FILE: &str = "neon.ini";

#[derive(Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    /// Branch to create test branches from; the project default when unset
    pub parent_branch_id: Option<String>,
    pub database: String,
    pub role: String,
    pub keep_branches: bool,
    /// Server-side auto-expiry in seconds, 0 disables
    pub branch_expiry: u64,
    pub env_var: String,
    pub branch_name_prefix: Option<String>,
    pub api_base_url: String,
    /// Shared directory for cooperating workers; solo mode when unset
    pub coordination_dir: Option<PathBuf>,
    /// Run identity, e.g. the CI run id. Gives each run its own
    /// subdirectory of `coordination_dir`.
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub lock_timeout: u64,
    pub migration_timeout: u64,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            project_id: None,
            parent_branch_id: None,
            database: "neondb".to_string(),
            role: "neondb_owner".to_string(),
            keep_branches: false,
            branch_expiry: DEFAULT_BRANCH_EXPIRY_SECS,
            env_var: DEFAULT_ENV_VAR.to_string(),
            branch_name_prefix: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            coordination_dir: None,
            session_id: None,
            worker_id: None,
            lock_timeout: 300,
            migration_timeout: 300,
        }
    }
}

impl fmt::Debug for BranchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("project_id", &self.project_id)
            .field("parent_branch_id", &self.parent_branch_id)
            .field("database", &self.database)
            .field("role", &self.role)
            .field("keep_branches", &self.keep_branches)
            .field("branch_expiry", &self.branch_expiry)
            .field("env_var", &self.env_var)
            .field("branch_name_prefix", &self.branch_name_prefix)
            .field("api_base_url", &self.api_base_url)
            .field("coordination_dir", &self.coordination_dir)
            .field("session_id", &self.session_id)
            .field("worker_id", &self.worker_id)
            .field("lock_timeout", &self.lock_timeout)
            .field("migration_timeout", &self.migration_timeout)
            .finish()
    }
}

/// Explicitly supplied settings (command line or embedding code). These win
/// over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    values: BTreeMap<String, String>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl BranchConfig {
    /// Load configuration from `neon.ini` and `NEON_*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(
            &ConfigOverrides::default(),
            Some(Path::new(DEFAULT_INI_FILE)),
            None,
        )
    }

    /// Layer defaults, the ini file, the environment and explicit overrides,
    /// lowest priority first. `env` replaces the process environment when given.
    pub fn load_from(
        overrides: &ConfigOverrides,
        ini_file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(
            config::Config::try_from(&BranchConfig::default()).map_err(configuration_error)?,
        );

        if let Some(path) = ini_file {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Ini)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("NEON")
                .prefix_separator("_")
                .ignore_empty(true)
                .source(env),
        );

        for (key, value) in &overrides.values {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .map_err(configuration_error)?;
        }

        let settings = builder.build().map_err(configuration_error)?;
        let mut loaded: BranchConfig = settings.try_deserialize().map_err(configuration_error)?;
        loaded.drop_empty();
        Ok(loaded)
    }

    fn drop_empty(&mut self) {
        for field in [
            &mut self.api_key,
            &mut self.project_id,
            &mut self.parent_branch_id,
            &mut self.branch_name_prefix,
            &mut self.session_id,
            &mut self.worker_id,
        ] {
            if field.as_deref().map(str::trim) == Some("") {
                *field = None;
            }
        }
    }

    /// Fail with a message naming every missing required setting.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.api_key.is_none() {
            missing.push("Neon API key (NEON_API_KEY or api_key)");
        }
        if self.project_id.is_none() {
            missing.push("Neon project id (NEON_PROJECT_ID or project_id)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BranchError::Configuration(format!(
                "missing {}",
                missing.join(" and ")
            )))
        }
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| BranchError::Configuration("missing Neon API key (NEON_API_KEY or api_key)".into()))
    }

    pub fn project_id(&self) -> Result<&str> {
        self.project_id
            .as_deref()
            .ok_or_else(|| BranchError::Configuration("missing Neon project id (NEON_PROJECT_ID or project_id)".into()))
    }

    /// Server-side expiry for created branches, `None` when disabled
    pub fn expiry(&self) -> Option<Duration> {
        (self.branch_expiry > 0).then(|| Duration::from_secs(self.branch_expiry))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout)
    }

    /// Directory holding this run's coordination records
    pub fn coordination_path(&self) -> Option<PathBuf> {
        let dir = self.coordination_dir.as_ref()?;
        Some(match self.session_id.as_deref().map(sanitize_name) {
            Some(session) if !session.is_empty() => dir.join(session),
            _ => dir.clone(),
        })
    }

    /// Identity used in coordination records, defaults to the process id
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("pid-{}", std::process::id()))
    }
}

fn configuration_error(err: config::ConfigError) -> BranchError {
    BranchError::Configuration(err.to_string())
}
