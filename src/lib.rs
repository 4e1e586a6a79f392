pub mod client;
pub mod config;
pub mod connect;
pub mod env_scope;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use client::{BranchProvider, NeonClient, RetryPolicy};
pub use config::{BranchConfig, ConfigOverrides};
pub use connect::connect_pool;
pub use env_scope::EnvScope;
pub use error::{BranchError, RemoteErrorKind, Result};
pub use logic::{
    BranchSession, CommandMigration, Coordinator, MigrationRunner, SchemaInspector, SessionState,
    TestAccess,
};
pub use model::*;
pub use store::{CoordinationStore, FileStore, MemoryStore};
