//! `flowforge-infra` — the engine runtime.
//!
//! - `persistence`: store boundary (in-memory, Postgres) and conflict classification
//! - `db`: per-context entity cache, entity manager and deferred value fields
//! - `command`: interceptor chain, command context and sessions
//! - `jobs`: job entities, handlers, acquisition and the executor pool
//! - `variables`: JSON variables on top of typed value fields
//! - `engine`: builder, process engine and management service
//! - `config`: engine and executor configuration

pub mod command;
pub mod config;
pub mod db;
pub mod engine;
pub mod jobs;
pub mod persistence;
pub mod services;
pub mod variables;

pub use command::{Command, CommandContext, CommandExecutor, FnCommand};
pub use config::{ConfigError, EngineConfig, JobExecutorConfig};
pub use engine::{ManagementService, ProcessEngine, ProcessEngineBuilder};
pub use jobs::{BackoffPolicy, JobExecutor, JobExecutorHandle, NewJob};
pub use persistence::{InMemoryStore, PostgresStore, Store, StoreError};
pub use services::EngineServices;

#[cfg(test)]
mod integration_tests;
