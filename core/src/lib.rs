//! VPN Provision Core Library
//!
//! This crate turns a bare Linux host into a working VPN endpoint for one of
//! three tunnel backends, and publishes the environment contract the profile
//! API consumes.

pub mod backend;
pub mod config;
pub mod contract;
pub mod database;
pub mod error;
pub mod fsutil;
pub mod host;
pub mod lock;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod secrets;
pub mod units;

pub use backend::{BackendProvisioner, Prerequisite, RenderedConfig};
pub use config::{HostLayout, InstallRecord, ProvisionConfig, ReadinessPolicy};
pub use contract::Contract;
pub use error::{Error, ProvisionError, Result};
pub use host::{Host, SystemHost};
pub use model::*;
pub use orchestrator::{Orchestrator, ProvisionReport, StageOutcome};
pub use secrets::{SecretBundle, SecretStore};
