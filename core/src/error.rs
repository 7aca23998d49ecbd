//! Error types for the vpn-provision-core crate

use crate::{RunState, Stage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Secret generation failed: {0}")]
    SecretGeneration(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Network side effect failed: {0}")]
    NetworkSideEffect(String),

    #[error("Contract write failed: {0}")]
    ContractWrite(String),

    #[error("Database bootstrap failed: {0}")]
    Database(String),

    #[error("Command execution failed: {cmd} - {message}")]
    Command { cmd: String, message: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn secret(msg: impl Into<String>) -> Self {
        Error::SecretGeneration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::ConfigValidation(msg.into())
    }

    pub fn activation(msg: impl Into<String>) -> Self {
        Error::Activation(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::NetworkSideEffect(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Error::ContractWrite(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Certificate(e.to_string())
    }
}

/// A fatal failure of one orchestrator stage.
///
/// `stage` is the stage the run was trying to reach, so a re-run knows where
/// the previous attempt stopped.
#[derive(Error, Debug)]
#[error("stage {stage} failed: {source}")]
pub struct ProvisionError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl ProvisionError {
    pub fn new(stage: Stage, source: Error) -> Self {
        Self { stage, source }
    }

    pub fn state(&self) -> RunState {
        RunState::Failed(self.stage)
    }
}
