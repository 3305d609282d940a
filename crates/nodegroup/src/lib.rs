/// Cluster and nodegroup configuration model
pub mod api;

/// Cluster API stack backend
pub mod backend;

/// Live control plane access: version, registration, readiness
pub mod cluster;

/// Advisory compatibility checks against the live cluster
pub mod compat;

/// Machine image catalog
pub mod images;

/// SSH key material
pub mod keys;

/// Configuration document loading
pub mod loader;

/// Per instance type pod density
pub mod maxpods;

/// Nodegroup provisioning pipeline
pub mod provision;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed or contradictory configuration
    #[error("{0}")]
    Validation(String),
    /// Control plane or backend unreachable
    #[error("{0}")]
    Connectivity(String),
    #[error("resolving nodegroup {unit:?}: {message}")]
    Resolution { unit: String, message: String },
    #[error("creating nodegroup {unit:?}: {message}")]
    Provisioning { unit: String, message: String },
    #[error("registering nodegroup {unit:?}: {message}")]
    Registration { unit: String, message: String },
    #[error("timed out after {waited:?} waiting for nodes of nodegroup {unit:?} to become ready")]
    Timeout { unit: String, waited: Duration },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn resolution(unit: impl Into<String>, msg: impl ToString) -> Self {
        Self::Resolution {
            unit: unit.into(),
            message: msg.to_string(),
        }
    }

    pub fn provisioning(unit: impl Into<String>, msg: impl ToString) -> Self {
        Self::Provisioning {
            unit: unit.into(),
            message: msg.to_string(),
        }
    }

    pub fn registration(unit: impl Into<String>, msg: impl ToString) -> Self {
        Self::Registration {
            unit: unit.into(),
            message: msg.to_string(),
        }
    }

    /// Name of the nodegroup this error is attributed to, if any
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::Resolution { unit, .. }
            | Self::Provisioning { unit, .. }
            | Self::Registration { unit, .. }
            | Self::Timeout { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
