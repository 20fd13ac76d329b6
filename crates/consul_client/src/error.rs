//! Error types for the Consul client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsulError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Service not found in catalog: {0}")]
    ServiceNotFound(String),
}

pub type Result<T> = std::result::Result<T, ConsulError>;
