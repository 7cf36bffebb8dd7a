use std::io;

use thiserror::Error;

/// Failures talking to upsd.
#[derive(Error, Debug)]
pub enum NutError {
    #[error("connection to upsd failed: {0}")]
    Io(#[from] io::Error),
    /// upsd answered with `ERR <code>`.
    #[error("upsd refused {request}: {code}")]
    Refused { request: String, code: String },
    #[error("malformed reply to {request}: {line:?}")]
    Malformed { request: String, line: String },
    #[error("connection closed by upsd")]
    Closed,
    #[error("session is {0}, not ready")]
    NotReady(&'static str),
}

impl NutError {
    /// Whether the connection itself is gone, as opposed to one refused request.
    pub fn is_transport(&self) -> bool {
        matches!(self, NutError::Io(_) | NutError::Closed)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no object {0}")]
    NoObject(String),
    #[error("{id} is read-only")]
    ReadOnly { id: String },
    #[error("invalid state id {0:?}")]
    InvalidId(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configured port invalid: {0}")]
    InvalidPort(String),
    #[error("failed to read config: {0}")]
    Figment(#[from] figment::Error),
    #[error("invalid control address {addr:?}: {reason}")]
    ControlAddress { addr: String, reason: String },
}

#[derive(Error, Debug)]
pub enum MailerError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("email: {0}")]
    Email(#[from] lettre::error::Error),
    #[error("host name: {0}")]
    Hostname(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("mailer: {0}")]
    Mailer(#[from] MailerError),
    #[error("control listener: {0}")]
    Control(io::Error),
}

impl AdapterError {
    /// Process exit code for errors that terminate the bridge.
    pub fn exit_code(&self) -> i32 {
        match self {
            AdapterError::Config(_) => EXIT_INVALID_CONFIG,
            _ => 1,
        }
    }
}

/// Exit code used when the configuration cannot be used at all.
pub const EXIT_INVALID_CONFIG: i32 = 11;
