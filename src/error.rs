use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("protocol {0} is not registered")]
    NotFound(String),
    #[error("protocol {0} is registered more than once")]
    Duplicate(String),
    #[error("entry uri {uri} does not match definition protocol {protocol}")]
    UriMismatch { uri: String, protocol: String },
}

/// Failures of a reconciliation run.
///
/// Only the two local variants are ever returned from a run; replication
/// failures are collected in the report and logged.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("querying installed protocols failed")]
    LocalQueryFailed(#[source] anyhow::Error),
    #[error("configuring protocol {protocol} failed")]
    LocalConfigureFailed {
        protocol: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("replicating protocol {protocol} to {target} failed")]
    ReplicationFailed {
        protocol: String,
        target: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    #[error("PIN request was cancelled")]
    Cancelled,
    #[error("a PIN request is already pending")]
    AlreadyPending,
    #[error("no PIN was submitted in time")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("input does not contain a DID or a wallet URL")]
    InvalidInput,
    #[error("wallet {0} is not one of the discovered wallets")]
    UnknownWallet(String),
    #[error("no pairing session is active")]
    NoActiveSession,
    #[error("no PIN is being requested")]
    NoPendingPin,
    #[error("PIN must not be empty")]
    EmptyPin,
    #[error("popup window could not be opened")]
    PopupBlocked(#[source] anyhow::Error),
    #[error("creating a new DID failed")]
    IdentityCreationFailed(#[source] anyhow::Error),
    #[error("pairing with the wallet failed")]
    PairingFailed(#[source] anyhow::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid TOML")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
