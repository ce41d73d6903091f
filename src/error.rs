use thiserror::Error;

use crate::types::{InstanceId, RequestState};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: i64, needed: i64 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("binding `{0}` is not bound to any instance")]
    NotBound(String),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("operation requires an admin actor")]
    NotAdmin,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog lookup failed: {0}")]
    LookupFailed(String),
    #[error("submit to backend failed: {0}")]
    SubmitFailed(String),
    #[error("no backend client registered for instance {0}")]
    NoClient(InstanceId),
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("request `{request_id}` was already decided ({state:?})")]
    AlreadyDecided {
        request_id: String,
        state: RequestState,
    },
    #[error("unknown request `{0}`")]
    UnknownRequest(String),
    #[error("operation requires an admin actor")]
    NotAdmin,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid or already used code")]
    InvalidCode,
    #[error("already registered on this server")]
    AlreadyRegistered,
    #[error("no account registered on this server")]
    NotRegistered,
    #[error("renewal refused: {days_left} days of validity remain")]
    RenewTooEarly { days_left: i64 },
    #[error("insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: i64, needed: i64 },
    #[error("instance {0} is not a library server")]
    NotLibraryServer(InstanceId),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("operation requires an admin actor")]
    NotAdmin,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("webhook token mismatch")]
    InvalidToken,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("instance {instance_id} is not a {expected:?} backend")]
    KindMismatch {
        instance_id: InstanceId,
        expected: crate::types::BackendKind,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
