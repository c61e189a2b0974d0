use crate::brokerapi::BrokerError;

/// Errors returned by a [`crate::store::Store`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} \"{key}\" already exists")]
    AlreadyExists { kind: String, key: String },
    /// Optimistic concurrency failure, the object was modified since it was read.
    #[error("conflict updating {kind} \"{key}\": {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// Resource store error
    #[error("{0}")]
    Store(#[from] StoreError),
    /// Error returned by the broker client
    #[error("{0}")]
    Broker(#[from] BrokerError),
    /// A referenced object (class, plan, broker, instance, secret) does not exist.
    #[error("{0}")]
    Reference(String),
    /// Invalid or conflicting parameters.
    #[error("{0}")]
    Parameters(String),
    /// Broker credentials missing or malformed.
    #[error("{0}")]
    AuthCredentials(String),
    /// Unusable catalog payload.
    #[error("{0}")]
    Catalog(String),
    /// A class or plan is claimed by another broker or changed its external ID.
    #[error("{0}")]
    Ownership(String),
    /// The referenced instance is still running an asynchronous operation.
    #[error("{0}")]
    AsyncOperationInProgress(String),
    /// The broker reported the asynchronous operation is still running,
    /// the polling queue owns the retry.
    #[error("{0}")]
    OperationInProgress(String),
    /// The broker reported a failed asynchronous operation which has to be retried.
    #[error("{0}")]
    OperationFailed(String),
    /// The broker returned something the protocol does not allow.
    #[error("{0}")]
    Protocol(String),
    /// Credentials could not be written to the binding secret.
    #[error("{0}")]
    Injection(String),
    /// Preconditions for the operation are not met yet.
    #[error("{0}")]
    NotReady(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Errors whose retry is driven by the polling queue rather than by the
    /// worker's rate limited re-add.
    pub fn is_requeued_by_poller(&self) -> bool {
        matches!(self, ControllerError::OperationInProgress(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
