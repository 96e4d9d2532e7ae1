//! Errors of the client flow.

use std::{fmt, time::Duration};

use crate::{
    binding::BindingError,
    cluster::ComputeId,
    config::ConfigError,
    identity::InvalidSeedError,
    operation::OperationError,
    payment::{PaymentGatewayError, ReceiptMismatchError, TxHash, WalletError},
    permissions::PermissionError,
    program::ProgramError,
    values::ValuesError,
};

/// A type-erased collaborator error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The step of the flow during which an [`Error`] occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Setting up the client and deriving the identity.
    Identity,
    /// Paying for and uploading a program.
    ProgramStore,
    /// Paying for and storing secret values.
    SecretStore,
    /// Paying for and submitting a computation.
    ComputeSubmit,
    /// Waiting for the result of a computation.
    ComputeAwait,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Identity => "identity",
            Stage::ProgramStore => "program-store",
            Stage::SecretStore => "secret-store",
            Stage::ComputeSubmit => "compute-submit",
            Stage::ComputeAwait => "compute-await",
        })
    }
}

/// What went wrong.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The seed is unusable.
    #[error(transparent)]
    InvalidSeed(#[from] InvalidSeedError),
    /// The configuration is incomplete or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The payer key is invalid.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// The cluster did not quote the operation as requested.
    #[error(transparent)]
    Quote(PaymentGatewayError),
    /// The payment transaction did not finalize.
    #[error(transparent)]
    Payment(PaymentGatewayError),
    /// The receipt does not pay for the call it was presented to.
    #[error(transparent)]
    ReceiptMismatch(#[from] ReceiptMismatchError),
    /// The permissions cannot be attached by the caller.
    #[error(transparent)]
    Permission(#[from] PermissionError),
    /// The bindings are incomplete.
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// The values cannot be stored.
    #[error(transparent)]
    Values(#[from] ValuesError),
    /// The program name or id is invalid.
    #[error(transparent)]
    Program(#[from] ProgramError),
    /// The cluster failed or rejected a request.
    #[error("cluster request failed")]
    Upload(#[source] BoxError),
    /// The cluster reported that the computation failed.
    #[error("computation {compute_id} failed: {cause}")]
    ComputeFailure {
        /// The failed computation.
        compute_id: ComputeId,
        /// The cause reported by the cluster.
        cause: String,
    },
    /// No terminal event for the computation arrived in time.
    #[error("computation {compute_id} did not finish within {after:?}")]
    Timeout {
        /// The awaited computation.
        compute_id: ComputeId,
        /// How long was waited.
        after: Duration,
    },
    /// The event stream ended before a terminal event for the computation arrived.
    #[error("event stream closed before computation {compute_id} finished")]
    EventStreamClosed {
        /// The awaited computation.
        compute_id: ComputeId,
    },
}

impl From<PaymentGatewayError> for ErrorKind {
    fn from(err: PaymentGatewayError) -> Self {
        match err {
            PaymentGatewayError::Payment { .. } => ErrorKind::Payment(err),
            PaymentGatewayError::Quote(_) | PaymentGatewayError::QuoteMismatch { .. } => {
                ErrorKind::Quote(err)
            }
        }
    }
}

impl From<OperationError> for ErrorKind {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Values(err) => ErrorKind::Values(err),
            OperationError::Binding(err) => ErrorKind::Binding(err),
        }
    }
}

/// An error which aborted the flow.
///
/// If a payment was already settled for the failed step, [`Error::charged`] returns the hash of
/// the payment transaction.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed")]
pub struct Error {
    stage: Stage,
    #[source]
    kind: ErrorKind,
    charged: Option<TxHash>,
}

impl Error {
    /// Create an error which occurred during `stage`.
    pub fn new(stage: Stage, kind: impl Into<ErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            charged: None,
        }
    }

    pub(crate) fn with_charged(mut self, tx_hash: TxHash) -> Self {
        self.charged = Some(tx_hash);
        self
    }

    /// The step during which the error occurred.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// What went wrong.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Consumes the error, returning what went wrong.
    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// The settled payment of the failed step, if any.
    pub fn charged(&self) -> Option<TxHash> {
        self.charged
    }
}
