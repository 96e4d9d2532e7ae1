//! The interface of the MPC cluster as seen by a client.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    binding::ProgramBindings,
    events::ComputeEvents,
    identity::UserId,
    operation::Operation,
    payment::{PaymentReceipt, Quote},
    permissions::Permissions,
    program::ActionId,
    values::SecretBundle,
};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifies the cluster a client talks to.
    ClusterId
);
uuid_id!(
    /// Identifies a set of stored values.
    StoreId
);
uuid_id!(
    /// Identifies a submitted computation.
    ComputeId
);

/// Upload of a compiled program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreProgramRequest {
    /// The user storing the program.
    pub owner: UserId,
    /// The name to store the program under.
    pub name: String,
    /// The compiled program.
    pub artifact: Vec<u8>,
}

/// Storage of secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreValuesRequest {
    /// The values and their retention period.
    pub values: SecretBundle,
    /// Who may access the stored values.
    pub permissions: Permissions,
}

/// Submission of a computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// The program and its input and output parties.
    pub bindings: ProgramBindings,
    /// Stored values used as inputs, in order.
    pub store_ids: Vec<StoreId>,
    /// Values only provided for this computation.
    pub extra_secrets: SecretBundle,
}

/// The MPC cluster.
///
/// All state-changing calls take a [`PaymentReceipt`] by value. Implementations hand it to the
/// cluster which checks it against the settled payment, a receipt is never returned.
///
/// Implementations should emit an error event when returning an error, e.g. by instrumenting
/// them with the `err` annotation:
///
/// ```rust, ignore
/// #[tracing::instrument(skip(self, receipt), err)]
/// async fn compute(
///     &self,
///     cluster_id: &ClusterId,
///     request: ComputeRequest,
///     receipt: PaymentReceipt,
/// ) -> Result<ComputeId, Self::Error> {
///     todo!()
/// }
/// ```
pub trait Cluster: Send + Sync + 'static {
    /// The error raised by the cluster client.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests a price quote for `operation`.
    fn quote(
        &self,
        cluster_id: &ClusterId,
        operation: &Operation,
    ) -> impl Future<Output = Result<Quote, Self::Error>> + Send;

    /// Uploads a program.
    fn store_program(
        &self,
        cluster_id: &ClusterId,
        request: StoreProgramRequest,
        receipt: PaymentReceipt,
    ) -> impl Future<Output = Result<ActionId, Self::Error>> + Send;

    /// Stores secret values.
    fn store_values(
        &self,
        cluster_id: &ClusterId,
        request: StoreValuesRequest,
        receipt: PaymentReceipt,
    ) -> impl Future<Output = Result<StoreId, Self::Error>> + Send;

    /// Enqueues a computation. Returns without waiting for it to finish.
    fn compute(
        &self,
        cluster_id: &ClusterId,
        request: ComputeRequest,
        receipt: PaymentReceipt,
    ) -> impl Future<Output = Result<ComputeId, Self::Error>> + Send;

    /// Subscribes to the events of the computations of `user_id`.
    fn subscribe(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<ComputeEvents, Self::Error>> + Send;
}
