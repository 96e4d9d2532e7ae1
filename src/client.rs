//! The client which pays for and performs operations on a cluster.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::OnceCell;
use tracing::{Level, debug, error, info};

use crate::{
    binding::ProgramBindings,
    cluster::{
        Cluster, ClusterId, ComputeId, ComputeRequest, StoreId, StoreProgramRequest,
        StoreValuesRequest,
    },
    config::ClientConfig,
    error::{Error, ErrorKind, Stage},
    events::{ComputeEvents, ComputeResult, EventRouter, EventRouterHandle},
    identity::{PartyId, PartyIdentity, UserId},
    operation::{Operation, OperationKind},
    payment::{Ledger, PaymentGateway, PaymentReceipt, ReceiptMismatchError, TxHash, Wallet},
    permissions::Permissions,
    program::{ProgramArtifact, ProgramId, ProgramRef},
    values::SecretBundle,
};

/// A client of one cluster, paying from one wallet on behalf of one identity.
///
/// Every state-changing call takes a [`PaymentReceipt`] obtained from [`ClusterClient::pay`] for
/// the matching [`Operation`]. Receipts are checked before anything is sent to the cluster. If
/// the cluster request fails, the receipt may be presented again from a persisted copy. Once
/// the cluster has accepted a request with it, every further copy is rejected.
pub struct ClusterClient<C, L> {
    cluster: C,
    payments: PaymentGateway<L>,
    identity: PartyIdentity,
    cluster_id: ClusterId,
    spent: Mutex<HashSet<TxHash>>,
    router: OnceCell<EventRouterHandle>,
}

impl<C: Cluster, L: Ledger> ClusterClient<C, L> {
    /// Create a client for the cluster and ledger in `config`.
    pub fn new(config: &ClientConfig, cluster: C, ledger: L) -> Result<Self, Error> {
        let identity = PartyIdentity::from_seed(&config.seed)
            .map_err(|err| Error::new(Stage::Identity, err))?;
        let wallet = Wallet::from_hex(&config.private_key)
            .map_err(|err| Error::new(Stage::Identity, err))?;
        info!(
            user_id = %identity.user_id(),
            party_id = %identity.party_id(),
            payer = %wallet.address(),
            cluster_id = %config.cluster_id,
            "created cluster client"
        );
        Ok(Self {
            cluster,
            payments: PaymentGateway::new(ledger, wallet, config.chain_id.clone()),
            identity,
            cluster_id: config.cluster_id,
            spent: Mutex::new(HashSet::new()),
            router: OnceCell::new(),
        })
    }

    /// The identity this client acts as.
    pub fn identity(&self) -> &PartyIdentity {
        &self.identity
    }

    /// The party id of this client's node.
    pub fn party_id(&self) -> &PartyId {
        self.identity.party_id()
    }

    /// The user id of this client.
    pub fn user_id(&self) -> &UserId {
        self.identity.user_id()
    }

    /// The cluster this client talks to.
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    /// The cluster collaborator.
    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// The gateway paying for operations.
    pub fn payments(&self) -> &PaymentGateway<L> {
        &self.payments
    }

    /// Quotes `operation` and pays for it.
    ///
    /// Every successful call settles a payment. See [`PaymentGateway::quote_and_pay`].
    pub async fn pay(&self, operation: &Operation) -> Result<PaymentReceipt, Error> {
        let stage = stage_of(operation.kind());
        let receipt = self
            .payments
            .quote_and_pay(&self.cluster, &self.identity, &self.cluster_id, operation)
            .await
            .map_err(|err| Error::new(stage, err))?;
        info!(
            kind = %receipt.kind(),
            amount = receipt.amount(),
            tx_hash = %receipt.tx_hash(),
            "paid for operation"
        );
        Ok(receipt)
    }

    /// Uploads `artifact` under `name`, paid for by `receipt`.
    ///
    /// The receipt must pay for [`Operation::store_program`] of `artifact`. The program is
    /// addressable as `{user_id}/{name}` afterwards.
    #[tracing::instrument(level = Level::DEBUG, skip(self, artifact, receipt))]
    pub async fn store_program(
        &self,
        name: &str,
        artifact: &ProgramArtifact,
        receipt: PaymentReceipt,
    ) -> Result<ProgramRef, Error> {
        let paid = Paid::new(Stage::ProgramStore, &receipt);
        let id = ProgramId::new(self.user_id().clone(), name).map_err(|err| paid.fail(err))?;
        self.claim(&receipt, &Operation::store_program(artifact))
            .map_err(|err| paid.fail(err))?;
        let request = StoreProgramRequest {
            owner: self.user_id().clone(),
            name: name.to_string(),
            artifact: artifact.bytes().to_vec(),
        };
        let action_id = self
            .submit(
                &paid,
                self.cluster
                    .store_program(&self.cluster_id, request, receipt),
            )
            .await?;
        info!(program_id = %id, %action_id, "stored program");
        Ok(ProgramRef { id, action_id })
    }

    /// Stores `bundle` with `permissions`, paid for by `receipt`.
    ///
    /// The receipt must pay for [`Operation::store_values`] of `bundle`.
    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(values = bundle.len()))]
    pub async fn store_values(
        &self,
        bundle: &SecretBundle,
        permissions: &Permissions,
        receipt: PaymentReceipt,
    ) -> Result<StoreId, Error> {
        let paid = Paid::new(Stage::SecretStore, &receipt);
        permissions
            .validate_for(self.user_id())
            .map_err(|err| paid.fail(err))?;
        let operation = Operation::store_values(bundle).map_err(|err| paid.fail(err))?;
        self.claim(&receipt, &operation)
            .map_err(|err| paid.fail(err))?;
        let request = StoreValuesRequest {
            values: bundle.clone(),
            permissions: permissions.clone(),
        };
        let store_id = self
            .submit(
                &paid,
                self.cluster.store_values(&self.cluster_id, request, receipt),
            )
            .await?;
        info!(%store_id, "stored values");
        Ok(store_id)
    }

    /// Submits the computation described by `bindings`, paid for by `receipt`.
    ///
    /// The receipt must pay for [`Operation::compute`] of `bindings` and `extra_secrets`. This
    /// returns once the computation is enqueued, its result is awaited with
    /// [`ClusterClient::await_compute`].
    #[tracing::instrument(
        level = Level::DEBUG,
        skip_all,
        fields(program_id = %bindings.program_id())
    )]
    pub async fn compute(
        &self,
        bindings: &ProgramBindings,
        store_ids: &[StoreId],
        extra_secrets: &SecretBundle,
        receipt: PaymentReceipt,
    ) -> Result<ComputeId, Error> {
        let paid = Paid::new(Stage::ComputeSubmit, &receipt);
        let operation =
            Operation::compute(bindings, extra_secrets).map_err(|err| paid.fail(err))?;
        self.claim(&receipt, &operation)
            .map_err(|err| paid.fail(err))?;
        // subscribe before submitting so that no event of this computation is missed
        let router = match self.router(Stage::ComputeSubmit).await {
            Ok(router) => router,
            Err(err) => {
                self.release(paid.tx_hash);
                return Err(err.with_charged(paid.tx_hash));
            }
        };
        let request = ComputeRequest {
            bindings: bindings.clone(),
            store_ids: store_ids.to_vec(),
            extra_secrets: extra_secrets.clone(),
        };
        let compute_id = self
            .submit(
                &paid,
                self.cluster.compute(&self.cluster_id, request, receipt),
            )
            .await?;
        router.track(compute_id).await;
        info!(%compute_id, "submitted computation");
        Ok(compute_id)
    }

    /// Waits for the result of `compute_id`.
    ///
    /// Can be called concurrently for different computations submitted by this client.
    pub async fn await_compute(
        &self,
        compute_id: ComputeId,
        deadline: Option<Duration>,
    ) -> Result<ComputeResult, Error> {
        let router = self.router(Stage::ComputeAwait).await?;
        let result = router.wait_for(compute_id, deadline).await?;
        info!(%compute_id, "computation finished");
        Ok(result)
    }

    /// A handle for awaiting computations of this client from other tasks.
    pub async fn event_router(&self) -> Result<EventRouterHandle, Error> {
        self.router(Stage::ComputeAwait).await.cloned()
    }

    /// A new, separate subscription to the events of this client's user.
    ///
    /// Only events emitted after subscribing are delivered.
    pub async fn subscribe(&self) -> Result<ComputeEvents, Error> {
        self.cluster
            .subscribe(self.user_id())
            .await
            .map_err(|err| Error::new(Stage::ComputeAwait, ErrorKind::Upload(Box::new(err))))
    }

    async fn router(&self, stage: Stage) -> Result<&EventRouterHandle, Error> {
        self.router
            .get_or_try_init(|| async {
                let events = self
                    .subscribe()
                    .await
                    .map_err(|err| Error::new(stage, err.into_kind()))?;
                debug!("subscribed to compute events");
                Ok::<_, Error>(EventRouter::spawn(events))
            })
            .await
    }

    /// Checks the receipt and marks it as spent.
    fn claim(&self, receipt: &PaymentReceipt, operation: &Operation) -> Result<(), ErrorKind> {
        receipt.check(&self.cluster_id, operation, self.user_id())?;
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        if !spent.insert(receipt.tx_hash()) {
            return Err(ReceiptMismatchError::AlreadySpent {
                tx_hash: receipt.tx_hash(),
            }
            .into());
        }
        Ok(())
    }

    fn release(&self, tx_hash: TxHash) {
        self.spent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tx_hash);
    }

    async fn submit<T>(
        &self,
        paid: &Paid,
        request: impl Future<Output = Result<T, C::Error>>,
    ) -> Result<T, Error> {
        match request.await {
            Ok(res) => Ok(res),
            Err(err) => {
                error!(
                    stage = %paid.stage,
                    tx_hash = %paid.tx_hash,
                    %err,
                    "cluster request failed after payment"
                );
                self.release(paid.tx_hash);
                Err(paid.fail(ErrorKind::Upload(Box::new(err))))
            }
        }
    }
}

/// The stage and payment of a paid call, attached to its errors.
struct Paid {
    stage: Stage,
    tx_hash: TxHash,
}

impl Paid {
    fn new(stage: Stage, receipt: &PaymentReceipt) -> Self {
        Self {
            stage,
            tx_hash: receipt.tx_hash(),
        }
    }

    fn fail(&self, kind: impl Into<ErrorKind>) -> Error {
        Error::new(self.stage, kind).with_charged(self.tx_hash)
    }
}

fn stage_of(kind: OperationKind) -> Stage {
    match kind {
        OperationKind::StoreProgram => Stage::ProgramStore,
        OperationKind::StoreValues => Stage::SecretStore,
        OperationKind::Compute => Stage::ComputeSubmit,
    }
}
