use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use mpc_paygate::{
    cluster::{
        Cluster, ClusterId, ComputeId, ComputeRequest, StoreId, StoreProgramRequest,
        StoreValuesRequest,
    },
    events::{ComputeEvent, ComputeEvents, ComputeResult},
    identity::UserId,
    operation::Operation,
    payment::{PaymentReceipt, Quote, ReceiptMismatchError, TxHash},
    permissions::Permissions,
    program::{ActionId, ProgramArtifact, ProgramId},
    values::SecretBundle,
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::InMemoryLedger;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),
    #[error("operation cannot be quoted: {0}")]
    Unquotable(String),
    #[error("receipt references unknown quote {0}")]
    UnknownQuote(Uuid),
    #[error("no settled payment for quote {quote_id}")]
    Unpaid { quote_id: Uuid },
    #[error(transparent)]
    Receipt(#[from] ReceiptMismatchError),
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("user {user} may not compute {program_id} on {store_id}")]
    Forbidden {
        user: UserId,
        program_id: ProgramId,
        store_id: StoreId,
    },
    #[error("unknown program {0}")]
    UnknownProgram(ProgramId),
    #[error("unknown store id {0}")]
    UnknownStore(StoreId),
    #[error("cluster is unavailable")]
    Unavailable,
}

/// Prices of the operations, in the smallest token denomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prices {
    pub store_program: u64,
    /// Price per stored value.
    pub store_value: u64,
    pub compute: u64,
}

impl Default for Prices {
    fn default() -> Self {
        Self {
            store_program: 10,
            store_value: 2,
            compute: 25,
        }
    }
}

#[derive(Debug)]
struct Stored {
    values: SecretBundle,
    permissions: Permissions,
}

#[derive(Debug, Default)]
struct ClusterState {
    quotes: HashMap<Uuid, Quote>,
    spent: HashSet<TxHash>,
    programs: HashMap<ProgramId, Vec<u8>>,
    stores: HashMap<StoreId, Stored>,
    computations: HashMap<ComputeId, (UserId, ComputeRequest)>,
    outcomes: HashMap<String, Result<ComputeResult, String>>,
    subscribers: HashMap<UserId, Vec<mpsc::Sender<ComputeEvent>>>,
    manual_completion: bool,
    fail_requests: usize,
}

/// A cluster which stores everything in memory and verifies payments on an
/// [`InMemoryLedger`].
///
/// Computations complete immediately with the outcome programmed for the program's name by
/// [`InMemoryCluster::set_result`] or [`InMemoryCluster::set_failure`], an empty result
/// otherwise. With [`InMemoryCluster::manual_completion`] they stay running until
/// [`InMemoryCluster::complete`] is called.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    cluster_id: ClusterId,
    ledger: InMemoryLedger,
    prices: Prices,
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new(cluster_id: ClusterId, ledger: InMemoryLedger) -> Self {
        Self::with_prices(cluster_id, ledger, Prices::default())
    }

    pub fn with_prices(cluster_id: ClusterId, ledger: InMemoryLedger, prices: Prices) -> Self {
        Self {
            cluster_id,
            ledger,
            prices,
            state: Default::default(),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    /// Computations of the program `name` finish with `result`.
    pub fn set_result(&self, name: impl Into<String>, result: ComputeResult) {
        self.state().outcomes.insert(name.into(), Ok(result));
    }

    /// Computations of the program `name` fail with `cause`.
    pub fn set_failure(&self, name: impl Into<String>, cause: impl Into<String>) {
        self.state().outcomes.insert(name.into(), Err(cause.into()));
    }

    /// Computations stay running until [`InMemoryCluster::complete`] is called.
    pub fn manual_completion(&self) {
        self.state().manual_completion = true;
    }

    /// Fails the next `n` paid requests with [`ClusterError::Unavailable`] before looking at
    /// their receipts.
    pub fn fail_next_requests(&self, n: usize) {
        self.state().fail_requests = n;
    }

    /// Emits the terminal event for `compute_id` with its programmed outcome.
    ///
    /// # Panics
    /// If `compute_id` was not submitted to this cluster.
    pub fn complete(&self, compute_id: ComputeId) {
        let (user, event) = {
            let state = self.state();
            let Some((user, request)) = state.computations.get(&compute_id) else {
                panic!("unknown computation {compute_id}");
            };
            (user.clone(), outcome_event(&state, compute_id, request))
        };
        self.emit(&user, event);
    }

    /// Sends `event` to all subscribers of `user`.
    pub fn inject_event(&self, user: &UserId, event: ComputeEvent) {
        self.emit(user, event);
    }

    /// The stored program `program_id`.
    pub fn program(&self, program_id: &ProgramId) -> Option<Vec<u8>> {
        self.state().programs.get(program_id).cloned()
    }

    /// The values stored under `store_id`.
    pub fn stored_values(&self, store_id: &StoreId) -> Option<SecretBundle> {
        self.state()
            .stores
            .get(store_id)
            .map(|stored| stored.values.clone())
    }

    /// The submitted computation `compute_id`.
    pub fn computation(&self, compute_id: &ComputeId) -> Option<ComputeRequest> {
        self.state()
            .computations
            .get(compute_id)
            .map(|(_, request)| request.clone())
    }

    /// Number of quotes issued so far.
    pub fn quotes_issued(&self) -> usize {
        self.state().quotes.len()
    }

    /// Number of receipts accepted so far.
    pub fn receipts_spent(&self) -> usize {
        self.state().spent.len()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn price(&self, operation: &Operation) -> u64 {
        match operation {
            Operation::StoreProgram { .. } => self.prices.store_program,
            Operation::StoreValues { value_count, .. } => {
                self.prices.store_value * (*value_count as u64).max(1)
            }
            Operation::Compute { .. } => self.prices.compute,
        }
    }

    /// Checks that `receipt` pays for `operation` and spends it.
    fn redeem(
        &self,
        state: &mut ClusterState,
        receipt: &PaymentReceipt,
        operation: &Operation,
    ) -> Result<(), ClusterError> {
        let quote = receipt.quote();
        if state.quotes.get(&quote.id) != Some(quote) {
            return Err(ClusterError::UnknownQuote(quote.id));
        }
        receipt.check(&self.cluster_id, operation, receipt.payer())?;
        let paid = self
            .ledger
            .transaction(&receipt.tx_hash())
            .is_some_and(|tx| tx.resource == quote.id.as_bytes() && tx.amount >= quote.amount);
        if !paid {
            return Err(ClusterError::Unpaid { quote_id: quote.id });
        }
        if !state.spent.insert(receipt.tx_hash()) {
            return Err(ReceiptMismatchError::AlreadySpent {
                tx_hash: receipt.tx_hash(),
            }
            .into());
        }
        Ok(())
    }

    fn check_available(&self, state: &mut ClusterState) -> Result<(), ClusterError> {
        if state.fail_requests > 0 {
            state.fail_requests -= 1;
            return Err(ClusterError::Unavailable);
        }
        Ok(())
    }

    fn emit(&self, user: &UserId, event: ComputeEvent) {
        let state = self.state();
        let subscribers = state.subscribers.get(user).map_or(&[][..], Vec::as_slice);
        debug!(?event, subscribers = subscribers.len(), "emitting event");
        for subscriber in subscribers {
            if let Err(err) = subscriber.try_send(event.clone()) {
                debug!(%err, "dropping event for subscriber");
            }
        }
    }
}

fn outcome_event(
    state: &ClusterState,
    compute_id: ComputeId,
    request: &ComputeRequest,
) -> ComputeEvent {
    match state.outcomes.get(request.bindings.program_id().name()) {
        Some(Err(cause)) => ComputeEvent::Error {
            compute_id,
            cause: cause.clone(),
        },
        Some(Ok(result)) => ComputeEvent::Finished {
            compute_id,
            result: result.clone(),
        },
        None => ComputeEvent::Finished {
            compute_id,
            result: ComputeResult::default(),
        },
    }
}

impl Cluster for InMemoryCluster {
    type Error = ClusterError;

    async fn quote(
        &self,
        cluster_id: &ClusterId,
        operation: &Operation,
    ) -> Result<Quote, Self::Error> {
        if cluster_id != &self.cluster_id {
            return Err(ClusterError::UnknownCluster(*cluster_id));
        }
        if let Operation::StoreValues { value_count: 0, .. } = operation {
            return Err(ClusterError::Unquotable("no values to store".to_string()));
        }
        let quote = Quote {
            id: Uuid::new_v4(),
            cluster_id: self.cluster_id,
            fingerprint: operation.fingerprint(),
            amount: self.price(operation),
        };
        self.state().quotes.insert(quote.id, quote.clone());
        Ok(quote)
    }

    async fn store_program(
        &self,
        cluster_id: &ClusterId,
        request: StoreProgramRequest,
        receipt: PaymentReceipt,
    ) -> Result<ActionId, Self::Error> {
        if cluster_id != &self.cluster_id {
            return Err(ClusterError::UnknownCluster(*cluster_id));
        }
        let program_id = ProgramId::new(request.owner.clone(), request.name)
            .map_err(|err| ClusterError::InvalidRequest(err.to_string()))?;
        let artifact = ProgramArtifact::from_bytes(request.artifact);
        let mut state = self.state();
        self.check_available(&mut state)?;
        if receipt.payer() != &request.owner {
            return Err(ClusterError::InvalidRequest(
                "programs can only be stored by their owner".to_string(),
            ));
        }
        self.redeem(&mut state, &receipt, &Operation::store_program(&artifact))?;
        state.programs.insert(program_id, artifact.bytes().to_vec());
        Ok(ActionId(Uuid::new_v4()))
    }

    async fn store_values(
        &self,
        cluster_id: &ClusterId,
        request: StoreValuesRequest,
        receipt: PaymentReceipt,
    ) -> Result<StoreId, Self::Error> {
        if cluster_id != &self.cluster_id {
            return Err(ClusterError::UnknownCluster(*cluster_id));
        }
        let operation = Operation::store_values(&request.values)
            .map_err(|err| ClusterError::InvalidRequest(err.to_string()))?;
        let mut state = self.state();
        self.check_available(&mut state)?;
        request
            .permissions
            .validate_for(receipt.payer())
            .map_err(|err| ClusterError::InvalidRequest(err.to_string()))?;
        self.redeem(&mut state, &receipt, &operation)?;
        let store_id = StoreId(Uuid::new_v4());
        state.stores.insert(
            store_id,
            Stored {
                values: request.values,
                permissions: request.permissions,
            },
        );
        Ok(store_id)
    }

    async fn compute(
        &self,
        cluster_id: &ClusterId,
        request: ComputeRequest,
        receipt: PaymentReceipt,
    ) -> Result<ComputeId, Self::Error> {
        if cluster_id != &self.cluster_id {
            return Err(ClusterError::UnknownCluster(*cluster_id));
        }
        let operation = Operation::compute(&request.bindings, &request.extra_secrets)
            .map_err(|err| ClusterError::InvalidRequest(err.to_string()))?;
        let user = receipt.payer().clone();
        let compute_id = ComputeId(Uuid::new_v4());
        let terminal = {
            let mut state = self.state();
            self.check_available(&mut state)?;
            let program_id = request.bindings.program_id();
            if !state.programs.contains_key(program_id) {
                return Err(ClusterError::UnknownProgram(program_id.clone()));
            }
            for store_id in &request.store_ids {
                let stored = state
                    .stores
                    .get(store_id)
                    .ok_or(ClusterError::UnknownStore(*store_id))?;
                if !stored.permissions.allows_compute(&user, program_id) {
                    return Err(ClusterError::Forbidden {
                        user,
                        program_id: program_id.clone(),
                        store_id: *store_id,
                    });
                }
            }
            self.redeem(&mut state, &receipt, &operation)?;
            let terminal = (!state.manual_completion)
                .then(|| outcome_event(&state, compute_id, &request));
            state
                .computations
                .insert(compute_id, (user.clone(), request));
            terminal
        };
        self.emit(&user, ComputeEvent::Queued { compute_id });
        self.emit(&user, ComputeEvent::Running { compute_id });
        if let Some(event) = terminal {
            self.emit(&user, event);
        }
        Ok(compute_id)
    }

    async fn subscribe(&self, user_id: &UserId) -> Result<ComputeEvents, Self::Error> {
        let (tx, events) = ComputeEvents::channel(64);
        self.state()
            .subscribers
            .entry(user_id.clone())
            .or_default()
            .push(tx);
        Ok(events)
    }
}
