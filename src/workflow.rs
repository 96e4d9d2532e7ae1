//! The complete store-then-compute flow.
//!
//! A [`Workflow`] uploads a program, stores the inputs of one party, runs the program with that
//! party as the only input and output party and waits for the result. Each step is paid for
//! separately:
//!
//! 1. the program upload
//! 2. each input bundle, which are stored concurrently with the program upload
//! 3. the computation

use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ClusterClient,
    binding::ProgramBindings,
    cluster::{Cluster, ComputeId, StoreId},
    error::{Error, Stage},
    events::ComputeResult,
    operation::Operation,
    payment::Ledger,
    permissions::Permissions,
    program::{ProgramArtifact, ProgramId, ProgramRef},
    values::SecretBundle,
};

/// The party name used if none is configured.
pub const DEFAULT_PARTY_NAME: &str = "Party1";

/// Runs a program on freshly stored inputs.
#[derive(Debug, Clone)]
pub struct Workflow {
    program_name: String,
    artifact: ProgramArtifact,
    inputs: Vec<SecretBundle>,
    extra_secrets: SecretBundle,
    party_name: String,
    deadline: Option<Duration>,
}

/// Everything a [`Workflow`] created on the cluster, and the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    /// The stored program.
    pub program: ProgramRef,
    /// The stored inputs, in the order they were added.
    pub store_ids: Vec<StoreId>,
    /// The computation.
    pub compute_id: ComputeId,
    /// Its result.
    pub result: ComputeResult,
}

impl Workflow {
    /// A workflow storing `artifact` as `program_name`.
    pub fn new(program_name: impl Into<String>, artifact: ProgramArtifact) -> Self {
        Self {
            program_name: program_name.into(),
            artifact,
            inputs: vec![],
            extra_secrets: SecretBundle::new(),
            party_name: DEFAULT_PARTY_NAME.to_string(),
            deadline: None,
        }
    }

    /// Adds a bundle of inputs to store before computing.
    pub fn input(mut self, bundle: SecretBundle) -> Self {
        self.inputs.push(bundle);
        self
    }

    /// Secrets only provided to the computation.
    pub fn extra_secrets(mut self, bundle: SecretBundle) -> Self {
        self.extra_secrets = bundle;
        self
    }

    /// The name under which the program knows the client's party.
    pub fn party_name(mut self, name: impl Into<String>) -> Self {
        self.party_name = name.into();
        self
    }

    /// How long to wait for the result.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs the workflow with `client`.
    ///
    /// The program name, every input bundle and the bindings are validated before the first
    /// payment. An error aborts the flow. Steps which completed before are not undone, i.e.
    /// already stored programs and values remain on the cluster.
    pub async fn run<C: Cluster, L: Ledger>(
        &self,
        client: &ClusterClient<C, L>,
    ) -> Result<WorkflowOutput, Error> {
        let program_id = ProgramId::new(client.user_id().clone(), &self.program_name)
            .map_err(|err| Error::new(Stage::ProgramStore, err))?;
        let store_operations = self
            .inputs
            .iter()
            .map(Operation::store_values)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::new(Stage::SecretStore, err))?;
        let mut bindings = ProgramBindings::new(program_id.clone());
        bindings.add_input_party(self.party_name.as_str(), client.party_id().clone());
        bindings.add_output_party(self.party_name.as_str(), client.party_id().clone());
        let compute_operation = Operation::compute(&bindings, &self.extra_secrets)
            .map_err(|err| Error::new(Stage::ComputeSubmit, err))?;
        let mut permissions = Permissions::default_for_user(client.user_id().clone());
        permissions.add_compute_permissions([(client.user_id().clone(), [program_id])]);

        let store_program = async {
            let receipt = client
                .pay(&Operation::store_program(&self.artifact))
                .await?;
            client
                .store_program(&self.program_name, &self.artifact, receipt)
                .await
        };
        let store_inputs = try_join_all(self.inputs.iter().zip(&store_operations).map(
            |(bundle, operation)| {
                let permissions = &permissions;
                async move {
                    let receipt = client.pay(operation).await?;
                    client.store_values(bundle, permissions, receipt).await
                }
            },
        ));
        let (program, store_ids) = futures::try_join!(store_program, store_inputs)?;
        info!(program_id = %program.id, inputs = store_ids.len(), "stored program and inputs");

        let receipt = client.pay(&compute_operation).await?;
        let charged = receipt.tx_hash();
        let compute_id = client
            .compute(&bindings, &store_ids, &self.extra_secrets, receipt)
            .await?;

        let result = client
            .await_compute(compute_id, self.deadline)
            .await
            .map_err(|err| err.with_charged(charged))?;
        info!(%compute_id, "workflow finished");
        Ok(WorkflowOutput {
            program,
            store_ids,
            compute_id,
            result,
        })
    }
}
