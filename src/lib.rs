//! A client for running secret-shared computations on a multi-party computation (MPC) cluster
//! where every state-changing request has to be paid for on a ledger first.
//!
//! The crate implements the control plane a client follows to use such a cluster correctly. The
//! MPC protocol itself, the nodes executing it and the ledger settling payments are external
//! collaborators which are abstracted by the [`cluster::Cluster`] and [`payment::Ledger`] traits.
//!
//! ## Main Components
//!
//! * [`identity`]: Deterministic derivation of a [`identity::PartyIdentity`] from a seed.
//! * [`payment`]: The [`payment::PaymentGateway`] which quotes an [`operation::Operation`],
//!   pays for it and hands out a single-use [`payment::PaymentReceipt`].
//! * [`permissions`]: Access-control for stored secrets.
//! * [`binding`]: Which named parties provide inputs to and receive outputs of a computation.
//! * [`client`]: The [`client::ClusterClient`] which consumes receipts to store programs, store
//!   secrets and submit computations.
//! * [`events`]: The stream of [`events::ComputeEvent`]s and the logic to await the result of
//!   a computation.
//! * [`workflow`]: The complete store-then-compute flow as a single call.
//!
//! ## Basic Usage
//!
//! Every paid call follows the same "pay, then act" pattern:
//!
//! 1. Describe the call as an [`operation::Operation`]
//! 2. Obtain a [`payment::PaymentReceipt`] for it with [`client::ClusterClient::pay`]
//! 3. Pass the receipt (by value) to the matching call on the [`client::ClusterClient`]
//!
//! ```ignore
//! let client = ClusterClient::new(&config, cluster, ledger)?;
//!
//! let artifact = ProgramArtifact::read("target/svm_training.nada.bin").await?;
//! let receipt = client.pay(&Operation::store_program(&artifact)).await?;
//! let program = client.store_program("svm_training", &artifact, receipt).await?;
//!
//! let mut bindings = ProgramBindings::new(program.id.clone());
//! bindings.add_input_party("Party1", client.party_id().clone());
//! bindings.add_output_party("Party1", client.party_id().clone());
//!
//! let extra = SecretBundle::new();
//! let receipt = client.pay(&Operation::compute(&bindings, &extra)?).await?;
//! let compute_id = client.compute(&bindings, &store_ids, &extra, receipt).await?;
//! let result = client.await_compute(compute_id, None).await?;
//! ```
//!
//! ## Receipts
//!
//! A [`payment::PaymentReceipt`] is not `Clone` and is consumed by the call it pays for, so the
//! same in-memory receipt can never be presented twice. Receipts can be serialized to keep
//! evidence of a settled payment; a deserialized copy of an already spent receipt is rejected by
//! the client before it reaches the cluster.
//!
//! ## Cancellation
//!
//! There is no cancellation in the protocol. A caller that stops waiting before the
//! [`events::ComputeEvent::Finished`] event has been observed leaves an already paid job on the
//! cluster which may still be running.
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod binding;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod operation;
pub mod payment;
pub mod permissions;
pub mod program;
pub mod values;
pub mod workflow;

pub use client::ClusterClient;
pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Stage};
