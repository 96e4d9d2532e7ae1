//! In-memory collaborators for testing the `mpc-paygate` client.
//!
//! [`InMemoryLedger`] settles payments between funded accounts and [`InMemoryCluster`] checks
//! receipts against it the way a real cluster would, without running any MPC protocol. The
//! results of computations are programmed per program name.

mod cluster;
mod ledger;

pub use cluster::{ClusterError, InMemoryCluster, Prices};
pub use ledger::{InMemoryLedger, LedgerError};

/// The chain id used by [`InMemoryLedger::default`].
pub const TEST_CHAIN_ID: &str = "mpc-paygate-testnet";
