#![allow(dead_code)]
use mpc_paygate::{
    ClientConfig, ClusterClient,
    cluster::ClusterId,
    payment::Wallet,
    values::{SecretBundle, Value},
};
use mpc_paygate_test_utils::{InMemoryCluster, InMemoryLedger, TEST_CHAIN_ID};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const PRIVATE_KEY: &str = "9f3c0a1e5b7d2c4e6f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6";

pub type TestClient = ClusterClient<InMemoryCluster, InMemoryLedger>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(seed: &str) -> ClientConfig {
    ClientConfig {
        cluster_id: ClusterId(Uuid::from_u128(0xc1)),
        chain_id: TEST_CHAIN_ID.to_string(),
        grpc_endpoint: "http://localhost:26649".parse().unwrap(),
        private_key: PRIVATE_KEY.to_string(),
        seed: seed.to_string(),
    }
}

/// A client for `seed` whose wallet holds `funds`.
pub fn setup(seed: &str, funds: u64) -> (TestClient, InMemoryCluster, InMemoryLedger) {
    init_tracing();
    let config = config(seed);
    let ledger = InMemoryLedger::default();
    ledger.fund(Wallet::from_hex(PRIVATE_KEY).unwrap().address(), funds);
    let cluster = InMemoryCluster::new(config.cluster_id, ledger.clone());
    let client = ClusterClient::new(&config, cluster.clone(), ledger.clone()).unwrap();
    (client, cluster, ledger)
}

/// Two features of three samples each.
pub fn features() -> SecretBundle {
    SecretBundle::new()
        .with("x0", Value::secret_integers([3, 1, 4]))
        .with("x1", Value::secret_integers([1, 5, 9]))
        .with_ttl_days(5)
}

pub fn labels() -> SecretBundle {
    SecretBundle::new()
        .with("y", Value::secret_integers([0, 1, 1]))
        .with_ttl_days(5)
}
