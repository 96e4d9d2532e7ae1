//! Client configuration.

use std::fmt;

use url::Url;

use crate::{cluster::ClusterId, error::BoxError};

/// Environment variable holding the cluster id.
pub const CLUSTER_ID_VAR: &str = "MPC_CLUSTER_ID";
/// Environment variable holding the chain id of the payment ledger.
pub const CHAIN_ID_VAR: &str = "MPC_CHAIN_ID";
/// Environment variable holding the endpoint of the payment ledger.
pub const CHAIN_GRPC_VAR: &str = "MPC_CHAIN_GRPC";
/// Environment variable holding the hex encoded private key of the paying wallet.
pub const CHAIN_PRIVATE_KEY_VAR: &str = "MPC_CHAIN_PRIVATE_KEY";
/// Environment variable holding the identity seed.
pub const SEED_VAR: &str = "MPC_SEED";

/// Errors for incomplete or malformed configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required value is not set.
    #[error("missing configuration value {key}")]
    Missing {
        /// The missing key.
        key: &'static str,
    },
    /// A value could not be parsed.
    #[error("invalid configuration value {key}")]
    Invalid {
        /// The malformed key.
        key: &'static str,
        /// The parse error.
        source: BoxError,
    },
}

/// Everything a [`ClusterClient`](crate::ClusterClient) needs to talk to a cluster and pay for
/// its operations.
#[derive(Clone)]
pub struct ClientConfig {
    /// The cluster the client talks to.
    pub cluster_id: ClusterId,
    /// The chain id of the payment ledger.
    pub chain_id: String,
    /// The endpoint of the payment ledger.
    pub grpc_endpoint: Url,
    /// Hex encoded private key of the paying wallet.
    pub private_key: String,
    /// Seed the identity of the client is derived from.
    pub seed: String,
}

impl ClientConfig {
    /// Reads the configuration from the process environment.
    ///
    /// See [`ClientConfig::from_lookup`] for the variables that are read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration from `lookup`.
    ///
    /// The keys are [`CLUSTER_ID_VAR`], [`CHAIN_ID_VAR`], [`CHAIN_GRPC_VAR`],
    /// [`CHAIN_PRIVATE_KEY_VAR`] and [`SEED_VAR`]. All of them are required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str| lookup(key).ok_or(ConfigError::Missing { key });
        let cluster_id = get(CLUSTER_ID_VAR)?
            .trim()
            .parse::<ClusterId>()
            .map_err(|err| ConfigError::Invalid {
                key: CLUSTER_ID_VAR,
                source: Box::new(err),
            })?;
        let chain_id = get(CHAIN_ID_VAR)?;
        if chain_id.trim().is_empty() {
            return Err(ConfigError::Missing { key: CHAIN_ID_VAR });
        }
        let grpc_endpoint =
            Url::parse(get(CHAIN_GRPC_VAR)?.trim()).map_err(|err| ConfigError::Invalid {
                key: CHAIN_GRPC_VAR,
                source: Box::new(err),
            })?;
        Ok(Self {
            cluster_id,
            chain_id,
            grpc_endpoint,
            private_key: get(CHAIN_PRIVATE_KEY_VAR)?,
            seed: get(SEED_VAR)?,
        })
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("cluster_id", &self.cluster_id)
            .field("chain_id", &self.chain_id)
            .field("grpc_endpoint", &self.grpc_endpoint.as_str())
            .field("private_key", &"<REDACTED>")
            .field("seed", &"<REDACTED>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env() -> HashMap<&'static str, String> {
        HashMap::from([
            (CLUSTER_ID_VAR, "b13880d3-dde8-4a75-a171-8a1a9d985e6c".to_string()),
            (CHAIN_ID_VAR, "testnet-1".to_string()),
            (CHAIN_GRPC_VAR, "http://localhost:26649".to_string()),
            (CHAIN_PRIVATE_KEY_VAR, "97".repeat(32)),
            (SEED_VAR, "my_seed".to_string()),
        ])
    }

    #[test]
    fn reads_all_values() {
        let env = env();
        let config = ClientConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
        assert_eq!(
            config.cluster_id.to_string(),
            "b13880d3-dde8-4a75-a171-8a1a9d985e6c"
        );
        assert_eq!(config.chain_id, "testnet-1");
        assert_eq!(config.grpc_endpoint.port(), Some(26649));
        assert_eq!(config.seed, "my_seed");
    }

    #[test]
    fn missing_and_invalid_values() {
        let mut env = env();
        env.remove(SEED_VAR);
        assert!(matches!(
            ClientConfig::from_lookup(|key| env.get(key).cloned()),
            Err(ConfigError::Missing { key: SEED_VAR })
        ));

        let mut env = self::env();
        env.insert(CLUSTER_ID_VAR, "not-a-uuid".to_string());
        assert!(matches!(
            ClientConfig::from_lookup(|key| env.get(key).cloned()),
            Err(ConfigError::Invalid {
                key: CLUSTER_ID_VAR,
                ..
            })
        ));
    }

    #[test]
    fn debug_redacts_secrets() {
        let env = env();
        let config = ClientConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("my_seed"));
        assert!(!debug.contains(&"97".repeat(32)));
        assert!(debug.contains("testnet-1"));
    }
}
