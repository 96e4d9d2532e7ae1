//! Descriptors of the billable operations of a cluster.
//!
//! An [`Operation`] is created right before a paid call. It is quoted and paid for by the
//! [`PaymentGateway`](crate::payment::PaymentGateway) and its [`Fingerprint`] is embedded in the
//! resulting receipt, which is how a receipt is tied to exactly one call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    binding::{BindingError, ProgramBindings},
    program::{ProgramArtifact, ProgramId},
    values::{SecretBundle, ValuesError},
};

/// A blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hashes `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// The kind of a billable [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Upload of a compiled program.
    StoreProgram,
    /// Storage of secret values.
    StoreValues,
    /// Execution of a program.
    Compute,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::StoreProgram => f.write_str("store-program"),
            OperationKind::StoreValues => f.write_str("store-values"),
            OperationKind::Compute => f.write_str("compute"),
        }
    }
}

/// A billable network action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Store the program whose artifact has the given digest.
    StoreProgram {
        /// Digest of the compiled program.
        artifact_digest: Digest,
        /// Size of the compiled program in bytes.
        artifact_len: u64,
    },
    /// Store a [`SecretBundle`] for `ttl_days`.
    StoreValues {
        /// Digest of the bundle.
        values_digest: Digest,
        /// Number of named values in the bundle.
        value_count: usize,
        /// Retention of the stored values.
        ttl_days: u32,
    },
    /// Run `program_id` with the given compute-time secrets.
    Compute {
        /// The program to run.
        program_id: ProgramId,
        /// Digest of the secrets provided at compute time.
        values_digest: Digest,
        /// Number of secrets provided at compute time.
        value_count: usize,
    },
}

/// Errors when describing an [`Operation`].
///
/// These are raised before anything is quoted or paid for.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The secret values are malformed.
    #[error(transparent)]
    Values(#[from] ValuesError),
    /// The compute bindings are malformed.
    #[error(transparent)]
    Binding(#[from] BindingError),
}

impl Operation {
    /// The operation for storing `artifact`.
    pub fn store_program(artifact: &ProgramArtifact) -> Self {
        Operation::StoreProgram {
            artifact_digest: artifact.digest(),
            artifact_len: artifact.len() as u64,
        }
    }

    /// The operation for storing `bundle`.
    ///
    /// The bundle must be non-empty, consistent and carry a TTL.
    pub fn store_values(bundle: &SecretBundle) -> Result<Self, OperationError> {
        let ttl_days = bundle.validate_for_store()?;
        Ok(Operation::StoreValues {
            values_digest: bundle.digest()?,
            value_count: bundle.len(),
            ttl_days,
        })
    }

    /// The operation for running the program of `bindings` with `extra_secrets`.
    ///
    /// The bindings are validated here, so an invalid binding can never be paid for.
    pub fn compute(
        bindings: &ProgramBindings,
        extra_secrets: &SecretBundle,
    ) -> Result<Self, OperationError> {
        bindings.validate()?;
        extra_secrets.validate()?;
        Ok(Operation::Compute {
            program_id: bindings.program_id().clone(),
            values_digest: extra_secrets.digest()?,
            value_count: extra_secrets.len(),
        })
    }

    /// The kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::StoreProgram { .. } => OperationKind::StoreProgram,
            Operation::StoreValues { .. } => OperationKind::StoreValues,
            Operation::Compute { .. } => OperationKind::Compute,
        }
    }

    /// The fingerprint identifying this exact operation.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind().to_string().as_bytes());
        match self {
            Operation::StoreProgram {
                artifact_digest,
                artifact_len,
            } => {
                hasher.update(artifact_digest.as_bytes());
                hasher.update(&artifact_len.to_le_bytes());
            }
            Operation::StoreValues {
                values_digest,
                value_count,
                ttl_days,
            } => {
                hasher.update(values_digest.as_bytes());
                hasher.update(&(*value_count as u64).to_le_bytes());
                hasher.update(&ttl_days.to_le_bytes());
            }
            Operation::Compute {
                program_id,
                values_digest,
                value_count,
            } => {
                let program_id = program_id.to_string();
                hasher.update(&(program_id.len() as u64).to_le_bytes());
                hasher.update(program_id.as_bytes());
                hasher.update(values_digest.as_bytes());
                hasher.update(&(*value_count as u64).to_le_bytes());
            }
        }
        Fingerprint {
            kind: self.kind(),
            digest: hasher.finalize().into(),
        }
    }
}

/// Identifies one [`Operation`] instance, embedded in quotes and receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// The kind of the operation.
    pub kind: OperationKind,
    /// Digest over the complete operation.
    pub digest: Digest,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        identity::{PartyId, UserId},
        values::Value,
    };

    use super::*;

    fn program_id() -> ProgramId {
        ProgramId::new(UserId::from("0011"), "svm_training").unwrap()
    }

    #[test]
    fn fingerprints_differ_per_kind_and_payload() {
        let artifact = ProgramArtifact::from_bytes(b"program".to_vec());
        let other_artifact = ProgramArtifact::from_bytes(b"other program".to_vec());
        let bundle = SecretBundle::new()
            .with("a", Value::SecretInteger(1))
            .with_ttl_days(5);

        let store_program = Operation::store_program(&artifact).fingerprint();
        assert_eq!(store_program, Operation::store_program(&artifact).fingerprint());
        assert_ne!(
            store_program,
            Operation::store_program(&other_artifact).fingerprint()
        );

        let store_values = Operation::store_values(&bundle).unwrap().fingerprint();
        assert_eq!(store_values.kind, OperationKind::StoreValues);
        let longer = bundle.clone().with_ttl_days(6);
        assert_ne!(
            store_values,
            Operation::store_values(&longer).unwrap().fingerprint()
        );
    }

    #[test]
    fn store_values_requires_ttl() {
        let bundle = SecretBundle::new().with("a", Value::SecretInteger(1));
        assert!(matches!(
            Operation::store_values(&bundle),
            Err(OperationError::Values(ValuesError::MissingTtl))
        ));
    }

    #[test]
    fn compute_validates_bindings() {
        let mut bindings = ProgramBindings::new(program_id());
        bindings.add_input_party("Party1", PartyId::from("p1"));
        let err = Operation::compute(&bindings, &SecretBundle::new()).unwrap_err();
        assert!(matches!(
            err,
            OperationError::Binding(BindingError::NoOutputParty)
        ));

        bindings.add_output_party("Party1", PartyId::from("p1"));
        let op = Operation::compute(&bindings, &SecretBundle::new()).unwrap();
        assert_eq!(op.kind(), OperationKind::Compute);
    }

    #[test]
    fn kinds_display_in_kebab_case() {
        assert_eq!(OperationKind::StoreProgram.to_string(), "store-program");
        assert_eq!(OperationKind::StoreValues.to_string(), "store-values");
        assert_eq!(OperationKind::Compute.to_string(), "compute");
    }
}
