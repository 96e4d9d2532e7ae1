//! Compiled programs and how they are addressed once stored.

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{identity::UserId, operation::Digest};

/// Errors for invalid program names and ids.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgramError {
    /// Program names must be non-empty and must not contain `/`.
    #[error("invalid program name {name:?}, names must be non-empty and must not contain '/'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
    /// A program id is not of the form `{user_id}/{name}`.
    #[error("invalid program id {id:?}, expected {{user_id}}/{{name}}")]
    InvalidId {
        /// The rejected id.
        id: String,
    },
}

/// The globally unique id of a stored program, `{owner}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProgramId {
    owner: UserId,
    name: String,
}

impl ProgramId {
    /// The id of program `name` stored by `owner`.
    pub fn new(owner: UserId, name: impl Into<String>) -> Result<Self, ProgramError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(ProgramError::InvalidName { name });
        }
        Ok(Self { owner, name })
    }

    /// The user who stored the program.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// The name the program was stored under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for ProgramId {
    type Err = ProgramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((owner, name)) = s.split_once('/') else {
            return Err(ProgramError::InvalidId { id: s.to_string() });
        };
        if owner.is_empty() {
            return Err(ProgramError::InvalidId { id: s.to_string() });
        }
        Self::new(UserId::from(owner), name)
    }
}

impl TryFrom<String> for ProgramId {
    type Error = ProgramError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProgramId> for String {
    fn from(value: ProgramId) -> Self {
        value.to_string()
    }
}

/// A compiled program ready to be uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct ProgramArtifact {
    bytes: Vec<u8>,
    digest: Digest,
}

impl ProgramArtifact {
    /// Reads a compiled program from disk.
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(bytes))
    }

    /// Wraps an already loaded program.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let digest = Digest::of(&bytes);
        Self { bytes, digest }
    }

    /// The compiled program.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the program in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the program is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Digest of the compiled program.
    pub fn digest(&self) -> Digest {
        self.digest
    }
}

impl fmt::Debug for ProgramArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramArtifact")
            .field("len", &self.bytes.len())
            .field("digest", &self.digest)
            .finish()
    }
}

/// Identifier the cluster returns for an accepted program upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub Uuid);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A stored program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRef {
    /// The id under which the program is addressable by compute requests.
    pub id: ProgramId,
    /// The id of the upload action.
    pub action_id: ActionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_id_round_trips_through_display() {
        let id = ProgramId::new(UserId::from("abcd"), "svm_training").unwrap();
        assert_eq!(id.to_string(), "abcd/svm_training");
        assert_eq!("abcd/svm_training".parse::<ProgramId>().unwrap(), id);
    }

    #[test]
    fn invalid_names_and_ids() {
        assert!(matches!(
            ProgramId::new(UserId::from("abcd"), ""),
            Err(ProgramError::InvalidName { .. })
        ));
        assert!(matches!(
            ProgramId::new(UserId::from("abcd"), "a/b"),
            Err(ProgramError::InvalidName { .. })
        ));
        assert!(matches!(
            "no-slash".parse::<ProgramId>(),
            Err(ProgramError::InvalidId { .. })
        ));
        assert!(matches!(
            "/name".parse::<ProgramId>(),
            Err(ProgramError::InvalidId { .. })
        ));
    }

    #[test]
    fn program_id_serializes_as_string() {
        let id = ProgramId::new(UserId::from("abcd"), "p").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abcd/p\"");
    }

    #[tokio::test]
    async fn reading_a_missing_artifact_fails() {
        assert!(
            ProgramArtifact::read("does/not/exist.nada.bin")
                .await
                .is_err()
        );
    }
}
