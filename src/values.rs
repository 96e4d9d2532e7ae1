//! Typed values and the bundles in which a party contributes them.

use std::{
    collections::{BTreeMap, btree_map},
    fmt::{self, Debug},
};

use serde::{Deserialize, Serialize};

use crate::operation::Digest;

/// A typed value as it is stored on or returned by the cluster.
///
/// Secret variants are split into shares by the cluster, public variants are stored as they are.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// A secret signed integer.
    SecretInteger(i64),
    /// A secret unsigned integer.
    SecretUnsignedInteger(u64),
    /// A secret boolean.
    SecretBoolean(bool),
    /// A secret byte string.
    SecretBlob(Vec<u8>),
    /// A public signed integer.
    Integer(i64),
    /// A public unsigned integer.
    UnsignedInteger(u64),
    /// A public boolean.
    Boolean(bool),
    /// An array of values of a single type.
    Array(Vec<Value>),
}

impl Value {
    /// Whether this value (or any element of it) is secret.
    pub fn is_secret(&self) -> bool {
        match self {
            Value::SecretInteger(_)
            | Value::SecretUnsignedInteger(_)
            | Value::SecretBoolean(_)
            | Value::SecretBlob(_) => true,
            Value::Integer(_) | Value::UnsignedInteger(_) | Value::Boolean(_) => false,
            Value::Array(values) => values.iter().any(Value::is_secret),
        }
    }

    /// A name for the type of this value, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::SecretInteger(_) => "SecretInteger",
            Value::SecretUnsignedInteger(_) => "SecretUnsignedInteger",
            Value::SecretBoolean(_) => "SecretBoolean",
            Value::SecretBlob(_) => "SecretBlob",
            Value::Integer(_) => "Integer",
            Value::UnsignedInteger(_) => "UnsignedInteger",
            Value::Boolean(_) => "Boolean",
            Value::Array(_) => "Array",
        }
    }

    /// An array of secret integers.
    pub fn secret_integers(values: impl IntoIterator<Item = i64>) -> Self {
        Value::Array(values.into_iter().map(Value::SecretInteger).collect())
    }

    /// An array of public integers.
    pub fn integers(values: impl IntoIterator<Item = i64>) -> Self {
        Value::Array(values.into_iter().map(Value::Integer).collect())
    }

    fn check_homogeneous(&self) -> bool {
        match self {
            Value::Array(values) => {
                let mut iter = values.iter();
                let Some(first) = iter.next() else {
                    return true;
                };
                first.check_homogeneous()
                    && iter.all(|v| v.type_name() == first.type_name() && v.check_homogeneous())
            }
            _ => true,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // secret inputs must not end up in logs
            Value::SecretInteger(_)
            | Value::SecretUnsignedInteger(_)
            | Value::SecretBoolean(_)
            | Value::SecretBlob(_) => write!(f, "{}(<REDACTED>)", self.type_name()),
            Value::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            Value::UnsignedInteger(v) => f.debug_tuple("UnsignedInteger").field(v).finish(),
            Value::Boolean(v) => f.debug_tuple("Boolean").field(v).finish(),
            Value::Array(values) => f.debug_tuple("Array").field(values).finish(),
        }
    }
}

/// Errors for malformed [`SecretBundle`]s.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ValuesError {
    /// A value has an empty name.
    #[error("value names must not be empty")]
    EmptyName,
    /// There is nothing to store.
    #[error("bundle contains no values")]
    Empty,
    /// The bundle has no TTL, which is required for storing it.
    #[error("bundle has no ttl, stored values need a retention period")]
    MissingTtl,
    /// The TTL is zero days.
    #[error("ttl must be at least one day")]
    ZeroTtl,
    /// An array contains elements of different types.
    #[error("array {name} contains elements of different types")]
    MixedArray {
        /// Name of the offending value.
        name: String,
    },
    /// Arrays in one bundle have different lengths.
    #[error("array {name} has {found} elements but the bundle's arrays have {expected}")]
    ArityMismatch {
        /// Name of the offending value.
        name: String,
        /// Length of the first array in the bundle.
        expected: usize,
        /// Length of the offending array.
        found: usize,
    },
    /// The bundle could not be encoded for hashing.
    #[error("unable to encode values")]
    Encoding(#[source] bincode::Error),
}

/// The named values one party contributes to the cluster.
///
/// Values are kept ordered by name, so two bundles with the same content always have the same
/// [`SecretBundle::digest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBundle {
    values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_days: Option<u32>,
}

impl SecretBundle {
    /// An empty bundle without TTL, e.g. for compute-time secrets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets the retention period of the stored values, builder style.
    pub fn with_ttl_days(mut self, ttl_days: u32) -> Self {
        self.ttl_days = Some(ttl_days);
        self
    }

    /// Adds a value, returning the previous value of that name.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    /// The value named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Number of named values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bundle has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterator over the values ordered by name.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.values.iter()
    }

    /// The retention period in days.
    pub fn ttl_days(&self) -> Option<u32> {
        self.ttl_days
    }

    /// Checks names, array element types and that all arrays share one arity.
    pub fn validate(&self) -> Result<(), ValuesError> {
        let mut arity = None;
        for (name, value) in &self.values {
            if name.is_empty() {
                return Err(ValuesError::EmptyName);
            }
            if !value.check_homogeneous() {
                return Err(ValuesError::MixedArray { name: name.clone() });
            }
            if let Value::Array(elements) = value {
                match arity {
                    None => arity = Some(elements.len()),
                    Some(expected) if expected != elements.len() => {
                        return Err(ValuesError::ArityMismatch {
                            name: name.clone(),
                            expected,
                            found: elements.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Checks that this bundle can be stored and returns its TTL in days.
    pub fn validate_for_store(&self) -> Result<u32, ValuesError> {
        if self.is_empty() {
            return Err(ValuesError::Empty);
        }
        let ttl_days = self.ttl_days.ok_or(ValuesError::MissingTtl)?;
        if ttl_days == 0 {
            return Err(ValuesError::ZeroTtl);
        }
        self.validate()?;
        Ok(ttl_days)
    }

    /// Digest over the values (not the TTL) of this bundle.
    pub fn digest(&self) -> Result<Digest, ValuesError> {
        let mut hasher = blake3::Hasher::new();
        bincode::serialize_into(&mut hasher, &self.values).map_err(ValuesError::Encoding)?;
        Ok(hasher.finalize().into())
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for SecretBundle {
    fn from_iter<T: IntoIterator<Item = (S, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ttl_days: None,
        }
    }
}

impl<'a> IntoIterator for &'a SecretBundle {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
