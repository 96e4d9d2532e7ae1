//! Access-control for stored secrets.
//!
//! [`Permissions`] are built client-side and attached to secrets when they are stored. Grants are
//! additive only, revoking access is an administrative operation on the cluster.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{identity::UserId, program::ProgramId};

/// Errors for permissions which cannot be attached by the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PermissionError {
    /// The permissions belong to another user.
    #[error("permissions are owned by {owner}, but the caller is {caller}")]
    OwnerMismatch {
        /// Owner recorded in the permissions.
        owner: UserId,
        /// User attempting to store the values.
        caller: UserId,
    },
    /// The owner lacks one of its retrieve, update or delete grants.
    #[error("owner {owner} must keep its {right} grant")]
    MissingOwnerGrant {
        /// Owner recorded in the permissions.
        owner: UserId,
        /// The missing right.
        right: &'static str,
    },
    /// A compute grant references a program the caller does not own.
    #[error("compute grant for {user} references program {program_id} not owned by {caller}")]
    ForeignProgram {
        /// Grantee of the offending grant.
        user: UserId,
        /// The program not owned by the caller.
        program_id: ProgramId,
        /// User attempting to store the values.
        caller: UserId,
    },
}

/// Access grants over stored secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    owner: UserId,
    retrieve: BTreeSet<UserId>,
    update: BTreeSet<UserId>,
    delete: BTreeSet<UserId>,
    compute: BTreeMap<UserId, BTreeSet<ProgramId>>,
}

impl Permissions {
    /// Permissions where only `owner` may retrieve, update and delete the values.
    pub fn default_for_user(owner: UserId) -> Self {
        let only_owner = BTreeSet::from([owner.clone()]);
        Self {
            owner,
            retrieve: only_owner.clone(),
            update: only_owner.clone(),
            delete: only_owner,
            compute: BTreeMap::new(),
        }
    }

    /// Default owner permissions plus the given compute grants.
    pub fn build<G, P>(owner: UserId, grants: G) -> Self
    where
        G: IntoIterator<Item = (UserId, P)>,
        P: IntoIterator<Item = ProgramId>,
    {
        let mut permissions = Self::default_for_user(owner);
        permissions.add_compute_permissions(grants);
        permissions
    }

    /// Allows each user to run the listed programs on the values.
    pub fn add_compute_permissions<G, P>(&mut self, grants: G)
    where
        G: IntoIterator<Item = (UserId, P)>,
        P: IntoIterator<Item = ProgramId>,
    {
        for (user, programs) in grants {
            self.compute.entry(user).or_default().extend(programs);
        }
    }

    /// Allows `user` to retrieve the values.
    pub fn add_retrieve_permissions(&mut self, users: impl IntoIterator<Item = UserId>) {
        self.retrieve.extend(users);
    }

    /// The owner of the values.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Whether `user` may retrieve the values.
    pub fn allows_retrieve(&self, user: &UserId) -> bool {
        self.retrieve.contains(user)
    }

    /// Whether `user` may update the values.
    pub fn allows_update(&self, user: &UserId) -> bool {
        self.update.contains(user)
    }

    /// Whether `user` may delete the values.
    pub fn allows_delete(&self, user: &UserId) -> bool {
        self.delete.contains(user)
    }

    /// Whether `user` may use the values as input to `program`.
    pub fn allows_compute(&self, user: &UserId, program: &ProgramId) -> bool {
        self.compute
            .get(user)
            .is_some_and(|programs| programs.contains(program))
    }

    /// The compute grants, ordered by user.
    pub fn compute_grants(&self) -> impl Iterator<Item = (&UserId, &BTreeSet<ProgramId>)> {
        self.compute.iter()
    }

    /// Checks that `caller` may attach these permissions to values it stores.
    ///
    /// Permissions built with this type always pass the owner checks, deserialized ones may
    /// not.
    pub fn validate_for(&self, caller: &UserId) -> Result<(), PermissionError> {
        if &self.owner != caller {
            return Err(PermissionError::OwnerMismatch {
                owner: self.owner.clone(),
                caller: caller.clone(),
            });
        }
        let owner_grants = [
            ("retrieve", &self.retrieve),
            ("update", &self.update),
            ("delete", &self.delete),
        ];
        for (right, users) in owner_grants {
            if !users.contains(&self.owner) {
                return Err(PermissionError::MissingOwnerGrant {
                    owner: self.owner.clone(),
                    right,
                });
            }
        }
        for (user, programs) in &self.compute {
            if let Some(program_id) = programs.iter().find(|p| p.owner() != caller) {
                return Err(PermissionError::ForeignProgram {
                    user: user.clone(),
                    program_id: program_id.clone(),
                    caller: caller.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> UserId {
        UserId::from("owner")
    }

    fn program(owner: &str, name: &str) -> ProgramId {
        ProgramId::new(UserId::from(owner), name).unwrap()
    }

    #[test]
    fn empty_grants_still_authorize_owner() {
        let permissions = Permissions::build(owner(), Vec::<(UserId, Vec<ProgramId>)>::new());
        assert!(permissions.allows_retrieve(&owner()));
        assert!(permissions.allows_update(&owner()));
        assert!(permissions.allows_delete(&owner()));
        assert!(!permissions.allows_retrieve(&UserId::from("other")));
        assert!(permissions.validate_for(&owner()).is_ok());
    }

    #[test]
    fn compute_grants_are_additive() {
        let mut permissions = Permissions::default_for_user(owner());
        let p1 = program("owner", "p1");
        let p2 = program("owner", "p2");
        permissions.add_compute_permissions([(owner(), [p1.clone()])]);
        permissions.add_compute_permissions([(owner(), [p2.clone()])]);
        assert!(permissions.allows_compute(&owner(), &p1));
        assert!(permissions.allows_compute(&owner(), &p2));
        assert!(!permissions.allows_compute(&UserId::from("other"), &p1));
    }

    #[test]
    fn validation_rejects_other_owner() {
        let permissions = Permissions::default_for_user(owner());
        assert_eq!(
            permissions.validate_for(&UserId::from("mallory")),
            Err(PermissionError::OwnerMismatch {
                owner: owner(),
                caller: UserId::from("mallory"),
            })
        );
    }

    #[test]
    fn validation_rejects_foreign_programs() {
        let foreign = program("someone-else", "p");
        let permissions = Permissions::build(owner(), [(owner(), [foreign.clone()])]);
        assert!(matches!(
            permissions.validate_for(&owner()),
            Err(PermissionError::ForeignProgram { program_id, .. }) if program_id == foreign
        ));
    }

    #[test]
    fn validation_requires_owner_grants() {
        let json = serde_json::json!({
            "owner": "owner",
            "retrieve": ["owner"],
            "update": [],
            "delete": ["owner"],
            "compute": {},
        });
        let permissions: Permissions = serde_json::from_value(json).unwrap();
        assert_eq!(
            permissions.validate_for(&owner()),
            Err(PermissionError::MissingOwnerGrant {
                owner: owner(),
                right: "update",
            })
        );
        assert!(!permissions.allows_update(&owner()));
    }
}
