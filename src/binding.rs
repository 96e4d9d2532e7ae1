//! Which named parties provide the inputs of a computation and which receive its outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{identity::PartyId, program::ProgramId};

/// Errors for incomplete or inconsistent [`ProgramBindings`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    /// No party provides inputs.
    #[error("bindings must name at least one input party")]
    NoInputParty,
    /// No party receives outputs.
    #[error("bindings must name at least one output party")]
    NoOutputParty,
    /// A party name is empty.
    #[error("party names must not be empty")]
    EmptyPartyName,
    /// A referenced party name is not bound to a party id.
    #[error("party {name} is referenced but not bound to a party id")]
    UnboundParty {
        /// The unbound party name.
        name: String,
    },
}

/// Binds named input and output parties to one invocation of a program.
///
/// Party names are the names the program uses for its parties. A name is referenced as an input
/// or output party and bound to the [`PartyId`] that plays it, either in one step with
/// [`ProgramBindings::add_input_party`] or separately with [`ProgramBindings::bind_party`] when
/// the party id is only known later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramBindings {
    program_id: ProgramId,
    input_parties: Vec<String>,
    output_parties: Vec<String>,
    parties: BTreeMap<String, PartyId>,
}

impl ProgramBindings {
    /// Empty bindings for `program_id`.
    pub fn new(program_id: ProgramId) -> Self {
        Self {
            program_id,
            input_parties: vec![],
            output_parties: vec![],
            parties: BTreeMap::new(),
        }
    }

    /// Declares `name` as an input party played by `party`.
    pub fn add_input_party(&mut self, name: impl Into<String>, party: PartyId) {
        let name = name.into();
        self.reference_input(name.clone());
        self.parties.insert(name, party);
    }

    /// Declares `name` as an output party played by `party`.
    pub fn add_output_party(&mut self, name: impl Into<String>, party: PartyId) {
        let name = name.into();
        self.reference_output(name.clone());
        self.parties.insert(name, party);
    }

    /// Declares `name` as an input party without binding it yet.
    pub fn reference_input(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.input_parties.contains(&name) {
            self.input_parties.push(name);
        }
    }

    /// Declares `name` as an output party without binding it yet.
    pub fn reference_output(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.output_parties.contains(&name) {
            self.output_parties.push(name);
        }
    }

    /// Binds `name` to `party`, replacing a previous binding of that name.
    pub fn bind_party(&mut self, name: impl Into<String>, party: PartyId) {
        self.parties.insert(name.into(), party);
    }

    /// The program these bindings are for.
    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    /// Checks that there are input and output parties and that all of them are bound.
    pub fn validate(&self) -> Result<(), BindingError> {
        if self.input_parties.is_empty() {
            return Err(BindingError::NoInputParty);
        }
        if self.output_parties.is_empty() {
            return Err(BindingError::NoOutputParty);
        }
        for name in self.input_parties.iter().chain(&self.output_parties) {
            if name.is_empty() {
                return Err(BindingError::EmptyPartyName);
            }
            if !self.parties.contains_key(name) {
                return Err(BindingError::UnboundParty { name: name.clone() });
            }
        }
        Ok(())
    }

    /// Input parties in declaration order with their party ids.
    pub fn input_parties(&self) -> impl Iterator<Item = (&str, Option<&PartyId>)> {
        self.input_parties
            .iter()
            .map(|name| (name.as_str(), self.parties.get(name)))
    }

    /// Output parties in declaration order with their party ids.
    pub fn output_parties(&self) -> impl Iterator<Item = (&str, Option<&PartyId>)> {
        self.output_parties
            .iter()
            .map(|name| (name.as_str(), self.parties.get(name)))
    }
}

#[cfg(test)]
mod tests {
    use crate::identity::UserId;

    use super::*;

    fn bindings() -> ProgramBindings {
        ProgramBindings::new(ProgramId::new(UserId::from("u"), "p").unwrap())
    }

    #[test]
    fn one_party_as_input_and_output() {
        let mut b = bindings();
        b.add_input_party("Party1", PartyId::from("p1"));
        b.add_output_party("Party1", PartyId::from("p1"));
        assert_eq!(b.validate(), Ok(()));
        assert_eq!(
            b.input_parties().collect::<Vec<_>>(),
            vec![("Party1", Some(&PartyId::from("p1")))]
        );
    }

    #[test]
    fn requires_input_and_output() {
        let mut b = bindings();
        assert_eq!(b.validate(), Err(BindingError::NoInputParty));
        b.add_input_party("Party1", PartyId::from("p1"));
        assert_eq!(b.validate(), Err(BindingError::NoOutputParty));
    }

    #[test]
    fn unbound_party_is_rejected() {
        let mut b = bindings();
        b.add_input_party("Party1", PartyId::from("p1"));
        b.reference_output("Party2");
        assert_eq!(
            b.validate(),
            Err(BindingError::UnboundParty {
                name: "Party2".to_string()
            })
        );
        b.bind_party("Party2", PartyId::from("p2"));
        assert_eq!(b.validate(), Ok(()));
    }

    #[test]
    fn input_order_is_preserved() {
        let mut b = bindings();
        for name in ["Zed", "Alice", "Mallory"] {
            b.add_input_party(name, PartyId::from(name));
        }
        let names: Vec<_> = b.input_parties().map(|(name, _)| name).collect();
        assert_eq!(names, ["Zed", "Alice", "Mallory"]);
    }
}
