//! Common type definitions shared across the registry.
//!
//! This module defines:
//! - Type aliases for natural keys and entity IDs
//! - [`RegistrantKind`], the two registrant tables the cleanup sweep walks
//! - [`Operation`], used when reporting protection-rule failures
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging
//! - [`mask_key`]: Hide all but the last four characters of a passport or tax number

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type PassportData = String;
pub type TaxNumber = String;
pub type RegistrationNumber = String;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Mask a registrant key for logging, keeping only the last four characters.
/// Example: "1234 567890" -> "*******7890"
pub fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    key.chars()
        .enumerate()
        .map(|(i, c)| if i + 4 < count { '*' } else { c })
        .collect()
}

/// The two kinds of registrant that can own an address and a registration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrantKind {
    NaturalPerson,
    LegalEntity,
}

impl RegistrantKind {
    pub const ALL: [RegistrantKind; 2] = [RegistrantKind::NaturalPerson, RegistrantKind::LegalEntity];

    /// Label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrantKind::NaturalPerson => "natural_person",
            RegistrantKind::LegalEntity => "legal_entity",
        }
    }

    /// Table holding registrants of this kind
    pub(crate) fn table(&self) -> &'static str {
        match self {
            RegistrantKind::NaturalPerson => "natural_persons",
            RegistrantKind::LegalEntity => "legal_entities",
        }
    }

    /// Natural key column, shared by the registrant table and `users`
    pub(crate) fn key_column(&self) -> &'static str {
        match self {
            RegistrantKind::NaturalPerson => "passport_data",
            RegistrantKind::LegalEntity => "tax_number",
        }
    }
}

impl fmt::Display for RegistrantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrantKind::NaturalPerson => write!(f, "natural person"),
            RegistrantKind::LegalEntity => write!(f, "legal entity"),
        }
    }
}

// Operations a protection rule can reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key_keeps_last_four() {
        assert_eq!(mask_key("1234 567890"), "*******7890");
        assert_eq!(mask_key("7701234567"), "******4567");
        assert_eq!(mask_key("123"), "123");
    }

    #[test]
    fn test_abbrev_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }

    #[test]
    fn test_registrant_kind_columns() {
        assert_eq!(RegistrantKind::NaturalPerson.table(), "natural_persons");
        assert_eq!(RegistrantKind::NaturalPerson.key_column(), "passport_data");
        assert_eq!(RegistrantKind::LegalEntity.table(), "legal_entities");
        assert_eq!(RegistrantKind::LegalEntity.key_column(), "tax_number");
        assert_eq!(RegistrantKind::LegalEntity.to_string(), "legal entity");
    }
}
