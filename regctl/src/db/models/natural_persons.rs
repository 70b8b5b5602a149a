//! Database models for natural persons.

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::PassportData;

/// Database entity model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct NaturalPerson {
    pub passport_data: PassportData,
    pub address: String,
    pub last_name: String,
    pub first_name: String,
    pub patronymic: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Database request for registering a natural person
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct NaturalPersonCreateDBRequest {
    #[builder(into)]
    pub passport_data: PassportData,
    pub address: String,
    pub last_name: String,
    pub first_name: String,
    pub patronymic: Option<String>,
}

/// Database request for updating a natural person. `None` leaves a field unchanged.
///
/// The name fields are protected once the person owns a registration document; the address
/// is always changeable.
#[derive(Debug, Clone, Default)]
pub struct NaturalPersonUpdateDBRequest {
    pub address: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    /// None = no change, Some(None) = clear, Some(value) = set
    pub patronymic: Option<Option<String>>,
}

/// Response type (same as entity for now)
pub type NaturalPersonDBResponse = NaturalPerson;

/// Filter for listing natural persons
#[derive(Debug, Clone)]
pub struct NaturalPersonFilter {
    pub address: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

impl NaturalPersonFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { address: None, skip, limit }
    }
}
