//! Database models for registration documents.

use bon::Builder;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::RegistrationNumber;

/// Database entity model
///
/// `address` is copied from the request when the document is written; it is not joined from
/// the owning registrant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RegistrationDoc {
    pub registration_number: RegistrationNumber,
    pub address: String,
    pub pts: String,
    pub sts: String,
    pub registration_date: NaiveDate,
    /// Passport or tax number of the owning registrant
    pub document_owner: String,
    pub created_at: DateTime<Utc>,
}

/// Database request for creating a registration document
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct RegistrationDocCreateDBRequest {
    #[builder(into)]
    pub registration_number: RegistrationNumber,
    pub address: String,
    pub pts: String,
    pub sts: String,
    pub registration_date: NaiveDate,
    pub document_owner: String,
}

/// Database request for updating a registration document
#[derive(Debug, Clone, Default)]
pub struct RegistrationDocUpdateDBRequest {
    pub address: Option<String>,
    pub pts: Option<String>,
    pub sts: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub document_owner: Option<String>,
}

/// Response type (same as entity for now)
pub type RegistrationDocDBResponse = RegistrationDoc;

/// Filter for listing registration documents
#[derive(Debug, Clone)]
pub struct RegistrationDocFilter {
    pub document_owner: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

impl RegistrationDocFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            document_owner: None,
            skip,
            limit,
        }
    }
}
