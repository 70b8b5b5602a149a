//! Database models for legal entities.

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::TaxNumber;

/// Database entity model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LegalEntity {
    pub tax_number: TaxNumber,
    pub address: String,
    pub company_name: String,
    pub created_at: DateTime<Utc>,
}

/// Database request for registering a legal entity
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct LegalEntityCreateDBRequest {
    #[builder(into)]
    pub tax_number: TaxNumber,
    pub address: String,
    pub company_name: String,
}

/// Database request for updating a legal entity. `company_name` is protected once the entity
/// owns a registration document.
#[derive(Debug, Clone, Default)]
pub struct LegalEntityUpdateDBRequest {
    pub address: Option<String>,
    pub company_name: Option<String>,
}

/// Response type (same as entity for now)
pub type LegalEntityDBResponse = LegalEntity;

/// Filter for listing legal entities
#[derive(Debug, Clone)]
pub struct LegalEntityFilter {
    pub address: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

impl LegalEntityFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { address: None, skip, limit }
    }
}
