//! Database models for users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{PassportData, TaxNumber, UserId};

/// Database entity model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub passport_data: Option<PassportData>,
    pub tax_number: Option<TaxNumber>,
    pub created_at: DateTime<Utc>,
}

/// Database request for creating a user. At most one of `passport_data` and `tax_number` may
/// be set, and it must name an existing registrant.
#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub email: String,
    pub passport_data: Option<PassportData>,
    pub tax_number: Option<TaxNumber>,
}

impl UserCreateDBRequest {
    pub fn for_person(email: impl Into<String>, passport_data: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            passport_data: Some(passport_data.into()),
            tax_number: None,
        }
    }

    pub fn for_entity(email: impl Into<String>, tax_number: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            passport_data: None,
            tax_number: Some(tax_number.into()),
        }
    }
}

/// Database request for updating a user
#[derive(Debug, Clone, Default)]
pub struct UserUpdateDBRequest {
    pub email: Option<String>,
}

/// Response type (same as entity for now)
pub type UserDBResponse = User;

/// Filter for listing users
#[derive(Debug, Clone)]
pub struct UserFilter {
    pub skip: i64,
    pub limit: i64,
}

impl UserFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit }
    }
}
