//! Format checks for natural keys, addresses and names.
//!
//! Every check trims its input and returns the normalized value, so the stored value is the
//! one that was validated. The same formats are enforced again by CHECK constraints in the
//! schema.

use crate::db::errors::{DbError, Result};

const MAX_ADDRESS_LEN: usize = 255;
const MAX_NAME_LEN: usize = 100;
const MAX_DOCUMENT_FIELD_LEN: usize = 32;

/// Passport series and number: four digits, a space, six digits ("1234 567890")
pub fn passport_data(value: &str) -> Result<String> {
    let value = value.trim();
    let valid = value.len() == 11
        && value.char_indices().all(|(i, c)| if i == 4 { c == ' ' } else { c.is_ascii_digit() });
    if !valid {
        return Err(DbError::validation(
            "passport_data",
            "expected four digits, a space and six digits",
        ));
    }
    Ok(value.to_string())
}

/// Legal entity tax number: exactly ten digits
pub fn tax_number(value: &str) -> Result<String> {
    let value = value.trim();
    if value.len() != 10 || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(DbError::validation("tax_number", "expected exactly ten digits"));
    }
    Ok(value.to_string())
}

/// A registration document owner is either a passport or a tax number
pub fn document_owner(value: &str) -> Result<String> {
    passport_data(value)
        .or_else(|_| tax_number(value))
        .map_err(|_| DbError::validation("document_owner", "expected a passport or a tax number"))
}

pub fn address(value: &str) -> Result<String> {
    bounded("address", value, MAX_ADDRESS_LEN)
}

pub fn name(field: &str, value: &str) -> Result<String> {
    bounded(field, value, MAX_NAME_LEN)
}

pub fn document_field(field: &str, value: &str) -> Result<String> {
    bounded(field, value, MAX_DOCUMENT_FIELD_LEN)
}

pub fn email(value: &str) -> Result<String> {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(value.to_lowercase())
        }
        _ => Err(DbError::validation("email", "expected an email address")),
    }
}

fn bounded(field: &str, value: &str, max_len: usize) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DbError::validation(field, "must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(DbError::validation(field, format!("must be at most {max_len} characters")));
    }
    Ok(value.to_string())
}
