//! Database record models matching table schemas.
//!
//! Each model struct matches a table in `migrations/` and derives `sqlx::FromRow`. Create and
//! update requests are separate structs so the repositories can validate and normalize them
//! before any statement runs.
//!
//! # Model Categories
//!
//! ## Registrants
//!
//! - [`natural_persons`]: Individuals, keyed by passport series and number
//! - [`legal_entities`]: Companies, keyed by tax number
//!
//! ## Documents and accounts
//!
//! - [`registration_docs`]: Vehicle registration documents, each owned by a registrant
//! - [`users`]: Authentication identities optionally linked to a registrant
//!
//! The `owners` table has no model: it is only ever touched through
//! [`crate::registry::AddressRegistry`].

pub mod legal_entities;
pub mod natural_persons;
pub mod registration_docs;
pub mod users;

#[cfg(test)]
mod tests {
    use super::{
        legal_entities::LegalEntityCreateDBRequest, natural_persons::NaturalPersonCreateDBRequest,
        registration_docs::RegistrationDocCreateDBRequest,
    };
    use chrono::NaiveDate;

    #[test]
    fn test_create_request_builders_accept_str_keys() {
        let person = NaturalPersonCreateDBRequest::builder()
            .passport_data("1234 567890")
            .address("Addr1")
            .last_name("Ivanov")
            .first_name("Ivan")
            .patronymic("Ivanovich")
            .build();
        assert_eq!(person.passport_data, "1234 567890");
        assert_eq!(person.patronymic.as_deref(), Some("Ivanovich"));

        let entity = LegalEntityCreateDBRequest::builder()
            .tax_number("7701234567")
            .address("Office")
            .company_name("Romashka LLC")
            .build();
        assert_eq!(entity.tax_number, "7701234567");

        let doc = RegistrationDocCreateDBRequest::builder()
            .registration_number("A123BC77")
            .address("Garage")
            .pts("77 ТС 000001")
            .sts("77 00 000001")
            .registration_date(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .document_owner("1234 567890")
            .build();
        assert_eq!(doc.registration_number, "A123BC77");
        assert_eq!(doc.document_owner, "1234 567890");
    }
}
