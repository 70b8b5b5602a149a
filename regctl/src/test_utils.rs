//! Test fixtures and registry assertions (available with `test-utils` feature).

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgConnection;

use crate::config::{CleanupConfig, Config, LeaderElectionConfig, PoolSettings};
use crate::db::{
    handlers::{LegalEntities, NaturalPersons, RegistrationDocs, Repository, Users},
    models::{
        legal_entities::{LegalEntity, LegalEntityCreateDBRequest},
        natural_persons::{NaturalPerson, NaturalPersonCreateDBRequest},
        registration_docs::{RegistrationDoc, RegistrationDocCreateDBRequest},
        users::{User, UserCreateDBRequest},
    },
};

pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.database.pool = PoolSettings {
        max_connections: 4,
        min_connections: 0,
        ..Default::default()
    };
    // Single-instance tests run the sweep directly
    config.leader_election = LeaderElectionConfig { enabled: false };
    config.cleanup = CleanupConfig::default();
    config
}

pub fn person_request(passport_data: &str, address: &str) -> NaturalPersonCreateDBRequest {
    NaturalPersonCreateDBRequest::builder()
        .passport_data(passport_data)
        .address(address)
        .last_name("Ivanov")
        .first_name("Ivan")
        .build()
}

pub fn entity_request(tax_number: &str, address: &str) -> LegalEntityCreateDBRequest {
    LegalEntityCreateDBRequest::builder()
        .tax_number(tax_number)
        .address(address)
        .company_name(format!("Company {tax_number}"))
        .build()
}

pub async fn create_test_person(conn: &mut PgConnection, passport_data: &str, address: &str) -> NaturalPerson {
    NaturalPersons::new(conn)
        .create(&person_request(passport_data, address))
        .await
        .expect("Failed to create test person")
}

pub async fn create_test_entity(conn: &mut PgConnection, tax_number: &str, address: &str) -> LegalEntity {
    LegalEntities::new(conn)
        .create(&entity_request(tax_number, address))
        .await
        .expect("Failed to create test entity")
}

pub async fn create_test_doc(conn: &mut PgConnection, registration_number: &str, owner: &str, address: &str) -> RegistrationDoc {
    let request = RegistrationDocCreateDBRequest::builder()
        .registration_number(registration_number)
        .address(address)
        .pts("77 ТС 000001")
        .sts("77 00 000001")
        .registration_date(NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date"))
        .document_owner(owner)
        .build();

    RegistrationDocs::new(conn)
        .create(&request)
        .await
        .expect("Failed to create test registration document")
}

pub async fn create_test_user(conn: &mut PgConnection, email: &str, passport_data: Option<&str>, tax_number: Option<&str>) -> User {
    let request = UserCreateDBRequest {
        email: email.to_string(),
        passport_data: passport_data.map(str::to_string),
        tax_number: tax_number.map(str::to_string),
    };
    Users::new(conn).create(&request).await.expect("Failed to create test user")
}

/// Pretend a natural person was registered at `created_at`
pub async fn backdate_person(conn: &mut PgConnection, passport_data: &str, created_at: DateTime<Utc>) {
    sqlx::query("UPDATE natural_persons SET created_at = $2 WHERE passport_data = $1")
        .bind(passport_data)
        .bind(created_at)
        .execute(&mut *conn)
        .await
        .expect("Failed to backdate person");
}

/// Pretend a legal entity was registered at `created_at`
pub async fn backdate_entity(conn: &mut PgConnection, tax_number: &str, created_at: DateTime<Utc>) {
    sqlx::query("UPDATE legal_entities SET created_at = $2 WHERE tax_number = $1")
        .bind(tax_number)
        .bind(created_at)
        .execute(&mut *conn)
        .await
        .expect("Failed to backdate entity");
}

pub async fn owner_exists(conn: &mut PgConnection, address: &str) -> bool {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM owners WHERE address = $1)")
        .bind(address)
        .fetch_one(&mut *conn)
        .await
        .expect("Failed to query owners")
}

/// Panic unless the owners table holds exactly the addresses referenced by live rows
pub async fn assert_registry_consistent(conn: &mut PgConnection) {
    let referenced: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT address FROM natural_persons
        UNION SELECT address FROM legal_entities
        UNION SELECT address FROM registration_docs
        ORDER BY address
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .expect("Failed to query referenced addresses");

    let owners: Vec<String> = sqlx::query_scalar("SELECT address FROM owners ORDER BY address")
        .fetch_all(&mut *conn)
        .await
        .expect("Failed to query owners");

    assert_eq!(owners, referenced, "owners must match the set of referenced addresses");
}
