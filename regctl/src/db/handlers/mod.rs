//! Repository implementations for database access.
//!
//! Each repository:
//! - Wraps a SQLx connection or transaction
//! - Validates and normalizes its input before running any statement
//! - Calls [`crate::registry::AddressRegistry`] for every address it creates, changes or removes
//! - Returns models from [`crate::db::models`]
//!
//! # Available Repositories
//!
//! - [`NaturalPersons`]: Individuals keyed by passport
//! - [`LegalEntities`]: Companies keyed by tax number
//! - [`RegistrationDocs`]: Registration documents owned by either kind of registrant
//! - [`Users`]: Authentication identities linked to a registrant
//!
//! # Common Pattern
//!
//! ```ignore
//! use regctl::db::handlers::{NaturalPersons, Repository};
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut repo = NaturalPersons::new(&mut tx);
//!     let deleted = repo.delete("1234 567890".to_string()).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod legal_entities;
pub mod natural_persons;
pub mod registration_docs;
pub mod repository;
pub mod users;

pub use legal_entities::LegalEntities;
pub use natural_persons::NaturalPersons;
pub use registration_docs::RegistrationDocs;
pub use repository::Repository;
pub use users::Users;

use sqlx::PgConnection;

use crate::{db::errors::Result, types::RegistrantKind};

/// Whether an optional update value differs from the stored one
pub(crate) fn differs(new: Option<&str>, current: &str) -> bool {
    new.is_some_and(|value| value != current)
}

/// Share-lock a registrant row until the transaction ends and report whether it exists.
///
/// Any write that links a row to a registrant (a user or a registration document) takes this
/// lock first. The cleanup sweep selects its candidates with `FOR UPDATE SKIP LOCKED`, so a
/// registrant that is being linked is either skipped by the sweep or already gone when the
/// lock is granted.
pub(crate) async fn lock_registrant(db: &mut PgConnection, kind: RegistrantKind, key: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = $1 FOR KEY SHARE",
        kind.table(),
        kind.key_column()
    );
    let found = sqlx::query_scalar::<_, i32>(&sql).bind(key).fetch_optional(&mut *db).await?;
    Ok(found.is_some())
}
