//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx with PostgreSQL.
//! It follows the Repository pattern to provide clean abstractions over database operations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Repositories     │  (db::handlers - validation, queries, transactions)
//! └───────┬──────────┘
//!         │ every address write goes through
//!         ↓
//! ┌──────────────────┐
//! │ AddressRegistry  │  (crate::registry - owns the `owners` table)
//! └───────┬──────────┘
//!         │
//!         ↓
//! ┌──────────────────┐
//! │    PostgreSQL    │
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: Repository implementations for CRUD operations
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//!
//! # Transactions
//!
//! Repositories wrap a `&mut PgConnection`. Every write opens a transaction on it (a savepoint
//! when the caller already started one), so a registrant write and its registry update are
//! atomic whether or not the caller manages the outer transaction:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let mut persons = NaturalPersons::new(&mut tx);
//! persons.create(&request).await?;
//! tx.commit().await?;
//! ```
//!
//! # Migrations
//!
//! Database migrations are managed by SQLx and located in the `migrations/` directory.
//! The [`crate::migrator`] function provides access to the migrator:
//!
//! ```ignore
//! regctl::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
