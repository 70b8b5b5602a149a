//! The address registry: the only code path that writes to the `owners` table.
//!
//! An `owners` row is an existence marker for an address that is referenced by at least one
//! natural person, legal entity or registration document. Nothing creates or deletes owners
//! directly; every mutation of the three referencing tables calls into [`AddressRegistry`] on
//! the same connection, inside the same transaction, so the domain write and the registry
//! update commit or roll back together.
//!
//! # Operations
//!
//! - [`AddressRegistry::ensure_owner`] creates the owner for an address if it is missing.
//! - [`AddressRegistry::reconcile_address`] deletes the owner once nothing references it.
//! - [`AddressRegistry::begin_move`] / [`AddressRegistry::finish_move`] wrap an update that
//!   moves references from one or more old addresses to a new one.
//!
//! # Moving an address
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let previous = BTreeSet::from([old_address.clone()]);
//! AddressRegistry::new(&mut tx).begin_move(&previous, &new_address).await?;
//! sqlx::query("UPDATE natural_persons SET address = $2 WHERE passport_data = $1")
//!     .bind(&passport)
//!     .bind(&new_address)
//!     .execute(&mut *tx)
//!     .await?;
//! AddressRegistry::new(&mut tx).finish_move(&previous, &new_address).await?;
//! tx.commit().await?;
//! ```
//!
//! The new owner exists before the row points at it, and the old address is only reconciled
//! once the row no longer references it.
//!
//! # Locking
//!
//! Each operation takes a transaction-scoped advisory lock keyed on the address, so two
//! transactions reconciling or populating the same address serialize. Locks are re-entrant
//! within a transaction and are always acquired in ascending lock-key order when more than
//! one address is involved. The foreign keys from the referencing tables to `owners` back
//! this up: deleting an owner that an uncommitted insert points at fails instead of leaving
//! the insert dangling.

use std::collections::BTreeSet;

use sqlx::PgConnection;
use tracing::{debug, instrument};

use crate::db::errors::Result;

/// First key of the two-key advisory lock space used for addresses ("ADDR")
const ADDRESS_LOCK_NAMESPACE: i32 = 0x4144_4452;

pub struct AddressRegistry<'c> {
    db: &'c mut PgConnection,
}

impl<'c> AddressRegistry<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Take the advisory lock for each distinct address.
    ///
    /// Locks are acquired in ascending order of the lock key itself, so two addresses whose
    /// keys collide are taken once and every transaction agrees on the order. Held until the
    /// enclosing transaction ends. Outside a transaction the lock is released as soon as the
    /// statement completes, so callers always run this inside one.
    #[instrument(skip_all, fields(count = tracing::field::Empty), err)]
    pub async fn lock_addresses<'a, I>(&mut self, addresses: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let addresses: Vec<&str> = addresses.into_iter().collect();
        let keys = self.lock_keys(&addresses).await?;
        tracing::Span::current().record("count", keys.len());
        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                .bind(ADDRESS_LOCK_NAMESPACE)
                .bind(key)
                .execute(&mut *self.db)
                .await?;
        }
        Ok(())
    }

    /// Distinct advisory lock keys for `addresses`, ascending
    async fn lock_keys(&mut self, addresses: &[&str]) -> Result<Vec<i32>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let keys = sqlx::query_scalar::<_, i32>("SELECT DISTINCT hashtext(a) AS key FROM unnest($1::text[]) AS a ORDER BY key")
            .bind(addresses)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(keys)
    }

    /// Create the owner row for `address` if none exists. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_owner(&mut self, address: &str) -> Result<()> {
        self.lock_addresses([address]).await?;
        let result = sqlx::query("INSERT INTO owners (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(address)
            .execute(&mut *self.db)
            .await?;
        if result.rows_affected() > 0 {
            debug!("Created owner");
        }
        Ok(())
    }

    /// Number of live rows across natural persons, legal entities and registration documents
    /// that reference `address`.
    #[instrument(skip(self), err)]
    pub async fn reference_count(&mut self, address: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM natural_persons WHERE address = $1)
              + (SELECT COUNT(*) FROM legal_entities WHERE address = $1)
              + (SELECT COUNT(*) FROM registration_docs WHERE address = $1)
            "#,
        )
        .bind(address)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Delete the owner row for `address` if nothing references it any more.
    ///
    /// Returns `true` when a row was removed. Calling it for an address that is still in use,
    /// or whose owner is already gone, changes nothing.
    #[instrument(skip(self), fields(references = tracing::field::Empty), err)]
    pub async fn reconcile_address(&mut self, address: &str) -> Result<bool> {
        self.lock_addresses([address]).await?;
        let references = self.reference_count(address).await?;
        tracing::Span::current().record("references", references);
        if references > 0 {
            return Ok(false);
        }

        let result = sqlx::query("DELETE FROM owners WHERE address = $1")
            .bind(address)
            .execute(&mut *self.db)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            debug!("Removed orphaned owner");
        }
        Ok(removed)
    }

    /// First half of an address change: lock every address involved and make sure the owner
    /// for `next` exists before any row is pointed at it.
    #[instrument(skip(self, previous), fields(previous = previous.len()), err)]
    pub async fn begin_move(&mut self, previous: &BTreeSet<String>, next: &str) -> Result<()> {
        self.lock_addresses(previous.iter().map(String::as_str).chain([next])).await?;
        self.ensure_owner(next).await
    }

    /// Second half of an address change: reconcile every address the moved rows used to
    /// reference. Returns how many owners were removed.
    #[instrument(skip(self, previous), fields(previous = previous.len()), err)]
    pub async fn finish_move(&mut self, previous: &BTreeSet<String>, next: &str) -> Result<u64> {
        let mut removed = 0;
        for address in previous.iter().filter(|a| a.as_str() != next) {
            if self.reconcile_address(address).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_registry_consistent, create_test_person, owner_exists};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_ensure_owner_is_idempotent(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut registry = AddressRegistry::new(&mut conn);

        registry.ensure_owner("Addr1").await.unwrap();
        registry.ensure_owner("Addr1").await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM owners WHERE address = 'Addr1'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reconcile_removes_unreferenced_owner(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        AddressRegistry::new(&mut conn).ensure_owner("Addr1").await.unwrap();

        let removed = AddressRegistry::new(&mut conn).reconcile_address("Addr1").await.unwrap();
        assert!(removed);
        assert!(!owner_exists(&mut conn, "Addr1").await);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reconcile_keeps_referenced_owner(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;

        let mut registry = AddressRegistry::new(&mut conn);
        assert_eq!(registry.reference_count("Addr1").await.unwrap(), 1);
        assert!(!registry.reconcile_address("Addr1").await.unwrap());
        assert!(owner_exists(&mut conn, "Addr1").await);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reconcile_twice_equals_once(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;
        AddressRegistry::new(&mut conn).ensure_owner("Addr2").await.unwrap();

        for address in ["Addr1", "Addr2"] {
            AddressRegistry::new(&mut conn).reconcile_address(address).await.unwrap();
        }
        let owners_after_first: Vec<String> = sqlx::query_scalar("SELECT address FROM owners ORDER BY address")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

        for address in ["Addr1", "Addr2"] {
            assert!(!AddressRegistry::new(&mut conn).reconcile_address(address).await.unwrap());
        }
        let owners_after_second: Vec<String> = sqlx::query_scalar("SELECT address FROM owners ORDER BY address")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

        assert_eq!(owners_after_first, vec!["Addr1".to_string()]);
        assert_eq!(owners_after_first, owners_after_second);
        assert_registry_consistent(&mut conn).await;
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_reconcile_heals_dangling_owner(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        // An owner left behind by some earlier inconsistency
        sqlx::query("INSERT INTO owners (address) VALUES ('Stale')")
            .execute(&mut *conn)
            .await
            .unwrap();

        assert!(AddressRegistry::new(&mut conn).reconcile_address("Stale").await.unwrap());
        assert_registry_consistent(&mut conn).await;
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_rolled_back_ensure_leaves_no_owner(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        AddressRegistry::new(&mut tx).ensure_owner("Addr1").await.unwrap();
        tx.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(!owner_exists(&mut conn, "Addr1").await);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_move_creates_new_owner_and_reconciles_previous(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Old").await;

        let mut tx = pool.begin().await.unwrap();
        let previous = BTreeSet::from(["Old".to_string()]);
        AddressRegistry::new(&mut tx).begin_move(&previous, "New").await.unwrap();
        sqlx::query("UPDATE natural_persons SET address = 'New' WHERE passport_data = '1234 567890'")
            .execute(&mut *tx)
            .await
            .unwrap();
        let removed = AddressRegistry::new(&mut tx).finish_move(&previous, "New").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed, 1);
        assert!(owner_exists(&mut conn, "New").await);
        assert!(!owner_exists(&mut conn, "Old").await);
        assert_registry_consistent(&mut conn).await;
    }

    async fn held_address_locks(conn: &mut PgConnection) -> Vec<i64> {
        sqlx::query_scalar(
            "SELECT objid::bigint FROM pg_locks WHERE locktype = 'advisory' AND pid = pg_backend_pid() AND classid::bigint = $1 ORDER BY objid",
        )
        .bind(ADDRESS_LOCK_NAMESPACE as i64)
        .fetch_all(&mut *conn)
        .await
        .unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_locks_follow_key_order_not_address_order(pool: PgPool) {
        let addresses = ["Addr3", "Addr1", "Garage", "Addr1", "Office"];

        let mut tx = pool.begin().await.unwrap();
        let keys = AddressRegistry::new(&mut tx).lock_keys(&addresses).await.unwrap();

        let mut expected: Vec<i32> = Vec::new();
        for address in addresses {
            let key: i32 = sqlx::query_scalar("SELECT hashtext($1)")
                .bind(address)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
            expected.push(key);
        }
        expected.sort();
        expected.dedup();
        assert_eq!(keys, expected);

        AddressRegistry::new(&mut tx).lock_addresses(addresses).await.unwrap();
        // objid is the key reinterpreted as an unsigned oid
        let mut held: Vec<i64> = expected.iter().map(|k| *k as u32 as i64).collect();
        held.sort();
        assert_eq!(held_address_locks(&mut tx).await, held);

        tx.rollback().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(held_address_locks(&mut conn).await.is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_opposite_input_orders_do_not_deadlock(pool: PgPool) {
        let addresses = ["Addr1", "Addr2", "Addr3", "Garage", "Office"];
        let mut reversed = addresses;
        reversed.reverse();

        let lock_then_hold = |pool: PgPool, set: [&'static str; 5]| async move {
            let mut tx = pool.begin().await.unwrap();
            AddressRegistry::new(&mut tx).lock_addresses(set).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            tx.commit().await.unwrap();
        };

        let first = tokio::spawn(lock_then_hold(pool.clone(), addresses));
        let second = tokio::spawn(lock_then_hold(pool.clone(), reversed));
        let joined = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await;
        assert!(joined.is_ok(), "both transactions should finish");
    }
}
