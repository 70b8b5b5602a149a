//! Two-step account signup.
//!
//! Step one registers the natural person or legal entity and commits. Step two creates the user
//! linked to it. The steps are separate transactions, so a failure in step two leaves an
//! unlinked registrant behind; [`crate::cleanup::CleanupSweep`] reclaims it once the grace
//! period has passed. A client that retries step two inside the grace period keeps the
//! registrant.

use sqlx::PgPool;
use tracing::{instrument, warn};

use crate::{
    db::{
        handlers::{LegalEntities, NaturalPersons, Repository, Users},
        models::{
            legal_entities::{LegalEntity, LegalEntityCreateDBRequest},
            natural_persons::{NaturalPerson, NaturalPersonCreateDBRequest},
            users::{User, UserCreateDBRequest},
        },
    },
    errors::Result,
    types::mask_key,
};

/// A registrant together with the user that signs in for it
#[derive(Debug, Clone)]
pub struct Account<R> {
    pub registrant: R,
    pub user: User,
}

#[instrument(skip_all, fields(passport = %mask_key(&person.passport_data)), err)]
pub async fn register_person_account(pool: &PgPool, person: &NaturalPersonCreateDBRequest, email: &str) -> Result<Account<NaturalPerson>> {
    let mut conn = pool.acquire().await.map_err(crate::db::errors::DbError::from)?;

    let registrant = NaturalPersons::new(&mut conn).create(person).await?;

    let user = Users::new(&mut conn)
        .create(&UserCreateDBRequest::for_person(email, registrant.passport_data.clone()))
        .await
        .inspect_err(|e| warn!(error = %e, "User creation failed; registrant left for the cleanup sweep"))?;

    Ok(Account { registrant, user })
}

#[instrument(skip_all, fields(tax_number = %mask_key(&entity.tax_number)), err)]
pub async fn register_entity_account(pool: &PgPool, entity: &LegalEntityCreateDBRequest, email: &str) -> Result<Account<LegalEntity>> {
    let mut conn = pool.acquire().await.map_err(crate::db::errors::DbError::from)?;

    let registrant = LegalEntities::new(&mut conn).create(entity).await?;

    let user = Users::new(&mut conn)
        .create(&UserCreateDBRequest::for_entity(email, registrant.tax_number.clone()))
        .await
        .inspect_err(|e| warn!(error = %e, "User creation failed; registrant left for the cleanup sweep"))?;

    Ok(Account { registrant, user })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cleanup::{CleanupSweep, CycleOutcome},
        config::CleanupConfig,
        errors::ErrorKind,
        test_utils::{
            assert_registry_consistent, backdate_entity, backdate_person, create_test_user, entity_request, owner_exists, person_request,
        },
    };
    use chrono::{Duration, Utc};

    #[sqlx::test]
    #[test_log::test]
    async fn test_person_signup_links_user(pool: PgPool) {
        let account = register_person_account(&pool, &person_request("1234 567890", "Addr1"), "ivan@example.com")
            .await
            .unwrap();

        assert_eq!(account.user.passport_data.as_deref(), Some("1234 567890"));
        assert_eq!(account.registrant.address, "Addr1");

        // A linked registrant is never reclaimed
        backdate_person(&mut pool.acquire().await.unwrap(), "1234 567890", Utc::now() - Duration::minutes(6)).await;
        let outcome = CleanupSweep::new(pool.clone(), CleanupConfig::default()).run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(ref r) if r.persons_deleted == 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_interrupted_signup_is_reclaimed_by_sweep(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_user(&mut conn, "taken@example.com", None, None).await;

        let err = register_person_account(&pool, &person_request("1234 567890", "Addr1"), "taken@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // Step one committed: the registrant and its owner are live but unlinked
        assert!(owner_exists(&mut conn, "Addr1").await);

        backdate_person(&mut conn, "1234 567890", Utc::now() - Duration::minutes(6)).await;
        let outcome = CleanupSweep::new(pool.clone(), CleanupConfig::default()).run_cycle().await.unwrap();

        match outcome {
            CycleOutcome::Completed(report) => {
                assert_eq!(report.persons_deleted, 1);
                assert_eq!(report.owners_removed, 1);
            }
            CycleOutcome::Skipped => panic!("cycle was skipped"),
        }
        assert!(!owner_exists(&mut conn, "Addr1").await);
        assert_registry_consistent(&mut conn).await;
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_entity_signup_retry_within_grace_period(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_user(&mut conn, "taken@example.com", None, None).await;

        let request = entity_request("7701234567", "Office");
        assert!(register_entity_account(&pool, &request, "taken@example.com").await.is_err());

        // Retrying step one hits the registrant that is already there
        let err = register_entity_account(&pool, &request, "corp@example.com").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // Completing step two on its own links it, so the sweep keeps it
        Users::new(&mut conn)
            .create(&UserCreateDBRequest::for_entity("corp@example.com", "7701234567"))
            .await
            .unwrap();
        backdate_entity(&mut conn, "7701234567", Utc::now() - Duration::minutes(6)).await;
        let outcome = CleanupSweep::new(pool.clone(), CleanupConfig::default()).run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(ref r) if r.entities_deleted == 0));
        assert!(owner_exists(&mut conn, "Office").await);
    }
}
