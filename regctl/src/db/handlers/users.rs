//! Database repository for users.

use std::collections::HashMap;

use sqlx::{Connection, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{lock_registrant, repository::Repository},
        models::users::{User, UserCreateDBRequest, UserDBResponse, UserFilter, UserUpdateDBRequest},
    },
    types::{RegistrantKind, UserId, abbrev_uuid},
    validation,
};

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Whether any user is linked to the given registrant
    #[instrument(skip(self, key), err)]
    pub async fn is_linked(&mut self, kind: RegistrantKind, key: &str) -> Result<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM users WHERE {} = $1)", kind.key_column());
        let linked = sqlx::query_scalar::<_, bool>(&sql).bind(key).fetch_one(&mut *self.db).await?;
        Ok(linked)
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type CreateRequest = UserCreateDBRequest;
    type UpdateRequest = UserUpdateDBRequest;
    type Response = UserDBResponse;
    type Id = UserId;
    type Filter = UserFilter;

    #[instrument(skip(self, request), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let email = validation::email(&request.email)?;
        let link = match (request.passport_data.as_deref(), request.tax_number.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(DbError::validation(
                    "registrant",
                    "a user links to a passport or a tax number, not both",
                ));
            }
            (Some(passport), None) => Some((RegistrantKind::NaturalPerson, validation::passport_data(passport)?)),
            (None, Some(tax_number)) => Some((RegistrantKind::LegalEntity, validation::tax_number(tax_number)?)),
            (None, None) => None,
        };

        let mut tx = self.db.begin().await?;

        if let Some((kind, key)) = &link {
            if !lock_registrant(&mut tx, *kind, key).await? {
                return Err(DbError::validation(kind.key_column(), format!("no {kind} with this key")));
            }
        }

        let (passport_data, tax_number) = match link {
            Some((RegistrantKind::NaturalPerson, key)) => (Some(key), None),
            Some((RegistrantKind::LegalEntity, key)) => (None, Some(key)),
            None => (None, None),
        };

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, passport_data, tax_number)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&passport_data)
        .bind(&tax_number)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(user)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(user)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let users = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(users.into_iter().map(|u| (u.id, u)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY created_at DESC, id LIMIT $1 OFFSET $2")
            .bind(filter.limit)
            .bind(filter.skip)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(users)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let email = request.email.as_deref().map(validation::email).transpose()?;

        let user = sqlx::query_as::<_, User>("UPDATE users SET email = COALESCE($2, email) WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(&email)
            .fetch_optional(&mut *self.db)
            .await?
            .ok_or(DbError::NotFound)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{Error, ErrorKind},
        test_utils::{create_test_entity, create_test_person, create_test_user},
    };
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_user_linked_to_person(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;

        let user = Users::new(&mut conn)
            .create(&UserCreateDBRequest::for_person("Ivan@Example.com", "1234 567890"))
            .await
            .unwrap();
        assert_eq!(user.email, "ivan@example.com");
        assert_eq!(user.passport_data.as_deref(), Some("1234 567890"));
        assert!(user.tax_number.is_none());

        let mut repo = Users::new(&mut conn);
        assert!(repo.is_linked(RegistrantKind::NaturalPerson, "1234 567890").await.unwrap());
        assert!(!repo.is_linked(RegistrantKind::LegalEntity, "1234 567890").await.unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_user_requires_existing_registrant(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();

        let result = Users::new(&mut conn)
            .create(&UserCreateDBRequest::for_entity("corp@example.com", "7701234567"))
            .await;
        match result {
            Err(DbError::Validation { field, .. }) => assert_eq!(field, "tax_number"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_user_rejects_both_keys(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;
        create_test_entity(&mut conn, "7701234567", "Addr1").await;

        let request = UserCreateDBRequest {
            email: "both@example.com".to_string(),
            passport_data: Some("1234 567890".to_string()),
            tax_number: Some("7701234567".to_string()),
        };
        let result = Users::new(&mut conn).create(&request).await;
        assert!(matches!(result, Err(DbError::Validation { .. })));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_email_is_conflict(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_user(&mut conn, "taken@example.com", None, None).await;

        let err = Users::new(&mut conn)
            .create(&UserCreateDBRequest {
                email: "TAKEN@example.com".to_string(),
                passport_data: None,
                tax_number: None,
            })
            .await
            .unwrap_err();

        let err = Error::from(err);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.user_message(), "An account with this email address already exists");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_and_delete_user(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let user = create_test_user(&mut conn, "old@example.com", None, None).await;

        let mut repo = Users::new(&mut conn);
        let updated = repo
            .update(
                user.id,
                &UserUpdateDBRequest {
                    email: Some("new@example.com".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "new@example.com");

        assert!(repo.delete(user.id).await.unwrap());
        assert!(!repo.delete(user.id).await.unwrap());
        assert!(repo.get_by_id(user.id).await.unwrap().is_none());
        assert!(matches!(
            repo.update(user.id, &UserUpdateDBRequest::default()).await,
            Err(DbError::NotFound)
        ));
    }
}
