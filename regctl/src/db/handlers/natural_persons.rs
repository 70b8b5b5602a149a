//! Database repository for natural persons.

use std::collections::HashMap;

use sqlx::{Connection, PgConnection};
use tracing::instrument;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{differs, registration_docs::RegistrationDocs, repository::Repository},
        models::natural_persons::{
            NaturalPerson, NaturalPersonCreateDBRequest, NaturalPersonDBResponse, NaturalPersonFilter, NaturalPersonUpdateDBRequest,
        },
    },
    registry::AddressRegistry,
    types::{Operation, PassportData, RegistrantKind, mask_key},
    validation,
};

pub struct NaturalPersons<'c> {
    db: &'c mut PgConnection,
}

impl<'c> NaturalPersons<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for NaturalPersons<'c> {
    type CreateRequest = NaturalPersonCreateDBRequest;
    type UpdateRequest = NaturalPersonUpdateDBRequest;
    type Response = NaturalPersonDBResponse;
    type Id = PassportData;
    type Filter = NaturalPersonFilter;

    #[instrument(skip(self, request), fields(passport = %mask_key(&request.passport_data)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let passport_data = validation::passport_data(&request.passport_data)?;
        let address = validation::address(&request.address)?;
        let last_name = validation::name("last_name", &request.last_name)?;
        let first_name = validation::name("first_name", &request.first_name)?;
        let patronymic = request
            .patronymic
            .as_deref()
            .map(|p| validation::name("patronymic", p))
            .transpose()?;

        let mut tx = self.db.begin().await?;

        // Reject duplicates before the registry is touched
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM natural_persons WHERE passport_data = $1)")
            .bind(&passport_data)
            .fetch_one(&mut *tx)
            .await?;
        if exists {
            return Err(DbError::duplicate_key("natural_persons", &passport_data));
        }

        AddressRegistry::new(&mut tx).ensure_owner(&address).await?;

        let person = sqlx::query_as::<_, NaturalPerson>(
            r#"
            INSERT INTO natural_persons (passport_data, address, last_name, first_name, patronymic)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&passport_data)
        .bind(&address)
        .bind(&last_name)
        .bind(&first_name)
        .bind(patronymic.is_some())
        .bind(patronymic.flatten())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(person)
    }

    #[instrument(skip(self, id), fields(passport = %mask_key(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let person = sqlx::query_as::<_, NaturalPerson>("SELECT * FROM natural_persons WHERE passport_data = $1")
            .bind(&id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(person)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let persons = sqlx::query_as::<_, NaturalPerson>("SELECT * FROM natural_persons WHERE passport_data = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(persons.into_iter().map(|p| (p.passport_data.clone(), p)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let persons = sqlx::query_as::<_, NaturalPerson>(
            r#"
            SELECT * FROM natural_persons
            WHERE ($1::text IS NULL OR address = $1)
            ORDER BY created_at DESC, passport_data
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&filter.address)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(persons)
    }

    #[instrument(skip(self, id), fields(passport = %mask_key(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let address = sqlx::query_scalar::<_, String>("DELETE FROM natural_persons WHERE passport_data = $1 RETURNING address")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(address) = address else {
            return Ok(false);
        };

        // Registration documents owned by this person keep the owner alive
        AddressRegistry::new(&mut tx).reconcile_address(&address).await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, id, request), fields(passport = %mask_key(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let address = request.address.as_deref().map(validation::address).transpose()?;
        let last_name = request
            .last_name
            .as_deref()
            .map(|v| validation::name("last_name", v))
            .transpose()?;
        let first_name = request
            .first_name
            .as_deref()
            .map(|v| validation::name("first_name", v))
            .transpose()?;
        let patronymic = match &request.patronymic {
            Some(Some(v)) => Some(Some(validation::name("patronymic", v)?)),
            Some(None) => Some(None),
            None => None,
        };

        let mut tx = self.db.begin().await?;

        let current = sqlx::query_as::<_, NaturalPerson>("SELECT * FROM natural_persons WHERE passport_data = $1 FOR UPDATE")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

        let document_addresses = RegistrationDocs::new(&mut tx).addresses_owned_by(&id).await?;

        let renames = differs(last_name.as_deref(), &current.last_name)
            || differs(first_name.as_deref(), &current.first_name)
            || patronymic
                .as_ref()
                .is_some_and(|p| p.as_deref() != current.patronymic.as_deref());
        if renames && !document_addresses.is_empty() {
            return Err(DbError::ProtectedEntity {
                operation: Operation::Update,
                reason: "name fields cannot change while the person owns registration documents".to_string(),
                entity_type: RegistrantKind::NaturalPerson.to_string(),
                entity_id: Some(mask_key(&id)),
            });
        }

        let new_address = address.filter(|a| *a != current.address);
        let mut previous = document_addresses;
        previous.insert(current.address.clone());

        if let Some(next) = &new_address {
            AddressRegistry::new(&mut tx).begin_move(&previous, next).await?;
        }

        let person = sqlx::query_as::<_, NaturalPerson>(
            r#"
            UPDATE natural_persons SET
                address = COALESCE($2, address),
                last_name = COALESCE($3, last_name),
                first_name = COALESCE($4, first_name),
                patronymic = CASE WHEN $5 THEN $6 ELSE patronymic END
            WHERE passport_data = $1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new_address)
        .bind(&last_name)
        .bind(&first_name)
        .bind(patronymic.is_some())
        .bind(patronymic.flatten())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(next) = &new_address {
            RegistrationDocs::new(&mut tx).reassign_address(&id, next).await?;
            AddressRegistry::new(&mut tx).finish_move(&previous, next).await?;
        }

        tx.commit().await?;
        Ok(person)
    }
}
