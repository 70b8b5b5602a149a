//! Database repository for legal entities.

use std::collections::HashMap;

use sqlx::{Connection, PgConnection};
use tracing::instrument;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{differs, registration_docs::RegistrationDocs, repository::Repository},
        models::legal_entities::{
            LegalEntity, LegalEntityCreateDBRequest, LegalEntityDBResponse, LegalEntityFilter, LegalEntityUpdateDBRequest,
        },
    },
    registry::AddressRegistry,
    types::{Operation, RegistrantKind, TaxNumber, mask_key},
    validation,
};

pub struct LegalEntities<'c> {
    db: &'c mut PgConnection,
}

impl<'c> LegalEntities<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for LegalEntities<'c> {
    type CreateRequest = LegalEntityCreateDBRequest;
    type UpdateRequest = LegalEntityUpdateDBRequest;
    type Response = LegalEntityDBResponse;
    type Id = TaxNumber;
    type Filter = LegalEntityFilter;

    #[instrument(skip(self, request), fields(tax_number = %mask_key(&request.tax_number)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let tax_number = validation::tax_number(&request.tax_number)?;
        let address = validation::address(&request.address)?;
        let company_name = validation::name("company_name", &request.company_name)?;

        let mut tx = self.db.begin().await?;

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM legal_entities WHERE tax_number = $1)")
            .bind(&tax_number)
            .fetch_one(&mut *tx)
            .await?;
        if exists {
            return Err(DbError::duplicate_key("legal_entities", &tax_number));
        }

        AddressRegistry::new(&mut tx).ensure_owner(&address).await?;

        let entity = sqlx::query_as::<_, LegalEntity>(
            "INSERT INTO legal_entities (tax_number, address, company_name) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&tax_number)
        .bind(&address)
        .bind(&company_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entity)
    }

    #[instrument(skip(self, id), fields(tax_number = %mask_key(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let entity = sqlx::query_as::<_, LegalEntity>("SELECT * FROM legal_entities WHERE tax_number = $1")
            .bind(&id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(entity)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let entities = sqlx::query_as::<_, LegalEntity>("SELECT * FROM legal_entities WHERE tax_number = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(entities.into_iter().map(|e| (e.tax_number.clone(), e)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let entities = sqlx::query_as::<_, LegalEntity>(
            r#"
            SELECT * FROM legal_entities
            WHERE ($1::text IS NULL OR address = $1)
            ORDER BY created_at DESC, tax_number
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&filter.address)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(entities)
    }

    #[instrument(skip(self, id), fields(tax_number = %mask_key(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let Some(address) = sqlx::query_scalar::<_, String>("DELETE FROM legal_entities WHERE tax_number = $1 RETURNING address")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };

        AddressRegistry::new(&mut tx).reconcile_address(&address).await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, id, request), fields(tax_number = %mask_key(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let address = request.address.as_deref().map(validation::address).transpose()?;
        let company_name = request
            .company_name
            .as_deref()
            .map(|v| validation::name("company_name", v))
            .transpose()?;

        let mut tx = self.db.begin().await?;

        let current = sqlx::query_as::<_, LegalEntity>("SELECT * FROM legal_entities WHERE tax_number = $1 FOR UPDATE")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

        let document_addresses = RegistrationDocs::new(&mut tx).addresses_owned_by(&id).await?;

        if differs(company_name.as_deref(), &current.company_name) && !document_addresses.is_empty() {
            return Err(DbError::ProtectedEntity {
                operation: Operation::Update,
                reason: "company name cannot change while the entity owns registration documents".to_string(),
                entity_type: RegistrantKind::LegalEntity.to_string(),
                entity_id: Some(mask_key(&id)),
            });
        }

        let new_address = address.filter(|a| *a != current.address);
        let mut previous = document_addresses;
        previous.insert(current.address.clone());

        if let Some(next) = &new_address {
            AddressRegistry::new(&mut tx).begin_move(&previous, next).await?;
        }

        let entity = sqlx::query_as::<_, LegalEntity>(
            r#"
            UPDATE legal_entities SET
                address = COALESCE($2, address),
                company_name = COALESCE($3, company_name)
            WHERE tax_number = $1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new_address)
        .bind(&company_name)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(next) = &new_address {
            RegistrationDocs::new(&mut tx).reassign_address(&id, next).await?;
            AddressRegistry::new(&mut tx).finish_move(&previous, next).await?;
        }

        tx.commit().await?;
        Ok(entity)
    }
}
