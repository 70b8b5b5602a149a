//! Database repository for registration documents.

use std::collections::{BTreeSet, HashMap};

use sqlx::{Connection, PgConnection};
use tracing::{debug, instrument};

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{lock_registrant, repository::Repository},
        models::registration_docs::{
            RegistrationDoc, RegistrationDocCreateDBRequest, RegistrationDocDBResponse, RegistrationDocFilter,
            RegistrationDocUpdateDBRequest,
        },
    },
    registry::AddressRegistry,
    types::{RegistrantKind, RegistrationNumber, mask_key},
    validation,
};

pub struct RegistrationDocs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> RegistrationDocs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Distinct addresses of the documents owned by a registrant, locking those documents for
    /// the rest of the transaction.
    #[instrument(skip(self, owner), fields(owner = %mask_key(owner)), err)]
    pub async fn addresses_owned_by(&mut self, owner: &str) -> Result<BTreeSet<String>> {
        let addresses = sqlx::query_scalar::<_, String>("SELECT address FROM registration_docs WHERE document_owner = $1 FOR UPDATE")
            .bind(owner)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(addresses.into_iter().collect())
    }

    /// Point every document owned by `owner` at `address`. The caller is responsible for the
    /// registry side of the move.
    #[instrument(skip(self, owner), fields(owner = %mask_key(owner)), err)]
    pub async fn reassign_address(&mut self, owner: &str, address: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE registration_docs SET address = $2 WHERE document_owner = $1 AND address <> $2")
            .bind(owner)
            .bind(address)
            .execute(&mut *self.db)
            .await?;
        if result.rows_affected() > 0 {
            debug!(documents = result.rows_affected(), "Propagated registrant address to documents");
        }
        Ok(result.rows_affected())
    }

    /// Whether `owner` names a natural person or a legal entity. The matching row stays
    /// share-locked until the transaction ends.
    pub async fn registrant_exists(&mut self, owner: &str) -> Result<bool> {
        for kind in RegistrantKind::ALL {
            if lock_registrant(&mut *self.db, kind, owner).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn require_registrant(&mut self, owner: &str) -> Result<()> {
        if !self.registrant_exists(owner).await? {
            return Err(DbError::validation("document_owner", "no registrant with this passport or tax number"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for RegistrationDocs<'c> {
    type CreateRequest = RegistrationDocCreateDBRequest;
    type UpdateRequest = RegistrationDocUpdateDBRequest;
    type Response = RegistrationDocDBResponse;
    type Id = RegistrationNumber;
    type Filter = RegistrationDocFilter;

    #[instrument(skip(self, request), fields(registration_number = %request.registration_number), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let registration_number = validation::document_field("registration_number", &request.registration_number)?;
        let address = validation::address(&request.address)?;
        let pts = validation::document_field("pts", &request.pts)?;
        let sts = validation::document_field("sts", &request.sts)?;
        let document_owner = validation::document_owner(&request.document_owner)?;

        let mut tx = self.db.begin().await?;

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM registration_docs WHERE registration_number = $1)")
                .bind(&registration_number)
                .fetch_one(&mut *tx)
                .await?;
        if exists {
            return Err(DbError::duplicate_key("registration_docs", &registration_number));
        }

        RegistrationDocs::new(&mut tx).require_registrant(&document_owner).await?;
        AddressRegistry::new(&mut tx).ensure_owner(&address).await?;

        let doc = sqlx::query_as::<_, RegistrationDoc>(
            r#"
            INSERT INTO registration_docs (registration_number, address, pts, sts, registration_date, document_owner)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&registration_number)
        .bind(&address)
        .bind(&pts)
        .bind(&sts)
        .bind(request.registration_date)
        .bind(&document_owner)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(doc)
    }

    #[instrument(skip(self), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let doc = sqlx::query_as::<_, RegistrationDoc>("SELECT * FROM registration_docs WHERE registration_number = $1")
            .bind(&id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(doc)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let docs = sqlx::query_as::<_, RegistrationDoc>("SELECT * FROM registration_docs WHERE registration_number = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(docs.into_iter().map(|d| (d.registration_number.clone(), d)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let docs = sqlx::query_as::<_, RegistrationDoc>(
            r#"
            SELECT * FROM registration_docs
            WHERE ($1::text IS NULL OR document_owner = $1)
            ORDER BY created_at DESC, registration_number
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&filter.document_owner)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(docs)
    }

    #[instrument(skip(self), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let Some(address) =
            sqlx::query_scalar::<_, String>("DELETE FROM registration_docs WHERE registration_number = $1 RETURNING address")
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

    #[instrument(skip(self, request), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let address = request.address.as_deref().map(validation::address).transpose()?;
        let pts = request.pts.as_deref().map(|v| validation::document_field("pts", v)).transpose()?;
        let sts = request.sts.as_deref().map(|v| validation::document_field("sts", v)).transpose()?;
        let document_owner = request.document_owner.as_deref().map(validation::document_owner).transpose()?;

        let mut tx = self.db.begin().await?;

        let current =
            sqlx::query_as::<_, RegistrationDoc>("SELECT * FROM registration_docs WHERE registration_number = $1 FOR UPDATE")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(DbError::NotFound)?;

        if let Some(owner) = document_owner.as_deref().filter(|o| *o != current.document_owner) {
            RegistrationDocs::new(&mut tx).require_registrant(owner).await?;
        }

        let new_address = address.filter(|a| *a != current.address);
        let previous = BTreeSet::from([current.address.clone()]);
        if let Some(next) = &new_address {
            AddressRegistry::new(&mut tx).begin_move(&previous, next).await?;
        }

        let doc = sqlx::query_as::<_, RegistrationDoc>(
            r#"
            UPDATE registration_docs SET
                address = COALESCE($2, address),
                pts = COALESCE($3, pts),
                sts = COALESCE($4, sts),
                registration_date = COALESCE($5, registration_date),
                document_owner = COALESCE($6, document_owner)
            WHERE registration_number = $1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new_address)
        .bind(&pts)
        .bind(&sts)
        .bind(request.registration_date)
        .bind(&document_owner)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(next) = &new_address {
            AddressRegistry::new(&mut tx).finish_move(&previous, next).await?;
        }

        tx.commit().await?;
        Ok(doc)
    }
}
