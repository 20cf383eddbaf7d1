//! Postgres-backed implementation of the identity-provider store.
//!
//! # Data model
//! - `clients`, `user_entities`, `test_accounts`: plain rows, JSONB payloads where the shape
//!   is owned by the model types.
//! - `entity_identities`: primary key `(user_id, client_id, real_id)` and a unique
//!   `(client_id, fake_id)`. Tags are a `TEXT[]` merged with a set union on conflict, so an
//!   existing row keeps its fake id and only gains tags.
//! - `grants` + `grant_entities`: scope and flags as `TEXT[]`, granted ids one row each.
//!   Merges lock the grant row, union arrays in SQL and insert ids with `ON CONFLICT DO
//!   NOTHING`, reporting back what was actually added.
//! - `user_statuses`: status, updated fields and a JSONB document of updated entities.
//!   Transitions lock the row with `FOR UPDATE`, check the source state and write in the
//!   same transaction; the update also re-checks the source state in its `WHERE` clause.
//! - `pending_notifications`: append-only, ordered by `seq` per `(client_id, user_id)`.
//!
//! `commit_mutation` runs the entity write and all of its bookkeeping in one transaction;
//! the statement helpers below take a `PgConnection` so the single-record operations and
//! the mutation share them.
//!
//! Every per-client table references `clients` with `ON DELETE CASCADE`, so deleting a
//! client removes everything it owns in one statement.
//!
//! # Operational notes
//! - Migrations run at connect time via `sqlx::migrate!("./migrations")`.
//! - Database URLs may contain credentials; never log them.
use super::{
    ClientStore, EntityMutation, EntityStore, EntityWrite, GrantStore, IdentityProviderStore,
    IdentityStore, NotificationStore, StatusStore, StoreError, StoreResult, TestAccountStore,
};
use crate::config::PostgresConfig;
use crate::model::scope::{parse_scope, parse_scope_flags};
use crate::model::{
    ClientRecord, DeliveryKey, EntityBody, EntityIdentityRecord, EntityKind, EntityRecord,
    GrantDelta, GrantMerge, GrantRecord, IdentityUpsert, PendingAppend, PendingEnvelope, Scope,
    StatusTransition, TestAccount, TransitionOutcome, UpdatedEntity, UserClientKey, UserStatus,
    UserStatusRecord,
};
use anyhow::anyhow;
use async_trait::async_trait;
use masque_common::{ClientId, EntityId, FakeId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

/// Durable store backed by Postgres.
///
/// # Example
/// ```rust,no_run
/// use identity::config::PostgresConfig;
/// use identity::store::postgres::PostgresStore;
///
/// async fn open(pg: PostgresConfig) {
///     let _ = PostgresStore::connect(&pg).await;
/// }
/// ```
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, size the pool and apply migrations before returning.
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool_options = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms));
        let pool = tokio::time::timeout(
            Duration::from_millis(pg.connect_timeout_ms),
            pool_options.connect_with(connect_options),
        )
        .await
        .map_err(|_| StoreError::Unexpected(anyhow!("timed out connecting to postgres")))??;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().is_some_and(|c| c == code);
    }
    false
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Unexpected(anyhow!("invalid {what} in database: {value}"))
}

fn parse_kind(value: &str) -> StoreResult<EntityKind> {
    EntityKind::parse(value).ok_or_else(|| corrupt("entity kind", value))
}

fn parse_tags(values: &[String]) -> StoreResult<BTreeSet<EntityKind>> {
    values.iter().map(|value| parse_kind(value)).collect()
}

fn strings<'a, I, T>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a T>,
    T: std::fmt::Display + 'a,
{
    values.into_iter().map(ToString::to_string).collect()
}

#[derive(Debug, FromRow)]
struct DbClient {
    client_id: Uuid,
    name: String,
    client_secret: String,
    update_notification_handler: Option<String>,
}

impl From<DbClient> for ClientRecord {
    fn from(row: DbClient) -> Self {
        ClientRecord {
            client_id: ClientId::from_uuid(row.client_id),
            name: row.name,
            client_secret: row.client_secret,
            update_notification_handler: row.update_notification_handler,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbEntity {
    entity_id: Uuid,
    user_id: Uuid,
    payload: Json<EntityBody>,
}

impl From<DbEntity> for EntityRecord {
    fn from(row: DbEntity) -> Self {
        EntityRecord {
            id: EntityId::from_uuid(row.entity_id),
            user_id: UserId::from_uuid(row.user_id),
            body: row.payload.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbIdentity {
    seq: i64,
    user_id: Uuid,
    client_id: Uuid,
    real_id: Uuid,
    fake_id: Uuid,
    tags: Vec<String>,
    uses_test_account: bool,
}

impl TryFrom<DbIdentity> for EntityIdentityRecord {
    type Error = StoreError;

    fn try_from(row: DbIdentity) -> StoreResult<Self> {
        Ok(EntityIdentityRecord {
            user_id: UserId::from_uuid(row.user_id),
            client_id: ClientId::from_uuid(row.client_id),
            real_id: EntityId::from_uuid(row.real_id),
            fake_id: FakeId::from_uuid(row.fake_id),
            tags: parse_tags(&row.tags)?,
            uses_test_account: row.uses_test_account,
        })
    }
}

const IDENTITY_COLUMNS: &str =
    "seq, user_id, client_id, real_id, fake_id, tags, uses_test_account";

#[derive(Debug, FromRow)]
struct DbGrant {
    user_id: Uuid,
    client_id: Uuid,
    scope: Vec<String>,
    scope_flags: Vec<String>,
    address_to_be_selected_first: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct DbGrantEntity {
    user_id: Uuid,
    client_id: Uuid,
    kind: String,
    entity_id: Uuid,
}

fn grant_from_db(row: DbGrant, entities: &[DbGrantEntity]) -> StoreResult<GrantRecord> {
    let key = UserClientKey::new(
        UserId::from_uuid(row.user_id),
        ClientId::from_uuid(row.client_id),
    );
    let mut grant = GrantRecord::new(key);
    grant.scope = parse_scope(&row.scope);
    grant.scope_flags = parse_scope_flags(&row.scope_flags);
    grant.address_to_be_selected_first = row.address_to_be_selected_first.map(EntityId::from_uuid);
    for entity in entities
        .iter()
        .filter(|e| e.user_id == row.user_id && e.client_id == row.client_id)
    {
        grant
            .entities
            .entry(parse_kind(&entity.kind)?)
            .or_default()
            .insert(EntityId::from_uuid(entity.entity_id));
    }
    Ok(grant)
}

async fn load_grant(
    conn: &mut PgConnection,
    key: UserClientKey,
) -> StoreResult<Option<GrantRecord>> {
    let row = sqlx::query_as::<_, DbGrant>(
        r#"SELECT user_id, client_id, scope, scope_flags, address_to_be_selected_first
           FROM grants WHERE user_id = $1 AND client_id = $2"#,
    )
    .bind(key.user_id.as_uuid())
    .bind(key.client_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let entities = sqlx::query_as::<_, DbGrantEntity>(
        r#"SELECT user_id, client_id, kind, entity_id FROM grant_entities
           WHERE user_id = $1 AND client_id = $2"#,
    )
    .bind(key.user_id.as_uuid())
    .bind(key.client_id.as_uuid())
    .fetch_all(&mut *conn)
    .await?;
    grant_from_db(row, &entities).map(Some)
}

/// JSONB shape of `user_statuses.updated_entities`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DbUpdatedEntities {
    #[serde(default)]
    emails: Vec<UpdatedEntity>,
    #[serde(default)]
    phone_numbers: Vec<UpdatedEntity>,
    #[serde(default)]
    addresses: Vec<UpdatedEntity>,
}

#[derive(Debug, FromRow)]
struct DbStatus {
    user_id: Uuid,
    client_id: Uuid,
    status: String,
    updated_fields: Vec<String>,
    updated_entities: Json<DbUpdatedEntities>,
    use_test_account: bool,
}

impl TryFrom<DbStatus> for UserStatusRecord {
    type Error = StoreError;

    fn try_from(row: DbStatus) -> StoreResult<Self> {
        let status =
            UserStatus::parse(&row.status).ok_or_else(|| corrupt("user status", &row.status))?;
        let updated = row.updated_entities.0;
        Ok(UserStatusRecord {
            user_id: UserId::from_uuid(row.user_id),
            client_id: ClientId::from_uuid(row.client_id),
            status,
            updated_fields: parse_scope(&row.updated_fields),
            updated_emails: updated.emails,
            updated_phone_numbers: updated.phone_numbers,
            updated_addresses: updated.addresses,
            use_test_account: row.use_test_account,
        })
    }
}

fn updated_entities_of(record: &UserStatusRecord) -> Json<DbUpdatedEntities> {
    Json(DbUpdatedEntities {
        emails: record.updated_emails.clone(),
        phone_numbers: record.updated_phone_numbers.clone(),
        addresses: record.updated_addresses.clone(),
    })
}

const STATUS_COLUMNS: &str =
    "user_id, client_id, status, updated_fields, updated_entities, use_test_account";

async fn write_entity(conn: &mut PgConnection, entity: &EntityRecord) -> StoreResult<()> {
    let result = sqlx::query(
        r#"INSERT INTO user_entities (entity_id, user_id, entity_type, payload)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (entity_id) DO UPDATE
           SET payload = EXCLUDED.payload, entity_type = EXCLUDED.entity_type, updated_at = now()
           WHERE user_entities.user_id = EXCLUDED.user_id"#,
    )
    .bind(entity.id.as_uuid())
    .bind(entity.user_id.as_uuid())
    .bind(entity.entity_type().as_str())
    .bind(Json(&entity.body))
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict("entity belongs to another user".into()));
    }
    Ok(())
}

async fn remove_entity(conn: &mut PgConnection, entity_id: EntityId) -> StoreResult<()> {
    let result = sqlx::query("DELETE FROM user_entities WHERE entity_id = $1")
        .bind(entity_id.as_uuid())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("entity".into()));
    }
    Ok(())
}

async fn insert_grant_entity(
    conn: &mut PgConnection,
    key: UserClientKey,
    kind: EntityKind,
    entity_id: EntityId,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"INSERT INTO grant_entities (user_id, client_id, kind, entity_id)
           VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"#,
    )
    .bind(key.user_id.as_uuid())
    .bind(key.client_id.as_uuid())
    .bind(kind.as_str())
    .bind(entity_id.as_uuid())
    .execute(&mut *conn)
    .await;
    match result {
        Ok(result) => Ok(result.rows_affected() == 1),
        // No grant row for the pair.
        Err(err) if is_foreign_key_violation(&err) => Err(StoreError::NotFound("grant".into())),
        Err(err) => Err(err.into()),
    }
}

async fn upsert_identity_row(
    conn: &mut PgConnection,
    upsert: &IdentityUpsert,
) -> StoreResult<EntityIdentityRecord> {
    // Insert-only: fake_id, uses_test_account. Merged: tags.
    let query = format!(
        r#"INSERT INTO entity_identities (user_id, client_id, real_id, fake_id, tags, uses_test_account)
           VALUES ($1, $2, $3, $4, ARRAY[$5]::TEXT[], $6)
           ON CONFLICT (user_id, client_id, real_id) DO UPDATE
           SET tags = ARRAY(
               SELECT DISTINCT t FROM unnest(entity_identities.tags || EXCLUDED.tags) AS t ORDER BY t
           )
           RETURNING {IDENTITY_COLUMNS}"#
    );
    let row = sqlx::query_as::<_, DbIdentity>(&query)
        .bind(upsert.key.user_id.as_uuid())
        .bind(upsert.key.client_id.as_uuid())
        .bind(upsert.real_id.as_uuid())
        .bind(upsert.fake_id.as_uuid())
        .bind(upsert.tag.as_str())
        .bind(upsert.uses_test_account)
        .fetch_one(&mut *conn)
        .await;
    match row {
        Ok(row) => EntityIdentityRecord::try_from(row),
        Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(
            "fake id already issued for client".into(),
        )),
        Err(err) => Err(err.into()),
    }
}

async fn tag_identity(
    conn: &mut PgConnection,
    key: UserClientKey,
    real_id: EntityId,
    tag: EntityKind,
) -> StoreResult<()> {
    sqlx::query(
        r#"UPDATE entity_identities
           SET tags = ARRAY(SELECT DISTINCT t FROM unnest(tags || ARRAY[$4]::TEXT[]) AS t ORDER BY t)
           WHERE user_id = $1 AND client_id = $2 AND real_id = $3"#,
    )
    .bind(key.user_id.as_uuid())
    .bind(key.client_id.as_uuid())
    .bind(real_id.as_uuid())
    .bind(tag.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_pending(conn: &mut PgConnection, batch: &[PendingAppend]) -> StoreResult<()> {
    for item in batch {
        sqlx::query(
            "INSERT INTO pending_notifications (client_id, user_id, payload) VALUES ($1, $2, $3)",
        )
        .bind(item.key.client_id.as_uuid())
        .bind(item.key.user_id.as_uuid())
        .bind(Json(&item.envelope))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn lock_status(
    conn: &mut PgConnection,
    key: UserClientKey,
) -> StoreResult<Option<UserStatusRecord>> {
    let query = format!(
        "SELECT {STATUS_COLUMNS} FROM user_statuses WHERE user_id = $1 AND client_id = $2 FOR UPDATE"
    );
    let row = sqlx::query_as::<_, DbStatus>(&query)
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(UserStatusRecord::try_from).transpose()
}

/// Write back a status record, provided its stored state is still one of `sources`.
async fn write_status(
    conn: &mut PgConnection,
    record: &UserStatusRecord,
    sources: &[String],
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"UPDATE user_statuses
           SET status = $3, updated_fields = $4, updated_entities = $5, updated_at = now()
           WHERE user_id = $1 AND client_id = $2 AND status = ANY($6)"#,
    )
    .bind(record.user_id.as_uuid())
    .bind(record.client_id.as_uuid())
    .bind(record.status.as_str())
    .bind(strings(&record.updated_fields))
    .bind(updated_entities_of(record))
    .bind(sources)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Conditional transition. The caller owns the transaction.
async fn transition_row(
    conn: &mut PgConnection,
    key: UserClientKey,
    transition: &StatusTransition,
) -> StoreResult<TransitionOutcome> {
    let Some(mut record) = lock_status(&mut *conn, key).await? else {
        return Ok(TransitionOutcome::Missing);
    };
    let current = record.status;
    if !record.apply(transition) {
        return Ok(TransitionOutcome::Dropped { current });
    }
    let sources: Vec<String> = transition
        .to
        .allowed_sources()
        .iter()
        .map(|status| status.as_str().to_string())
        .collect();
    if !write_status(&mut *conn, &record, &sources).await? {
        return Ok(TransitionOutcome::Dropped { current });
    }
    Ok(TransitionOutcome::Applied)
}

#[async_trait]
impl ClientStore for PostgresStore {
    async fn create_client(&self, client: ClientRecord) -> StoreResult<ClientRecord> {
        let insert = sqlx::query(
            r#"INSERT INTO clients (client_id, name, client_secret, update_notification_handler)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(client.client_id.as_uuid())
        .bind(&client.name)
        .bind(&client.client_secret)
        .bind(&client.update_notification_handler)
        .execute(&self.pool)
        .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(StoreError::Conflict("client exists".into()));
            }
            return Err(err.into());
        }
        Ok(client)
    }

    async fn get_client(&self, client_id: ClientId) -> StoreResult<ClientRecord> {
        sqlx::query_as::<_, DbClient>(
            r#"SELECT client_id, name, client_secret, update_notification_handler
               FROM clients WHERE client_id = $1"#,
        )
        .bind(client_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(ClientRecord::from)
        .ok_or_else(|| StoreError::NotFound("client".into()))
    }

    async fn list_clients(&self, client_ids: &[ClientId]) -> StoreResult<Vec<ClientRecord>> {
        let ids: Vec<Uuid> = client_ids.iter().map(ClientId::as_uuid).collect();
        let rows = sqlx::query_as::<_, DbClient>(
            r#"SELECT client_id, name, client_secret, update_notification_handler
               FROM clients WHERE client_id = ANY($1) ORDER BY client_id"#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ClientRecord::from).collect())
    }

    async fn delete_client(&self, client_id: ClientId) -> StoreResult<()> {
        // Per-client tables cascade from `clients`.
        let result = sqlx::query("DELETE FROM clients WHERE client_id = $1")
            .bind(client_id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("client".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn find_entity(&self, entity_id: EntityId) -> StoreResult<Option<EntityRecord>> {
        let row = sqlx::query_as::<_, DbEntity>(
            "SELECT entity_id, user_id, payload FROM user_entities WHERE entity_id = $1",
        )
        .bind(entity_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EntityRecord::from))
    }

    async fn commit_mutation(
        &self,
        mutation: EntityMutation,
    ) -> StoreResult<Vec<TransitionOutcome>> {
        let mut tx = self.pool.begin().await?;
        match &mutation.write {
            EntityWrite::Put(entity) => write_entity(&mut *tx, entity).await?,
            EntityWrite::Delete(entity_id) => remove_entity(&mut *tx, *entity_id).await?,
        }
        for addition in &mutation.grant_additions {
            insert_grant_entity(&mut *tx, addition.key, addition.kind, addition.entity_id).await?;
        }
        for upsert in &mutation.identities {
            upsert_identity_row(&mut *tx, upsert).await?;
        }
        for tag in &mutation.identity_tags {
            tag_identity(&mut *tx, tag.key, tag.real_id, tag.tag).await?;
        }
        insert_pending(&mut *tx, &mutation.pending).await?;
        let mut outcomes = Vec::with_capacity(mutation.transitions.len());
        for (key, transition) in &mutation.transitions {
            outcomes.push(transition_row(&mut *tx, *key, transition).await?);
        }
        tx.commit().await?;
        metrics::counter!("masque_pending_notifications_total")
            .increment(mutation.pending.len() as u64);
        Ok(outcomes)
    }
}

#[async_trait]
impl IdentityStore for PostgresStore {
    async fn upsert_identity(&self, upsert: IdentityUpsert) -> StoreResult<EntityIdentityRecord> {
        let mut conn = self.pool.acquire().await?;
        upsert_identity_row(&mut *conn, &upsert).await
    }

    async fn list_identities(&self, key: UserClientKey) -> StoreResult<Vec<EntityIdentityRecord>> {
        let query = format!(
            "SELECT {IDENTITY_COLUMNS} FROM entity_identities WHERE user_id = $1 AND client_id = $2 ORDER BY seq"
        );
        let rows = sqlx::query_as::<_, DbIdentity>(&query)
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EntityIdentityRecord::try_from).collect()
    }

    async fn delete_test_identities(
        &self,
        key: UserClientKey,
    ) -> StoreResult<Vec<EntityIdentityRecord>> {
        let query = format!(
            r#"DELETE FROM entity_identities
               WHERE user_id = $1 AND client_id = $2 AND uses_test_account
               RETURNING {IDENTITY_COLUMNS}"#
        );
        let mut rows = sqlx::query_as::<_, DbIdentity>(&query)
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(EntityIdentityRecord::try_from).collect()
    }

    async fn delete_identities(&self, key: UserClientKey) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM entity_identities WHERE user_id = $1 AND client_id = $2")
                .bind(key.user_id.as_uuid())
                .bind(key.client_id.as_uuid())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl GrantStore for PostgresStore {
    async fn merge_grant(&self, grant: GrantRecord) -> StoreResult<GrantMerge> {
        let key = grant.key();
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO grants (user_id, client_id) VALUES ($1, $2)
               ON CONFLICT (user_id, client_id) DO NOTHING"#,
        )
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .execute(&mut *tx)
        .await?;
        let created = inserted.rows_affected() == 1;

        // Lock the row so the reported delta matches what this merge added.
        let previous: Vec<String> = sqlx::query_scalar(
            "SELECT scope FROM grants WHERE user_id = $1 AND client_id = $2 FOR UPDATE",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let previous = parse_scope(&previous);

        sqlx::query(
            r#"UPDATE grants SET
                   scope = ARRAY(SELECT DISTINCT s FROM unnest(scope || $3::TEXT[]) AS s ORDER BY s),
                   scope_flags = ARRAY(SELECT DISTINCT f FROM unnest(scope_flags || $4::TEXT[]) AS f ORDER BY f),
                   address_to_be_selected_first = COALESCE($5, address_to_be_selected_first)
               WHERE user_id = $1 AND client_id = $2"#,
        )
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .bind(strings(&grant.scope))
        .bind(
            grant
                .scope_flags
                .iter()
                .map(|flag| flag.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(grant.address_to_be_selected_first.map(|id| id.as_uuid()))
        .execute(&mut *tx)
        .await?;

        let mut delta = GrantDelta {
            added_scope: grant.scope.difference(&previous).copied().collect(),
            ..GrantDelta::default()
        };
        for (kind, ids) in &grant.entities {
            for id in ids {
                let added = sqlx::query(
                    r#"INSERT INTO grant_entities (user_id, client_id, kind, entity_id)
                       VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"#,
                )
                .bind(key.user_id.as_uuid())
                .bind(key.client_id.as_uuid())
                .bind(kind.as_str())
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await?;
                if added.rows_affected() == 1 {
                    delta.added_entities.entry(*kind).or_default().insert(*id);
                }
            }
        }

        let merged = load_grant(&mut *tx, key)
            .await?
            .ok_or_else(|| StoreError::Unexpected(anyhow!("grant vanished during merge")))?;
        tx.commit().await?;
        let op = if created { "created" } else { "merged" };
        metrics::counter!("masque_grant_merges_total", "op" => op).increment(1);
        Ok(GrantMerge {
            grant: merged,
            created,
            delta,
        })
    }

    async fn find_grant(&self, key: UserClientKey) -> StoreResult<Option<GrantRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_grant(&mut *conn, key).await
    }

    async fn list_grants_for_user(&self, user_id: UserId) -> StoreResult<Vec<GrantRecord>> {
        let rows = sqlx::query_as::<_, DbGrant>(
            r#"SELECT user_id, client_id, scope, scope_flags, address_to_be_selected_first
               FROM grants WHERE user_id = $1 ORDER BY client_id"#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        let entities = sqlx::query_as::<_, DbGrantEntity>(
            "SELECT user_id, client_id, kind, entity_id FROM grant_entities WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| grant_from_db(row, &entities))
            .collect()
    }

    async fn delete_grant(&self, key: UserClientKey) -> StoreResult<()> {
        sqlx::query("DELETE FROM grants WHERE user_id = $1 AND client_id = $2")
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PostgresStore {
    async fn insert_status_if_absent(&self, record: UserStatusRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO user_statuses
                   (user_id, client_id, status, updated_fields, updated_entities, use_test_account)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (user_id, client_id) DO NOTHING"#,
        )
        .bind(record.user_id.as_uuid())
        .bind(record.client_id.as_uuid())
        .bind(record.status.as_str())
        .bind(strings(&record.updated_fields))
        .bind(updated_entities_of(&record))
        .bind(record.use_test_account)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_status(&self, key: UserClientKey) -> StoreResult<Option<UserStatusRecord>> {
        let query = format!(
            "SELECT {STATUS_COLUMNS} FROM user_statuses WHERE user_id = $1 AND client_id = $2"
        );
        let row = sqlx::query_as::<_, DbStatus>(&query)
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(UserStatusRecord::try_from).transpose()
    }

    async fn transition_status(
        &self,
        key: UserClientKey,
        transition: &StatusTransition,
    ) -> StoreResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = transition_row(&mut *tx, key, transition).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn reset_status(&self, key: UserClientKey, served: &Scope) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = lock_status(&mut *tx, key).await? else {
            return Err(StoreError::NotFound("status".into()));
        };
        let sources = vec![record.status.as_str().to_string()];
        record.mark_served(served);
        write_status(&mut *tx, &record, &sources).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_use_test_account(&self, key: UserClientKey, value: bool) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE user_statuses SET use_test_account = $3, updated_at = now()
               WHERE user_id = $1 AND client_id = $2"#,
        )
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .bind(value)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("status".into()));
        }
        Ok(())
    }

    async fn delete_status(&self, key: UserClientKey) -> StoreResult<()> {
        sqlx::query("DELETE FROM user_statuses WHERE user_id = $1 AND client_id = $2")
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn append_pending(&self, batch: Vec<PendingAppend>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_pending(&mut *tx, &batch).await?;
        tx.commit().await?;
        metrics::counter!("masque_pending_notifications_total").increment(batch.len() as u64);
        Ok(())
    }

    async fn list_pending(&self, key: DeliveryKey) -> StoreResult<Vec<PendingEnvelope>> {
        let rows: Vec<Json<PendingEnvelope>> = sqlx::query_scalar(
            r#"SELECT payload FROM pending_notifications
               WHERE client_id = $1 AND user_id = $2 ORDER BY seq"#,
        )
        .bind(key.client_id.as_uuid())
        .bind(key.user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}

#[async_trait]
impl TestAccountStore for PostgresStore {
    async fn put_test_account(&self, account: TestAccount) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO test_accounts (user_id, client_id, payload) VALUES ($1, $2, $3)
               ON CONFLICT (user_id, client_id) DO UPDATE SET payload = EXCLUDED.payload"#,
        )
        .bind(account.key.user_id.as_uuid())
        .bind(account.key.client_id.as_uuid())
        .bind(Json(&account))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_test_account(&self, key: UserClientKey) -> StoreResult<Option<TestAccount>> {
        let row: Option<Json<TestAccount>> = sqlx::query_scalar(
            "SELECT payload FROM test_accounts WHERE user_id = $1 AND client_id = $2",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.client_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.0))
    }

    async fn delete_test_account(&self, key: UserClientKey) -> StoreResult<()> {
        sqlx::query("DELETE FROM test_accounts WHERE user_id = $1 AND client_id = $2")
            .bind(key.user_id.as_uuid())
            .bind(key.client_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProviderStore for PostgresStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
