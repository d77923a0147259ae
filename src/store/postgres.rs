//! PostgreSQL Sosa store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Concurrency
//!
//! Every write transaction takes `pg_advisory_xact_lock` on a key derived
//! from the scope, so two computations on the same scope run one after the
//! other. The lock is released by commit or rollback.
//!
//! Sosa numbers are stored as `BIGINT`, which caps the index at generation 63.
//!
//! Deleting a scope keeps its `sosa_scopes` row with a `NULL` proband, so the
//! revision counter carries on when the scope is computed again.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row};

use super::{
    BirthYearStats, BoxedTransaction, GenerationSnapshot, MissingAncestor, ScopeState, SosaIndexStore,
    SosaTransaction,
};
use crate::canonical::scope_lock_key;
use crate::types::{FamilyId, IndividualId, Scope, SosaEntry, SosaNumber};

/// Highest generation representable with signed 64-bit numbers.
pub const POSTGRES_MAX_GENERATION: u32 = 63;

/// Schema statements, applied in order by [`PostgresSosaStore::create_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sosa_scopes (
        tree_id     BIGINT      NOT NULL,
        user_id     BIGINT      NOT NULL,
        proband_id  TEXT,
        revision    BIGINT      NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tree_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sosa_entries (
        tree_id           BIGINT  NOT NULL,
        user_id           BIGINT  NOT NULL,
        sosa              BIGINT  NOT NULL CHECK (sosa >= 1),
        individual_id     TEXT    NOT NULL,
        generation        INTEGER NOT NULL,
        birth_year        INTEGER,
        birth_year_est    INTEGER,
        death_year        INTEGER,
        death_year_est    INTEGER,
        parents_family_id TEXT,
        PRIMARY KEY (tree_id, user_id, sosa)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sosa_entries_individual_idx
        ON sosa_entries (tree_id, user_id, individual_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sosa_entries_generation_idx
        ON sosa_entries (tree_id, user_id, generation)
    "#,
];

/// Pool settings for the genealogy database.
///
/// A computation holds one connection for its whole transaction, so the pool
/// size bounds how many scopes can be recomputed at once.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string of the genealogy database.
    pub database_url: String,
    /// Upper bound on pooled connections, i.e. concurrent computations plus readers (default: 10).
    pub max_connections: u32,
    /// Connections kept open between computations (default: 2).
    pub min_connections: u32,
    /// Seconds to wait for a free connection before a computation fails (default: 10).
    pub connect_timeout_secs: u64,
    /// Seconds an unused connection stays open (default: 300).
    pub idle_timeout_secs: u64,
    /// Seconds before a connection is recycled (default: 1800).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Read pool settings from `DATABASE_URL` and the `DB_*` variables.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/genealogy".to_string()),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            max_lifetime_secs: std::env::var("DB_MAX_LIFETIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Occupancy of the store's connection pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Open connections.
    pub size: u32,
    /// Open connections not used by a computation or read.
    pub idle: usize,
    /// Configured `max_connections`.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The transaction was already committed.
    #[error("Transaction already committed for {0}")]
    TransactionClosed(Scope),
    /// A stored row cannot be mapped back to an entry.
    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

fn scope_binds(scope: &Scope) -> (i64, i64) {
    (i64::from(scope.tree_id.0), i64::from(scope.user_id.0))
}

fn generation_bind(generation: u32) -> i32 {
    i32::try_from(generation).unwrap_or(i32::MAX)
}

fn sosa_from_db(value: i64) -> Result<SosaNumber, PostgresError> {
    u64::try_from(value)
        .ok()
        .and_then(SosaNumber::new)
        .ok_or_else(|| PostgresError::InvalidRow(format!("sosa {}", value)))
}

fn sosa_to_db(sosa: SosaNumber) -> Option<i64> {
    i64::try_from(sosa.get()).ok()
}

fn parse_pair(row: &PgRow) -> Result<(SosaNumber, IndividualId), PostgresError> {
    let sosa: i64 = row.try_get("sosa")?;
    let individual: String = row.try_get("individual_id")?;
    Ok((sosa_from_db(sosa)?, IndividualId::new(individual)))
}

fn parse_numbers(rows: &[PgRow]) -> Result<BTreeMap<SosaNumber, u32>, PostgresError> {
    rows.iter()
        .map(|row| -> Result<(SosaNumber, u32), PostgresError> {
            let sosa: i64 = row.try_get("sosa")?;
            let sosa = sosa_from_db(sosa)?;
            Ok((sosa, sosa.generation()))
        })
        .collect()
}

/// Committed state, skipping the tombstone left by `delete_scope`.
async fn fetch_state(conn: &mut PgConnection, scope: &Scope) -> Result<Option<ScopeState>, PostgresError> {
    let (tree_id, user_id) = scope_binds(scope);
    let row = sqlx::query(
        r#"
        SELECT proband_id, revision, computed_at
        FROM sosa_scopes
        WHERE tree_id = $1 AND user_id = $2 AND proband_id IS NOT NULL
        "#,
    )
    .bind(tree_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await?;

    match row {
        Some(ref r) => {
            let proband: String = r.try_get("proband_id")?;
            let revision: i64 = r.try_get("revision")?;
            Ok(Some(ScopeState {
                proband: IndividualId::new(proband),
                revision: revision as u64,
                computed_at: r.try_get("computed_at")?,
            }))
        }
        None => Ok(None),
    }
}

async fn numbers_of(
    conn: &mut PgConnection,
    scope: &Scope,
    individual: &IndividualId,
) -> Result<BTreeMap<SosaNumber, u32>, PostgresError> {
    let (tree_id, user_id) = scope_binds(scope);
    let rows = sqlx::query(
        r#"
        SELECT sosa
        FROM sosa_entries
        WHERE tree_id = $1 AND user_id = $2 AND individual_id = $3
        ORDER BY sosa
        "#,
    )
    .bind(tree_id)
    .bind(user_id)
    .bind(individual.as_str())
    .fetch_all(conn)
    .await?;
    parse_numbers(&rows)
}

/// Columns of one upsert, deduplicated by number (last write wins).
#[derive(Debug, Default)]
struct UpsertColumns {
    sosa: Vec<i64>,
    individual_id: Vec<String>,
    generation: Vec<i32>,
    birth_year: Vec<Option<i32>>,
    birth_year_est: Vec<Option<i32>>,
    death_year: Vec<Option<i32>>,
    death_year_est: Vec<Option<i32>>,
    parents_family_id: Vec<Option<String>>,
}

impl UpsertColumns {
    fn from_batch(scope: &Scope, batch: &[SosaEntry], max_generation: u32) -> Result<Self, PostgresError> {
        let mut latest: BTreeMap<i64, &SosaEntry> = BTreeMap::new();
        for entry in batch {
            if entry.scope != *scope {
                return Err(PostgresError::InvalidRow(format!(
                    "entry for {} written through a transaction on {}",
                    entry.scope, scope
                )));
            }
            if entry.generation() > max_generation {
                continue;
            }
            if let Some(sosa) = sosa_to_db(entry.sosa) {
                latest.insert(sosa, entry);
            }
        }

        let mut columns = Self::default();
        for (sosa, entry) in latest {
            columns.sosa.push(sosa);
            columns.individual_id.push(entry.individual_id.to_string());
            columns.generation.push(generation_bind(entry.generation()));
            columns.birth_year.push(entry.birth_year);
            columns.birth_year_est.push(entry.birth_year_estimated);
            columns.death_year.push(entry.death_year);
            columns.death_year_est.push(entry.death_year_estimated);
            columns
                .parents_family_id
                .push(entry.parents_family_id.as_ref().map(|f| f.to_string()));
        }
        Ok(columns)
    }

    fn len(&self) -> usize {
        self.sosa.len()
    }
}

/// PostgreSQL Sosa store.
///
/// Reads go straight to the pool; writes go through [`PostgresTransaction`].
pub struct PostgresSosaStore {
    pool: PgPool,
}

impl PostgresSosaStore {
    /// Connect to the genealogy database.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Connecting sosa store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Connect using [`PostgresConfig::from_env`].
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, e.g. to run [`SCHEMA`] through a migration tool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether a connection can be acquired and answers a trivial query.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn create_schema(&self) -> Result<(), PostgresError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn count_where(&self, scope: &Scope, filter: &str, generation: u32) -> Result<u64, PostgresError> {
        let (tree_id, user_id) = scope_binds(scope);
        let sql = format!(
            "SELECT COUNT(*) AS n FROM sosa_entries WHERE tree_id = $1 AND user_id = $2 AND {}",
            filter
        );
        let n: i64 = sqlx::query(&sql)
            .bind(tree_id)
            .bind(user_id)
            .bind(generation_bind(generation))
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(n as u64)
    }
}

/// Write transaction on the PostgreSQL store.
pub struct PostgresTransaction {
    scope: Scope,
    state: Option<ScopeState>,
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, PostgresError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(PostgresError::TransactionClosed(self.scope)),
        }
    }
}

#[async_trait]
impl SosaTransaction for PostgresTransaction {
    type Error = PostgresError;

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn max_generation(&self) -> u32 {
        POSTGRES_MAX_GENERATION
    }

    fn state(&self) -> Option<&ScopeState> {
        self.state.as_ref()
    }

    async fn delete_all(&mut self) -> Result<u64, Self::Error> {
        let (tree_id, user_id) = scope_binds(&self.scope);
        let result = sqlx::query("DELETE FROM sosa_entries WHERE tree_id = $1 AND user_id = $2")
            .bind(tree_id)
            .bind(user_id)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_ancestors(&mut self, sosa: SosaNumber) -> Result<u64, Self::Error> {
        let Some(root) = sosa_to_db(sosa) else {
            return Ok(0);
        };
        let (tree_id, user_id) = scope_binds(&self.scope);
        let result = sqlx::query(
            r#"
            DELETE FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2
              AND generation >= $3
              AND (sosa >> (generation - $3)) = $4
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(sosa.generation()))
        .bind(root)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_or_update(&mut self, batch: &[SosaEntry]) -> Result<usize, Self::Error> {
        let columns = UpsertColumns::from_batch(&self.scope, batch, POSTGRES_MAX_GENERATION)?;
        if columns.len() == 0 {
            return Ok(0);
        }
        let (tree_id, user_id) = scope_binds(&self.scope);
        let written = columns.len();
        sqlx::query(
            r#"
            INSERT INTO sosa_entries (
                tree_id, user_id, sosa, individual_id, generation,
                birth_year, birth_year_est, death_year, death_year_est, parents_family_id
            )
            SELECT $1, $2, u.*
            FROM UNNEST(
                $3::BIGINT[], $4::TEXT[], $5::INTEGER[],
                $6::INTEGER[], $7::INTEGER[], $8::INTEGER[], $9::INTEGER[], $10::TEXT[]
            ) AS u
            ON CONFLICT (tree_id, user_id, sosa) DO UPDATE SET
                individual_id     = EXCLUDED.individual_id,
                generation        = EXCLUDED.generation,
                birth_year        = EXCLUDED.birth_year,
                birth_year_est    = EXCLUDED.birth_year_est,
                death_year        = EXCLUDED.death_year,
                death_year_est    = EXCLUDED.death_year_est,
                parents_family_id = EXCLUDED.parents_family_id
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(&columns.sosa)
        .bind(&columns.individual_id)
        .bind(&columns.generation)
        .bind(&columns.birth_year)
        .bind(&columns.birth_year_est)
        .bind(&columns.death_year)
        .bind(&columns.death_year_est)
        .bind(&columns.parents_family_id)
        .execute(self.conn()?)
        .await?;
        Ok(written)
    }

    async fn sosa_numbers_of(
        &mut self,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error> {
        let scope = self.scope;
        numbers_of(self.conn()?, &scope, individual).await
    }

    async fn descendants_of(&mut self, sosa: SosaNumber) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        let line: Vec<i64> = (1..sosa.generation())
            .filter_map(|generation| sosa.ancestor_at(generation))
            .filter_map(sosa_to_db)
            .collect();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let (tree_id, user_id) = scope_binds(&self.scope);
        let rows = sqlx::query(
            r#"
            SELECT sosa, individual_id
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2 AND sosa = ANY($3)
            ORDER BY sosa
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(&line)
        .fetch_all(self.conn()?)
        .await?;
        rows.iter().map(parse_pair).collect()
    }

    async fn commit(&mut self, proband: &IndividualId) -> Result<ScopeState, Self::Error> {
        let mut tx = self.tx.take().ok_or(PostgresError::TransactionClosed(self.scope))?;
        let (tree_id, user_id) = scope_binds(&self.scope);
        let row = sqlx::query(
            r#"
            INSERT INTO sosa_scopes (tree_id, user_id, proband_id, revision, computed_at)
            VALUES ($1, $2, $3, 1, now())
            ON CONFLICT (tree_id, user_id) DO UPDATE SET
                proband_id  = EXCLUDED.proband_id,
                revision    = sosa_scopes.revision + 1,
                computed_at = EXCLUDED.computed_at
            RETURNING revision, computed_at
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(proband.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let revision: i64 = row.try_get("revision")?;
        let computed_at: chrono::DateTime<chrono::Utc> = row.try_get("computed_at")?;
        tx.commit().await?;

        Ok(ScopeState {
            proband: proband.clone(),
            revision: revision as u64,
            computed_at,
        })
    }
}

#[async_trait]
impl SosaIndexStore for PostgresSosaStore {
    type Error = PostgresError;

    fn max_generation(&self) -> u32 {
        POSTGRES_MAX_GENERATION
    }

    async fn begin(&self, scope: &Scope) -> Result<BoxedTransaction<Self::Error>, Self::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(scope_lock_key(scope))
            .execute(&mut *tx)
            .await?;
        let state = fetch_state(&mut *tx, scope).await?;
        tracing::debug!(
            tree_id = scope.tree_id.0,
            user_id = scope.user_id.0,
            revision = state.as_ref().map(|s| s.revision),
            "Acquired scope lock"
        );
        Ok(Box::new(PostgresTransaction {
            scope: *scope,
            state,
            tx: Some(tx),
        }))
    }

    async fn scope_state(&self, scope: &Scope) -> Result<Option<ScopeState>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        fetch_state(&mut *conn, scope).await
    }

    async fn generation_summaries(&self, scope: &Scope) -> Result<Option<GenerationSnapshot>, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let Some(state) = fetch_state(&mut *tx, scope).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT generation,
                   COUNT(*) AS n,
                   MIN(birth_year) AS first,
                   MIN(COALESCE(birth_year, birth_year_est)) AS first_estimated,
                   AVG(COALESCE(birth_year, birth_year_est))::FLOAT8 AS avg,
                   MAX(birth_year) AS last,
                   MAX(COALESCE(birth_year, birth_year_est)) AS last_estimated
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2
            GROUP BY generation
            ORDER BY generation
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        let per_generation = rows
            .iter()
            .map(|row| -> Result<(u32, (u64, BirthYearStats)), PostgresError> {
                let generation: i32 = row.try_get("generation")?;
                let n: i64 = row.try_get("n")?;
                let birth_years = BirthYearStats {
                    first: row.try_get("first")?,
                    first_estimated: row.try_get("first_estimated")?,
                    avg: row.try_get("avg")?,
                    last: row.try_get("last")?,
                    last_estimated: row.try_get("last_estimated")?,
                };
                Ok((generation.max(0) as u32, (n as u64, birth_years)))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let firsts = sqlx::query(
            r#"
            SELECT MIN(generation) AS first_generation
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2
            GROUP BY individual_id
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        let first_generations = firsts
            .iter()
            .map(|row| -> Result<u32, PostgresError> {
                let generation: i32 = row.try_get("first_generation")?;
                Ok(generation.max(0) as u32)
            })
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit().await?;

        Ok(Some(GenerationSnapshot::assemble(
            state.revision,
            per_generation,
            first_generations,
        )))
    }

    async fn sosa_numbers_of(
        &self,
        scope: &Scope,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        numbers_of(&mut conn, scope, individual).await
    }

    async fn list_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, IndividualId>, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let rows = sqlx::query(
            r#"
            SELECT sosa, individual_id
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2 AND generation = $3
            ORDER BY sosa
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(generation))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_pair).collect()
    }

    async fn family_pairs_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, FamilyId>, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let rows = sqlx::query(
            r#"
            SELECT f.sosa, c.parents_family_id
            FROM sosa_entries f
            JOIN sosa_entries m
              ON m.tree_id = f.tree_id AND m.user_id = f.user_id AND m.sosa = f.sosa + 1
            JOIN sosa_entries c
              ON c.tree_id = f.tree_id AND c.user_id = f.user_id AND c.sosa = f.sosa / 2
            WHERE f.tree_id = $1 AND f.user_id = $2 AND f.generation = $3
              AND f.sosa % 2 = 0
              AND c.parents_family_id IS NOT NULL
            ORDER BY f.sosa
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(generation))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(SosaNumber, FamilyId), PostgresError> {
                let sosa: i64 = row.try_get("sosa")?;
                let family: String = row.try_get("parents_family_id")?;
                Ok((sosa_from_db(sosa)?, FamilyId::new(family)))
            })
            .collect()
    }

    async fn missing_parents_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<MissingAncestor>, Self::Error> {
        if generation < 2 {
            return Ok(Vec::new());
        }
        let children = self.list_at_generation(scope, generation - 1).await?;
        if children.is_empty() {
            return Ok(Vec::new());
        }
        let parents: HashSet<SosaNumber> = self
            .list_at_generation(scope, generation)
            .await?
            .into_keys()
            .collect();
        let has = |sosa: Option<SosaNumber>| sosa.map(|s| parents.contains(&s)).unwrap_or(false);

        Ok(children
            .into_iter()
            .filter_map(|(sosa, individual_id)| {
                let has_father = has(sosa.father());
                let has_mother = has(sosa.mother());
                (!has_father || !has_mother).then_some(MissingAncestor {
                    sosa,
                    individual_id,
                    has_father,
                    has_mother,
                })
            })
            .collect())
    }

    async fn last_generation(&self, scope: &Scope) -> Result<u32, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let last: i32 = sqlx::query(
            r#"
            SELECT COALESCE(MAX(generation), 0) AS last
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("last")?;
        Ok(last.max(0) as u32)
    }

    async fn count(&self, scope: &Scope) -> Result<u64, Self::Error> {
        self.count_where(scope, "generation >= $3", 0).await
    }

    async fn count_at_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error> {
        self.count_where(scope, "generation = $3", generation).await
    }

    async fn count_up_to_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error> {
        self.count_where(scope, "generation <= $3", generation).await
    }

    async fn distinct_individual_count(&self, scope: &Scope) -> Result<u64, Self::Error> {
        self.distinct_individual_count_up_to_generation(scope, u32::MAX)
            .await
    }

    async fn distinct_individual_count_up_to_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<u64, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let n: i64 = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT individual_id) AS n
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2 AND generation <= $3
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(generation))
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(n as u64)
    }

    async fn birth_year_stats(&self, scope: &Scope, generation: u32) -> Result<BirthYearStats, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let row = sqlx::query(
            r#"
            SELECT MIN(birth_year) AS first,
                   MIN(COALESCE(birth_year, birth_year_est)) AS first_estimated,
                   AVG(COALESCE(birth_year, birth_year_est))::FLOAT8 AS avg,
                   MAX(birth_year) AS last,
                   MAX(COALESCE(birth_year, birth_year_est)) AS last_estimated
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2 AND generation = $3
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(generation))
        .fetch_one(&self.pool)
        .await?;
        Ok(BirthYearStats {
            first: row.try_get("first")?,
            first_estimated: row.try_get("first_estimated")?,
            avg: row.try_get("avg")?,
            last: row.try_get("last")?,
            last_estimated: row.try_get("last_estimated")?,
        })
    }

    async fn ancestor_pairs_from_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let rows = sqlx::query(
            r#"
            SELECT sosa, individual_id
            FROM sosa_entries
            WHERE tree_id = $1 AND user_id = $2 AND generation >= $3
            ORDER BY sosa
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .bind(generation_bind(generation))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_pair).collect()
    }

    async fn root_ancestors(&self, scope: &Scope) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let rows = sqlx::query(
            r#"
            SELECT e.sosa, e.individual_id
            FROM sosa_entries e
            WHERE e.tree_id = $1 AND e.user_id = $2
              AND NOT EXISTS (
                  SELECT 1 FROM sosa_entries p
                  WHERE p.tree_id = e.tree_id AND p.user_id = e.user_id
                    AND p.generation = e.generation + 1
                    AND p.sosa / 2 = e.sosa
              )
            ORDER BY e.sosa
            "#,
        )
        .bind(tree_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_pair).collect()
    }

    async fn delete_scope(&self, scope: &Scope) -> Result<u64, Self::Error> {
        let (tree_id, user_id) = scope_binds(scope);
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(scope_lock_key(scope))
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM sosa_entries WHERE tree_id = $1 AND user_id = $2")
            .bind(tree_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "UPDATE sosa_scopes SET proband_id = NULL, computed_at = now() WHERE tree_id = $1 AND user_id = $2",
        )
        .bind(tree_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::YearRecord;

    fn entry(scope: Scope, sosa: u64, id: &str) -> SosaEntry {
        SosaEntry::new(scope, SosaNumber::new(sosa).unwrap(), IndividualId::new(id))
    }

    #[test]
    fn test_sosa_conversion() {
        assert_eq!(sosa_from_db(6).unwrap().get(), 6);
        assert!(sosa_from_db(0).is_err());
        assert!(sosa_from_db(-4).is_err());
        assert_eq!(sosa_to_db(SosaNumber::new(u64::MAX).unwrap()), None);
    }

    #[test]
    fn test_upsert_columns_dedupe_and_cap() {
        let scope = Scope::new(1, 1);
        let batch = vec![
            entry(scope, 2, "F"),
            entry(scope, 3, "M").with_birth(YearRecord::estimated(1950)),
            entry(scope, 2, "F2"),
            entry(scope, 1 << 63, "deep"),
        ];
        let columns = UpsertColumns::from_batch(&scope, &batch, POSTGRES_MAX_GENERATION).unwrap();
        assert_eq!(columns.sosa, vec![2, 3]);
        assert_eq!(columns.individual_id, vec!["F2".to_string(), "M".to_string()]);
        assert_eq!(columns.birth_year_est, vec![None, Some(1950)]);
        assert_eq!(columns.generation, vec![2, 2]);
    }

    #[test]
    fn test_upsert_columns_reject_other_scope() {
        let batch = vec![entry(Scope::new(9, 9), 1, "P")];
        assert!(UpsertColumns::from_batch(&Scope::new(1, 1), &batch, 63).is_err());
    }

    #[test]
    fn test_schema_declares_keys() {
        assert!(SCHEMA[1].contains("PRIMARY KEY (tree_id, user_id, sosa)"));
        assert!(SCHEMA[2].contains("(tree_id, user_id, individual_id)"));
    }

    #[test]
    fn test_scope_row_can_be_tombstoned() {
        // A deleted scope keeps its revision row with a NULL proband.
        assert!(SCHEMA[0].contains("proband_id  TEXT,"));
    }
}
