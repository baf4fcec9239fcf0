//! PostgreSQL stores for the treasury driver.
//!
//! Implements [`RequestStore`] for both request kinds and [`WatermarkStore`]
//! on top of a `sqlx` pool.
//!
//! # Features
//!
//! - Insert-or-refresh keyed by transaction hash
//! - Conditional state updates following the request state machine
//! - Read-committed write transactions, retried on serialization failure
//! - Token amounts kept as `NUMERIC` without precision loss
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE stakes (
//!     hash TEXT PRIMARY KEY,
//!     address TEXT NOT NULL,
//!     round_since BIGINT NOT NULL,
//!
//!     state TEXT NOT NULL DEFAULT 'new',
//!     retried INTEGER NOT NULL DEFAULT 0,
//!     info JSONB NOT NULL,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     retried_at TIMESTAMPTZ,
//!     sent_at TIMESTAMPTZ,
//!     verified_at TIMESTAMPTZ
//! );
//!
//! CREATE TABLE unstakes (
//!     hash TEXT PRIMARY KEY,
//!     address TEXT NOT NULL,
//!     tokens NUMERIC NOT NULL,
//!
//!     state TEXT NOT NULL DEFAULT 'new',
//!     retried INTEGER NOT NULL DEFAULT 0,
//!     info JSONB NOT NULL,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     retried_at TIMESTAMPTZ,
//!     sent_at TIMESTAMPTZ,
//!     verified_at TIMESTAMPTZ
//! );
//!
//! CREATE INDEX idx_stakes_state ON stakes (state, retried);
//! CREATE INDEX idx_unstakes_state ON unstakes (state, retried);
//!
//! CREATE TABLE memos (
//!     key TEXT PRIMARY KEY,
//!     memo JSONB NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use treasury_driver_postgres::{PgStakeStore, PgUnstakeStore, PgWatermarkStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/treasury").await?;
//!
//! let driver = DriverBuilder::new(settings)
//!     .with_stake_store(Arc::new(PgStakeStore::new(pool.clone())))
//!     .with_unstake_store(Arc::new(PgUnstakeStore::new(pool.clone())))
//!     .with_watermark_store(Arc::new(PgWatermarkStore::new(pool)))
//!     // ...
//!     .build()?;
//! ```

use std::future::Future;
use std::marker::PhantomData;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use treasury_driver::{
    ExtractionMemo, Payload, Request, RequestState, RequestStore, Stake, TxInfo, Unstake,
    WatermarkStore, EXTRACTION_MEMO_KEY,
};

/// Attempts per write before a serialization failure is reported.
const MAX_ATTEMPTS: u32 = 3;

const SERIALIZATION_FAILURE: &str = "40001";

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(SERIALIZATION_FAILURE),
        _ => false,
    }
}

/// Runs `op` again while it fails with a serialization failure.
async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if is_serialization_failure(&err) && attempt < MAX_ATTEMPTS => {
                warn!(attempt, "serialization failure, retrying transaction");
                attempt += 1;
            }
            result => return result,
        }
    }
}

async fn begin_read_committed(pool: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// How a payload maps onto its table.
pub trait PgPayload: Payload {
    const TABLE: &'static str;
    const COLUMN: &'static str;
    const SQL_TYPE: &'static str;

    /// Text form bound as a parameter and cast to `SQL_TYPE`.
    fn to_sql_text(&self) -> String;

    fn from_sql_text(text: &str) -> Result<Self>;
}

impl PgPayload for Stake {
    const TABLE: &'static str = "stakes";
    const COLUMN: &'static str = "round_since";
    const SQL_TYPE: &'static str = "bigint";

    fn to_sql_text(&self) -> String {
        self.round_since.to_string()
    }

    fn from_sql_text(text: &str) -> Result<Self> {
        let round_since = text
            .parse()
            .with_context(|| format!("invalid round_since '{text}'"))?;
        Ok(Stake { round_since })
    }
}

impl PgPayload for Unstake {
    const TABLE: &'static str = "unstakes";
    const COLUMN: &'static str = "tokens";
    const SQL_TYPE: &'static str = "numeric";

    fn to_sql_text(&self) -> String {
        self.tokens.to_string()
    }

    fn from_sql_text(text: &str) -> Result<Self> {
        let tokens = text
            .parse::<BigUint>()
            .with_context(|| format!("invalid token amount '{text}'"))?;
        Ok(Unstake { tokens })
    }
}

#[derive(Debug, Clone)]
struct Statements {
    insert: String,
    find: String,
    find_triable: String,
    find_verifiable: String,
    set_state: String,
    set_retrying: String,
    set_sent: String,
    set_verified: String,
}

impl Statements {
    fn for_payload<P: PgPayload>() -> Self {
        let table = P::TABLE;
        let columns = format!(
            "hash, address, {}::text AS payload, state, retried, info, \
             created_at, retried_at, sent_at, verified_at",
            P::COLUMN
        );
        Self {
            insert: format!(
                "INSERT INTO {table} (hash, address, {column}, state, retried, info, created_at) \
                 VALUES ($1, $2, $3::{ty}, 'new', 0, $4, NOW()) \
                 ON CONFLICT (hash) DO UPDATE SET info = EXCLUDED.info \
                 RETURNING {columns}",
                column = P::COLUMN,
                ty = P::SQL_TYPE,
            ),
            find: format!("SELECT {columns} FROM {table} WHERE hash = $1"),
            find_triable: format!(
                "SELECT {columns} FROM {table} \
                 WHERE state = ANY($1) AND retried < $2 \
                 ORDER BY created_at, hash"
            ),
            find_verifiable: format!(
                "SELECT {columns} FROM {table} WHERE state = 'sent' ORDER BY created_at, hash"
            ),
            set_state: format!(
                "UPDATE {table} SET state = $2 WHERE hash = $1 AND state = ANY($3)"
            ),
            set_retrying: format!(
                "UPDATE {table} SET state = 'ongoing', retried = retried + 1, retried_at = $2 \
                 WHERE hash = $1 AND state = ANY($3)"
            ),
            set_sent: format!(
                "UPDATE {table} SET state = 'sent', sent_at = $2 \
                 WHERE hash = $1 AND state = ANY($3)"
            ),
            set_verified: format!(
                "UPDATE {table} SET state = 'verified', verified_at = COALESCE(verified_at, $2) \
                 WHERE hash = $1 AND state = ANY($3)"
            ),
        }
    }
}

/// Second parameter of an update statement.
#[derive(Clone, Copy)]
enum Change {
    State(RequestState),
    At(DateTime<Utc>),
}

fn state_names(states: &[RequestState]) -> Vec<String> {
    states.iter().map(|state| state.as_str().to_string()).collect()
}

fn request_from_row<P: PgPayload>(row: &PgRow) -> Result<Request<P>> {
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let retried: i32 = row.try_get("retried")?;
    let Json(info): Json<TxInfo> = row.try_get("info")?;

    Ok(Request {
        address: row.try_get("address")?,
        payload: P::from_sql_text(&payload)?,
        hash: row.try_get("hash")?,
        state: state.parse().map_err(|err: String| anyhow!(err))?,
        retried: u32::try_from(retried).context("negative retry count")?,
        info,
        created_at: row.try_get("created_at")?,
        retried_at: row.try_get("retried_at")?,
        sent_at: row.try_get("sent_at")?,
        verified_at: row.try_get("verified_at")?,
    })
}

/// PostgreSQL request store for one request kind.
#[derive(Clone)]
pub struct PgRequestStore<P> {
    pool: PgPool,
    sql: Statements,
    _payload: PhantomData<fn() -> P>,
}

pub type PgStakeStore = PgRequestStore<Stake>;
pub type PgUnstakeStore = PgRequestStore<Unstake>;

impl<P: PgPayload> PgRequestStore<P> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sql: Statements::for_payload::<P>(),
            _payload: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transition(&self, sql: &str, hash: &str, change: Change, target: RequestState) -> Result<()> {
        let allowed = state_names(&target.predecessors());
        let allowed = allowed.as_slice();
        let pool = &self.pool;

        let affected = retry_on_conflict(|| async move {
            let mut tx = begin_read_committed(pool).await?;
            let query = sqlx::query(sql).bind(hash);
            let query = match change {
                Change::State(state) => query.bind(state.as_str()),
                Change::At(at) => query.bind(at),
            };
            let result = query.bind(allowed).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await
        .with_context(|| format!("moving {} {hash} to {target}", P::TABLE))?;

        if affected == 0 {
            debug!(table = P::TABLE, hash, %target, "transition not applied");
        }
        Ok(())
    }
}

#[async_trait]
impl<P: PgPayload> RequestStore<P> for PgRequestStore<P> {
    async fn insert_if_not_exists(
        &self,
        address: &str,
        payload: &P,
        hash: &str,
        info: &TxInfo,
    ) -> Result<Request<P>> {
        let value = payload.to_sql_text();
        let value = value.as_str();
        let sql = self.sql.insert.as_str();
        let pool = &self.pool;

        let row = retry_on_conflict(|| async move {
            let mut tx = begin_read_committed(pool).await?;
            let row = sqlx::query(sql)
                .bind(hash)
                .bind(address)
                .bind(value)
                .bind(Json(info))
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        })
        .await
        .with_context(|| format!("storing {} {hash}", P::TABLE))?;

        request_from_row(&row)
    }

    async fn find(&self, hash: &str) -> Result<Option<Request<P>>> {
        let row = sqlx::query(&self.sql.find)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row::<P>).transpose()
    }

    async fn find_triable(&self, max_retry: u32) -> Result<Vec<Request<P>>> {
        let states = state_names(P::TRIABLE);
        let max_retry = i32::try_from(max_retry).unwrap_or(i32::MAX);
        let rows = sqlx::query(&self.sql.find_triable)
            .bind(states.as_slice())
            .bind(max_retry)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(request_from_row::<P>).collect()
    }

    async fn find_verifiable(&self) -> Result<Vec<Request<P>>> {
        let rows = sqlx::query(&self.sql.find_verifiable)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(request_from_row::<P>).collect()
    }

    async fn set_state(&self, hash: &str, state: RequestState) -> Result<()> {
        self.transition(&self.sql.set_state, hash, Change::State(state), state)
            .await
    }

    async fn set_retrying(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(&self.sql.set_retrying, hash, Change::At(at), RequestState::Ongoing)
            .await
    }

    async fn set_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(&self.sql.set_sent, hash, Change::At(at), RequestState::Sent)
            .await
    }

    async fn set_verified(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition(&self.sql.set_verified, hash, Change::At(at), RequestState::Verified)
            .await
    }
}

/// Keeps the extraction watermark in the `memos` table.
#[derive(Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn latest_processed_hash(&self) -> Result<String> {
        let memo: Option<Json<ExtractionMemo>> =
            sqlx::query_scalar("SELECT memo FROM memos WHERE key = $1")
                .bind(EXTRACTION_MEMO_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(memo
            .map(|Json(memo)| memo.latest_processed_hash)
            .unwrap_or_default())
    }

    async fn set_latest_processed_hash(&self, hash: &str) -> Result<()> {
        let memo = ExtractionMemo {
            latest_processed_hash: hash.to_string(),
        };
        let memo = &memo;
        let pool = &self.pool;

        retry_on_conflict(|| async move {
            let mut tx = begin_read_committed(pool).await?;
            sqlx::query(
                r#"
                INSERT INTO memos (key, memo, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key) DO UPDATE
                SET memo = EXCLUDED.memo,
                    updated_at = NOW()
                "#,
            )
            .bind(EXTRACTION_MEMO_KEY)
            .bind(Json(memo))
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        })
        .await
        .context("storing extraction watermark")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_amounts_survive_numeric_text() {
        let tokens: BigUint = "340282366920938463463374607431768211455000".parse().unwrap();
        let text = Unstake {
            tokens: tokens.clone(),
        }
        .to_sql_text();
        assert_eq!(Unstake::from_sql_text(&text).unwrap().tokens, tokens);
    }

    #[test]
    fn fractional_numeric_is_rejected() {
        assert!(Unstake::from_sql_text("10.5").is_err());
        assert!(Stake::from_sql_text("-1").is_err());
    }

    #[test]
    fn statements_target_their_table() {
        let stakes = Statements::for_payload::<Stake>();
        assert!(stakes.insert.starts_with("INSERT INTO stakes (hash, address, round_since"));
        assert!(stakes.insert.contains("$3::bigint"));

        let unstakes = Statements::for_payload::<Unstake>();
        assert!(unstakes.find.contains("tokens::text AS payload"));
        assert!(unstakes.set_verified.contains("COALESCE(verified_at, $2)"));
    }

    #[test]
    fn triable_states_are_bound_by_name() {
        assert_eq!(
            state_names(<Unstake as Payload>::TRIABLE),
            vec!["new", "error", "retriable"]
        );
    }
}
