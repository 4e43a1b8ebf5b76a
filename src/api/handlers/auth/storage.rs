//! Persistence collaborator for users and session tokens.
//!
//! The gateway only talks to the [`Store`] trait. `PgStore` is the production
//! implementation; `MemoryStore` keeps everything in process and backs the
//! router tests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::{future::Future, time::Duration};
use tokio::sync::Mutex;
use tracing::Instrument;
use utoipa::ToSchema;

use super::utils::constant_time_eq;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Parse the stored role column.
    ///
    /// # Errors
    /// Returns an error for values outside `user`/`admin`.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(anyhow!("unknown role: {other}")),
        }
    }
}

/// A persisted account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

/// Fields needed to create an account.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub image_url: Option<String>,
}

#[derive(Debug)]
pub enum InsertUserOutcome {
    Created(User),
    Conflict,
}

/// A live session joined to its owner.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub user: User,
    pub expiry: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a user by id or email (either may be absent).
    async fn find_user(&self, id: Option<i64>, email: Option<&str>) -> Result<Option<User>>;

    async fn insert_user(&self, draft: &NewUser) -> Result<InsertUserOutcome>;

    /// Find an unexpired session with a matching scope, joined to its user.
    async fn find_session(
        &self,
        hash: &[u8],
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>>;

    async fn insert_session(
        &self,
        hash: &[u8],
        user_id: i64,
        scope: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete every session for the user in this scope. Returns the number removed.
    async fn delete_sessions(&self, scope: &str, user_id: i64) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// Run a store call under a fixed deadline.
///
/// # Errors
/// Returns the call's own error, or a timeout error once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{operation} timed out after {}ms", limit.as_millis())),
    }
}

/// Find an account by email, creating it from `draft` if missing.
///
/// A concurrent insert of the same email is resolved by re-reading the winner.
///
/// # Errors
/// Returns an error if the store fails or the deadline elapses.
pub async fn find_or_create_user(
    store: &dyn Store,
    draft: NewUser,
    limit: Duration,
) -> Result<User> {
    if let Some(user) = bounded(limit, "find user", store.find_user(None, Some(&draft.email))).await? {
        return Ok(user);
    }
    match bounded(limit, "insert user", store.insert_user(&draft)).await? {
        InsertUserOutcome::Created(user) => Ok(user),
        InsertUserOutcome::Conflict => bounded(
            limit,
            "find user",
            store.find_user(None, Some(&draft.email)),
        )
        .await?
        .ok_or_else(|| anyhow!("user vanished after duplicate email conflict")),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Postgres-backed store.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "users.id, users.created_at, COALESCE(users.name, '') AS name, \
    users.email, COALESCE(users.image_url, '') AS image_url, users.version, users.role";

fn user_from_row(row: &PgRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        image_url: row.try_get("image_url")?,
        version: row.try_get("version")?,
        role: Role::parse(&role)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_user(&self, id: Option<i64>, email: Option<&str>) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE users.id = $1 OR users.email = $2 LIMIT 1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_user(&self, draft: &NewUser) -> Result<InsertUserOutcome> {
        let query = format!(
            "INSERT INTO users (name, email, image_url) VALUES ($1, $2, $3) RETURNING {USER_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = %query
        );
        let result = sqlx::query(&query)
            .bind(&draft.name)
            .bind(&draft.email)
            .bind(draft.image_url.as_deref().filter(|url| !url.is_empty()))
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(row) => Ok(InsertUserOutcome::Created(user_from_row(&row)?)),
            Err(err) if is_unique_violation(&err) => Ok(InsertUserOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn find_session(
        &self,
        hash: &[u8],
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        let query = format!(
            "SELECT {USER_COLUMNS}, tokens.expiry
             FROM users
             INNER JOIN tokens ON users.id = tokens.user_id
             WHERE tokens.hash = $1
               AND tokens.scope = $2
               AND tokens.expiry > $3
             LIMIT 1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(hash)
            .bind(scope)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            user: user_from_row(&row)?,
            expiry: row.try_get("expiry")?,
        }))
    }

    async fn insert_session(
        &self,
        hash: &[u8],
        user_id: i64,
        scope: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        let query = "INSERT INTO tokens (hash, user_id, expiry, scope) VALUES ($1, $2, $3, $4)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash)
            .bind(user_id)
            .bind(expiry)
            .bind(scope)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn delete_sessions(&self, scope: &str, user_id: i64) -> Result<u64> {
        // Deleting zero rows is fine; logout is idempotent.
        let query = "DELETE FROM tokens WHERE scope = $1 AND user_id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(scope)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete sessions")?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        let span = tracing::info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to ping database")?;
        Ok(())
    }
}

struct StoredSession {
    hash: Vec<u8>,
    user_id: i64,
    scope: String,
    expiry: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    sessions: Vec<StoredSession>,
}

/// In-process store used by tests and local experiments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    latency: Option<Duration>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to exercise deadlines.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Change a user's role; returns false for unknown ids.
    pub async fn set_role(&self, user_id: i64, role: Role) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.users.iter_mut().find(|user| user.id == user_id) {
            Some(user) => {
                user.role = role;
                user.version += 1;
                true
            }
            None => false,
        }
    }

    /// Number of stored sessions for a user across all scopes.
    pub async fn session_count(&self, user_id: i64) -> usize {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .filter(|session| session.user_id == user_id)
            .count()
    }

    /// Raw stored hashes, for asserting nothing else is persisted.
    pub async fn stored_hashes(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .map(|session| session.hash.clone())
            .collect()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, id: Option<i64>, email: Option<&str>) -> Result<Option<User>> {
        self.delay().await;
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .iter()
            .find(|user| Some(user.id) == id || Some(user.email.as_str()) == email)
            .cloned())
    }

    async fn insert_user(&self, draft: &NewUser) -> Result<InsertUserOutcome> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        if inner.users.iter().any(|user| user.email == draft.email) {
            return Ok(InsertUserOutcome::Conflict);
        }
        let id = i64::try_from(inner.users.len())? + 1;
        let user = User {
            id,
            name: draft.name.clone(),
            email: draft.email.clone(),
            image_url: draft.image_url.clone().unwrap_or_default(),
            role: Role::User,
            created_at: Utc::now(),
            version: 1,
        };
        inner.users.push(user.clone());
        Ok(InsertUserOutcome::Created(user))
    }

    async fn find_session(
        &self,
        hash: &[u8],
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        self.delay().await;
        let inner = self.inner.lock().await;
        let Some(session) = inner.sessions.iter().find(|session| {
            constant_time_eq(&session.hash, hash) && session.scope == scope && now < session.expiry
        }) else {
            return Ok(None);
        };
        Ok(inner
            .users
            .iter()
            .find(|user| user.id == session.user_id)
            .map(|user| SessionRecord {
                user: user.clone(),
                expiry: session.expiry,
            }))
    }

    async fn insert_session(
        &self,
        hash: &[u8],
        user_id: i64,
        scope: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        if !inner.users.iter().any(|user| user.id == user_id) {
            return Err(anyhow!("session owner {user_id} does not exist"));
        }
        if inner.sessions.iter().any(|session| session.hash == hash) {
            return Err(anyhow!("duplicate session hash"));
        }
        inner.sessions.push(StoredSession {
            hash: hash.to_vec(),
            user_id,
            scope: scope.to_string(),
            expiry,
        });
        Ok(())
    }

    async fn delete_sessions(&self, scope: &str, user_id: i64) -> Result<u64> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|session| !(session.user_id == user_id && session.scope == scope));
        Ok(u64::try_from(before - inner.sessions.len())?)
    }

    async fn ping(&self) -> Result<()> {
        self.delay().await;
        Ok(())
    }
}
