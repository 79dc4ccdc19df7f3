//! Postgres-backed presence via diesel. Queries run on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use super::{freshness_cutoff, PresenceStore};
use crate::error::CollabError;
use crate::models::{NewPresence, User};
use crate::protocol::{ActiveSession, RecordId, UserId};
use crate::schema::{presence, users};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn run_migrations(pool: &DbPool) -> Result<(), CollabError> {
    let conn = &mut pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| CollabError::PresenceStore(format!("migrations: {e}")))?;
    Ok(())
}

#[derive(Clone)]
pub struct PgPresenceStore {
    pool: DbPool,
}

impl PgPresenceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn upsert(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
        let pool = self.pool.clone();
        let record_id = record_id.as_str().to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), CollabError> {
            let conn = &mut pool.get()?;
            let now = Utc::now();
            // Single statement so two tabs joining at once cannot race into duplicate rows.
            diesel::insert_into(presence::table)
                .values(&NewPresence {
                    record_id: &record_id,
                    user_id,
                    last_seen: now,
                    is_active: true,
                })
                .on_conflict((presence::record_id, presence::user_id))
                .do_update()
                .set((presence::last_seen.eq(now), presence::is_active.eq(true)))
                .execute(conn)?;
            Ok(())
        })
        .await?
    }

    async fn query_active(&self, record_id: &RecordId) -> Result<Vec<ActiveSession>, CollabError> {
        let pool = self.pool.clone();
        let record_id = record_id.as_str().to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<ActiveSession>, CollabError> {
            let conn = &mut pool.get()?;
            let cutoff = freshness_cutoff(Utc::now());
            let rows: Vec<(User, DateTime<Utc>)> = presence::table
                .inner_join(users::table)
                .filter(presence::record_id.eq(record_id.as_str()))
                .filter(presence::is_active.eq(true))
                .filter(presence::last_seen.gt(cutoff))
                .order(presence::last_seen.desc())
                .select((User::as_select(), presence::last_seen))
                .load(conn)?;
            Ok(rows
                .into_iter()
                .map(|(user, last_seen)| ActiveSession {
                    user: user.into(),
                    last_seen,
                })
                .collect())
        })
        .await?
    }

    async fn deactivate(&self, record_id: &RecordId, user_id: UserId) -> Result<(), CollabError> {
        let pool = self.pool.clone();
        let record_id = record_id.as_str().to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), CollabError> {
            let conn = &mut pool.get()?;
            diesel::update(
                presence::table
                    .filter(presence::record_id.eq(record_id.as_str()))
                    .filter(presence::user_id.eq(user_id)),
            )
            .set(presence::is_active.eq(false))
            .execute(conn)?;
            Ok(())
        })
        .await?
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CollabError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, CollabError> {
            let conn = &mut pool.get()?;
            let n = diesel::delete(presence::table.filter(presence::last_seen.lt(cutoff)))
                .execute(conn)?;
            Ok(n)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    const CREATE_PRESENCE: &str =
        include_str!("../../migrations/2024-03-01-000000_create_presence/up.sql");

    #[test]
    fn record_ids_are_unbounded_text() {
        let column = CREATE_PRESENCE
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("record_id "))
            .unwrap();
        assert_eq!(column, "record_id TEXT NOT NULL,");
    }
}
