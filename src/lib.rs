pub mod accounts;
pub mod announcements;
pub mod app;
pub mod config;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod schedule;
pub mod schema;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::SqliteConnection;
use dotenvy::dotenv;
use std::env;

use crate::error::Error;
use crate::schema::{
    admin_sessions, announcements as announcements_table, device_tokens, profiles, requests, scores,
    sessions,
};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

// Enable WAL mode to allow concurrent reads during writes, and a timeout to retry locked
// operations. The busy timeout is what lets racing claims queue up instead of failing.
const PRAGMAS: &str = "PRAGMA foreign_keys = ON; \
    PRAGMA journal_mode = WAL; \
    PRAGMA synchronous = NORMAL; \
    PRAGMA busy_timeout = 10000;";

const INIT_MIGRATION: &str = include_str!("../migrations/2025-05-01-000000_init/up.sql");

/// Opens a single connection to `database_url` with the standard PRAGMAs applied.
pub fn connect(database_url: &str) -> Result<SqliteConnection, Error> {
    let mut conn = SqliteConnection::establish(database_url)?;
    conn.batch_execute(PRAGMAS)?;
    Ok(conn)
}

/// Opens a connection to the database named by `DATABASE_URL`.
pub fn establish_connection() -> Result<SqliteConnection, Error> {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| Error::Config("DATABASE_URL must be set in .env".to_string()))?;
    connect(&database_url)
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(PRAGMAS)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Builds the connection pool and makes sure the schema exists.
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, Error> {
    if max_size == 0 {
        return Err(Error::Config("pool size must be at least 1".to_string()));
    }
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_customizer(Box::new(SqlitePragmas))
        .build(manager)?;

    let mut conn = pool.get()?;
    run_migrations(&mut conn)?;
    Ok(pool)
}

/// Applies the schema. Every statement is `IF NOT EXISTS`, so this is safe to run on startup.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), Error> {
    conn.batch_execute(INIT_MIGRATION)?;
    Ok(())
}

/// Deletes every logistics request. Reference data, profiles and scores are kept.
pub fn clear_requests(conn: &mut SqliteConnection) -> Result<usize, Error> {
    Ok(diesel::delete(requests::table).execute(conn)?)
}

/// Resets all per-event state: requests, scores, sessions, announcements and device tokens.
/// Tournament structure (divisions, pools, rounds, fields, teams, games) and profiles survive, with
/// every profile marked unavailable and its push token cleared.
pub fn reset_database(conn: &mut SqliteConnection) -> Result<(), Error> {
    conn.transaction(|conn| {
        diesel::delete(requests::table).execute(conn)?;
        diesel::delete(scores::table).execute(conn)?;

        // Delete all sessions (profile and admin).
        diesel::delete(sessions::table).execute(conn)?;
        diesel::delete(admin_sessions::table).execute(conn)?;

        diesel::delete(announcements_table::table).execute(conn)?;
        diesel::delete(device_tokens::table).execute(conn)?;

        diesel::update(profiles::table)
            .set((
                profiles::is_available.eq(false),
                profiles::push_token.eq(None::<String>),
            ))
            .execute(conn)?;

        Ok(())
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = test_connection();
        run_migrations(&mut conn).expect("second run");
        let count: i64 = requests::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reset_database_keeps_structure_and_profiles() {
        run_test_in_transaction(|conn| {
            let field_id = insert_field(conn, "Field 1");
            let profile = insert_profile(
                conn,
                "trainer",
                &["medical"],
                true,
                Some("ExponentPushToken[abc]"),
            );
            diesel::insert_into(requests::table)
                .values((
                    requests::kind.eq("water"),
                    requests::field_id.eq(field_id),
                ))
                .execute(conn)?;

            announcements::create_announcement(conn, "Welcome", "Check in at HQ")?;

            reset_database(conn)?;

            let announcement_count: i64 = announcements_table::table.count().get_result(conn)?;
            assert_eq!(announcement_count, 0);
            let request_count: i64 = requests::table.count().get_result(conn)?;
            assert_eq!(request_count, 0);
            let field_count: i64 = schema::fields::table.count().get_result(conn)?;
            assert_eq!(field_count, 1);

            let (available, token): (bool, Option<String>) = profiles::table
                .filter(profiles::id.eq(profile.id))
                .select((profiles::is_available, profiles::push_token))
                .first(conn)?;
            assert!(!available);
            assert!(token.is_none());

            Ok(())
        });
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(matches!(create_pool(":memory:", 0), Err(Error::Config(_))));
        assert!(create_pool(":memory:", 1).is_ok());
    }

    #[test]
    fn test_clear_requests() {
        run_test_in_transaction(|conn| {
            let field_id = insert_field(conn, "Field 2");
            for kind in ["water", "water"] {
                diesel::insert_into(requests::table)
                    .values((requests::kind.eq(kind), requests::field_id.eq(field_id)))
                    .execute(conn)?;
            }
            assert_eq!(clear_requests(conn)?, 2);
            assert_eq!(clear_requests(conn)?, 0);
            Ok(())
        });
    }
}
