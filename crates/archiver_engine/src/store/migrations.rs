//! Schema migrations, tracked in a `_migrations` table and applied in order.

use archiver_logging::archiver_info;
use rusqlite::Connection;

use super::error::StoreError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_links_table",
        sql: include_str!("sql/001_create_links.sql"),
    },
    Migration {
        version: 2,
        description: "create_archives_table",
        sql: include_str!("sql/002_create_archives.sql"),
    },
    Migration {
        version: 3,
        description: "create_archive_transitions_table",
        sql: include_str!("sql/003_create_archive_transitions.sql"),
    },
];

pub fn run_all(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }
        archiver_info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    #[test]
    fn migrations_run_once() {
        let conn = fresh();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn archives_reject_unknown_state() {
        let conn = fresh();
        run_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO links (id, url, created_at) VALUES ('l1', 'https://a.test', '2026-01-01')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO archives (id, link_id, url, state, created_at, updated_at)
             VALUES ('a1', 'l1', 'https://a.test', 'archived', '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(err.is_err());
    }
}
