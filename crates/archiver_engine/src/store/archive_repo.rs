//! Archive repository: the `links`, `archives` and `archive_transitions` tables.

use std::error::Error as StdError;
use std::str::FromStr;

use archiver_core::{
    plan_transition, Archive, ArchiveId, ArchiveState, MetadataBag, TransitionMetadata,
    TransitionRecord, Trigger,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, StoreError};

const ARCHIVE_COLUMNS: &str = "id, link_id, url, state, error_message, content_html, \
     content_text, title, description, image_url, final_url, metadata, fetched_at, \
     created_at, updated_at";

fn parse_column<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|err| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|err| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<Archive> {
    Ok(Archive {
        id: parse_column(row, "id")?,
        link_id: row.get("link_id")?,
        url: row.get("url")?,
        state: parse_column(row, "state")?,
        error_message: row.get("error_message")?,
        content_html: row.get("content_html")?,
        content_text: row.get("content_text")?,
        title: row.get("title")?,
        description: row.get("description")?,
        image_url: row.get("image_url")?,
        final_url: row.get("final_url")?,
        metadata: json_column::<MetadataBag>(row, "metadata")?,
        fetched_at: row.get("fetched_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<TransitionRecord> {
    Ok(TransitionRecord {
        id: row.get("id")?,
        archive_id: parse_column(row, "archive_id")?,
        from_state: parse_column(row, "from_state")?,
        to_state: parse_column(row, "to_state")?,
        metadata: json_column::<TransitionMetadata>(row, "metadata")?,
        occurred_at: row.get("occurred_at")?,
    })
}

fn load(conn: &Connection, archive_id: ArchiveId) -> Result<Option<Archive>, StoreError> {
    let archive = conn
        .query_row(
            &format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE id = ?1"),
            params![archive_id.to_string()],
            archive_from_row,
        )
        .optional()?;
    Ok(archive)
}

/// Registers the link (if new) and its pending archive in one transaction.
///
/// A link owns at most one archive; a second call for the same link fails
/// with [`StoreError::AlreadyExists`].
pub fn create(
    db: &Database,
    link_id: &str,
    url: &str,
    now: DateTime<Utc>,
) -> Result<Archive, StoreError> {
    let archive = Archive::new_pending(link_id, url, now);
    db.with_conn(move |conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO links (id, url, created_at) VALUES (?1, ?2, ?3)",
            params![link_id, url, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO archives (id, link_id, url, state, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                archive.id.to_string(),
                archive.link_id,
                archive.url,
                archive.state.as_str(),
                serde_json::to_string(&archive.metadata)?,
                archive.created_at,
                archive.updated_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(link_id.to_string()));
        }
        tx.commit()?;
        Ok(archive)
    })
}

pub fn get(db: &Database, archive_id: ArchiveId) -> Result<Option<Archive>, StoreError> {
    db.with_conn(|conn| load(conn, archive_id))
}

pub fn get_by_link(db: &Database, link_id: &str) -> Result<Option<Archive>, StoreError> {
    db.with_conn(|conn| {
        let archive = conn
            .query_row(
                &format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE link_id = ?1"),
                params![link_id],
                archive_from_row,
            )
            .optional()?;
        Ok(archive)
    })
}

/// Archives in `state`, oldest first.
pub fn list_by_state(db: &Database, state: ArchiveState) -> Result<Vec<Archive>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archives WHERE state = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![state.as_str()], archive_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Applies `trigger` to the archive and appends the matching log entry.
///
/// The row update is conditional on the state read at the start, and both
/// writes share one transaction: either the state change and its log entry
/// land together or neither does.
pub fn transition(
    db: &Database,
    archive_id: ArchiveId,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<(Archive, TransitionRecord), StoreError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut archive = load(&tx, archive_id)?.ok_or(StoreError::NotFound(archive_id))?;
        let plan = plan_transition(archive.state, trigger)?;
        plan.apply(&mut archive, now);

        let updated = tx.execute(
            "UPDATE archives SET state = ?2, error_message = ?3, content_html = ?4,
             content_text = ?5, title = ?6, description = ?7, image_url = ?8, final_url = ?9,
             metadata = ?10, fetched_at = ?11, updated_at = ?12
             WHERE id = ?1 AND state = ?13",
            params![
                archive_id.to_string(),
                archive.state.as_str(),
                archive.error_message,
                archive.content_html,
                archive.content_text,
                archive.title,
                archive.description,
                archive.image_url,
                archive.final_url,
                serde_json::to_string(&archive.metadata)?,
                archive.fetched_at,
                archive.updated_at,
                plan.from.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict {
                archive_id,
                expected: plan.from,
            });
        }

        tx.execute(
            "INSERT INTO archive_transitions (archive_id, from_state, to_state, metadata, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                archive_id.to_string(),
                plan.from.as_str(),
                plan.to.as_str(),
                serde_json::to_string(&plan.metadata)?,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        let record = TransitionRecord {
            id,
            archive_id,
            from_state: plan.from,
            to_state: plan.to,
            metadata: plan.metadata,
            occurred_at: now,
        };
        Ok((archive, record))
    })
}

/// The transition log of one archive in the order it was written.
pub fn transitions(db: &Database, archive_id: ArchiveId) -> Result<Vec<TransitionRecord>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, archive_id, from_state, to_state, metadata, occurred_at
             FROM archive_transitions WHERE archive_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![archive_id.to_string()], transition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// How many times the archive has entered `processing`.
pub fn attempts(db: &Database, archive_id: ArchiveId) -> Result<u32, StoreError> {
    db.with_conn(|conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM archive_transitions WHERE archive_id = ?1 AND to_state = ?2",
            params![archive_id.to_string(), ArchiveState::Processing.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Deletes the link; its archive and transitions go with it.
pub fn delete_link(db: &Database, link_id: &str) -> Result<bool, StoreError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM links WHERE id = ?1", params![link_id])?;
        Ok(deleted > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_core::{ArchiveContent, Failure, FailureReason, RetryKind, StageMetrics};
    use pretty_assertions::assert_eq;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn content() -> ArchiveContent {
        let mut metadata = MetadataBag::new();
        metadata.insert_namespaced("og", "title", "Hello");
        ArchiveContent {
            content_html: "<p>Hello</p>".to_string(),
            content_text: "Hello".to_string(),
            title: Some("Hello".to_string()),
            description: None,
            image_url: None,
            final_url: "https://example.com/final".to_string(),
            metadata,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn create_and_read_back() {
        let db = db();
        let created = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        let by_link = get_by_link(&db, "link-1").unwrap().unwrap();
        assert_eq!(by_link.id, created.id);
        assert_eq!(by_link.state, ArchiveState::Pending);
        assert_eq!(get(&db, created.id).unwrap().unwrap().url, "https://example.com/");
    }

    #[test]
    fn one_archive_per_link() {
        let db = db();
        create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        let err = create(&db, "link-1", "https://example.com/other", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(link) if link == "link-1"));
    }

    #[test]
    fn transition_updates_row_and_log_together() {
        let db = db();
        let archive = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        transition(&db, archive.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap();
        let (done, record) = transition(
            &db,
            archive.id,
            Trigger::Complete {
                content: Box::new(content()),
                metrics: StageMetrics {
                    attempt: 1,
                    byte_count: Some(12),
                    ..StageMetrics::default()
                },
            },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(done.state, ArchiveState::Completed);
        assert_eq!(record.metadata.byte_count, Some(12));
        let stored = get(&db, archive.id).unwrap().unwrap();
        assert_eq!(stored.content_text.as_deref(), Some("Hello"));
        assert_eq!(stored.metadata.get("og.title"), Some("Hello"));
        assert_eq!(stored.final_url.as_deref(), Some("https://example.com/final"));

        let log = transitions(&db, archive.id).unwrap();
        let steps: Vec<_> = log.iter().map(|t| (t.from_state, t.to_state)).collect();
        assert_eq!(
            steps,
            vec![
                (ArchiveState::Pending, ArchiveState::Processing),
                (ArchiveState::Processing, ArchiveState::Completed),
            ]
        );
        assert_eq!(attempts(&db, archive.id).unwrap(), 1);
    }

    #[test]
    fn rejected_transition_leaves_no_trace() {
        let db = db();
        let archive = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        let err = transition(
            &db,
            archive.id,
            Trigger::Fail {
                failure: Failure::new(FailureReason::Timeout, "slow"),
                metrics: StageMetrics::default(),
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        assert_eq!(get(&db, archive.id).unwrap().unwrap().state, ArchiveState::Pending);
        assert!(transitions(&db, archive.id).unwrap().is_empty());
    }

    #[test]
    fn failed_then_retried_clears_error() {
        let db = db();
        let archive = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        transition(&db, archive.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap();
        let (failed, _) = transition(
            &db,
            archive.id,
            Trigger::Fail {
                failure: Failure::new(FailureReason::ConnectionFailed, "refused"),
                metrics: StageMetrics::default(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(failed.error_message.is_some());

        let (retried, record) = transition(
            &db,
            archive.id,
            Trigger::Retry {
                attempt: 2,
                kind: RetryKind::Manual,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(retried.state, ArchiveState::Processing);
        assert!(retried.error_message.is_none());
        assert_eq!(record.metadata.trigger.as_deref(), Some("manual_retry"));
        assert_eq!(attempts(&db, archive.id).unwrap(), 2);
    }

    #[test]
    fn transitions_are_append_only() {
        let db = db();
        let archive = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        transition(&db, archive.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap();
        let result = db.with_conn(|conn| {
            conn.execute("UPDATE archive_transitions SET to_state = 'completed'", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(
            transitions(&db, archive.id).unwrap()[0].to_state,
            ArchiveState::Processing
        );
    }

    #[test]
    fn deleting_link_cascades() {
        let db = db();
        let archive = create(&db, "link-1", "https://example.com/", Utc::now()).unwrap();
        transition(&db, archive.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap();

        assert!(delete_link(&db, "link-1").unwrap());
        assert!(get(&db, archive.id).unwrap().is_none());
        assert!(transitions(&db, archive.id).unwrap().is_empty());
        assert!(!delete_link(&db, "link-1").unwrap());

        let err = transition(&db, archive.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == archive.id));
    }

    #[test]
    fn list_by_state_is_oldest_first() {
        let db = db();
        let first = create(&db, "a", "https://a.test/", Utc::now()).unwrap();
        let second = create(&db, "b", "https://b.test/", Utc::now()).unwrap();
        transition(&db, second.id, Trigger::Start { attempt: 1 }, Utc::now()).unwrap();
        let third = create(&db, "c", "https://c.test/", Utc::now()).unwrap();

        let pending: Vec<_> = list_by_state(&db, ArchiveState::Pending)
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(pending, vec![first.id, third.id]);
    }
}
