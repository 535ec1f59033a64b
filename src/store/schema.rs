use std::fs;
use std::io;

use rusqlite::Connection;

use crate::config::StorageLayout;
use crate::error::{Error, Result};

/// Schema version this build writes.
pub const DB_VERSION: u32 = 39;

/// Oldest version the ladder can upgrade. Anything older is rebuilt.
const LADDER_FLOOR: u32 = 29;

/// Full table set, run on a fresh store or one older than the ladder floor.
const BOOTSTRAP: &str = "
DROP TABLE IF EXISTS folders;
CREATE TABLE folders (
    id INTEGER PRIMARY KEY,
    name TEXT,
    last_updated INTEGER,
    unread_count INTEGER DEFAULT 0,
    visible_limit INTEGER,
    status TEXT,
    push_state TEXT,
    last_pushed INTEGER,
    flagged_count INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS folder_name ON folders (name);

DROP TABLE IF EXISTS messages;
CREATE TABLE messages (
    id INTEGER PRIMARY KEY,
    deleted INTEGER DEFAULT 0,
    folder_id INTEGER,
    uid TEXT,
    subject TEXT,
    date INTEGER,
    flags TEXT,
    sender_list TEXT,
    to_list TEXT,
    cc_list TEXT,
    bcc_list TEXT,
    reply_to_list TEXT,
    html_content TEXT,
    text_content TEXT,
    attachment_count INTEGER,
    internal_date INTEGER,
    message_id TEXT,
    preview TEXT
);

DROP TABLE IF EXISTS headers;
CREATE TABLE headers (id INTEGER PRIMARY KEY, message_id INTEGER, name TEXT, value TEXT);
CREATE INDEX IF NOT EXISTS header_folder ON headers (message_id);

CREATE INDEX IF NOT EXISTS msg_uid ON messages (uid, folder_id);
DROP INDEX IF EXISTS msg_folder_id;
DROP INDEX IF EXISTS msg_folder_id_date;
CREATE INDEX IF NOT EXISTS msg_folder_id_deleted_date ON messages (folder_id, deleted, internal_date);

DROP TABLE IF EXISTS attachments;
CREATE TABLE attachments (
    id INTEGER PRIMARY KEY,
    message_id INTEGER,
    store_data TEXT,
    content_uri TEXT,
    size INTEGER,
    name TEXT,
    mime_type TEXT,
    content_id TEXT,
    content_disposition TEXT
);

DROP TABLE IF EXISTS pending_commands;
CREATE TABLE pending_commands (id INTEGER PRIMARY KEY, command TEXT, arguments TEXT);

DROP TRIGGER IF EXISTS delete_folder;
CREATE TRIGGER delete_folder BEFORE DELETE ON folders BEGIN
    DELETE FROM messages WHERE old.id = folder_id;
END;

DROP TRIGGER IF EXISTS delete_message;
CREATE TRIGGER delete_message BEFORE DELETE ON messages BEGIN
    DELETE FROM attachments WHERE old.id = message_id;
    DELETE FROM headers WHERE old.id = message_id;
END;
";

/// What a ladder step may fail with and still count as applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tolerate {
    Nothing,
    /// The column is already there.
    DuplicateColumn,
}

struct Step {
    version: u32,
    sql: &'static str,
    tolerate: Tolerate,
}

/// Applied in order for every step whose version is above the stored one.
const LADDER: &[Step] = &[
    Step {
        version: 30,
        sql: "ALTER TABLE messages ADD deleted INTEGER DEFAULT 0",
        tolerate: Tolerate::DuplicateColumn,
    },
    Step {
        version: 31,
        sql: "DROP INDEX IF EXISTS msg_folder_id_date;
              CREATE INDEX IF NOT EXISTS msg_folder_id_deleted_date
                  ON messages (folder_id, deleted, internal_date);",
        tolerate: Tolerate::Nothing,
    },
    Step {
        version: 32,
        sql: "UPDATE messages SET deleted = 1 WHERE flags LIKE '%DELETED%'",
        tolerate: Tolerate::Nothing,
    },
    Step {
        version: 33,
        sql: "ALTER TABLE messages ADD preview TEXT",
        tolerate: Tolerate::DuplicateColumn,
    },
    Step {
        version: 34,
        sql: "ALTER TABLE folders ADD flagged_count INTEGER DEFAULT 0",
        tolerate: Tolerate::DuplicateColumn,
    },
    Step {
        version: 35,
        sql: "UPDATE messages SET flags = REPLACE(flags, 'X_NO_SEEN_INFO', 'X_BAD_FLAG')",
        tolerate: Tolerate::Nothing,
    },
    Step {
        version: 36,
        sql: "ALTER TABLE attachments ADD content_id TEXT",
        tolerate: Tolerate::DuplicateColumn,
    },
    Step {
        version: 37,
        sql: "ALTER TABLE attachments ADD content_disposition TEXT",
        tolerate: Tolerate::DuplicateColumn,
    },
    // 38 only pruned cached attachments
    Step {
        version: 39,
        sql: "DELETE FROM headers WHERE id IN (
                  SELECT headers.id FROM headers
                  LEFT JOIN messages ON headers.message_id = messages.id
                  WHERE messages.id IS NULL)",
        tolerate: Tolerate::Nothing,
    },
];

pub(super) fn stored_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the store at `layout` to [`DB_VERSION`]. A failed upgrade resets the
/// stored version to 0 before returning, so the next open starts over.
pub(super) fn prepare(conn: &mut Connection, layout: &StorageLayout) -> Result<()> {
    let from = stored_version(conn)?;
    if from == DB_VERSION {
        return Ok(());
    }
    log::info!("Upgrading store from version {from} to version {DB_VERSION}");

    if let Err(source) = upgrade(conn, from) {
        log::error!("Store upgrade failed, resetting version to 0: {source}");
        conn.pragma_update(None, "user_version", 0)?;
        return Err(Error::SchemaUpgrade {
            from,
            to: DB_VERSION,
            source,
        });
    }

    if from < LADDER_FLOOR {
        clear_attachment_dir(layout)?;
    }
    Ok(())
}

fn upgrade(conn: &mut Connection, from: u32) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    if from < LADDER_FLOOR {
        tx.execute_batch(BOOTSTRAP)?;
    } else {
        for step in LADDER.iter().filter(|s| s.version > from) {
            apply_step(&tx, step)?;
        }
    }
    tx.pragma_update(None, "user_version", DB_VERSION)?;
    tx.commit()
}

fn apply_step(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    match (conn.execute_batch(step.sql), step.tolerate) {
        (Ok(()), _) => Ok(()),
        (Err(e), Tolerate::DuplicateColumn) if e.to_string().contains("duplicate column") => Ok(()),
        (Err(e), _) => {
            log::error!("Upgrade step {} failed: {e}", step.version);
            Err(e)
        }
    }
}

/// Files left from a store that was just rebuilt are unreachable.
fn clear_attachment_dir(layout: &StorageLayout) -> Result<()> {
    let entries = match fs::read_dir(&layout.attachments) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &std::path::Path) -> StorageLayout {
        let layout = StorageLayout::new(dir, "schema-test");
        fs::create_dir_all(&layout.attachments).expect("attachment dir");
        layout
    }

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("table_info");
        stmt.query_map([], |row| row.get::<_, String>(1))
            .expect("query columns")
            .collect::<rusqlite::Result<_>>()
            .expect("collect columns")
    }

    #[test]
    fn fresh_store_is_bootstrapped_and_attachment_dir_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout(dir.path());
        fs::write(layout.attachments.join("17"), b"stale").expect("stale file");

        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        prepare(&mut conn, &layout).expect("bootstrap");

        assert_eq!(stored_version(&conn).expect("version"), DB_VERSION);
        for table in ["folders", "messages", "headers", "attachments", "pending_commands"] {
            assert!(!columns(&conn, table).is_empty(), "{table} exists");
        }
        assert!(!layout.attachments.join("17").exists());

        // second open is a no-op
        prepare(&mut conn, &layout).expect("reopen");
    }

    #[test]
    fn cascade_triggers_remove_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        prepare(&mut conn, &layout(dir.path())).expect("bootstrap");
        conn.execute_batch(
            "INSERT INTO folders (id, name) VALUES (1, 'INBOX');
             INSERT INTO messages (id, folder_id, uid) VALUES (10, 1, 'a');
             INSERT INTO headers (message_id, name, value) VALUES (10, 'To', 'x');
             INSERT INTO attachments (message_id, size) VALUES (10, 3);
             DELETE FROM folders WHERE id = 1;",
        )
        .expect("seed and delete folder");

        for table in ["messages", "headers", "attachments"] {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .expect("count");
            assert_eq!(n, 0, "{table} emptied by cascade");
        }
    }

    #[test]
    fn legacy_store_climbs_the_ladder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout(dir.path());
        fs::write(layout.attachments.join("5"), b"kept").expect("attachment file");

        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT, last_updated INTEGER,
                 unread_count INTEGER, visible_limit INTEGER, status TEXT, push_state TEXT,
                 last_pushed INTEGER);
             CREATE TABLE messages (id INTEGER PRIMARY KEY, folder_id INTEGER, uid TEXT,
                 subject TEXT, date INTEGER, flags TEXT, sender_list TEXT, to_list TEXT,
                 cc_list TEXT, bcc_list TEXT, reply_to_list TEXT, html_content TEXT,
                 text_content TEXT, attachment_count INTEGER, internal_date INTEGER,
                 message_id TEXT);
             CREATE TABLE headers (id INTEGER PRIMARY KEY, message_id INTEGER, name TEXT, value TEXT);
             CREATE TABLE attachments (id INTEGER PRIMARY KEY, message_id INTEGER,
                 store_data TEXT, content_uri TEXT, size INTEGER, name TEXT, mime_type TEXT);
             CREATE TABLE pending_commands (id INTEGER PRIMARY KEY, command TEXT, arguments TEXT);
             INSERT INTO folders (id, name) VALUES (1, 'INBOX');
             INSERT INTO messages (id, folder_id, uid, flags) VALUES (1, 1, 'a', 'SEEN,DELETED');
             INSERT INTO messages (id, folder_id, uid, flags) VALUES (2, 1, 'b', 'X_NO_SEEN_INFO');
             INSERT INTO headers (message_id, name, value) VALUES (99, 'To', 'orphan');
             PRAGMA user_version = 29;",
        )
        .expect("create v29 store");

        prepare(&mut conn, &layout).expect("upgrade");

        assert_eq!(stored_version(&conn).expect("version"), DB_VERSION);
        assert!(columns(&conn, "messages").contains(&"preview".to_string()));
        assert!(columns(&conn, "folders").contains(&"flagged_count".to_string()));
        assert!(columns(&conn, "attachments").contains(&"content_disposition".to_string()));

        let deleted: i64 = conn
            .query_row("SELECT deleted FROM messages WHERE id = 1", [], |row| row.get(0))
            .expect("deleted column backfilled");
        assert_eq!(deleted, 1);
        let flags: String = conn
            .query_row("SELECT flags FROM messages WHERE id = 2", [], |row| row.get(0))
            .expect("flags");
        assert_eq!(flags, "X_BAD_FLAG");
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM headers", [], |row| row.get(0))
            .expect("headers");
        assert_eq!(orphans, 0);
        assert!(layout.attachments.join("5").exists(), "ladder keeps files");
    }

    #[test]
    fn failed_upgrade_resets_version_and_next_open_rebuilds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout(dir.path());
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        // no internal_date column, so the index step cannot apply
        conn.execute_batch(
            "CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE messages (id INTEGER PRIMARY KEY, folder_id INTEGER, flags TEXT);
             PRAGMA user_version = 30;",
        )
        .expect("create broken store");

        let err = prepare(&mut conn, &layout).expect_err("upgrade must fail");
        assert!(matches!(err, Error::SchemaUpgrade { from: 30, to: DB_VERSION, .. }));
        assert_eq!(stored_version(&conn).expect("version"), 0);

        prepare(&mut conn, &layout).expect("rebuild from scratch");
        assert_eq!(stored_version(&conn).expect("version"), DB_VERSION);
        assert!(columns(&conn, "messages").contains(&"internal_date".to_string()));
    }

    #[test]
    fn missing_table_fails_the_ladder_instead_of_skipping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout(dir.path());
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT, flagged_count INTEGER);
             CREATE TABLE messages (id INTEGER PRIMARY KEY, folder_id INTEGER, uid TEXT,
                 flags TEXT, deleted INTEGER, preview TEXT, internal_date INTEGER);
             CREATE TABLE headers (id INTEGER PRIMARY KEY, message_id INTEGER, name TEXT, value TEXT);
             PRAGMA user_version = 35;",
        )
        .expect("create v35 store without attachments");

        let err = prepare(&mut conn, &layout).expect_err("attachments step must fail");
        assert!(matches!(err, Error::SchemaUpgrade { from: 35, to: DB_VERSION, .. }));
        assert_eq!(stored_version(&conn).expect("version"), 0);
    }

    #[test]
    fn reapplied_column_steps_are_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout(dir.path());
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        prepare(&mut conn, &layout).expect("bootstrap");
        conn.pragma_update(None, "user_version", 35).expect("rewind version");

        prepare(&mut conn, &layout).expect("columns already present");
        assert_eq!(stored_version(&conn).expect("version"), DB_VERSION);
    }
}
