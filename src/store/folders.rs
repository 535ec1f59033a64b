use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use super::attachments::do_delete_attachment_files_in_folder;
use super::flags::{contribution, flags_from_column};
use super::lock::Txn;
use super::queries::{from_millis, to_millis};
use crate::error::{Error, Result};
use crate::models::Folder;

/// Column order expected by `row_to_folder`.
const FOLDER_COLUMNS: &str = "id, name, unread_count, flagged_count, visible_limit, \
                              last_updated, last_pushed, status, push_state";

fn row_to_folder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        unread_count: clamp_count(row.get(2)?),
        flagged_count: clamp_count(row.get(3)?),
        visible_limit: clamp_count(row.get(4)?),
        last_checked: from_millis(row.get(5)?),
        last_pushed: from_millis(row.get(6)?),
        status: row.get(7)?,
        push_state: row.get(8)?,
    })
}

fn clamp_count(value: Option<i64>) -> u32 {
    value.unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32
}

pub(super) fn do_find_folder(conn: &Connection, name: &str) -> Result<Option<Folder>> {
    let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE name = ?1");
    Ok(conn.query_row(&sql, [name], row_to_folder).optional()?)
}

pub(super) fn do_find_folder_by_id(conn: &Connection, id: i64) -> Result<Option<Folder>> {
    let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_folder).optional()?)
}

pub(super) fn do_require_folder(conn: &Connection, id: i64) -> Result<Folder> {
    do_find_folder_by_id(conn, id)?.ok_or_else(|| Error::FolderNotFound(format!("#{id}")))
}

/// Load `name`, creating it with `visible_limit` first if it is not there.
pub(super) fn do_open_folder(conn: &Connection, name: &str, visible_limit: u32) -> Result<Folder> {
    if let Some(folder) = do_find_folder(conn, name)? {
        return Ok(folder);
    }
    log::warn!("Folder {name} not in store, creating it");
    do_create_folder(conn, name, visible_limit)
}

pub(super) fn do_create_folder(conn: &Connection, name: &str, visible_limit: u32) -> Result<Folder> {
    if do_find_folder(conn, name)?.is_some() {
        return Err(Error::FolderExists(name.to_string()));
    }
    conn.execute(
        "INSERT INTO folders (name, visible_limit, unread_count, flagged_count) VALUES (?1, ?2, 0, 0)",
        params![name, visible_limit],
    )?;
    do_find_folder(conn, name)?.ok_or_else(|| Error::FolderNotFound(name.to_string()))
}

pub(super) fn do_folder_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM folders WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub(super) fn do_list_folders(conn: &Connection) -> Result<Vec<Folder>> {
    let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders ORDER BY name ASC");
    let mut stmt = conn.prepare(&sql)?;
    let folders = stmt
        .query_map([], row_to_folder)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(folders)
}

pub(super) fn do_folder_count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM folders", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Live (non-tombstoned) messages in the folder.
pub(super) fn do_folder_message_count(conn: &Connection, folder_id: i64) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE folder_id = ?1 AND deleted = 0",
        [folder_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn do_set_unread_count(conn: &Connection, folder_id: i64, count: i64) -> Result<()> {
    do_require_folder(conn, folder_id)?;
    conn.execute(
        "UPDATE folders SET unread_count = ?1 WHERE id = ?2",
        params![count.max(0), folder_id],
    )?;
    Ok(())
}

pub(super) fn do_set_flagged_count(conn: &Connection, folder_id: i64, count: i64) -> Result<()> {
    do_require_folder(conn, folder_id)?;
    conn.execute(
        "UPDATE folders SET flagged_count = ?1 WHERE id = ?2",
        params![count.max(0), folder_id],
    )?;
    Ok(())
}

/// Add `(unread, flagged)` to the folder's counters, never going below zero.
pub(super) fn do_adjust_counts(conn: &Connection, folder_id: i64, delta: (i64, i64)) -> Result<()> {
    if delta == (0, 0) {
        return Ok(());
    }
    conn.execute(
        "UPDATE folders SET
             unread_count = MAX(0, COALESCE(unread_count, 0) + ?1),
             flagged_count = MAX(0, COALESCE(flagged_count, 0) + ?2)
         WHERE id = ?3",
        params![delta.0, delta.1, folder_id],
    )?;
    Ok(())
}

/// Rewrite both counters from the live messages of the folder.
pub(super) fn do_recompute_counts(conn: &Connection, folder_id: i64) -> Result<(u32, u32)> {
    let mut stmt = conn.prepare("SELECT flags FROM messages WHERE folder_id = ?1 AND deleted = 0")?;
    let mut rows = stmt.query([folder_id])?;
    let (mut unread, mut flagged) = (0i64, 0i64);
    while let Some(row) = rows.next()? {
        let flags = flags_from_column(row.get::<_, Option<String>>(0)?.as_deref());
        let (u, f) = contribution(&flags);
        unread += u;
        flagged += f;
    }
    conn.execute(
        "UPDATE folders SET unread_count = ?1, flagged_count = ?2 WHERE id = ?3",
        params![unread, flagged, folder_id],
    )?;
    Ok((unread as u32, flagged as u32))
}

fn set_folder_column(conn: &Connection, folder_id: i64, column: &str, value: &dyn ToSql) -> Result<()> {
    let changed = conn.execute(
        &format!("UPDATE folders SET {column} = ?1 WHERE id = ?2"),
        params![value, folder_id],
    )?;
    if changed == 0 {
        return Err(Error::FolderNotFound(format!("#{folder_id}")));
    }
    Ok(())
}

pub(super) fn do_set_last_checked(
    conn: &Connection,
    folder_id: i64,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    set_folder_column(conn, folder_id, "last_updated", &to_millis(at))
}

pub(super) fn do_set_last_pushed(
    conn: &Connection,
    folder_id: i64,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    set_folder_column(conn, folder_id, "last_pushed", &to_millis(at))
}

pub(super) fn do_set_status(conn: &Connection, folder_id: i64, status: Option<&str>) -> Result<()> {
    set_folder_column(conn, folder_id, "status", &status)
}

pub(super) fn do_set_push_state(conn: &Connection, folder_id: i64, state: Option<&str>) -> Result<()> {
    set_folder_column(conn, folder_id, "push_state", &state)
}

pub(super) fn do_set_visible_limit(conn: &Connection, folder_id: i64, limit: u32) -> Result<()> {
    set_folder_column(conn, folder_id, "visible_limit", &limit)
}

pub(super) fn do_reset_visible_limits(conn: &Connection, limit: u32) -> Result<()> {
    conn.execute("UPDATE folders SET visible_limit = ?1", [limit])?;
    Ok(())
}

/// Drop the folder and, through the triggers, its messages, headers and
/// attachment rows. Attachment files go first since no trigger can reach them.
pub(super) fn do_delete_folder(tx: &Txn<'_>, folder_id: i64) -> Result<()> {
    do_require_folder(tx, folder_id)?;
    do_delete_attachment_files_in_folder(tx, folder_id)?;
    tx.execute("DELETE FROM folders WHERE id = ?1", [folder_id])?;
    Ok(())
}

/// Highest numeric UID in the folder, ignoring locally minted ones.
pub(super) fn do_last_numeric_uid(conn: &Connection, folder_id: i64) -> Result<Option<u64>> {
    let mut stmt = conn.prepare("SELECT uid FROM messages WHERE folder_id = ?1")?;
    let mut rows = stmt.query([folder_id])?;
    let mut highest = None;
    while let Some(row) = rows.next()? {
        let uid: Option<String> = row.get(0)?;
        if let Some(n) = uid.and_then(|u| u.parse::<u64>().ok()) {
            highest = highest.max(Some(n));
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn test_conn() -> Connection {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = crate::config::StorageLayout::new(dir.path(), "folders-test");
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        schema::prepare(&mut conn, &layout).expect("bootstrap");
        conn
    }

    fn add_message(conn: &Connection, folder_id: i64, uid: &str, flags: &str, deleted: bool) {
        conn.execute(
            "INSERT INTO messages (folder_id, uid, flags, deleted) VALUES (?1, ?2, ?3, ?4)",
            params![folder_id, uid, flags, deleted],
        )
        .expect("insert message");
    }

    #[test]
    fn open_creates_missing_folder_with_default_limit() {
        let conn = test_conn();
        assert!(!do_folder_exists(&conn, "INBOX").expect("exists"));
        let inbox = do_open_folder(&conn, "INBOX", 25).expect("open");
        assert_eq!(inbox.visible_limit, 25);
        assert_eq!(inbox.unread_count, 0);
        assert!(do_folder_exists(&conn, "INBOX").expect("exists"));

        let again = do_open_folder(&conn, "INBOX", 99).expect("reopen");
        assert_eq!(again.id, inbox.id);
        assert_eq!(again.visible_limit, 25);
    }

    #[test]
    fn create_refuses_duplicates() {
        let conn = test_conn();
        do_create_folder(&conn, "Sent", 10).expect("create");
        let err = do_create_folder(&conn, "Sent", 10).expect_err("duplicate");
        assert!(matches!(err, Error::FolderExists(name) if name == "Sent"));
    }

    #[test]
    fn counters_clamp_at_zero() {
        let conn = test_conn();
        let f = do_open_folder(&conn, "INBOX", 25).expect("open");
        do_set_unread_count(&conn, f.id, -4).expect("set unread");
        do_adjust_counts(&conn, f.id, (-1, -1)).expect("adjust");
        let f = do_require_folder(&conn, f.id).expect("reload");
        assert_eq!((f.unread_count, f.flagged_count), (0, 0));

        assert!(matches!(
            do_set_flagged_count(&conn, 404, 1),
            Err(Error::FolderNotFound(_))
        ));
    }

    #[test]
    fn recompute_counts_only_live_messages() {
        let conn = test_conn();
        let f = do_open_folder(&conn, "INBOX", 25).expect("open");
        add_message(&conn, f.id, "1", "", false);
        add_message(&conn, f.id, "2", "SEEN,FLAGGED", false);
        add_message(&conn, f.id, "3", "FLAGGED", false);
        add_message(&conn, f.id, "4", "DELETED,FLAGGED", true);
        add_message(&conn, f.id, "5", "X_DESTROYED", false);
        do_set_unread_count(&conn, f.id, 40).expect("drifted");

        assert_eq!(do_recompute_counts(&conn, f.id).expect("recompute"), (2, 2));
        let f = do_require_folder(&conn, f.id).expect("reload");
        assert_eq!((f.unread_count, f.flagged_count), (2, 2));
        assert_eq!(do_folder_message_count(&conn, f.id).expect("count"), 4);
    }

    #[test]
    fn setters_round_trip() {
        let conn = test_conn();
        let f = do_open_folder(&conn, "INBOX", 25).expect("open");
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).expect("timestamp");
        do_set_last_checked(&conn, f.id, Some(at)).expect("last checked");
        do_set_last_pushed(&conn, f.id, Some(at)).expect("last pushed");
        do_set_status(&conn, f.id, Some("ok")).expect("status");
        do_set_push_state(&conn, f.id, Some("uidNext=7")).expect("push state");
        do_set_visible_limit(&conn, f.id, 50).expect("limit");

        let f = do_require_folder(&conn, f.id).expect("reload");
        assert_eq!(f.last_checked, Some(at));
        assert_eq!(f.last_pushed, Some(at));
        assert_eq!(f.status.as_deref(), Some("ok"));
        assert_eq!(f.push_state.as_deref(), Some("uidNext=7"));
        assert_eq!(f.visible_limit, 50);

        do_reset_visible_limits(&conn, 10).expect("reset");
        assert_eq!(do_require_folder(&conn, f.id).expect("reload").visible_limit, 10);
    }

    #[test]
    fn listing_and_numeric_uids() {
        let conn = test_conn();
        let b = do_open_folder(&conn, "b", 25).expect("b");
        do_open_folder(&conn, "a", 25).expect("a");
        let names: Vec<_> = do_list_folders(&conn)
            .expect("list")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(do_folder_count(&conn).expect("count"), 2);

        assert_eq!(do_last_numeric_uid(&conn, b.id).expect("empty"), None);
        add_message(&conn, b.id, "9", "", false);
        add_message(&conn, b.id, "120", "", false);
        add_message(&conn, b.id, "LOCAL:abc", "", false);
        assert_eq!(do_last_numeric_uid(&conn, b.id).expect("max"), Some(120));
    }
}
