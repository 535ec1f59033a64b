use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};

use super::flags::flags_from_column;
use crate::error::Result;
use crate::models::{
    Address, HeaderState, LocalMessage, MessageRetrievalListener, SearchField, SearchQuery,
    StoredContent,
};

/// Rows handed to a listener before the rest of the result is fetched.
pub const FIRST_PAGE_SIZE: usize = 10;

/// Free-text fields used when a query names none.
const DEFAULT_SEARCH_FIELDS: [SearchField; 4] = [
    SearchField::Subject,
    SearchField::Sender,
    SearchField::TextContent,
    SearchField::HtmlContent,
];

/// Column order expected by `row_to_message`.
pub(super) const MESSAGE_COLUMNS: &str = "subject, sender_list, date, uid, flags, id, to_list, \
     cc_list, bcc_list, reply_to_list, attachment_count, internal_date, message_id, folder_id, \
     preview, deleted";

pub(super) fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

pub(super) fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalMessage> {
    let list = |idx: usize| -> rusqlite::Result<Vec<Address>> {
        Ok(Address::unpack(row.get::<_, Option<String>>(idx)?.as_deref()))
    };
    Ok(LocalMessage {
        subject: row.get(0)?,
        from: list(1)?,
        sent_date: from_millis(row.get(2)?),
        uid: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        flags: flags_from_column(row.get::<_, Option<String>>(4)?.as_deref()),
        id: row.get(5)?,
        to: list(6)?,
        cc: list(7)?,
        bcc: list(8)?,
        reply_to: list(9)?,
        attachment_count: row.get::<_, Option<i64>>(10)?.unwrap_or(0).max(0) as u32,
        internal_date: from_millis(row.get(11)?),
        message_id: row.get(12)?,
        folder_id: row.get::<_, Option<i64>>(13)?.unwrap_or_default(),
        preview: row.get(14)?,
        deleted: row.get::<_, Option<i64>>(15)?.unwrap_or(0) != 0,
        headers: HeaderState::Unloaded,
    })
}

fn load_messages(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<LocalMessage>> {
    let mut stmt = conn.prepare(sql)?;
    let messages = stmt
        .query_map(params, row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// `None` when the folder has no message with this UID.
pub(super) fn do_get_message(
    conn: &Connection,
    folder_id: i64,
    uid: &str,
) -> Result<Option<LocalMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE uid = ?1 AND folder_id = ?2");
    Ok(conn
        .query_row(&sql, rusqlite::params![uid, folder_id], row_to_message)
        .optional()?)
}

pub(super) fn do_get_message_by_id(conn: &Connection, id: i64) -> Result<Option<LocalMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_message).optional()?)
}

/// Messages of a folder, newest first.
pub(super) fn do_get_messages(
    conn: &Connection,
    folder_id: i64,
    include_deleted: bool,
) -> Result<Vec<LocalMessage>> {
    let filter = if include_deleted { "" } else { " AND deleted = 0" };
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE folder_id = ?1{filter}
         ORDER BY date DESC, id DESC"
    );
    load_messages(conn, &sql, &[&folder_id as &dyn ToSql])
}

/// Lookup by UID, skipping UIDs the folder doesn't have. Input order is kept.
pub(super) fn do_get_messages_by_uids(
    conn: &Connection,
    folder_id: i64,
    uids: &[String],
) -> Result<Vec<LocalMessage>> {
    let mut found = Vec::with_capacity(uids.len());
    for uid in uids {
        if let Some(m) = do_get_message(conn, folder_id, uid)? {
            found.push(m);
        }
    }
    Ok(found)
}

pub(super) fn do_message_content(conn: &Connection, id: i64) -> Result<Option<StoredContent>> {
    Ok(conn
        .query_row(
            "SELECT text_content, html_content, preview FROM messages WHERE id = ?1",
            [id],
            |row| {
                Ok(StoredContent {
                    text: row.get(0)?,
                    html: row.get(1)?,
                    preview: row.get(2)?,
                })
            },
        )
        .optional()?)
}

/// Live messages across every folder.
pub(super) fn do_message_count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages WHERE deleted = 0", [], |row| {
        row.get(0)
    })?;
    Ok(n as u64)
}

/// Push a parameter and return its placeholder.
fn bind(params: &mut Vec<Box<dyn ToSql>>, value: Box<dyn ToSql>) -> String {
    params.push(value);
    format!("?{}", params.len())
}

/// Build the WHERE clause for `query`. Tombstones never match.
fn search_clause(query: &SearchQuery) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses = vec!["deleted = 0".to_string()];
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(text) = query.text.as_deref().filter(|t| !t.is_empty()) {
        let fields: &[SearchField] = if query.fields.is_empty() {
            &DEFAULT_SEARCH_FIELDS
        } else {
            &query.fields
        };
        let pattern = format!("%{text}%");
        let ors: Vec<String> = fields
            .iter()
            .map(|f| format!("{} LIKE {}", f.column(), bind(&mut params, Box::new(pattern.clone()))))
            .collect();
        clauses.push(format!("({})", ors.join(" OR ")));
    }

    if !query.folder_ids.is_empty() {
        let placeholders: Vec<String> = query
            .folder_ids
            .iter()
            .map(|id| bind(&mut params, Box::new(*id)))
            .collect();
        clauses.push(format!("folder_id IN ({})", placeholders.join(",")));
    }

    if !query.messages.is_empty() {
        let pairs: Vec<String> = query
            .messages
            .iter()
            .map(|(uid, folder_id)| {
                let u = bind(&mut params, Box::new(uid.clone()));
                let f = bind(&mut params, Box::new(*folder_id));
                format!("(uid = {u} AND folder_id = {f})")
            })
            .collect();
        clauses.push(format!("({})", pairs.join(" OR ")));
    }

    // substring match against the comma-joined column
    for flag in &query.required_flags {
        let p = bind(&mut params, Box::new(format!("%{}%", flag.token())));
        clauses.push(format!("flags LIKE {p}"));
    }
    for flag in &query.forbidden_flags {
        let p = bind(&mut params, Box::new(format!("%{}%", flag.token())));
        clauses.push(format!("COALESCE(flags, '') NOT LIKE {p}"));
    }

    (clauses.join(" AND "), params)
}

/// Run `query`, streaming the first page to `listener` before fetching the
/// remainder. Returns the total number of matches.
pub(super) fn do_search(
    conn: &Connection,
    query: &SearchQuery,
    listener: &mut dyn MessageRetrievalListener,
) -> Result<usize> {
    let (clause, params) = search_clause(query);
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let base = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {clause} ORDER BY date DESC, id DESC"
    );

    let first = load_messages(conn, &format!("{base} LIMIT {FIRST_PAGE_SIZE}"), &refs)?;
    for (index, m) in first.iter().enumerate() {
        listener.message_finished(m, index);
    }
    let mut total = first.len();

    if total == FIRST_PAGE_SIZE {
        let rest = load_messages(
            conn,
            &format!("{base} LIMIT -1 OFFSET {FIRST_PAGE_SIZE}"),
            &refs,
        )?;
        for m in &rest {
            listener.message_finished(m, total);
            total += 1;
        }
    }

    log::debug!("Search matched {total} messages");
    listener.messages_finished(total);
    Ok(total)
}
