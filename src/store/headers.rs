use std::collections::HashMap;

use rusqlite::{params, Connection, ToSql};

use super::LocalStore;
use crate::error::Result;
use crate::models::{HeaderState, Headers, LocalMessage};

/// Header naming the identity a message was sent with.
pub const IDENTITY_HEADER: &str = "X-Neverlight-Identity";

/// Headers kept when the account doesn't save everything.
const SAVED_HEADERS: [&str; 9] = [
    IDENTITY_HEADER,
    "To",
    "Cc",
    "From",
    "In-Reply-To",
    "References",
    "Content-ID",
    "Content-Disposition",
    "X-User-Agent",
];

fn is_saved_header(name: &str) -> bool {
    SAVED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// True when saving `headers` drops nothing.
pub(super) fn keeps_every_header(headers: &Headers, save_all: bool) -> bool {
    save_all || headers.names().all(is_saved_header)
}

/// Replace the stored headers of `message_id`. Returns false when the
/// allow-list dropped at least one header.
pub(super) fn do_save_headers(
    conn: &Connection,
    message_id: i64,
    headers: &Headers,
    save_all: bool,
) -> Result<bool> {
    do_delete_headers(conn, message_id)?;
    let mut stmt =
        conn.prepare_cached("INSERT INTO headers (message_id, name, value) VALUES (?1, ?2, ?3)")?;
    let mut complete = true;
    for (name, value) in headers.iter() {
        if save_all || is_saved_header(name) {
            stmt.execute(params![message_id, name, value])?;
        } else {
            complete = false;
        }
    }
    Ok(complete)
}

pub(super) fn do_delete_headers(conn: &Connection, message_id: i64) -> Result<()> {
    conn.execute("DELETE FROM headers WHERE message_id = ?1", [message_id])?;
    Ok(())
}

/// Headers for each of `message_ids` in one query, in stored order. Ids with
/// no rows map to an empty set.
pub(super) fn do_load_headers(conn: &Connection, message_ids: &[i64]) -> Result<HashMap<i64, Headers>> {
    let mut out: HashMap<i64, Headers> =
        message_ids.iter().map(|id| (*id, Headers::new())).collect();
    if message_ids.is_empty() {
        return Ok(out);
    }

    let placeholders: String = (1..=message_ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT message_id, name, value FROM headers WHERE message_id IN ({placeholders}) ORDER BY id"
    );
    let param_refs: Vec<&dyn ToSql> = message_ids.iter().map(|id| id as &dyn ToSql).collect();

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(param_refs.as_slice())?;
    while let Some(row) = rows.next()? {
        let message_id: i64 = row.get(0)?;
        let name: Option<String> = row.get(1)?;
        let value: Option<String> = row.get(2)?;
        if let Some(name) = name {
            out.entry(message_id)
                .or_default()
                .add(name, value.unwrap_or_default());
        }
    }
    Ok(out)
}

impl LocalMessage {
    /// The message's headers, fetched from `store` on first access.
    pub fn headers(&mut self, store: &LocalStore) -> Result<&mut Headers> {
        match self.headers {
            HeaderState::Loaded(ref mut headers) => Ok(headers),
            HeaderState::Unloaded => {
                let id = self.id;
                let mut loaded = store.db.execute(true, |tx| do_load_headers(tx, &[id]))?;
                self.headers = HeaderState::Loaded(loaded.remove(&id).unwrap_or_default());
                self.headers(store)
            }
        }
    }

    pub fn get_header(&mut self, store: &LocalStore, name: &str) -> Result<Vec<String>> {
        Ok(self.headers(store)?.get(name).to_vec())
    }

    pub fn set_header(&mut self, store: &LocalStore, name: &str, value: &str) -> Result<()> {
        self.headers(store)?.set(name, value);
        Ok(())
    }

    pub fn add_header(&mut self, store: &LocalStore, name: &str, value: &str) -> Result<()> {
        self.headers(store)?.add(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, store: &LocalStore, name: &str) -> Result<()> {
        self.headers(store)?.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = crate::config::StorageLayout::new(dir.path(), "headers-test");
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        crate::store::schema::prepare(&mut conn, &layout).expect("bootstrap");
        conn
    }

    fn sample() -> Headers {
        let mut h = Headers::new();
        h.add("From", "a@example.com");
        h.add("Received", "by mx1");
        h.add("to", "b@example.com");
        h.add("References", "<1@x>");
        h.add("References", "<2@x>");
        h
    }

    #[test]
    fn allow_list_drops_the_rest_case_insensitively() {
        let conn = test_conn();
        let complete = do_save_headers(&conn, 7, &sample(), false).expect("save");
        assert!(!complete);
        assert!(!keeps_every_header(&sample(), false));
        assert!(keeps_every_header(&sample(), true));

        let loaded = do_load_headers(&conn, &[7]).expect("load");
        let h = &loaded[&7];
        assert_eq!(h.names().collect::<Vec<_>>(), ["From", "to", "References"]);
        assert_eq!(h.get("References"), ["<1@x>", "<2@x>"]);
        assert!(h.get("Received").is_empty());
    }

    #[test]
    fn save_all_keeps_everything() {
        let conn = test_conn();
        assert!(do_save_headers(&conn, 7, &sample(), true).expect("save"));
        let loaded = do_load_headers(&conn, &[7]).expect("load");
        assert_eq!(loaded[&7].get("Received"), ["by mx1"]);
    }

    #[test]
    fn saving_replaces_previous_rows() {
        let conn = test_conn();
        do_save_headers(&conn, 7, &sample(), true).expect("first save");
        let mut next = Headers::new();
        next.add("To", "c@example.com");
        assert!(do_save_headers(&conn, 7, &next, false).expect("second save"));

        let loaded = do_load_headers(&conn, &[7, 8]).expect("load");
        assert_eq!(loaded[&7], next);
        assert!(loaded[&8].is_empty());
    }
}
