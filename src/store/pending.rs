use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::PendingCommand;

/// Arguments share one column: each is percent-encoded, then comma-joined.
/// An empty list is stored as NULL so it stays apart from `[""]`.
fn encode_arguments(arguments: &[String]) -> Option<String> {
    if arguments.is_empty() {
        return None;
    }
    Some(
        arguments
            .iter()
            .map(|a| urlencoding::encode(a).into_owned())
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn decode_arguments(column: Option<&str>) -> Vec<String> {
    let Some(joined) = column else {
        return Vec::new();
    };
    joined
        .split(',')
        .map(|a| match urlencoding::decode(a) {
            Ok(decoded) => decoded.into_owned(),
            Err(e) => {
                log::warn!("Pending command argument {a:?} is not decodable: {e}");
                a.to_string()
            }
        })
        .collect()
}

pub(super) fn do_add_pending_command(
    conn: &Connection,
    command: &str,
    arguments: &[String],
) -> Result<i64> {
    conn.execute(
        "INSERT INTO pending_commands (command, arguments) VALUES (?1, ?2)",
        params![command, encode_arguments(arguments)],
    )?;
    let id = conn.last_insert_rowid();
    log::debug!("Queued pending command {id}: {command}");
    Ok(id)
}

/// Every queued command, oldest first. Nothing is removed.
pub(super) fn do_pending_commands(conn: &Connection) -> Result<Vec<PendingCommand>> {
    let mut stmt =
        conn.prepare("SELECT id, command, arguments FROM pending_commands ORDER BY id ASC")?;
    let commands = stmt
        .query_map([], |row| {
            Ok(PendingCommand {
                id: row.get(0)?,
                command: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                arguments: decode_arguments(row.get::<_, Option<String>>(2)?.as_deref()),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(commands)
}

pub(super) fn do_remove_pending_command(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM pending_commands WHERE id = ?1", [id])?;
    log::debug!("Removed pending command {id}");
    Ok(())
}

pub(super) fn do_remove_pending_commands(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM pending_commands", [])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = crate::config::StorageLayout::new(dir.path(), "pending-test");
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        crate::store::schema::prepare(&mut conn, &layout).expect("bootstrap");
        conn
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn arguments_with_separators_survive() {
        let tricky = args(&["a,b", "100%", "", "Ünïcode ✉"]);
        let encoded = encode_arguments(&tricky).expect("non-empty list");
        assert_eq!(encoded.matches(',').count(), 3);
        assert_eq!(decode_arguments(Some(&encoded)), tricky);

        let lone_empty = args(&[""]);
        let encoded = encode_arguments(&lone_empty);
        assert_eq!(decode_arguments(encoded.as_deref()), lone_empty);

        assert_eq!(encode_arguments(&[]), None);
        assert!(decode_arguments(None).is_empty());
    }

    #[test]
    fn commands_come_back_in_insertion_order() {
        let conn = test_conn();
        let first = do_add_pending_command(&conn, "setFlag", &args(&["INBOX", "SEEN"])).expect("add");
        let second = do_add_pending_command(&conn, "expunge", &[]).expect("add");
        do_add_pending_command(&conn, "search", &args(&[""])).expect("add");
        assert!(second > first);

        let queued = do_pending_commands(&conn).expect("list");
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[0].command, "setFlag");
        assert_eq!(queued[0].arguments, args(&["INBOX", "SEEN"]));
        assert!(queued[1].arguments.is_empty());
        assert_eq!(queued[2].arguments, args(&[""]));

        // listing does not consume
        assert_eq!(do_pending_commands(&conn).expect("list again").len(), 3);

        assert_eq!(do_remove_pending_commands(&conn).expect("clear"), 3);
        assert!(do_pending_commands(&conn).expect("list").is_empty());
    }
}
