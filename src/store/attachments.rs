use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use super::lock::Txn;
use crate::config::StorageLayout;
use crate::error::{Error, Result};
use crate::models::{Attachment, AttachmentBody, AttachmentInfo, AttachmentPart};

const ATTACHMENT_SCHEME: &str = "attachment://";

const OCTET_STREAM: &str = "application/octet-stream";

/// Column order expected by `row_to_attachment`.
const ATTACHMENT_COLUMNS: &str = "id, message_id, store_data, content_uri, size, name, mime_type, \
                                  content_id, content_disposition";

/// Local locator of a stored attachment file.
pub fn attachment_locator(account_uuid: &str, id: i64) -> String {
    format!("{ATTACHMENT_SCHEME}{account_uuid}/{id}")
}

fn attachment_path(layout: &StorageLayout, id: i64) -> PathBuf {
    layout.attachments.join(id.to_string())
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        message_id: row.get(1)?,
        store_data: row.get(2)?,
        content_uri: row.get(3)?,
        size: row.get::<_, Option<i64>>(4)?.unwrap_or(0).max(0) as u64,
        name: row.get(5)?,
        mime_type: row.get(6)?,
        content_id: row.get(7)?,
        content_disposition: row.get(8)?,
    })
}

/// Value of a `key=value` parameter of a Content-Disposition, unquoted.
pub(super) fn disposition_param(disposition: Option<&str>, key: &str) -> Option<String> {
    disposition?.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Store one part of `message_id` and return its row id.
///
/// Bytes are written to a temporary file in the attachment directory and only
/// renamed to the row id once the row exists. With `save_as_new` unset a part
/// carrying an id updates that row's size and locator in place.
pub(super) fn do_save_attachment(
    tx: &Txn<'_>,
    message_id: i64,
    part: &AttachmentPart,
    save_as_new: bool,
) -> Result<i64> {
    let layout = tx.layout();
    let existing = if save_as_new { None } else { part.id };

    let mut temp = None;
    let mut size = None;
    let mut content_uri = None;
    match &part.body {
        AttachmentBody::Bytes(bytes) => {
            let mut file = tempfile::Builder::new()
                .prefix("att")
                .tempfile_in(&layout.attachments)?;
            file.write_all(bytes)?;
            file.flush()?;
            size = Some(bytes.len() as u64);
            temp = Some(file);
        }
        AttachmentBody::Stored(uri) => content_uri = Some(uri.clone()),
        AttachmentBody::Missing => {}
    }

    let disposition = part.content_disposition.as_deref();
    let size = size
        .or_else(|| disposition_param(disposition, "size").and_then(|s| s.parse().ok()))
        .unwrap_or(0);
    let name = part
        .name
        .clone()
        .or_else(|| disposition_param(disposition, "filename"));

    let id = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE attachments SET content_uri = ?1, size = ?2 WHERE id = ?3",
                params![content_uri, (size as i64), id],
            )?;
            id
        }
        None => {
            tx.execute(
                "INSERT INTO attachments
                     (message_id, content_uri, store_data, size, name, mime_type, content_id, content_disposition)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message_id,
                    content_uri,
                    part.store_data,
                    (size as i64),
                    name,
                    part.mime_type,
                    part.content_id,
                    part.content_disposition,
                ],
            )?;
            tx.last_insert_rowid()
        }
    };

    // A rolled-back save can leave a file under an id SQLite hands out again.
    if temp.is_none() && existing.is_none() {
        remove_file_if_present(&attachment_path(layout, id))?;
    }

    if let Some(temp) = temp {
        temp.persist(attachment_path(layout, id))
            .map_err(|e| Error::Io(e.error))?;
        let uri = attachment_locator(&layout.account_uuid, id);
        tx.execute(
            "UPDATE attachments SET content_uri = ?1 WHERE id = ?2",
            params![uri, id],
        )?;
        content_uri = Some(uri);
    }

    if let (Some(cid), Some(uri)) = (part.content_id.as_deref(), content_uri.as_deref()) {
        rewrite_cid_references(tx, message_id, cid, uri)?;
    }
    Ok(id)
}

/// Point inline `cid:` references in the message's HTML at the local file.
fn rewrite_cid_references(conn: &Connection, message_id: i64, content_id: &str, uri: &str) -> Result<()> {
    let html: Option<String> = conn
        .query_row(
            "SELECT html_content FROM messages WHERE id = ?1",
            [message_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let Some(html) = html else {
        return Ok(());
    };
    let token = format!("cid:{}", content_id.trim_matches(|c| c == '<' || c == '>'));
    if html.contains(&token) {
        conn.execute(
            "UPDATE messages SET html_content = ?1 WHERE id = ?2",
            params![html.replace(&token, uri), message_id],
        )?;
    }
    Ok(())
}

pub(super) fn do_load_attachments(conn: &Connection, message_id: i64) -> Result<Vec<Attachment>> {
    let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([message_id], row_to_attachment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Attachment rows of a stored message as parts ready to be written again,
/// with locally stored bytes read back in. Only rows whose locator names their
/// own file are read from disk.
pub(super) fn do_load_parts(tx: &Txn<'_>, message_id: i64) -> Result<Vec<AttachmentPart>> {
    let layout = tx.layout();
    do_load_attachments(tx, message_id)?
        .into_iter()
        .map(|a| -> Result<AttachmentPart> {
            let local = attachment_locator(&layout.account_uuid, a.id);
            let body = match a.content_uri {
                None => AttachmentBody::Missing,
                Some(uri) if uri == local => match fs::read(attachment_path(layout, a.id)) {
                    Ok(bytes) => AttachmentBody::Bytes(bytes),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => AttachmentBody::Missing,
                    Err(e) => return Err(Error::Io(e)),
                },
                Some(uri) => AttachmentBody::Stored(uri),
            };
            Ok(AttachmentPart {
                id: Some(a.id),
                mime_type: a.mime_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
                name: a.name,
                content_id: a.content_id,
                content_disposition: a.content_disposition,
                store_data: a.store_data,
                body,
            })
        })
        .collect()
}

/// Remove attachment rows of `message_id` and their files.
pub(super) fn do_delete_attachments(tx: &Txn<'_>, message_id: i64) -> Result<()> {
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM attachments WHERE message_id = ?1")?;
        let ids = stmt
            .query_map([message_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };
    for id in ids {
        remove_file_if_present(&attachment_path(tx.layout(), id))?;
    }
    tx.execute("DELETE FROM attachments WHERE message_id = ?1", [message_id])?;
    Ok(())
}

/// Remove the files of every attachment in a folder. Rows are left to the
/// cascade triggers.
pub(super) fn do_delete_attachment_files_in_folder(tx: &Txn<'_>, folder_id: i64) -> Result<()> {
    let mut stmt = tx.prepare(
        "SELECT a.id FROM attachments a JOIN messages m ON a.message_id = m.id WHERE m.folder_id = ?1",
    )?;
    let ids = stmt
        .query_map([folder_id], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for id in ids {
        remove_file_if_present(&attachment_path(tx.layout(), id))?;
    }
    Ok(())
}

pub(super) fn do_attachment_info(conn: &Connection, id: i64) -> Result<Option<AttachmentInfo>> {
    Ok(conn
        .query_row("SELECT name, size FROM attachments WHERE id = ?1", [id], |row| {
            Ok(AttachmentInfo {
                name: row.get(0)?,
                size: row.get::<_, Option<i64>>(1)?.unwrap_or(0).max(0) as u64,
            })
        })
        .optional()?)
}

/// Stored MIME type, guessed from the file name when the stored one says
/// nothing more than octet-stream.
pub(super) fn do_attachment_type(conn: &Connection, id: i64) -> Result<Option<String>> {
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT mime_type, name FROM attachments WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((mime_type, name)) = row else {
        return Ok(None);
    };
    let mime_type = mime_type.unwrap_or_else(|| OCTET_STREAM.to_string());
    if !mime_type.eq_ignore_ascii_case(OCTET_STREAM) {
        return Ok(Some(mime_type));
    }
    let guessed = name
        .as_deref()
        .and_then(|n| mime_guess::from_path(n).first())
        .map(|m| m.essence_str().to_string());
    Ok(Some(guessed.unwrap_or(mime_type)))
}

fn attachment_files(dir: &Path) -> Result<Vec<(PathBuf, Option<i64>)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let id = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok());
        files.push((entry.path(), id));
    }
    Ok(files)
}

/// Drop locally cached attachment files. Without `force`, files whose row has
/// no store data are kept since they cannot be fetched again. Returns the
/// number of files removed.
pub(super) fn do_prune_attachments(tx: &Txn<'_>, force: bool) -> Result<usize> {
    let mut removed = 0;
    for (path, id) in attachment_files(&tx.layout().attachments)? {
        if let Some(id) = id {
            if !force {
                let store_data: Option<Option<String>> = tx
                    .query_row("SELECT store_data FROM attachments WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if matches!(store_data, Some(None)) {
                    continue;
                }
            }
            tx.execute("UPDATE attachments SET content_uri = NULL WHERE id = ?1", [id])?;
        }
        remove_file_if_present(&path)?;
        removed += 1;
    }
    log::debug!("Pruned {removed} attachment files (force: {force})");
    Ok(removed)
}

/// Remove files that no attachment row refers to.
pub(super) fn do_sweep_orphan_files(tx: &Txn<'_>) -> Result<usize> {
    let mut removed = 0;
    for (path, id) in attachment_files(&tx.layout().attachments)? {
        let owned = match id {
            Some(id) => tx
                .query_row("SELECT 1 FROM attachments WHERE id = ?1", [id], |_| Ok(()))
                .optional()?
                .is_some(),
            None => false,
        };
        if !owned {
            remove_file_if_present(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        log::debug!("Swept {removed} orphan attachment files");
    }
    Ok(removed)
}

/// Bytes used by attachment files.
pub(super) fn attachment_dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for (path, _) in attachment_files(dir)? {
        total += fs::metadata(path)?.len();
    }
    Ok(total)
}
