use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::attachments::{
    attachment_locator, do_delete_attachment_files_in_folder, do_delete_attachments,
    do_load_parts, do_save_attachment,
};
use super::flags::{contribution, counter_delta, flags_from_column, flags_to_column};
use super::folders::{do_adjust_counts, do_recompute_counts, do_require_folder};
use super::headers::{do_delete_headers, do_load_headers, do_save_headers, keeps_every_header};
use super::lock::Txn;
use super::queries::{do_get_message, do_get_message_by_id, do_get_messages, do_message_content};
use crate::error::{Error, Result};
use crate::models::{Address, Flag, Flags, Headers, LocalMessage, Message, Viewable};
use crate::render::ContentRenderer;

/// Marks UIDs minted by this store rather than assigned by a server.
pub const LOCAL_UID_PREFIX: &str = "LOCAL:";

pub fn local_uid() -> String {
    format!("{LOCAL_UID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_local_uid(uid: &str) -> bool {
    uid.starts_with(LOCAL_UID_PREFIX)
}

/// How an incoming message's UID is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AppendMode {
    /// Replace whatever row already has this UID.
    Append,
    /// Fail with `DuplicateUid` if the UID is taken.
    InsertNew,
    /// Replace by UID; the message must carry one.
    ReplaceByUid,
    /// Always mint a fresh local UID.
    Copy,
}

/// What message writes need from the store.
pub(super) struct WriteCtx<'a> {
    pub renderer: &'a dyn ContentRenderer,
    pub save_all_headers: bool,
}

/// Column values of a message, built from a [`Message`] when it is written.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct CompiledMessage {
    pub subject: Option<String>,
    pub sender_list: Option<String>,
    pub to_list: Option<String>,
    pub cc_list: Option<String>,
    pub bcc_list: Option<String>,
    pub reply_to_list: Option<String>,
    pub date: i64,
    pub internal_date: i64,
    pub flags: Flags,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub preview: Option<String>,
    pub attachment_count: i64,
    pub message_id: Option<String>,
}

impl CompiledMessage {
    pub(super) fn compile(message: &Message, ctx: &WriteCtx<'_>, now: DateTime<Utc>) -> Self {
        let mut text = String::new();
        let mut html = String::new();
        for part in &message.body {
            if part.is_html() {
                html.push_str(&part.text);
            } else {
                text.push_str(&part.text);
            }
        }
        let rendered = ctx.renderer.render(&text, &html);

        let mut flags = message.flags.clone();
        flags.set(
            Flag::XGotAllHeaders,
            keeps_every_header(&message.headers, ctx.save_all_headers),
        );

        CompiledMessage {
            subject: message.subject.clone(),
            sender_list: Address::pack(&message.from),
            to_list: Address::pack(&message.to),
            cc_list: Address::pack(&message.cc),
            bcc_list: Address::pack(&message.bcc),
            reply_to_list: Address::pack(&message.reply_to),
            date: message.sent_date.unwrap_or(now).timestamp_millis(),
            internal_date: message.internal_date.unwrap_or(now).timestamp_millis(),
            flags,
            html_content: rendered.display_html,
            text_content: (!text.is_empty()).then_some(text),
            preview: rendered.preview,
            attachment_count: message.attachments.len() as i64,
            message_id: message.message_id.clone(),
        }
    }
}

fn negate((unread, flagged): (i64, i64)) -> (i64, i64) {
    (-unread, -flagged)
}

/// Folder and flags of a stored message.
fn load_state(conn: &Connection, id: i64) -> Result<(i64, Flags)> {
    conn.query_row(
        "SELECT folder_id, flags FROM messages WHERE id = ?1",
        [id],
        |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?.unwrap_or_default(),
                flags_from_column(row.get::<_, Option<String>>(1)?.as_deref()),
            ))
        },
    )
    .optional()?
    .ok_or(Error::MessageNotFound(id))
}

/// The `deleted` column follows the DELETED flag.
fn write_flags(conn: &Connection, id: i64, flags: &Flags) -> Result<()> {
    conn.execute(
        "UPDATE messages SET flags = ?1, deleted = ?2 WHERE id = ?3",
        params![flags_to_column(flags), flags.contains(&Flag::Deleted), id],
    )?;
    Ok(())
}

/// Remove a row that is about to be replaced, taking its contribution out of
/// the folder counters first.
fn remove_replaced(tx: &Txn<'_>, existing: &LocalMessage) -> Result<()> {
    do_adjust_counts(tx, existing.folder_id, negate(contribution(&existing.flags)))?;
    do_delete_attachments(tx, existing.id)?;
    tx.execute("DELETE FROM messages WHERE id = ?1", [existing.id])?;
    Ok(())
}

/// Write one message into `folder_id` and return its row id and UID.
pub(super) fn do_append_message(
    tx: &Txn<'_>,
    ctx: &WriteCtx<'_>,
    folder_id: i64,
    message: &Message,
    mode: AppendMode,
) -> Result<(i64, String)> {
    let uid = match mode {
        AppendMode::Copy => local_uid(),
        AppendMode::ReplaceByUid => message.uid.clone().ok_or(Error::MissingUid)?,
        AppendMode::Append | AppendMode::InsertNew => {
            message.uid.clone().unwrap_or_else(local_uid)
        }
    };

    if mode != AppendMode::Copy {
        if let Some(existing) = do_get_message(tx, folder_id, &uid)? {
            if mode == AppendMode::InsertNew {
                return Err(Error::DuplicateUid { folder_id, uid });
            }
            remove_replaced(tx, &existing)?;
        }
    }

    let c = CompiledMessage::compile(message, ctx, Utc::now());
    tx.execute(
        "INSERT INTO messages (
             deleted, folder_id, uid, subject, date, flags, sender_list, to_list, cc_list,
             bcc_list, reply_to_list, html_content, text_content, attachment_count,
             internal_date, message_id, preview
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            c.flags.contains(&Flag::Deleted),
            folder_id,
            uid,
            c.subject,
            c.date,
            flags_to_column(&c.flags),
            c.sender_list,
            c.to_list,
            c.cc_list,
            c.bcc_list,
            c.reply_to_list,
            c.html_content,
            c.text_content,
            c.attachment_count,
            c.internal_date,
            c.message_id,
            c.preview,
        ],
    )?;
    let id = tx.last_insert_rowid();

    for part in &message.attachments {
        do_save_attachment(tx, id, part, true)?;
    }
    do_save_headers(tx, id, &message.headers, ctx.save_all_headers)?;
    do_adjust_counts(tx, folder_id, contribution(&c.flags))?;
    Ok((id, uid))
}

/// Rewrite a stored message in place. The row id and counters are left alone;
/// a message without a UID keeps the stored one.
pub(super) fn do_update_message(
    tx: &Txn<'_>,
    ctx: &WriteCtx<'_>,
    id: i64,
    message: &Message,
) -> Result<()> {
    let existing = do_get_message_by_id(tx, id)?.ok_or(Error::MessageNotFound(id))?;
    let uid = message.uid.clone().unwrap_or(existing.uid);
    let c = CompiledMessage::compile(message, ctx, Utc::now());
    tx.execute(
        "UPDATE messages SET
             uid = ?1, subject = ?2, sender_list = ?3, date = ?4, flags = ?5, deleted = ?6,
             to_list = ?7, cc_list = ?8, bcc_list = ?9, html_content = ?10, text_content = ?11,
             preview = ?12, reply_to_list = ?13, attachment_count = ?14
         WHERE id = ?15",
        params![
            uid,
            c.subject,
            c.sender_list,
            c.date,
            flags_to_column(&c.flags),
            c.flags.contains(&Flag::Deleted),
            c.to_list,
            c.cc_list,
            c.bcc_list,
            c.html_content,
            c.text_content,
            c.preview,
            c.reply_to_list,
            c.attachment_count,
            id,
        ],
    )?;
    for part in &message.attachments {
        do_save_attachment(tx, id, part, false)?;
    }
    do_save_headers(tx, id, &message.headers, ctx.save_all_headers)?;
    Ok(())
}

/// Null the content of a message and drop its headers and attachments,
/// keeping folder and UID for sync bookkeeping.
fn tombstone(tx: &Txn<'_>, id: i64) -> Result<()> {
    tx.execute(
        "UPDATE messages SET deleted = 1, subject = NULL, sender_list = NULL, date = NULL,
             to_list = NULL, cc_list = NULL, bcc_list = NULL, preview = NULL,
             html_content = NULL, text_content = NULL, reply_to_list = NULL,
             attachment_count = 0
         WHERE id = ?1",
        [id],
    )?;
    do_delete_attachments(tx, id)?;
    do_delete_headers(tx, id)?;
    Ok(())
}

/// Set `flag` on message `id`, keeping the folder counters in step. Returns
/// the stored flags afterwards.
pub(super) fn do_set_flag(tx: &Txn<'_>, id: i64, flag: &Flag, value: bool) -> Result<Flags> {
    let (folder_id, mut flags) = load_state(tx, id)?;
    if *flag == Flag::Deleted && value {
        tombstone(tx, id)?;
    }
    do_adjust_counts(tx, folder_id, counter_delta(&flags, flag, value))?;
    flags.set(flag.clone(), value);
    write_flags(tx, id, &flags)?;
    Ok(flags)
}

/// Ids of every message in a folder, tombstones included.
pub(super) fn do_message_ids_in_folder(conn: &Connection, folder_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM messages WHERE folder_id = ?1 ORDER BY id")?;
    let ids = stmt
        .query_map([folder_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Remove message `id` for good. Headers and attachment rows go with it
/// through the trigger.
pub(super) fn do_destroy(tx: &Txn<'_>, id: i64) -> Result<()> {
    let (folder_id, flags) = load_state(tx, id)?;
    do_adjust_counts(tx, folder_id, counter_delta(&flags, &Flag::XDestroyed, true))?;
    do_delete_attachments(tx, id)?;
    tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
    Ok(())
}

/// Move message `id` into `dest_folder`, giving it a fresh local UID and
/// leaving a seen, deleted placeholder under the old UID in its source folder.
/// Returns the new UID.
pub(super) fn do_move_message(
    tx: &Txn<'_>,
    ctx: &WriteCtx<'_>,
    id: i64,
    dest_folder: i64,
) -> Result<String> {
    do_require_folder(tx, dest_folder)?;
    let existing = do_get_message_by_id(tx, id)?.ok_or(Error::MessageNotFound(id))?;
    let source = existing.folder_id;

    let live = contribution(&existing.flags);
    do_adjust_counts(tx, source, negate(live))?;
    do_adjust_counts(tx, dest_folder, live)?;

    let new_uid = local_uid();
    log::debug!(
        "Moving message {id} (uid {}) from folder {source} to {dest_folder}",
        existing.uid
    );
    tx.execute(
        "UPDATE messages SET folder_id = ?1, uid = ?2 WHERE id = ?3",
        params![dest_folder, new_uid, id],
    )?;

    let mut placeholder = Message::with_uid(existing.uid);
    placeholder.flags.set(Flag::Deleted, true);
    placeholder.flags.set(Flag::Seen, true);
    do_append_message(tx, ctx, source, &placeholder, AppendMode::Append)?;

    Ok(new_uid)
}

/// Rebuild a [`Message`] from what the store holds for `id`, attachment bytes
/// included. Inline references are turned back into `cid:` tokens so the
/// copy points at its own files.
fn load_stored_message(tx: &Txn<'_>, id: i64) -> Result<Message> {
    let stored = do_get_message_by_id(tx, id)?.ok_or(Error::MessageNotFound(id))?;
    let content = do_message_content(tx, id)?.unwrap_or_default();
    let headers = do_load_headers(tx, &[id])?.remove(&id).unwrap_or_default();
    let attachments = do_load_parts(tx, id)?;

    let mut html = content.html;
    if let Some(h) = html.as_mut() {
        for part in &attachments {
            if let (Some(old), Some(cid)) = (part.id, part.content_id.as_deref()) {
                let locator = attachment_locator(&tx.layout().account_uuid, old);
                let cid = cid.trim_matches(|c| c == '<' || c == '>');
                *h = h.replace(&locator, &format!("cid:{cid}"));
            }
        }
    }

    let mut body = Vec::new();
    if let Some(text) = content.text {
        body.push(Viewable::plain(text));
    }
    if let Some(html) = html {
        body.push(Viewable::html(html));
    }

    Ok(Message {
        uid: None,
        subject: stored.subject,
        from: stored.from,
        to: stored.to,
        cc: stored.cc,
        bcc: stored.bcc,
        reply_to: stored.reply_to,
        sent_date: stored.sent_date,
        internal_date: stored.internal_date,
        message_id: stored.message_id,
        flags: stored.flags,
        headers,
        body,
        attachments: attachments
            .into_iter()
            .map(|mut part| {
                part.id = None;
                part
            })
            .collect(),
    })
}

/// Copy already-stored message `id` into `dest_folder` under a fresh local
/// UID. Locally stored attachment files are duplicated for the copy.
pub(super) fn do_copy_local_message(
    tx: &Txn<'_>,
    ctx: &WriteCtx<'_>,
    id: i64,
    dest_folder: i64,
) -> Result<(i64, String)> {
    do_require_folder(tx, dest_folder)?;
    let message = load_stored_message(tx, id)?;
    do_append_message(tx, ctx, dest_folder, &message, AppendMode::Copy)
}

pub(super) fn do_change_uid(conn: &Connection, id: i64, uid: &str) -> Result<()> {
    let changed = conn.execute("UPDATE messages SET uid = ?1 WHERE id = ?2", params![uid, id])?;
    if changed == 0 {
        return Err(Error::MessageNotFound(id));
    }
    Ok(())
}

/// Destroy live messages beyond the folder's visible limit, newest kept.
/// Returns how many were removed.
pub(super) fn do_purge_to_visible_limit(
    tx: &Txn<'_>,
    folder_id: i64,
    on_removed: &mut dyn FnMut(&LocalMessage),
) -> Result<usize> {
    let folder = do_require_folder(tx, folder_id)?;
    if folder.visible_limit == 0 {
        return Ok(0);
    }
    let messages = do_get_messages(tx, folder_id, false)?;
    let excess: Vec<_> = messages
        .into_iter()
        .skip(folder.visible_limit as usize)
        .collect();
    for m in &excess {
        on_removed(m);
        do_destroy(tx, m.id)?;
    }
    if !excess.is_empty() {
        log::debug!("Purged {} messages from {}", excess.len(), folder.name);
    }
    Ok(excess.len())
}

/// Delete messages sent before `cutoff`, then rebuild the counters.
pub(super) fn do_clear_messages_older_than(
    tx: &Txn<'_>,
    folder_id: i64,
    cutoff: DateTime<Utc>,
) -> Result<usize> {
    do_require_folder(tx, folder_id)?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM messages WHERE folder_id = ?1 AND date < ?2")?;
        let ids = stmt
            .query_map(params![folder_id, cutoff.timestamp_millis()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };
    for id in &ids {
        do_delete_attachments(tx, *id)?;
        tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
    }
    do_recompute_counts(tx, folder_id)?;
    Ok(ids.len())
}

/// Empty a folder and forget its sync position.
pub(super) fn do_clear_all_messages(tx: &Txn<'_>, folder_id: i64) -> Result<usize> {
    do_require_folder(tx, folder_id)?;
    do_delete_attachment_files_in_folder(tx, folder_id)?;
    let removed = tx.execute("DELETE FROM messages WHERE folder_id = ?1", [folder_id])?;
    tx.execute(
        "UPDATE folders SET push_state = NULL, last_pushed = NULL, last_updated = NULL WHERE id = ?1",
        [folder_id],
    )?;
    do_recompute_counts(tx, folder_id)?;
    Ok(removed)
}

/// Drop every live message that has a server UID and zero the counters.
pub(super) fn do_clear_remote_messages(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM messages WHERE deleted = 0 AND uid NOT LIKE ?1",
        [format!("{LOCAL_UID_PREFIX}%")],
    )?;
    conn.execute("UPDATE folders SET unread_count = 0, flagged_count = 0", [])?;
    Ok(removed)
}

/// Persist an edited header set, updating X_GOT_ALL_HEADERS to match.
pub(super) fn do_save_message_headers(
    tx: &Txn<'_>,
    id: i64,
    headers: &Headers,
    save_all: bool,
) -> Result<Flags> {
    let (_, mut flags) = load_state(tx, id)?;
    let complete = do_save_headers(tx, id, headers, save_all)?;
    flags.set(Flag::XGotAllHeaders, complete);
    write_flags(tx, id, &flags)?;
    Ok(flags)
}

/// Reflect a stored flag change in a message the caller holds.
pub(super) fn apply_flags(message: &mut LocalMessage, flags: Flags) {
    let deleted = flags.contains(&Flag::Deleted);
    if deleted && !message.deleted {
        message.clear_content();
    }
    message.deleted = deleted;
    message.flags = flags;
}
