mod attachments;
mod commands;
mod flags;
mod folders;
mod handle;
mod headers;
mod lock;
mod messages;
mod pending;
mod queries;
mod schema;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{StorageLayout, StoreConfig};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, AttachmentInfo, Flag, Flags, Folder, HeaderState, LocalMessage, Message,
    MessageRetrievalListener, PendingCommand, SearchQuery, StoredContent,
};
use crate::render::{ContentRenderer, DefaultRenderer};

use lock::LockableDatabase;
use messages::{apply_flags, AppendMode, WriteCtx};

pub use attachments::attachment_locator;
pub use flags::{flags_from_column, flags_to_column};
pub use handle::StoreHandle;
pub use headers::IDENTITY_HEADER;
pub use messages::{is_local_uid, local_uid, LOCAL_UID_PREFIX};
pub use queries::FIRST_PAGE_SIZE;
pub use schema::DB_VERSION;

// ---------------------------------------------------------------------------
// LocalStore: blocking facade over one account's store
// ---------------------------------------------------------------------------

/// Durable cache of one account's folders, messages, headers, attachments
/// and pending remote commands.
///
/// Every method is blocking and runs in its own transaction. The store is
/// `Send + Sync`; callers wanting parallelism share it across threads, or use
/// [`StoreHandle`] from async code.
pub struct LocalStore {
    db: LockableDatabase,
    config: StoreConfig,
    renderer: Box<dyn ContentRenderer>,
}

impl LocalStore {
    /// Open (or create) the store described by `config`, upgrading the schema
    /// as needed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_renderer(config, Box::new(DefaultRenderer))
    }

    pub fn open_with_renderer(
        config: StoreConfig,
        renderer: Box<dyn ContentRenderer>,
    ) -> Result<Self> {
        let layout = config.layout();
        log::info!("Opening local store {}", layout.database.display());
        let db = LockableDatabase::open(
            layout,
            Duration::from_millis(config.busy_timeout_ms),
            Box::new(schema::prepare),
        )?;
        Ok(LocalStore { db, config, renderer })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> Result<StorageLayout> {
        self.db.layout()
    }

    /// False after [`LocalStore::delete`] until [`LocalStore::recreate`].
    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    fn ctx(&self) -> WriteCtx<'_> {
        WriteCtx {
            renderer: self.renderer.as_ref(),
            save_all_headers: self.config.save_all_headers,
        }
    }

    // -- store ---------------------------------------------------------------

    pub fn schema_version(&self) -> Result<u32> {
        self.db.execute(true, |tx| schema::stored_version(tx))
    }

    /// Bytes on disk: database file plus attachment files.
    pub fn size(&self) -> Result<u64> {
        let layout = self.db.layout()?;
        let database = match std::fs::metadata(&layout.database) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(database + attachments::attachment_dir_size(&layout.attachments)?)
    }

    pub fn compact(&self) -> Result<()> {
        log::info!("Compacting local store");
        self.db
            .execute_unscoped(|conn, _| Ok(conn.execute_batch("VACUUM")?))
    }

    /// Drop every cached attachment file and every live message fetched from
    /// the server. Locally created messages and tombstones survive.
    pub fn clear(&self) -> Result<()> {
        log::info!("Clearing local store for {}", self.config.account_uuid);
        let removed = self.db.execute(false, |tx| {
            attachments::do_prune_attachments(tx, true)?;
            messages::do_clear_remote_messages(tx)
        })?;
        log::debug!("Cleared {removed} messages");
        self.compact()
    }

    pub fn message_count(&self) -> Result<u64> {
        self.db.execute(true, |tx| queries::do_message_count(tx))
    }

    pub fn folder_count(&self) -> Result<u64> {
        self.db.execute(true, |tx| folders::do_folder_count(tx))
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>> {
        self.db.execute(true, |tx| folders::do_list_folders(tx))
    }

    /// Close the store and remove its database and attachment directory.
    pub fn delete(&self) -> Result<()> {
        log::info!("Deleting local store for {}", self.config.account_uuid);
        self.db.delete()
    }

    /// Delete, then bootstrap an empty store in the same place.
    pub fn recreate(&self) -> Result<()> {
        log::info!("Recreating local store for {}", self.config.account_uuid);
        self.db.recreate()
    }

    /// Move the store under `data_dir` and reopen it there.
    pub fn switch_storage(&self, data_dir: &Path) -> Result<()> {
        let target = StorageLayout::new(data_dir, &self.config.account_uuid);
        self.db.switch_storage(target)
    }

    pub fn reset_visible_limits(&self, limit: u32) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_reset_visible_limits(tx, limit))
    }

    pub fn attachment_info(&self, id: i64) -> Result<Option<AttachmentInfo>> {
        self.db
            .execute(true, |tx| attachments::do_attachment_info(tx, id))
    }

    pub fn attachment_type(&self, id: i64) -> Result<Option<String>> {
        self.db
            .execute(true, |tx| attachments::do_attachment_type(tx, id))
    }

    pub fn attachments(&self, message_id: i64) -> Result<Vec<Attachment>> {
        self.db
            .execute(true, |tx| attachments::do_load_attachments(tx, message_id))
    }

    /// Delete cached attachment files. See [`LocalStore::clear`] for the
    /// forced variant's use.
    pub fn prune_attachments(&self, force: bool) -> Result<usize> {
        self.db
            .execute(false, |tx| attachments::do_prune_attachments(tx, force))
    }

    pub fn sweep_orphan_files(&self) -> Result<usize> {
        self.db
            .execute(false, |tx| attachments::do_sweep_orphan_files(tx))
    }

    // -- folders -------------------------------------------------------------

    /// Open a folder by name, creating it with the configured visible limit
    /// when it doesn't exist yet.
    pub fn open_folder(&self, name: &str) -> Result<Folder> {
        let limit = self.config.display_count;
        self.db
            .execute(false, |tx| folders::do_open_folder(tx, name, limit))
    }

    /// Fails with `FolderNotFound` when no such folder exists.
    pub fn open_folder_by_id(&self, folder_id: i64) -> Result<Folder> {
        self.db
            .execute(true, |tx| folders::do_require_folder(tx, folder_id))
    }

    pub fn folder_exists(&self, name: &str) -> Result<bool> {
        self.db.execute(true, |tx| folders::do_folder_exists(tx, name))
    }

    pub fn create_folder(&self, name: &str, visible_limit: u32) -> Result<Folder> {
        self.db
            .execute(false, |tx| folders::do_create_folder(tx, name, visible_limit))
    }

    pub fn delete_folder(&self, folder_id: i64) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_delete_folder(tx, folder_id))
    }

    /// Live messages in the folder.
    pub fn folder_message_count(&self, folder_id: i64) -> Result<u64> {
        self.db
            .execute(true, |tx| folders::do_folder_message_count(tx, folder_id))
    }

    /// Negative counts are stored as 0.
    pub fn set_unread_count(&self, folder_id: i64, count: i64) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_unread_count(tx, folder_id, count))
    }

    pub fn set_flagged_count(&self, folder_id: i64, count: i64) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_flagged_count(tx, folder_id, count))
    }

    /// Rebuild both counters from the folder's live messages. Returns
    /// `(unread, flagged)`.
    pub fn recompute_counts(&self, folder_id: i64) -> Result<(u32, u32)> {
        self.db
            .execute(false, |tx| folders::do_recompute_counts(tx, folder_id))
    }

    pub fn set_last_checked(&self, folder_id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_last_checked(tx, folder_id, at))
    }

    pub fn set_last_pushed(&self, folder_id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_last_pushed(tx, folder_id, at))
    }

    pub fn set_status(&self, folder_id: i64, status: Option<&str>) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_status(tx, folder_id, status))
    }

    pub fn set_push_state(&self, folder_id: i64, state: Option<&str>) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_push_state(tx, folder_id, state))
    }

    pub fn set_visible_limit(&self, folder_id: i64, limit: u32) -> Result<()> {
        self.db
            .execute(false, |tx| folders::do_set_visible_limit(tx, folder_id, limit))
    }

    /// Destroy live messages past the folder's visible limit. `on_removed` sees
    /// each one before it goes; it may be called again if the write is retried.
    pub fn purge_to_visible_limit(
        &self,
        folder_id: i64,
        on_removed: &mut dyn FnMut(&LocalMessage),
    ) -> Result<usize> {
        self.db.execute(false, |tx| {
            messages::do_purge_to_visible_limit(tx, folder_id, &mut *on_removed)
        })
    }

    pub fn clear_messages_older_than(&self, folder_id: i64, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.execute(false, |tx| {
            messages::do_clear_messages_older_than(tx, folder_id, cutoff)
        })
    }

    pub fn clear_all_messages(&self, folder_id: i64) -> Result<usize> {
        self.db
            .execute(false, |tx| messages::do_clear_all_messages(tx, folder_id))
    }

    pub fn last_numeric_uid(&self, folder_id: i64) -> Result<Option<u64>> {
        self.db
            .execute(true, |tx| folders::do_last_numeric_uid(tx, folder_id))
    }

    // -- messages ------------------------------------------------------------

    fn append_with(&self, folder_id: i64, batch: &[Message], mode: AppendMode) -> Result<Vec<String>> {
        let ctx = self.ctx();
        self.db.execute(false, |tx| {
            folders::do_require_folder(tx, folder_id)?;
            batch
                .iter()
                .map(|m| {
                    messages::do_append_message(tx, &ctx, folder_id, m, mode).map(|(_, uid)| uid)
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Write a batch into the folder in one transaction, returning each
    /// message's UID. A UID already present in the folder is replaced.
    pub fn append_messages(&self, folder_id: i64, batch: &[Message]) -> Result<Vec<String>> {
        self.append_with(folder_id, batch, AppendMode::Append)
    }

    /// Like [`LocalStore::append_messages`] for one message, but fails with
    /// `DuplicateUid` instead of replacing.
    pub fn insert_new(&self, folder_id: i64, message: &Message) -> Result<String> {
        let mut uids = self.append_with(folder_id, std::slice::from_ref(message), AppendMode::InsertNew)?;
        Ok(uids.remove(0))
    }

    /// Replace the message with the same UID, inserting when there is none.
    /// The message must carry a UID.
    pub fn replace_by_uid(&self, folder_id: i64, message: &Message) -> Result<String> {
        let mut uids =
            self.append_with(folder_id, std::slice::from_ref(message), AppendMode::ReplaceByUid)?;
        Ok(uids.remove(0))
    }

    /// Append under fresh local UIDs; any UID the messages carry is ignored.
    pub fn copy_messages(&self, batch: &[Message], dest_folder: i64) -> Result<Vec<String>> {
        self.append_with(dest_folder, batch, AppendMode::Copy)
    }

    /// Copy already-stored messages, attachments and headers included, into
    /// `dest_folder`. Returns the copies' UIDs.
    pub fn copy_local_messages(
        &self,
        sources: &[LocalMessage],
        dest_folder: i64,
    ) -> Result<Vec<String>> {
        let ctx = self.ctx();
        self.db.execute(false, |tx| {
            sources
                .iter()
                .map(|m| {
                    messages::do_copy_local_message(tx, &ctx, m.id, dest_folder).map(|(_, uid)| uid)
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Append one message and mark it fully downloaded.
    pub fn store_small_message(&self, folder_id: i64, message: &Message) -> Result<LocalMessage> {
        let ctx = self.ctx();
        self.db.execute(false, |tx| {
            folders::do_require_folder(tx, folder_id)?;
            let (id, _) =
                messages::do_append_message(tx, &ctx, folder_id, message, AppendMode::Append)?;
            messages::do_set_flag(tx, id, &Flag::XDownloadedFull, true)?;
            queries::do_get_message_by_id(tx, id)?.ok_or(Error::MessageNotFound(id))
        })
    }

    /// Rewrite message `id` in place; its counters contribution is untouched.
    pub fn update_message(&self, id: i64, message: &Message) -> Result<()> {
        let ctx = self.ctx();
        self.db
            .execute(false, |tx| messages::do_update_message(tx, &ctx, id, message))
    }

    /// Move messages into `dest_folder`, updating each in place with its new
    /// folder and UID.
    pub fn move_messages(&self, batch: &mut [LocalMessage], dest_folder: i64) -> Result<()> {
        let ctx = self.ctx();
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let new_uids = self.db.execute(false, |tx| {
            ids.iter()
                .map(|id| messages::do_move_message(tx, &ctx, *id, dest_folder))
                .collect::<Result<Vec<_>>>()
        })?;
        for (m, uid) in batch.iter_mut().zip(new_uids) {
            m.folder_id = dest_folder;
            m.uid = uid;
        }
        Ok(())
    }

    pub fn set_flag(&self, batch: &mut [LocalMessage], flag: Flag, value: bool) -> Result<()> {
        self.set_flags(batch, std::slice::from_ref(&flag), value)
    }

    /// Set or clear `flags` on every message of the batch in one transaction,
    /// keeping folder counters in step.
    pub fn set_flags(&self, batch: &mut [LocalMessage], flags: &[Flag], value: bool) -> Result<()> {
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let stored = self.db.execute(false, |tx| {
            ids.iter()
                .map(|id| -> Result<Option<Flags>> {
                    let mut latest = None;
                    for flag in flags {
                        latest = Some(messages::do_set_flag(tx, *id, flag, value)?);
                    }
                    Ok(latest)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        for (m, latest) in batch.iter_mut().zip(stored) {
            if let Some(latest) = latest {
                apply_flags(m, latest);
            }
        }
        Ok(())
    }

    /// Set or clear `flags` on every message in the folder, tombstones
    /// included.
    pub fn set_flags_in_folder(&self, folder_id: i64, flags: &[Flag], value: bool) -> Result<()> {
        self.db.execute(false, |tx| {
            folders::do_require_folder(tx, folder_id)?;
            for id in messages::do_message_ids_in_folder(tx, folder_id)? {
                for flag in flags {
                    messages::do_set_flag(tx, id, flag, value)?;
                }
            }
            Ok(())
        })
    }

    /// Remove messages for good, leaving no tombstone.
    pub fn destroy_messages(&self, batch: &[LocalMessage]) -> Result<()> {
        self.db.execute(false, |tx| {
            for m in batch {
                messages::do_destroy(tx, m.id)?;
            }
            Ok(())
        })
    }

    pub fn change_uid(&self, message: &mut LocalMessage, uid: &str) -> Result<()> {
        let id = message.id;
        self.db
            .execute(false, |tx| messages::do_change_uid(tx, id, uid))?;
        message.uid = uid.to_string();
        Ok(())
    }

    /// `Ok(None)` when the folder has no message with this UID.
    pub fn get_message(&self, folder_id: i64, uid: &str) -> Result<Option<LocalMessage>> {
        self.db
            .execute(true, |tx| queries::do_get_message(tx, folder_id, uid))
    }

    pub fn get_message_by_id(&self, id: i64) -> Result<Option<LocalMessage>> {
        self.db
            .execute(true, |tx| queries::do_get_message_by_id(tx, id))
    }

    /// Messages of a folder, newest first, optionally reported to `listener`
    /// as well.
    pub fn get_messages(
        &self,
        folder_id: i64,
        include_deleted: bool,
        listener: Option<&mut dyn MessageRetrievalListener>,
    ) -> Result<Vec<LocalMessage>> {
        let found = self
            .db
            .execute(true, |tx| queries::do_get_messages(tx, folder_id, include_deleted))?;
        if let Some(listener) = listener {
            for (index, m) in found.iter().enumerate() {
                listener.message_finished(m, index);
            }
            listener.messages_finished(found.len());
        }
        Ok(found)
    }

    pub fn get_messages_by_uids(&self, folder_id: i64, uids: &[String]) -> Result<Vec<LocalMessage>> {
        self.db
            .execute(true, |tx| queries::do_get_messages_by_uids(tx, folder_id, uids))
    }

    pub fn message_content(&self, id: i64) -> Result<Option<StoredContent>> {
        self.db.execute(true, |tx| queries::do_message_content(tx, id))
    }

    /// Stream matches for `query` to `listener`. Returns the match count.
    pub fn search(
        &self,
        query: &SearchQuery,
        listener: &mut dyn MessageRetrievalListener,
    ) -> Result<usize> {
        self.db
            .execute(true, |tx| queries::do_search(tx, query, &mut *listener))
    }

    // -- headers -------------------------------------------------------------

    /// Load headers for every message in `batch` that hasn't got them yet, in
    /// one query.
    pub fn populate_headers(&self, batch: &mut [LocalMessage]) -> Result<()> {
        let ids: Vec<i64> = batch
            .iter()
            .filter(|m| matches!(m.headers, HeaderState::Unloaded))
            .map(|m| m.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut loaded = self
            .db
            .execute(true, |tx| headers::do_load_headers(tx, &ids))?;
        for m in batch.iter_mut() {
            if matches!(m.headers, HeaderState::Unloaded) {
                let found = loaded.remove(&m.id).unwrap_or_default();
                m.headers = HeaderState::Loaded(found);
            }
        }
        Ok(())
    }

    /// Persist the message's (possibly edited) headers.
    pub fn save_headers(&self, message: &mut LocalMessage) -> Result<()> {
        let headers = message.headers(self)?.clone();
        let id = message.id;
        let save_all = self.config.save_all_headers;
        let flags = self.db.execute(false, |tx| {
            messages::do_save_message_headers(tx, id, &headers, save_all)
        })?;
        message.flags = flags;
        Ok(())
    }

    // -- pending commands ----------------------------------------------------

    pub fn add_pending_command(&self, command: &str, arguments: &[String]) -> Result<i64> {
        self.db.execute(false, |tx| {
            pending::do_add_pending_command(tx, command, arguments)
        })
    }

    /// Queued commands, oldest first. Nothing is removed.
    pub fn pending_commands(&self) -> Result<Vec<PendingCommand>> {
        self.db.execute(true, |tx| pending::do_pending_commands(tx))
    }

    pub fn remove_pending_command(&self, id: i64) -> Result<()> {
        self.db
            .execute(false, |tx| pending::do_remove_pending_command(tx, id))
    }

    pub fn remove_pending_commands(&self) -> Result<usize> {
        self.db
            .execute(false, |tx| pending::do_remove_pending_commands(tx))
    }
}
