use tokio::sync::{mpsc, oneshot};

use super::commands::StoreCmd;
use super::LocalStore;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{
    Flag, Folder, LocalMessage, Message, MessageRetrievalListener, PendingCommand, SearchQuery,
};

// ---------------------------------------------------------------------------
// StoreHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

/// Async access to a [`LocalStore`] owned by a dedicated thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

fn unavailable() -> Error {
    Error::StorageUnavailable("store thread has exited".into())
}

impl StoreHandle {
    /// Open (or create) the store and spawn the background thread.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::spawn(LocalStore::open(config)?)
    }

    /// Hand an already opened store to a background thread.
    pub fn spawn(store: LocalStore) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("neverlight-mail-store".into())
            .spawn(move || run_loop(store, rx))
            .map_err(|e| Error::StorageUnavailable(format!("Failed to spawn store thread: {e}")))?;

        Ok(StoreHandle { tx })
    }

    async fn request<T>(&self, cmd: StoreCmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx.send(cmd).map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())?
    }

    // -- async methods -------------------------------------------------------

    pub async fn open_folder(&self, name: impl Into<String>) -> Result<Folder> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::OpenFolder { name: name.into(), reply }, rx)
            .await
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::ListFolders { reply }, rx).await
    }

    pub async fn recompute_counts(&self, folder_id: i64) -> Result<(u32, u32)> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::RecomputeCounts { folder_id, reply }, rx)
            .await
    }

    pub async fn append_messages(&self, folder_id: i64, messages: Vec<Message>) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::AppendMessages {
                folder_id,
                messages,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn get_message(&self, folder_id: i64, uid: impl Into<String>) -> Result<Option<LocalMessage>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::GetMessage {
                folder_id,
                uid: uid.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn get_messages(&self, folder_id: i64, include_deleted: bool) -> Result<Vec<LocalMessage>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::GetMessages {
                folder_id,
                include_deleted,
                reply,
            },
            rx,
        )
        .await
    }

    /// Returns the messages with their stored flags applied.
    pub async fn set_flag(
        &self,
        messages: Vec<LocalMessage>,
        flag: Flag,
        value: bool,
    ) -> Result<Vec<LocalMessage>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::SetFlag {
                messages,
                flag,
                value,
                reply,
            },
            rx,
        )
        .await
    }

    /// Returns the messages with their new folder and UID.
    pub async fn move_messages(
        &self,
        messages: Vec<LocalMessage>,
        dest_folder: i64,
    ) -> Result<Vec<LocalMessage>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::MoveMessages {
                messages,
                dest_folder,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn copy_messages(&self, messages: Vec<LocalMessage>, dest_folder: i64) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::CopyMessages {
                messages,
                dest_folder,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn destroy_messages(&self, messages: Vec<LocalMessage>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::DestroyMessages { messages, reply }, rx)
            .await
    }

    /// Every match, newest first.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<LocalMessage>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::Search { query, reply }, rx).await
    }

    pub async fn add_pending_command(
        &self,
        command: impl Into<String>,
        arguments: Vec<String>,
    ) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCmd::AddPendingCommand {
                command: command.into(),
                arguments,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::PendingCommands { reply }, rx).await
    }

    pub async fn remove_pending_command(&self, id: i64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::RemovePendingCommand { id, reply }, rx)
            .await
    }

    pub async fn prune_attachments(&self, force: bool) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCmd::PruneAttachments { force, reply }, rx)
            .await
    }
}

// ---------------------------------------------------------------------------
// Background thread
// ---------------------------------------------------------------------------

/// Gathers streamed search results.
#[derive(Default)]
struct Collected(Vec<LocalMessage>);

impl MessageRetrievalListener for Collected {
    fn message_finished(&mut self, message: &LocalMessage, _index: usize) {
        self.0.push(message.clone());
    }

    fn messages_finished(&mut self, _total: usize) {}
}

fn run_loop(store: LocalStore, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCmd::OpenFolder { name, reply } => {
                let _ = reply.send(store.open_folder(&name));
            }
            StoreCmd::ListFolders { reply } => {
                let _ = reply.send(store.list_folders());
            }
            StoreCmd::RecomputeCounts { folder_id, reply } => {
                let _ = reply.send(store.recompute_counts(folder_id));
            }
            StoreCmd::AppendMessages {
                folder_id,
                messages,
                reply,
            } => {
                let _ = reply.send(store.append_messages(folder_id, &messages));
            }
            StoreCmd::GetMessage {
                folder_id,
                uid,
                reply,
            } => {
                let _ = reply.send(store.get_message(folder_id, &uid));
            }
            StoreCmd::GetMessages {
                folder_id,
                include_deleted,
                reply,
            } => {
                let _ = reply.send(store.get_messages(folder_id, include_deleted, None));
            }
            StoreCmd::SetFlag {
                mut messages,
                flag,
                value,
                reply,
            } => {
                let result = store.set_flag(&mut messages, flag, value).map(|()| messages);
                let _ = reply.send(result);
            }
            StoreCmd::MoveMessages {
                mut messages,
                dest_folder,
                reply,
            } => {
                let result = store
                    .move_messages(&mut messages, dest_folder)
                    .map(|()| messages);
                let _ = reply.send(result);
            }
            StoreCmd::CopyMessages {
                messages,
                dest_folder,
                reply,
            } => {
                let _ = reply.send(store.copy_local_messages(&messages, dest_folder));
            }
            StoreCmd::DestroyMessages { messages, reply } => {
                let _ = reply.send(store.destroy_messages(&messages));
            }
            StoreCmd::Search { query, reply } => {
                let mut collected = Collected::default();
                let result = store.search(&query, &mut collected).map(|_| collected.0);
                let _ = reply.send(result);
            }
            StoreCmd::AddPendingCommand {
                command,
                arguments,
                reply,
            } => {
                let _ = reply.send(store.add_pending_command(&command, &arguments));
            }
            StoreCmd::PendingCommands { reply } => {
                let _ = reply.send(store.pending_commands());
            }
            StoreCmd::RemovePendingCommand { id, reply } => {
                let _ = reply.send(store.remove_pending_command(id));
            }
            StoreCmd::PruneAttachments { force, reply } => {
                let _ = reply.send(store.prune_attachments(force));
            }
        }
    }
    log::info!("Store thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(dir: &std::path::Path) -> StoreHandle {
        let config = StoreConfig::new("handle-test").with_data_dir(dir);
        StoreHandle::open(config).expect("open handle")
    }

    #[tokio::test]
    async fn handle_round_trips_through_store_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = test_handle(dir.path());

        let inbox = handle.open_folder("INBOX").await.expect("open inbox");
        let archive = handle.open_folder("Archive").await.expect("open archive");
        let mut m = Message::with_uid("imap-1");
        m.subject = Some("hello".into());
        let uids = handle
            .append_messages(inbox.id, vec![m])
            .await
            .expect("append");
        assert_eq!(uids, ["imap-1"]);

        let stored = handle
            .get_message(inbox.id, "imap-1")
            .await
            .expect("get")
            .expect("stored");
        let seen = handle
            .set_flag(vec![stored], Flag::Seen, true)
            .await
            .expect("set flag");
        assert!(seen[0].is_set(&Flag::Seen));

        let moved = handle
            .move_messages(seen, archive.id)
            .await
            .expect("move");
        assert_eq!(moved[0].folder_id, archive.id);
        assert!(crate::store::is_local_uid(&moved[0].uid));

        let found = handle
            .search(SearchQuery {
                text: Some("hello".into()),
                ..Default::default()
            })
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, moved[0].uid);

        let names: Vec<String> = handle
            .list_folders()
            .await
            .expect("list")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["Archive", "INBOX"]);
    }

    #[tokio::test]
    async fn pending_commands_through_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = test_handle(dir.path());

        let id = handle
            .add_pending_command("markRead", vec!["INBOX".into(), "imap-1".into()])
            .await
            .expect("add");
        let queued = handle.pending_commands().await.expect("list");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);

        handle.remove_pending_command(id).await.expect("remove");
        assert!(handle.pending_commands().await.expect("list").is_empty());
    }
}
