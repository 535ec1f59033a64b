use tokio::sync::oneshot;

use crate::error::Result;
use crate::models::{Flag, Folder, LocalMessage, Message, PendingCommand, SearchQuery};

pub(super) enum StoreCmd {
    OpenFolder {
        name: String,
        reply: oneshot::Sender<Result<Folder>>,
    },
    ListFolders {
        reply: oneshot::Sender<Result<Vec<Folder>>>,
    },
    RecomputeCounts {
        folder_id: i64,
        reply: oneshot::Sender<Result<(u32, u32)>>,
    },
    AppendMessages {
        folder_id: i64,
        messages: Vec<Message>,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    GetMessage {
        folder_id: i64,
        uid: String,
        reply: oneshot::Sender<Result<Option<LocalMessage>>>,
    },
    GetMessages {
        folder_id: i64,
        include_deleted: bool,
        reply: oneshot::Sender<Result<Vec<LocalMessage>>>,
    },
    // Message batches travel by value and come back updated.
    SetFlag {
        messages: Vec<LocalMessage>,
        flag: Flag,
        value: bool,
        reply: oneshot::Sender<Result<Vec<LocalMessage>>>,
    },
    MoveMessages {
        messages: Vec<LocalMessage>,
        dest_folder: i64,
        reply: oneshot::Sender<Result<Vec<LocalMessage>>>,
    },
    CopyMessages {
        messages: Vec<LocalMessage>,
        dest_folder: i64,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    DestroyMessages {
        messages: Vec<LocalMessage>,
        reply: oneshot::Sender<Result<()>>,
    },
    Search {
        query: SearchQuery,
        reply: oneshot::Sender<Result<Vec<LocalMessage>>>,
    },
    AddPendingCommand {
        command: String,
        arguments: Vec<String>,
        reply: oneshot::Sender<Result<i64>>,
    },
    PendingCommands {
        reply: oneshot::Sender<Result<Vec<PendingCommand>>>,
    },
    RemovePendingCommand {
        id: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    PruneAttachments {
        force: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
}
