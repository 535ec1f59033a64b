use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The backing store is closed, deleted, or its directory can't be used.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The version marker has already been reset to 0 when this is returned,
    /// so the next open rebuilds the schema from scratch.
    #[error("Schema upgrade from version {from} to {to} failed: {source}")]
    SchemaUpgrade {
        from: u32,
        to: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Folder {0} already exists")]
    FolderExists(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(i64),

    #[error("Message with UID {uid} already exists in folder {folder_id}")]
    DuplicateUid { folder_id: i64, uid: String },

    #[error("Message has no UID")]
    MissingUid,

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// True when the backend reported a transient lock conflict.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_recognised() {
        let busy = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());

        let other = Error::Database(rusqlite::Error::QueryReturnedNoRows);
        assert!(!other.is_busy());
        assert!(!Error::MissingUid.is_busy());
    }
}
