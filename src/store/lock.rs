use std::fs;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use crate::config::StorageLayout;
use crate::error::{Error, Result};

/// Idle read connections kept around for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Runs on the writer connection every time the database is (re)opened.
pub type SetupFn = dyn Fn(&mut Connection, &StorageLayout) -> Result<()> + Send + Sync;

/// An open transaction plus the layout its attachment files live in.
pub struct Txn<'a> {
    conn: &'a Connection,
    layout: &'a StorageLayout,
}

impl<'a> Txn<'a> {
    pub fn layout(&self) -> &'a StorageLayout {
        self.layout
    }
}

impl Deref for Txn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

struct OpenDb {
    layout: StorageLayout,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl OpenDb {
    fn checkout_reader(&self, busy_timeout: Duration) -> Result<Connection> {
        if let Some(conn) = self.readers.lock().map_err(|_| poisoned())?.pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.layout.database,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    }

    fn checkin_reader(&self, conn: Connection) {
        if let Ok(mut idle) = self.readers.lock() {
            if idle.len() < MAX_IDLE_READERS {
                idle.push(conn);
            }
        }
    }
}

/// The only way to reach the database. Writers are serialized on one
/// connection; readers each get their own connection and may run in parallel.
pub struct LockableDatabase {
    state: RwLock<Option<OpenDb>>,
    /// Where the store lives, kept while closed so it can be recreated.
    home: Mutex<StorageLayout>,
    busy_timeout: Duration,
    setup: Box<SetupFn>,
}

impl LockableDatabase {
    pub fn open(
        layout: StorageLayout,
        busy_timeout: Duration,
        setup: Box<SetupFn>,
    ) -> Result<Self> {
        let db = open_db(layout.clone(), busy_timeout, &*setup)?;
        Ok(LockableDatabase {
            state: RwLock::new(Some(db)),
            home: Mutex::new(layout),
            busy_timeout,
            setup,
        })
    }

    /// Run `body` inside one transaction. Commits when it returns `Ok`, rolls
    /// back and hands back its error unchanged otherwise. A write that fails
    /// because the backend is busy is retried once.
    pub fn execute<T, F>(&self, read_only: bool, mut body: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let guard = self.state.read().map_err(|_| poisoned())?;
        let db = guard.as_ref().ok_or_else(closed)?;

        if read_only {
            let mut conn = db.checkout_reader(self.busy_timeout)?;
            let result = run_scoped(&mut conn, TransactionBehavior::Deferred, &db.layout, &mut body);
            db.checkin_reader(conn);
            return result;
        }

        let mut conn = db.writer.lock().map_err(|_| poisoned())?;
        match run_scoped(&mut conn, TransactionBehavior::Immediate, &db.layout, &mut body) {
            Err(e) if e.is_busy() => {
                log::warn!("Store busy, retrying transaction once: {e}");
                run_scoped(&mut conn, TransactionBehavior::Immediate, &db.layout, &mut body)
            }
            other => other,
        }
    }

    /// Run `f` on the writer connection outside any transaction (VACUUM and friends).
    pub fn execute_unscoped<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &StorageLayout) -> Result<T>,
    {
        let guard = self.state.read().map_err(|_| poisoned())?;
        let db = guard.as_ref().ok_or_else(closed)?;
        let conn = db.writer.lock().map_err(|_| poisoned())?;
        f(&conn, &db.layout)
    }

    pub fn layout(&self) -> Result<StorageLayout> {
        Ok(self.home.lock().map_err(|_| poisoned())?.clone())
    }

    pub fn is_open(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Close, move the database and attachment directory to `target`, reopen
    /// there and re-run the schema check. On a failed move the store is
    /// reopened where it was.
    pub fn switch_storage(&self, target: StorageLayout) -> Result<()> {
        let mut guard = self.state.write().map_err(|_| poisoned())?;
        let current = guard.take().ok_or_else(closed)?;
        let source = current.layout.clone();
        if source == target {
            *guard = Some(current);
            return Ok(());
        }

        if let Ok(writer) = current.writer.lock() {
            if let Err(e) = writer.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                log::warn!("WAL checkpoint before relocation failed: {e}");
            }
        }
        drop(current);

        log::info!(
            "Moving store from {} to {}",
            source.database.display(),
            target.database.display()
        );
        if let Err(e) = move_store_files(&source, &target) {
            log::warn!("Store relocation failed, reopening in place: {e}");
            *guard = Some(open_db(source, self.busy_timeout, &*self.setup)?);
            return Err(e.into());
        }

        *guard = Some(open_db(target.clone(), self.busy_timeout, &*self.setup)?);
        *self.home.lock().map_err(|_| poisoned())? = target;
        Ok(())
    }

    /// Close and remove the database and attachment files. Later calls fail
    /// with `StorageUnavailable` until `recreate`.
    pub fn delete(&self) -> Result<()> {
        let mut guard = self.state.write().map_err(|_| poisoned())?;
        drop(guard.take());
        let layout = self.layout()?;
        remove_store_files(&layout)?;
        log::info!("Deleted store {}", layout.database.display());
        Ok(())
    }

    /// Delete whatever is on disk and open an empty store in the same place.
    pub fn recreate(&self) -> Result<()> {
        let mut guard = self.state.write().map_err(|_| poisoned())?;
        drop(guard.take());
        let layout = self.layout()?;
        remove_store_files(&layout)?;
        *guard = Some(open_db(layout, self.busy_timeout, &*self.setup)?);
        Ok(())
    }
}

fn run_scoped<T, F>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    layout: &StorageLayout,
    body: &mut F,
) -> Result<T>
where
    F: FnMut(&Txn<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(behavior)?;
    let value = body(&Txn { conn: &*tx, layout })?;
    tx.commit()?;
    Ok(value)
}

fn open_db(layout: StorageLayout, busy_timeout: Duration, setup: &SetupFn) -> Result<OpenDb> {
    if let Some(parent) = layout.database.parent() {
        fs::create_dir_all(parent).map_err(|e| unavailable(parent, e))?;
    }
    fs::create_dir_all(&layout.attachments).map_err(|e| unavailable(&layout.attachments, e))?;

    let mut writer = Connection::open(&layout.database).map_err(|e| {
        Error::StorageUnavailable(format!("open {}: {e}", layout.database.display()))
    })?;
    writer.busy_timeout(busy_timeout)?;
    writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    setup(&mut writer, &layout)?;

    Ok(OpenDb {
        layout,
        writer: Mutex::new(writer),
        readers: Mutex::new(Vec::new()),
    })
}

fn move_store_files(from: &StorageLayout, to: &StorageLayout) -> io::Result<()> {
    if let Some(parent) = to.database.parent() {
        fs::create_dir_all(parent)?;
    }
    move_file(&from.database, &to.database)?;
    for suffix in ["-wal", "-shm"] {
        let side = sidecar(&from.database, suffix);
        if side.exists() {
            move_file(&side, &sidecar(&to.database, suffix))?;
        }
    }

    if from.attachments.exists() {
        if fs::rename(&from.attachments, &to.attachments).is_err() {
            fs::create_dir_all(&to.attachments)?;
            for entry in fs::read_dir(&from.attachments)? {
                let entry = entry?;
                move_file(&entry.path(), &to.attachments.join(entry.file_name()))?;
            }
            fs::remove_dir_all(&from.attachments)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

fn remove_store_files(layout: &StorageLayout) -> io::Result<()> {
    for path in [
        layout.database.clone(),
        sidecar(&layout.database, "-wal"),
        sidecar(&layout.database, "-shm"),
    ] {
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    match fs::remove_dir_all(&layout.attachments) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn sidecar(db: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}

fn unavailable(path: &Path, e: io::Error) -> Error {
    Error::StorageUnavailable(format!("{}: {e}", path.display()))
}

fn closed() -> Error {
    Error::StorageUnavailable("store is closed".into())
}

fn poisoned() -> Error {
    Error::StorageUnavailable("store lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_db(dir: &Path) -> LockableDatabase {
        LockableDatabase::open(
            StorageLayout::new(dir, "lock-test"),
            Duration::from_secs(5),
            Box::new(|conn: &mut Connection, _: &StorageLayout| {
                conn.execute_batch("CREATE TABLE IF NOT EXISTS t (v TEXT NOT NULL)")?;
                Ok(())
            }),
        )
        .expect("open test db")
    }

    fn count(db: &LockableDatabase) -> i64 {
        db.execute(true, |tx| {
            Ok(tx.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?)
        })
        .expect("count rows")
    }

    #[test]
    fn commits_on_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(dir.path());
        db.execute(false, |tx| {
            tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            Ok(())
        })
        .expect("insert");
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn rolls_back_and_returns_body_error_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(dir.path());
        let err = db
            .execute(false, |tx| -> Result<()> {
                tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
                Err(Error::MissingUid)
            })
            .expect_err("body fails");
        assert!(matches!(err, Error::MissingUid));
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn read_transactions_cannot_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(dir.path());
        let result = db.execute(true, |tx| {
            tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Database(_))));
    }

    #[test]
    fn readers_run_from_several_threads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(test_db(dir.path()));
        db.execute(false, |tx| {
            tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            Ok(())
        })
        .expect("seed");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || count(&db))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().expect("reader thread"), 1);
        }
    }

    #[test]
    fn switch_storage_moves_rows_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(&dir.path().join("a"));
        db.execute(false, |tx| {
            tx.execute("INSERT INTO t (v) VALUES ('kept')", [])?;
            Ok(())
        })
        .expect("seed");
        let source = db.layout().expect("layout");
        fs::write(source.attachments.join("1"), b"bytes").expect("attachment file");

        let target = StorageLayout::new(&dir.path().join("b"), "lock-test");
        db.switch_storage(target.clone()).expect("switch");

        assert_eq!(db.layout().expect("layout"), target);
        assert_eq!(count(&db), 1);
        assert!(!source.database.exists());
        assert_eq!(fs::read(target.attachments.join("1")).expect("moved file"), b"bytes");
    }

    #[test]
    fn deleted_store_is_unavailable_until_recreated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(dir.path());
        let layout = db.layout().expect("layout");
        db.delete().expect("delete");
        assert!(!layout.database.exists());
        assert!(matches!(
            db.execute(true, |_| Ok(())),
            Err(Error::StorageUnavailable(_))
        ));

        db.recreate().expect("recreate");
        assert_eq!(count(&db), 0);
    }
}
