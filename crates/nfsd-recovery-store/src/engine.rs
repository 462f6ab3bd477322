//! Storage Engine Adapter: owns the single `main.sqlite` file and the
//! busy-timeout that makes inter-process writer contention block rather
//! than fail immediately.

use std::fs::DirBuilder;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{from_sqlite, Error, Result};

/// How long a writer will spin inside the engine before it gives up and
/// reports contention, so a conflicting writer in another process (e.g.
/// admin tooling) blocks rather than fails immediately.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const DB_FILE_NAME: &str = "main.sqlite";

/// Thin wrapper over a single `rusqlite::Connection`.
///
/// `StorageEngine` is the only piece of this crate that speaks SQL; every
/// other component is handed a `&Connection` or `&Transaction` and speaks
/// in prepared-statement terms.
#[derive(Debug)]
pub struct StorageEngine {
    conn: Connection,
    path: PathBuf,
}

impl StorageEngine {
    /// Open (or create) `<directory>/main.sqlite`.
    ///
    /// If the directory is missing, it is created with mode `0700` and the
    /// open is retried once. Any failure past that point is fatal and
    /// reported as [`Error::StorageUnavailable`].
    pub fn open(directory: &Path) -> Result<Self> {
        let path = directory.join(DB_FILE_NAME);

        let conn = match Connection::open(&path) {
            Ok(conn) => conn,
            Err(first_err) => {
                debug!(dir = %directory.display(), error = %first_err, "initial open failed, trying to create directory");
                create_directory(directory)?;
                Connection::open(&path).map_err(|e| {
                    Error::StorageUnavailable(format!(
                        "failed to open {} after creating directory: {e}",
                        path.display()
                    ))
                })?
            }
        };

        conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| {
            Error::StorageUnavailable(format!("failed to set busy timeout: {e}"))
        })?;

        debug!(path = %path.display(), "opened recovery database");

        Ok(Self { conn, path })
    }

    /// Path to the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement or script that returns no rows.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(from_sqlite)
    }

    /// Borrow the underlying connection for prepared-statement work.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a single `BEGIN EXCLUSIVE` transaction.
    ///
    /// Commits on `Ok`, rolls back on `Err` (or on early return via `?`).
    /// A rollback failure is logged but never replaces the error that
    /// triggered the rollback.
    pub fn transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(from_sqlite)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(from_sqlite)?;
                Ok(value)
            }
            Err(err) => {
                // `tx` drops here on the `Err` arm below; an explicit
                // rollback lets us log a failure instead of swallowing it
                // silently via Drop.
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback failed after transaction error");
                }
                Err(err)
            }
        }
    }
}

/// Create `directory` with mode 0700, ignoring an already-exists error
/// unless the existing path is not a directory.
fn create_directory(directory: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    match builder.create(directory) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if directory.is_dir() {
                Ok(())
            } else {
                Err(Error::StorageUnavailable(format!(
                    "{} exists and is not a directory",
                    directory.display()
                )))
            }
        }
        Err(e) => Err(Error::StorageUnavailable(format!(
            "failed to create {}: {e}",
            directory.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_dir = tmp.path().join("recovery");
        assert!(!db_dir.exists());

        let engine = StorageEngine::open(&db_dir).unwrap();
        assert!(engine.path().exists());
        assert!(db_dir.is_dir());
    }

    #[test]
    fn reopen_of_existing_directory_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = StorageEngine::open(tmp.path()).unwrap();
        let second = StorageEngine::open(tmp.path()).unwrap();
        assert_eq!(second.path(), tmp.path().join(DB_FILE_NAME));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut engine = StorageEngine::open(tmp.path()).unwrap();
        engine
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .unwrap();

        let result: Result<()> = engine.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (1);", [])
                .map_err(from_sqlite)?;
            Err(Error::NotFound)
        });
        assert!(result.is_err());

        let count: i64 = engine
            .connection()
            .query_row("SELECT count(*) FROM t;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
