//! Error types for the client-recovery store.

use rusqlite::ErrorCode;

/// Top-level error type for all recovery-store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// On-disk schema version exceeds what this build understands.
    #[error("unsupported schema version {found} (expected at most {max})")]
    SchemaUnsupported { found: i64, max: i64 },

    /// A migration failed and was rolled back.
    #[error("schema migration from version {from} failed: {reason}")]
    SchemaMigrationFailed { from: i64, reason: String },

    /// The database file could not be opened or created.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The engine reported busy after the configured busy-timeout elapsed.
    #[error("database busy after waiting for the lock")]
    Contention,

    /// Caller invoked a grace-only operation while not in a grace period.
    #[error("operation requires an open grace period")]
    NotInGrace,

    /// `check` was called for a client absent from the recovery epoch.
    #[error("client is not known to the recovery epoch")]
    NotFound,

    /// A formatted SQL statement exceeded the configured length limit.
    #[error("sql assembly buffer too small for this statement")]
    FormatOverflow,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Remap a raw `rusqlite` failure to [`Error::Contention`] when it represents
/// a busy-timeout expiry, otherwise pass it through unchanged.
pub(crate) fn from_sqlite(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref ffi_err, _) = err {
        if ffi_err.code == ErrorCode::DatabaseBusy {
            return Error::Contention;
        }
    }
    Error::Sqlite(err)
}

pub type Result<T> = std::result::Result<T, Error>;
