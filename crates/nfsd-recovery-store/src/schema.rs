//! Schema Manager: detects the on-disk schema version and brings a
//! database up to the current version, either by migrating an older
//! layout in place or by initializing a fresh one.

use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use crate::engine::StorageEngine;
use crate::error::{from_sqlite, Error, Result};

/// Current on-disk schema version. Any value above this is a downgrade
/// attempt and is rejected outright; the daemon must never write a
/// layout newer than it understands.
pub const SCHEMA_VERSION: i64 = 3;

/// `0` means "no database yet" — a fresh file presents the same symptom
/// as a missing `parameters` table, so the two are not distinguished.
const NO_DATABASE: i64 = 0;

/// Format a recovery-table name for `epoch`.
///
/// `rec-` followed by the lowercase, zero-padded 16-hex-digit encoding of
/// the epoch. This exact format is part of the on-disk contract — every
/// call site must derive the name through this function so two
/// formattings of the same epoch are always byte-identical.
pub fn table_name(epoch: u64) -> String {
    format!("rec-{epoch:016x}")
}

/// In-memory mirror of the `grace` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceState {
    pub current: u64,
    pub recovery: u64,
}

/// Open (or create) the database at `directory` and bring it to
/// [`SCHEMA_VERSION`], returning the open engine and the epoch state read
/// from the resulting `grace` row.
pub fn prepare_database(directory: &std::path::Path) -> Result<(StorageEngine, GraceState)> {
    let mut engine = StorageEngine::open(directory)?;

    let version = query_schema_version(engine.connection())?;
    debug!(version, "detected on-disk schema version");

    match version {
        SCHEMA_VERSION => {
            // Already current, nothing to do.
        }
        2 => migrate_from(&mut engine, 2)?,
        1 => migrate_from(&mut engine, 1)?,
        NO_DATABASE => initialize(&mut engine)?,
        found => {
            return Err(Error::SchemaUnsupported {
                found,
                max: SCHEMA_VERSION,
            })
        }
    }

    let state = query_grace_row(engine.connection())?;
    info!(current = state.current, recovery = state.recovery, "recovery database ready");
    Ok((engine, state))
}

/// `SELECT value FROM parameters WHERE key == "version"`, folding the
/// "missing `parameters` table" failure to version 0 rather than
/// propagating an error — a fresh database presents exactly this symptom.
/// A `parameters` row whose `value` fails to parse as an integer is a
/// different symptom (a corrupt or unrecognized on-disk marker, not "no
/// database") and is reported as a version clearly beyond
/// [`SCHEMA_VERSION`] so it falls into the `SchemaUnsupported` path
/// instead of being silently treated as fresh.
fn query_schema_version(conn: &rusqlite::Connection) -> Result<i64> {
    let result: rusqlite::Result<Option<String>> = conn
        .query_row(
            "SELECT value FROM parameters WHERE key == \"version\";",
            [],
            |row| row.get(0),
        )
        .optional();

    match result {
        Ok(Some(text)) => Ok(text.parse::<i64>().unwrap_or(i64::MAX)),
        Ok(None) => Ok(NO_DATABASE),
        Err(_) => Ok(NO_DATABASE),
    }
}

fn query_grace_row(conn: &rusqlite::Connection) -> Result<GraceState> {
    conn.query_row("SELECT current, recovery FROM grace;", [], |row| {
        let current: i64 = row.get(0)?;
        let recovery: i64 = row.get(1)?;
        Ok(GraceState {
            current: current as u64,
            recovery: recovery as u64,
        })
    })
    .map_err(from_sqlite)
}

/// Migration 1→3 or 2→3, as a single exclusive transaction.
///
/// Both legacy versions converge on the same target layout; the only
/// structural work is in the 1→3 path, which also folds the pre-epoch
/// `clients` table into `rec-0000000000000001`. The 2→3 path is a
/// version-number-only bump: the `grace`/`rec-*` layout is already in
/// its final shape by schema 2, so there is no structural work to redo
/// (see DESIGN.md for why this is the documented reading rather than an
/// invented structural change).
fn migrate_from(engine: &mut StorageEngine, from_version: i64) -> Result<()> {
    engine
        .transaction(|tx| {
            // Re-check inside the transaction: another process may have
            // already migrated this database.
            let current = query_schema_version(tx).unwrap_or(NO_DATABASE);
            if current == SCHEMA_VERSION {
                return Ok(());
            }
            if current != from_version {
                return Err(Error::SchemaMigrationFailed {
                    from: from_version,
                    reason: format!(
                        "expected version {from_version} under the migration lock, found {current}"
                    ),
                });
            }

            if from_version == 1 {
                tx.execute_batch(
                    "CREATE TABLE grace (current INTEGER, recovery INTEGER);",
                )
                .map_err(from_sqlite)?;
                tx.execute("INSERT INTO grace VALUES (1, 0);", [])
                    .map_err(from_sqlite)?;
                tx.execute_batch(&format!(
                    "CREATE TABLE \"{}\" (id BLOB PRIMARY KEY);",
                    table_name(1)
                ))
                .map_err(from_sqlite)?;
                tx.execute(
                    &format!(
                        "INSERT INTO \"{}\" SELECT id FROM clients;",
                        table_name(1)
                    ),
                    [],
                )
                .map_err(from_sqlite)?;
                tx.execute_batch("DROP TABLE clients;").map_err(from_sqlite)?;
                tx.execute(
                    "UPDATE parameters SET value = ? WHERE key = \"version\";",
                    params![SCHEMA_VERSION.to_string()],
                )
                .map_err(from_sqlite)?;
            } else {
                // from_version == 2: grace/rec-* layout is already in its
                // final v3 shape, so this is a no-op version bump.
                tx.execute(
                    "UPDATE parameters SET value = ? WHERE key = \"version\";",
                    params![SCHEMA_VERSION.to_string()],
                )
                .map_err(from_sqlite)?;
            }

            Ok(())
        })
        .map_err(|e| {
            warn!(from = from_version, error = %e, "schema migration failed");
            match e {
                Error::SchemaMigrationFailed { .. } => e,
                other => Error::SchemaMigrationFailed {
                    from: from_version,
                    reason: other.to_string(),
                },
            }
        })
}

/// Initialize a fresh v3 database (on-disk version was 0 / no database).
fn initialize(engine: &mut StorageEngine) -> Result<()> {
    engine.transaction(|tx: &Transaction<'_>| {
        let current = query_schema_version(tx).unwrap_or(NO_DATABASE);
        if current == SCHEMA_VERSION {
            return Ok(());
        }
        if current != NO_DATABASE {
            return Err(Error::SchemaMigrationFailed {
                from: NO_DATABASE,
                reason: format!("expected a fresh database, found version {current}"),
            });
        }

        tx.execute_batch(
            "CREATE TABLE parameters (key TEXT PRIMARY KEY, value TEXT);",
        )
        .map_err(from_sqlite)?;
        tx.execute_batch("CREATE TABLE grace (current INTEGER, recovery INTEGER);")
            .map_err(from_sqlite)?;
        tx.execute("INSERT INTO grace VALUES (1, 0);", [])
            .map_err(from_sqlite)?;
        tx.execute_batch(&format!(
            "CREATE TABLE \"{}\" (id BLOB PRIMARY KEY);",
            table_name(1)
        ))
        .map_err(from_sqlite)?;
        tx.execute(
            "INSERT OR FAIL INTO parameters VALUES (\"version\", ?);",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(from_sqlite)?;

        Ok(())
    })
}
