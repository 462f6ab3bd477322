//! Grace State Machine: `start_grace` and `grace_done`, the only two
//! transitions that ever move `(current_epoch, recovery_epoch)`.

use tracing::info;

use crate::engine::StorageEngine;
use crate::error::{from_sqlite, Error, Result};
use crate::schema::{table_name, GraceState};

/// `start_grace`, called when the server is entering a grace period.
///
/// If `recovery == 0` (normal start), the epoch pair advances and a fresh
/// table is created for the new current epoch. If `recovery != 0`
/// (restart during an already-open grace period), the epoch pair is left
/// untouched and only the partial reclaim progress in the current
/// epoch's table is discarded.
pub fn start_grace(engine: &mut StorageEngine, state: GraceState) -> Result<GraceState> {
    let GraceState { current, recovery } = state;

    let next = if recovery == 0 {
        let new_recovery = current;
        let new_current = current + 1;

        engine.transaction(|tx| {
            tx.execute(
                "UPDATE grace SET current = ?, recovery = ?;",
                rusqlite::params![new_current as i64, new_recovery as i64],
            )
            .map_err(from_sqlite)?;
            tx.execute_batch(&format!(
                "CREATE TABLE \"{}\" (id BLOB PRIMARY KEY);",
                table_name(new_current)
            ))
            .map_err(from_sqlite)?;
            Ok(())
        })?;

        GraceState {
            current: new_current,
            recovery: new_recovery,
        }
    } else {
        engine.transaction(|tx| {
            tx.execute(
                &format!("DELETE FROM \"{}\";", table_name(current)),
                [],
            )
            .map_err(from_sqlite)?;
            Ok(())
        })?;

        state
    };

    info!(current = next.current, recovery = next.recovery, "grace period started");
    Ok(next)
}

/// `grace_done`: close the reclaim window, dropping the recovery epoch's
/// table and clearing `recovery` to 0.
///
/// Precondition: `state.recovery != 0`. Calling this in `STEADY` is a
/// caller error.
pub fn grace_done(engine: &mut StorageEngine, state: GraceState) -> Result<GraceState> {
    if state.recovery == 0 {
        return Err(Error::NotInGrace);
    }

    engine.transaction(|tx| {
        tx.execute("UPDATE grace SET recovery = 0;", [])
            .map_err(from_sqlite)?;
        tx.execute_batch(&format!("DROP TABLE \"{}\";", table_name(state.recovery)))
            .map_err(from_sqlite)?;
        Ok(())
    })?;

    let next = GraceState {
        current: state.current,
        recovery: 0,
    };
    info!(current = next.current, "grace period ended");
    Ok(next)
}
