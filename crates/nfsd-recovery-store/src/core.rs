//! `Core`: the single owning value a daemon shell constructs once and
//! passes to every upcall handler.
//!
//! The database handle, the SQL scratch buffer, and the two epoch
//! counters could just as easily live as process-wide globals — instead
//! they're explicit fields of this one value, constructed once and
//! threaded through every operation, so the coupling between them stays
//! visible at every call site.

use std::path::Path;

use crate::engine::StorageEngine;
use crate::error::{Error, Result};
use crate::grace;
use crate::schema::{prepare_database, table_name, GraceState};
use crate::table;

/// Owning handle for one recovery database.
#[derive(Debug)]
pub struct Core {
    engine: StorageEngine,
    state: GraceState,
    /// Test-only cap on the length of any formatted-table-name SQL
    /// fragment, simulating the fixed-size scratch buffer the original C
    /// implementation formats SQL into before handing it to the engine.
    /// `None` in production: Rust assembles SQL into an owned `String`,
    /// which cannot silently truncate the way `snprintf` can.
    max_table_name_len: Option<usize>,
}

impl Core {
    /// Open (creating and/or migrating as needed) the recovery database
    /// rooted at `directory`.
    pub fn open(directory: &Path) -> Result<Self> {
        let (engine, state) = prepare_database(directory)?;
        Ok(Self {
            engine,
            state,
            max_table_name_len: None,
        })
    }

    /// Like [`Core::open`], but fails any operation whose formatted
    /// `rec-<hex>` table name would exceed `max_table_name_len`. Exists
    /// only to exercise the oversize-SQL `FormatOverflow` error path in
    /// tests; not part of the public RPC surface.
    #[cfg(test)]
    pub(crate) fn open_with_name_limit(directory: &Path, max_table_name_len: usize) -> Result<Self> {
        let mut core = Self::open(directory)?;
        core.max_table_name_len = Some(max_table_name_len);
        Ok(core)
    }

    fn guard_table_name(&self, epoch: u64) -> Result<()> {
        if let Some(limit) = self.max_table_name_len {
            if table_name(epoch).len() > limit {
                return Err(Error::FormatOverflow);
            }
        }
        Ok(())
    }

    /// The epoch new or promoted clients are recorded into.
    pub fn current_epoch(&self) -> u64 {
        self.state.current
    }

    /// The epoch whose client set is reclaim-eligible; 0 outside grace.
    pub fn recovery_epoch(&self) -> u64 {
        self.state.recovery
    }

    /// Whether a reclaim window is currently open.
    pub fn in_grace(&self) -> bool {
        self.state.recovery != 0
    }

    /// Record (or re-record) `clientid` in the current epoch.
    pub fn create(&mut self, clientid: &[u8]) -> Result<()> {
        self.guard_table_name(self.state.current)?;
        table::insert(self.engine.connection(), self.state.current, clientid)
    }

    /// Remove `clientid` from the current epoch. Idempotent.
    pub fn remove(&mut self, clientid: &[u8]) -> Result<()> {
        self.guard_table_name(self.state.current)?;
        table::remove(self.engine.connection(), self.state.current, clientid)
    }

    /// Reclaim: promote `clientid` from the recovery epoch to the current
    /// epoch if (and only if) it was recorded there before the restart.
    pub fn check(&mut self, clientid: &[u8]) -> Result<()> {
        self.guard_table_name(self.state.recovery)?;
        self.guard_table_name(self.state.current)?;
        table::check(
            self.engine.connection(),
            self.state.recovery,
            self.state.current,
            clientid,
        )
    }

    /// Invoke `callback` once per identifier recorded in the recovery
    /// epoch. Requires an open grace period.
    pub fn iterate_recovery(&mut self, callback: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.guard_table_name(self.state.recovery)?;
        table::iterate_recovery(self.engine.connection(), self.state.recovery, callback)
    }

    /// Enter (or re-enter, after a restart) a grace period.
    pub fn grace_start(&mut self) -> Result<()> {
        let next_epoch = if self.state.recovery == 0 {
            self.state.current + 1
        } else {
            self.state.current
        };
        self.guard_table_name(next_epoch)?;
        self.state = grace::start_grace(&mut self.engine, self.state)?;
        Ok(())
    }

    /// Close the current grace period.
    pub fn grace_done(&mut self) -> Result<()> {
        self.guard_table_name(self.state.recovery)?;
        self.state = grace::grace_done(&mut self.engine, self.state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_core_starts_at_epoch_one_steady() {
        let tmp = tempfile::tempdir().unwrap();
        let core = Core::open(tmp.path()).unwrap();
        assert_eq!(core.current_epoch(), 1);
        assert_eq!(core.recovery_epoch(), 0);
        assert!(!core.in_grace());
    }

    #[test]
    fn end_to_end_reclaim_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut core = Core::open(tmp.path()).unwrap();

        core.create(b"client-a").unwrap();
        core.create(b"client-b").unwrap();

        core.grace_start().unwrap();
        assert!(core.in_grace());
        assert_eq!(core.current_epoch(), 2);
        assert_eq!(core.recovery_epoch(), 1);

        core.check(b"client-a").unwrap();
        let denied = core.check(b"client-unknown");
        assert!(matches!(denied.unwrap_err(), Error::NotFound));

        core.create(b"client-d").unwrap();

        let mut reclaimed = Vec::new();
        core.iterate_recovery(|id| {
            reclaimed.push(id.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(reclaimed.len(), 2); // client-a and client-b

        core.grace_done().unwrap();
        assert!(!core.in_grace());
        assert_eq!(core.recovery_epoch(), 0);
    }

    #[test]
    fn check_outside_grace_is_caller_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut core = Core::open(tmp.path()).unwrap();
        let err = core.check(b"anything").unwrap_err();
        assert!(matches!(err, Error::NotInGrace));
    }

    #[test]
    fn grace_done_outside_grace_is_caller_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut core = Core::open(tmp.path()).unwrap();
        let err = core.grace_done().unwrap_err();
        assert!(matches!(err, Error::NotInGrace));
    }

    #[test]
    fn oversize_table_name_fails_with_format_overflow_before_touching_engine() {
        let tmp = tempfile::tempdir().unwrap();
        // "rec-0000000000000001" is 20 bytes; a 16-byte cap can never fit it.
        let mut core = Core::open_with_name_limit(tmp.path(), 16).unwrap();
        let err = core.create(b"client-a").unwrap_err();
        assert!(matches!(err, Error::FormatOverflow));
    }

    #[test]
    fn reopen_preserves_contents_and_epoch_state_bit_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut core = Core::open(tmp.path()).unwrap();
            core.create(b"persisted-client").unwrap();
            core.grace_start().unwrap();
        }

        let mut core = Core::open(tmp.path()).unwrap();
        assert_eq!(core.current_epoch(), 2);
        assert_eq!(core.recovery_epoch(), 1);
        core.check(b"persisted-client").unwrap();
    }
}
