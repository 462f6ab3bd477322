//! Recovery Table Manager: insert, delete, membership-check-with-promotion,
//! and full iteration over a single epoch's client-identifier set.

use rusqlite::{params, Connection};
#[cfg(test)]
use rusqlite::OptionalExtension;
use tracing::debug;

use crate::error::{from_sqlite, Error, Result};
use crate::schema::table_name;

/// `INSERT OR REPLACE INTO "rec-<hex>" VALUES (?)`.
///
/// Idempotent: inserting the same identifier twice in the same epoch
/// leaves the table's cardinality unchanged.
pub fn insert(conn: &Connection, epoch: u64, clientid: &[u8]) -> Result<()> {
    let sql = format!("INSERT OR REPLACE INTO \"{}\" VALUES (?);", table_name(epoch));
    conn.execute(&sql, params![clientid]).map_err(from_sqlite)?;
    debug!(epoch, len = clientid.len(), "inserted client record");
    Ok(())
}

/// `DELETE FROM "rec-<hex>" WHERE id == ?`. A missing row is not an error.
pub fn remove(conn: &Connection, epoch: u64, clientid: &[u8]) -> Result<()> {
    let sql = format!("DELETE FROM \"{}\" WHERE id == ?;", table_name(epoch));
    conn.execute(&sql, params![clientid]).map_err(from_sqlite)?;
    debug!(epoch, len = clientid.len(), "removed client record (if present)");
    Ok(())
}

/// Check whether `clientid` is present in the recovery epoch's table and,
/// if so, promote it into the current epoch by inserting it there.
///
/// This is a two-step SELECT-then-INSERT. The two statements are not
/// wrapped in a transaction of their own: the owning process drives this
/// store from a single thread, one upcall at a time, so nothing else can
/// observe or act between the SELECT and the INSERT, and the adapter's
/// busy-timeout absorbs any contention from another process holding the
/// file lock. A multi-process deployment sharing one database would need
/// to wrap the pair in an explicit transaction.
pub fn check(conn: &Connection, recovery_epoch: u64, current_epoch: u64, clientid: &[u8]) -> Result<()> {
    if recovery_epoch == 0 {
        return Err(Error::NotInGrace);
    }

    let sql = format!(
        "SELECT count(*) FROM \"{}\" WHERE id == ?;",
        table_name(recovery_epoch)
    );
    let count: i64 = conn
        .query_row(&sql, params![clientid], |row| row.get(0))
        .map_err(from_sqlite)?;

    if count != 1 {
        return Err(Error::NotFound);
    }

    insert(conn, current_epoch, clientid)
}

/// `SELECT * FROM "rec-<hex>"` against the recovery epoch, invoking
/// `callback` synchronously once per row. Row order is whatever the
/// engine returns; callers must not depend on it.
pub fn iterate_recovery(
    conn: &Connection,
    recovery_epoch: u64,
    mut callback: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    if recovery_epoch == 0 {
        return Err(Error::NotInGrace);
    }

    let sql = format!("SELECT * FROM \"{}\";", table_name(recovery_epoch));
    let mut stmt = conn.prepare(&sql).map_err(from_sqlite)?;
    let mut rows = stmt.query([]).map_err(from_sqlite)?;

    while let Some(row) = rows.next().map_err(from_sqlite)? {
        let id: Vec<u8> = row.get(0).map_err(from_sqlite)?;
        callback(&id)?;
    }

    Ok(())
}

/// Number of rows currently in `epoch`'s table. Test-only diagnostic
/// helper; no upcall exposes table cardinality to a caller.
#[cfg(test)]
pub fn count(conn: &Connection, epoch: u64) -> Result<i64> {
    let sql = format!("SELECT count(*) FROM \"{}\";", table_name(epoch));
    conn.query_row(&sql, [], |row| row.get(0))
        .optional()
        .map_err(from_sqlite)
        .map(|v| v.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::prepare_database;

    fn fresh_conn() -> (tempfile::TempDir, rusqlite::Connection) {
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _state) = prepare_database(tmp.path()).unwrap();
        // Re-open independently so the test can own a plain `Connection`.
        let conn = rusqlite::Connection::open(engine.path()).unwrap();
        (tmp, conn)
    }

    #[test]
    fn insert_is_idempotent() {
        let (_tmp, conn) = fresh_conn();
        insert(&conn, 1, b"client-a").unwrap();
        insert(&conn, 1, b"client-a").unwrap();
        assert_eq!(count(&conn, 1).unwrap(), 1);
    }

    #[test]
    fn remove_of_missing_row_succeeds() {
        let (_tmp, conn) = fresh_conn();
        remove(&conn, 1, b"does-not-exist").unwrap();
    }

    #[test]
    fn check_without_recovery_epoch_is_not_in_grace() {
        let (_tmp, conn) = fresh_conn();
        let err = check(&conn, 0, 1, b"client-a").unwrap_err();
        assert!(matches!(err, Error::NotInGrace));
    }

    #[test]
    fn check_promotes_known_client_and_denies_unknown() {
        let (_tmp, conn) = fresh_conn();
        insert(&conn, 1, b"client-a").unwrap();

        // Simulate grace: recovery epoch 1, current epoch 2.
        conn.execute_batch("CREATE TABLE \"rec-0000000000000002\" (id BLOB PRIMARY KEY);")
            .unwrap();

        check(&conn, 1, 2, b"client-a").unwrap();
        assert_eq!(count(&conn, 2).unwrap(), 1);

        let err = check(&conn, 1, 2, b"client-unknown").unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn iterate_recovery_visits_every_row() {
        let (_tmp, conn) = fresh_conn();
        insert(&conn, 1, b"a").unwrap();
        insert(&conn, 1, b"b").unwrap();
        insert(&conn, 1, b"c").unwrap();

        let mut seen: Vec<Vec<u8>> = Vec::new();
        iterate_recovery(&conn, 1, |id| {
            seen.push(id.to_vec());
            Ok(())
        })
        .unwrap();

        seen.sort();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn iterate_recovery_without_grace_fails() {
        let (_tmp, conn) = fresh_conn();
        let err = iterate_recovery(&conn, 0, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::NotInGrace));
    }
}
