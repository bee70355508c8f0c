// src/db/maintenance.rs
//! WAL checkpoints, run by the writer on its own connection.

use rusqlite::Connection;

/// Outcome of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// A concurrent reader or writer kept the checkpoint from completing.
    pub busy:         bool,
    pub log_frames:   i64,
    pub checkpointed: i64,
}

/// Fold the WAL back into the main file and truncate it. Busy is reported,
/// not treated as an error: the next checkpoint picks up the rest.
pub fn checkpoint(conn: &Connection) -> rusqlite::Result<Checkpoint> {
    let cp = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |r| {
        Ok(Checkpoint {
            busy:         r.get::<_, i64>(0)? != 0,
            log_frames:   r.get(1)?,
            checkpointed: r.get(2)?,
        })
    })?;
    if cp.busy {
        log::debug!("WAL checkpoint incomplete ({} of {} frames)", cp.checkpointed, cp.log_frames);
    } else {
        log::debug!("WAL checkpoint moved {} frames", cp.checkpointed);
    }
    Ok(cp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::connection::init_database;

    #[test]
    fn checkpoint_truncates_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        let conn = init_database(&path, &DatabaseConfig::default()).unwrap();
        conn.execute("INSERT INTO market (market_name) VALUES ('binance')", []).unwrap();

        let cp = checkpoint(&conn).unwrap();
        assert!(!cp.busy);

        let wal = dir.path().join("cp.db-wal");
        let len = std::fs::metadata(&wal).map(|m| m.len()).unwrap_or(0);
        assert_eq!(len, 0);
    }
}
