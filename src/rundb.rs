//! The run-database stores, per tool instance, the dependency state before
//! the last successful redo.  It is the only state that survives between
//! runs; everything in it is advisory (removing the file merely causes
//! redos), but a committed record must never be half-written.

use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// Identifies the schema among all released versions.
pub const SCHEMA_VERSION: (u32, u32) = (0, 1);

/// Aspects of the redo state of a tool instance, one digest each.
pub const ASPECT_RESULT: i64 = 0;
pub const ASPECT_EXECUTION_PARAMETERS: i64 = 1;
pub const ASPECT_ENVIRONMENT_VARIABLES: i64 = 2;

/// Identifies the platform a fingerprint was computed on.
fn permanent_platform_id() -> Vec<u8> {
    format!(
        "{}-{}-{}.{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        SCHEMA_VERSION.0,
        SCHEMA_VERSION.1
    )
    .into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub start_time_ns: i64,
    pub duration_ns: i64,
    /// Successful runs of any tool instance, redos included.
    pub run_count: i64,
    pub redo_count: i64,
}

pub struct Database {
    conn: Connection,
    run_dbid: i64,
    started: Instant,
    start_time_ns: i64,
    last_tree_time_ns: Option<i64>,
    modifying_ops_since_commit: u32,
    suggestion: String,
}

const MAXIMUM_UNCOMMITTED_OPERATIONS: u32 = 2000;

fn now_unix_ns() -> i64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

impl Database {
    /// Open or create the database, remove information from runs older than
    /// `max_dependency_age`, and begin a new run.
    ///
    /// Until `close()`, no other process may construct a `Database` for the
    /// same path (guaranteed by the working-tree lock).
    pub fn open(
        path: &Path,
        max_dependency_age: Duration,
        suggestion: &str,
    ) -> Result<Database> {
        let conn = Connection::open(path).map_err(|e| {
            let state = if path.is_file() {
                "existing"
            } else {
                "non-existent"
            };
            Error::Database(format!(
                "could not open {} run-database: {:?}\n  | reason: {}\n\
                 \x20 | check access permissions",
                state,
                path.display(),
                e
            ))
        })?;

        let mut db = Database {
            conn,
            run_dbid: 0,
            started: Instant::now(),
            start_time_ns: now_unix_ns(),
            last_tree_time_ns: None,
            modifying_ops_since_commit: 0,
            suggestion: suggestion.to_string(),
        };
        db.setup(max_dependency_age)
            .map_err(|e| db.map_err("could not setup run-database", e))?;
        Ok(db)
    }

    fn setup(&mut self, max_dependency_age: Duration) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;\n\
             PRAGMA foreign_keys = ON;",
        )?;
        self.conn.execute_batch("BEGIN")?;

        let did_exist: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'run'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;

        if !did_exist {
            self.conn.execute_batch(
                "CREATE TABLE run(\n\
                     run_dbid INTEGER NOT NULL,\n\
                     start_time_ns INTEGER NOT NULL,\n\
                     duration_ns INTEGER,\n\
                     nonredo_count INTEGER,\n\
                     redo_count INTEGER,\n\
                     final_tree_time_ns INTEGER,\n\
                     PRIMARY KEY(run_dbid));\n\
                 CREATE TABLE tool_inst(\n\
                     tool_inst_dbid INTEGER NOT NULL,\n\
                     pl_platform_id BLOB NOT NULL,\n\
                     pl_tool_id BLOB NOT NULL,\n\
                     pl_tool_inst_fp BLOB NOT NULL,\n\
                     PRIMARY KEY(tool_inst_dbid),\n\
                     UNIQUE(pl_platform_id, pl_tool_id, pl_tool_inst_fp));\n\
                 CREATE TABLE tool_inst_fs_input(\n\
                     tool_inst_dbid INTEGER,\n\
                     path TEXT NOT NULL,\n\
                     is_explicit INTEGER NOT NULL,\n\
                     memo_before BLOB,\n\
                     run_dbid INTEGER,\n\
                     PRIMARY KEY(tool_inst_dbid, path),\n\
                     FOREIGN KEY(tool_inst_dbid) REFERENCES tool_inst(tool_inst_dbid),\n\
                     FOREIGN KEY(run_dbid) REFERENCES run(run_dbid));\n\
                 CREATE TABLE tool_inst_redo_state(\n\
                     tool_inst_dbid INTEGER,\n\
                     aspect INTEGER NOT NULL,\n\
                     memo_digest BLOB NOT NULL,\n\
                     run_dbid INTEGER,\n\
                     PRIMARY KEY(tool_inst_dbid, aspect),\n\
                     FOREIGN KEY(tool_inst_dbid) REFERENCES tool_inst(tool_inst_dbid),\n\
                     FOREIGN KEY(run_dbid) REFERENCES run(run_dbid));\n\
                 CREATE TRIGGER delete_obsolete_toolinst\n\
                     AFTER DELETE ON run FOR EACH ROW BEGIN\n\
                         DELETE FROM tool_inst_fs_input WHERE run_dbid = OLD.run_dbid;\n\
                         DELETE FROM tool_inst_redo_state WHERE run_dbid = OLD.run_dbid;\n\
                     END;",
            )?;
        }

        let oldest = self
            .start_time_ns
            .saturating_sub(max_dependency_age.as_nanos().min(i64::MAX as u128) as i64);
        self.conn
            .execute("DELETE FROM run WHERE start_time_ns < ?1", params![oldest])?;

        self.last_tree_time_ns = self
            .conn
            .query_row("SELECT MAX(final_tree_time_ns) FROM run", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?;

        self.conn.execute(
            "INSERT INTO run VALUES (NULL, ?1, NULL, NULL, NULL, NULL)",
            params![self.start_time_ns],
        )?;
        self.run_dbid = self.conn.last_insert_rowid();
        self.modifying_ops_since_commit = 1;

        if !did_exist {
            // Make sure the tables exist afterwards.
            self.conn.execute_batch("COMMIT")?;
            self.modifying_ops_since_commit = 0;
        }
        Ok(())
    }

    fn map_err(&self, summary: &str, e: rusqlite::Error) -> Error {
        let mut lines = format!("{}\n  | reason: {}", summary, e);
        if !self.suggestion.is_empty() {
            lines.push_str("\n  | ");
            lines.push_str(&self.suggestion);
        }
        Error::Database(lines)
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn run_dbid(&self) -> i64 {
        self.run_dbid
    }

    /// The working-tree time recorded by the youngest previous run, if any.
    pub fn last_tree_time_ns(&self) -> Option<i64> {
        self.last_tree_time_ns
    }

    /// Intern a tool instance, returning its dbid.  Stable until the next
    /// `cleanup()`.
    pub fn register_tool_instance(&mut self, tool_id: &[u8], fingerprint: &[u8]) -> Result<i64> {
        let platform_id = permanent_platform_id();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO tool_inst VALUES (NULL, ?1, ?2, ?3)",
                params![platform_id, tool_id, fingerprint],
            )
            .and_then(|_| {
                self.conn.query_row(
                    "SELECT tool_inst_dbid FROM tool_inst WHERE \
                     pl_platform_id = ?1 AND pl_tool_id = ?2 AND pl_tool_inst_fp = ?3",
                    params![platform_id, tool_id, fingerprint],
                    |row| row.get(0),
                )
            })
            .map_err(|e| self.map_err("run-database access failed", e))
    }

    /// Number of registered tool instances on the current platform.
    pub fn tool_instance_count(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tool_inst WHERE pl_platform_id = ?1",
                params![permanent_platform_id()],
                |row| row.get(0),
            )
            .map_err(|e| self.map_err("run-database access failed", e))
    }

    /// Encoded path → (is_explicit, memo before last redo) of all recorded
    /// input dependencies of a tool instance.
    pub fn fsobject_inputs(
        &self,
        tool_inst_dbid: i64,
    ) -> Result<FxHashMap<String, (bool, Option<Vec<u8>>)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT path, is_explicit, memo_before FROM tool_inst_fs_input \
                 WHERE tool_inst_dbid == ?1",
            )
            .map_err(|e| self.map_err("run-database access failed", e))?;
        let rows = stmt
            .query_map(params![tool_inst_dbid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.map_err("run-database access failed", e))?;
        Ok(rows
            .into_iter()
            .map(|(path, is_explicit, memo)| (path, (is_explicit, memo)))
            .collect())
    }

    /// Aspect → digest of the last known successful redo of a tool
    /// instance.  Empty when the instance never completed a redo.
    pub fn redo_state(&self, tool_inst_dbid: i64) -> Result<FxHashMap<i64, Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT aspect, memo_digest FROM tool_inst_redo_state \
                 WHERE tool_inst_dbid == ?1",
            )
            .map_err(|e| self.map_err("run-database access failed", e))?;
        let rows = stmt
            .query_map(params![tool_inst_dbid], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.map_err("run-database access failed", e))?;
        Ok(rows.into_iter().collect())
    }

    /// Replace the recorded input dependencies and redo state of a tool
    /// instance, and mark every recorded input below a modified path (of
    /// any tool instance) as potentially changed.
    ///
    /// Starts a transaction when none is active but does not commit; on
    /// error an active transaction is rolled back.
    pub fn update_dependencies_and_state(
        &mut self,
        tool_inst_dbid: i64,
        info_by_encoded_path: &[(String, bool, Option<Vec<u8>>)],
        digest_by_aspect: &[(i64, Option<Vec<u8>>)],
        encoded_paths_of_modified: &[String],
    ) -> Result<()> {
        if !self.in_transaction() {
            self.conn
                .execute_batch("BEGIN")
                .map_err(|e| self.map_err("run-database access failed", e))?;
        }
        let result = self.update_inner(
            tool_inst_dbid,
            info_by_encoded_path,
            digest_by_aspect,
            encoded_paths_of_modified,
        );
        if let Err(e) = result {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(self.map_err("run-database access failed", e));
        }
        self.modifying_ops_since_commit += 1;
        Ok(())
    }

    fn update_inner(
        &mut self,
        tool_inst_dbid: i64,
        info_by_encoded_path: &[(String, bool, Option<Vec<u8>>)],
        digest_by_aspect: &[(i64, Option<Vec<u8>>)],
        encoded_paths_of_modified: &[String],
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "DELETE FROM tool_inst_fs_input WHERE tool_inst_dbid == ?1",
            params![tool_inst_dbid],
        )?;
        for (encoded_path, is_explicit, memo) in info_by_encoded_path {
            self.conn.execute(
                "INSERT OR REPLACE INTO tool_inst_fs_input VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tool_inst_dbid,
                    encoded_path,
                    *is_explicit as i64,
                    memo,
                    self.run_dbid
                ],
            )?;
        }

        self.conn.execute(
            "DELETE FROM tool_inst_redo_state WHERE tool_inst_dbid == ?1",
            params![tool_inst_dbid],
        )?;
        for (aspect, digest) in digest_by_aspect {
            if let Some(digest) = digest {
                self.conn.execute(
                    "INSERT OR REPLACE INTO tool_inst_redo_state VALUES (?1, ?2, ?3, ?4)",
                    params![tool_inst_dbid, aspect, digest, self.run_dbid],
                )?;
            }
        }

        for modified in encoded_paths_of_modified {
            // NULL the memo of every recorded input whose path has
            // `modified` as a prefix, for all tool instances.
            self.conn.execute(
                "UPDATE tool_inst_fs_input SET memo_before = NULL WHERE instr(path, ?1) == 1",
                params![modified],
            )?;
        }
        Ok(())
    }

    /// Summaries of the latest successful runs, oldest first, without the
    /// run that opened this database.
    pub fn latest_successful_run_summaries(&self, max_count: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT start_time_ns, duration_ns, nonredo_count, redo_count FROM run \
                 WHERE run_dbid != ?1 AND duration_ns >= 0 AND nonredo_count >= 0 \
                 AND redo_count >= 0 \
                 ORDER BY start_time_ns DESC LIMIT ?2",
            )
            .map_err(|e| self.map_err("run-database access failed", e))?;
        let mut summaries = stmt
            .query_map(params![self.run_dbid, max_count as i64], |row| {
                let nonredo: i64 = row.get(2)?;
                let redo: i64 = row.get(3)?;
                Ok(RunSummary {
                    start_time_ns: row.get(0)?,
                    duration_ns: row.get(1)?,
                    run_count: nonredo + redo,
                    redo_count: redo,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| self.map_err("run-database access failed", e))?;
        summaries.reverse();
        Ok(summaries)
    }

    /// Consider the current run successfully completed.
    pub fn update_run_summary(
        &mut self,
        nonredo_count: u64,
        redo_count: u64,
        final_tree_time_ns: i64,
    ) -> Result<RunSummary> {
        let duration_ns = self.started.elapsed().as_nanos().min(i64::MAX as u128) as i64;
        let nonredo = nonredo_count.min(i64::MAX as u64) as i64;
        let redo = redo_count.min(i64::MAX as u64) as i64;
        self.conn
            .execute(
                "UPDATE run SET duration_ns = ?1, nonredo_count = ?2, redo_count = ?3, \
                 final_tree_time_ns = ?4 WHERE run_dbid = ?5",
                params![duration_ns, nonredo, redo, final_tree_time_ns, self.run_dbid],
            )
            .map_err(|e| self.map_err("run-database access failed", e))?;
        self.modifying_ops_since_commit += 1;
        Ok(RunSummary {
            start_time_ns: self.start_time_ns,
            duration_ns,
            run_count: nonredo + redo,
            redo_count: redo,
        })
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.conn
                .execute_batch("COMMIT")
                .map_err(|e| self.map_err("commit failed", e))?;
        }
        self.modifying_ops_since_commit = 0;
        Ok(())
    }

    /// Regular calls prevent unbounded growth of the database journal.
    pub fn commit_if_overdue(&mut self) -> Result<()> {
        if self.modifying_ops_since_commit > MAXIMUM_UNCOMMITTED_OPERATIONS {
            self.commit()?;
        }
        Ok(())
    }

    /// Remove tool instances without any recorded state.
    pub fn cleanup(&mut self) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM tool_inst WHERE tool_inst_dbid IN (\
                     SELECT ti.tool_inst_dbid FROM tool_inst AS ti \
                         LEFT OUTER JOIN tool_inst_fs_input AS fs \
                             ON ti.tool_inst_dbid = fs.tool_inst_dbid \
                         LEFT OUTER JOIN tool_inst_redo_state AS st \
                             ON ti.tool_inst_dbid = st.tool_inst_dbid \
                     WHERE fs.tool_inst_dbid IS NULL AND st.tool_inst_dbid IS NULL)",
                [],
            )
            .map_err(|e| self.map_err("clean-up failed", e))?;
        self.modifying_ops_since_commit += 1;
        Ok(())
    }

    /// Uncommitted changes are lost.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_conn, e)| {
                Error::Database(format!("closing failed\n  | reason: {}", e))
            })
    }

    /// Digest of a redo-requested flag for the result aspect.
    pub fn result_digest(redo_requested: bool) -> Vec<u8> {
        if redo_requested {
            vec![1]
        } else {
            vec![0]
        }
    }
}

/// Whether a stored result digest requests a redo on the next run.
pub fn decodes_as_redo_request(digest: &[u8]) -> bool {
    digest == [1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &Path) -> Database {
        Database::open(
            &dir.join("runs-test.sqlite"),
            Duration::from_secs(30 * 24 * 3600),
            "remove the run-database file",
        )
        .unwrap()
    }

    #[test]
    fn record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_in(dir.path());

        let dbid = db.register_tool_instance(b"tool", b"fp").unwrap();
        assert_eq!(db.register_tool_instance(b"tool", b"fp").unwrap(), dbid);
        assert_ne!(db.register_tool_instance(b"tool", b"fp2").unwrap(), dbid);
        assert_eq!(db.tool_instance_count().unwrap(), 2);

        db.update_dependencies_and_state(
            dbid,
            &[("src/a.c/".to_string(), true, Some(vec![1, 2, 3]))],
            &[
                (ASPECT_RESULT, Some(Database::result_digest(false))),
                (ASPECT_EXECUTION_PARAMETERS, Some(vec![7])),
                (ASPECT_ENVIRONMENT_VARIABLES, None),
            ],
            &[],
        )
        .unwrap();
        db.commit().unwrap();

        let inputs = db.fsobject_inputs(dbid).unwrap();
        assert_eq!(
            inputs.get("src/a.c/").unwrap(),
            &(true, Some(vec![1, 2, 3]))
        );
        let state = db.redo_state(dbid).unwrap();
        assert_eq!(state.get(&ASPECT_RESULT).unwrap(), &vec![0]);
        assert_eq!(state.get(&ASPECT_EXECUTION_PARAMETERS).unwrap(), &vec![7]);
        assert!(!state.contains_key(&ASPECT_ENVIRONMENT_VARIABLES));
    }

    #[test]
    fn modified_prefix_invalidates_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_in(dir.path());

        let a = db.register_tool_instance(b"tool", b"a").unwrap();
        let b = db.register_tool_instance(b"tool", b"b").unwrap();
        db.update_dependencies_and_state(
            a,
            &[("gen/out.h/".to_string(), false, Some(vec![1]))],
            &[],
            &[],
        )
        .unwrap();
        // A redo of b modifies everything below gen/.
        db.update_dependencies_and_state(b, &[], &[], &["gen/".to_string()])
            .unwrap();
        db.commit().unwrap();

        let inputs = db.fsobject_inputs(a).unwrap();
        assert_eq!(inputs.get("gen/out.h/").unwrap(), &(false, None));
    }

    #[test]
    fn purge_removes_old_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs-test.sqlite");

        let mut db = Database::open(&path, Duration::from_secs(3600), "").unwrap();
        let dbid = db.register_tool_instance(b"tool", b"fp").unwrap();
        db.update_dependencies_and_state(
            dbid,
            &[("a.c/".to_string(), true, Some(vec![1]))],
            &[(ASPECT_RESULT, Some(Database::result_digest(false)))],
            &[],
        )
        .unwrap();
        db.commit().unwrap();
        db.close().unwrap();

        // Reopening with a zero maximum age purges the previous run and,
        // through the trigger, its dependency records.
        let mut db = Database::open(&path, Duration::from_secs(0), "").unwrap();
        let dbid = db.register_tool_instance(b"tool", b"fp").unwrap();
        assert!(db.fsobject_inputs(dbid).unwrap().is_empty());
        assert!(db.redo_state(dbid).unwrap().is_empty());
    }

    #[test]
    fn run_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs-test.sqlite");

        let mut db = Database::open(&path, Duration::from_secs(3600), "").unwrap();
        db.update_run_summary(3, 1, 42).unwrap();
        db.commit().unwrap();
        db.close().unwrap();

        let db = Database::open(&path, Duration::from_secs(3600), "").unwrap();
        let summaries = db.latest_successful_run_summaries(10).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].run_count, 4);
        assert_eq!(summaries[0].redo_count, 1);
        assert_eq!(db.last_tree_time_ns(), Some(42));
    }
}
