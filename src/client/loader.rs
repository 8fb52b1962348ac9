//! Snapshot loader: stages one enumeration cycle into the relational store,
//! hands the populated store to a query, then empties the staging table.

use crate::channel::codec::{decode_row, fields_descriptor, ROW_FORMAT};
use crate::client::proxy::{Endpoint, SyscallProxy};
use crate::config::types::{CycleReport, KqueryError, ProcessRecord, QueryOutcome, Result};
use crate::observability::audit::{events, SessionId};
use log::{debug, info, warn};
use rusqlite::{params, Connection};

pub const CREATE_STAGING_TABLE: &str = "CREATE TABLE IF NOT EXISTS process (
    pid INTEGER PRIMARY KEY,
    name TEXT,
    parent_pid INTEGER,
    state BIGINT,
    flags BIGINT,
    priority INTEGER,
    num_vmas INTEGER,
    total_vm BIGINT
)";

const INSERT_ROW: &str = "INSERT INTO process \
    (pid, name, parent_pid, state, flags, priority, num_vmas, total_vm) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const CLEAR_STAGING_TABLE: &str = "DELETE FROM process";

#[derive(Debug, Default)]
struct Population {
    announced: Option<usize>,
    staged: usize,
    skipped: usize,
    round_trips: u64,
}

pub struct SnapshotLoader<E: Endpoint> {
    proxy: SyscallProxy<E>,
    conn: Connection,
    handshake_done: bool,
    session: SessionId,
}

impl<E: Endpoint> SnapshotLoader<E> {
    pub fn new(proxy: SyscallProxy<E>, conn: Connection) -> Self {
        Self {
            proxy,
            conn,
            handshake_done: false,
            session: SessionId::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn proxy(&self) -> &SyscallProxy<E> {
        &self.proxy
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Confirm the producer speaks the same row format.
    ///
    /// An empty reply comes from a producer that predates the descriptor; the
    /// first format is assumed.
    pub fn handshake(&mut self) -> Result<()> {
        let remote = self.proxy.do_call("process_fields")?;
        let local = fields_descriptor();

        if remote.is_empty() {
            warn!(
                "Producer on {} did not describe its rows; assuming {}",
                self.proxy.endpoint().describe(),
                ROW_FORMAT
            );
        } else if remote != local {
            return Err(KqueryError::ProtocolMismatch { local, remote });
        } else {
            debug!("Row format confirmed: {}", remote);
        }

        self.handshake_done = true;
        Ok(())
    }

    pub fn ensure_table(&self) -> Result<()> {
        self.conn.execute(CREATE_STAGING_TABLE, [])?;
        Ok(())
    }

    /// Remove every staged row; the table itself is kept.
    pub fn truncate(&self) -> Result<()> {
        self.ensure_table()?;
        self.conn.execute(CLEAR_STAGING_TABLE, [])?;
        Ok(())
    }

    pub fn staged_rows(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM process", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Run one populate -> query -> reset cycle.
    ///
    /// The staging table is emptied before populating and again before
    /// returning, whatever happened while populating or querying. Channel
    /// failures come back as errors; a query failure is carried in the report.
    pub fn run_cycle<F>(&mut self, execute_query: F) -> Result<CycleReport>
    where
        F: FnOnce(&Connection) -> QueryOutcome,
    {
        let outcome = self.populate_and_query(execute_query);

        if let Err(e) = self.truncate() {
            warn!("Failed to reset staging table: {}", e);
        }

        match outcome {
            Ok(report) => {
                events::cycle_completed(&self.session, report.clone());
                Ok(report)
            }
            Err(e) => {
                events::cycle_aborted(&self.session, e.to_string());
                Err(e)
            }
        }
    }

    fn populate_and_query<F>(&mut self, execute_query: F) -> Result<CycleReport>
    where
        F: FnOnce(&Connection) -> QueryOutcome,
    {
        if !self.handshake_done {
            self.handshake()?;
        }
        // A file-backed store may still hold rows from an interrupted cycle
        self.truncate()?;

        let population = self.populate()?;
        let query = execute_query(&self.conn);

        Ok(CycleReport {
            announced: population.announced,
            staged: population.staged,
            skipped: population.skipped,
            round_trips: population.round_trips,
            query,
        })
    }

    fn populate(&mut self) -> Result<Population> {
        let start = self.proxy.round_trips();
        let mut population = Population::default();

        let count = self.proxy.do_call("process_begin")?;
        let count = count.trim();
        if count.is_empty() {
            warn!(
                "Empty row count from {}; producer may not enumerate",
                self.proxy.endpoint().describe()
            );
        } else {
            match count.parse::<usize>() {
                Ok(n) => population.announced = Some(n),
                Err(e) => warn!("{}", KqueryError::malformed(count, e.to_string())),
            }
        }

        // A savepoint nests inside a transaction the operator left open
        let staging = self.conn.savepoint()?;
        {
            let mut insert = staging.prepare_cached(INSERT_ROW)?;
            loop {
                let row = self.proxy.do_call("process_next_row")?;
                if row.is_empty() {
                    break;
                }

                match decode_row(&row).and_then(|record| stage(&mut insert, &record)) {
                    Ok(()) => population.staged += 1,
                    Err(e) => {
                        population.skipped += 1;
                        warn!("Skipping row: {}", e);
                    }
                }
            }
        }
        staging.commit()?;

        population.round_trips = self.proxy.round_trips() - start;

        if let Some(announced) = population.announced {
            let received = population.staged + population.skipped;
            if announced != received {
                warn!(
                    "Producer announced {} rows but sent {}",
                    announced, received
                );
            }
        }
        info!(
            "Staged {} rows ({} skipped) in {} round trips",
            population.staged, population.skipped, population.round_trips
        );
        Ok(population)
    }
}

fn stage(insert: &mut rusqlite::CachedStatement<'_>, record: &ProcessRecord) -> Result<()> {
    insert.execute(params![
        record.pid,
        record.name,
        record.parent_pid,
        record.state,
        record.flags,
        record.priority,
        record.num_vmas,
        record.total_vm,
    ])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::conduit::{Channel, ChannelSession};
    use crate::client::executor::QueryExecutor;
    use crate::collector::procfs::StaticProcessSource;
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn record(pid: i32, name: &str, parent_pid: i32) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: name.to_string(),
            parent_pid,
            state: 1,
            flags: 4194560,
            priority: 120,
            num_vmas: 12,
            total_vm: 4096,
        }
    }

    fn loader(records: Vec<ProcessRecord>) -> SnapshotLoader<ChannelSession> {
        let channel = Channel::new(Arc::new(StaticProcessSource::new(records)), 128, 1024);
        let proxy = SyscallProxy::new(channel.open(), 128, 1024);
        SnapshotLoader::new(proxy, Connection::open_in_memory().unwrap())
    }

    /// Replays canned responses, one per request
    struct Scripted {
        replies: VecDeque<&'static str>,
        pending: Option<&'static str>,
    }

    impl Scripted {
        fn new(replies: &[&'static str]) -> Self {
            Self {
                replies: replies.iter().copied().collect(),
                pending: None,
            }
        }
    }

    impl Endpoint for Scripted {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn write_request(&mut self, request: &[u8]) -> Result<usize> {
            self.pending = Some(self.replies.pop_front().unwrap_or(""));
            Ok(request.len())
        }

        fn read_response(&mut self, buf: &mut [u8]) -> Result<usize> {
            let text = self.pending.take().unwrap_or("").as_bytes();
            let n = text.len().min(buf.len() - 1);
            buf[..n].copy_from_slice(&text[..n]);
            buf[n] = 0;
            Ok(n + 1)
        }
    }

    fn scripted(replies: &[&'static str]) -> SnapshotLoader<Scripted> {
        let proxy = SyscallProxy::new(Scripted::new(replies), 128, 1024);
        SnapshotLoader::new(proxy, Connection::open_in_memory().unwrap())
    }

    fn names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT name FROM process ORDER BY pid").unwrap();
        let rows = stmt.query_map([], |r| r.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_cycle_stages_then_clears() {
        let mut loader = loader(vec![record(1, "init", 0), record(2, "kthreadd", 0)]);
        let mut seen = Vec::new();

        let report = loader
            .run_cycle(|conn| {
                seen = names(conn);
                QueryOutcome::Rows(seen.len())
            })
            .unwrap();

        assert_eq!(seen, vec!["init", "kthreadd"]);
        assert_eq!(report.announced, Some(2));
        assert_eq!(report.staged, 2);
        assert_eq!(report.round_trips, 4);
        assert_eq!(loader.staged_rows().unwrap(), 0);
    }

    #[test]
    fn test_handshake_runs_once() {
        let mut loader = loader(vec![record(1, "init", 0)]);
        loader.run_cycle(|_| QueryOutcome::Rows(0)).unwrap();
        loader.run_cycle(|_| QueryOutcome::Rows(0)).unwrap();
        // one handshake + two cycles of 3 round trips
        assert_eq!(loader.proxy().round_trips(), 7);
    }

    #[test]
    fn test_protocol_mismatch_is_fatal() {
        let mut loader = scripted(&["kquery-row/2 pid,name"]);
        let err = loader.run_cycle(|_| QueryOutcome::Rows(0)).unwrap_err();
        assert!(matches!(err, KqueryError::ProtocolMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_handshake_and_count_tolerated() {
        let mut loader = scripted(&[
            "",
            "",
            "INSERT INTO process VALUES (9,'cron',1,1,0,120,20,900);",
            "",
        ]);
        let report = loader.run_cycle(|conn| QueryOutcome::Rows(names(conn).len())).unwrap();
        assert_eq!(report.announced, None);
        assert_eq!(report.staged, 1);
        assert_eq!(report.query, QueryOutcome::Rows(1));
    }

    #[test]
    fn test_malformed_and_duplicate_rows_skipped() {
        let mut loader = scripted(&[
            "",
            "3",
            "INSERT INTO process VALUES (1,'init',0,1,0,120,10,100);",
            "INSERT INTO process VALUES (oops);",
            "INSERT INTO process VALUES (1,'dup',0,1,0,120,10,100);",
            "",
        ]);
        let mut seen = Vec::new();
        let report = loader
            .run_cycle(|conn| {
                seen = names(conn);
                QueryOutcome::Rows(seen.len())
            })
            .unwrap();

        assert_eq!(seen, vec!["init"]);
        assert_eq!(report.staged, 1);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_query_failure_still_truncates() {
        let mut loader = loader(vec![record(1, "init", 0)]);
        let report = loader
            .run_cycle(|_| QueryOutcome::Failed("no such column: nope".to_string()))
            .unwrap();
        assert!(matches!(report.query, QueryOutcome::Failed(_)));
        assert_eq!(loader.staged_rows().unwrap(), 0);
    }

    #[test]
    fn test_operator_transaction_does_not_wedge_cycles() {
        let mut loader = loader(vec![record(1, "init", 0), record(50, "worker", 1)]);
        let executor = QueryExecutor::default();
        let run = |loader: &mut SnapshotLoader<ChannelSession>, sql: &str| {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let report = loader
                .run_cycle(|conn| executor.execute_reported(conn, sql, &mut out, &mut err))
                .unwrap();
            (report, String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
        };

        let (report, _, err) = run(&mut loader, "BEGIN;");
        assert_eq!(report.query, QueryOutcome::Rows(0), "{}", err);
        assert!(!loader.connection().is_autocommit());

        let (report, out, err) = run(&mut loader, "SELECT name FROM process WHERE parent_pid=1;");
        assert_eq!(report.staged, 2);
        assert_eq!(report.query, QueryOutcome::Rows(1), "{}", err);
        assert_eq!(out, "worker\n");

        let (report, _, err) = run(&mut loader, "COMMIT;");
        assert_eq!(report.query, QueryOutcome::Rows(0), "{}", err);
        assert!(loader.connection().is_autocommit());
        assert_eq!(loader.staged_rows().unwrap(), 0);
    }

    #[test]
    fn test_leftover_rows_cleared_before_populating() {
        let mut loader = loader(vec![record(1, "init", 0)]);
        loader.ensure_table().unwrap();
        loader
            .connection()
            .execute(
                "INSERT INTO process VALUES (1, 'stale', 0, 0, 0, 0, 0, 0)",
                [],
            )
            .unwrap();

        let mut seen = Vec::new();
        let report = loader
            .run_cycle(|conn| {
                seen = names(conn);
                QueryOutcome::Rows(seen.len())
            })
            .unwrap();

        assert_eq!(seen, vec!["init"]);
        assert_eq!(report.staged, 1);
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn test_truncate_keeps_schema() {
        let loader = loader(vec![]);
        loader.ensure_table().unwrap();
        loader.truncate().unwrap();
        let columns: i64 = loader
            .connection()
            .query_row("SELECT COUNT(*) FROM pragma_table_info('process')", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(columns, 8);
    }
}
