//! Single-statement query execution against the staging store.

use crate::config::types::{KqueryError, QueryOutcome, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};
use std::io::Write;

pub const DEFAULT_SEPARATOR: &str = "|";

/// Runs one operator statement and renders result rows as separated lines
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    separator: String,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl QueryExecutor {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Execute exactly one statement, writing one line per result row.
    ///
    /// A blank statement is a no-op; trailing statements are an error and
    /// nothing is executed. Returns the number of rows written.
    pub fn execute(&self, conn: &Connection, sql: &str, out: &mut dyn Write) -> Result<usize> {
        if is_blank(sql) {
            return Ok(0);
        }

        let mut batch = Batch::new(conn, sql);
        let Some(mut stmt) = batch.next()? else {
            return Ok(0);
        };
        if batch.next()?.is_some() {
            return Err(rusqlite::Error::MultipleStatement.into());
        }

        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut emitted = 0;
        let mut line = String::new();

        while let Some(row) = rows.next()? {
            line.clear();
            for i in 0..columns {
                if i > 0 {
                    line.push_str(&self.separator);
                }
                render_value(row.get_ref(i)?, &mut line);
            }
            writeln!(out, "{}", line)?;
            emitted += 1;
        }

        out.flush()?;
        Ok(emitted)
    }

    /// Like [`execute`](Self::execute) but reports failures on `err` instead
    /// of returning them, so the enclosing cycle can carry on.
    pub fn execute_reported(
        &self,
        conn: &Connection,
        sql: &str,
        out: &mut dyn Write,
        err: &mut dyn Write,
    ) -> QueryOutcome {
        match self.execute(conn, sql, out) {
            Ok(rows) => QueryOutcome::Rows(rows),
            Err(e) => {
                let message = match &e {
                    KqueryError::Relational(inner) => inner.to_string(),
                    other => other.to_string(),
                };
                let _ = writeln!(err, "SQL error: {}", message);
                QueryOutcome::Failed(message)
            }
        }
    }
}

fn is_blank(sql: &str) -> bool {
    sql.trim_matches(|c: char| c.is_whitespace() || c == ';').is_empty()
}

fn render_value(value: ValueRef<'_>, out: &mut String) {
    match value {
        ValueRef::Null => out.push_str("NULL"),
        ValueRef::Integer(i) => out.push_str(&i.to_string()),
        ValueRef::Real(f) => out.push_str(&f.to_string()),
        ValueRef::Text(bytes) => out.push_str(&String::from_utf8_lossy(bytes)),
        ValueRef::Blob(bytes) => {
            out.push_str("x'");
            for b in bytes {
                out.push_str(&format!("{:02x}", b));
            }
            out.push('\'');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE process (pid INTEGER PRIMARY KEY, name TEXT, parent_pid INTEGER);
             INSERT INTO process VALUES (1, 'init', 0);
             INSERT INTO process VALUES (50, 'worker', 1);
             INSERT INTO process VALUES (77, NULL, 50);",
        )
        .unwrap();
        conn
    }

    fn run(executor: &QueryExecutor, conn: &Connection, sql: &str) -> (QueryOutcome, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = executor.execute_reported(conn, sql, &mut out, &mut err);
        (
            outcome,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_rows_joined_with_separator() {
        let conn = store();
        let (outcome, out, err) = run(
            &QueryExecutor::default(),
            &conn,
            "SELECT pid, name, parent_pid FROM process ORDER BY pid;",
        );
        assert_eq!(outcome, QueryOutcome::Rows(3));
        assert_eq!(out, "1|init|0\n50|worker|1\n77|NULL|50\n");
        assert!(err.is_empty());
    }

    #[test]
    fn test_custom_separator_and_value_kinds() {
        let conn = store();
        let executor = QueryExecutor::new(", ");
        let (_, out, _) = run(&executor, &conn, "SELECT 1.5, x'00ff', 'a''b'");
        assert_eq!(out, "1.5, x'00ff', a'b\n");
    }

    #[test]
    fn test_syntax_error_reported_not_raised() {
        let conn = store();
        let (outcome, out, err) = run(&QueryExecutor::default(), &conn, "SELEC name FROM process");
        assert!(matches!(outcome, QueryOutcome::Failed(_)));
        assert!(out.is_empty());
        assert!(err.starts_with("SQL error: "));
    }

    #[test]
    fn test_second_statement_rejected() {
        let conn = store();
        let (outcome, _, err) = run(
            &QueryExecutor::default(),
            &conn,
            "SELECT 1; DELETE FROM process",
        );
        assert!(matches!(outcome, QueryOutcome::Failed(_)));
        assert!(err.starts_with("SQL error: "));
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM process", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 3);
    }

    #[test]
    fn test_blank_statement_is_noop() {
        let conn = store();
        let (outcome, out, _) = run(&QueryExecutor::default(), &conn, "  ;\n");
        assert_eq!(outcome, QueryOutcome::Rows(0));
        assert!(out.is_empty());
    }

    #[test]
    fn test_statement_without_result_rows() {
        let conn = store();
        let (outcome, out, _) = run(
            &QueryExecutor::default(),
            &conn,
            "UPDATE process SET name = 'renamed' WHERE pid = 77",
        );
        assert_eq!(outcome, QueryOutcome::Rows(0));
        assert!(out.is_empty());
        let name: String = conn
            .query_row("SELECT name FROM process WHERE pid = 77", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "renamed");
    }
}
