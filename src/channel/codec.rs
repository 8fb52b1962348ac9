//! Textual row encoding shared by producer and consumer.
//!
//! A row travels as a single insert statement:
//!
//! ```text
//! INSERT INTO process VALUES (<pid>,'<name>',<parent_pid>,<state>,<flags>,<priority>,<num_vmas>,<total_vm>);
//! ```
//!
//! Single quotes in the name are doubled. The field list is versioned by
//! [`ROW_FORMAT`]; both sides compare [`fields_descriptor`] before staging.

use crate::config::types::{KqueryError, ProcessRecord, Result};

pub const ROW_FORMAT: &str = "kquery-row/1";

/// Column order of the encoded row; must match the staging schema
pub const ROW_FIELDS: [&str; 8] = [
    "pid",
    "name",
    "parent_pid",
    "state",
    "flags",
    "priority",
    "num_vmas",
    "total_vm",
];

const ROW_PREFIX: &str = "INSERT INTO process VALUES (";
const ROW_SUFFIX: &str = ");";

/// Reply to the `process_fields` request
pub fn fields_descriptor() -> String {
    format!("{} {}", ROW_FORMAT, ROW_FIELDS.join(","))
}

pub fn escape_text(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn encode_row(record: &ProcessRecord) -> String {
    format!(
        "{}{},'{}',{},{},{},{},{},{}{}",
        ROW_PREFIX,
        record.pid,
        escape_text(&record.name),
        record.parent_pid,
        record.state,
        record.flags,
        record.priority,
        record.num_vmas,
        record.total_vm,
        ROW_SUFFIX
    )
}

/// Cursor over the value list between the parentheses
struct Fields<'a> {
    row: &'a str,
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn separator(&mut self) -> Result<()> {
        self.rest = self
            .rest
            .strip_prefix(',')
            .ok_or_else(|| KqueryError::malformed(self.row, "expected ','"))?;
        Ok(())
    }

    fn integer<T: std::str::FromStr>(&mut self, field: &str) -> Result<T> {
        let end = self.rest.find(',').unwrap_or(self.rest.len());
        let (digits, rest) = self.rest.split_at(end);
        let value = digits
            .parse::<T>()
            .map_err(|_| KqueryError::malformed(self.row, format!("bad {} value {:?}", field, digits)))?;
        self.rest = rest;
        Ok(value)
    }

    fn quoted(&mut self, field: &str) -> Result<String> {
        let body = self
            .rest
            .strip_prefix('\'')
            .ok_or_else(|| KqueryError::malformed(self.row, format!("{} must be quoted", field)))?;

        let mut value = String::new();
        let mut chars = body.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            if ch != '\'' {
                value.push(ch);
                continue;
            }
            if let Some((_, '\'')) = chars.peek() {
                chars.next();
                value.push('\'');
                continue;
            }
            self.rest = &body[idx + 1..];
            return Ok(value);
        }
        Err(KqueryError::malformed(self.row, format!("unterminated {}", field)))
    }
}

pub fn decode_row(row: &str) -> Result<ProcessRecord> {
    let body = row
        .strip_prefix(ROW_PREFIX)
        .and_then(|r| r.strip_suffix(ROW_SUFFIX))
        .ok_or_else(|| KqueryError::malformed(row, "not a process row"))?;

    let mut fields = Fields { row, rest: body };
    let pid = fields.integer("pid")?;
    fields.separator()?;
    let name = fields.quoted("name")?;
    fields.separator()?;
    let parent_pid = fields.integer("parent_pid")?;
    fields.separator()?;
    let state = fields.integer("state")?;
    fields.separator()?;
    let flags = fields.integer("flags")?;
    fields.separator()?;
    let priority = fields.integer("priority")?;
    fields.separator()?;
    let num_vmas = fields.integer("num_vmas")?;
    fields.separator()?;
    let total_vm = fields.integer("total_vm")?;

    if !fields.rest.is_empty() {
        return Err(KqueryError::malformed(row, "trailing fields"));
    }

    Ok(ProcessRecord {
        pid,
        name,
        parent_pid,
        state,
        flags,
        priority,
        num_vmas,
        total_vm,
    })
}
