//! Process sources: the live `/proc` walker and a fixed table for tests.

use crate::config::types::{ProcessRecord, Result};
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

pub trait ProcessSource: Send + Sync {
    fn source_name(&self) -> &str;
    /// Read every currently running process into owned records
    fn capture(&self) -> Result<Vec<ProcessRecord>>;
}

/// Map a `/proc/<pid>/stat` state letter to the kernel `TASK_*` value.
pub fn task_state_code(state: char) -> i64 {
    match state {
        'R' => 0x0000,
        'S' => 0x0001,
        'D' => 0x0002,
        'T' => 0x0004,
        't' => 0x0008,
        'X' => 0x0010,
        'Z' => 0x0020,
        'P' => 0x0040,
        'K' => 0x0080,
        'W' => 0x0200,
        // TASK_IDLE = TASK_UNINTERRUPTIBLE | TASK_NOLOAD
        'I' => 0x0402,
        _ => -1,
    }
}

/// Fields of interest from one `/proc/<pid>/stat` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub name: String,
    pub state: char,
    pub parent_pid: i32,
    pub flags: i64,
    /// Raw stat priority (kernel prio - 100)
    pub priority: i32,
}

/// Parse a stat line. The name is delimited by the first `(` and the last `)`
/// since it may itself contain parentheses and spaces.
pub fn parse_stat(line: &str) -> Option<StatFields> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let name = line[open + 1..close].to_string();
    let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state); field N lives at rest[N - 3]
    if rest.len() < 16 {
        return None;
    }

    let state = rest[0].chars().next()?;
    let parent_pid = rest[1].parse().ok()?;
    let flags = rest[6].parse::<u64>().ok()? as i64;
    let priority = rest[15].parse().ok()?;

    Some(StatFields {
        name,
        state,
        parent_pid,
        flags,
        priority,
    })
}

fn vanished(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ESRCH)
}

/// Walks a proc filesystem mount
pub struct ProcfsSource {
    root: PathBuf,
}

impl ProcfsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn list_pids(&self) -> Result<Vec<i32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn count_vmas(dir: &Path) -> std::io::Result<i32> {
        let file = match fs::File::open(dir.join("maps")) {
            Ok(file) => file,
            // Reading another user's maps needs ptrace access
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut count = 0;
        for line in BufReader::new(file).lines() {
            match line {
                Ok(_) => count += 1,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => return Ok(0),
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    fn total_vm(dir: &Path) -> std::io::Result<i64> {
        let statm = fs::read_to_string(dir.join("statm"))?;
        Ok(statm
            .split_whitespace()
            .next()
            .and_then(|pages| pages.parse().ok())
            .unwrap_or(0))
    }

    fn read_record(&self, pid: i32) -> std::io::Result<ProcessRecord> {
        let dir = self.root.join(pid.to_string());
        // The comm name is arbitrary bytes; only the name is lossy-decoded
        let stat_bytes = fs::read(dir.join("stat"))?;
        let stat_line = String::from_utf8_lossy(&stat_bytes);
        let stat = parse_stat(&stat_line).ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidData, format!("unparsable stat for pid {}", pid))
        })?;

        let num_vmas = Self::count_vmas(&dir)?;
        let total_vm = Self::total_vm(&dir)?;

        Ok(ProcessRecord {
            pid,
            name: stat.name,
            parent_pid: stat.parent_pid,
            state: task_state_code(stat.state),
            flags: stat.flags,
            priority: stat.priority + 100,
            num_vmas,
            total_vm,
        })
    }
}

impl ProcessSource for ProcfsSource {
    fn source_name(&self) -> &str {
        "procfs"
    }

    fn capture(&self) -> Result<Vec<ProcessRecord>> {
        let pids = self.list_pids()?;
        let mut records = Vec::with_capacity(pids.len());

        for pid in pids {
            match self.read_record(pid) {
                Ok(record) => records.push(record),
                Err(e) if vanished(&e) => {
                    log::debug!("pid {} exited during capture, skipping", pid);
                }
                Err(e) => {
                    log::warn!("Failed to read process {}: {}", pid, e);
                }
            }
        }

        log::debug!(
            "Captured {} processes from {}",
            records.len(),
            self.root.display()
        );
        Ok(records)
    }
}

/// Fixed process table, captured verbatim on every call
#[derive(Debug, Clone, Default)]
pub struct StaticProcessSource {
    records: Vec<ProcessRecord>,
}

impl StaticProcessSource {
    pub fn new(records: Vec<ProcessRecord>) -> Self {
        Self { records }
    }
}

impl ProcessSource for StaticProcessSource {
    fn source_name(&self) -> &str {
        "static"
    }

    fn capture(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_STAT: &str = "1 (systemd) S 0 1 1 0 -1 4194560 52123 2345678 98 1234 \
        210 345 4567 890 20 0 1 0 14 175329280 3012 18446744073709551615 1 1 0 0 0 0 \
        671173123 4096 1260 0 0 0 17 3 0 0 0 0 0";

    fn fake_proc_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("kquery-proc-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).expect("create fake proc root");
        root
    }

    fn add_process(root: &Path, pid: i32, stat: &str, maps: Option<&str>, statm: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).expect("create pid dir");
        fs::write(dir.join("stat"), stat).expect("write stat");
        if let Some(maps) = maps {
            fs::write(dir.join("maps"), maps).expect("write maps");
        }
        fs::write(dir.join("statm"), statm).expect("write statm");
    }

    #[test]
    fn test_parse_stat_fields() {
        let stat = parse_stat(INIT_STAT).expect("parse");
        assert_eq!(stat.name, "systemd");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.parent_pid, 0);
        assert_eq!(stat.flags, 4194560);
        assert_eq!(stat.priority, 20);
    }

    #[test]
    fn test_parse_stat_name_with_parens_and_spaces() {
        let line = "42 (evil) name (x) R 7 42 42 0 -1 64 0 0 0 0 0 0 0 0 39 19 1 0 5 0 0";
        let stat = parse_stat(line).expect("parse");
        assert_eq!(stat.name, "evil) name (x");
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.parent_pid, 7);
        assert_eq!(stat.priority, 39);
    }

    #[test]
    fn test_parse_stat_rejects_truncated_line() {
        assert!(parse_stat("12 (sh) S 1 12").is_none());
        assert!(parse_stat("no parens here").is_none());
    }

    #[test]
    fn test_task_state_codes() {
        assert_eq!(task_state_code('R'), 0);
        assert_eq!(task_state_code('S'), 1);
        assert_eq!(task_state_code('D'), 2);
        assert_eq!(task_state_code('Z'), 32);
        assert_eq!(task_state_code('I'), 0x402);
        assert_eq!(task_state_code('?'), -1);
    }

    #[test]
    fn test_capture_from_fake_root() {
        let root = fake_proc_root();
        add_process(
            &root,
            1,
            INIT_STAT,
            Some("55d0-55d1 r--p 00000000 08:01 1 /usr/lib/systemd\n7ff0-7ff1 rw-p 00000000 00:00 0\n"),
            "42807 3012 2100 320 0 5000 0\n",
        );
        // Kernel thread: no address space
        add_process(
            &root,
            2,
            "2 (kthreadd) S 0 0 0 0 -1 2129984 0 0 0 0 0 0 0 0 20 0 1 0 2 0 0",
            Some(""),
            "0 0 0 0 0 0 0\n",
        );
        fs::create_dir_all(root.join("self")).expect("non-numeric entry");

        let source = ProcfsSource::new(&root);
        let records = source.capture().expect("capture");
        fs::remove_dir_all(&root).ok();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            ProcessRecord {
                pid: 1,
                name: "systemd".to_string(),
                parent_pid: 0,
                state: 1,
                flags: 4194560,
                priority: 120,
                num_vmas: 2,
                total_vm: 42807,
            }
        );
        assert_eq!(records[1].name, "kthreadd");
        assert_eq!(records[1].num_vmas, 0);
        assert_eq!(records[1].total_vm, 0);
    }

    #[test]
    fn test_capture_skips_vanished_process() {
        let root = fake_proc_root();
        add_process(&root, 10, "10 (sh) S 1 10 10 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 9 0 0", Some(""), "10 1 1 0 0 1 0");
        // Directory exists but stat is gone: the process exited mid-walk
        fs::create_dir_all(root.join("11")).expect("create pid dir");

        let records = ProcfsSource::new(&root).capture().expect("capture");
        fs::remove_dir_all(&root).ok();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 10);
    }

    #[test]
    fn test_capture_keeps_process_with_non_utf8_name() {
        let root = fake_proc_root();
        add_process(&root, 42, "42 (placeholder) S 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 9 0 0", Some(""), "8 1 1 0 0 1 0");
        let mut stat = b"42 (bad".to_vec();
        stat.push(0xff);
        stat.extend_from_slice(b"name) R 1 42 42 0 -1 64 0 0 0 0 0 0 0 0 25 0 1 0 9 0 0");
        fs::write(root.join("42").join("stat"), &stat).expect("write stat");

        let records = ProcfsSource::new(&root).capture().expect("capture");
        fs::remove_dir_all(&root).ok();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 42);
        assert_eq!(records[0].name, "bad\u{FFFD}name");
        assert_eq!(records[0].state, 0);
        assert_eq!(records[0].parent_pid, 1);
        assert_eq!(records[0].priority, 125);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_live_proc_contains_self() {
        let records = ProcfsSource::new("/proc").capture().expect("capture /proc");
        let me = std::process::id() as i32;
        assert!(records.iter().any(|r| r.pid == me));
        let mut pids: Vec<i32> = records.iter().map(|r| r.pid).collect();
        pids.dedup();
        assert_eq!(pids.len(), records.len(), "pids must be unique");
    }
}
