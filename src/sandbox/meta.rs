//! Isolate meta file parser
//!
//! Parses the meta file written by `isolate --meta` into raw resource usage and
//! termination facts.

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded (CPU or wall clock, see `IsolateMeta::wall_timeout`)
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Runtime error (non-zero exit)
    RuntimeError,
    /// Internal error in isolate
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone, PartialEq)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Memory used in KB (from cg-mem or max-rss), if reported
    pub memory_kb: Option<u64>,
    /// Exit code of the process
    pub exit_code: i32,
    pub status: IsolateStatus,
    /// The cgroup OOM killer fired
    pub oom_killed: bool,
    /// Isolate killed the program itself
    pub killed: bool,
    /// Human-readable status message
    pub message: Option<String>,
}

impl IsolateMeta {
    /// Time-out status caused by the wall clock rather than CPU time
    pub fn wall_timeout(&self) -> bool {
        self.status == IsolateStatus::TimeOut
            && self
                .message
                .as_deref()
                .map(|m| m.to_lowercase().contains("wall"))
                .unwrap_or(false)
    }
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: None,
            exit_code: 0,
            status: IsolateStatus::Ok,
            oom_killed: false,
            killed: false,
            message: None,
        }
    }
}

fn seconds_to_ms(value: &str) -> Option<u64> {
    value.parse::<f64>().ok().map(|t| (t * 1000.0).round() as u64)
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = String::new();
    let mut exit_sig = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Some(t) = seconds_to_ms(value) {
                    meta.time_ms = t;
                }
            }
            "time-wall" => {
                if let Some(t) = seconds_to_ms(value) {
                    meta.wall_time_ms = t;
                }
            }
            "cg-mem" | "max-rss" => {
                // cg-mem for cgroups, max-rss for non-cgroups (both in KB)
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = Some(meta.memory_kb.map_or(m, |prev| prev.max(m)));
                }
            }
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "killed" => meta.killed = value == "1",
            "message" => meta.message = Some(value.to_string()),
            "status" => status_str = value.to_string(),
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => exit_sig = value.parse::<i32>().ok(),
            _ => {}
        }
    }

    meta.status = match (status_str.as_str(), exit_sig) {
        ("TO", _) => IsolateStatus::TimeOut,
        ("XX", _) => IsolateStatus::InternalError,
        (_, Some(sig)) => IsolateStatus::Signal(sig),
        ("SG", None) => IsolateStatus::Signal(0),
        ("", None) if meta.exit_code == 0 => IsolateStatus::Ok,
        _ => IsolateStatus::RuntimeError,
    };

    meta
}
