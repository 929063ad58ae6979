//! Line-delimited JSON protocol shared between the Driver and the in-sandbox Runner.
//!
//! One request per UNIX socket connection, one response, then close. Every
//! line (request or response) ends with `\n`.

use serde::{Deserialize, Serialize};

/// Maximum size of a single exec output payload returned to the caller.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Maximum size of a command that may be sent inline (not staged to a file).
pub const MAX_EXEC_INLINE_CMD_BYTES: usize = 1024 * 1024;
/// Default cap for a `read` request when `max_bytes <= 0`.
pub const DEFAULT_MAX_READ_BYTES: usize = 1024 * 1024;

pub const BEGIN_SENTINEL: &str = "__SANDKASTEN_BEGIN__";
pub const END_SENTINEL: &str = "__SANDKASTEN_END__";

/// Workspace docker-volume-style naming prefix, carried over from the host
/// tooling that provisions persistent workspace directories.
pub const WORKSPACE_VOLUME_PREFIX: &str = "sandkasten-ws-";

/// Path, inside every sandbox, at which the runner listens.
pub const RUNNER_SOCK_PATH: &str = "/run/sandkasten/runner.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Exec {
        id: String,
        cmd: String,
        #[serde(default)]
        timeout_ms: u64,
        #[serde(default)]
        raw_output: bool,
    },
    Write {
        id: String,
        path: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        content_base64: Option<String>,
    },
    Read {
        id: String,
        path: String,
        #[serde(default)]
        max_bytes: i64,
    },
}

impl Request {
    pub fn id(&self) -> &str {
        match self {
            Request::Exec { id, .. } => id,
            Request::Write { id, .. } => id,
            Request::Read { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready,
    Exec {
        id: String,
        exit_code: i32,
        cwd: String,
        output: String,
        truncated: bool,
        duration_ms: u64,
    },
    Write {
        id: String,
        ok: bool,
    },
    Read {
        id: String,
        content_base64: String,
        truncated: bool,
    },
    Error {
        id: String,
        error: String,
    },
}

impl Response {
    pub fn error(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Response::Error {
            id: id.into(),
            error: msg.into(),
        }
    }

    /// True for an `exec` response whose output begins with the runner's own
    /// `timeout:` marker.
    pub fn is_exec_timeout(&self) -> bool {
        matches!(
            self,
            Response::Exec { exit_code, output, .. }
                if *exit_code == -1 && output.starts_with("timeout:")
        )
    }
}

/// Parsed form of the end sentinel line as printed by the exec wrapper:
/// `__SANDKASTEN_END__:<id>:<rc>:<pwd>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndMarker {
    pub id: String,
    pub exit_code: i32,
    pub cwd: String,
}

impl EndMarker {
    /// Parses a trailing end-sentinel line. Splits on `:` with a limit of 5
    /// fields and tolerates a trailing `\r`.
    pub fn parse(line: &str) -> Option<EndMarker> {
        let line = line.trim_end_matches('\r');
        let mut parts = line.splitn(4, ':');
        let sentinel = parts.next()?;
        if sentinel != END_SENTINEL {
            return None;
        }
        let id = parts.next()?.to_string();
        let rc_str = parts.next()?;
        let cwd = parts.next().unwrap_or("").to_string();
        let exit_code = rc_str.parse::<i32>().ok()?;
        Some(EndMarker { id, exit_code, cwd })
    }
}

pub fn begin_marker(id: &str) -> String {
    format!("{BEGIN_SENTINEL}:{id}")
}

pub fn end_marker_prefix(id: &str) -> String {
    format!("{END_SENTINEL}:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_end_marker_with_pwd_containing_colons() {
        let line = format!("{END_SENTINEL}:abc123:0:/workspace:subdir");
        let marker = EndMarker::parse(&line).unwrap();
        assert_eq!(marker.id, "abc123");
        assert_eq!(marker.exit_code, 0);
        assert_eq!(marker.cwd, "/workspace:subdir");
    }

    #[test]
    fn tolerates_trailing_carriage_return() {
        let line = format!("{END_SENTINEL}:abc123:1:/workspace\r");
        let marker = EndMarker::parse(&line).unwrap();
        assert_eq!(marker.exit_code, 1);
        assert_eq!(marker.cwd, "/workspace");
    }

    #[test]
    fn rejects_non_matching_sentinel() {
        assert!(EndMarker::parse("some other line").is_none());
    }

    #[test]
    fn request_serializes_with_tagged_type() {
        let req = Request::Exec {
            id: "x".into(),
            cmd: "echo hi".into(),
            timeout_ms: 5000,
            raw_output: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"exec\""));
    }
}
