//! The in-sandbox Runner agent: PID 1 inside every sandbox.

pub mod pty;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Result, SandkastenError};
use crate::protocol::{
    begin_marker, end_marker_prefix, EndMarker, Request, Response, DEFAULT_MAX_READ_BYTES,
    MAX_OUTPUT_BYTES, RUNNER_SOCK_PATH,
};

const WORKSPACE_ROOT: &str = "/workspace";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum ExecEngine {
    Interactive(pty::Shell),
    Stateless,
}

/// Runs the runner's accept loop forever. Never
/// returns on the happy path.
pub fn run(stateless: bool) -> Result<()> {
    let sock_path = Path::new(RUNNER_SOCK_PATH);
    if let Some(parent) = sock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(sock_path);

    let listener = UnixListener::bind(sock_path)
        .map_err(|e| SandkastenError::Internal(format!("binding runner socket: {e}")))?;
    std::fs::set_permissions(sock_path, std::fs::Permissions::from_mode(0o600))?;

    let engine = if stateless {
        ExecEngine::Stateless
    } else {
        ExecEngine::Interactive(pty::Shell::spawn()?)
    };

    println!("{}", serde_json::to_string(&Response::Ready).unwrap());
    std::io::stdout().flush().ok();

    for incoming in listener.incoming() {
        let Ok(stream) = incoming else { continue };
        if let Err(e) = handle_connection(stream, &engine) {
            eprintln!("sandkasten-runner: connection error: {e}");
        }
    }

    Ok(())
}

fn handle_connection(mut stream: UnixStream, engine: &ExecEngine) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(request) => dispatch(request, engine),
        Err(e) => Response::error("unknown", format!("invalid request: {e}")),
    };

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    stream.write_all(out.as_bytes())?;
    Ok(())
}

fn dispatch(request: Request, engine: &ExecEngine) -> Response {
    match request {
        Request::Exec {
            id,
            cmd,
            timeout_ms,
            raw_output,
        } => exec(engine, id, cmd, timeout_ms, raw_output),
        Request::Write {
            id,
            path,
            text,
            content_base64,
        } => write_file(id, path, text, content_base64),
        Request::Read { id, path, max_bytes } => read_file(id, path, max_bytes),
    }
}

fn resolve_workspace_path(path: &str) -> PathBuf {
    let root = Path::new(WORKSPACE_ROOT);
    if path.is_empty() {
        return root.to_path_buf();
    }
    let candidate = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        root.join(path)
    };

    match candidate.components().collect::<Vec<_>>().iter().fold(
        PathBuf::new(),
        |mut acc, comp| {
            match comp {
                std::path::Component::ParentDir => {
                    acc.pop();
                }
                std::path::Component::Normal(part) => acc.push(part),
                std::path::Component::RootDir => acc = PathBuf::from("/"),
                _ => {}
            }
            acc
        },
    ) {
        normalized if normalized.starts_with(root) => normalized,
        _ => root.to_path_buf(),
    }
}

fn write_file(id: String, path: String, text: Option<String>, content_base64: Option<String>) -> Response {
    let target = resolve_workspace_path(&path);
    let bytes = match content_base64 {
        Some(b64) => match BASE64.decode(b64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => return Response::error(id, format!("invalid content_base64: {e}")),
        },
        None => text.unwrap_or_default().into_bytes(),
    };

    if let Some(parent) = target.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return Response::error(id, format!("creating parent directories: {e}"));
        }
    }
    if let Err(e) = std::fs::write(&target, &bytes) {
        return Response::error(id, format!("writing file: {e}"));
    }
    let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644));

    Response::Write { id, ok: true }
}

fn read_file(id: String, path: String, max_bytes: i64) -> Response {
    if max_bytes < 0 {
        return Response::error(id, "max_bytes must be >= 0");
    }
    let cap = if max_bytes == 0 {
        DEFAULT_MAX_READ_BYTES
    } else {
        max_bytes as usize
    };

    let target = resolve_workspace_path(&path);
    let file = match std::fs::File::open(&target) {
        Ok(f) => f,
        Err(e) => return Response::error(id, format!("opening file: {e}")),
    };

    use std::io::Read;
    let mut limited = file.take((cap + 1) as u64);
    let mut buf = Vec::with_capacity(cap + 1);
    if let Err(e) = limited.read_to_end(&mut buf) {
        return Response::error(id, format!("reading file: {e}"));
    }

    let truncated = buf.len() > cap;
    if truncated {
        buf.truncate(cap);
    }

    Response::Read {
        id,
        content_base64: BASE64.encode(&buf),
        truncated,
    }
}

fn exec(engine: &ExecEngine, id: String, cmd: String, timeout_ms: u64, raw_output: bool) -> Response {
    let timeout = if timeout_ms == 0 {
        Duration::from_secs(120)
    } else {
        Duration::from_millis(timeout_ms)
    };

    match engine {
        ExecEngine::Stateless => exec_stateless(id, cmd, timeout, raw_output),
        ExecEngine::Interactive(shell) => exec_interactive(shell, id, cmd, timeout, raw_output),
    }
}

/// Spawns a reader thread per pipe so a child that writes more than the OS
/// pipe buffer before exiting never stalls the `try_wait` poll loop below.
fn spawn_pipe_reader(pipe: Option<impl std::io::Read + Send + 'static>) -> Option<std::thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            use std::io::Read;
            let mut data = Vec::new();
            let _ = pipe.read_to_end(&mut data);
            data
        })
    })
}

fn exec_stateless(id: String, cmd: String, timeout: Duration, raw_output: bool) -> Response {
    use std::process::Stdio;

    let start = Instant::now();
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .current_dir(WORKSPACE_ROOT)
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin")
        .env("HOME", "/home/sandbox")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => return Response::error(id, format!("spawning command: {e}")),
    };

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    break None;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Response::error(id, format!("waiting on command: {e}")),
        }
    };

    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        let _ = stdout_reader.map(|t| t.join());
        let _ = stderr_reader.map(|t| t.join());
        return Response::Exec {
            id,
            exit_code: -1,
            cwd: WORKSPACE_ROOT.to_string(),
            output: format!("timeout: command exceeded {}ms", timeout.as_millis()),
            truncated: false,
            duration_ms: start.elapsed().as_millis() as u64,
        };
    };

    let mut output = stdout_reader.map(|t| t.join().unwrap_or_default()).unwrap_or_default();
    output.extend(stderr_reader.map(|t| t.join().unwrap_or_default()).unwrap_or_default());

    let mut text = String::from_utf8_lossy(&output).into_owned();
    if !raw_output {
        text = normalize_line_endings(&strip_ansi(&text));
    }
    let truncated = text.len() > MAX_OUTPUT_BYTES;
    text.truncate(MAX_OUTPUT_BYTES.min(text.len()));
    Response::Exec {
        id,
        exit_code: status.code().unwrap_or(-1),
        cwd: WORKSPACE_ROOT.to_string(),
        output: text,
        truncated,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Wraps `cmd` in a sentinel-bracketed snippet and feeds it to the PTY,
/// polling the ring buffer for the *printed* end sentinel rather than the
/// echoed command line.
fn exec_interactive(shell: &pty::Shell, id: String, cmd: String, timeout: Duration, raw_output: bool) -> Response {
    let start = Instant::now();
    let encoded = BASE64.encode(cmd.as_bytes());
    let begin = begin_marker(&id);
    let end_prefix = end_marker_prefix(&id);

    let wrapper = format!(
        "printf '%s\\n' '{begin}'; echo {encoded} | base64 -d | bash; __sk_rc=$?; printf '%s:%s:%s\\n' '{end_prefix}' \"$__sk_rc\" \"$PWD\"\n",
    );

    if let Err(e) = shell.write(wrapper.as_bytes()) {
        return Response::error(id, format!("writing to pty: {e}"));
    }

    let true_end_needle = format!("\n{end_prefix}");
    let deadline = Instant::now() + timeout;

    loop {
        let snapshot = shell.buffer.lock().unwrap().snapshot();
        let text = String::from_utf8_lossy(&snapshot);

        if let Some(end_pos) = text.rfind(&true_end_needle) {
            let end_line_start = end_pos + 1; // skip the leading \n we matched on
            let end_line = text[end_line_start..]
                .lines()
                .next()
                .unwrap_or("")
                .to_string();

            if let Some(marker) = EndMarker::parse(&end_line) {
                // A PTY slave runs with ONLCR, so the printed begin sentinel is
                // followed by "\r\n", not a bare "\n" - match the marker alone
                // and skip to the start of the next line, tolerating the \r.
                let begin_needle = format!("\n{begin}");
                let body_start = text
                    .find(&begin_needle)
                    .and_then(|p| text[p + 1..].find('\n').map(|rel| p + 1 + rel + 1))
                    .unwrap_or(0);
                let mut body = text[body_start..end_pos.min(text.len())].to_string();
                if !raw_output {
                    body = normalize_line_endings(&strip_ansi(&body));
                }

                let truncated = body.len() > MAX_OUTPUT_BYTES;
                if truncated {
                    body = window_output(&body, MAX_OUTPUT_BYTES);
                }

                return Response::Exec {
                    id,
                    exit_code: marker.exit_code,
                    cwd: marker.cwd,
                    output: body,
                    truncated,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        }

        if Instant::now() >= deadline {
            return Response::Exec {
                id,
                exit_code: -1,
                cwd: String::new(),
                output: format!("timeout: command exceeded {}ms", timeout.as_millis()),
                truncated: false,
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Truncates to exactly `cap` bytes, unless the body has already ballooned
/// past 2x `cap` — in which case a head window and a trailing 4 KiB window
/// are kept instead, split so their combined length never exceeds `cap`.
/// At `cap+1` bytes the payload truncates to exactly `cap` bytes; only the
/// 2x-cap case gets head+tail windowing.
fn window_output(body: &str, cap: usize) -> String {
    const TAIL_WINDOW: usize = 4096;
    if body.len() <= cap {
        return body.to_string();
    }
    if body.len() <= cap * 2 {
        return body.chars().take(cap).collect();
    }
    let tail_window = TAIL_WINDOW.min(cap);
    let head_len = cap - tail_window;
    let head: String = body.chars().take(head_len).collect();
    let tail_start = body.len().saturating_sub(tail_window);
    let tail = &body[tail_start..];
    format!("{head}{tail}")
}

/// Normalises PTY line endings (`\r\n` -> `\n`) for non-raw output.
fn normalize_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n")
}

/// Strips ANSI CSI/OSC/DCS/SOS/PM/APC sequences, recognising both the
/// two-byte `ESC [` introducer and the single-byte `0x9b` CSI form.
fn strip_ansi(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x1b if i + 1 < bytes.len() => {
                i = skip_escape_sequence(bytes, i);
            }
            0x9b => {
                i = skip_csi_body(bytes, i + 1);
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn skip_escape_sequence(bytes: &[u8], esc_pos: usize) -> usize {
    match bytes.get(esc_pos + 1) {
        Some(b'[') => skip_csi_body(bytes, esc_pos + 2),
        Some(b']') | Some(b'P') | Some(b'X') | Some(b'^') | Some(b'_') => {
            skip_string_terminated(bytes, esc_pos + 2)
        }
        Some(_) => esc_pos + 2,
        None => esc_pos + 1,
    }
}

fn skip_csi_body(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if (0x40..=0x7e).contains(&b) {
            break;
        }
    }
    i
}

fn skip_string_terminated(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        if bytes[i] == 0x07 {
            return i + 1;
        }
        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
            return i + 2;
        }
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_color_codes() {
        let input = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(input), "red plain");
    }

    #[test]
    fn strips_osc_terminated_by_bel() {
        let input = "\x1b]0;window title\x07visible";
        assert_eq!(strip_ansi(input), "visible");
    }

    #[test]
    fn strips_single_byte_csi_introducer() {
        let input = "\u{9b}1mhello";
        assert_eq!(strip_ansi(input), "hello");
    }

    #[test]
    fn resolve_workspace_path_blocks_traversal_outside_workspace() {
        assert_eq!(resolve_workspace_path("../../etc/passwd"), Path::new(WORKSPACE_ROOT));
    }

    #[test]
    fn resolve_workspace_path_keeps_relative_paths_under_workspace() {
        assert_eq!(
            resolve_workspace_path("sub/file.txt"),
            Path::new(WORKSPACE_ROOT).join("sub/file.txt")
        );
    }

    #[test]
    fn window_output_preserves_head_and_tail() {
        // cap is bigger than the 4 KiB tail window, so both survive and the
        // combined length lands exactly on cap.
        let cap = 5000;
        let body = "a".repeat(cap) + &"b".repeat(cap);
        let windowed = window_output(&body, cap);
        assert_eq!(windowed.len(), cap);
        assert!(windowed.starts_with(&"a".repeat(cap - 4096)));
        assert!(windowed.ends_with(&"b".repeat(4096)));
    }

    #[test]
    fn window_output_never_exceeds_cap_when_tail_window_exceeds_cap() {
        // cap smaller than the 4 KiB tail window: the tail window shrinks to
        // fit, the whole budget goes to the tail, but the total still never
        // exceeds cap.
        let body = "a".repeat(10) + &"b".repeat(10);
        let windowed = window_output(&body, 5);
        assert_eq!(windowed.len(), 5);
        assert_eq!(windowed, "bbbbb");
    }

    #[test]
    fn window_output_simple_truncation_stays_under_two_x_cap() {
        // cap+1 bytes, not yet past 2x cap: plain truncation to exactly cap.
        let body = "x".repeat(6);
        let windowed = window_output(&body, 5);
        assert_eq!(windowed, "xxxxx");
    }

    #[test]
    fn normalize_line_endings_converts_crlf_to_lf() {
        assert_eq!(normalize_line_endings("hello\r\nworld\r\n"), "hello\nworld\n");
    }
}
