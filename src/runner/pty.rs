//! Pseudoterminal-backed shell and its output ring buffer.

use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::error::{Result, SandkastenError};

const RING_CAPACITY: usize = 8 * 1024 * 1024;
pub const PTY_ROWS: u16 = 40;
pub const PTY_COLS: u16 = 120;

/// Bounded byte ring. Writers never block; once full, the oldest bytes are
/// dropped to make room — the runner only ever needs a recent window of
/// output to find a sentinel that was just printed.
pub struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer {
            data: vec![0u8; capacity],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let capacity = self.data.len();
        for &b in bytes {
            let idx = (self.head + self.len) % capacity;
            self.data[idx] = b;
            if self.len < capacity {
                self.len += 1;
            } else {
                self.head = (self.head + 1) % capacity;
            }
        }
    }

    /// Returns the current contents as a contiguous, newly allocated buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        let capacity = self.data.len();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.data[(self.head + i) % capacity]);
        }
        out
    }
}

/// A PTY-backed interactive shell. The master fd is read continuously on a
/// background thread into a shared ring buffer; writers (the exec dispatcher)
/// push wrapper snippets into the master and poll the ring buffer for the
/// sentinel pair.
pub struct Shell {
    master: OwnedFd,
    pub buffer: Arc<Mutex<RingBuffer>>,
}

impl Shell {
    /// Spawns `bash -l` if present on `$PATH`, else `sh -l`, attached to a
    /// fresh PTY sized 40x120, with a minimal interactive environment.
    pub fn spawn() -> Result<Shell> {
        let (master, slave_path) = open_pty()?;

        let shell_path = which("bash").unwrap_or_else(|| "/bin/sh".to_string());
        let login_flag = "-l";

        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => {
                nix::unistd::setsid().ok();
                let slave_fd = nix::fcntl::open(
                    slave_path.as_str(),
                    nix::fcntl::OFlag::O_RDWR,
                    nix::sys::stat::Mode::empty(),
                )
                .expect("opening pty slave in child");
                for target in [0, 1, 2] {
                    let _ = nix::unistd::dup2(slave_fd, target);
                }
                unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) };

                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("PS1", "$ ");
                std::env::set_var("PS2", "> ");
                std::env::set_var("HISTFILE", "");
                std::env::set_var("HOME", "/home/sandbox");
                std::env::set_var(
                    "PATH",
                    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                );

                use std::os::unix::process::CommandExt;
                let err = std::process::Command::new(&shell_path)
                    .arg(login_flag)
                    .current_dir("/workspace")
                    .exec();
                eprintln!("sandkasten-runner: exec shell failed: {err}");
                std::process::exit(127);
            }
            Ok(nix::unistd::ForkResult::Parent { .. }) => {}
            Err(e) => return Err(SandkastenError::Internal(format!("forking shell: {e}"))),
        }

        set_winsize(master.as_raw_fd(), PTY_ROWS, PTY_COLS);

        let buffer = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY)));
        spawn_reader_thread(master.as_raw_fd(), buffer.clone());

        Ok(Shell { master, buffer })
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        nix::unistd::write(&self.master, data)
            .map_err(|e| SandkastenError::Internal(format!("writing to pty master: {e}")))?;
        Ok(())
    }
}

fn spawn_reader_thread(master_fd: RawFd, buffer: Arc<Mutex<RingBuffer>>) {
    std::thread::spawn(move || {
        let mut file = unsafe { std::fs::File::from_raw_fd(master_fd) };
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.lock().unwrap().push(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        std::mem::forget(file);
    });
}

fn open_pty() -> Result<(OwnedFd, String)> {
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

    let master = posix_openpt(nix::fcntl::OFlag::O_RDWR)
        .map_err(|e| SandkastenError::Internal(format!("posix_openpt: {e}")))?;
    grantpt(&master).map_err(|e| SandkastenError::Internal(format!("grantpt: {e}")))?;
    unlockpt(&master).map_err(|e| SandkastenError::Internal(format!("unlockpt: {e}")))?;
    let slave_path =
        ptsname_r(&master).map_err(|e| SandkastenError::Internal(format!("ptsname_r: {e}")))?;
    Ok((master.into(), slave_path))
}

fn set_winsize(fd: RawFd, rows: u16, cols: u16) {
    #[repr(C)]
    struct Winsize {
        ws_row: u16,
        ws_col: u16,
        ws_xpixel: u16,
        ws_ypixel: u16,
    }
    let ws = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        libc::ioctl(fd, libc::TIOCSWINSZ, &ws);
    }
}

fn which(name: &str) -> Option<String> {
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
    for dir in path.split(':') {
        let candidate = std::path::Path::new(dir).join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_holds_contents_under_capacity() {
        let mut rb = RingBuffer::new(16);
        rb.push(b"hello");
        assert_eq!(rb.snapshot(), b"hello");
    }

    #[test]
    fn ring_buffer_drops_oldest_bytes_when_full() {
        let mut rb = RingBuffer::new(4);
        rb.push(b"abcdef");
        assert_eq!(rb.snapshot(), b"cdef");
    }

    #[test]
    fn ring_buffer_wraps_across_multiple_pushes() {
        let mut rb = RingBuffer::new(4);
        rb.push(b"ab");
        rb.push(b"cd");
        rb.push(b"ef");
        assert_eq!(rb.snapshot(), b"cdef");
    }
}
