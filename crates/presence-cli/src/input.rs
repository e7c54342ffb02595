//! Lines typed into the terminal, for both menu prompts and running sessions.
//!
//! One reader owns the line buffer for fd 0, so lines typed ahead of a
//! session are still there when the session starts. The descriptor's file
//! flags are never changed; a session checks for input with `poll` and a
//! zero timeout once per iteration.

use presence_core::Command;
use std::io;
use std::os::fd::RawFd;

pub struct LineReader {
    fd: RawFd,
    pending: Vec<u8>,
    eof: bool,
}

impl LineReader {
    pub fn stdin() -> Self {
        Self::from_fd(libc::STDIN_FILENO)
    }

    /// Read lines from `fd`. The caller keeps ownership of the descriptor.
    pub fn from_fd(fd: RawFd) -> Self {
        Self {
            fd,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Wait for the next line. `None` once input is closed and drained.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = take_line(&mut self.pending) {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(take_rest(&mut self.pending));
            }
            self.fill()?;
        }
    }

    /// Lines that are complete right now, without blocking.
    ///
    /// At end of input a trailing line without a newline is returned too.
    pub fn ready_lines(&mut self) -> Vec<String> {
        while !self.eof && self.readable() {
            if let Err(e) = self.fill() {
                tracing::warn!(error = %e, "failed to read terminal input");
                break;
            }
        }
        let mut lines = Vec::new();
        while let Some(line) = take_line(&mut self.pending) {
            lines.push(line);
        }
        if self.eof {
            lines.extend(take_rest(&mut self.pending));
        }
        lines
    }

    /// Input was closed; no further lines can arrive.
    pub fn is_eof(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    fn readable(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        // POLLHUP without POLLIN still means the next read returns 0.
        ret > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0
    }

    /// One blocking read into `pending`.
    fn fill(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes for the whole call.
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&buf[..n as usize]);
            }
            return Ok(());
        }
    }
}

/// Split the first finished line off `pending`.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let newline = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=newline).collect();
    Some(String::from_utf8_lossy(&line).trim_end_matches(['\n', '\r']).to_string())
}

fn take_rest(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let rest = std::mem::take(pending);
    Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
}

/// Map a typed line to a session command: `s` save, `p` pause, `c` continue, `q` quit.
pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "s" | "save" => Some(Command::Save),
        "p" | "pause" => Some(Command::Pause),
        "c" | "continue" | "resume" => Some(Command::Resume),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}
