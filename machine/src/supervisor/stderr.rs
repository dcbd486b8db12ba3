//! In-memory capture of hypervisor stderr.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use machine_shared::errors::{MachineError, MachineResult};
use parking_lot::Mutex;

/// Keep at most this many trailing bytes.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Shared buffer the reader thread appends to.
#[derive(Debug, Clone, Default)]
pub struct StderrBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl StderrBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut buf = self.inner.lock();
        buf.extend_from_slice(bytes);
        if buf.len() > MAX_CAPTURE_BYTES {
            let excess = buf.len() - MAX_CAPTURE_BYTES;
            buf.drain(..excess);
        }
    }

    /// Captured output, lossily decoded and trimmed.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Strips ANSI escape sequences of the form `ESC [ ... m`.
fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next_char in chars.by_ref() {
                    if next_char == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Spawn a thread copying `reader` into `buffer` line by line.
///
/// Each line is also mirrored to tracing under `machine:hypervisor`. The
/// thread exits when the pipe closes.
pub fn spawn_capture<R: Read + Send + 'static>(
    reader: R,
    buffer: StderrBuffer,
    process: &str,
) -> MachineResult<JoinHandle<()>> {
    let thread_name = format!("{}-stderr", process);
    let mut reader = BufReader::new(reader);

    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        buffer.append(&line);
                        let text = String::from_utf8_lossy(&line);
                        let clean = strip_ansi_codes(text.trim_end());
                        if !clean.is_empty() {
                            tracing::warn!(target: "machine:hypervisor", "{}", clean);
                        }
                    }
                    Err(e) => {
                        tracing::error!(target: "machine:hypervisor", "Failed to read stderr pipe: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!(target: "machine:hypervisor", "Stderr pipe closed");
        })
        .map_err(|e| MachineError::Internal(format!("Failed to spawn stderr reader thread: {}", e)))
}
