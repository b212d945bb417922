//! Bounded capture of a VM's serial console.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

/// Lines kept per VM.
pub const CONSOLE_LINES: usize = 200;

/// Ring buffer of the most recent console lines, shared with the reader tasks.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(CONSOLE_LINES)
    }
}

/// Copy lines from `reader` into `buffer` until EOF.
///
/// Bytes that are not UTF-8 are replaced rather than ending the read, and a
/// read error only stops the copy once the pipe is closed: the hypervisor
/// gets EPIPE on its console writes as soon as nobody reads the other end.
pub(crate) async fn pump<R: AsyncRead + Unpin>(reader: R, buffer: ConsoleBuffer) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                buffer.push(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                warn!(error = %e, "Console read failed, discarding output");
                let mut sink = tokio::io::sink();
                if let Err(e) = tokio::io::copy(&mut reader, &mut sink).await {
                    debug!(error = %e, "Console drain stopped");
                }
                break;
            }
        }
    }
}
