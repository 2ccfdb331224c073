//! Reassembly of protocol lines from partial socket reads.

/// Accumulates raw bytes and yields complete newline-terminated lines.
///
/// Socket reads can deliver a fraction of a line or several lines at once;
/// the buffer holds whatever has arrived until a full line is available.
/// Returned lines have the terminating `\n` and any trailing `\r` removed.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes read from the socket.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Reports whether at least one complete line is buffered.
    #[must_use]
    pub fn has_lines(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// Removes and returns the next complete line, if any.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let rest = self.buffer.split_off(end + 1);
        let mut line = std::mem::replace(&mut self.buffer, rest);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
