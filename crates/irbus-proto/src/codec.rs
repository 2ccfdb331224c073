//! Encoding of framed protocol replies.

use std::io::{self, Write};

const BEGIN: &str = "BEGIN\n";
const DATA: &str = "DATA\n";
const END: &str = "END\n";
const ERROR: &str = "ERROR\n";
const SUCCESS: &str = "SUCCESS\n";
const SIGHUP: &str = "SIGHUP\n";

/// One framed reply, ready to be serialised onto a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Successful completion, with zero or more payload lines.
    Success {
        /// The command line being answered, trailing newline stripped.
        message: String,
        /// Payload lines; an empty payload omits the DATA section.
        data: Vec<String>,
    },
    /// Failed completion; the payload carries at least the error text.
    Error {
        /// The command line being answered, trailing newline stripped.
        message: String,
        /// Error description lines.
        data: Vec<String>,
    },
    /// Out-of-band reload notification.
    SigHup,
}

impl Reply {
    /// Builds a success reply without payload.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: strip_newline(message.into()),
            data: Vec::new(),
        }
    }

    /// Builds a success reply carrying payload lines.
    #[must_use]
    pub fn success_with(message: impl Into<String>, data: Vec<String>) -> Self {
        Self::Success {
            message: strip_newline(message.into()),
            data,
        }
    }

    /// Builds an error reply. Embedded newlines in `text` become separate
    /// payload lines.
    #[must_use]
    pub fn error(message: impl Into<String>, text: impl Into<String>) -> Self {
        let text = strip_newline(text.into());
        Self::Error {
            message: strip_newline(message.into()),
            data: text.split('\n').map(str::to_owned).collect(),
        }
    }

    /// Serialises the reply into its wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Success { message, data } if data.is_empty() => {
                format!("{BEGIN}{message}\n{SUCCESS}{END}")
            }
            Self::Success { message, data } => {
                let mut frame = format!("{BEGIN}{message}\n{SUCCESS}{DATA}{}\n", data.len());
                for line in data {
                    frame.push_str(line);
                    frame.push('\n');
                }
                frame.push_str(END);
                frame
            }
            Self::Error { message, data } => {
                let mut frame = format!("{BEGIN}{message}\n{ERROR}{DATA}{}\n", data.len());
                for line in data {
                    frame.push_str(line);
                    frame.push('\n');
                }
                frame.push_str(END);
                frame
            }
            Self::SigHup => format!("{BEGIN}{SIGHUP}{END}"),
        }
    }
}

fn strip_newline(mut s: String) -> String {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

/// Writes a payload-less success reply.
///
/// # Errors
///
/// Returns the underlying IO error when the peer stops accepting bytes; the
/// connection is then considered broken.
pub fn send_success(writer: &mut impl Write, message: &str) -> io::Result<()> {
    writer.write_all(Reply::success(message).encode().as_bytes())
}

/// Writes a success reply with payload lines.
///
/// # Errors
///
/// Returns the underlying IO error when the peer stops accepting bytes.
pub fn send_success_with(writer: &mut impl Write, message: &str, data: Vec<String>) -> io::Result<()> {
    writer.write_all(Reply::success_with(message, data).encode().as_bytes())
}

/// Writes an error reply.
///
/// # Errors
///
/// Returns the underlying IO error when the peer stops accepting bytes.
pub fn send_error(writer: &mut impl Write, message: &str, text: &str) -> io::Result<()> {
    writer.write_all(Reply::error(message, text).encode().as_bytes())
}

/// Writes the out-of-band SIGHUP frame.
///
/// # Errors
///
/// Returns the underlying IO error when the peer stops accepting bytes.
pub fn send_sighup(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(Reply::SigHup.encode().as_bytes())
}

/// Splits a command line into its directive and the argument tail.
///
/// Returns `None` for empty or whitespace-only lines. The tail, when present,
/// is trimmed of surrounding whitespace.
#[must_use]
pub fn split_directive(line: &str) -> Option<(&str, Option<&str>)> {
    let trimmed = line.trim_matches([' ', '\t', '\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once([' ', '\t']) {
        Some((directive, tail)) => {
            let tail = tail.trim_matches([' ', '\t']);
            Some((directive, (!tail.is_empty()).then_some(tail)))
        }
        None => Some((trimmed, None)),
    }
}
