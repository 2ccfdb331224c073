//! Wire protocol shared by the irbus dispatcher, its backends and clients.
//!
//! The protocol is line-oriented ASCII over Unix-domain stream sockets. A
//! command is a single line, `<DIRECTIVE> <argument-tail>\n`. Every command
//! elicits exactly one framed reply:
//!
//! ```text
//! BEGIN
//! <message>
//! SUCCESS | ERROR
//! [DATA
//! <n>
//! <line 1>
//! ...
//! <line n>]
//! END
//! ```
//!
//! where `<message>` echoes the command line that elicited the reply and
//! `<n>` is the decimal payload line count. A `BEGIN/SIGHUP/END` frame is
//! broadcast out of band when the dispatcher reloads.
//!
//! [`Reply`] and the `send_*` helpers encode frames, [`ReplyParser`] consumes
//! them one line at a time, and [`LineBuffer`] reassembles lines from partial
//! socket reads.

mod codec;
mod line;
mod reply;

pub use codec::{
    Reply, send_error, send_sighup, send_success, send_success_with, split_directive,
};
pub use line::LineBuffer;
pub use reply::{ReplyOutcome, ReplyParser};

/// Longest protocol line read in one go, terminator included.
pub const PACKET_SIZE: usize = 256;
