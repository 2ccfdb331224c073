//! The irbus dispatcher daemon.
//!
//! The dispatcher works as a broker between clients and one or more
//! backends over three well-known Unix-domain sockets:
//!
//! - the **client** socket carries the classic command surface
//!   (`SEND_ONCE`, `LIST`, ...) and decoded button-press events,
//! - the **backend** socket is where backend processes connect; a
//!   registration handshake starts immediately,
//! - the **control** socket accepts cross-backend administrative commands
//!   (`LIST_BACKENDS`, `SET_DEFAULT_BACKEND`, ...).
//!
//! For each connected backend there is also a named pipe carrying decoded
//! events into the dispatcher. The daemon does three things: it broadcasts
//! every decoded event to all idle clients, forwards client commands to the
//! default backend, and forwards control commands to the designated backend
//! or answers them itself. While a command is in flight the client/backend
//! pair is connected: the client gets no event broadcasts and no further
//! commands are dispatched for it until the terminating `END` line or a
//! timeout.

pub mod cli;
pub mod dispatch;
pub mod event_loop;
pub mod handshake;
pub mod process;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use cli::Cli;
pub use event_loop::{EventLoop, HEARTBEAT, RuntimeError, Shutdown};
pub use process::{LaunchError, run};
pub use registry::{ConnectionRecord, FdRegistry, Originator, Role};
pub use router::{COMMAND_TIMEOUT_TICKS, Router};
pub use telemetry::{LogHandle, TelemetryError};
