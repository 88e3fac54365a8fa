//! Transport layer for the poliqarpd protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands (one at a time)   ┌────────────┐
//! │   Client     │ ──────────► Connector ─────►│  poliqarpd │
//! │ (query jobs) │ ◄── reply FIFO ◄──┐         │            │
//! └──────────────┘                   │ receive │            │
//!        ▲                           │  loop   │            │
//!        └──── milestone handler ◄───┴─────────┴────────────┘
//! ```
//!
//! # Protocol
//!
//! Newline-terminated UTF-8 lines. Server lines carry a class marker:
//!
//! ```text
//! R OK 6
//! M QUERY-DONE 6
//! ```

mod connector;
mod framing;

pub use connector::{Connector, Exchange, MilestoneHandler};
pub use framing::{
    encode_command, parse_line, read_line, write_command, LineClass, ServerErrorCode, ServerLine,
    Status, MAX_LINE_SIZE,
};
