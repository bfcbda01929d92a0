//! RESP Protocol Implementation
//!
//! The wire codec shared by the gateway front end (parsing client commands,
//! encoding replies) and the backend client (encoding commands, parsing
//! replies from the store).
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum and its serializer
//! - `parser`: incremental parser with a command mode and a reply mode
//!
//! ## Example
//!
//! ```
//! use kvgate::protocol::{parse_reply, RespValue};
//!
//! let ping = RespValue::command(["PING"]).serialize();
//! assert_eq!(ping, b"*1\r\n$4\r\nPING\r\n");
//!
//! let (reply, consumed) = parse_reply(b"+PONG\r\n").unwrap().unwrap();
//! assert_eq!(reply, RespValue::pong());
//! assert_eq!(consumed, 7);
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, parse_reply, ParseError, ParseMode, ParseResult, RespParser};
pub use types::RespValue;
