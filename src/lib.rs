//! Resource-safe serial port handles.
//!
//! This library wraps a procedural serial driver in owned handle types:
//! callers enumerate, open, configure, read and write ports and wait on
//! readiness across several ports, without freeing native records or checking
//! status codes by hand.
//!
//! # Modules
//!
//! - `port`: the [`Port`], [`Configuration`] and [`EventSet`] handles
//! - `error`: the four-kind [`Error`] taxonomy and status translation
//! - `transport`: the [`Transport`](transport::Transport) driver interface,
//!   the `serialport`-backed hardware driver and an in-memory mock
//! - `types`: line parameter enums, signal and event bit sets
//! - `debug`: process-wide hook for driver diagnostics
//! - `config`: TOML settings for the `spwrap` binary and hardware tests
//!
//! # Example
//!
//! ```no_run
//! use spwrap::{Buffer, Mode, Port};
//! use std::time::Duration;
//!
//! for port in Port::list()? {
//!     println!("{} ({})", port.name()?, port.description()?);
//! }
//!
//! let port = Port::by_name("/dev/ttyUSB0")?;
//! port.open(Mode::ReadWrite)?;
//! port.set_baudrate(115_200)?;
//! port.flush(Buffer::Both)?;
//! port.blocking_write(b"AT\r\n", Duration::from_millis(500))?;
//!
//! let mut reply = [0u8; 64];
//! let n = port.blocking_read(&mut reply, Duration::from_millis(500))?;
//! println!("{:?}", &reply[..n]);
//! # Ok::<(), spwrap::Error>(())
//! ```

pub mod config;
pub mod debug;
pub mod error;
pub mod port;
pub mod transport;
pub mod types;

pub use debug::{clear_debug_handler, set_debug_handler, DebugHandler};
pub use error::{Error, ErrorKind, Result};
pub use port::{Configuration, EventSet, Port};
pub use types::{
    Buffer, Cts, Dsr, Dtr, EventMask, FlowControl, Mode, Parity, Rts, Signals, TransportKind,
    XonXoff,
};
