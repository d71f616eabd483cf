//! The fixed operation set the handle layer drives.
//!
//! A [`Transport`] is the native serial driver seen through opaque tokens: it
//! allocates and frees port, configuration and event-set records, and every
//! operation returns either a value or a negative [`ReturnCode`]. The handle
//! types in [`crate::port`] own the tokens and guarantee each record is freed
//! exactly once.
//!
//! Two drivers ship with the crate:
//! - [`SerialportTransport`]: real hardware through the `serialport` crate.
//! - [`MockTransport`]: in-memory ports with allocation counters and failure
//!   injection, for tests.

pub mod mock;
pub mod native;

use crate::types::{
    Buffer, Cts, Dsr, Dtr, EventMask, FlowControl, Mode, Parity, Rts, Signals, TransportKind,
    XonXoff,
};
use crate::debug;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub use mock::MockTransport;
pub use native::SerialportTransport;

/// Negative status codes a transport can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    /// Invalid arguments were passed to the function.
    Arg = -1,
    /// A system error occurred; details are in [`Transport::last_error`].
    Fail = -2,
    /// A memory allocation failed.
    Mem = -3,
    /// The requested operation is not supported.
    Supp = -4,
}

impl ReturnCode {
    /// Interpret a C-style status: non-negative values are counts.
    pub fn from_status(status: i32) -> RawResult<usize> {
        match status {
            s if s >= 0 => Ok(s as usize),
            -1 => Err(Self::Arg),
            -3 => Err(Self::Mem),
            -4 => Err(Self::Supp),
            _ => Err(Self::Fail),
        }
    }

    pub fn to_status(self) -> i32 {
        self as i32
    }
}

/// Result of a single transport operation.
pub type RawResult<T> = Result<T, ReturnCode>;

/// Details of the most recent `Fail` reported by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    pub message: String,
    /// Platform error code (`errno` / `GetLastError`), 0 if none.
    pub code: i32,
}

/// Opaque reference to a native port record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortToken(pub u64);

/// Opaque reference to a native configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigToken(pub u64);

/// Opaque reference to a native event-set record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventSetToken(pub u64);

/// A single line parameter with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Baudrate(u32),
    Bits(u8),
    Parity(Parity),
    StopBits(u8),
    Rts(Rts),
    Cts(Cts),
    Dtr(Dtr),
    Dsr(Dsr),
    XonXoff(XonXoff),
}

/// Which line parameter to read from a configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKind {
    Baudrate,
    Bits,
    Parity,
    StopBits,
    Rts,
    Cts,
    Dtr,
    Dsr,
    XonXoff,
}

impl SettingKind {
    pub const ALL: [SettingKind; 9] = [
        SettingKind::Baudrate,
        SettingKind::Bits,
        SettingKind::Parity,
        SettingKind::StopBits,
        SettingKind::Rts,
        SettingKind::Cts,
        SettingKind::Dtr,
        SettingKind::Dsr,
        SettingKind::XonXoff,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Baudrate => "baudrate",
            Self::Bits => "bits",
            Self::Parity => "parity",
            Self::StopBits => "stopbits",
            Self::Rts => "rts",
            Self::Cts => "cts",
            Self::Dtr => "dtr",
            Self::Dsr => "dsr",
            Self::XonXoff => "xon_xoff",
        }
    }
}

impl Setting {
    pub fn kind(&self) -> SettingKind {
        match self {
            Self::Baudrate(_) => SettingKind::Baudrate,
            Self::Bits(_) => SettingKind::Bits,
            Self::Parity(_) => SettingKind::Parity,
            Self::StopBits(_) => SettingKind::StopBits,
            Self::Rts(_) => SettingKind::Rts,
            Self::Cts(_) => SettingKind::Cts,
            Self::Dtr(_) => SettingKind::Dtr,
            Self::Dsr(_) => SettingKind::Dsr,
            Self::XonXoff(_) => SettingKind::XonXoff,
        }
    }

    /// Range check shared by the handle layer and the drivers.
    pub fn validate(&self) -> RawResult<()> {
        let ok = match *self {
            Self::Baudrate(rate) => rate > 0 && rate <= i32::MAX as u32,
            Self::Bits(bits) => (5..=8).contains(&bits),
            Self::StopBits(bits) => (1..=2).contains(&bits),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ReturnCode::Arg)
        }
    }
}

/// Contents of a configuration record. `None` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineSettings {
    pub baudrate: Option<u32>,
    pub bits: Option<u8>,
    pub parity: Option<Parity>,
    pub stopbits: Option<u8>,
    pub rts: Option<Rts>,
    pub cts: Option<Cts>,
    pub dtr: Option<Dtr>,
    pub dsr: Option<Dsr>,
    pub xon_xoff: Option<XonXoff>,
}

impl LineSettings {
    /// Settings a freshly opened port starts with: 9600 8N1, no flow control.
    pub fn port_defaults() -> Self {
        Self {
            baudrate: Some(9600),
            bits: Some(8),
            parity: Some(Parity::None),
            stopbits: Some(1),
            rts: Some(Rts::On),
            cts: Some(Cts::Ignore),
            dtr: Some(Dtr::On),
            dsr: Some(Dsr::Ignore),
            xon_xoff: Some(XonXoff::Disabled),
        }
    }

    pub fn get(&self, kind: SettingKind) -> Option<Setting> {
        match kind {
            SettingKind::Baudrate => self.baudrate.map(Setting::Baudrate),
            SettingKind::Bits => self.bits.map(Setting::Bits),
            SettingKind::Parity => self.parity.map(Setting::Parity),
            SettingKind::StopBits => self.stopbits.map(Setting::StopBits),
            SettingKind::Rts => self.rts.map(Setting::Rts),
            SettingKind::Cts => self.cts.map(Setting::Cts),
            SettingKind::Dtr => self.dtr.map(Setting::Dtr),
            SettingKind::Dsr => self.dsr.map(Setting::Dsr),
            SettingKind::XonXoff => self.xon_xoff.map(Setting::XonXoff),
        }
    }

    pub fn set(&mut self, setting: Setting) {
        match setting {
            Setting::Baudrate(v) => self.baudrate = Some(v),
            Setting::Bits(v) => self.bits = Some(v),
            Setting::Parity(v) => self.parity = Some(v),
            Setting::StopBits(v) => self.stopbits = Some(v),
            Setting::Rts(v) => self.rts = Some(v),
            Setting::Cts(v) => self.cts = Some(v),
            Setting::Dtr(v) => self.dtr = Some(v),
            Setting::Dsr(v) => self.dsr = Some(v),
            Setting::XonXoff(v) => self.xon_xoff = Some(v),
        }
    }

    /// Every set field, in [`SettingKind::ALL`] order.
    pub fn iter_set(&self) -> impl Iterator<Item = Setting> + '_ {
        SettingKind::ALL.into_iter().filter_map(|kind| self.get(kind))
    }

    /// Fan a flow control preset out to the pin and Xon/Xoff fields.
    ///
    /// Pins that were in flow-control mode for a preset being switched away
    /// from are left asserted rather than dropped.
    pub fn set_flowcontrol(&mut self, flowcontrol: FlowControl) {
        self.xon_xoff = Some(if flowcontrol == FlowControl::XonXoff {
            XonXoff::InOut
        } else {
            XonXoff::Disabled
        });

        if flowcontrol == FlowControl::RtsCts {
            self.rts = Some(Rts::FlowControl);
            self.cts = Some(Cts::FlowControl);
        } else {
            if self.rts == Some(Rts::FlowControl) {
                self.rts = Some(Rts::On);
            }
            self.cts = Some(Cts::Ignore);
        }

        if flowcontrol == FlowControl::DtrDsr {
            self.dtr = Some(Dtr::FlowControl);
            self.dsr = Some(Dsr::FlowControl);
        } else {
            if self.dtr == Some(Dtr::FlowControl) {
                self.dtr = Some(Dtr::On);
            }
            self.dsr = Some(Dsr::Ignore);
        }
    }
}

/// The native serial driver.
///
/// Implementations own every record they hand out until the matching `free_*`
/// call. Tokens are plain values: nothing here stops a caller from freeing one
/// twice, which is why callers go through the handle types instead.
///
/// Every method must be callable from any thread. A `Fail` return must leave
/// a message retrievable through [`Transport::last_error`] on the calling
/// thread.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Enumerate visible ports. The returned list is itself a native buffer
    /// and must be released with [`Transport::free_port_list`].
    fn list_ports(&self) -> RawResult<Vec<PortToken>>;
    fn free_port_list(&self, list: Vec<PortToken>);
    /// Copy a port record so it outlives the list it came from.
    fn copy_port(&self, port: PortToken) -> RawResult<PortToken>;
    fn get_port_by_name(&self, name: &str) -> RawResult<PortToken>;
    fn free_port(&self, port: PortToken);

    fn port_name(&self, port: PortToken) -> RawResult<String>;
    fn port_description(&self, port: PortToken) -> RawResult<String>;
    fn port_transport(&self, port: PortToken) -> RawResult<TransportKind>;
    fn port_usb_bus_address(&self, port: PortToken) -> RawResult<(u32, u32)>;
    fn port_usb_vid_pid(&self, port: PortToken) -> RawResult<(u16, u16)>;
    fn port_usb_manufacturer(&self, port: PortToken) -> RawResult<String>;
    fn port_usb_product(&self, port: PortToken) -> RawResult<String>;
    fn port_usb_serial(&self, port: PortToken) -> RawResult<String>;
    fn port_bluetooth_address(&self, port: PortToken) -> RawResult<String>;

    fn open(&self, port: PortToken, mode: Mode) -> RawResult<()>;
    fn close(&self, port: PortToken) -> RawResult<()>;

    /// Allocate a configuration record with every field unset.
    fn new_config(&self) -> RawResult<ConfigToken>;
    fn free_config(&self, config: ConfigToken);
    /// Read the live settings of an open port into `config`.
    fn get_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()>;
    /// Apply every set field of `config` to an open port.
    fn set_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()>;
    fn get_config_setting(&self, config: ConfigToken, kind: SettingKind) -> RawResult<Setting>;
    fn set_config_setting(&self, config: ConfigToken, setting: Setting) -> RawResult<()>;
    fn set_config_flowcontrol(&self, config: ConfigToken, flowcontrol: FlowControl)
        -> RawResult<()>;
    fn set_setting(&self, port: PortToken, setting: Setting) -> RawResult<()>;
    fn set_flowcontrol(&self, port: PortToken, flowcontrol: FlowControl) -> RawResult<()>;

    /// Read until `buf` is full or `timeout_ms` elapses (0 = no limit).
    fn blocking_read(&self, port: PortToken, buf: &mut [u8], timeout_ms: u32) -> RawResult<usize>;
    fn nonblocking_read(&self, port: PortToken, buf: &mut [u8]) -> RawResult<usize>;
    /// Write until all of `buf` is queued or `timeout_ms` elapses (0 = no limit).
    fn blocking_write(&self, port: PortToken, buf: &[u8], timeout_ms: u32) -> RawResult<usize>;
    fn nonblocking_write(&self, port: PortToken, buf: &[u8]) -> RawResult<usize>;
    fn input_waiting(&self, port: PortToken) -> RawResult<usize>;
    fn output_waiting(&self, port: PortToken) -> RawResult<usize>;
    fn flush(&self, port: PortToken, buffer: Buffer) -> RawResult<()>;
    fn drain(&self, port: PortToken) -> RawResult<()>;
    fn signals(&self, port: PortToken) -> RawResult<Signals>;
    fn start_break(&self, port: PortToken) -> RawResult<()>;
    fn end_break(&self, port: PortToken) -> RawResult<()>;

    fn new_event_set(&self) -> RawResult<EventSetToken>;
    fn free_event_set(&self, set: EventSetToken);
    fn add_port_events(&self, set: EventSetToken, port: PortToken, mask: EventMask)
        -> RawResult<()>;
    /// Block until any registered port is ready or `timeout_ms` elapses (0 = no limit).
    fn wait(&self, set: EventSetToken, timeout_ms: u32) -> RawResult<()>;

    fn last_error(&self) -> LastError;
}

/// Shared reference to a driver, held by every handle it produced.
pub type SharedTransport = Arc<dyn Transport>;

static NATIVE: Lazy<SharedTransport> = Lazy::new(|| Arc::new(SerialportTransport::new()));

/// The process-wide hardware driver used by the convenience constructors.
pub fn native() -> SharedTransport {
    Arc::clone(&NATIVE)
}

/// Token-indexed record storage used by the bundled drivers.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    next: u64,
    items: HashMap<u64, T>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            next: 1,
            items: HashMap::new(),
        }
    }
}

impl<T> Slots<T> {
    pub(crate) fn insert(&mut self, item: T) -> u64 {
        let id = self.next;
        self.next += 1;
        self.items.insert(id, item);
        id
    }

    pub(crate) fn get(&self, id: u64) -> Option<&T> {
        self.items.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<T> {
        self.items.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// A driver lock that holds back debug messages until it is released.
///
/// The guard unlocks before the hold ends, so a debug handler that calls back
/// into the driver never finds the lock taken.
pub(crate) struct Locked<'a, T> {
    pub(crate) guard: MutexGuard<'a, T>,
    _hold: debug::Hold,
}

impl<T> Deref for Locked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub(crate) trait LockExt<T> {
    fn locked(&self) -> Locked<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
    fn locked(&self) -> Locked<'_, T> {
        let hold = debug::hold();
        Locked {
            guard: self.lock(),
            _hold: hold,
        }
    }
}

/// Convert a handle-level timeout in milliseconds to a deadline.
pub(crate) fn deadline(timeout_ms: u32) -> Option<std::time::Instant> {
    (timeout_ms > 0)
        .then(|| std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64))
}
