//! Owned handles over transport records.
//!
//! [`Port`], [`Configuration`] and [`EventSet`] each wrap one native record.
//! Clones share the record, and it is freed exactly once when the last clone
//! drops. Every transport call goes through [`crate::error::check`], so a
//! negative return code always surfaces as a typed [`Error`].

/// Generate single-field setters that forward a [`Setting`] to `self.apply`.
macro_rules! setting_setters {
    ($( $(#[$doc:meta])* $name:ident => $variant:ident($ty:ty) ),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, value: $ty) -> Result<()> {
                self.apply(stringify!($name), Setting::$variant(value))
            }
        )*
    };
}

mod configuration;
mod event_set;

pub use configuration::Configuration;
pub use event_set::EventSet;

use crate::error::{check, Error, Result};
use crate::transport::{self, PortToken, RawResult, Setting, SharedTransport, Transport};
use crate::types::{Buffer, Cts, Dsr, Dtr, FlowControl, Mode, Parity, Rts, Signals, TransportKind, XonXoff};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Convert a handle-level timeout to the transport's milliseconds.
///
/// `Duration::ZERO` means no limit. Sub-millisecond timeouts round up to one
/// millisecond so they never turn into an unbounded wait.
pub(crate) fn timeout_ms(timeout: Duration) -> u32 {
    if timeout.is_zero() {
        return 0;
    }
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

/// Whether two handles were produced by the same driver instance.
pub(crate) fn same_transport(a: &SharedTransport, b: &SharedTransport) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct PortInner {
    transport: SharedTransport,
    token: PortToken,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        trace!("Releasing port record {}", self.token.0);
        self.transport.free_port(self.token);
    }
}

/// A serial port known to a transport.
///
/// Identity (name, description, USB and Bluetooth details) is fixed when the
/// handle is created. Opening, closing and configuring act on the device.
///
/// # Example
/// ```
/// use spwrap::transport::{MockTransport, mock::MockPort};
/// use spwrap::{Mode, Port};
/// use std::sync::Arc;
///
/// let mock = MockTransport::with_ports([MockPort::native("/dev/ttyS0")]);
/// let port = Port::by_name_with(Arc::new(mock.clone()), "/dev/ttyS0")?;
/// port.open(Mode::ReadWrite)?;
/// port.set_baudrate(115_200)?;
/// assert_eq!(port.config()?.baudrate()?, 115_200);
/// port.close()?;
/// # Ok::<(), spwrap::Error>(())
/// ```
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// Take ownership of a record the transport just allocated.
    fn adopt(transport: SharedTransport, token: PortToken) -> Self {
        trace!("Acquired port record {}", token.0);
        Self {
            inner: Arc::new(PortInner { transport, token }),
        }
    }

    /// Enumerate the ports visible to the hardware driver.
    pub fn list() -> Result<Vec<Port>> {
        Self::list_with(transport::native())
    }

    /// Enumerate the ports visible to `transport`.
    ///
    /// Each returned port is an independent copy that outlives the
    /// enumeration. If any copy fails, the copies made so far and the
    /// enumeration buffer are released before the error is returned.
    pub fn list_with(transport: SharedTransport) -> Result<Vec<Port>> {
        let list = check(&*transport, "list", transport.list_ports())?;

        let mut ports = Vec::with_capacity(list.len());
        let mut failure = None;
        for &token in &list {
            match transport.copy_port(token) {
                Ok(copy) => ports.push(Port::adopt(Arc::clone(&transport), copy)),
                Err(code) => {
                    failure = Some(Error::from_return_code(code, "list", &*transport));
                    break;
                }
            }
        }
        transport.free_port_list(list);

        match failure {
            Some(err) => {
                warn!(
                    "Port enumeration failed after {} copies, releasing them: {}",
                    ports.len(),
                    err
                );
                drop(ports);
                Err(err)
            }
            None => {
                debug!("Enumerated {} serial ports", ports.len());
                Ok(ports)
            }
        }
    }

    /// Look up a port by device name through the hardware driver.
    pub fn by_name(name: &str) -> Result<Port> {
        Self::by_name_with(transport::native(), name)
    }

    /// Look up a port by device name. Unknown names are an invalid argument.
    pub fn by_name_with(transport: SharedTransport, name: &str) -> Result<Port> {
        let token = check(&*transport, "by_name", transport.get_port_by_name(name))?;
        Ok(Port::adopt(transport, token))
    }

    /// The driver this port belongs to.
    pub fn driver(&self) -> &SharedTransport {
        &self.inner.transport
    }

    pub(crate) fn token(&self) -> PortToken {
        self.inner.token
    }

    fn call<T>(
        &self,
        function: &'static str,
        op: impl FnOnce(&dyn Transport, PortToken) -> RawResult<T>,
    ) -> Result<T> {
        let transport = &*self.inner.transport;
        check(transport, function, op(transport, self.inner.token))
    }

    fn apply(&self, function: &'static str, setting: Setting) -> Result<()> {
        setting
            .validate()
            .map_err(|_| Error::invalid_argument(function))?;
        self.call(function, |t, port| t.set_setting(port, setting))
    }

    pub fn name(&self) -> Result<String> {
        self.call("name", |t, port| t.port_name(port))
    }

    pub fn description(&self) -> Result<String> {
        self.call("description", |t, port| t.port_description(port))
    }

    /// How the port is attached: native UART, USB or Bluetooth.
    pub fn transport(&self) -> Result<TransportKind> {
        self.call("transport", |t, port| t.port_transport(port))
    }

    /// USB bus number and device address.
    pub fn usb_bus_address(&self) -> Result<(u32, u32)> {
        self.call("usb_bus_address", |t, port| t.port_usb_bus_address(port))
    }

    /// USB vendor and product IDs.
    pub fn usb_vid_pid(&self) -> Result<(u16, u16)> {
        self.call("usb_vid_pid", |t, port| t.port_usb_vid_pid(port))
    }

    pub fn usb_manufacturer(&self) -> Result<String> {
        self.call("usb_manufacturer", |t, port| t.port_usb_manufacturer(port))
    }

    pub fn usb_product(&self) -> Result<String> {
        self.call("usb_product", |t, port| t.port_usb_product(port))
    }

    pub fn usb_serial(&self) -> Result<String> {
        self.call("usb_serial", |t, port| t.port_usb_serial(port))
    }

    /// Bluetooth MAC address.
    pub fn bluetooth_address(&self) -> Result<String> {
        self.call("bluetooth_address", |t, port| t.port_bluetooth_address(port))
    }

    /// Open the device. Opening an already open port fails.
    pub fn open(&self, mode: Mode) -> Result<()> {
        self.call("open", |t, port| t.open(port, mode))?;
        debug!("Opened port record {} ({:?})", self.inner.token.0, mode);
        Ok(())
    }

    /// Close the device. Closing a port that is not open fails.
    pub fn close(&self) -> Result<()> {
        self.call("close", |t, port| t.close(port))?;
        debug!("Closed port record {}", self.inner.token.0);
        Ok(())
    }

    /// Snapshot the live line settings into a new [`Configuration`].
    ///
    /// If reading the settings fails, the new configuration record is
    /// released before the error is returned.
    pub fn config(&self) -> Result<Configuration> {
        let config = Configuration::create_with(Arc::clone(&self.inner.transport))?;
        if let Err(err) = self.call("config", |t, port| t.get_config(port, config.token())) {
            debug!("Discarding partial configuration snapshot: {}", err);
            return Err(err);
        }
        Ok(config)
    }

    /// Apply every set field of `config`, in field order.
    ///
    /// There is no rollback: fields applied before a failure stay applied.
    pub fn set_config(&self, config: &Configuration) -> Result<()> {
        if !same_transport(&self.inner.transport, config.driver()) {
            return Err(Error::invalid_argument("set_config"));
        }
        self.call("set_config", |t, port| t.set_config(port, config.token()))
    }

    setting_setters! {
        set_baudrate => Baudrate(u32),
        /// Data bits per character, 5 to 8.
        set_bits => Bits(u8),
        set_parity => Parity(Parity),
        /// Stop bits, 1 or 2.
        set_stopbits => StopBits(u8),
        set_rts => Rts(Rts),
        set_cts => Cts(Cts),
        set_dtr => Dtr(Dtr),
        set_dsr => Dsr(Dsr),
        set_xon_xoff => XonXoff(XonXoff),
    }

    /// Switch pin and Xon/Xoff modes to a flow control preset.
    pub fn set_flowcontrol(&self, flowcontrol: FlowControl) -> Result<()> {
        self.call("set_flowcontrol", |t, port| t.set_flowcontrol(port, flowcontrol))
    }

    /// Read until `buf` is full or `timeout` elapses (`Duration::ZERO` waits
    /// indefinitely). Returns the number of bytes read; a short count on
    /// timeout is not an error.
    pub fn blocking_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let timeout = timeout_ms(timeout);
        self.call("blocking_read", |t, port| t.blocking_read(port, buf, timeout))
    }

    /// Read whatever is buffered, without waiting.
    pub fn nonblocking_read(&self, buf: &mut [u8]) -> Result<usize> {
        self.call("nonblocking_read", |t, port| t.nonblocking_read(port, buf))
    }

    /// Write until all of `buf` is queued or `timeout` elapses
    /// (`Duration::ZERO` waits indefinitely). Returns the number of bytes
    /// queued.
    pub fn blocking_write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let timeout = timeout_ms(timeout);
        self.call("blocking_write", |t, port| t.blocking_write(port, buf, timeout))
    }

    /// Queue as much of `buf` as fits, without waiting.
    pub fn nonblocking_write(&self, buf: &[u8]) -> Result<usize> {
        self.call("nonblocking_write", |t, port| t.nonblocking_write(port, buf))
    }

    /// Bytes received and not yet read.
    pub fn input_waiting(&self) -> Result<usize> {
        self.call("input_waiting", |t, port| t.input_waiting(port))
    }

    /// Bytes queued and not yet transmitted.
    pub fn output_waiting(&self) -> Result<usize> {
        self.call("output_waiting", |t, port| t.output_waiting(port))
    }

    /// Discard buffered data.
    pub fn flush(&self, buffer: Buffer) -> Result<()> {
        self.call("flush", |t, port| t.flush(port, buffer))
    }

    /// Wait until all queued output has been transmitted.
    pub fn drain(&self) -> Result<()> {
        self.call("drain", |t, port| t.drain(port))
    }

    /// Current state of the modem input lines.
    pub fn signals(&self) -> Result<Signals> {
        self.call("signals", |t, port| t.signals(port))
    }

    pub fn start_break(&self) -> Result<()> {
        self.call("start_break", |t, port| t.start_break(port))
    }

    pub fn end_break(&self) -> Result<()> {
        self.call("end_break", |t, port| t.end_break(port))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("token", &self.inner.token.0)
            .field("name", &self.name().ok())
            .finish()
    }
}
