//! Hardware transport backed by the `serialport` crate.
//!
//! Port, configuration and event-set records live in token-indexed tables.
//! An open port owns its `Box<dyn serialport::SerialPort>` behind its own
//! mutex, so a blocking read on one port never stalls calls on another.
//!
//! The `serialport` crate models flow control as a single none/software/
//! hardware switch. Pin modes are mapped onto it: RTS and CTS both in
//! flow-control mode select hardware flow control, Xon/Xoff in both
//! directions selects software flow control. DTR/DSR flow control,
//! one-directional Xon/Xoff and mark/space parity have no equivalent and
//! report `Supp`.

use super::{
    deadline, ConfigToken, EventSetToken, LastError, LineSettings, LockExt, PortToken,
    RawResult, ReturnCode, Setting, SettingKind, Slots, Transport,
};
use crate::debug;
use crate::types::{
    Buffer, Cts, Dsr, Dtr, EventMask, FlowControl, Mode, Parity, Rts, Signals, TransportKind,
    XonXoff,
};
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType, UsbPortInfo};
use std::cell::RefCell;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wait inside an unbounded blocking call.
const UNBOUNDED_SLICE: Duration = Duration::from_secs(1);

/// Poll interval for event-set waits.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Output queue depth below which a port counts as write-ready.
const TX_READY_THRESHOLD: u32 = 4096;

thread_local! {
    static LAST_ERROR: RefCell<LastError> = RefCell::new(LastError::default());
}

fn fail(message: impl Into<String>, code: i32) -> ReturnCode {
    let message = message.into();
    debug::emit(&message);
    LAST_ERROR.with(|last| *last.borrow_mut() = LastError { message, code });
    ReturnCode::Fail
}

fn fail_io(context: &str, err: io::Error) -> ReturnCode {
    let code = err.raw_os_error().unwrap_or(0);
    fail(format!("{context}: {err}"), code)
}

fn fail_serial(context: &str, err: serialport::Error) -> ReturnCode {
    match err.kind() {
        serialport::ErrorKind::InvalidInput => {
            debug::emit(&format!("{context}: {err}"));
            ReturnCode::Arg
        }
        serialport::ErrorKind::NoDevice => fail(format!("{context}: {err}"), 19),
        _ => fail(format!("{context}: {err}"), 0),
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Identity captured when a record is created.
#[derive(Debug, Clone)]
struct PortIdentity {
    name: String,
    description: String,
    transport: TransportKind,
    usb: Option<UsbPortInfo>,
}

impl PortIdentity {
    fn from_info(info: SerialPortInfo) -> Self {
        let (transport, description, usb) = match info.port_type {
            SerialPortType::UsbPort(usb) => (
                TransportKind::Usb,
                usb.product
                    .clone()
                    .unwrap_or_else(|| "USB serial port".to_string()),
                Some(usb),
            ),
            SerialPortType::BluetoothPort => (
                TransportKind::Bluetooth,
                "Bluetooth serial port".to_string(),
                None,
            ),
            SerialPortType::PciPort => (TransportKind::Native, "PCI serial port".to_string(), None),
            SerialPortType::Unknown => {
                (TransportKind::Native, "Native serial port".to_string(), None)
            }
        };
        Self {
            name: info.port_name,
            description,
            transport,
            usb,
        }
    }

    fn usb(&self) -> RawResult<&UsbPortInfo> {
        match &self.usb {
            Some(usb) => Ok(usb),
            None => Err(fail(format!("{} is not a USB device", self.name), 0)),
        }
    }
}

struct OpenDevice {
    port: Box<dyn SerialPort>,
    mode: Mode,
    /// Pin and Xon/Xoff modes; the driver cannot read these back.
    settings: LineSettings,
}

impl OpenDevice {
    fn apply(&mut self, setting: Setting) -> RawResult<()> {
        self.apply_all(&[setting])
    }

    /// Apply several fields, choosing the flow control mode once at the end.
    ///
    /// Fields written before a failure stay written.
    fn apply_all(&mut self, settings: &[Setting]) -> RawResult<()> {
        let (next, flow) = stage(self.settings, settings)?;
        for &setting in settings {
            self.write_line(setting)?;
            if !affects_flow(setting.kind()) {
                self.settings.set(setting);
            }
        }
        if let Some(flow) = flow {
            self.port
                .set_flow_control(flow)
                .map_err(|e| fail_serial("set flow control", e))?;
        }
        self.settings = next;
        Ok(())
    }

    /// Push the part of a setting that is not flow control to the device.
    fn write_line(&mut self, setting: Setting) -> RawResult<()> {
        let port = &mut self.port;
        match setting {
            Setting::Baudrate(rate) => port
                .set_baud_rate(rate)
                .map_err(|e| fail_serial("set baud rate", e)),
            Setting::Bits(bits) => port
                .set_data_bits(data_bits(bits)?)
                .map_err(|e| fail_serial("set data bits", e)),
            Setting::Parity(parity) => port
                .set_parity(to_serial_parity(parity)?)
                .map_err(|e| fail_serial("set parity", e)),
            Setting::StopBits(bits) => port
                .set_stop_bits(stop_bits(bits)?)
                .map_err(|e| fail_serial("set stop bits", e)),
            Setting::Rts(rts @ (Rts::On | Rts::Off)) => port
                .write_request_to_send(rts == Rts::On)
                .map_err(|e| fail_serial("set RTS", e)),
            Setting::Dtr(dtr @ (Dtr::On | Dtr::Off)) => port
                .write_data_terminal_ready(dtr == Dtr::On)
                .map_err(|e| fail_serial("set DTR", e)),
            Setting::Rts(Rts::FlowControl)
            | Setting::Cts(_)
            | Setting::Dtr(Dtr::FlowControl)
            | Setting::Dsr(_)
            | Setting::XonXoff(_) => Ok(()),
        }
    }

    /// Refuse a transfer the port was not opened for.
    fn require(&self, writing: bool) -> RawResult<()> {
        let (allowed, direction) = if writing {
            (self.mode.writable(), "writing")
        } else {
            (self.mode.readable(), "reading")
        };
        if allowed {
            Ok(())
        } else {
            Err(fail(format!("port not opened for {direction}"), 9))
        }
    }

    /// Read back one parameter, preferring what the device reports.
    fn read_setting(&self, kind: SettingKind) -> RawResult<Option<Setting>> {
        let port = &self.port;
        let setting = match kind {
            SettingKind::Baudrate => Setting::Baudrate(
                port.baud_rate().map_err(|e| fail_serial("read baud rate", e))?,
            ),
            SettingKind::Bits => Setting::Bits(
                match port.data_bits().map_err(|e| fail_serial("read data bits", e))? {
                    serialport::DataBits::Five => 5,
                    serialport::DataBits::Six => 6,
                    serialport::DataBits::Seven => 7,
                    serialport::DataBits::Eight => 8,
                },
            ),
            SettingKind::Parity => Setting::Parity(
                match port.parity().map_err(|e| fail_serial("read parity", e))? {
                    serialport::Parity::None => Parity::None,
                    serialport::Parity::Odd => Parity::Odd,
                    serialport::Parity::Even => Parity::Even,
                },
            ),
            SettingKind::StopBits => Setting::StopBits(
                match port.stop_bits().map_err(|e| fail_serial("read stop bits", e))? {
                    serialport::StopBits::One => 1,
                    serialport::StopBits::Two => 2,
                },
            ),
            other => return Ok(self.settings.get(other)),
        };
        Ok(Some(setting))
    }

    fn timed<T>(
        &mut self,
        deadline: Option<Instant>,
        mut step: impl FnMut(&mut dyn SerialPort) -> io::Result<T>,
    ) -> RawResult<Option<T>> {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                deadline - now
            }
            None => UNBOUNDED_SLICE,
        };
        self.port
            .set_timeout(slice)
            .map_err(|e| fail_serial("set timeout", e))?;
        loop {
            match step(self.port.as_mut()) {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(fail_io("serial I/O", e)),
            }
        }
    }
}

fn data_bits(bits: u8) -> RawResult<serialport::DataBits> {
    Ok(match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        _ => return Err(ReturnCode::Arg),
    })
}

fn stop_bits(bits: u8) -> RawResult<serialport::StopBits> {
    Ok(match bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        _ => return Err(ReturnCode::Arg),
    })
}

fn to_serial_parity(parity: Parity) -> RawResult<serialport::Parity> {
    Ok(match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
        Parity::Mark | Parity::Space => return Err(ReturnCode::Supp),
    })
}

fn flow_control(settings: &LineSettings) -> RawResult<serialport::FlowControl> {
    let hardware = settings.rts == Some(Rts::FlowControl) && settings.cts == Some(Cts::FlowControl);
    let software = settings.xon_xoff == Some(XonXoff::InOut);
    match (hardware, software) {
        (true, true) => Err(ReturnCode::Supp),
        (true, false) => Ok(serialport::FlowControl::Hardware),
        (false, true) => Ok(serialport::FlowControl::Software),
        (false, false) => Ok(serialport::FlowControl::None),
    }
}

fn affects_flow(kind: SettingKind) -> bool {
    matches!(kind, SettingKind::Rts | SettingKind::Cts | SettingKind::XonXoff)
}

/// Validate `settings` against `current` and work out the resulting state.
///
/// Returns the merged settings and, if any flow-related field is among them,
/// the single flow control mode to program afterwards. Nothing touches the
/// device, so unsupported combinations are refused before any write.
fn stage(
    current: LineSettings,
    settings: &[Setting],
) -> RawResult<(LineSettings, Option<serialport::FlowControl>)> {
    let mut next = current;
    for &setting in settings {
        setting.validate()?;
        match setting {
            Setting::Parity(parity) => {
                to_serial_parity(parity)?;
            }
            Setting::Dtr(Dtr::FlowControl)
            | Setting::Dsr(Dsr::FlowControl)
            | Setting::XonXoff(XonXoff::In | XonXoff::Out) => return Err(ReturnCode::Supp),
            _ => {}
        }
        next.set(setting);
    }
    let flow = if settings.iter().any(|s| affects_flow(s.kind())) {
        Some(flow_control(&next)?)
    } else {
        None
    };
    Ok((next, flow))
}

struct NativePort {
    identity: PortIdentity,
    device: Option<Arc<Mutex<OpenDevice>>>,
}

#[derive(Default)]
struct Tables {
    ports: Slots<NativePort>,
    configs: Slots<LineSettings>,
    event_sets: Slots<Vec<(PortToken, EventMask)>>,
}

/// Driver for real serial hardware.
#[derive(Default)]
pub struct SerialportTransport {
    tables: Mutex<Tables>,
}

impl SerialportTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(&self, port: PortToken) -> RawResult<PortIdentity> {
        self.tables
            .locked()
            .ports
            .get(port.0)
            .map(|p| p.identity.clone())
            .ok_or(ReturnCode::Arg)
    }

    fn device(&self, port: PortToken) -> RawResult<Arc<Mutex<OpenDevice>>> {
        let tables = self.tables.locked();
        let record = tables.ports.get(port.0).ok_or(ReturnCode::Arg)?;
        match &record.device {
            Some(device) => Ok(Arc::clone(device)),
            None => Err(fail(format!("{} is not open", record.identity.name), 9)),
        }
    }

    fn insert_port(&self, identity: PortIdentity) -> PortToken {
        PortToken(self.tables.locked().ports.insert(NativePort {
            identity,
            device: None,
        }))
    }

    fn enumerate() -> RawResult<Vec<SerialPortInfo>> {
        serialport::available_ports().map_err(|e| fail_serial("enumerate ports", e))
    }

    fn is_ready(&self, port: PortToken, mask: EventMask) -> RawResult<bool> {
        let device = self.device(port)?;
        let device = device.locked();
        let input = device.port.bytes_to_read();
        let output = device.port.bytes_to_write();
        if mask.contains(EventMask::ERROR) && (input.is_err() || output.is_err()) {
            return Ok(true);
        }
        if mask.contains(EventMask::RX_READY) && matches!(input, Ok(n) if n > 0) {
            return Ok(true);
        }
        if mask.contains(EventMask::TX_READY) && matches!(output, Ok(n) if n < TX_READY_THRESHOLD)
        {
            return Ok(true);
        }
        Ok(false)
    }
}

impl std::fmt::Debug for SerialportTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.locked();
        f.debug_struct("SerialportTransport")
            .field("ports", &tables.ports.len())
            .field("configs", &tables.configs.len())
            .field("event_sets", &tables.event_sets.len())
            .finish()
    }
}

impl Transport for SerialportTransport {
    fn list_ports(&self) -> RawResult<Vec<PortToken>> {
        let infos = Self::enumerate()?;
        debug::emit(&format!("enumerated {} serial ports", infos.len()));
        Ok(infos
            .into_iter()
            .map(|info| self.insert_port(PortIdentity::from_info(info)))
            .collect())
    }

    fn free_port_list(&self, list: Vec<PortToken>) {
        let mut tables = self.tables.locked();
        for port in list {
            tables.ports.remove(port.0);
        }
    }

    fn copy_port(&self, port: PortToken) -> RawResult<PortToken> {
        let identity = self.identity(port)?;
        Ok(self.insert_port(identity))
    }

    fn get_port_by_name(&self, name: &str) -> RawResult<PortToken> {
        let found = Self::enumerate()?
            .into_iter()
            .find(|info| info.port_name == name);
        let identity = match found {
            Some(info) => PortIdentity::from_info(info),
            // Pseudo-terminals and other unlisted device nodes.
            None if cfg!(unix) && std::path::Path::new(name).exists() => PortIdentity {
                name: name.to_string(),
                description: "Native serial port".to_string(),
                transport: TransportKind::Native,
                usb: None,
            },
            None => {
                debug::emit(&format!("no serial port named {name}"));
                return Err(ReturnCode::Arg);
            }
        };
        Ok(self.insert_port(identity))
    }

    fn free_port(&self, port: PortToken) {
        let removed = self.tables.locked().ports.remove(port.0);
        if removed.is_none() {
            debug::emit(&format!("free of unknown port record {}", port.0));
        }
    }

    fn port_name(&self, port: PortToken) -> RawResult<String> {
        Ok(self.identity(port)?.name)
    }

    fn port_description(&self, port: PortToken) -> RawResult<String> {
        Ok(self.identity(port)?.description)
    }

    fn port_transport(&self, port: PortToken) -> RawResult<TransportKind> {
        Ok(self.identity(port)?.transport)
    }

    fn port_usb_bus_address(&self, port: PortToken) -> RawResult<(u32, u32)> {
        self.identity(port)?.usb()?;
        Err(ReturnCode::Supp)
    }

    fn port_usb_vid_pid(&self, port: PortToken) -> RawResult<(u16, u16)> {
        let identity = self.identity(port)?;
        let usb = identity.usb()?;
        Ok((usb.vid, usb.pid))
    }

    fn port_usb_manufacturer(&self, port: PortToken) -> RawResult<String> {
        let identity = self.identity(port)?;
        identity
            .usb()?
            .manufacturer
            .clone()
            .ok_or_else(|| fail("USB manufacturer not available", 0))
    }

    fn port_usb_product(&self, port: PortToken) -> RawResult<String> {
        let identity = self.identity(port)?;
        identity
            .usb()?
            .product
            .clone()
            .ok_or_else(|| fail("USB product not available", 0))
    }

    fn port_usb_serial(&self, port: PortToken) -> RawResult<String> {
        let identity = self.identity(port)?;
        identity
            .usb()?
            .serial_number
            .clone()
            .ok_or_else(|| fail("USB serial number not available", 0))
    }

    fn port_bluetooth_address(&self, port: PortToken) -> RawResult<String> {
        let identity = self.identity(port)?;
        if identity.transport != TransportKind::Bluetooth {
            return Err(fail(format!("{} is not a Bluetooth device", identity.name), 0));
        }
        Err(ReturnCode::Supp)
    }

    fn open(&self, port: PortToken, mode: Mode) -> RawResult<()> {
        let name = {
            let tables = self.tables.locked();
            let record = tables.ports.get(port.0).ok_or(ReturnCode::Arg)?;
            if record.device.is_some() {
                return Err(fail(format!("{} is already open", record.identity.name), 16));
            }
            record.identity.name.clone()
        };

        debug::emit(&format!("opening {name} ({mode:?})"));
        let defaults = LineSettings::port_defaults();
        let handle = serialport::new(&name, defaults.baudrate.unwrap_or(9600))
            .timeout(UNBOUNDED_SLICE)
            .open()
            .map_err(|e| fail_serial(&format!("open {name}"), e))?;
        let device = OpenDevice {
            port: handle,
            mode,
            settings: defaults,
        };

        let mut tables = self.tables.locked();
        let record = tables.ports.get_mut(port.0).ok_or(ReturnCode::Arg)?;
        if record.device.is_some() {
            return Err(fail(format!("{name} is already open"), 16));
        }
        record.device = Some(Arc::new(Mutex::new(device)));
        Ok(())
    }

    fn close(&self, port: PortToken) -> RawResult<()> {
        let (name, device) = {
            let mut tables = self.tables.locked();
            let record = tables.ports.get_mut(port.0).ok_or(ReturnCode::Arg)?;
            (record.identity.name.clone(), record.device.take())
        };
        match device {
            Some(device) => {
                debug::emit(&format!("closing {name} ({:?})", device.locked().mode));
                Ok(())
            }
            None => Err(fail(format!("{name} is not open"), 9)),
        }
    }

    fn new_config(&self) -> RawResult<ConfigToken> {
        Ok(ConfigToken(
            self.tables.locked().configs.insert(LineSettings::default()),
        ))
    }

    fn free_config(&self, config: ConfigToken) {
        self.tables.locked().configs.remove(config.0);
    }

    fn get_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()> {
        let device = self.device(port)?;
        if self.tables.locked().configs.get(config.0).is_none() {
            return Err(ReturnCode::Arg);
        }
        let mut live = LineSettings::default();
        let outcome = {
            let device = device.locked();
            SettingKind::ALL.into_iter().try_for_each(|kind| {
                if let Some(setting) = device.read_setting(kind)? {
                    live.set(setting);
                }
                Ok::<_, ReturnCode>(())
            })
        };
        // Fields read before a failure are still stored.
        if let Some(record) = self.tables.locked().configs.get_mut(config.0) {
            for setting in live.iter_set() {
                record.set(setting);
            }
        }
        outcome
    }

    fn set_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()> {
        let device = self.device(port)?;
        let settings: Vec<Setting> = self
            .tables
            .locked()
            .configs
            .get(config.0)
            .ok_or(ReturnCode::Arg)?
            .iter_set()
            .collect();
        let result = device.locked().apply_all(&settings);
        result
    }

    fn get_config_setting(&self, config: ConfigToken, kind: SettingKind) -> RawResult<Setting> {
        let tables = self.tables.locked();
        let settings = tables.configs.get(config.0).ok_or(ReturnCode::Arg)?;
        settings
            .get(kind)
            .ok_or_else(|| fail(format!("{} not set in configuration", kind.name()), 0))
    }

    fn set_config_setting(&self, config: ConfigToken, setting: Setting) -> RawResult<()> {
        setting.validate()?;
        self.tables
            .locked()
            .configs
            .get_mut(config.0)
            .ok_or(ReturnCode::Arg)?
            .set(setting);
        Ok(())
    }

    fn set_config_flowcontrol(
        &self,
        config: ConfigToken,
        flowcontrol: FlowControl,
    ) -> RawResult<()> {
        self.tables
            .locked()
            .configs
            .get_mut(config.0)
            .ok_or(ReturnCode::Arg)?
            .set_flowcontrol(flowcontrol);
        Ok(())
    }

    fn set_setting(&self, port: PortToken, setting: Setting) -> RawResult<()> {
        self.device(port)?.locked().apply(setting)
    }

    fn set_flowcontrol(&self, port: PortToken, flowcontrol: FlowControl) -> RawResult<()> {
        let device = self.device(port)?;
        let mut device = device.locked();
        let mut settings = device.settings;
        settings.set_flowcontrol(flowcontrol);
        let pins: Vec<Setting> = [
            SettingKind::Rts,
            SettingKind::Cts,
            SettingKind::Dtr,
            SettingKind::Dsr,
            SettingKind::XonXoff,
        ]
        .into_iter()
        .filter_map(|kind| settings.get(kind))
        .collect();
        device.apply_all(&pins)
    }

    fn blocking_read(&self, port: PortToken, buf: &mut [u8], timeout_ms: u32) -> RawResult<usize> {
        let device = self.device(port)?;
        let mut device = device.locked();
        device.require(false)?;
        let deadline = deadline(timeout_ms);
        let mut done = 0;
        while done < buf.len() {
            let target = &mut buf[done..];
            match device.timed(deadline, |port| port.read(target))? {
                Some(n) => done += n,
                None if deadline.is_some() => break,
                None => {}
            }
        }
        Ok(done)
    }

    fn nonblocking_read(&self, port: PortToken, buf: &mut [u8]) -> RawResult<usize> {
        let device = self.device(port)?;
        let mut device = device.locked();
        device.require(false)?;
        let available = device
            .port
            .bytes_to_read()
            .map_err(|e| fail_serial("query input buffer", e))? as usize;
        let count = available.min(buf.len());
        if count == 0 {
            return Ok(0);
        }
        let target = &mut buf[..count];
        Ok(device
            .timed(Some(Instant::now() + Duration::from_millis(1)), |port| {
                port.read(target)
            })?
            .unwrap_or(0))
    }

    fn blocking_write(&self, port: PortToken, buf: &[u8], timeout_ms: u32) -> RawResult<usize> {
        let device = self.device(port)?;
        let mut device = device.locked();
        device.require(true)?;
        let deadline = deadline(timeout_ms);
        let mut done = 0;
        while done < buf.len() {
            let source = &buf[done..];
            match device.timed(deadline, |port| port.write(source))? {
                Some(n) => done += n,
                None if deadline.is_some() => break,
                None => {}
            }
        }
        Ok(done)
    }

    fn nonblocking_write(&self, port: PortToken, buf: &[u8]) -> RawResult<usize> {
        let device = self.device(port)?;
        let mut device = device.locked();
        device.require(true)?;
        Ok(device
            .timed(Some(Instant::now() + Duration::from_millis(1)), |port| {
                port.write(buf)
            })?
            .unwrap_or(0))
    }

    fn input_waiting(&self, port: PortToken) -> RawResult<usize> {
        let device = self.device(port)?;
        let count = device
            .locked()
            .port
            .bytes_to_read()
            .map_err(|e| fail_serial("query input buffer", e))?;
        Ok(count as usize)
    }

    fn output_waiting(&self, port: PortToken) -> RawResult<usize> {
        let device = self.device(port)?;
        let count = device
            .locked()
            .port
            .bytes_to_write()
            .map_err(|e| fail_serial("query output buffer", e))?;
        Ok(count as usize)
    }

    fn flush(&self, port: PortToken, buffer: Buffer) -> RawResult<()> {
        let which = match buffer {
            Buffer::Input => ClearBuffer::Input,
            Buffer::Output => ClearBuffer::Output,
            Buffer::Both => ClearBuffer::All,
        };
        self.device(port)?
            .locked()
            .port
            .clear(which)
            .map_err(|e| fail_serial("flush buffers", e))
    }

    fn drain(&self, port: PortToken) -> RawResult<()> {
        self.device(port)?
            .locked()
            .port
            .flush()
            .map_err(|e| fail_io("drain output", e))
    }

    fn signals(&self, port: PortToken) -> RawResult<Signals> {
        let device = self.device(port)?;
        let mut device = device.locked();
        let port = &mut device.port;
        let mut signals = Signals::empty();
        let lines = [
            (Signals::CTS, port.read_clear_to_send()),
            (Signals::DSR, port.read_data_set_ready()),
            (Signals::DCD, port.read_carrier_detect()),
            (Signals::RI, port.read_ring_indicator()),
        ];
        for (flag, state) in lines {
            if state.map_err(|e| fail_serial("read modem signals", e))? {
                signals.insert(flag);
            }
        }
        Ok(signals)
    }

    fn start_break(&self, port: PortToken) -> RawResult<()> {
        self.device(port)?
            .locked()
            .port
            .set_break()
            .map_err(|e| fail_serial("start break", e))
    }

    fn end_break(&self, port: PortToken) -> RawResult<()> {
        self.device(port)?
            .locked()
            .port
            .clear_break()
            .map_err(|e| fail_serial("end break", e))
    }

    fn new_event_set(&self) -> RawResult<EventSetToken> {
        Ok(EventSetToken(self.tables.locked().event_sets.insert(Vec::new())))
    }

    fn free_event_set(&self, set: EventSetToken) {
        self.tables.locked().event_sets.remove(set.0);
    }

    fn add_port_events(
        &self,
        set: EventSetToken,
        port: PortToken,
        mask: EventMask,
    ) -> RawResult<()> {
        self.device(port)?;
        self.tables
            .locked()
            .event_sets
            .get_mut(set.0)
            .ok_or(ReturnCode::Arg)?
            .push((port, mask));
        Ok(())
    }

    fn wait(&self, set: EventSetToken, timeout_ms: u32) -> RawResult<()> {
        let registrations = self
            .tables
            .locked()
            .event_sets
            .get(set.0)
            .cloned()
            .ok_or(ReturnCode::Arg)?;
        let deadline = deadline(timeout_ms);
        loop {
            for &(port, mask) in &registrations {
                if self.is_ready(port, mask)? {
                    return Ok(());
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(());
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn last_error(&self) -> LastError {
        LAST_ERROR.with(|last| last.borrow().clone())
    }
}
