//! In-memory transport for testing.
//!
//! `MockTransport` simulates a set of serial devices without hardware. It
//! counts every native allocation and release so tests can prove the handle
//! layer frees each record exactly once, and it can inject failures into
//! enumeration, allocation, configuration reads and configuration writes.
//!
//! Blocking calls really block: `blocking_read` waits on a condition variable
//! until [`MockTransport::feed`] supplies enough bytes or the timeout expires,
//! and `wait` on an event set sleeps until a registered port becomes ready.

use super::{
    deadline, ConfigToken, EventSetToken, LastError, LineSettings, LockExt, PortToken,
    RawResult, ReturnCode, Setting, SettingKind, Slots, Transport,
};
use crate::debug;
use crate::types::{Buffer, EventMask, FlowControl, Mode, Signals, TransportKind};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

const EIO: i32 = 5;
const EBADF: i32 = 9;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ENOTTY: i32 = 25;

/// Default size of a simulated output buffer.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 4096;

/// Description of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPort {
    pub name: String,
    pub description: String,
    pub transport: TransportKind,
    pub usb_bus_address: Option<(u32, u32)>,
    pub usb_vid_pid: Option<(u16, u16)>,
    pub usb_manufacturer: Option<String>,
    pub usb_product: Option<String>,
    pub usb_serial: Option<String>,
    pub bluetooth_address: Option<String>,
}

impl MockPort {
    /// A motherboard UART.
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "Native serial port".to_string(),
            transport: TransportKind::Native,
            usb_bus_address: None,
            usb_vid_pid: None,
            usb_manufacturer: None,
            usb_product: None,
            usb_serial: None,
            bluetooth_address: None,
        }
    }

    /// A USB serial adapter.
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            description: "USB serial adapter".to_string(),
            transport: TransportKind::Usb,
            usb_vid_pid: Some((vid, pid)),
            ..Self::native(name)
        }
    }

    /// A Bluetooth RFCOMM port.
    pub fn bluetooth(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            description: "Bluetooth serial port".to_string(),
            transport: TransportKind::Bluetooth,
            bluetooth_address: Some(address.into()),
            ..Self::native(name)
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn bus_address(mut self, bus: u32, address: u32) -> Self {
        self.usb_bus_address = Some((bus, address));
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.usb_manufacturer = Some(manufacturer.into());
        self
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.usb_product = Some(product.into());
        self
    }

    pub fn serial_number(mut self, serial: impl Into<String>) -> Self {
        self.usb_serial = Some(serial.into());
        self
    }
}

/// A one-shot failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `list_ports` returns this code.
    ListPorts(ReturnCode),
    /// `copy_port` succeeds `after` more times, then returns `code`.
    CopyPort { after: usize, code: ReturnCode },
    /// `new_config` returns this code.
    NewConfig(ReturnCode),
    /// `new_event_set` returns this code.
    NewEventSet(ReturnCode),
}

/// Allocation and release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub ports_allocated: usize,
    pub ports_freed: usize,
    pub lists_allocated: usize,
    pub lists_freed: usize,
    pub configs_allocated: usize,
    pub configs_freed: usize,
    pub event_sets_allocated: usize,
    pub event_sets_freed: usize,
    /// Frees of tokens that were never allocated or already released.
    pub invalid_frees: usize,
}

impl AllocationStats {
    pub fn live_ports(&self) -> usize {
        self.ports_allocated - self.ports_freed
    }

    pub fn live_configs(&self) -> usize {
        self.configs_allocated - self.configs_freed
    }

    pub fn live_event_sets(&self) -> usize {
        self.event_sets_allocated - self.event_sets_freed
    }

    pub fn live_lists(&self) -> usize {
        self.lists_allocated - self.lists_freed
    }

    /// Nothing outstanding and nothing freed twice.
    pub fn is_balanced(&self) -> bool {
        self.live_ports() == 0
            && self.live_configs() == 0
            && self.live_event_sets() == 0
            && self.live_lists() == 0
            && self.invalid_frees == 0
    }
}

#[derive(Debug)]
struct Device {
    spec: MockPort,
    in_use: bool,
    connected: bool,
    mode: Option<Mode>,
    settings: LineSettings,
    input: VecDeque<u8>,
    output: VecDeque<u8>,
    output_capacity: usize,
    transmitted: Vec<u8>,
    loopback: bool,
    signals: Signals,
    breaking: bool,
    unreadable: HashSet<SettingKind>,
    rejected: HashMap<SettingKind, ReturnCode>,
}

impl Device {
    fn new(spec: MockPort) -> Self {
        Self {
            spec,
            in_use: false,
            connected: true,
            mode: None,
            settings: LineSettings::port_defaults(),
            input: VecDeque::new(),
            output: VecDeque::new(),
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            transmitted: Vec::new(),
            loopback: false,
            signals: Signals::empty(),
            breaking: false,
            unreadable: HashSet::new(),
            rejected: HashMap::new(),
        }
    }

    fn output_space(&self) -> usize {
        self.output_capacity.saturating_sub(self.output.len())
    }

    fn transmit(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.output.len());
        let sent: Vec<u8> = self.output.drain(..count).collect();
        self.transmitted.extend_from_slice(&sent);
        if self.loopback {
            self.input.extend(sent.iter().copied());
        }
        sent
    }

    fn take_input(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..count)) {
            *slot = byte;
        }
        count
    }

    fn queue_output(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.output_space());
        self.output.extend(data[..count].iter().copied());
        count
    }
}

#[derive(Debug, Clone, Copy)]
struct PortRecord {
    device: usize,
    open: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<Device>,
    records: Slots<PortRecord>,
    configs: Slots<LineSettings>,
    event_sets: Slots<Vec<(PortToken, EventMask)>>,
    stats: AllocationStats,
    faults: Vec<Fault>,
    last_error: LastError,
}

impl MockState {
    fn fail(&mut self, message: impl Into<String>, code: i32) -> ReturnCode {
        let message = message.into();
        debug::emit(&format!("mock transport: {message}"));
        self.last_error = LastError { message, code };
        ReturnCode::Fail
    }

    fn device_index(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.spec.name == name)
    }

    fn device_mut(&mut self, name: &str) -> &mut Device {
        let index = self
            .device_index(name)
            .unwrap_or_else(|| panic!("no mock device named {name}"));
        &mut self.devices[index]
    }

    fn record(&self, port: PortToken) -> RawResult<PortRecord> {
        self.records.get(port.0).copied().ok_or(ReturnCode::Arg)
    }

    fn spec(&self, port: PortToken) -> RawResult<&MockPort> {
        let record = self.record(port)?;
        Ok(&self.devices[record.device].spec)
    }

    fn alloc_port(&mut self, device: usize) -> PortToken {
        self.stats.ports_allocated += 1;
        PortToken(self.records.insert(PortRecord {
            device,
            open: false,
        }))
    }

    fn release_port(&mut self, port: PortToken) {
        match self.records.remove(port.0) {
            Some(record) => {
                self.stats.ports_freed += 1;
                if record.open {
                    let device = &mut self.devices[record.device];
                    device.in_use = false;
                    device.mode = None;
                }
            }
            None => {
                self.stats.invalid_frees += 1;
                debug::emit(&format!("mock transport: free of unknown port {}", port.0));
            }
        }
    }

    /// Index of the device behind an open, connected port record.
    fn open_device(&mut self, port: PortToken) -> RawResult<usize> {
        let record = self.record(port)?;
        if !record.open {
            return Err(self.fail("Port not open", EBADF));
        }
        if !self.devices[record.device].connected {
            return Err(self.fail("Input/output error", EIO));
        }
        Ok(record.device)
    }

    /// Like `open_device`, but also checks the port was opened for this direction.
    fn transfer_device(&mut self, port: PortToken, writing: bool) -> RawResult<usize> {
        let device = self.open_device(port)?;
        let allowed = match self.devices[device].mode {
            Some(mode) if writing => mode.writable(),
            Some(mode) => mode.readable(),
            None => false,
        };
        if !allowed {
            let direction = if writing { "writing" } else { "reading" };
            return Err(self.fail(format!("Port not open for {direction}"), EBADF));
        }
        Ok(device)
    }

    fn apply_setting(&mut self, device: usize, setting: Setting) -> RawResult<()> {
        setting.validate()?;
        if let Some(&code) = self.devices[device].rejected.get(&setting.kind()) {
            return Err(match code {
                ReturnCode::Fail => {
                    self.fail(format!("Device rejected {}", setting.kind().name()), EINVAL)
                }
                other => other,
            });
        }
        self.devices[device].settings.set(setting);
        Ok(())
    }

    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        Some(self.faults.remove(index))
    }

    fn copy_fault(&mut self) -> Option<ReturnCode> {
        let index = self
            .faults
            .iter()
            .position(|f| matches!(f, Fault::CopyPort { .. }))?;
        let Fault::CopyPort { after, code } = self.faults[index] else {
            return None;
        };
        if after == 0 {
            self.faults.remove(index);
            Some(code)
        } else {
            self.faults[index] = Fault::CopyPort {
                after: after - 1,
                code,
            };
            None
        }
    }

    /// Whether any registration is satisfied right now.
    fn any_ready(&mut self, registrations: &[(PortToken, EventMask)]) -> RawResult<bool> {
        for &(port, mask) in registrations {
            let record = self.record(port)?;
            if !record.open {
                return Err(self.fail("Port not open", EBADF));
            }
            let device = &self.devices[record.device];
            if mask.contains(EventMask::ERROR) && !device.connected {
                return Ok(true);
            }
            if mask.contains(EventMask::RX_READY) && !device.input.is_empty() {
                return Ok(true);
            }
            if mask.contains(EventMask::TX_READY) && device.output_space() > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Simulated serial driver.
///
/// Cloning shares the same simulated devices and counters.
///
/// # Example
/// ```
/// use spwrap::transport::{MockTransport, mock::MockPort};
///
/// let transport = MockTransport::with_ports([MockPort::native("/dev/ttyS0")]);
/// transport.feed("/dev/ttyS0", b"hello");
/// assert!(transport.stats().is_balanced());
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    ready: Arc<Condvar>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(ports: impl IntoIterator<Item = MockPort>) -> Self {
        let transport = Self::new();
        for port in ports {
            transport.add_port(port);
        }
        transport
    }

    /// Make a device visible to enumeration and lookup.
    pub fn add_port(&self, port: MockPort) {
        self.state.locked().devices.push(Device::new(port));
    }

    pub fn stats(&self) -> AllocationStats {
        self.state.locked().stats
    }

    pub fn inject(&self, fault: Fault) {
        self.state.locked().faults.push(fault);
    }

    /// Set the message and code reported by the next `last_error` call.
    pub fn set_last_error(&self, message: impl Into<String>, code: i32) {
        self.state.locked().last_error = LastError {
            message: message.into(),
            code,
        };
    }

    /// Deliver bytes to a device's input buffer, waking blocked readers.
    pub fn feed(&self, name: &str, data: &[u8]) {
        self.state
            .locked()
            .device_mut(name)
            .input
            .extend(data.iter().copied());
        self.ready.notify_all();
    }

    /// Move up to `count` bytes from the output buffer onto the wire.
    pub fn transmit(&self, name: &str, count: usize) -> Vec<u8> {
        let sent = self.state.locked().device_mut(name).transmit(count);
        self.ready.notify_all();
        sent
    }

    /// Every byte that has left the output buffer so far.
    pub fn transmitted(&self, name: &str) -> Vec<u8> {
        self.state.locked().device_mut(name).transmitted.clone()
    }

    /// Route transmitted bytes back into the input buffer.
    pub fn set_loopback(&self, name: &str, loopback: bool) {
        self.state.locked().device_mut(name).loopback = loopback;
    }

    pub fn set_output_capacity(&self, name: &str, capacity: usize) {
        self.state.locked().device_mut(name).output_capacity = capacity;
        self.ready.notify_all();
    }

    pub fn set_signals(&self, name: &str, signals: Signals) {
        self.state.locked().device_mut(name).signals = signals;
    }

    /// Simulate unplugging the device: further I/O fails.
    pub fn disconnect(&self, name: &str) {
        self.state.locked().device_mut(name).connected = false;
        self.ready.notify_all();
    }

    /// Make reading `kind` back from the live port fail.
    pub fn set_unreadable(&self, name: &str, kind: SettingKind) {
        self.state.locked().device_mut(name).unreadable.insert(kind);
    }

    /// Make writing `kind` to the live port fail with `code`.
    pub fn reject_setting(&self, name: &str, kind: SettingKind, code: ReturnCode) {
        self.state.locked().device_mut(name).rejected.insert(kind, code);
    }

    /// Live line settings of a device.
    pub fn settings(&self, name: &str) -> LineSettings {
        self.state.locked().device_mut(name).settings
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state.locked().device_mut(name).in_use
    }

    pub fn open_mode(&self, name: &str) -> Option<Mode> {
        self.state.locked().device_mut(name).mode
    }

    pub fn is_breaking(&self, name: &str) -> bool {
        self.state.locked().device_mut(name).breaking
    }

    pub fn pending_input(&self, name: &str) -> usize {
        self.state.locked().device_mut(name).input.len()
    }

    pub fn pending_output(&self, name: &str) -> usize {
        self.state.locked().device_mut(name).output.len()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.locked();
        f.debug_struct("MockTransport")
            .field("devices", &state.devices.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl Transport for MockTransport {
    fn list_ports(&self) -> RawResult<Vec<PortToken>> {
        let mut state = self.state.locked();
        if let Some(Fault::ListPorts(code)) =
            state.take_fault(|f| matches!(f, Fault::ListPorts(_)))
        {
            return Err(match code {
                ReturnCode::Fail => state.fail("Enumeration failed", EIO),
                other => other,
            });
        }
        state.stats.lists_allocated += 1;
        let count = state.devices.len();
        Ok((0..count).map(|device| state.alloc_port(device)).collect())
    }

    fn free_port_list(&self, list: Vec<PortToken>) {
        let mut state = self.state.locked();
        state.stats.lists_freed += 1;
        for port in list {
            state.release_port(port);
        }
    }

    fn copy_port(&self, port: PortToken) -> RawResult<PortToken> {
        let mut state = self.state.locked();
        let record = state.record(port)?;
        if let Some(code) = state.copy_fault() {
            return Err(match code {
                ReturnCode::Fail => state.fail("Port copy failed", EIO),
                other => other,
            });
        }
        Ok(state.alloc_port(record.device))
    }

    fn get_port_by_name(&self, name: &str) -> RawResult<PortToken> {
        let mut state = self.state.locked();
        let device = state.device_index(name).ok_or(ReturnCode::Arg)?;
        Ok(state.alloc_port(device))
    }

    fn free_port(&self, port: PortToken) {
        self.state.locked().release_port(port);
    }

    fn port_name(&self, port: PortToken) -> RawResult<String> {
        Ok(self.state.locked().spec(port)?.name.clone())
    }

    fn port_description(&self, port: PortToken) -> RawResult<String> {
        Ok(self.state.locked().spec(port)?.description.clone())
    }

    fn port_transport(&self, port: PortToken) -> RawResult<TransportKind> {
        Ok(self.state.locked().spec(port)?.transport)
    }

    fn port_usb_bus_address(&self, port: PortToken) -> RawResult<(u32, u32)> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.usb_bus_address) {
            (TransportKind::Usb, Some(bus_address)) => Ok(bus_address),
            (TransportKind::Usb, None) => Err(ReturnCode::Supp),
            _ => Err(state.fail("Port is not a USB device", ENOTTY)),
        }
    }

    fn port_usb_vid_pid(&self, port: PortToken) -> RawResult<(u16, u16)> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.usb_vid_pid) {
            (TransportKind::Usb, Some(ids)) => Ok(ids),
            (TransportKind::Usb, None) => Err(ReturnCode::Supp),
            _ => Err(state.fail("Port is not a USB device", ENOTTY)),
        }
    }

    fn port_usb_manufacturer(&self, port: PortToken) -> RawResult<String> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.usb_manufacturer.clone()) {
            (TransportKind::Usb, Some(value)) => Ok(value),
            (TransportKind::Usb, None) => Err(state.fail("USB manufacturer not available", 0)),
            _ => Err(state.fail("Port is not a USB device", ENOTTY)),
        }
    }

    fn port_usb_product(&self, port: PortToken) -> RawResult<String> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.usb_product.clone()) {
            (TransportKind::Usb, Some(value)) => Ok(value),
            (TransportKind::Usb, None) => Err(state.fail("USB product not available", 0)),
            _ => Err(state.fail("Port is not a USB device", ENOTTY)),
        }
    }

    fn port_usb_serial(&self, port: PortToken) -> RawResult<String> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.usb_serial.clone()) {
            (TransportKind::Usb, Some(value)) => Ok(value),
            (TransportKind::Usb, None) => Err(state.fail("USB serial number not available", 0)),
            _ => Err(state.fail("Port is not a USB device", ENOTTY)),
        }
    }

    fn port_bluetooth_address(&self, port: PortToken) -> RawResult<String> {
        let mut state = self.state.locked();
        let spec = state.spec(port)?;
        match (spec.transport, spec.bluetooth_address.clone()) {
            (TransportKind::Bluetooth, Some(address)) => Ok(address),
            (TransportKind::Bluetooth, None) => Err(ReturnCode::Supp),
            _ => Err(state.fail("Port is not a Bluetooth device", ENOTTY)),
        }
    }

    fn open(&self, port: PortToken, mode: Mode) -> RawResult<()> {
        let mut state = self.state.locked();
        let record = state.record(port)?;
        if record.open {
            return Err(state.fail("Port already open", EBUSY));
        }
        let device = &state.devices[record.device];
        if device.in_use {
            return Err(state.fail("Device or resource busy", EBUSY));
        }
        if !device.connected {
            return Err(state.fail("No such device", EIO));
        }
        let device = &mut state.devices[record.device];
        device.in_use = true;
        device.mode = Some(mode);
        if let Some(record) = state.records.get_mut(port.0) {
            record.open = true;
        }
        Ok(())
    }

    fn close(&self, port: PortToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let record = state.record(port)?;
        if !record.open {
            return Err(state.fail("Port not open", EBADF));
        }
        let device = &mut state.devices[record.device];
        device.in_use = false;
        device.mode = None;
        device.breaking = false;
        if let Some(record) = state.records.get_mut(port.0) {
            record.open = false;
        }
        self.ready.notify_all();
        Ok(())
    }

    fn new_config(&self) -> RawResult<ConfigToken> {
        let mut state = self.state.locked();
        if let Some(Fault::NewConfig(code)) =
            state.take_fault(|f| matches!(f, Fault::NewConfig(_)))
        {
            return Err(code);
        }
        state.stats.configs_allocated += 1;
        Ok(ConfigToken(state.configs.insert(LineSettings::default())))
    }

    fn free_config(&self, config: ConfigToken) {
        let mut state = self.state.locked();
        if state.configs.remove(config.0).is_some() {
            state.stats.configs_freed += 1;
        } else {
            state.stats.invalid_frees += 1;
        }
    }

    fn get_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        if state.configs.get(config.0).is_none() {
            return Err(ReturnCode::Arg);
        }
        for kind in SettingKind::ALL {
            if state.devices[device].unreadable.contains(&kind) {
                return Err(state.fail(format!("Failed to read {}", kind.name()), EIO));
            }
            let value = state.devices[device].settings.get(kind);
            if let (Some(setting), Some(record)) = (value, state.configs.get_mut(config.0)) {
                record.set(setting);
            }
        }
        Ok(())
    }

    fn set_config(&self, port: PortToken, config: ConfigToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        let settings = *state.configs.get(config.0).ok_or(ReturnCode::Arg)?;
        for setting in settings.iter_set() {
            state.apply_setting(device, setting)?;
        }
        Ok(())
    }

    fn get_config_setting(&self, config: ConfigToken, kind: SettingKind) -> RawResult<Setting> {
        let mut state = self.state.locked();
        let settings = state.configs.get(config.0).ok_or(ReturnCode::Arg)?;
        match settings.get(kind) {
            Some(setting) => Ok(setting),
            None => Err(state.fail(format!("{} not set", kind.name()), 0)),
        }
    }

    fn set_config_setting(&self, config: ConfigToken, setting: Setting) -> RawResult<()> {
        setting.validate()?;
        let mut state = self.state.locked();
        state
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
        let mut state = self.state.locked();
        state
            .configs
            .get_mut(config.0)
            .ok_or(ReturnCode::Arg)?
            .set_flowcontrol(flowcontrol);
        Ok(())
    }

    fn set_setting(&self, port: PortToken, setting: Setting) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        state.apply_setting(device, setting)
    }

    fn set_flowcontrol(&self, port: PortToken, flowcontrol: FlowControl) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        let mut settings = state.devices[device].settings;
        settings.set_flowcontrol(flowcontrol);
        for setting in settings.iter_set() {
            state.apply_setting(device, setting)?;
        }
        Ok(())
    }

    fn blocking_read(&self, port: PortToken, buf: &mut [u8], timeout_ms: u32) -> RawResult<usize> {
        let deadline = deadline(timeout_ms);
        let mut state = self.state.locked();
        let mut done = 0;
        loop {
            let device = state.transfer_device(port, false)?;
            done += state.devices[device].take_input(&mut buf[done..]);
            if done == buf.len() {
                return Ok(done);
            }
            let timed_out = match deadline {
                Some(deadline) => self.ready.wait_until(&mut state.guard, deadline).timed_out(),
                None => {
                    self.ready.wait(&mut state.guard);
                    false
                }
            };
            if timed_out {
                let device = state.transfer_device(port, false)?;
                done += state.devices[device].take_input(&mut buf[done..]);
                return Ok(done);
            }
        }
    }

    fn nonblocking_read(&self, port: PortToken, buf: &mut [u8]) -> RawResult<usize> {
        let mut state = self.state.locked();
        let device = state.transfer_device(port, false)?;
        Ok(state.devices[device].take_input(buf))
    }

    fn blocking_write(&self, port: PortToken, buf: &[u8], timeout_ms: u32) -> RawResult<usize> {
        let deadline = deadline(timeout_ms);
        let mut state = self.state.locked();
        let mut done = 0;
        loop {
            let device = state.transfer_device(port, true)?;
            done += state.devices[device].queue_output(&buf[done..]);
            if done == buf.len() {
                return Ok(done);
            }
            let timed_out = match deadline {
                Some(deadline) => self.ready.wait_until(&mut state.guard, deadline).timed_out(),
                None => {
                    self.ready.wait(&mut state.guard);
                    false
                }
            };
            if timed_out {
                let device = state.transfer_device(port, true)?;
                done += state.devices[device].queue_output(&buf[done..]);
                return Ok(done);
            }
        }
    }

    fn nonblocking_write(&self, port: PortToken, buf: &[u8]) -> RawResult<usize> {
        let mut state = self.state.locked();
        let device = state.transfer_device(port, true)?;
        Ok(state.devices[device].queue_output(buf))
    }

    fn input_waiting(&self, port: PortToken) -> RawResult<usize> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        Ok(state.devices[device].input.len())
    }

    fn output_waiting(&self, port: PortToken) -> RawResult<usize> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        Ok(state.devices[device].output.len())
    }

    fn flush(&self, port: PortToken, buffer: Buffer) -> RawResult<()> {
        let mut state = self.state.locked();
        let index = state.open_device(port)?;
        let device = &mut state.devices[index];
        if matches!(buffer, Buffer::Input | Buffer::Both) {
            device.input.clear();
        }
        if matches!(buffer, Buffer::Output | Buffer::Both) {
            device.output.clear();
        }
        self.ready.notify_all();
        Ok(())
    }

    fn drain(&self, port: PortToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        let pending = state.devices[device].output.len();
        state.devices[device].transmit(pending);
        self.ready.notify_all();
        Ok(())
    }

    fn signals(&self, port: PortToken) -> RawResult<Signals> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        Ok(state.devices[device].signals)
    }

    fn start_break(&self, port: PortToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        state.devices[device].breaking = true;
        Ok(())
    }

    fn end_break(&self, port: PortToken) -> RawResult<()> {
        let mut state = self.state.locked();
        let device = state.open_device(port)?;
        state.devices[device].breaking = false;
        Ok(())
    }

    fn new_event_set(&self) -> RawResult<EventSetToken> {
        let mut state = self.state.locked();
        if let Some(Fault::NewEventSet(code)) =
            state.take_fault(|f| matches!(f, Fault::NewEventSet(_)))
        {
            return Err(code);
        }
        state.stats.event_sets_allocated += 1;
        Ok(EventSetToken(state.event_sets.insert(Vec::new())))
    }

    fn free_event_set(&self, set: EventSetToken) {
        let mut state = self.state.locked();
        if state.event_sets.remove(set.0).is_some() {
            state.stats.event_sets_freed += 1;
        } else {
            state.stats.invalid_frees += 1;
        }
    }

    fn add_port_events(
        &self,
        set: EventSetToken,
        port: PortToken,
        mask: EventMask,
    ) -> RawResult<()> {
        let mut state = self.state.locked();
        state.open_device(port)?;
        state
            .event_sets
            .get_mut(set.0)
            .ok_or(ReturnCode::Arg)?
            .push((port, mask));
        Ok(())
    }

    fn wait(&self, set: EventSetToken, timeout_ms: u32) -> RawResult<()> {
        let deadline = deadline(timeout_ms);
        let mut state = self.state.locked();
        let registrations = state.event_sets.get(set.0).ok_or(ReturnCode::Arg)?.clone();
        loop {
            if state.any_ready(&registrations)? {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state.guard, deadline).timed_out() {
                        return Ok(());
                    }
                }
                None => self.ready.wait(&mut state.guard),
            }
        }
    }

    fn last_error(&self) -> LastError {
        self.state.locked().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> MockTransport {
        MockTransport::with_ports([
            MockPort::native("/dev/ttyS0"),
            MockPort::usb("/dev/ttyUSB0", 0x0403, 0x6001).manufacturer("FTDI"),
        ])
    }

    #[test]
    fn test_list_and_free_balance() {
        let transport = transport();
        let list = transport.list_ports().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(transport.stats().live_ports(), 2);
        transport.free_port_list(list);
        assert!(transport.stats().is_balanced());
    }

    #[test]
    fn test_double_free_is_counted() {
        let transport = transport();
        let port = transport.get_port_by_name("/dev/ttyS0").unwrap();
        transport.free_port(port);
        transport.free_port(port);
        assert_eq!(transport.stats().invalid_frees, 1);
    }

    #[test]
    fn test_copy_fault_triggers_after_count() {
        let transport = transport();
        let port = transport.get_port_by_name("/dev/ttyS0").unwrap();
        transport.inject(Fault::CopyPort {
            after: 1,
            code: ReturnCode::Fail,
        });
        let copy = transport.copy_port(port).unwrap();
        assert_eq!(transport.copy_port(port), Err(ReturnCode::Fail));
        assert_eq!(transport.last_error().message, "Port copy failed");
        assert!(transport.copy_port(port).is_ok());
        let _ = copy;
    }

    #[test]
    fn test_open_is_exclusive_per_device() {
        let transport = transport();
        let a = transport.get_port_by_name("/dev/ttyS0").unwrap();
        let b = transport.get_port_by_name("/dev/ttyS0").unwrap();
        transport.open(a, Mode::ReadWrite).unwrap();
        assert_eq!(transport.open(a, Mode::ReadWrite), Err(ReturnCode::Fail));
        assert_eq!(transport.open(b, Mode::Read), Err(ReturnCode::Fail));
        assert_eq!(transport.last_error().code, EBUSY);
        transport.close(a).unwrap();
        assert_eq!(transport.close(a), Err(ReturnCode::Fail));
        transport.open(b, Mode::Read).unwrap();
        assert_eq!(transport.open_mode("/dev/ttyS0"), Some(Mode::Read));
    }

    #[test]
    fn test_free_while_open_releases_device() {
        let transport = transport();
        let port = transport.get_port_by_name("/dev/ttyS0").unwrap();
        transport.open(port, Mode::ReadWrite).unwrap();
        transport.free_port(port);
        assert!(!transport.is_open("/dev/ttyS0"));
    }

    #[test]
    fn test_loopback_transmit() {
        let transport = transport();
        transport.set_loopback("/dev/ttyS0", true);
        let port = transport.get_port_by_name("/dev/ttyS0").unwrap();
        transport.open(port, Mode::ReadWrite).unwrap();
        assert_eq!(transport.nonblocking_write(port, b"ping").unwrap(), 4);
        transport.drain(port).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(transport.nonblocking_read(port, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(transport.transmitted("/dev/ttyS0"), b"ping");
    }

    #[test]
    fn test_identity_inapplicable_fields() {
        let transport = transport();
        let native = transport.get_port_by_name("/dev/ttyS0").unwrap();
        assert_eq!(transport.port_usb_vid_pid(native), Err(ReturnCode::Fail));
        let usb = transport.get_port_by_name("/dev/ttyUSB0").unwrap();
        assert_eq!(transport.port_usb_vid_pid(usb), Ok((0x0403, 0x6001)));
        assert_eq!(transport.port_usb_bus_address(usb), Err(ReturnCode::Supp));
        assert_eq!(transport.port_usb_product(usb), Err(ReturnCode::Fail));
    }
}
