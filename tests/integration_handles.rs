//! Handle-layer behavior against the mock driver: ownership, enumeration,
//! configuration and I/O.

mod common;

use common::{assert_balanced, mock_driver, open_port, shared, FTDI, RFCOMM, UART};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use spwrap::transport::mock::Fault;
use spwrap::transport::{LineSettings, ReturnCode, SettingKind};
use spwrap::{
    Buffer, Configuration, Cts, ErrorKind, EventSet, FlowControl, Mode, Parity, Port, Rts,
    Signals, TransportKind,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Debug, PartialEq)]
struct Identity {
    name: String,
    description: Option<String>,
    transport: Option<TransportKind>,
    bus_address: Option<(u32, u32)>,
    vid_pid: Option<(u16, u16)>,
    manufacturer: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    bluetooth: Option<String>,
}

fn identity(port: &Port) -> Identity {
    Identity {
        name: port.name().unwrap(),
        description: port.description().ok(),
        transport: port.transport().ok(),
        bus_address: port.usb_bus_address().ok(),
        vid_pid: port.usb_vid_pid().ok(),
        manufacturer: port.usb_manufacturer().ok(),
        product: port.usb_product().ok(),
        serial: port.usb_serial().ok(),
        bluetooth: port.bluetooth_address().ok(),
    }
}

proptest! {
    #[test]
    fn prop_clones_release_exactly_once(
        port_clones in 0usize..12,
        config_clones in 0usize..12,
        event_set_clones in 0usize..12,
    ) {
        let mock = mock_driver();
        let driver = shared(&mock);
        {
            let port = Port::by_name_with(Arc::clone(&driver), UART).unwrap();
            let config = Configuration::create_with(Arc::clone(&driver)).unwrap();
            let events: EventSet<'static> = EventSet::create_with(Arc::clone(&driver)).unwrap();

            let ports: Vec<_> = (0..port_clones).map(|_| port.clone()).collect();
            let configs: Vec<_> = (0..config_clones).map(|_| config.clone()).collect();
            let sets: Vec<_> = (0..event_set_clones).map(|_| events.clone()).collect();

            drop(port);
            drop(config);
            drop(events);

            let stats = mock.stats();
            prop_assert_eq!(stats.live_ports(), usize::from(port_clones > 0));
            prop_assert_eq!(stats.live_configs(), usize::from(config_clones > 0));
            prop_assert_eq!(stats.live_event_sets(), usize::from(event_set_clones > 0));

            drop((ports, configs, sets));
        }
        prop_assert!(mock.stats().is_balanced());
    }
}

#[test]
fn test_list_matches_lookup_by_name() {
    let mock = mock_driver();
    let driver = shared(&mock);

    let ports = Port::list_with(Arc::clone(&driver)).unwrap();
    assert_eq!(ports.len(), 3);
    for listed in &ports {
        let name = listed.name().unwrap();
        let looked_up = Port::by_name_with(Arc::clone(&driver), &name).unwrap();
        assert_eq!(identity(listed), identity(&looked_up));
    }

    drop(ports);
    assert_balanced(&mock);
}

#[test]
fn test_transport_specific_identity() {
    let mock = mock_driver();
    let driver = shared(&mock);

    let usb = Port::by_name_with(Arc::clone(&driver), FTDI).unwrap();
    assert_eq!(
        identity(&usb),
        Identity {
            name: FTDI.to_string(),
            description: Some("USB serial adapter".to_string()),
            transport: Some(TransportKind::Usb),
            bus_address: Some((1, 7)),
            vid_pid: Some((0x0403, 0x6001)),
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT232R USB UART".to_string()),
            serial: Some("A50285BI".to_string()),
            bluetooth: None,
        }
    );

    let bt = Port::by_name_with(Arc::clone(&driver), RFCOMM).unwrap();
    assert_eq!(bt.bluetooth_address().unwrap(), "00:1A:7D:DA:71:13");
    let err = bt.usb_vid_pid().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.to_string(), "usb_vid_pid failed: Port is not a USB device");
}

#[test]
fn test_enumeration_failure_on_third_copy_leaks_nothing() {
    let mock = mock_driver();
    mock.inject(Fault::CopyPort {
        after: 2,
        code: ReturnCode::Fail,
    });

    let err = Port::list_with(shared(&mock)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.to_string(), "list failed: Port copy failed");

    let stats = mock.stats();
    assert_eq!(stats.ports_allocated, 3 + 2);
    assert_balanced(&mock);
}

#[test]
fn test_enumeration_failure_before_copying() {
    let mock = mock_driver();
    mock.inject(Fault::ListPorts(ReturnCode::Fail));
    let err = Port::list_with(shared(&mock)).unwrap_err();
    assert_eq!(err.to_string(), "list failed: Enumeration failed");
    assert_eq!(err.code(), Some(5));
    assert_balanced(&mock);
}

#[test]
fn test_closed_port_operations_fail() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let never_opened = Port::by_name_with(Arc::clone(&driver), UART).unwrap();
    let reopened = Port::by_name_with(Arc::clone(&driver), FTDI).unwrap();
    reopened.open(Mode::ReadWrite).unwrap();
    reopened.close().unwrap();

    for port in [&never_opened, &reopened] {
        let mut buf = [0u8; 8];
        let errors = [
            port.blocking_read(&mut buf, ms(10)).unwrap_err(),
            port.blocking_write(b"data", ms(10)).unwrap_err(),
            port.nonblocking_read(&mut buf).unwrap_err(),
            port.nonblocking_write(b"data").unwrap_err(),
            port.flush(Buffer::Both).unwrap_err(),
            port.drain().unwrap_err(),
            port.signals().unwrap_err(),
            port.start_break().unwrap_err(),
            port.end_break().unwrap_err(),
            port.input_waiting().unwrap_err(),
            port.output_waiting().unwrap_err(),
            port.config().unwrap_err(),
            port.set_baudrate(9600).unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Failure, "{err}");
            assert_eq!(err.code(), Some(9));
        }
    }

    let err = never_opened.blocking_read(&mut [0u8; 1], ms(10)).unwrap_err();
    assert_eq!(err.to_string(), "blocking_read failed: Port not open");

    drop((never_opened, reopened));
    assert_balanced(&mock);
}

#[test]
fn test_open_is_exclusive_and_drop_releases_device() {
    let mock = mock_driver();
    let driver = shared(&mock);

    let first = open_port(&driver, UART, Mode::Read);
    let second = Port::by_name_with(Arc::clone(&driver), UART).unwrap();
    let err = second.open(Mode::Write).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.code(), Some(16));

    drop(first);
    assert!(!mock.is_open(UART));
    second.open(Mode::Write).unwrap();
    assert_eq!(mock.open_mode(UART), Some(Mode::Write));
}

#[test]
fn test_baud_only_configuration_changes_only_baud() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    port.set_parity(Parity::Even).unwrap();
    port.set_bits(7).unwrap();
    let before = mock.settings(UART);

    let config = Configuration::create_with(Arc::clone(&driver)).unwrap();
    config.set_baudrate(57_600).unwrap();
    port.set_config(&config).unwrap();

    assert_eq!(
        mock.settings(UART),
        LineSettings {
            baudrate: Some(57_600),
            ..before
        }
    );
}

#[test]
fn test_set_config_has_no_rollback() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    mock.reject_setting(UART, SettingKind::Parity, ReturnCode::Fail);

    let config = Configuration::create_with(Arc::clone(&driver)).unwrap();
    config.set_baudrate(19_200).unwrap();
    config.set_bits(7).unwrap();
    config.set_parity(Parity::Odd).unwrap();

    let err = port.set_config(&config).unwrap_err();
    assert_eq!(err.to_string(), "set_config failed: Device rejected parity");

    let live = mock.settings(UART);
    assert_eq!(live.baudrate, Some(19_200));
    assert_eq!(live.bits, Some(7));
    assert_eq!(live.parity, Some(Parity::None));
}

#[test]
fn test_unsupported_setting_surfaces_as_not_supported() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    mock.reject_setting(UART, SettingKind::Parity, ReturnCode::Supp);

    let err = port.set_parity(Parity::Mark).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert_eq!(
        err.to_string(),
        "set_parity not possible: requested operation unsupported"
    );
}

#[test]
fn test_config_snapshot_reads_live_settings() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    port.set_baudrate(230_400).unwrap();
    port.set_flowcontrol(FlowControl::RtsCts).unwrap();

    let snapshot = port.config().unwrap();
    assert_eq!(snapshot.baudrate().unwrap(), 230_400);
    assert_eq!(snapshot.bits().unwrap(), 8);
    assert_eq!(snapshot.rts().unwrap(), Rts::FlowControl);
    assert_eq!(snapshot.cts().unwrap(), Cts::FlowControl);

    port.set_flowcontrol(FlowControl::None).unwrap();
    assert_eq!(mock.settings(UART).rts, Some(Rts::On));
    assert_eq!(mock.settings(UART).cts, Some(Cts::Ignore));
    // The snapshot is a copy
    assert_eq!(snapshot.rts().unwrap(), Rts::FlowControl);
}

#[test]
fn test_nonblocking_write_then_output_waiting() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);

    let written = port.nonblocking_write(b"hello world").unwrap();
    assert_eq!(written, 11);
    let waiting = port.output_waiting().unwrap();
    assert!(waiting > 0 && waiting <= written);
    assert_eq!(port.input_waiting().unwrap(), 0);

    mock.transmit(UART, 5);
    assert_eq!(port.output_waiting().unwrap(), 6);

    port.drain().unwrap();
    assert_eq!(port.output_waiting().unwrap(), 0);
    assert_eq!(mock.transmitted(UART), b"hello world");
}

#[test]
fn test_nonblocking_write_stops_at_capacity() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::Write);
    mock.set_output_capacity(UART, 4);

    assert_eq!(port.nonblocking_write(b"abcdefgh").unwrap(), 4);
    assert_eq!(port.nonblocking_write(b"ijkl").unwrap(), 0);

    let started = Instant::now();
    assert_eq!(port.blocking_write(b"ijkl", ms(30)).unwrap(), 0);
    assert!(started.elapsed() >= ms(25));
}

#[test]
fn test_blocking_read_returns_short_count_on_timeout() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::Read);
    mock.feed(UART, &[0x55; 10]);

    let mut buf = [0u8; 100];
    let started = Instant::now();
    let read = port.blocking_read(&mut buf, ms(50)).unwrap();

    assert_eq!(read, 10);
    assert_eq!(&buf[..10], &[0x55; 10]);
    assert!(started.elapsed() >= ms(45));
}

#[test]
fn test_blocking_read_without_timeout_waits_for_data() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::Read);

    let feeder = {
        let mock = mock.clone();
        thread::spawn(move || {
            thread::sleep(ms(20));
            mock.feed(UART, b"ab");
            thread::sleep(ms(20));
            mock.feed(UART, b"cd");
        })
    };

    let mut buf = [0u8; 4];
    assert_eq!(port.blocking_read(&mut buf, Duration::ZERO).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    feeder.join().unwrap();
}

#[test]
fn test_loopback_and_flush() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    mock.set_loopback(UART, true);

    port.blocking_write(b"ping", ms(100)).unwrap();
    port.drain().unwrap();
    assert_eq!(port.input_waiting().unwrap(), 4);

    port.flush(Buffer::Input).unwrap();
    assert_eq!(port.input_waiting().unwrap(), 0);

    port.nonblocking_write(b"queued").unwrap();
    port.flush(Buffer::Both).unwrap();
    assert_eq!(port.output_waiting().unwrap(), 0);
    assert!(mock.transmitted(UART).ends_with(b"ping"));
}

#[test]
fn test_signals_and_break() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    mock.set_signals(UART, Signals::CTS | Signals::DCD);

    let signals = port.signals().unwrap();
    assert!(signals.contains(Signals::CTS));
    assert!(signals.contains(Signals::DCD));
    assert!(!signals.contains(Signals::RI));

    port.start_break().unwrap();
    assert!(mock.is_breaking(UART));
    port.end_break().unwrap();
    assert!(!mock.is_breaking(UART));
}

#[test]
fn test_disconnected_device_fails_io() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);
    mock.disconnect(UART);

    let err = port.input_waiting().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.code(), Some(5));

    let io_err: std::io::Error = err.into();
    assert!(io_err.to_string().contains("input_waiting failed"));
}

#[test]
fn test_transfers_respect_open_mode() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let mut buf = [0u8; 8];

    let reader = open_port(&driver, UART, Mode::Read);
    mock.feed(UART, b"abc");
    let err = reader.nonblocking_write(b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.code(), Some(9));
    assert_eq!(
        reader.blocking_write(b"x", ms(10)).unwrap_err().kind(),
        ErrorKind::Failure
    );
    assert_eq!(mock.pending_output(UART), 0);
    assert_eq!(reader.nonblocking_read(&mut buf).unwrap(), 3);
    assert_eq!(mock.pending_input(UART), 0);
    reader.close().unwrap();

    let writer = open_port(&driver, UART, Mode::Write);
    mock.feed(UART, b"zz");
    assert_eq!(
        writer.blocking_read(&mut buf, ms(10)).unwrap_err().kind(),
        ErrorKind::Failure
    );
    assert_eq!(mock.pending_input(UART), 2);
    assert_eq!(writer.nonblocking_write(b"ok").unwrap(), 2);
    assert_eq!(mock.pending_output(UART), 2);
}
