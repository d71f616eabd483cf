//! Tests requiring actual serial hardware.
//!
//! # Running Hardware Tests
//!
//! ```bash
//! export TEST_PORT=/dev/ttyUSB0          # or COM3 on Windows
//! export TEST_BAUD=115200                # optional
//! export LOOPBACK_ENABLED=1              # if TX is wired to RX
//!
//! cargo test --features hardware-tests --test integration_hardware -- --ignored
//! ```

use super::utils::{open_test_port, print_available_ports, testing_config};
use spwrap::{Buffer, Configuration, ErrorKind, EventMask, EventSet, Mode, Port};
use std::time::Duration;

#[test]
#[ignore]
fn test_enumeration_releases_and_matches_lookup() {
    print_available_ports();
    let ports = Port::list().expect("enumeration failed");
    for listed in &ports {
        let name = listed.name().unwrap();
        let looked_up = Port::by_name(&name).unwrap();
        assert_eq!(listed.description().ok(), looked_up.description().ok());
        assert_eq!(listed.transport().ok(), looked_up.transport().ok());
        assert_eq!(listed.usb_vid_pid().ok(), looked_up.usb_vid_pid().ok());
    }
}

#[test]
#[ignore]
fn test_real_port_open_close() {
    let Some(testing) = testing_config() else { return };
    let port = open_test_port(&testing, Mode::ReadWrite);

    let err = port.open(Mode::ReadWrite).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);

    port.close().unwrap();
    assert_eq!(port.close().unwrap_err().kind(), ErrorKind::Failure);
}

#[test]
#[ignore]
fn test_real_port_configuration_round_trip() {
    let Some(testing) = testing_config() else { return };
    let port = open_test_port(&testing, Mode::ReadWrite);

    let config = Configuration::create().unwrap();
    config.set_baudrate(9600).unwrap();
    config.set_bits(8).unwrap();
    port.set_config(&config).unwrap();

    let live = port.config().unwrap();
    assert_eq!(live.baudrate().unwrap(), 9600);
    assert_eq!(live.bits().unwrap(), 8);

    port.set_baudrate(testing.baud).unwrap();
    port.close().unwrap();
}

#[test]
#[ignore]
fn test_real_port_read_timeout() {
    let Some(testing) = testing_config() else { return };
    let port = open_test_port(&testing, Mode::ReadWrite);
    port.flush(Buffer::Both).unwrap();

    let mut buf = [0u8; 64];
    let read = port
        .blocking_read(&mut buf, Duration::from_millis(100))
        .unwrap();
    assert!(read <= buf.len());
    port.signals().unwrap();
    port.close().unwrap();
}

#[test]
#[ignore]
fn test_real_port_loopback() {
    let Some(testing) = testing_config() else { return };
    if !testing.loopback_enabled {
        println!("Skipping loopback test: LOOPBACK_ENABLED not set");
        return;
    }
    let port = open_test_port(&testing, Mode::ReadWrite);
    port.flush(Buffer::Both).unwrap();

    let message = b"spwrap loopback\r\n";
    let written = port.blocking_write(message, testing.timeout()).unwrap();
    assert_eq!(written, message.len());
    port.drain().unwrap();

    let events = EventSet::create().unwrap();
    events.add_events(&port, EventMask::RX_READY).unwrap();
    events.wait(testing.timeout()).unwrap();

    let mut echo = [0u8; 17];
    let read = port.blocking_read(&mut echo, testing.timeout()).unwrap();
    assert_eq!(&echo[..read], message);
    drop(events);
    port.close().unwrap();
}
