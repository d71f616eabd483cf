//! Event-set waits across several ports.

mod common;

use common::{assert_balanced, mock_driver, open_port, shared, FTDI, UART};
use spwrap::transport::MockTransport;
use spwrap::{ErrorKind, EventMask, EventSet, Mode};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_wait_wakes_when_any_port_receives() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let uart = open_port(&driver, UART, Mode::Read);
    let usb = open_port(&driver, FTDI, Mode::Read);

    let events = EventSet::create_with(Arc::clone(&driver)).unwrap();
    events.add_events(&uart, EventMask::RX_READY).unwrap();
    events.add_events(&usb, EventMask::RX_READY).unwrap();

    let feeder = {
        let mock = mock.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            mock.feed(FTDI, b"$GPGGA");
        })
    };

    let started = Instant::now();
    events.wait(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    feeder.join().unwrap();

    // Readiness is coarse: callers re-check each port
    assert_eq!(uart.input_waiting().unwrap(), 0);
    assert_eq!(usb.input_waiting().unwrap(), 6);
}

#[test]
fn test_tx_ready_follows_output_space() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::Write);
    mock.set_output_capacity(UART, 2);
    port.nonblocking_write(b"xy").unwrap();

    let events = EventSet::create_with(Arc::clone(&driver)).unwrap();
    events.add_events(&port, EventMask::TX_READY).unwrap();

    let started = Instant::now();
    events.wait(Duration::from_millis(40)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(35));

    mock.transmit(UART, 1);
    let started = Instant::now();
    events.wait(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_error_interest_reports_disconnect() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::ReadWrite);

    let events = EventSet::create_with(Arc::clone(&driver)).unwrap();
    events
        .add_events(&port, EventMask::RX_READY | EventMask::ERROR)
        .unwrap();

    let unplug = {
        let mock = mock.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            mock.disconnect(UART);
        })
    };
    events.wait(Duration::ZERO).unwrap();
    unplug.join().unwrap();

    assert_eq!(port.input_waiting().unwrap_err().kind(), ErrorKind::Failure);
}

#[test]
fn test_wait_fails_once_registered_port_closes() {
    let mock = mock_driver();
    let driver = shared(&mock);
    let port = open_port(&driver, UART, Mode::Read);

    let events = EventSet::create_with(Arc::clone(&driver)).unwrap();
    events.add_events(&port, EventMask::RX_READY).unwrap();
    port.close().unwrap();

    let err = events.wait(Duration::from_millis(10)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(err.function(), "wait");
}

#[test]
fn test_event_sets_are_released() {
    let mock = mock_driver();
    {
        let driver = shared(&mock);
        let port = open_port(&driver, UART, Mode::Read);
        let events = EventSet::create_with(Arc::clone(&driver)).unwrap();
        let copy = events.clone();
        events.add_events(&port, EventMask::RX_READY).unwrap();
        copy.add_events(&port, EventMask::ERROR).unwrap();
        drop(events);
        assert_eq!(mock.stats().live_event_sets(), 1);
    }
    assert_balanced(&mock);
}

#[test]
fn test_ports_from_another_driver_are_rejected() {
    let mock = mock_driver();
    let port = open_port(&shared(&mock), UART, Mode::Read);

    let other = MockTransport::new();
    let events = EventSet::create_with(Arc::new(other)).unwrap();
    let err = events.add_events(&port, EventMask::RX_READY).unwrap_err();
    assert_eq!(err.to_string(), "Invalid argument passed to add_events");
}
