//! Shared test utilities for spwrap integration tests.
//!
//! Provides mock driver setup with a small set of simulated devices and
//! helpers for opening ports and checking that every record was released.

#![allow(dead_code)]

use spwrap::transport::mock::MockPort;
use spwrap::transport::{MockTransport, SharedTransport};
use spwrap::{Mode, Port};
use std::sync::Arc;

pub const UART: &str = "/dev/ttyS0";
pub const FTDI: &str = "/dev/ttyUSB0";
pub const RFCOMM: &str = "/dev/rfcomm0";

/// A mock driver with a native UART, an FTDI adapter and a Bluetooth port.
pub fn mock_driver() -> MockTransport {
    MockTransport::with_ports([
        MockPort::native(UART),
        MockPort::usb(FTDI, 0x0403, 0x6001)
            .bus_address(1, 7)
            .manufacturer("FTDI")
            .product("FT232R USB UART")
            .serial_number("A50285BI"),
        MockPort::bluetooth(RFCOMM, "00:1A:7D:DA:71:13"),
    ])
}

/// The same driver as a handle-layer transport.
pub fn shared(mock: &MockTransport) -> SharedTransport {
    Arc::new(mock.clone())
}

/// Look up and open a port.
pub fn open_port(driver: &SharedTransport, name: &str, mode: Mode) -> Port {
    let port = Port::by_name_with(Arc::clone(driver), name).expect("port lookup failed");
    port.open(mode).expect("port open failed");
    port
}

/// Panic with the full counters if anything leaked or was freed twice.
pub fn assert_balanced(mock: &MockTransport) {
    let stats = mock.stats();
    assert!(stats.is_balanced(), "unbalanced native records: {stats:#?}");
}
