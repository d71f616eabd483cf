//! Helpers for hardware tests.

use spwrap::config::{ConfigLoader, TestingConfig};
use spwrap::{Mode, Port};

/// Hardware test settings, or `None` when no test port is configured.
///
/// Reads the `[testing]` section, so `TEST_PORT`, `TEST_BAUD` and
/// `LOOPBACK_ENABLED` work as well as `SPWRAP_TESTING_*`.
pub fn testing_config() -> Option<TestingConfig> {
    let testing = ConfigLoader::with_defaults().into_config().testing;
    if testing.port.is_none() {
        println!("Skipping hardware test: TEST_PORT not set");
        return None;
    }
    Some(testing)
}

/// Open the configured test port at the configured baud rate.
pub fn open_test_port(testing: &TestingConfig, mode: Mode) -> Port {
    let name = testing.port.as_deref().expect("test port configured");
    let port = Port::by_name(name).expect("test port not found");
    port.open(mode).expect("failed to open test port");
    port.set_baudrate(testing.baud).expect("failed to set baud rate");
    port
}

/// Print every visible port, for diagnosing a missing test device.
pub fn print_available_ports() {
    match Port::list() {
        Ok(ports) if ports.is_empty() => println!("No serial ports detected on this system"),
        Ok(ports) => {
            println!("Available serial ports ({}):", ports.len());
            for port in ports {
                println!(
                    "  {} [{}] {}",
                    port.name().unwrap_or_default(),
                    port.transport().map(|t| t.to_string()).unwrap_or_default(),
                    port.description().unwrap_or_default()
                );
            }
        }
        Err(err) => println!("Port enumeration failed: {err}"),
    }
}
