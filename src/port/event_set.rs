use super::{same_transport, timeout_ms, Port};
use crate::error::{check, Error, Result};
use crate::transport::{self, EventSetToken, SharedTransport};
use crate::types::EventMask;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

struct EventSetInner {
    transport: SharedTransport,
    token: EventSetToken,
}

impl Drop for EventSetInner {
    fn drop(&mut self) {
        trace!("Releasing event set record {}", self.token.0);
        self.transport.free_event_set(self.token);
    }
}

/// Readiness interest across several open ports.
///
/// The set refers to its ports without owning them; the `'p` lifetime keeps
/// every registered [`Port`] alive for as long as the set is.
///
/// # Example
/// ```
/// use spwrap::transport::{MockTransport, mock::MockPort};
/// use spwrap::{EventMask, EventSet, Mode, Port};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let mock = MockTransport::with_ports([MockPort::native("/dev/ttyS0")]);
/// let driver: spwrap::transport::SharedTransport = Arc::new(mock.clone());
/// let port = Port::by_name_with(driver.clone(), "/dev/ttyS0")?;
/// port.open(Mode::Read)?;
///
/// let events = EventSet::create_with(driver)?;
/// events.add_events(&port, EventMask::RX_READY)?;
/// mock.feed("/dev/ttyS0", b"x");
/// events.wait(Duration::from_millis(100))?;
/// assert_eq!(port.input_waiting()?, 1);
/// # Ok::<(), spwrap::Error>(())
/// ```
#[derive(Clone)]
pub struct EventSet<'p> {
    inner: Arc<EventSetInner>,
    ports: PhantomData<&'p Port>,
}

impl<'p> EventSet<'p> {
    /// Allocate an empty set through the hardware driver.
    pub fn create() -> Result<EventSet<'p>> {
        Self::create_with(transport::native())
    }

    pub fn create_with(transport: SharedTransport) -> Result<EventSet<'p>> {
        let token = check(&*transport, "create", transport.new_event_set())?;
        trace!("Acquired event set record {}", token.0);
        Ok(Self {
            inner: Arc::new(EventSetInner { transport, token }),
            ports: PhantomData,
        })
    }

    /// Register interest in `events` on `port`, adding to any earlier
    /// registrations.
    pub fn add_events(&self, port: &'p Port, events: EventMask) -> Result<()> {
        let transport = &*self.inner.transport;
        if !same_transport(&self.inner.transport, port.driver()) {
            return Err(Error::invalid_argument("add_events"));
        }
        check(
            transport,
            "add_events",
            transport.add_port_events(self.inner.token, port.token(), events),
        )
    }

    /// Block until a registered port is ready or `timeout` elapses
    /// (`Duration::ZERO` waits indefinitely).
    ///
    /// Returning does not say which port is ready, or that any is: callers
    /// check each port afterwards.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let transport = &*self.inner.transport;
        debug!("Waiting on event set {} ({:?})", self.inner.token.0, timeout);
        check(
            transport,
            "wait",
            transport.wait(self.inner.token, timeout_ms(timeout)),
        )
    }
}

impl fmt::Debug for EventSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSet")
            .field("token", &self.inner.token.0)
            .finish()
    }
}
