use crate::error::{check, Error, Result};
use crate::transport::{self, ConfigToken, Setting, SettingKind, SharedTransport};
use crate::types::{Cts, Dsr, Dtr, FlowControl, Parity, Rts, XonXoff};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Generate a typed getter that unwraps the matching [`Setting`] variant.
macro_rules! setting_getters {
    ($( $(#[$doc:meta])* $name:ident => $variant:ident($ty:ty) ),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) -> Result<$ty> {
                match self.get(stringify!($name), SettingKind::$variant)? {
                    Setting::$variant(value) => Ok(value),
                    other => Err(Error::Failure {
                        function: stringify!($name),
                        message: format!("driver returned {:?}", other),
                        code: 0,
                    }),
                }
            }
        )*
    };
}

struct ConfigInner {
    transport: SharedTransport,
    token: ConfigToken,
}

impl Drop for ConfigInner {
    fn drop(&mut self) {
        trace!("Releasing configuration record {}", self.token.0);
        self.transport.free_config(self.token);
    }
}

/// A set of line parameters held by the driver.
///
/// Every field starts unset. Unset fields are left alone when the
/// configuration is applied with [`Port::set_config`](super::Port::set_config),
/// so a configuration with only a baud rate changes only the baud rate.
#[derive(Clone)]
pub struct Configuration {
    inner: Arc<ConfigInner>,
}

impl Configuration {
    /// Allocate an empty configuration through the hardware driver.
    pub fn create() -> Result<Configuration> {
        Self::create_with(transport::native())
    }

    pub fn create_with(transport: SharedTransport) -> Result<Configuration> {
        let token = check(&*transport, "create", transport.new_config())?;
        trace!("Acquired configuration record {}", token.0);
        Ok(Self {
            inner: Arc::new(ConfigInner { transport, token }),
        })
    }

    pub fn driver(&self) -> &SharedTransport {
        &self.inner.transport
    }

    pub(crate) fn token(&self) -> ConfigToken {
        self.inner.token
    }

    fn get(&self, function: &'static str, kind: SettingKind) -> Result<Setting> {
        let transport = &*self.inner.transport;
        check(
            transport,
            function,
            transport.get_config_setting(self.inner.token, kind),
        )
    }

    fn apply(&self, function: &'static str, setting: Setting) -> Result<()> {
        setting
            .validate()
            .map_err(|_| Error::invalid_argument(function))?;
        let transport = &*self.inner.transport;
        check(
            transport,
            function,
            transport.set_config_setting(self.inner.token, setting),
        )
    }

    setting_getters! {
        baudrate => Baudrate(u32),
        bits => Bits(u8),
        parity => Parity(Parity),
        stopbits => StopBits(u8),
        rts => Rts(Rts),
        cts => Cts(Cts),
        dtr => Dtr(Dtr),
        dsr => Dsr(Dsr),
        xon_xoff => XonXoff(XonXoff),
    }

    setting_setters! {
        /// Fails with an invalid argument for zero or rates above `i32::MAX`.
        set_baudrate => Baudrate(u32),
        set_bits => Bits(u8),
        set_parity => Parity(Parity),
        set_stopbits => StopBits(u8),
        set_rts => Rts(Rts),
        set_cts => Cts(Cts),
        set_dtr => Dtr(Dtr),
        set_dsr => Dsr(Dsr),
        set_xon_xoff => XonXoff(XonXoff),
    }

    /// Set pin and Xon/Xoff fields together from a flow control preset.
    pub fn set_flowcontrol(&self, flowcontrol: FlowControl) -> Result<()> {
        let transport = &*self.inner.transport;
        check(
            transport,
            "set_flowcontrol",
            transport.set_config_flowcontrol(self.inner.token, flowcontrol),
        )
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("token", &self.inner.token.0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::mock::Fault;
    use crate::transport::{MockTransport, ReturnCode};

    fn create() -> (MockTransport, Configuration) {
        let mock = MockTransport::new();
        let config = Configuration::create_with(Arc::new(mock.clone())).unwrap();
        (mock, config)
    }

    #[test]
    fn test_fields_start_unset() {
        let (_mock, config) = create();
        let err = config.baudrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failure);
        assert_eq!(err.function(), "baudrate");
    }

    #[test]
    fn test_set_then_get() {
        let (_mock, config) = create();
        config.set_baudrate(57_600).unwrap();
        config.set_parity(Parity::Space).unwrap();
        config.set_stopbits(2).unwrap();
        assert_eq!(config.baudrate().unwrap(), 57_600);
        assert_eq!(config.parity().unwrap(), Parity::Space);
        assert_eq!(config.stopbits().unwrap(), 2);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let (_mock, config) = create();
        for err in [
            config.set_baudrate(0).unwrap_err(),
            config.set_baudrate(i32::MAX as u32 + 1).unwrap_err(),
            config.set_bits(4).unwrap_err(),
            config.set_stopbits(0).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(
            config.set_bits(9).unwrap_err().to_string(),
            "Invalid argument passed to set_bits"
        );
        assert!(config.bits().is_err());
    }

    #[test]
    fn test_flowcontrol_fans_out() {
        let (_mock, config) = create();
        config.set_flowcontrol(FlowControl::RtsCts).unwrap();
        assert_eq!(config.rts().unwrap(), Rts::FlowControl);
        assert_eq!(config.cts().unwrap(), Cts::FlowControl);
        assert_eq!(config.xon_xoff().unwrap(), XonXoff::Disabled);
        assert_eq!(config.dsr().unwrap(), Dsr::Ignore);
        assert!(config.dtr().is_err());
    }

    #[test]
    fn test_allocation_failure() {
        let mock = MockTransport::new();
        mock.inject(Fault::NewConfig(ReturnCode::Mem));
        let err = Configuration::create_with(Arc::new(mock.clone())).unwrap_err();
        assert_eq!(err.to_string(), "create failed: memory allocation failed");
        assert!(mock.stats().is_balanced());
    }

    #[test]
    fn test_release_on_last_drop() {
        let (mock, config) = create();
        let other = config.clone();
        drop(config);
        assert_eq!(mock.stats().live_configs(), 1);
        drop(other);
        assert!(mock.stats().is_balanced());
    }
}
