//! Value tables shared by the handle layer and the transport drivers.
//!
//! Every enum here is pinned to the numeric value the native driver uses for
//! it, and carries an explicit bidirectional table (`to_raw` / `from_raw`).
//! A raw value of [`UNSET_RAW`] means "no value" in a configuration record and
//! has no variant of its own; the Rust side models it as `Option::None`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Native value stored in a configuration record for a field that is unset.
pub const UNSET_RAW: i32 = -1;

macro_rules! native_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $raw:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant paired with its native value.
            pub const TABLE: &'static [($name, i32)] = &[ $( ($name::$variant, $raw) ),+ ];

            /// Native value of this variant.
            pub fn to_raw(self) -> i32 {
                match self {
                    $( $name::$variant => $raw ),+
                }
            }

            /// Look up a variant by native value.
            pub fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $( r if r == $raw => Some($name::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

native_enum! {
    /// Direction a port is opened for.
    pub enum Mode {
        Read = 1,
        Write = 2,
        ReadWrite = 3,
    }
}

impl Mode {
    pub fn readable(self) -> bool {
        self.to_raw() & Mode::Read.to_raw() != 0
    }

    pub fn writable(self) -> bool {
        self.to_raw() & Mode::Write.to_raw() != 0
    }
}

native_enum! {
    /// Which kernel buffers a flush discards.
    pub enum Buffer {
        Input = 1,
        Output = 2,
        Both = 3,
    }
}

native_enum! {
    pub enum Parity {
        None = 0,
        Odd = 1,
        Even = 2,
        Mark = 3,
        Space = 4,
    }
}

native_enum! {
    /// RTS pin behaviour.
    pub enum Rts {
        Off = 0,
        On = 1,
        FlowControl = 2,
    }
}

native_enum! {
    /// CTS pin behaviour.
    pub enum Cts {
        Ignore = 0,
        FlowControl = 1,
    }
}

native_enum! {
    /// DTR pin behaviour.
    pub enum Dtr {
        Off = 0,
        On = 1,
        FlowControl = 2,
    }
}

native_enum! {
    /// DSR pin behaviour.
    pub enum Dsr {
        Ignore = 0,
        FlowControl = 1,
    }
}

native_enum! {
    /// Software flow control direction.
    pub enum XonXoff {
        Disabled = 0,
        In = 1,
        Out = 2,
        InOut = 3,
    }
}

native_enum! {
    /// Standard flow control presets.
    ///
    /// Applying one of these is shorthand for setting the RTS/CTS/DTR/DSR pin
    /// modes and the Xon/Xoff mode together.
    pub enum FlowControl {
        None = 0,
        XonXoff = 1,
        RtsCts = 2,
        DtrDsr = 3,
    }
}

native_enum! {
    /// How a port is attached to the host.
    pub enum TransportKind {
        Native = 0,
        Usb = 1,
        Bluetooth = 2,
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Usb => write!(f, "usb"),
            Self::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

bitflags::bitflags! {
    /// Modem status lines as read from the port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Signals: u8 {
        /// Clear to send.
        const CTS = 1;
        /// Data set ready.
        const DSR = 2;
        /// Data carrier detect.
        const DCD = 4;
        /// Ring indicator.
        const RI = 8;
    }
}

bitflags::bitflags! {
    /// Readiness conditions an event set waits for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u8 {
        const RX_READY = 1;
        const TX_READY = 2;
        const ERROR = 4;
    }
}

/// Names of the flags set in `flags`, in declaration order.
fn flag_labels<F: bitflags::Flags>(flags: &F) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

fn write_flags<F: bitflags::Flags>(flags: &F, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let labels = flag_labels(flags);
    if labels.is_empty() {
        write!(f, "-")
    } else {
        write!(f, "{}", labels.join("|"))
    }
}

impl Signals {
    pub fn labels(self) -> Vec<&'static str> {
        flag_labels(&self)
    }
}

impl EventMask {
    pub fn labels(self) -> Vec<&'static str> {
        flag_labels(&self)
    }
}

impl fmt::Display for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(self, f)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(self, f)
    }
}
