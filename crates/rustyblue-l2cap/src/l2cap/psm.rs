//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages PSM values for L2CAP connections.

use std::fmt;

/// Protocol/Service Multiplexer (PSM) value used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2.
/// And assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/logical-link-control/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PSM(pub u16);

impl PSM {
    /// Service Discovery Protocol
    pub const SDP: PSM = PSM(0x0001);
    /// RFCOMM protocol
    pub const RFCOMM: PSM = PSM(0x0003);
    /// Telephony Control Protocol
    pub const TCS_BIN: PSM = PSM(0x0005);
    /// TCS_BIN_CORDLESS
    pub const TCS_BIN_CORDLESS: PSM = PSM(0x0007);
    /// BNEP protocol
    pub const BNEP: PSM = PSM(0x000F);
    /// HID Control
    pub const HID_CONTROL: PSM = PSM(0x0011);
    /// HID Interrupt
    pub const HID_INTERRUPT: PSM = PSM(0x0013);
    /// AVCTP protocol
    pub const AVCTP: PSM = PSM(0x0017);
    /// AVDTP protocol
    pub const AVDTP: PSM = PSM(0x0019);

    /// First value of the dynamically assigned range
    pub const DYNAMIC_START: u16 = 0x1001;

    /// Check if the PSM is valid
    ///
    /// The value must be odd and the least significant bit of the most
    /// significant octet must be clear.
    pub fn is_valid(&self) -> bool {
        self.0 & 0x0101 == 0x0001
    }

    /// Whether the value lies in the dynamically assigned range
    pub fn is_dynamic(&self) -> bool {
        self.0 >= Self::DYNAMIC_START
    }

    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Try to create a PSM from a u16 value
    pub fn from_value(value: u16) -> Option<Self> {
        let psm = PSM(value);
        psm.is_valid().then_some(psm)
    }

    fn name(&self) -> Option<&'static str> {
        match *self {
            PSM::SDP => Some("SDP"),
            PSM::RFCOMM => Some("RFCOMM"),
            PSM::TCS_BIN => Some("TCS-BIN"),
            PSM::TCS_BIN_CORDLESS => Some("TCS-BIN-CORDLESS"),
            PSM::BNEP => Some("BNEP"),
            PSM::HID_CONTROL => Some("HID-Control"),
            PSM::HID_INTERRUPT => Some("HID-Interrupt"),
            PSM::AVCTP => Some("AVCTP"),
            PSM::AVDTP => Some("AVDTP"),
            _ => None,
        }
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:04X})", name, self.0),
            None if self.is_dynamic() => write!(f, "Dynamic PSM (0x{:04X})", self.0),
            None => write!(f, "PSM (0x{:04X})", self.0),
        }
    }
}

impl From<PSM> for u16 {
    fn from(psm: PSM) -> Self {
        psm.0
    }
}
