use std::fmt;
use std::str::FromStr;

/// Bluetooth device address, stored little-endian as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Error returned when a textual address cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBdAddrError(pub String);

impl fmt::Display for ParseBdAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", self.0)
    }
}

impl std::error::Error for ParseBdAddrError {}

impl FromStr for BdAddr {
    type Err = ParseBdAddrError;

    /// Parses the usual `AA:BB:CC:DD:EE:FF` form, most significant octet first.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseBdAddrError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            let octet = hex::decode(part).map_err(|_| ParseBdAddrError(s.to_string()))?;
            if octet.len() != 1 {
                return Err(ParseBdAddrError(s.to_string()));
            }
            bytes[5 - i] = octet[0];
        }

        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
        assert_eq!("11:22:33:44:55:66".parse::<BdAddr>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("11:22:33".parse::<BdAddr>().is_err());
        assert!("11:22:33:44:55:GG".parse::<BdAddr>().is_err());
        assert!("11:22:33:44:55:666".parse::<BdAddr>().is_err());
    }
}
