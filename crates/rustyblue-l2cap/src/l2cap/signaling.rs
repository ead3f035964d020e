//! L2CAP Signaling channel implementation
//!
//! This module encodes and decodes the commands carried on the signaling
//! channel (CID 0x0001): connection management, configuration, echo and
//! information requests.

use super::constants::*;
use super::packet::*;
use super::psm::PSM;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: PSM,
        source_cid: u16,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Echo Request
    EchoRequest {
        identifier: SignalId,
        data: Vec<u8>,
    },

    /// Echo Response
    EchoResponse {
        identifier: SignalId,
        data: Vec<u8>,
    },

    /// Information Request
    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    /// A command whose code this implementation does not handle
    Unknown {
        identifier: SignalId,
        code: u8,
    },
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::Unknown { identifier, .. } => *identifier,
        }
    }

    /// Whether this message answers a request (and must match a pending command)
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::CommandReject { .. }
                | Self::ConnectionResponse { .. }
                | Self::ConfigureResponse { .. }
                | Self::DisconnectionResponse { .. }
                | Self::EchoResponse { .. }
                | Self::InformationResponse { .. }
        )
    }

    /// Response code that pairs with a request code
    pub fn response_code_for(request_code: u8) -> Option<u8> {
        match request_code {
            L2CAP_CONNECTION_REQUEST => Some(L2CAP_CONNECTION_RESPONSE),
            L2CAP_CONFIGURE_REQUEST => Some(L2CAP_CONFIGURE_RESPONSE),
            L2CAP_DISCONNECTION_REQUEST => Some(L2CAP_DISCONNECTION_RESPONSE),
            L2CAP_ECHO_REQUEST => Some(L2CAP_ECHO_RESPONSE),
            L2CAP_INFORMATION_REQUEST => Some(L2CAP_INFORMATION_RESPONSE),
            _ => None,
        }
    }

    /// Parse configuration options from raw bytes
    ///
    /// Unknown options are skipped; the hint bit is ignored.
    fn parse_config_options(data: &[u8]) -> L2capResult<ConfigOptions> {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset + 2 <= data.len() {
            let option_type = data[offset] & !L2CAP_CONF_HINT_BIT;
            let option_length = data[offset + 1] as usize;

            if offset + 2 + option_length > data.len() {
                return Err(L2capError::InvalidParameter(format!(
                    "Configuration option 0x{:02X} truncated",
                    option_type
                )));
            }

            let option_data = &data[offset + 2..offset + 2 + option_length];
            let mut cursor = Cursor::new(option_data);

            match option_type {
                L2CAP_CONF_MTU if option_length == 2 => {
                    options.mtu = Some(read_u16(&mut cursor, "MTU")?);
                }
                L2CAP_CONF_FLUSH_TIMEOUT if option_length == 2 => {
                    options.flush_timeout = Some(read_u16(&mut cursor, "flush timeout")?);
                }
                L2CAP_CONF_QOS if option_length == 22 => {
                    // flags octet, then service type
                    let _flags = option_data[0];
                    let service_type = option_data[1];
                    let mut cursor = Cursor::new(&option_data[2..]);
                    options.qos = Some(QosFlowSpec {
                        service_type,
                        token_rate: read_u32(&mut cursor, "token rate")?,
                        token_bucket_size: read_u32(&mut cursor, "token bucket size")?,
                        peak_bandwidth: read_u32(&mut cursor, "peak bandwidth")?,
                        latency: read_u32(&mut cursor, "latency")?,
                        delay_variation: read_u32(&mut cursor, "delay variation")?,
                    });
                }
                L2CAP_CONF_MTU | L2CAP_CONF_FLUSH_TIMEOUT | L2CAP_CONF_QOS => {
                    return Err(L2capError::InvalidParameter(format!(
                        "Configuration option 0x{:02X} has bad length {}",
                        option_type, option_length
                    )));
                }
                _ => {}
            }

            offset += 2 + option_length;
        }

        Ok(options)
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
        let mut result = Vec::new();

        if let Some(mtu) = options.mtu {
            result.push(L2CAP_CONF_MTU);
            result.push(2);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            result.push(L2CAP_CONF_FLUSH_TIMEOUT);
            result.push(2);
            result.extend_from_slice(&timeout.to_le_bytes());
        }

        if let Some(qos) = options.qos {
            result.push(L2CAP_CONF_QOS);
            result.push(22);
            result.push(0); // flags
            result.push(qos.service_type);
            result.extend_from_slice(&qos.token_rate.to_le_bytes());
            result.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
            result.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
            result.extend_from_slice(&qos.latency.to_le_bytes());
            result.extend_from_slice(&qos.delay_variation.to_le_bytes());
        }

        result
    }

    /// Parse a single signaling command (header plus parameters)
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let cmd_header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("Signaling data too short".into()))?;

        let params = &data[L2CAP_COMMAND_HEADER_SIZE..];
        if params.len() < cmd_header.length as usize {
            return Err(L2capError::InvalidParameter("Command parameters too short".into()));
        }
        let params = &params[..cmd_header.length as usize];

        Self::decode(cmd_header, params)
    }

    /// Parse every command packed into one signaling frame payload.
    ///
    /// Decoding stops at the first command whose header or length is
    /// broken, since nothing after it can be located reliably.
    pub fn parse_frame(data: &[u8]) -> Vec<L2capResult<Self>> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let Some(cmd_header) = L2capCommandHeader::parse(&data[offset..]) else {
                messages.push(Err(L2capError::InvalidParameter(
                    "Truncated signaling command header".into(),
                )));
                break;
            };

            let start = offset + L2CAP_COMMAND_HEADER_SIZE;
            let end = start + cmd_header.length as usize;
            if end > data.len() {
                messages.push(Err(L2capError::InvalidParameter(format!(
                    "Signaling command 0x{:02X} truncated",
                    cmd_header.code
                ))));
                break;
            }

            messages.push(Self::decode(cmd_header, &data[start..end]));
            offset = end;
        }

        messages
    }

    fn decode(cmd_header: L2capCommandHeader, params: &[u8]) -> L2capResult<Self> {
        let identifier = cmd_header.identifier;
        let mut cursor = Cursor::new(params);

        let message = match cmd_header.code {
            L2CAP_COMMAND_REJECT => {
                let reason = read_u16(&mut cursor, "reason")?;
                Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                }
            }

            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: PSM(read_u16(&mut cursor, "PSM")?),
                source_cid: read_u16(&mut cursor, "source CID")?,
            },

            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
                result: read_u16(&mut cursor, "result")?,
                status: read_u16(&mut cursor, "status")?,
            },

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let flags = read_u16(&mut cursor, "flags")?;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    options: Self::parse_config_options(&params[4..])?,
                }
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = read_u16(&mut cursor, "source CID")?;
                let flags = read_u16(&mut cursor, "flags")?;
                let result = read_u16(&mut cursor, "result")?;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    options: Self::parse_config_options(&params[6..])?,
                }
            }

            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
            },

            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
            },

            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: read_u16(&mut cursor, "info type")?,
            },

            L2CAP_INFORMATION_RESPONSE => {
                let info_type = read_u16(&mut cursor, "info type")?;
                let result = read_u16(&mut cursor, "result")?;
                Self::InformationResponse {
                    identifier,
                    info_type,
                    result,
                    data: params[4..].to_vec(),
                }
            }

            code => Self::Unknown { identifier, code },
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let code = self.command_code();
        let identifier = self.identifier();

        let mut params = match self {
            Self::CommandReject { reason, data, .. } => {
                let mut params = Vec::with_capacity(2 + data.len());
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
                params
            }

            Self::ConnectionRequest { psm, source_cid, .. } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&psm.value().to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::ConnectionResponse { destination_cid, source_cid, result, status, .. } => {
                let mut params = Vec::with_capacity(8);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
                params
            }

            Self::ConfigureRequest { destination_cid, flags, options, .. } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(4 + option_bytes.len());
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::ConfigureResponse { source_cid, flags, result, options, .. } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(6 + option_bytes.len());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::DisconnectionRequest { destination_cid, source_cid, .. }
            | Self::DisconnectionResponse { destination_cid, source_cid, .. } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => data.clone(),

            Self::InformationRequest { info_type, .. } => info_type.to_le_bytes().to_vec(),

            Self::InformationResponse { info_type, result, data, .. } => {
                let mut params = Vec::with_capacity(4 + data.len());
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
                params
            }

            Self::Unknown { .. } => Vec::new(),
        };

        let cmd_header = L2capCommandHeader::new(code, identifier, params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);

        result
    }

    /// Create a signaling L2CAP packet from this message
    pub fn to_packet(&self) -> L2capPacket {
        L2capPacket::new(L2CAP_SIGNALING_CID, self.serialize())
    }
}
