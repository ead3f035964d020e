//! L2CAP protocol constants
//!
//! Values from the Bluetooth Core Specification, Vol 3, Part A.

use std::time::Duration;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;

/// First CID handed out dynamically; everything below is reserved.
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;

// Signaling command identifiers. Zero is never a valid identifier.
pub const L2CAP_NULL_IDENT: u8 = 0x00;
pub const L2CAP_FIRST_IDENT: u8 = 0x01;
pub const L2CAP_LAST_IDENT: u8 = 0xFF;

pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;

/// Largest echo payload that still fits one signaling frame
pub const L2CAP_MAX_ECHO_DATA: usize =
    u16::MAX as usize - L2CAP_COMMAND_HEADER_SIZE;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_RESULT_PENDING: u16 = 0x0001;
pub const L2CAP_RESULT_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_RESULT_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_RESULT_INVALID_SOURCE_CID: u16 = 0x0006;
pub const L2CAP_RESULT_SOURCE_CID_IN_USE: u16 = 0x0007;

// Connection response status (only meaningful with PENDING)
pub const L2CAP_STATUS_NO_INFO: u16 = 0x0000;
pub const L2CAP_STATUS_AUTHORIZATION_PENDING: u16 = 0x0002;

// Configure response results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CONF_REJECTED: u16 = 0x0002;
pub const L2CAP_CONF_UNKNOWN_OPTIONS: u16 = 0x0003;

/// Continuation flag in configure request/response
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_HINT_BIT: u8 = 0x80;

// Information request types
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;

// Information response results
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

/// Fixed channels we serve: signaling and connectionless
pub const L2CAP_FIXED_CHANNELS_MASK: u64 =
    (1 << L2CAP_SIGNALING_CID) | (1 << L2CAP_CONNECTIONLESS_CID);

// MTU and timeout defaults
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;
pub const L2CAP_DEFAULT_LINK_TIMEOUT: u16 = 0xFFFF;

pub const L2CAP_RTX_TIMEOUT: Duration = Duration::from_secs(60);
pub const L2CAP_ERTX_TIMEOUT: Duration = Duration::from_secs(300);
pub const L2CAP_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const L2CAP_MAX_RETRANSMITS: u8 = 1;
/// Upper bound on any configured timeout
pub const L2CAP_MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// QoS service types
pub const L2CAP_QOS_NO_TRAFFIC: u8 = 0x00;
pub const L2CAP_QOS_BEST_EFFORT: u8 = 0x01;
pub const L2CAP_QOS_GUARANTEED: u8 = 0x02;

// Link-level reason codes reported in close reasons
pub const LINK_REASON_TIMEOUT: u8 = 0x08;
pub const LINK_REASON_LOCAL_HOST: u8 = 0x16;
