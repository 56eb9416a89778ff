//! Error types and result definitions for the broadlink-local crate.
//! Includes the numeric error table and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a hub device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadlinkError {
    /// Standard IO error (socket bind, send, receive)
    #[error("IO error: {0}")]
    Io(String),

    /// No reply arrived within the request budget
    #[error("Timeout waiting for device")]
    Timeout,

    /// Packet checksum did not match its contents (corrupted or foreign packet)
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Decrypted payload failed its sanity check or the device rejected the key
    #[error("Authentication failed")]
    AuthFailure,

    /// Operation attempted on a session that was already torn down
    #[error("Session closed")]
    SessionClosed,

    /// Device could not be reached after the retry budget was spent
    #[error("Device unreachable")]
    Unreachable,

    /// Packet was too short or did not carry the vendor magic
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The device answered with a non-zero error code
    #[error("Device reported error 0x{0:04X}")]
    DeviceError(u16),

    /// The device family has no such command
    #[error("{family} devices do not support {operation}")]
    Unsupported {
        family: &'static str,
        operation: &'static str,
    },

    /// Caller supplied an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Listing was requested before any device was discovered
    #[error("No device discovered")]
    NothingDiscovered,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A specialized Result type for hub operations.
pub type Result<T> = std::result::Result<T, BroadlinkError>;

impl From<std::io::Error> for BroadlinkError {
    fn from(err: std::io::Error) -> Self {
        BroadlinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BroadlinkError {
    fn from(err: serde_json::Error) -> Self {
        BroadlinkError::Config(err.to_string())
    }
}

impl BroadlinkError {
    pub fn code(&self) -> u32 {
        match self {
            BroadlinkError::Io(_) => ERR_CONNECT,
            BroadlinkError::Timeout => ERR_TIMEOUT,
            BroadlinkError::ChecksumMismatch => ERR_CHECKSUM,
            BroadlinkError::AuthFailure => ERR_AUTH,
            BroadlinkError::SessionClosed => ERR_CLOSED,
            BroadlinkError::Unreachable => ERR_OFFLINE,
            BroadlinkError::InvalidPacket(_) => ERR_PAYLOAD,
            BroadlinkError::DeviceError(_) => ERR_DEVICE,
            BroadlinkError::Unsupported { .. } => ERR_FUNCTION,
            BroadlinkError::InvalidArgument(_) => ERR_RANGE,
            BroadlinkError::NothingDiscovered => ERR_NOT_FOUND,
            BroadlinkError::Config(_) => ERR_CONFIG,
        }
    }

    /// Whether this error should be surfaced to the host as a session notification.
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            BroadlinkError::Unreachable
                | BroadlinkError::AuthFailure
                | BroadlinkError::ChecksumMismatch
        )
    }

    /// Maps an error code found in a reply header to the error taxonomy.
    pub(crate) fn from_device_code(code: u16) -> Self {
        match code {
            DEVICE_ERR_AUTH | DEVICE_ERR_KEY_EXPIRED => BroadlinkError::AuthFailure,
            DEVICE_ERR_OFFLINE => BroadlinkError::Unreachable,
            other => BroadlinkError::DeviceError(other),
        }
    }
}

/// Device-side code for a rejected authentication
pub(crate) const DEVICE_ERR_AUTH: u16 = 0xFFFF;
/// Device-side code for an offline sub-device
pub(crate) const DEVICE_ERR_OFFLINE: u16 = 0xFFFC;
/// Device-side code for an expired control key
pub(crate) const DEVICE_ERR_KEY_EXPIRED: u16 = 0xFFF9;

define_error_codes! {
    ERR_SUCCESS = 0 => "Command Successful",
    ERR_CONNECT = 901 => "Network Error: Socket Failure",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Packet from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_CHECKSUM = 908 => "Packet Checksum Mismatch",
    ERR_AUTH = 909 => "Authentication Failed",
    ERR_CLOSED = 910 => "Session Closed",
    ERR_DEVICE = 911 => "Device Reported an Error",
    ERR_NOT_FOUND = 912 => "No Device Discovered",
    ERR_CONFIG = 913 => "Invalid Configuration",
}
