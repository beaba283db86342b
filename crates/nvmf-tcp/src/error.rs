//! NVMe/TCP error types
//!
//! Error taxonomy for the initiator transport, the NVMe completion status
//! value and the Fatal Error Status codes carried by termination requests.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type for NVMe/TCP operations
pub type NvmeTcpResult<T> = Result<T, NvmeTcpError>;

/// NVMe/TCP error types
#[derive(Debug, Error)]
pub enum NvmeTcpError {
    /// Underlying stream failed to connect, send or receive
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// A PDU could not be decoded (short buffer, inconsistent lengths)
    #[error("Malformed PDU: {reason}")]
    MalformedPdu {
        /// Byte offset of the offending header field
        fei: u32,
        /// What was wrong
        reason: String,
    },

    /// Unexpected or invalid content from the peer
    #[error("Protocol error ({fes}): {message}")]
    Protocol {
        /// Status to cite in a termination request
        fes: FatalErrorStatus,
        /// Byte offset of the offending header field
        fei: u32,
        /// Description
        message: String,
    },

    /// A received data digest did not match the payload
    #[error("Data digest mismatch for cid {cid}: expected {expected:#010x}, got {actual:#010x}")]
    DataDigestMismatch {
        /// Command the data belonged to
        cid: u16,
        /// Digest computed over the received data
        expected: u32,
        /// Digest carried by the PDU
        actual: u32,
    },

    /// The controller sent a termination request
    #[error("Connection terminated by controller: fes={fes:#06x}, fei={fei:#x}")]
    TerminationNotice {
        /// Raw Fatal Error Status
        fes: u16,
        /// Fatal Error Information
        fei: u32,
    },

    /// A data PDU or R2T addressed bytes outside the command's transfer
    #[error(
        "Data transfer out of range: cid={cid}, offset={offset}, length={length}, limit={limit}"
    )]
    DataTransferOutOfRange {
        /// Command identifier
        cid: u16,
        /// Offset carried by the PDU
        offset: u32,
        /// Length carried by the PDU
        length: u32,
        /// Transfer length requested by the command
        limit: u32,
        /// Byte offset of the offending header field
        fei: u32,
    },

    /// Scratch buffer allocation failed
    #[error("Resource error: {0}")]
    Resource(String),

    /// Operation not permitted in the current connection state
    #[error("Invalid state: expected {expected}, connection is {actual}")]
    InvalidState {
        /// State the operation requires
        expected: ConnectionState,
        /// State the connection is in
        actual: ConnectionState,
    },

    /// Caller supplied an invalid value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection was closed and cannot be reused
    #[error("Connection closed")]
    ConnectionClosed,

    /// A command completed with a non-zero NVMe status
    #[error("Command {cid} failed: {status}")]
    CommandFailed {
        /// Command identifier
        cid: u16,
        /// Completion status
        status: NvmeStatus,
    },
}

impl NvmeTcpError {
    /// Build a protocol error
    pub fn protocol(fes: FatalErrorStatus, fei: u32, message: impl Into<String>) -> Self {
        Self::Protocol {
            fes,
            fei,
            message: message.into(),
        }
    }

    /// Build a PDU sequence error (PDU not permitted at this point)
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::protocol(FatalErrorStatus::PduSequenceError, 0, message)
    }

    /// Build a malformed PDU error
    pub fn malformed(fei: u32, reason: impl Into<String>) -> Self {
        Self::MalformedPdu {
            fei,
            reason: reason.into(),
        }
    }

    /// Status and field offset the host should cite in an H2CTermReq
    ///
    /// Returns `None` for errors that are not peer protocol violations.
    pub fn termination_cause(&self) -> Option<(FatalErrorStatus, u32)> {
        match self {
            Self::Protocol { fes, fei, .. } => Some((*fes, *fei)),
            Self::MalformedPdu { fei, .. } => Some((FatalErrorStatus::InvalidPduHeaderField, *fei)),
            Self::DataTransferOutOfRange { fei, .. } => {
                Some((FatalErrorStatus::DataTransferOutOfRange, *fei))
            }
            _ => None,
        }
    }

    /// Check whether the error ends the connection
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument(_) | Self::CommandFailed { .. } | Self::InvalidState { .. }
        )
    }
}

/// Fatal Error Status values of H2CTermReq/C2HTermReq PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FatalErrorStatus {
    /// Invalid PDU Header Field
    InvalidPduHeaderField = 0x01,
    /// PDU Sequence Error
    PduSequenceError = 0x02,
    /// Header Digest Error
    HeaderDigestError = 0x03,
    /// Data Transfer Out of Range
    DataTransferOutOfRange = 0x04,
    /// R2T Limit Exceeded
    R2tLimitExceeded = 0x05,
    /// Unsupported parameter
    UnsupportedParameters = 0x06,
}

impl FatalErrorStatus {
    /// Create from raw value
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::InvalidPduHeaderField),
            0x02 => Some(Self::PduSequenceError),
            0x03 => Some(Self::HeaderDigestError),
            0x04 => Some(Self::DataTransferOutOfRange),
            0x05 => Some(Self::R2tLimitExceeded),
            0x06 => Some(Self::UnsupportedParameters),
            _ => None,
        }
    }

    /// Convert to raw value
    pub fn to_raw(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for FatalErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidPduHeaderField => "invalid PDU header field",
            Self::PduSequenceError => "PDU sequence error",
            Self::HeaderDigestError => "header digest error",
            Self::DataTransferOutOfRange => "data transfer out of range",
            Self::R2tLimitExceeded => "R2T limit exceeded",
            Self::UnsupportedParameters => "unsupported parameters",
        };
        f.write_str(name)
    }
}

/// NVMe completion status (status field without the phase tag)
///
/// Bits 0-7 hold the Status Code, bits 8-10 the Status Code Type, bits 11-12
/// the Command Retry Delay, bit 13 More and bit 14 Do Not Retry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus(u16);

impl NvmeStatus {
    /// Successful completion
    pub const SUCCESS: Self = Self(0x0000);
    /// Invalid command opcode
    pub const INVALID_OPCODE: Self = Self(0x0001);
    /// Invalid field in command
    pub const INVALID_FIELD: Self = Self(0x0002);
    /// Command ID conflict
    pub const COMMAND_ID_CONFLICT: Self = Self(0x0003);
    /// Data transfer error
    pub const DATA_TRANSFER_ERROR: Self = Self(0x0004);
    /// Internal error
    pub const INTERNAL_ERROR: Self = Self(0x0006);
    /// Command sequence error
    pub const COMMAND_SEQUENCE_ERROR: Self = Self(0x000C);
    /// SGL descriptor type invalid
    pub const SGL_TYPE_INVALID: Self = Self(0x0011);
    /// Keep alive timer expired
    pub const KEEP_ALIVE_EXPIRED: Self = Self(0x0019);
    /// Transient transport error
    pub const TRANSIENT_TRANSPORT_ERROR: Self = Self(0x0022);
    /// Connect: incompatible format
    pub const INCOMPATIBLE_FORMAT: Self = Self(0x0180);
    /// Connect: controller busy
    pub const CONTROLLER_BUSY: Self = Self(0x0181);
    /// Connect: invalid parameters
    pub const CONNECT_INVALID_PARAMS: Self = Self(0x0182);
    /// Connect: restart discovery
    pub const CONNECT_RESTART_DISCOVERY: Self = Self(0x0183);
    /// Connect: invalid host
    pub const CONNECT_INVALID_HOST: Self = Self(0x0184);
    /// Connect: invalid queue type
    pub const INVALID_QUEUE_TYPE: Self = Self(0x0185);
    /// Discover restart
    pub const DISCOVER_RESTART: Self = Self(0x0190);
    /// Authentication required
    pub const AUTH_REQUIRED: Self = Self(0x0191);

    /// Create from the raw completion status field (phase tag in bit 0)
    pub fn from_field(field: u16) -> Self {
        Self(field >> 1)
    }

    /// Create from a status value that excludes the phase tag
    pub fn from_raw(value: u16) -> Self {
        Self(value & 0x7FFF)
    }

    /// Raw status value without the phase tag
    pub fn to_raw(self) -> u16 {
        self.0
    }

    /// Status Code
    pub fn code(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Status Code Type
    pub fn code_type(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    /// More information available in the Error Information log
    pub fn more(self) -> bool {
        (self.0 >> 13) & 0x01 != 0
    }

    /// Do Not Retry
    pub fn dnr(self) -> bool {
        (self.0 >> 14) & 0x01 != 0
    }

    /// Check if status indicates success
    pub fn is_success(self) -> bool {
        self.code() == 0 && self.code_type() == 0
    }

    /// Check if status is a Fabrics command specific error
    pub fn is_fabric_error(self) -> bool {
        self.code_type() == 0x01 && self.code() >= 0x80
    }

    fn description(self) -> &'static str {
        match Self::from_raw(self.0 & 0x07FF) {
            Self::SUCCESS => "success",
            Self::INVALID_OPCODE => "invalid opcode",
            Self::INVALID_FIELD => "invalid field in command",
            Self::COMMAND_ID_CONFLICT => "command id conflict",
            Self::DATA_TRANSFER_ERROR => "data transfer error",
            Self::INTERNAL_ERROR => "internal error",
            Self::COMMAND_SEQUENCE_ERROR => "command sequence error",
            Self::SGL_TYPE_INVALID => "SGL descriptor type invalid",
            Self::KEEP_ALIVE_EXPIRED => "keep alive timer expired",
            Self::TRANSIENT_TRANSPORT_ERROR => "transient transport error",
            Self::INCOMPATIBLE_FORMAT => "incompatible format",
            Self::CONTROLLER_BUSY => "controller busy",
            Self::CONNECT_INVALID_PARAMS => "connect invalid parameters",
            Self::CONNECT_RESTART_DISCOVERY => "connect restart discovery",
            Self::CONNECT_INVALID_HOST => "connect invalid host",
            Self::INVALID_QUEUE_TYPE => "invalid queue type",
            Self::DISCOVER_RESTART => "discover restart",
            Self::AUTH_REQUIRED => "authentication required",
            _ => "unknown status",
        }
    }
}

impl fmt::Debug for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeStatus")
            .field("sct", &self.code_type())
            .field("sc", &format_args!("{:#04x}", self.code()))
            .field("dnr", &self.dnr())
            .finish()
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (sct={:#x}, sc={:#04x}{})",
            self.description(),
            self.code_type(),
            self.code(),
            if self.dnr() { ", dnr" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvme_status_conversion() {
        // phase tag set, status code 0x82 with code type 1
        let status = NvmeStatus::from_field((0x0182 << 1) | 1);
        assert_eq!(status, NvmeStatus::CONNECT_INVALID_PARAMS);
        assert_eq!(status.code(), 0x82);
        assert_eq!(status.code_type(), 0x01);
        assert!(status.is_fabric_error());
        assert!(!status.is_success());

        assert!(NvmeStatus::from_field(0x0001).is_success());
        assert!(!NvmeStatus::SUCCESS.is_fabric_error());
    }

    #[test]
    fn test_nvme_status_dnr() {
        let status = NvmeStatus::from_raw(0x4002);
        assert!(status.dnr());
        assert_eq!(status.code(), 0x02);
        assert!(status.to_string().contains("invalid field"));
        assert!(status.to_string().contains("dnr"));
    }

    #[test]
    fn test_fatal_error_status() {
        for raw in 1..=6u16 {
            let fes = FatalErrorStatus::from_raw(raw).unwrap();
            assert_eq!(fes.to_raw(), raw);
        }
        assert!(FatalErrorStatus::from_raw(0).is_none());
        assert!(FatalErrorStatus::from_raw(7).is_none());
    }

    #[test]
    fn test_termination_cause() {
        let err = NvmeTcpError::DataTransferOutOfRange {
            cid: 3,
            offset: 4096,
            length: 4096,
            limit: 4096,
            fei: 12,
        };
        assert_eq!(
            err.termination_cause(),
            Some((FatalErrorStatus::DataTransferOutOfRange, 12))
        );

        let err = NvmeTcpError::sequence("unexpected ICResp");
        assert_eq!(
            err.termination_cause(),
            Some((FatalErrorStatus::PduSequenceError, 0))
        );

        assert!(NvmeTcpError::ConnectionClosed.termination_cause().is_none());
        assert!(!NvmeTcpError::InvalidArgument("nqn".into()).is_fatal());
    }
}
