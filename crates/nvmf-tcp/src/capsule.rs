//! Fabrics capsule payloads and completion views
//!
//! Connect data, controller properties, host identity and the per-command
//! interpretation of Fabrics completions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use crate::command::{FabricsType, NvmeCompletion};
use crate::error::{NvmeStatus, NvmeTcpError, NvmeTcpResult};

/// Well-known NQN of a discovery controller
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Size of an NQN field in Connect data
pub const NQN_FIELD_SIZE: usize = 256;

/// Longest NQN allowed by NVMe
pub const MAX_NQN_LEN: usize = 223;

/// Controller ID requesting dynamic allocation
pub const DYNAMIC_CNTLID: u16 = 0xFFFF;

/// Validate an NVMe Qualified Name
///
/// Accepts `nqn.yyyy-mm.<reverse domain>[:<string>]` names and the UUID form,
/// up to 223 bytes.
pub fn validate_nqn(nqn: &str) -> NvmeTcpResult<()> {
    if nqn.is_empty() || nqn.len() > MAX_NQN_LEN {
        return Err(NvmeTcpError::InvalidArgument(format!(
            "NQN length {} outside 1..={}",
            nqn.len(),
            MAX_NQN_LEN
        )));
    }
    if nqn.bytes().any(|b| b == 0) {
        return Err(NvmeTcpError::InvalidArgument(
            "NQN contains a NUL byte".to_string(),
        ));
    }

    let rest = nqn
        .strip_prefix("nqn.")
        .ok_or_else(|| NvmeTcpError::InvalidArgument(format!("NQN {:?} lacks nqn. prefix", nqn)))?;
    let date = rest.get(..7).unwrap_or("");
    let date_ok = date.len() == 7
        && date.as_bytes()[4] == b'-'
        && date
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_digit());
    if !date_ok || rest.as_bytes().get(7) != Some(&b'.') {
        return Err(NvmeTcpError::InvalidArgument(format!(
            "NQN {:?} lacks a yyyy-mm. date",
            nqn
        )));
    }
    Ok(())
}

/// Copy an NQN into a 256-byte null-padded field
fn nqn_field(name: &str, nqn: &str) -> NvmeTcpResult<[u8; NQN_FIELD_SIZE]> {
    let bytes = nqn.as_bytes();
    if bytes.len() >= NQN_FIELD_SIZE {
        return Err(NvmeTcpError::InvalidArgument(format!(
            "{} is {} bytes, must be shorter than {}",
            name,
            bytes.len(),
            NQN_FIELD_SIZE
        )));
    }
    if bytes.contains(&0) {
        return Err(NvmeTcpError::InvalidArgument(format!(
            "{} contains a NUL byte",
            name
        )));
    }
    let mut field = [0u8; NQN_FIELD_SIZE];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

fn field_str(field: &[u8]) -> &str {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..len]).unwrap_or("")
}

/// Host identifier and host NQN presented in Connect commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    /// Host Identifier
    pub hostid: Uuid,
    /// Host NQN
    pub hostnqn: String,
}

impl HostIdentity {
    /// Create an identity from an existing host id and NQN
    pub fn new(hostid: Uuid, hostnqn: impl Into<String>) -> NvmeTcpResult<Self> {
        let hostnqn = hostnqn.into();
        validate_nqn(&hostnqn)?;
        Ok(Self { hostid, hostnqn })
    }

    /// Generate a random host id with the matching UUID-form NQN
    pub fn generate() -> Self {
        let hostid = Uuid::new_v4();
        Self {
            hostnqn: format!("nqn.2014-08.org.nvmexpress:uuid:{}", hostid),
            hostid,
        }
    }
}

/// Fabrics Connect command data (1024 bytes)
#[derive(Clone)]
pub struct ConnectData {
    /// Host Identifier (16 bytes)
    pub hostid: [u8; 16],
    /// Controller ID (0xFFFF for dynamic allocation)
    pub cntlid: u16,
    /// Subsystem NQN (256 bytes, null-terminated)
    pub subnqn: [u8; NQN_FIELD_SIZE],
    /// Host NQN (256 bytes, null-terminated)
    pub hostnqn: [u8; NQN_FIELD_SIZE],
}

impl ConnectData {
    /// Size of connect data
    pub const SIZE: usize = 1024;

    /// Create connect data; fails if either NQN does not fit its field
    pub fn new(hostid: [u8; 16], cntlid: u16, subnqn: &str, hostnqn: &str) -> NvmeTcpResult<Self> {
        Ok(Self {
            hostid,
            cntlid,
            subnqn: nqn_field("subnqn", subnqn)?,
            hostnqn: nqn_field("hostnqn", hostnqn)?,
        })
    }

    /// Connect data for `host` attaching to `subnqn` with a dynamic controller id
    pub fn for_host(host: &HostIdentity, subnqn: &str) -> NvmeTcpResult<Self> {
        Self::new(*host.hostid.as_bytes(), DYNAMIC_CNTLID, subnqn, &host.hostnqn)
    }

    /// Get subsystem NQN as string
    pub fn subnqn_str(&self) -> &str {
        field_str(&self.subnqn)
    }

    /// Get host NQN as string
    pub fn hostnqn_str(&self) -> &str {
        field_str(&self.hostnqn)
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> NvmeTcpResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "Connect data too short: {} bytes",
                buf.len()
            )));
        }

        let mut hostid = [0u8; 16];
        buf.copy_to_slice(&mut hostid);
        let cntlid = buf.get_u16_le();
        buf.advance(238);

        let mut subnqn = [0u8; NQN_FIELD_SIZE];
        buf.copy_to_slice(&mut subnqn);

        let mut hostnqn = [0u8; NQN_FIELD_SIZE];
        buf.copy_to_slice(&mut hostnqn);

        Ok(Self {
            hostid,
            cntlid,
            subnqn,
            hostnqn,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&self.hostid);
        buf.put_u16_le(self.cntlid);
        buf.put_bytes(0, 238);
        buf.put_slice(&self.subnqn);
        buf.put_slice(&self.hostnqn);
        buf.put_bytes(0, 256);
        buf.freeze()
    }
}

impl fmt::Debug for ConnectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectData")
            .field("hostid", &Uuid::from_bytes(self.hostid))
            .field("cntlid", &format_args!("{:#06x}", self.cntlid))
            .field("subnqn", &self.subnqn_str())
            .field("hostnqn", &self.hostnqn_str())
            .finish()
    }
}

/// Controller properties reachable with Property Get/Set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PropertyOffset {
    /// Controller Capabilities (8 bytes)
    Cap = 0x00,
    /// Version (4 bytes)
    Vs = 0x08,
    /// Controller Configuration (4 bytes)
    Cc = 0x14,
    /// Controller Status (4 bytes)
    Csts = 0x1C,
    /// NVM Subsystem Reset (4 bytes)
    Nssr = 0x20,
}

impl PropertyOffset {
    /// Create from raw offset
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0x00 => Some(Self::Cap),
            0x08 => Some(Self::Vs),
            0x14 => Some(Self::Cc),
            0x1C => Some(Self::Csts),
            0x20 => Some(Self::Nssr),
            _ => None,
        }
    }

    /// Get the size of this property
    pub fn size(&self) -> usize {
        match self {
            Self::Cap => 8,
            Self::Vs | Self::Cc | Self::Csts | Self::Nssr => 4,
        }
    }

    /// Whether Property Get/Set must use the 8-byte attribute
    pub fn is_eight_bytes(&self) -> bool {
        self.size() == 8
    }
}

/// Controller Capabilities Register (CAP)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerCapabilities {
    /// Maximum Queue Entries Supported, 0's based (0-15)
    pub mqes: u16,
    /// Contiguous Queues Required (16)
    pub cqr: bool,
    /// Timeout (24-31) in 500ms units
    pub to: u8,
    /// Doorbell Stride (32-35)
    pub dstrd: u8,
    /// NVM Subsystem Reset Supported (36)
    pub nssrs: bool,
    /// Command Sets Supported (37-44)
    pub css: u8,
    /// Memory Page Size Minimum (48-51)
    pub mpsmin: u8,
    /// Memory Page Size Maximum (52-55)
    pub mpsmax: u8,
}

impl ControllerCapabilities {
    /// Parse from the 64-bit register value
    pub fn from_u64(val: u64) -> Self {
        Self {
            mqes: (val & 0xFFFF) as u16,
            cqr: (val >> 16) & 0x01 != 0,
            to: ((val >> 24) & 0xFF) as u8,
            dstrd: ((val >> 32) & 0x0F) as u8,
            nssrs: (val >> 36) & 0x01 != 0,
            css: ((val >> 37) & 0xFF) as u8,
            mpsmin: ((val >> 48) & 0x0F) as u8,
            mpsmax: ((val >> 52) & 0x0F) as u8,
        }
    }

    /// Maximum queue entries (1's based)
    pub fn max_queue_entries(&self) -> u32 {
        self.mqes as u32 + 1
    }

    /// Worst-case time to become ready, in milliseconds
    pub fn timeout_ms(&self) -> u32 {
        self.to as u32 * 500
    }
}

/// Version Register (VS)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NvmeVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u8,
    /// Tertiary version
    pub tertiary: u8,
}

impl NvmeVersion {
    /// Parse from the 32-bit register value
    pub fn from_u32(val: u32) -> Self {
        Self {
            major: (val >> 16) as u16,
            minor: ((val >> 8) & 0xFF) as u8,
            tertiary: (val & 0xFF) as u8,
        }
    }
}

impl fmt::Display for NvmeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.tertiary)
    }
}

/// Command-specific result of a Fabrics completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FabricsResult {
    /// Connect: allocated controller id and authentication requirements
    Connect {
        /// Controller ID
        cntlid: u16,
        /// Authentication requirements (DW0 bits 31:16)
        authreq: u16,
    },
    /// Property Get: property value
    PropertyGet(u64),
    /// Any other command: raw DW0
    Generic(u32),
}

/// Completion of a Fabrics command interpreted by command type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FabricsCompletion {
    /// Command identifier
    pub cid: u16,
    /// Completion status
    pub status: NvmeStatus,
    /// Phase tag
    pub phase: bool,
    /// Command-specific result
    pub result: FabricsResult,
}

impl FabricsCompletion {
    /// Interpret `cqe` as the completion of a command of type `fctype`
    pub fn new(fctype: FabricsType, cqe: &NvmeCompletion) -> Self {
        let result = match fctype {
            FabricsType::Connect => FabricsResult::Connect {
                cntlid: (cqe.result & 0xFFFF) as u16,
                authreq: (cqe.result >> 16) as u16,
            },
            FabricsType::PropertyGet => FabricsResult::PropertyGet(cqe.result_u64()),
            _ => FabricsResult::Generic(cqe.result),
        };
        Self {
            cid: cqe.cid,
            status: cqe.status(),
            phase: cqe.phase(),
            result,
        }
    }

    /// Check if the command succeeded
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Controller id from a Connect completion
    pub fn cntlid(&self) -> Option<u16> {
        match self.result {
            FabricsResult::Connect { cntlid, .. } => Some(cntlid),
            _ => None,
        }
    }

    /// Whether a Connect completion requests in-band authentication
    pub fn authentication_required(&self) -> bool {
        // ATR (bit 17) and ASCR (bit 18) of DW0
        matches!(self.result, FabricsResult::Connect { authreq, .. } if authreq & 0x0006 != 0)
    }

    /// Value from a Property Get completion
    pub fn property_value(&self) -> Option<u64> {
        match self.result {
            FabricsResult::PropertyGet(value) => Some(value),
            _ => None,
        }
    }
}
