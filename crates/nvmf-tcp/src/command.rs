//! NVMe submission and completion queue entries
//!
//! This module defines the 64-byte SQE for Fabrics and raw NVMe commands, the
//! SGL descriptors NVMe/TCP uses and the 16-byte CQE.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::{NvmeStatus, NvmeTcpError, NvmeTcpResult};
use crate::pdu::{CQE_SIZE, SQE_SIZE};

/// Opcode shared by every Fabrics command
pub const FABRICS_OPCODE: u8 = 0x7F;

/// PSDT value selecting SGLs for the data pointer (bits 7:6 of byte 1)
const PSDT_SGL: u8 = 0x40;

// Offsets of the SQE within a CapsuleCmd PDU, cited as FEI
const CAPSULE_SQE_OFFSET: u32 = 8;

/// Fabrics command types (fctype)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FabricsType {
    /// Property Set
    PropertySet = 0x00,
    /// Connect
    Connect = 0x01,
    /// Property Get
    PropertyGet = 0x04,
    /// Authentication Send
    AuthenticationSend = 0x05,
    /// Authentication Receive
    AuthenticationReceive = 0x06,
    /// Disconnect
    Disconnect = 0x08,
}

impl FabricsType {
    /// Create from raw type
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::PropertySet),
            0x01 => Some(Self::Connect),
            0x04 => Some(Self::PropertyGet),
            0x05 => Some(Self::AuthenticationSend),
            0x06 => Some(Self::AuthenticationReceive),
            0x08 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// NVMe I/O command opcodes used with the raw command path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOpcode {
    /// Flush
    Flush = 0x00,
    /// Write
    Write = 0x01,
    /// Read
    Read = 0x02,
}

/// SGL Descriptor (16 bytes)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SglDescriptor {
    /// Address, or offset into in-capsule data
    pub address: u64,
    /// Length in bytes
    pub length: u32,
    /// Descriptor type (bits 7:4) and subtype (bits 3:0)
    pub identifier: u8,
}

impl SglDescriptor {
    /// Size of an SGL descriptor
    pub const SIZE: usize = 16;

    /// Data Block, Offset subtype: data follows the SQE in the capsule
    pub const IN_CAPSULE: u8 = 0x01;

    /// Transport SGL Data Block, transport specific subtype: data moves by R2T/C2HData
    pub const TRANSPORT_DATA_BLOCK: u8 = 0x5A;

    /// Descriptor for `length` bytes of in-capsule data
    pub fn in_capsule(length: u32) -> Self {
        Self {
            address: 0,
            length,
            identifier: Self::IN_CAPSULE,
        }
    }

    /// Descriptor for `length` bytes moved by data PDUs
    pub fn transport(length: u32) -> Self {
        Self {
            address: 0,
            length,
            identifier: Self::TRANSPORT_DATA_BLOCK,
        }
    }

    /// Serialize the descriptor
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.address);
        buf.put_u32_le(self.length);
        buf.put_bytes(0, 3);
        buf.put_u8(self.identifier);
    }

    /// Parse from the first 16 bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let address = buf.get_u64_le();
        let length = buf.get_u32_le();
        buf.advance(3);
        Some(Self {
            address,
            length,
            identifier: buf.get_u8(),
        })
    }

    /// Split into the two data pointer qwords of an SQE
    fn to_dptr(self) -> [u64; 2] {
        [
            self.address,
            self.length as u64 | ((self.identifier as u64) << 56),
        ]
    }

    fn from_dptr(dptr: [u64; 2]) -> Self {
        Self {
            address: dptr[0],
            length: (dptr[1] & 0xFFFF_FFFF) as u32,
            identifier: (dptr[1] >> 56) as u8,
        }
    }
}

/// A submission queue entry the engine can send in a command capsule
pub trait SubmissionEntry {
    /// Command identifier
    fn cid(&self) -> u16;

    /// Assign the command identifier
    fn set_cid(&mut self, cid: u16);

    /// Assign the data pointer
    fn set_sgl(&mut self, sgl: SglDescriptor);

    /// Fabrics command type, `None` for non-Fabrics commands
    fn fabrics_type(&self) -> Option<FabricsType> {
        None
    }

    /// Serialize to a 64-byte SQE
    fn encode_sqe(&self) -> [u8; SQE_SIZE];
}

/// Fabrics command specific fields (bytes 40..64 of the SQE)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FabricsBody {
    /// Connect
    Connect {
        /// Record format, 0
        recfmt: u16,
        /// Queue identifier, 0 for the admin queue
        qid: u16,
        /// Submission queue size (0's based)
        sqsize: u16,
        /// Connect attributes
        cattr: u8,
        /// Keep alive timeout in milliseconds
        kato: u32,
    },
    /// Property Set
    PropertySet {
        /// Attributes: bits 2:0 size (0 = 4 bytes, 1 = 8 bytes)
        attrib: u8,
        /// Property offset
        ofst: u32,
        /// Value to write
        value: u64,
    },
    /// Property Get
    PropertyGet {
        /// Attributes: bits 2:0 size (0 = 4 bytes, 1 = 8 bytes)
        attrib: u8,
        /// Property offset
        ofst: u32,
    },
    /// Authentication Send
    AuthenticationSend {
        /// SP specific 0
        spsp0: u8,
        /// SP specific 1
        spsp1: u8,
        /// Security protocol
        secp: u8,
        /// Transfer length
        tl: u32,
    },
    /// Authentication Receive
    AuthenticationReceive {
        /// SP specific 0
        spsp0: u8,
        /// SP specific 1
        spsp1: u8,
        /// Security protocol
        secp: u8,
        /// Allocation length
        al: u32,
    },
    /// Disconnect
    Disconnect {
        /// Record format, 0
        recfmt: u16,
    },
}

impl FabricsBody {
    /// Fabrics command type of this body
    pub fn fctype(&self) -> FabricsType {
        match self {
            Self::Connect { .. } => FabricsType::Connect,
            Self::PropertySet { .. } => FabricsType::PropertySet,
            Self::PropertyGet { .. } => FabricsType::PropertyGet,
            Self::AuthenticationSend { .. } => FabricsType::AuthenticationSend,
            Self::AuthenticationReceive { .. } => FabricsType::AuthenticationReceive,
            Self::Disconnect { .. } => FabricsType::Disconnect,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        // 24 bytes: bytes 40..64 of the SQE
        match *self {
            Self::Connect {
                recfmt,
                qid,
                sqsize,
                cattr,
                kato,
            } => {
                buf.put_u16_le(recfmt);
                buf.put_u16_le(qid);
                buf.put_u16_le(sqsize);
                buf.put_u8(cattr);
                buf.put_u8(0);
                buf.put_u32_le(kato);
                buf.put_bytes(0, 12);
            }
            Self::PropertySet {
                attrib,
                ofst,
                value,
            } => {
                buf.put_u8(attrib);
                buf.put_bytes(0, 3);
                buf.put_u32_le(ofst);
                buf.put_u64_le(value);
                buf.put_bytes(0, 8);
            }
            Self::PropertyGet { attrib, ofst } => {
                buf.put_u8(attrib);
                buf.put_bytes(0, 3);
                buf.put_u32_le(ofst);
                buf.put_bytes(0, 16);
            }
            Self::AuthenticationSend {
                spsp0,
                spsp1,
                secp,
                tl: len,
            }
            | Self::AuthenticationReceive {
                spsp0,
                spsp1,
                secp,
                al: len,
            } => {
                buf.put_u8(0);
                buf.put_u8(spsp0);
                buf.put_u8(spsp1);
                buf.put_u8(secp);
                buf.put_u32_le(len);
                buf.put_bytes(0, 16);
            }
            Self::Disconnect { recfmt } => {
                buf.put_u16_le(recfmt);
                buf.put_bytes(0, 22);
            }
        }
    }

    fn decode(fctype: FabricsType, mut buf: &[u8]) -> Self {
        match fctype {
            FabricsType::Connect => {
                let recfmt = buf.get_u16_le();
                let qid = buf.get_u16_le();
                let sqsize = buf.get_u16_le();
                let cattr = buf.get_u8();
                buf.advance(1);
                Self::Connect {
                    recfmt,
                    qid,
                    sqsize,
                    cattr,
                    kato: buf.get_u32_le(),
                }
            }
            FabricsType::PropertySet => {
                let attrib = buf.get_u8();
                buf.advance(3);
                Self::PropertySet {
                    attrib,
                    ofst: buf.get_u32_le(),
                    value: buf.get_u64_le(),
                }
            }
            FabricsType::PropertyGet => {
                let attrib = buf.get_u8();
                buf.advance(3);
                Self::PropertyGet {
                    attrib,
                    ofst: buf.get_u32_le(),
                }
            }
            FabricsType::AuthenticationSend | FabricsType::AuthenticationReceive => {
                buf.advance(1);
                let spsp0 = buf.get_u8();
                let spsp1 = buf.get_u8();
                let secp = buf.get_u8();
                let len = buf.get_u32_le();
                if fctype == FabricsType::AuthenticationSend {
                    Self::AuthenticationSend {
                        spsp0,
                        spsp1,
                        secp,
                        tl: len,
                    }
                } else {
                    Self::AuthenticationReceive {
                        spsp0,
                        spsp1,
                        secp,
                        al: len,
                    }
                }
            }
            FabricsType::Disconnect => Self::Disconnect {
                recfmt: buf.get_u16_le(),
            },
        }
    }
}

/// Fabrics command SQE: 40-byte common prefix plus type-specific fields
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FabricsCommand {
    /// Fused operation and PSDT byte
    pub fuse_psdt: u8,
    /// Command identifier
    pub cid: u16,
    /// Data pointer
    pub sgl: SglDescriptor,
    /// Type-specific fields
    pub body: FabricsBody,
}

impl FabricsCommand {
    /// Size of the common prefix (opcode through SGL1)
    pub const PREFIX_SIZE: usize = 40;

    /// Create a command with the given fields, cid 0 and no data
    pub fn new(body: FabricsBody) -> Self {
        Self {
            fuse_psdt: PSDT_SGL,
            cid: 0,
            sgl: SglDescriptor::default(),
            body,
        }
    }

    /// Connect command; `sqsize` is 0's based
    pub fn connect(qid: u16, sqsize: u16, cattr: u8, kato: u32) -> Self {
        Self::new(FabricsBody::Connect {
            recfmt: 0,
            qid,
            sqsize,
            cattr,
            kato,
        })
    }

    /// Property Get command
    pub fn property_get(ofst: u32, eight_bytes: bool) -> Self {
        Self::new(FabricsBody::PropertyGet {
            attrib: eight_bytes as u8,
            ofst,
        })
    }

    /// Property Set command
    pub fn property_set(ofst: u32, eight_bytes: bool, value: u64) -> Self {
        Self::new(FabricsBody::PropertySet {
            attrib: eight_bytes as u8,
            ofst,
            value,
        })
    }

    /// Authentication Send command
    pub fn auth_send(secp: u8, spsp0: u8, spsp1: u8, tl: u32) -> Self {
        Self::new(FabricsBody::AuthenticationSend {
            spsp0,
            spsp1,
            secp,
            tl,
        })
    }

    /// Authentication Receive command
    pub fn auth_recv(secp: u8, spsp0: u8, spsp1: u8, al: u32) -> Self {
        Self::new(FabricsBody::AuthenticationReceive {
            spsp0,
            spsp1,
            secp,
            al,
        })
    }

    /// Disconnect command
    pub fn disconnect() -> Self {
        Self::new(FabricsBody::Disconnect { recfmt: 0 })
    }

    /// Fabrics command type
    pub fn fctype(&self) -> FabricsType {
        self.body.fctype()
    }

    /// Parse a Fabrics SQE
    pub fn decode(sqe: &[u8]) -> NvmeTcpResult<Self> {
        if sqe.len() < SQE_SIZE {
            return Err(NvmeTcpError::malformed(
                CAPSULE_SQE_OFFSET,
                format!("SQE too short: {} bytes", sqe.len()),
            ));
        }
        let mut buf = sqe;
        let opcode = buf.get_u8();
        if opcode != FABRICS_OPCODE {
            return Err(NvmeTcpError::malformed(
                CAPSULE_SQE_OFFSET,
                format!("Not a Fabrics command: opcode {:#04x}", opcode),
            ));
        }
        let fuse_psdt = buf.get_u8();
        let cid = buf.get_u16_le();
        let raw_type = buf.get_u8();
        let fctype = FabricsType::from_raw(raw_type).ok_or_else(|| {
            NvmeTcpError::malformed(
                CAPSULE_SQE_OFFSET + 4,
                format!("Unknown fctype: {:#04x}", raw_type),
            )
        })?;
        let sgl = SglDescriptor::decode(&sqe[24..40]).unwrap_or_default();

        Ok(Self {
            fuse_psdt,
            cid,
            sgl,
            body: FabricsBody::decode(fctype, &sqe[Self::PREFIX_SIZE..SQE_SIZE]),
        })
    }
}

impl SubmissionEntry for FabricsCommand {
    fn cid(&self) -> u16 {
        self.cid
    }

    fn set_cid(&mut self, cid: u16) {
        self.cid = cid;
    }

    fn set_sgl(&mut self, sgl: SglDescriptor) {
        self.sgl = sgl;
    }

    fn fabrics_type(&self) -> Option<FabricsType> {
        Some(self.fctype())
    }

    fn encode_sqe(&self) -> [u8; SQE_SIZE] {
        let mut sqe = [0u8; SQE_SIZE];
        let mut buf = &mut sqe[..];
        buf.put_u8(FABRICS_OPCODE);
        buf.put_u8(self.fuse_psdt);
        buf.put_u16_le(self.cid);
        buf.put_u8(self.fctype() as u8);
        buf.put_bytes(0, 19);
        self.sgl.encode(&mut buf);
        self.body.encode(&mut buf);
        sqe
    }
}

/// NVMe Submission Queue Entry (SQE) - 64 bytes
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    /// Command Dword 0 (CDW0): opcode, fuse, psdt, cid
    pub cdw0: u32,
    /// Namespace Identifier
    pub nsid: u32,
    /// Command Dword 2
    pub cdw2: u32,
    /// Command Dword 3
    pub cdw3: u32,
    /// Metadata Pointer
    pub mptr: u64,
    /// Data Pointer (SGL1)
    pub dptr: [u64; 2],
    /// Command Dword 10
    pub cdw10: u32,
    /// Command Dword 11
    pub cdw11: u32,
    /// Command Dword 12
    pub cdw12: u32,
    /// Command Dword 13
    pub cdw13: u32,
    /// Command Dword 14
    pub cdw14: u32,
    /// Command Dword 15
    pub cdw15: u32,
}

impl NvmeCommand {
    /// Size of an NVMe command in bytes
    pub const SIZE: usize = SQE_SIZE;

    /// Create a command with the given opcode, SGL data pointer selected
    pub fn new(opcode: u8) -> Self {
        Self {
            cdw0: opcode as u32 | ((PSDT_SGL as u32) << 8),
            ..Self::default()
        }
    }

    /// Read `nlb + 1` blocks starting at `slba`
    pub fn read(nsid: u32, slba: u64, nlb: u16) -> Self {
        let mut cmd = Self::new(IoOpcode::Read as u8);
        cmd.nsid = nsid;
        cmd.set_slba(slba);
        cmd.set_nlb(nlb);
        cmd
    }

    /// Write `nlb + 1` blocks starting at `slba`
    pub fn write(nsid: u32, slba: u64, nlb: u16) -> Self {
        let mut cmd = Self::new(IoOpcode::Write as u8);
        cmd.nsid = nsid;
        cmd.set_slba(slba);
        cmd.set_nlb(nlb);
        cmd
    }

    /// Get the command opcode
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    /// Get the PRP or SGL for data transfer (PSDT)
    pub fn psdt(&self) -> u8 {
        ((self.cdw0 >> 14) & 0x03) as u8
    }

    /// Get the data pointer as an SGL descriptor
    pub fn sgl(&self) -> SglDescriptor {
        SglDescriptor::from_dptr(self.dptr)
    }

    /// Get the starting LBA for read/write commands
    pub fn slba(&self) -> u64 {
        ((self.cdw11 as u64) << 32) | (self.cdw10 as u64)
    }

    /// Set the starting LBA for read/write commands
    pub fn set_slba(&mut self, lba: u64) {
        self.cdw10 = (lba & 0xFFFF_FFFF) as u32;
        self.cdw11 = (lba >> 32) as u32;
    }

    /// Get the number of logical blocks (0-based, actual count = nlb + 1)
    pub fn nlb(&self) -> u16 {
        (self.cdw12 & 0xFFFF) as u16
    }

    /// Set the number of logical blocks
    pub fn set_nlb(&mut self, nlb: u16) {
        self.cdw12 = (self.cdw12 & !0xFFFF) | (nlb as u32);
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            cdw0: buf.get_u32_le(),
            nsid: buf.get_u32_le(),
            cdw2: buf.get_u32_le(),
            cdw3: buf.get_u32_le(),
            mptr: buf.get_u64_le(),
            dptr: [buf.get_u64_le(), buf.get_u64_le()],
            cdw10: buf.get_u32_le(),
            cdw11: buf.get_u32_le(),
            cdw12: buf.get_u32_le(),
            cdw13: buf.get_u32_le(),
            cdw14: buf.get_u32_le(),
            cdw15: buf.get_u32_le(),
        })
    }
}

impl SubmissionEntry for NvmeCommand {
    fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000_FFFF) | ((cid as u32) << 16);
    }

    fn set_sgl(&mut self, sgl: SglDescriptor) {
        self.dptr = sgl.to_dptr();
    }

    fn encode_sqe(&self) -> [u8; SQE_SIZE] {
        let mut sqe = [0u8; SQE_SIZE];
        let mut buf = &mut sqe[..];
        buf.put_u32_le(self.cdw0);
        buf.put_u32_le(self.nsid);
        buf.put_u32_le(self.cdw2);
        buf.put_u32_le(self.cdw3);
        buf.put_u64_le(self.mptr);
        buf.put_u64_le(self.dptr[0]);
        buf.put_u64_le(self.dptr[1]);
        buf.put_u32_le(self.cdw10);
        buf.put_u32_le(self.cdw11);
        buf.put_u32_le(self.cdw12);
        buf.put_u32_le(self.cdw13);
        buf.put_u32_le(self.cdw14);
        buf.put_u32_le(self.cdw15);
        sqe
    }
}

impl fmt::Debug for NvmeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeCommand")
            .field("opcode", &format_args!("{:#04x}", self.opcode()))
            .field("cid", &self.cid())
            .field("nsid", &self.nsid)
            .field("cdw10", &format_args!("{:#010x}", self.cdw10))
            .field("cdw11", &format_args!("{:#010x}", self.cdw11))
            .field("cdw12", &format_args!("{:#010x}", self.cdw12))
            .finish()
    }
}

/// NVMe Completion Queue Entry (CQE) - 16 bytes
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCompletion {
    /// Command-specific result (DW0)
    pub result: u32,
    /// Command-specific result (DW1)
    pub result_hi: u32,
    /// SQ Head Pointer
    pub sq_head: u16,
    /// SQ Identifier
    pub sq_id: u16,
    /// Command Identifier
    pub cid: u16,
    /// Status Field (Phase Tag in bit 0)
    pub status: u16,
}

impl NvmeCompletion {
    /// Size of an NVMe completion in bytes
    pub const SIZE: usize = CQE_SIZE;

    /// Create a new successful completion
    pub fn success(cid: u16) -> Self {
        Self {
            cid,
            ..Self::default()
        }
    }

    /// Create an error completion
    pub fn error(cid: u16, status: NvmeStatus) -> Self {
        Self {
            cid,
            // Status code is in bits 1-15 (bit 0 is phase tag)
            status: status.to_raw() << 1,
            ..Self::default()
        }
    }

    /// Completion status without the phase tag
    pub fn status(&self) -> NvmeStatus {
        NvmeStatus::from_field(self.status)
    }

    /// Check if command completed successfully
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Get the phase tag
    pub fn phase(&self) -> bool {
        (self.status & 1) != 0
    }

    /// Set the phase tag
    pub fn set_phase(&mut self, phase: bool) {
        if phase {
            self.status |= 1;
        } else {
            self.status &= !1;
        }
    }

    /// DW0 and DW1 as one 64-bit value
    pub fn result_u64(&self) -> u64 {
        ((self.result_hi as u64) << 32) | self.result as u64
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            result: buf.get_u32_le(),
            result_hi: buf.get_u32_le(),
            sq_head: buf.get_u16_le(),
            sq_id: buf.get_u16_le(),
            cid: buf.get_u16_le(),
            status: buf.get_u16_le(),
        })
    }

    /// Serialize to a 16-byte CQE
    pub fn to_bytes(&self) -> [u8; CQE_SIZE] {
        let mut cqe = [0u8; CQE_SIZE];
        let mut buf = &mut cqe[..];
        buf.put_u32_le(self.result);
        buf.put_u32_le(self.result_hi);
        buf.put_u16_le(self.sq_head);
        buf.put_u16_le(self.sq_id);
        buf.put_u16_le(self.cid);
        buf.put_u16_le(self.status);
        cqe
    }
}

impl fmt::Debug for NvmeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeCompletion")
            .field("cid", &self.cid)
            .field("sq_id", &self.sq_id)
            .field("sq_head", &self.sq_head)
            .field("status", &format_args!("{:#06x}", self.status().to_raw()))
            .field("phase", &self.phase())
            .field("result", &format_args!("{:#010x}", self.result))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_sqe_layout() {
        let mut cmd = FabricsCommand::connect(1, 31, 0, 0);
        cmd.set_cid(7);
        let sqe = cmd.encode_sqe();
        assert_eq!(sqe.len(), 64);
        assert_eq!(FabricsCommand::PREFIX_SIZE, 40);
        assert_eq!(FabricsCommand::PREFIX_SIZE + 24, SQE_SIZE);

        assert_eq!(sqe[0], 0x7F);
        assert_eq!(u16::from_le_bytes([sqe[2], sqe[3]]), 7);
        assert_eq!(sqe[4], FabricsType::Connect as u8);
        assert_eq!(u16::from_le_bytes([sqe[40], sqe[41]]), 0); // recfmt
        assert_eq!(u16::from_le_bytes([sqe[42], sqe[43]]), 1); // qid
        assert_eq!(u16::from_le_bytes([sqe[44], sqe[45]]), 31); // sqsize

        let parsed = FabricsCommand::decode(&sqe).unwrap();
        assert_eq!(parsed.fctype(), FabricsType::Connect);
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_property_sqe_layout() {
        let cmd = FabricsCommand::property_set(0x14, false, 0x0046_0001);
        let sqe = cmd.encode_sqe();
        assert_eq!(sqe[4], 0x00);
        assert_eq!(sqe[40], 0);
        assert_eq!(u32::from_le_bytes(sqe[44..48].try_into().unwrap()), 0x14);
        assert_eq!(
            u64::from_le_bytes(sqe[48..56].try_into().unwrap()),
            0x0046_0001
        );
        assert_eq!(FabricsCommand::decode(&sqe).unwrap(), cmd);

        let cmd = FabricsCommand::property_get(0x0, true);
        let sqe = cmd.encode_sqe();
        assert_eq!(sqe[4], 0x04);
        assert_eq!(sqe[40], 1);
        assert_eq!(FabricsCommand::decode(&sqe).unwrap(), cmd);
    }

    #[test]
    fn test_auth_and_disconnect_layout() {
        let cmd = FabricsCommand::auth_send(0xE9, 0x01, 0x02, 512);
        let sqe = cmd.encode_sqe();
        assert_eq!(sqe[4], 0x05);
        assert_eq!(sqe[41], 0x01);
        assert_eq!(sqe[42], 0x02);
        assert_eq!(sqe[43], 0xE9);
        assert_eq!(u32::from_le_bytes(sqe[44..48].try_into().unwrap()), 512);
        assert_eq!(FabricsCommand::decode(&sqe).unwrap(), cmd);

        let cmd = FabricsCommand::auth_recv(0xE9, 0, 0, 1024);
        assert_eq!(FabricsCommand::decode(&cmd.encode_sqe()).unwrap(), cmd);

        let cmd = FabricsCommand::disconnect();
        let sqe = cmd.encode_sqe();
        assert_eq!(sqe[4], 0x08);
        assert_eq!(FabricsCommand::decode(&sqe).unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_non_fabrics() {
        let sqe = NvmeCommand::read(1, 0, 7).encode_sqe();
        assert!(FabricsCommand::decode(&sqe).is_err());

        let mut sqe = FabricsCommand::disconnect().encode_sqe();
        sqe[4] = 0x02;
        assert!(FabricsCommand::decode(&sqe).is_err());
        assert!(FabricsCommand::decode(&sqe[..40]).is_err());
    }

    #[test]
    fn test_sgl_descriptors() {
        let mut cmd = FabricsCommand::connect(0, 31, 0, 0);
        cmd.set_sgl(SglDescriptor::in_capsule(1024));
        let sqe = cmd.encode_sqe();
        assert_eq!(&sqe[24..32], &[0u8; 8]);
        assert_eq!(u32::from_le_bytes(sqe[32..36].try_into().unwrap()), 1024);
        assert_eq!(sqe[39], 0x01);

        let mut cmd = NvmeCommand::write(1, 0, 15);
        cmd.set_sgl(SglDescriptor::transport(8192));
        let sqe = cmd.encode_sqe();
        assert_eq!(u32::from_le_bytes(sqe[32..36].try_into().unwrap()), 8192);
        assert_eq!(sqe[39], 0x5A);
        assert_eq!(cmd.sgl(), SglDescriptor::transport(8192));
    }

    #[test]
    fn test_raw_command_serialization() {
        let mut cmd = NvmeCommand::read(1, 0x1_0000_0010, 7);
        cmd.set_cid(42);
        assert_eq!(cmd.opcode(), IoOpcode::Read as u8);
        assert_eq!(cmd.psdt(), 0x01);

        let sqe = cmd.encode_sqe();
        let parsed = NvmeCommand::from_bytes(&sqe).unwrap();
        assert_eq!(parsed, cmd);
        assert_eq!(parsed.cid(), 42);
        assert_eq!(parsed.slba(), 0x1_0000_0010);
        assert_eq!(parsed.nlb(), 7);
    }

    #[test]
    fn test_completion_serialization() {
        let mut cqe = NvmeCompletion::error(9, NvmeStatus::INVALID_FIELD);
        cqe.result = 0xDEAD_BEEF;
        cqe.result_hi = 0x1;
        cqe.set_phase(true);

        let bytes = cqe.to_bytes();
        assert_eq!(bytes.len(), 16);
        let parsed = NvmeCompletion::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, cqe);
        assert!(parsed.phase());
        assert_eq!(parsed.status(), NvmeStatus::INVALID_FIELD);
        assert_eq!(parsed.result_u64(), 0x1_DEAD_BEEF);
        assert!(!parsed.is_success());
        assert!(NvmeCompletion::success(1).is_success());
    }
}
