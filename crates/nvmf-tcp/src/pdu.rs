//! NVMe/TCP PDU codec
//!
//! Every PDU starts with the 8-byte common header followed by a fixed,
//! type-specific header. Data-bearing PDUs then carry an optional header
//! digest, padding up to the PDU data offset, the data itself and an optional
//! data digest:
//!
//! ```text
//! +----+-------------+-------+-----+------------+-------+
//! | CH | PSH         | HDGST | PAD | DATA       | DDGST |
//! +----+-------------+-------+-----+------------+-------+
//! 0    8             hlen          pdo          plen
//! ```
//!
//! Encoders write into any `BufMut` and always fill `hlen`, `pdo` and `plen`
//! consistently with what they emit. Decoders validate lengths before reading
//! a field and hand back borrowed views of the variable segments.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::digest::{crc32c, crc32c_segments, DigestOptions, DIGEST_SIZE};
use crate::error::{FatalErrorStatus, NvmeTcpError, NvmeTcpResult};

/// Size of a submission queue entry carried by a CapsuleCmd PDU
pub const SQE_SIZE: usize = 64;

/// Size of a completion queue entry carried by a CapsuleResp PDU
pub const CQE_SIZE: usize = 16;

/// Maximum error data carried by a termination request
pub const MAX_TERM_REQ_DATA: usize = 152;

/// Highest valid HPDA/CPDA value (0's based dwords)
pub const MAX_PDA: u8 = 31;

// Field offsets within data/R2T PDUs, cited as FEI
const FEI_FLAGS: u32 = 1;
const FEI_HLEN: u32 = 2;
const FEI_PDO: u32 = 3;
const FEI_PLEN: u32 = 4;
const FEI_DATAL: u32 = 16;

/// NVMe/TCP PDU type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    /// ICReq - Initialize Connection Request
    IcReq = 0x00,
    /// ICResp - Initialize Connection Response
    IcResp = 0x01,
    /// H2CTermReq - Host to Controller Terminate Connection Request
    H2CTermReq = 0x02,
    /// C2HTermReq - Controller to Host Terminate Connection Request
    C2HTermReq = 0x03,
    /// CapsuleCmd - Command Capsule
    CapsuleCmd = 0x04,
    /// CapsuleResp - Response Capsule
    CapsuleResp = 0x05,
    /// H2CData - Host to Controller Data
    H2CData = 0x06,
    /// C2HData - Controller to Host Data
    C2HData = 0x07,
    /// R2T - Ready to Transfer
    R2T = 0x09,
}

impl PduType {
    /// Create from raw value
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::IcReq),
            0x01 => Some(Self::IcResp),
            0x02 => Some(Self::H2CTermReq),
            0x03 => Some(Self::C2HTermReq),
            0x04 => Some(Self::CapsuleCmd),
            0x05 => Some(Self::CapsuleResp),
            0x06 => Some(Self::H2CData),
            0x07 => Some(Self::C2HData),
            0x09 => Some(Self::R2T),
            _ => None,
        }
    }

    /// Fixed header length (`hlen`) of this PDU type in bytes
    pub fn header_len(self) -> usize {
        match self {
            Self::IcReq | Self::IcResp => 128,
            Self::CapsuleCmd => 72,
            Self::H2CTermReq
            | Self::C2HTermReq
            | Self::CapsuleResp
            | Self::H2CData
            | Self::C2HData
            | Self::R2T => 24,
        }
    }

    /// Whether a header digest may follow the header of this type
    pub fn carries_header_digest(self) -> bool {
        matches!(
            self,
            Self::CapsuleCmd | Self::CapsuleResp | Self::H2CData | Self::C2HData | Self::R2T
        )
    }

    /// Whether this type may carry PDU data at `pdo`
    pub fn carries_data(self) -> bool {
        matches!(self, Self::CapsuleCmd | Self::H2CData | Self::C2HData)
    }
}

/// PDU-specific flags of the common header
///
/// Every flag is independent; combining them is a bitwise OR.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PduFlags(u8);

impl PduFlags {
    /// Header digest present (HDGSTF)
    pub const HDGSTF: u8 = 0x01;
    /// Data digest present (DDGSTF)
    pub const DDGSTF: u8 = 0x02;
    /// Last data PDU of a transfer (H2CData/C2HData)
    pub const LAST_PDU: u8 = 0x04;
    /// Command completed successfully, no CapsuleResp follows (C2HData only)
    pub const SUCCESS: u8 = 0x08;

    /// Flags with the digest bits set as requested
    pub fn new(header_digest: bool, data_digest: bool) -> Self {
        let mut bits = 0;
        if header_digest {
            bits |= Self::HDGSTF;
        }
        if data_digest {
            bits |= Self::DDGSTF;
        }
        Self(bits)
    }

    /// Create from the raw flags byte
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flags byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Set or clear LAST_PDU
    pub fn with_last_pdu(self, last_pdu: bool) -> Self {
        self.with(Self::LAST_PDU, last_pdu)
    }

    /// Set or clear SUCCESS
    pub fn with_success(self, success: bool) -> Self {
        self.with(Self::SUCCESS, success)
    }

    fn with(self, bit: u8, set: bool) -> Self {
        if set {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }

    /// HDGSTF is set
    pub fn header_digest(self) -> bool {
        self.0 & Self::HDGSTF != 0
    }

    /// DDGSTF is set
    pub fn data_digest(self) -> bool {
        self.0 & Self::DDGSTF != 0
    }

    /// LAST_PDU is set
    pub fn last_pdu(self) -> bool {
        self.0 & Self::LAST_PDU != 0
    }

    /// SUCCESS is set
    pub fn success(self) -> bool {
        self.0 & Self::SUCCESS != 0
    }
}

impl fmt::Debug for PduFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PduFlags({:#04x})", self.0)
    }
}

/// Digest-enable bits of the ICReq/ICResp `dgst` field
pub fn digest_bits(digests: DigestOptions) -> u8 {
    PduFlags::new(digests.header, digests.data).bits()
}

fn digests_from_bits(bits: u8) -> DigestOptions {
    let flags = PduFlags::from_bits(bits);
    DigestOptions::new(flags.header_digest(), flags.data_digest())
}

/// NVMe/TCP PDU Common Header (8 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    /// PDU Type
    pub pdu_type: PduType,
    /// PDU Specific Flags
    pub flags: PduFlags,
    /// Header Length in bytes (common header plus PDU specific header)
    pub hlen: u8,
    /// PDU Data Offset in bytes, 0 when the PDU carries no data
    pub pdo: u8,
    /// PDU Length (entire PDU including header, digests and data)
    pub plen: u32,
}

impl PduHeader {
    /// Size of PDU common header
    pub const SIZE: usize = 8;

    /// Create a new PDU header
    pub fn new(pdu_type: PduType, flags: PduFlags, pdo: u8, plen: u32) -> Self {
        Self {
            pdu_type,
            flags,
            hlen: pdu_type.header_len() as u8,
            pdo,
            plen,
        }
    }

    /// Parse the common header from the first 8 bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> NvmeTcpResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(NvmeTcpError::malformed(
                0,
                format!("PDU header too short: {} bytes", buf.len()),
            ));
        }

        let raw_type = buf.get_u8();
        let pdu_type = PduType::from_raw(raw_type).ok_or_else(|| {
            NvmeTcpError::malformed(0, format!("Unknown PDU type: {:#04x}", raw_type))
        })?;

        let header = Self {
            pdu_type,
            flags: PduFlags::from_bits(buf.get_u8()),
            hlen: buf.get_u8(),
            pdo: buf.get_u8(),
            plen: buf.get_u32_le(),
        };

        if (header.hlen as u32) > header.plen {
            return Err(NvmeTcpError::malformed(
                FEI_HLEN,
                format!("hlen {} exceeds plen {}", header.hlen, header.plen),
            ));
        }

        Ok(header)
    }

    /// Serialize the common header
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.pdu_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.hlen);
        buf.put_u8(self.pdo);
        buf.put_u32_le(self.plen);
    }

    /// Check `hlen` against the fixed header length of the PDU type
    pub fn check_header_len(&self) -> NvmeTcpResult<()> {
        let expected = self.pdu_type.header_len();
        if self.hlen as usize != expected {
            return Err(NvmeTcpError::malformed(
                FEI_HLEN,
                format!(
                    "{:?} hlen {} (expected {})",
                    self.pdu_type, self.hlen, expected
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PduHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduHeader")
            .field("pdu_type", &self.pdu_type)
            .field("flags", &format_args!("{:#04x}", self.flags.bits()))
            .field("hlen", &self.hlen)
            .field("pdo", &self.pdo)
            .field("plen", &self.plen)
            .finish()
    }
}

/// Parse only the common header of a PDU
pub fn decode_common_header(buf: &[u8]) -> NvmeTcpResult<PduHeader> {
    PduHeader::decode(buf)
}

/// Framing options for outbound PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduOptions {
    /// Digests to emit
    pub digests: DigestOptions,
    /// Byte alignment of PDU data within the PDU
    pub data_alignment: usize,
}

impl PduOptions {
    /// Options for a peer that requested `pda` (0's based dwords) alignment
    pub fn new(digests: DigestOptions, pda: u8) -> Self {
        Self {
            digests,
            data_alignment: pda_to_bytes(pda),
        }
    }

    /// No digests, dword alignment
    pub fn plain() -> Self {
        Self::new(DigestOptions::NONE, 0)
    }

    /// Compute `(pdo, plen)` for a PDU with `hlen` header bytes and `data_len` data bytes
    fn framing(&self, hlen: usize, data_len: usize) -> (u8, u32) {
        let header_end = hlen + self.digests.header_len();
        if data_len == 0 {
            return (0, header_end as u32);
        }
        let pdo = align_up(header_end, self.data_alignment);
        let plen = pdo + data_len + self.digests.data_len(data_len);
        (pdo as u8, plen as u32)
    }

    fn flags(&self, data_len: usize) -> PduFlags {
        PduFlags::new(self.digests.header, self.digests.data && data_len > 0)
    }
}

impl Default for PduOptions {
    fn default() -> Self {
        Self::plain()
    }
}

/// Convert a 0's based dword alignment value into bytes
pub fn pda_to_bytes(pda: u8) -> usize {
    (pda.min(MAX_PDA) as usize + 1) * 4
}

fn align_up(value: usize, align: usize) -> usize {
    let align = align.max(1);
    value.div_ceil(align) * align
}

/// Write the header segments, their digest, padding, data and data digest
fn put_framed(buf: &mut impl BufMut, header: &[&[u8]], opts: &PduOptions, pdo: u8, data: &[u8]) {
    let mut written = 0;
    for segment in header {
        buf.put_slice(segment);
        written += segment.len();
    }
    if opts.digests.header {
        buf.put_u32_le(crc32c_segments(header.iter().copied()));
        written += DIGEST_SIZE;
    }
    if !data.is_empty() {
        buf.put_bytes(0, pdo as usize - written);
        buf.put_slice(data);
        if opts.digests.data {
            buf.put_u32_le(crc32c(data));
        }
    }
}

/// Borrowed view of an inbound PDU split into its parts
struct Frame<'a> {
    header: PduHeader,
    /// PDU specific header (bytes 8..hlen)
    body: &'a [u8],
    data: &'a [u8],
    data_digest: Option<u32>,
}

/// Validate framing of a received PDU of type `expected` and split it
fn split_frame(buf: &[u8], expected: PduType) -> NvmeTcpResult<Frame<'_>> {
    let header = PduHeader::decode(buf)?;
    if header.pdu_type != expected {
        return Err(NvmeTcpError::malformed(
            0,
            format!("Expected {:?}, got {:?}", expected, header.pdu_type),
        ));
    }
    header.check_header_len()?;

    let hlen = header.hlen as usize;
    let plen = header.plen as usize;
    if buf.len() < plen {
        return Err(NvmeTcpError::malformed(
            FEI_PLEN,
            format!("Buffer holds {} bytes, plen is {}", buf.len(), plen),
        ));
    }
    let pdu = &buf[..plen];

    let hdgst_len = if header.flags.header_digest() {
        if !expected.carries_header_digest() {
            return Err(NvmeTcpError::malformed(
                FEI_FLAGS,
                format!("{:?} cannot carry a header digest", expected),
            ));
        }
        DIGEST_SIZE
    } else {
        0
    };
    let header_end = hlen + hdgst_len;
    if plen < header_end {
        return Err(NvmeTcpError::malformed(
            FEI_PLEN,
            format!("plen {} shorter than header {}", plen, header_end),
        ));
    }

    if hdgst_len > 0 {
        let carried = (&pdu[hlen..header_end]).get_u32_le();
        let computed = crc32c(&pdu[..hlen]);
        if carried != computed {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::HeaderDigestError,
                0,
                format!(
                    "{:?} header digest {:#010x}, computed {:#010x}",
                    expected, carried, computed
                ),
            ));
        }
    }

    let body = &pdu[PduHeader::SIZE..hlen];

    if header.pdo == 0 {
        if plen != header_end {
            return Err(NvmeTcpError::malformed(
                FEI_PLEN,
                format!("{:?} has {} trailing bytes but pdo is 0", expected, plen - header_end),
            ));
        }
        return Ok(Frame {
            header,
            body,
            data: &[],
            data_digest: None,
        });
    }

    let pdo = header.pdo as usize;
    if !expected.carries_data() || pdo < header_end || pdo > plen {
        return Err(NvmeTcpError::malformed(
            FEI_PDO,
            format!("{:?} pdo {} invalid for plen {}", expected, pdo, plen),
        ));
    }

    let ddgst_len = if header.flags.data_digest() { DIGEST_SIZE } else { 0 };
    if plen < pdo + ddgst_len {
        return Err(NvmeTcpError::malformed(
            FEI_PLEN,
            format!("plen {} leaves no room for data digest", plen),
        ));
    }
    let data_end = plen - ddgst_len;
    let data_digest = (ddgst_len > 0).then(|| (&pdu[data_end..]).get_u32_le());

    Ok(Frame {
        header,
        body,
        data: &pdu[pdo..data_end],
        data_digest,
    })
}

fn verify_data_digest(cid: u16, data: &[u8], carried: Option<u32>) -> NvmeTcpResult<()> {
    if let Some(actual) = carried {
        let expected = crc32c(data);
        if expected != actual {
            return Err(NvmeTcpError::DataDigestMismatch {
                cid,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Validate and decode a 128-byte ICReq/ICResp frame, returning the specific header
fn split_ic(buf: &[u8], expected: PduType) -> NvmeTcpResult<&[u8]> {
    let header = PduHeader::decode(buf)?;
    if header.pdu_type != expected {
        return Err(NvmeTcpError::malformed(
            0,
            format!("Expected {:?}, got {:?}", expected, header.pdu_type),
        ));
    }
    header.check_header_len()?;
    if header.plen as usize != IcReq::SIZE {
        return Err(NvmeTcpError::malformed(
            FEI_PLEN,
            format!("{:?} plen {} (expected 128)", expected, header.plen),
        ));
    }
    if buf.len() < IcReq::SIZE {
        return Err(NvmeTcpError::malformed(
            FEI_PLEN,
            format!("{:?} truncated: {} bytes", expected, buf.len()),
        ));
    }
    Ok(&buf[PduHeader::SIZE..IcReq::SIZE])
}

/// Initialize Connection Request (ICReq) PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcReq {
    /// PDU Format Version
    pub pfv: u16,
    /// Host PDU Data Alignment (0's based dwords)
    pub hpda: u8,
    /// Digests requested by the host
    pub digests: DigestOptions,
    /// Maximum outstanding R2T PDUs per command (0's based)
    pub maxr2t: u32,
}

impl IcReq {
    /// Size of the ICReq PDU including the common header
    pub const SIZE: usize = 128;

    /// Create a new ICReq
    pub fn new(hpda: u8, digests: DigestOptions, maxr2t: u32) -> Self {
        Self {
            pfv: 0,
            hpda,
            digests,
            maxr2t,
        }
    }

    /// Serialize the complete PDU
    pub fn encode(&self, buf: &mut impl BufMut) {
        PduHeader::new(PduType::IcReq, PduFlags::default(), 0, Self::SIZE as u32).encode(buf);
        buf.put_u16_le(self.pfv);
        buf.put_u8(self.hpda);
        buf.put_u8(digest_bits(self.digests));
        buf.put_u32_le(self.maxr2t);
        buf.put_bytes(0, 112);
    }

    /// Parse a complete PDU
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<Self> {
        let mut body = split_ic(buf, PduType::IcReq)?;
        Ok(Self {
            pfv: body.get_u16_le(),
            hpda: body.get_u8(),
            digests: digests_from_bits(body.get_u8()),
            maxr2t: body.get_u32_le(),
        })
    }
}

impl Default for IcReq {
    fn default() -> Self {
        Self::new(0, DigestOptions::NONE, 0)
    }
}

/// Initialize Connection Response (ICResp) PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcResp {
    /// PDU Format Version
    pub pfv: u16,
    /// Controller PDU Data Alignment (0's based dwords)
    pub cpda: u8,
    /// Digests enabled by the controller
    pub digests: DigestOptions,
    /// Maximum H2CData PDU data bytes
    pub maxh2cdata: u32,
}

impl IcResp {
    /// Size of the ICResp PDU including the common header
    pub const SIZE: usize = 128;

    /// Create a new ICResp
    pub fn new(cpda: u8, digests: DigestOptions, maxh2cdata: u32) -> Self {
        Self {
            pfv: 0,
            cpda,
            digests,
            maxh2cdata,
        }
    }

    /// Serialize the complete PDU
    pub fn encode(&self, buf: &mut impl BufMut) {
        PduHeader::new(PduType::IcResp, PduFlags::default(), 0, Self::SIZE as u32).encode(buf);
        buf.put_u16_le(self.pfv);
        buf.put_u8(self.cpda);
        buf.put_u8(digest_bits(self.digests));
        buf.put_u32_le(self.maxh2cdata);
        buf.put_bytes(0, 112);
    }

    /// Parse a complete PDU
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<Self> {
        let mut body = split_ic(buf, PduType::IcResp)?;
        Ok(Self {
            pfv: body.get_u16_le(),
            cpda: body.get_u8(),
            digests: digests_from_bits(body.get_u8()),
            maxh2cdata: body.get_u32_le(),
        })
    }
}

/// Direction of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermDirection {
    /// H2CTermReq
    HostToController,
    /// C2HTermReq
    ControllerToHost,
}

impl TermDirection {
    fn pdu_type(self) -> PduType {
        match self {
            Self::HostToController => PduType::H2CTermReq,
            Self::ControllerToHost => PduType::C2HTermReq,
        }
    }
}

/// H2CTermReq / C2HTermReq PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermReq {
    /// Which side sends the request
    pub direction: TermDirection,
    /// Fatal Error Status
    pub fes: u16,
    /// Fatal Error Information
    pub fei: u32,
}

impl TermReq {
    /// Size of the fixed part including the common header
    pub const SIZE: usize = 24;

    /// Create a new termination request
    pub fn new(direction: TermDirection, fes: FatalErrorStatus, fei: u32) -> Self {
        Self {
            direction,
            fes: fes.to_raw(),
            fei,
        }
    }

    /// Serialize the complete PDU; `data` is truncated to 152 bytes
    pub fn encode(&self, buf: &mut impl BufMut, data: &[u8]) {
        let data = &data[..data.len().min(MAX_TERM_REQ_DATA)];
        let plen = (Self::SIZE + data.len()) as u32;
        PduHeader::new(self.direction.pdu_type(), PduFlags::default(), 0, plen).encode(buf);
        buf.put_u16_le(self.fes);
        buf.put_u32_le(self.fei);
        buf.put_bytes(0, 10);
        buf.put_slice(data);
    }

    /// Parse a complete PDU, returning the error data as a borrowed view
    pub fn decode(buf: &[u8], direction: TermDirection) -> NvmeTcpResult<(Self, &[u8])> {
        let header = PduHeader::decode(buf)?;
        if header.pdu_type != direction.pdu_type() {
            return Err(NvmeTcpError::malformed(
                0,
                format!("Expected {:?}, got {:?}", direction.pdu_type(), header.pdu_type),
            ));
        }
        header.check_header_len()?;

        let plen = header.plen as usize;
        if plen > Self::SIZE + MAX_TERM_REQ_DATA || buf.len() < plen {
            return Err(NvmeTcpError::malformed(
                FEI_PLEN,
                format!("Termination request plen {} (buffer {})", plen, buf.len()),
            ));
        }

        let mut body = &buf[PduHeader::SIZE..Self::SIZE];
        let req = Self {
            direction,
            fes: body.get_u16_le(),
            fei: body.get_u32_le(),
        };
        Ok((req, &buf[Self::SIZE..plen]))
    }

    /// Decoded Fatal Error Status, if known
    pub fn status(&self) -> Option<FatalErrorStatus> {
        FatalErrorStatus::from_raw(self.fes)
    }
}

/// Command Capsule PDU (CapsuleCmd)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapsuleCmd<'a> {
    /// Submission queue entry
    pub sqe: [u8; SQE_SIZE],
    /// In-capsule data
    pub data: &'a [u8],
}

impl<'a> CapsuleCmd<'a> {
    /// Size of the PDU header including the common header
    pub const SIZE: usize = 72;

    /// Create a command capsule
    pub fn new(sqe: [u8; SQE_SIZE], data: &'a [u8]) -> Self {
        Self { sqe, data }
    }

    /// Serialize the complete PDU
    pub fn encode(&self, buf: &mut impl BufMut, opts: &PduOptions) {
        let (pdo, plen) = opts.framing(Self::SIZE, self.data.len());
        let mut common = [0u8; PduHeader::SIZE];
        PduHeader::new(PduType::CapsuleCmd, opts.flags(self.data.len()), pdo, plen)
            .encode(&mut &mut common[..]);
        put_framed(buf, &[&common[..], &self.sqe[..]], opts, pdo, self.data);
    }

    /// Parse a complete PDU
    pub fn decode(buf: &'a [u8]) -> NvmeTcpResult<Self> {
        let frame = split_frame(buf, PduType::CapsuleCmd)?;
        let mut sqe = [0u8; SQE_SIZE];
        sqe.copy_from_slice(frame.body);
        let cid = u16::from_le_bytes([sqe[2], sqe[3]]);
        verify_data_digest(cid, frame.data, frame.data_digest)?;
        Ok(Self {
            sqe,
            data: frame.data,
        })
    }
}

/// Response Capsule PDU (CapsuleResp)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapsuleResp {
    /// Completion queue entry
    pub cqe: [u8; CQE_SIZE],
}

impl CapsuleResp {
    /// Size of the PDU including the common header
    pub const SIZE: usize = 24;

    /// Create a response capsule
    pub fn new(cqe: [u8; CQE_SIZE]) -> Self {
        Self { cqe }
    }

    /// Serialize the complete PDU (header digest only)
    pub fn encode(&self, buf: &mut impl BufMut, opts: &PduOptions) {
        let (pdo, plen) = opts.framing(Self::SIZE, 0);
        let mut common = [0u8; PduHeader::SIZE];
        PduHeader::new(PduType::CapsuleResp, opts.flags(0), pdo, plen)
            .encode(&mut &mut common[..]);
        put_framed(buf, &[&common[..], &self.cqe[..]], opts, pdo, &[]);
    }

    /// Parse a complete PDU
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<Self> {
        let frame = split_frame(buf, PduType::CapsuleResp)?;
        let mut cqe = [0u8; CQE_SIZE];
        cqe.copy_from_slice(frame.body);
        Ok(Self { cqe })
    }
}

/// Host to Controller Data PDU (H2CData)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H2CData {
    /// Command Capsule CID
    pub cccid: u16,
    /// Transfer Tag from the R2T
    pub ttag: u16,
    /// Data Offset within the command's data
    pub datao: u32,
    /// Data Length
    pub datal: u32,
    /// Last PDU for the R2T
    pub last_pdu: bool,
}

impl H2CData {
    /// Size of the PDU header including the common header
    pub const SIZE: usize = 24;

    /// Serialize the complete PDU with `data` (`datal` must equal `data.len()`)
    pub fn encode(&self, buf: &mut impl BufMut, opts: &PduOptions, data: &[u8]) {
        debug_assert_eq!(self.datal as usize, data.len());
        let (pdo, plen) = opts.framing(Self::SIZE, data.len());
        let flags = opts.flags(data.len()).with_last_pdu(self.last_pdu);
        let mut header = BytesMut::with_capacity(Self::SIZE);
        PduHeader::new(PduType::H2CData, flags, pdo, plen).encode(&mut header);
        header.put_u16_le(self.cccid);
        header.put_u16_le(self.ttag);
        header.put_u32_le(self.datao);
        header.put_u32_le(self.datal);
        header.put_bytes(0, 4);
        put_framed(buf, &[&header[..]], opts, pdo, data);
    }

    /// Parse a complete PDU, returning the data as a borrowed view
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<(Self, &[u8])> {
        let frame = split_frame(buf, PduType::H2CData)?;
        let mut body = frame.body;
        let pdu = Self {
            cccid: body.get_u16_le(),
            ttag: body.get_u16_le(),
            datao: body.get_u32_le(),
            datal: body.get_u32_le(),
            last_pdu: frame.header.flags.last_pdu(),
        };
        check_datal(pdu.datal, frame.data)?;
        verify_data_digest(pdu.cccid, frame.data, frame.data_digest)?;
        Ok((pdu, frame.data))
    }
}

/// Controller to Host Data PDU (C2HData)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct C2HData {
    /// Command Capsule CID
    pub cccid: u16,
    /// Data Offset within the command's data
    pub datao: u32,
    /// Data Length
    pub datal: u32,
    /// Last PDU of the transfer
    pub last_pdu: bool,
    /// Command completed successfully; no CapsuleResp follows
    pub success: bool,
}

impl C2HData {
    /// Size of the PDU header including the common header
    pub const SIZE: usize = 24;

    /// Byte offset of `datao` within the PDU
    pub const DATAO_OFFSET: u32 = 12;

    /// Byte offset of `datal` within the PDU
    pub const DATAL_OFFSET: u32 = FEI_DATAL;

    /// Serialize the complete PDU with `data` (`datal` must equal `data.len()`)
    pub fn encode(&self, buf: &mut impl BufMut, opts: &PduOptions, data: &[u8]) {
        debug_assert_eq!(self.datal as usize, data.len());
        let (pdo, plen) = opts.framing(Self::SIZE, data.len());
        let flags = opts
            .flags(data.len())
            .with_last_pdu(self.last_pdu)
            .with_success(self.success);
        let mut header = BytesMut::with_capacity(Self::SIZE);
        PduHeader::new(PduType::C2HData, flags, pdo, plen).encode(&mut header);
        header.put_u16_le(self.cccid);
        header.put_bytes(0, 2);
        header.put_u32_le(self.datao);
        header.put_u32_le(self.datal);
        header.put_bytes(0, 4);
        put_framed(buf, &[&header[..]], opts, pdo, data);
    }

    /// Parse a complete PDU, returning the data as a borrowed view
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<(Self, &[u8])> {
        let frame = split_frame(buf, PduType::C2HData)?;
        let mut body = frame.body;
        let cccid = body.get_u16_le();
        body.advance(2);
        let pdu = Self {
            cccid,
            datao: body.get_u32_le(),
            datal: body.get_u32_le(),
            last_pdu: frame.header.flags.last_pdu(),
            success: frame.header.flags.success(),
        };
        check_datal(pdu.datal, frame.data)?;
        verify_data_digest(pdu.cccid, frame.data, frame.data_digest)?;
        Ok((pdu, frame.data))
    }
}

fn check_datal(datal: u32, data: &[u8]) -> NvmeTcpResult<()> {
    if datal as usize != data.len() {
        return Err(NvmeTcpError::malformed(
            FEI_DATAL,
            format!("datal {} but PDU carries {} data bytes", datal, data.len()),
        ));
    }
    Ok(())
}

/// Ready to Transfer PDU (R2T)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct R2T {
    /// Command Capsule CID
    pub cccid: u16,
    /// Transfer Tag to echo in H2CData PDUs
    pub ttag: u16,
    /// Requested data offset
    pub r2to: u32,
    /// Requested data length
    pub r2tl: u32,
}

impl R2T {
    /// Size of the PDU including the common header
    pub const SIZE: usize = 24;

    /// Byte offset of `r2to` within the PDU
    pub const R2TO_OFFSET: u32 = 12;

    /// Byte offset of `r2tl` within the PDU
    pub const R2TL_OFFSET: u32 = 16;

    /// Serialize the complete PDU (header digest only)
    pub fn encode(&self, buf: &mut impl BufMut, opts: &PduOptions) {
        let (pdo, plen) = opts.framing(Self::SIZE, 0);
        let mut header = BytesMut::with_capacity(Self::SIZE);
        PduHeader::new(PduType::R2T, opts.flags(0), pdo, plen).encode(&mut header);
        header.put_u16_le(self.cccid);
        header.put_u16_le(self.ttag);
        header.put_u32_le(self.r2to);
        header.put_u32_le(self.r2tl);
        header.put_bytes(0, 4);
        put_framed(buf, &[&header[..]], opts, pdo, &[]);
    }

    /// Parse a complete PDU
    pub fn decode(buf: &[u8]) -> NvmeTcpResult<Self> {
        let frame = split_frame(buf, PduType::R2T)?;
        let mut body = frame.body;
        Ok(Self {
            cccid: body.get_u16_le(),
            ttag: body.get_u16_le(),
            r2to: body.get_u32_le(),
            r2tl: body.get_u32_le(),
        })
    }
}

/// Any decoded PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    /// ICReq
    IcReq(IcReq),
    /// ICResp
    IcResp(IcResp),
    /// H2CTermReq with error data
    H2CTermReq(TermReq, &'a [u8]),
    /// C2HTermReq with error data
    C2HTermReq(TermReq, &'a [u8]),
    /// CapsuleCmd
    CapsuleCmd(CapsuleCmd<'a>),
    /// CapsuleResp
    CapsuleResp(CapsuleResp),
    /// H2CData with its data
    H2CData(H2CData, &'a [u8]),
    /// C2HData with its data
    C2HData(C2HData, &'a [u8]),
    /// R2T
    R2T(R2T),
}

impl Pdu<'_> {
    /// PDU type
    pub fn pdu_type(&self) -> PduType {
        match self {
            Self::IcReq(_) => PduType::IcReq,
            Self::IcResp(_) => PduType::IcResp,
            Self::H2CTermReq(..) => PduType::H2CTermReq,
            Self::C2HTermReq(..) => PduType::C2HTermReq,
            Self::CapsuleCmd(_) => PduType::CapsuleCmd,
            Self::CapsuleResp(_) => PduType::CapsuleResp,
            Self::H2CData(..) => PduType::H2CData,
            Self::C2HData(..) => PduType::C2HData,
            Self::R2T(_) => PduType::R2T,
        }
    }
}

/// Decode a complete PDU of any type
pub fn decode_pdu(buf: &[u8]) -> NvmeTcpResult<Pdu<'_>> {
    let header = PduHeader::decode(buf)?;
    Ok(match header.pdu_type {
        PduType::IcReq => Pdu::IcReq(IcReq::decode(buf)?),
        PduType::IcResp => Pdu::IcResp(IcResp::decode(buf)?),
        PduType::H2CTermReq => {
            let (req, data) = TermReq::decode(buf, TermDirection::HostToController)?;
            Pdu::H2CTermReq(req, data)
        }
        PduType::C2HTermReq => {
            let (req, data) = TermReq::decode(buf, TermDirection::ControllerToHost)?;
            Pdu::C2HTermReq(req, data)
        }
        PduType::CapsuleCmd => Pdu::CapsuleCmd(CapsuleCmd::decode(buf)?),
        PduType::CapsuleResp => Pdu::CapsuleResp(CapsuleResp::decode(buf)?),
        PduType::H2CData => {
            let (pdu, data) = H2CData::decode(buf)?;
            Pdu::H2CData(pdu, data)
        }
        PduType::C2HData => {
            let (pdu, data) = C2HData::decode(buf)?;
            Pdu::C2HData(pdu, data)
        }
        PduType::R2T => Pdu::R2T(R2T::decode(buf)?),
    })
}
