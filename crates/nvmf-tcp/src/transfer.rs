//! Command correlation and data transfer accounting
//!
//! Every submitted command is tracked by command id until its completion.
//! Writes that did not fit in the capsule are satisfied by answering R2Ts
//! with H2CData chunks; reads are assembled from C2HData PDUs.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, trace};

use crate::capsule::FabricsCompletion;
use crate::command::{FabricsType, NvmeCompletion};
use crate::error::{FatalErrorStatus, NvmeTcpError, NvmeTcpResult};
use crate::pdu::{C2HData, R2T};

// FEI offsets within the PDUs this module validates
const FEI_FLAGS: u32 = 1;
const FEI_CCCID: u32 = 8;
const FEI_TTAG: u32 = 10;
const FEI_CQE_CID: u32 = 20;

/// Data moved by a command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataTransfer {
    /// No data
    #[default]
    None,
    /// Host to controller
    ToController(Bytes),
    /// Controller to host, this many bytes
    FromController(u32),
}

impl DataTransfer {
    /// Number of bytes the command moves
    ///
    /// Fails for writes longer than the 32-bit transfer length of an SGL.
    pub fn len(&self) -> NvmeTcpResult<u32> {
        match self {
            Self::None => Ok(0),
            Self::ToController(data) => write_length(data.len()),
            Self::FromController(len) => Ok(*len),
        }
    }

    /// Check whether the command moves no data
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::ToController(data) => data.is_empty(),
            Self::FromController(len) => *len == 0,
        }
    }
}

fn write_length(len: usize) -> NvmeTcpResult<u32> {
    u32::try_from(len).map_err(|_| {
        NvmeTcpError::InvalidArgument(format!(
            "write of {} bytes exceeds the {} byte transfer limit",
            len,
            u32::MAX
        ))
    })
}

/// One H2CData PDU to send in answer to an R2T
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2CChunk {
    /// Command Capsule CID
    pub cccid: u16,
    /// Transfer tag copied from the R2T
    pub ttag: u16,
    /// Offset within the command's data
    pub datao: u32,
    /// Chunk payload
    pub data: Bytes,
    /// Last chunk for this R2T
    pub last: bool,
}

/// Split `[r2to, r2to + r2tl)` into `(offset, length)` pieces of at most `maxh2cdata`
///
/// Returns `None` when the range does not fit in 32 bits.
pub fn chunk_ranges(r2to: u32, r2tl: u32, maxh2cdata: u32) -> Option<Vec<(u32, u32)>> {
    let end = r2to.checked_add(r2tl)?;
    let step = maxh2cdata.max(1);
    let mut ranges = Vec::with_capacity(r2tl.div_ceil(step) as usize);
    let mut offset = r2to;
    while offset < end {
        let len = step.min(end - offset);
        ranges.push((offset, len));
        offset += len;
    }
    Some(ranges)
}

/// Record `range` in a sorted list of disjoint sent ranges, merging neighbours
fn record_sent(sent: &mut Vec<Range<u32>>, range: Range<u32>) {
    let pos = sent.partition_point(|r| r.start < range.start);
    sent.insert(pos, range);
    let mut merged: Vec<Range<u32>> = Vec::with_capacity(sent.len());
    for r in sent.drain(..) {
        match merged.last_mut() {
            Some(last) if last.end == r.start => last.end = r.end,
            _ => merged.push(r),
        }
    }
    *sent = merged;
}

/// Per-command transfer state
#[derive(Debug)]
enum Transfer {
    None,
    Write {
        data: Bytes,
        length: u32,
        in_capsule: bool,
        active_ttags: HashSet<u16>,
        /// Byte ranges already answered, sorted and disjoint
        sent: Vec<Range<u32>>,
        transferred: u32,
    },
    Read {
        buf: Vec<u8>,
        length: u32,
        received: u32,
    },
}

#[derive(Debug)]
struct InFlight {
    fabrics_type: Option<FabricsType>,
    transfer: Transfer,
}

/// A command whose completion has been received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCommand {
    /// Completion queue entry
    pub completion: NvmeCompletion,
    /// Fabrics command type, `None` for other commands
    pub fabrics_type: Option<FabricsType>,
    /// Data read from the controller
    pub data: Bytes,
}

impl CompletedCommand {
    /// Command identifier
    pub fn cid(&self) -> u16 {
        self.completion.cid
    }

    /// Check if the command succeeded
    pub fn is_success(&self) -> bool {
        self.completion.is_success()
    }

    /// Fabrics view of the completion
    pub fn fabrics(&self) -> Option<FabricsCompletion> {
        self.fabrics_type
            .map(|fctype| FabricsCompletion::new(fctype, &self.completion))
    }

    /// Turn a non-zero status into `CommandFailed`
    pub fn into_result(self) -> NvmeTcpResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(NvmeTcpError::CommandFailed {
                cid: self.cid(),
                status: self.completion.status(),
            })
        }
    }
}

/// Result of placing a C2HData PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum C2HOutcome {
    /// More data or a CapsuleResp follows
    Pending,
    /// SUCCESS was set; the command is complete
    Completed(CompletedCommand),
}

/// In-flight commands keyed by command id
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<u16, InFlight>,
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no command is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check whether `cid` is in flight
    pub fn contains(&self, cid: u16) -> bool {
        self.entries.contains_key(&cid)
    }

    /// Start tracking a command
    ///
    /// `in_capsule` marks writes whose data travelled in the command capsule.
    pub fn register(
        &mut self,
        cid: u16,
        fabrics_type: Option<FabricsType>,
        data: DataTransfer,
        in_capsule: bool,
    ) -> NvmeTcpResult<()> {
        if self.contains(cid) {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "cid {} already in flight",
                cid
            )));
        }

        let transfer = match data {
            DataTransfer::None => Transfer::None,
            DataTransfer::ToController(data) => {
                let length = write_length(data.len())?;
                Transfer::Write {
                    data,
                    length,
                    in_capsule,
                    active_ttags: HashSet::new(),
                    sent: Vec::new(),
                    transferred: if in_capsule { length } else { 0 },
                }
            }
            DataTransfer::FromController(length) => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(length as usize).map_err(|e| {
                    NvmeTcpError::Resource(format!(
                        "read buffer of {} bytes for cid {}: {}",
                        length, cid, e
                    ))
                })?;
                buf.resize(length as usize, 0);
                Transfer::Read {
                    buf,
                    length,
                    received: 0,
                }
            }
        };

        self.entries.insert(
            cid,
            InFlight {
                fabrics_type,
                transfer,
            },
        );
        Ok(())
    }

    /// Plan the H2CData PDUs answering `r2t`
    ///
    /// The R2T's transfer tag stays active until [`r2t_complete`] is called.
    /// Its byte range counts as sent from here on; a later R2T asking for any
    /// of those bytes again is a PDU sequence error.
    ///
    /// [`r2t_complete`]: Self::r2t_complete
    pub fn handle_r2t(
        &mut self,
        r2t: &R2T,
        maxh2cdata: u32,
        maxr2t: u32,
    ) -> NvmeTcpResult<Vec<H2CChunk>> {
        let entry = self.entries.get_mut(&r2t.cccid).ok_or_else(|| {
            NvmeTcpError::sequence(format!("R2T for unknown cid {}", r2t.cccid))
        })?;

        let Transfer::Write {
            data,
            length,
            in_capsule,
            active_ttags,
            sent,
            transferred,
        } = &mut entry.transfer
        else {
            return Err(NvmeTcpError::sequence(format!(
                "R2T for cid {} which has no data to write",
                r2t.cccid
            )));
        };
        if *in_capsule {
            return Err(NvmeTcpError::sequence(format!(
                "R2T for cid {} whose data was sent in-capsule",
                r2t.cccid
            )));
        }

        let limit = *length;
        if r2t.r2tl == 0 {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                R2T::R2TL_OFFSET,
                format!("R2T for cid {} with zero length", r2t.cccid),
            ));
        }
        if r2t.r2to as u64 + r2t.r2tl as u64 > limit as u64 {
            return Err(NvmeTcpError::DataTransferOutOfRange {
                cid: r2t.cccid,
                offset: r2t.r2to,
                length: r2t.r2tl,
                limit,
                fei: if r2t.r2to >= limit {
                    R2T::R2TO_OFFSET
                } else {
                    R2T::R2TL_OFFSET
                },
            });
        }
        if active_ttags.contains(&r2t.ttag) {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::R2tLimitExceeded,
                FEI_TTAG,
                format!("duplicate ttag {:#x} for cid {}", r2t.ttag, r2t.cccid),
            ));
        }
        if active_ttags.len() as u64 >= maxr2t as u64 + 1 {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::R2tLimitExceeded,
                0,
                format!(
                    "cid {} has {} outstanding R2Ts, limit {}",
                    r2t.cccid,
                    active_ttags.len(),
                    maxr2t as u64 + 1
                ),
            ));
        }
        let window = r2t.r2to..r2t.r2to + r2t.r2tl;
        if let Some(done) = sent
            .iter()
            .find(|r| r.start < window.end && window.start < r.end)
        {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::PduSequenceError,
                R2T::R2TO_OFFSET,
                format!(
                    "R2T for cid {} requests bytes {}..{}, {}..{} already sent",
                    r2t.cccid, window.start, window.end, done.start, done.end
                ),
            ));
        }
        let ranges = chunk_ranges(r2t.r2to, r2t.r2tl, maxh2cdata).ok_or_else(|| {
            NvmeTcpError::malformed(R2T::R2TL_OFFSET, "R2T range exceeds 32 bits")
        })?;

        active_ttags.insert(r2t.ttag);
        record_sent(sent, window);
        *transferred += r2t.r2tl;

        let count = ranges.len();
        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(i, (datao, datal))| H2CChunk {
                cccid: r2t.cccid,
                ttag: r2t.ttag,
                datao,
                data: data.slice(datao as usize..(datao + datal) as usize),
                last: i + 1 == count,
            })
            .collect();

        trace!(
            "R2T cid={} ttag={:#x} offset={} length={} -> {} H2CData PDUs",
            r2t.cccid,
            r2t.ttag,
            r2t.r2to,
            r2t.r2tl,
            count
        );
        Ok(chunks)
    }

    /// Bytes of a write handed to the controller so far, `None` for other commands
    pub fn bytes_sent(&self, cid: u16) -> Option<u32> {
        match self.entries.get(&cid) {
            Some(InFlight {
                transfer: Transfer::Write { transferred, .. },
                ..
            }) => Some(*transferred),
            _ => None,
        }
    }

    /// Release the transfer tag of an answered R2T
    pub fn r2t_complete(&mut self, cid: u16, ttag: u16) {
        if let Some(InFlight {
            transfer: Transfer::Write { active_ttags, .. },
            ..
        }) = self.entries.get_mut(&cid)
        {
            active_ttags.remove(&ttag);
        }
    }

    /// Place a C2HData PDU into its command's read buffer
    pub fn handle_c2h(&mut self, pdu: &C2HData, data: &[u8]) -> NvmeTcpResult<C2HOutcome> {
        let entry = self.entries.get_mut(&pdu.cccid).ok_or_else(|| {
            NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_CCCID,
                format!("C2HData for unknown cid {}", pdu.cccid),
            )
        })?;

        let Transfer::Read {
            buf,
            length,
            received,
        } = &mut entry.transfer
        else {
            return Err(NvmeTcpError::sequence(format!(
                "C2HData for cid {} which reads no data",
                pdu.cccid
            )));
        };

        if data.len() != pdu.datal as usize {
            return Err(NvmeTcpError::malformed(
                C2HData::DATAL_OFFSET,
                format!("datal {} but {} data bytes", pdu.datal, data.len()),
            ));
        }

        let limit = *length;
        if pdu.datao as u64 + pdu.datal as u64 > limit as u64 {
            return Err(NvmeTcpError::DataTransferOutOfRange {
                cid: pdu.cccid,
                offset: pdu.datao,
                length: pdu.datal,
                limit,
                fei: if pdu.datao >= limit {
                    C2HData::DATAO_OFFSET
                } else {
                    C2HData::DATAL_OFFSET
                },
            });
        }
        if pdu.datao != *received {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                C2HData::DATAO_OFFSET,
                format!(
                    "C2HData for cid {} at offset {}, expected {}",
                    pdu.cccid, pdu.datao, received
                ),
            ));
        }
        if pdu.success && !pdu.last_pdu {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_FLAGS,
                format!("C2HData for cid {} has SUCCESS without LAST_PDU", pdu.cccid),
            ));
        }

        let start = pdu.datao as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        *received += pdu.datal;
        trace!(
            "C2HData cid={} offset={} length={} ({}/{})",
            pdu.cccid,
            pdu.datao,
            pdu.datal,
            received,
            limit
        );

        if pdu.success {
            let completed = self.finish(pdu.cccid, NvmeCompletion::success(pdu.cccid))?;
            return Ok(C2HOutcome::Completed(completed));
        }
        Ok(C2HOutcome::Pending)
    }

    /// Retire the command a CapsuleResp completes
    pub fn complete(&mut self, cqe: NvmeCompletion) -> NvmeTcpResult<CompletedCommand> {
        if !self.contains(cqe.cid) {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_CQE_CID,
                format!("completion for unknown cid {}", cqe.cid),
            ));
        }
        self.finish(cqe.cid, cqe)
    }

    fn finish(&mut self, cid: u16, completion: NvmeCompletion) -> NvmeTcpResult<CompletedCommand> {
        let entry = self.entries.remove(&cid).ok_or_else(|| {
            NvmeTcpError::sequence(format!("cid {} completed twice", cid))
        })?;
        let data = match entry.transfer {
            Transfer::Read { mut buf, received, .. } => {
                buf.truncate(received as usize);
                Bytes::from(buf)
            }
            Transfer::Write {
                length,
                transferred,
                ..
            } => {
                if transferred < length {
                    debug!(
                        "cid {} completed after {} of {} write bytes",
                        cid, transferred, length
                    );
                }
                Bytes::new()
            }
            Transfer::None => Bytes::new(),
        };
        Ok(CompletedCommand {
            completion,
            fabrics_type: entry.fabrics_type,
            data,
        })
    }

    /// Forget every in-flight command, returning their ids
    pub fn drain(&mut self) -> Vec<u16> {
        let mut cids: Vec<u16> = self.entries.drain().map(|(cid, _)| cid).collect();
        cids.sort_unstable();
        cids
    }
}
