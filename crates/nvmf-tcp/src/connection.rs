//! Host-side NVMe/TCP connection
//!
//! A [`Connection`] owns one transport stream and walks it through
//! `Idle -> TcpConnected -> Negotiating -> Ready -> Terminating -> Closed`.
//! All operations block and take `&mut self`; commands may be pipelined by
//! submitting several before waiting, and completions that arrive for other
//! commands while waiting are queued for later.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use tracing::{debug, info, trace, warn};

use crate::capsule::{ConnectData, FabricsCompletion, HostIdentity, PropertyOffset};
use crate::command::{FabricsCommand, NvmeCompletion, SglDescriptor, SubmissionEntry};
use crate::config::{ConnectionConfig, MIN_MAXH2CDATA};
use crate::digest::{DigestOptions, DIGEST_SIZE};
use crate::error::{FatalErrorStatus, NvmeTcpError, NvmeTcpResult};
use crate::pdu::{
    decode_pdu, CapsuleCmd, H2CData, IcReq, IcResp, Pdu, PduHeader, PduOptions, PduType,
    TermDirection, TermReq, MAX_PDA, MAX_TERM_REQ_DATA, R2T,
};
use crate::transfer::{C2HOutcome, CompletedCommand, CorrelationTable, DataTransfer};
use crate::transport::{Dialer, TcpDialer, TransportConnection};

// ICResp field offsets, cited as FEI
const FEI_ICRESP_PFV: u32 = 8;
const FEI_ICRESP_CPDA: u32 = 10;
const FEI_ICRESP_DGST: u32 = 11;
const FEI_ICRESP_MAXH2CDATA: u32 = 12;
const FEI_HLEN: u32 = 2;
const FEI_PLEN: u32 = 4;
const FEI_FLAGS: u32 = 1;
// Status field of the CQE inside a CapsuleResp PDU
const FEI_CQE_STATUS: u32 = 22;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport
    Idle,
    /// Transport open, no ICReq sent
    TcpConnected,
    /// ICReq sent, waiting for ICResp
    Negotiating,
    /// Parameters negotiated; capsules may flow
    Ready,
    /// A fatal error or termination request ended normal operation
    Terminating,
    /// Transport released; the connection cannot be reused
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TcpConnected => "tcp-connected",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Parameters agreed in the ICReq/ICResp exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    /// PDU format version
    pub pfv: u16,
    /// Host PDU data alignment we requested (0's based dwords)
    pub hpda: u8,
    /// Controller PDU data alignment (0's based dwords)
    pub cpda: u8,
    /// Digests in use
    pub digests: DigestOptions,
    /// Largest H2CData payload the controller accepts
    pub maxh2cdata: u32,
    /// Outstanding R2Ts per command we allowed (0's based)
    pub maxr2t: u32,
}

impl NegotiatedParams {
    /// Framing for PDUs sent to the controller
    pub fn outbound(&self) -> PduOptions {
        PduOptions::new(self.digests, self.cpda)
    }
}

/// Controller association created by a Fabrics Connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// Controller ID assigned by the subsystem
    pub cntlid: u16,
    /// Subsystem NQN
    pub subnqn: String,
    /// Queue the association was made on
    pub qid: u16,
}

/// A termination request received from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationInfo {
    /// Fatal Error Status
    pub fes: u16,
    /// Fatal Error Information
    pub fei: u32,
    /// Error data (the controller's copy of the offending header)
    pub data: Vec<u8>,
}

impl TerminationInfo {
    /// Decoded Fatal Error Status, if known
    pub fn status(&self) -> Option<FatalErrorStatus> {
        FatalErrorStatus::from_raw(self.fes)
    }
}

/// Host-detected violation to report in an H2CTermReq at teardown
#[derive(Debug, Clone)]
struct PendingAbort {
    fes: FatalErrorStatus,
    fei: u32,
    header: Vec<u8>,
}

enum Received {
    Nothing,
    Completed(CompletedCommand),
    R2T(R2T),
    Terminated(TerminationInfo),
}

/// Grow `buf` to at least `len` bytes, failing instead of aborting on OOM
fn grow(buf: &mut Vec<u8>, len: usize) -> NvmeTcpResult<()> {
    if buf.len() < len {
        buf.try_reserve(len - buf.len()).map_err(|e| {
            NvmeTcpError::Resource(format!("scratch buffer of {} bytes: {}", len, e))
        })?;
        buf.resize(len, 0);
    }
    Ok(())
}

/// Reserve room to encode `additional` bytes into an empty `buf`
fn reserve(buf: &mut Vec<u8>, additional: usize) -> NvmeTcpResult<()> {
    buf.clear();
    buf.try_reserve(additional).map_err(|e| {
        NvmeTcpError::Resource(format!("scratch buffer of {} bytes: {}", additional, e))
    })
}

/// Map a short read during negotiation to a protocol error
fn truncated_icresp(err: io::Error) -> NvmeTcpError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        NvmeTcpError::protocol(
            FatalErrorStatus::InvalidPduHeaderField,
            FEI_PLEN,
            "ICResp truncated: connection closed before 128 bytes arrived",
        )
    } else {
        NvmeTcpError::Transport(err)
    }
}

fn termination_info(req: &TermReq, data: &[u8]) -> TerminationInfo {
    warn!(
        "Controller terminated connection: fes={:#06x} ({}) fei={:#x}",
        req.fes,
        req.status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        req.fei
    );
    TerminationInfo {
        fes: req.fes,
        fei: req.fei,
        data: data.to_vec(),
    }
}

/// Host side of one NVMe/TCP queue
pub struct Connection {
    config: ConnectionConfig,
    state: ConnectionState,
    dialer: Box<dyn Dialer>,
    transport: Option<Box<dyn TransportConnection>>,
    negotiated: Option<NegotiatedParams>,
    host: HostIdentity,
    next_cid: u16,
    table: CorrelationTable,
    completed: VecDeque<CompletedCommand>,
    tx: Vec<u8>,
    rx: Vec<u8>,
    association: Option<Association>,
    termination: Option<TerminationInfo>,
    pending_abort: Option<PendingAbort>,
}

impl Connection {
    /// Create an idle TCP connection
    pub fn new(config: ConnectionConfig) -> NvmeTcpResult<Self> {
        Self::with_dialer(config, Box::new(TcpDialer))
    }

    /// Create an idle connection that opens its stream through `dialer`
    pub fn with_dialer(config: ConnectionConfig, dialer: Box<dyn Dialer>) -> NvmeTcpResult<Self> {
        config.validate()?;
        if dialer.transport_type() != config.transport {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "dialer speaks {}, configuration asks for {}",
                dialer.transport_type().as_str(),
                config.transport.as_str()
            )));
        }

        let mut tx = Vec::new();
        let mut rx = Vec::new();
        reserve(&mut tx, config.buffer_size)?;
        reserve(&mut rx, config.buffer_size)?;

        Ok(Self {
            config,
            state: ConnectionState::Idle,
            dialer,
            transport: None,
            negotiated: None,
            host: HostIdentity::generate(),
            next_cid: 0,
            table: CorrelationTable::new(),
            completed: VecDeque::new(),
            tx,
            rx,
            association: None,
            termination: None,
            pending_abort: None,
        })
    }

    /// Use `host` instead of a generated identity for Fabrics Connect
    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = host;
        self
    }

    /// Connect and negotiate in one step
    pub fn establish(config: ConnectionConfig) -> NvmeTcpResult<Self> {
        let mut conn = Self::new(config)?;
        conn.connect()?;
        conn.negotiate()?;
        Ok(conn)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Negotiated parameters, once Ready
    pub fn negotiated(&self) -> Option<&NegotiatedParams> {
        self.negotiated.as_ref()
    }

    /// Host identity presented in Fabrics Connect
    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Association created by [`fabrics_connect`](Self::fabrics_connect)
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    /// Termination request received from the controller, if any
    pub fn termination(&self) -> Option<&TerminationInfo> {
        self.termination.as_ref()
    }

    /// Number of submitted commands without a completion
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    fn require(&self, expected: ConnectionState) -> NvmeTcpResult<()> {
        match self.state {
            state if state == expected => Ok(()),
            ConnectionState::Closed => Err(NvmeTcpError::ConnectionClosed),
            actual => Err(NvmeTcpError::InvalidState { expected, actual }),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("NVMe/TCP connection {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown() {
                debug!("Transport shutdown failed: {}", e);
            }
        }
    }

    /// Open the transport (`Idle -> TcpConnected`)
    pub fn connect(&mut self) -> NvmeTcpResult<()> {
        self.require(ConnectionState::Idle)?;
        let transport = self.dialer.dial(&self.config)?;
        self.transport = Some(transport);
        self.set_state(ConnectionState::TcpConnected);
        Ok(())
    }

    /// Exchange ICReq/ICResp (`TcpConnected -> Negotiating -> Ready`)
    ///
    /// On failure the transport is released and the connection returns to
    /// `Idle`.
    pub fn negotiate(&mut self) -> NvmeTcpResult<NegotiatedParams> {
        self.require(ConnectionState::TcpConnected)?;
        self.set_state(ConnectionState::Negotiating);

        match self.exchange_ic() {
            Ok(params) => {
                info!(
                    "NVMe/TCP connection ready: cpda={} maxh2cdata={} hdgst={} ddgst={}",
                    params.cpda, params.maxh2cdata, params.digests.header, params.digests.data
                );
                self.negotiated = Some(params);
                self.set_state(ConnectionState::Ready);
                Ok(params)
            }
            Err(e) => {
                warn!("NVMe/TCP negotiation failed: {}", e);
                self.release_transport();
                self.set_state(ConnectionState::Idle);
                Err(e)
            }
        }
    }

    fn exchange_ic(&mut self) -> NvmeTcpResult<NegotiatedParams> {
        let requested = self.config.requested_digests();
        let icreq = IcReq::new(self.config.hpda, requested, self.config.maxr2t);
        reserve(&mut self.tx, IcReq::SIZE)?;
        icreq.encode(&mut self.tx);
        trace!("send {:?}", icreq);
        self.send_tx()?;

        grow(&mut self.rx, IcResp::SIZE)?;
        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport
            .recv_exact(&mut self.rx[..PduHeader::SIZE])
            .map_err(truncated_icresp)?;
        let header = PduHeader::decode(&self.rx[..PduHeader::SIZE])?;

        if header.pdu_type == PduType::C2HTermReq {
            let info = self.read_term_req(header)?;
            self.termination = Some(info.clone());
            return Err(NvmeTcpError::TerminationNotice {
                fes: info.fes,
                fei: info.fei,
            });
        }
        if header.pdu_type != PduType::IcResp {
            return Err(NvmeTcpError::sequence(format!(
                "expected ICResp, got {:?}",
                header.pdu_type
            )));
        }
        if header.hlen as usize != IcResp::SIZE {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_HLEN,
                format!("ICResp hlen {}", header.hlen),
            ));
        }
        if header.plen as usize != IcResp::SIZE {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_PLEN,
                format!("ICResp plen {}", header.plen),
            ));
        }

        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport
            .recv_exact(&mut self.rx[PduHeader::SIZE..IcResp::SIZE])
            .map_err(truncated_icresp)?;
        let icresp = IcResp::decode(&self.rx[..IcResp::SIZE])?;
        trace!("received {:?}", icresp);

        if icresp.pfv != 0 {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::UnsupportedParameters,
                FEI_ICRESP_PFV,
                format!("unsupported PDU format version {}", icresp.pfv),
            ));
        }
        if icresp.cpda > MAX_PDA {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_ICRESP_CPDA,
                format!("cpda {} exceeds {}", icresp.cpda, MAX_PDA),
            ));
        }
        if icresp.maxh2cdata < MIN_MAXH2CDATA || icresp.maxh2cdata % 4 != 0 {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_ICRESP_MAXH2CDATA,
                format!("invalid maxh2cdata {}", icresp.maxh2cdata),
            ));
        }
        let granted = icresp.digests;
        if (granted.header && !requested.header) || (granted.data && !requested.data) {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_ICRESP_DGST,
                format!(
                    "controller enabled digests {:?} beyond those requested {:?}",
                    granted, requested
                ),
            ));
        }
        if granted != requested {
            debug!(
                "Controller declined digests: requested {:?}, granted {:?}",
                requested, granted
            );
        }

        Ok(NegotiatedParams {
            pfv: icresp.pfv,
            hpda: self.config.hpda,
            cpda: icresp.cpda,
            digests: granted,
            maxh2cdata: icresp.maxh2cdata,
            maxr2t: self.config.maxr2t,
        })
    }

    fn read_term_req(&mut self, header: PduHeader) -> NvmeTcpResult<TerminationInfo> {
        let plen = header.plen as usize;
        if plen < TermReq::SIZE || plen > TermReq::SIZE + MAX_TERM_REQ_DATA {
            return Err(NvmeTcpError::malformed(
                FEI_PLEN,
                format!("termination request plen {}", plen),
            ));
        }
        grow(&mut self.rx, plen)?;
        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport.recv_exact(&mut self.rx[PduHeader::SIZE..plen])?;
        let (req, data) = TermReq::decode(&self.rx[..plen], TermDirection::ControllerToHost)?;
        Ok(termination_info(&req, data))
    }

    fn send_tx(&mut self) -> NvmeTcpResult<()> {
        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport.send(&self.tx)?;
        self.tx.clear();
        Ok(())
    }

    fn params(&self) -> NvmeTcpResult<NegotiatedParams> {
        self.negotiated.ok_or(NvmeTcpError::InvalidState {
            expected: ConnectionState::Ready,
            actual: self.state,
        })
    }

    /// Route fatal errors: leave Ready and remember what to report at teardown
    fn track<T>(&mut self, result: NvmeTcpResult<T>) -> NvmeTcpResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state == ConnectionState::Ready {
                warn!("NVMe/TCP connection failed: {}", e);
                if let Some((fes, fei)) = e.termination_cause() {
                    let hlen = self.rx.get(2).copied().unwrap_or(0) as usize;
                    let len = hlen.min(self.rx.len()).min(MAX_TERM_REQ_DATA);
                    self.pending_abort = Some(PendingAbort {
                        fes,
                        fei,
                        header: self.rx[..len].to_vec(),
                    });
                }
                self.set_state(ConnectionState::Terminating);
            }
        }
        result
    }

    fn allocate_cid(&mut self) -> NvmeTcpResult<u16> {
        if self.table.len() + self.completed.len() > u16::MAX as usize {
            return Err(NvmeTcpError::Resource(
                "all command identifiers in flight".to_string(),
            ));
        }
        loop {
            let cid = self.next_cid;
            self.next_cid = self.next_cid.wrapping_add(1);
            if !self.table.contains(cid) && !self.completed.iter().any(|c| c.cid() == cid) {
                return Ok(cid);
            }
        }
    }

    /// Send a command capsule and return its command id
    ///
    /// Writes up to `max_in_capsule_data` travel in the capsule; larger writes
    /// and all reads move through R2T/H2CData and C2HData PDUs while waiting.
    pub fn submit<C: SubmissionEntry>(
        &mut self,
        mut command: C,
        data: DataTransfer,
    ) -> NvmeTcpResult<u16> {
        self.require(ConnectionState::Ready)?;
        let params = self.params()?;
        let length = data.len()?;
        let cid = self.allocate_cid()?;

        let in_capsule = matches!(data, DataTransfer::ToController(_))
            && length <= self.config.max_in_capsule_data;
        let inline = match &data {
            DataTransfer::ToController(bytes) if in_capsule => bytes.clone(),
            _ => Bytes::new(),
        };
        command.set_cid(cid);
        command.set_sgl(if in_capsule {
            SglDescriptor::in_capsule(length)
        } else {
            SglDescriptor::transport(length)
        });
        let fabrics_type = command.fabrics_type();

        let opts = params.outbound();
        reserve(
            &mut self.tx,
            CapsuleCmd::SIZE + 2 * DIGEST_SIZE + opts.data_alignment + inline.len(),
        )?;
        CapsuleCmd::new(command.encode_sqe(), &inline).encode(&mut self.tx, &opts);

        self.table.register(cid, fabrics_type, data, in_capsule)?;
        trace!(
            "send CapsuleCmd cid={} fctype={:?} in-capsule={}",
            cid,
            fabrics_type,
            inline.len()
        );
        let result = self.send_tx();
        self.track(result)?;
        Ok(cid)
    }

    /// Block until the command `cid` completes
    pub fn wait(&mut self, cid: u16) -> NvmeTcpResult<CompletedCommand> {
        if let Some(pos) = self.completed.iter().position(|c| c.cid() == cid) {
            if let Some(done) = self.completed.remove(pos) {
                return Ok(done);
            }
        }
        self.require(ConnectionState::Ready)?;
        if !self.table.contains(cid) {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "cid {} is not in flight",
                cid
            )));
        }

        loop {
            let result = self.receive_one();
            if let Some(done) = self.track(result)? {
                if done.cid() == cid {
                    return Ok(done);
                }
                trace!("queued completion for cid {}", done.cid());
                self.completed.push_back(done);
            }
        }
    }

    /// Block until any submitted command completes
    pub fn poll(&mut self) -> NvmeTcpResult<CompletedCommand> {
        if let Some(done) = self.completed.pop_front() {
            return Ok(done);
        }
        self.require(ConnectionState::Ready)?;
        if self.table.is_empty() {
            return Err(NvmeTcpError::InvalidArgument(
                "no command in flight".to_string(),
            ));
        }
        loop {
            let result = self.receive_one();
            if let Some(done) = self.track(result)? {
                return Ok(done);
            }
        }
    }

    /// Submit a command and wait for its completion
    pub fn execute<C: SubmissionEntry>(
        &mut self,
        command: C,
        data: DataTransfer,
    ) -> NvmeTcpResult<CompletedCommand> {
        let cid = self.submit(command, data)?;
        self.wait(cid)
    }

    /// Receive and process one PDU
    fn receive_one(&mut self) -> NvmeTcpResult<Option<CompletedCommand>> {
        let params = self.params()?;
        let header = self.read_pdu(&params)?;
        let plen = header.plen as usize;

        let received = match decode_pdu(&self.rx[..plen])? {
            Pdu::CapsuleResp(resp) => {
                let cqe = NvmeCompletion::from_bytes(&resp.cqe).unwrap_or_default();
                if self.config.strict_phase && cqe.phase() {
                    return Err(NvmeTcpError::protocol(
                        FatalErrorStatus::InvalidPduHeaderField,
                        FEI_CQE_STATUS,
                        format!("completion for cid {} has phase tag set", cqe.cid),
                    ));
                }
                trace!("received CapsuleResp {:?}", cqe);
                Received::Completed(self.table.complete(cqe)?)
            }
            Pdu::C2HData(pdu, data) => match self.table.handle_c2h(&pdu, data)? {
                C2HOutcome::Completed(done) => Received::Completed(done),
                C2HOutcome::Pending => Received::Nothing,
            },
            Pdu::R2T(r2t) => Received::R2T(r2t),
            Pdu::C2HTermReq(req, data) | Pdu::H2CTermReq(req, data) => {
                Received::Terminated(termination_info(&req, data))
            }
            other => {
                return Err(NvmeTcpError::sequence(format!(
                    "unexpected {:?} on a ready connection",
                    other.pdu_type()
                )))
            }
        };

        match received {
            Received::Nothing => Ok(None),
            Received::Completed(done) => Ok(Some(done)),
            Received::R2T(r2t) => {
                self.answer_r2t(&r2t, &params)?;
                Ok(None)
            }
            Received::Terminated(info) => {
                let (fes, fei) = (info.fes, info.fei);
                self.termination = Some(info);
                self.set_state(ConnectionState::Terminating);
                Err(NvmeTcpError::TerminationNotice { fes, fei })
            }
        }
    }

    /// Read one complete PDU into the receive buffer
    fn read_pdu(&mut self, params: &NegotiatedParams) -> NvmeTcpResult<PduHeader> {
        grow(&mut self.rx, PduHeader::SIZE)?;
        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport.recv_exact(&mut self.rx[..PduHeader::SIZE])?;

        let header = PduHeader::decode(&self.rx[..PduHeader::SIZE])?;
        header.check_header_len()?;
        let plen = header.plen as usize;
        if plen > self.config.max_pdu_len as usize {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_PLEN,
                format!(
                    "{:?} plen {} exceeds limit {}",
                    header.pdu_type, plen, self.config.max_pdu_len
                ),
            ));
        }

        if header.pdu_type.carries_header_digest()
            && header.flags.header_digest() != params.digests.header
        {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_FLAGS,
                format!("{:?} header digest flag disagrees with negotiation", header.pdu_type),
            ));
        }
        if header.pdo != 0 && header.flags.data_digest() != params.digests.data {
            return Err(NvmeTcpError::protocol(
                FatalErrorStatus::InvalidPduHeaderField,
                FEI_FLAGS,
                format!("{:?} data digest flag disagrees with negotiation", header.pdu_type),
            ));
        }

        grow(&mut self.rx, plen)?;
        let transport = self.transport.as_mut().ok_or(NvmeTcpError::ConnectionClosed)?;
        transport.recv_exact(&mut self.rx[PduHeader::SIZE..plen])?;
        trace!("received {:?}", header);
        Ok(header)
    }

    fn answer_r2t(&mut self, r2t: &R2T, params: &NegotiatedParams) -> NvmeTcpResult<()> {
        let chunks = self
            .table
            .handle_r2t(r2t, params.maxh2cdata, params.maxr2t)?;
        let opts = params.outbound();
        for chunk in chunks {
            let pdu = H2CData {
                cccid: chunk.cccid,
                ttag: chunk.ttag,
                datao: chunk.datao,
                datal: chunk.data.len() as u32,
                last_pdu: chunk.last,
            };
            reserve(
                &mut self.tx,
                H2CData::SIZE + 2 * DIGEST_SIZE + opts.data_alignment + chunk.data.len(),
            )?;
            pdu.encode(&mut self.tx, &opts, &chunk.data);
            trace!(
                "send H2CData cid={} ttag={:#x} offset={} length={} last={}",
                pdu.cccid,
                pdu.ttag,
                pdu.datao,
                pdu.datal,
                pdu.last_pdu
            );
            self.send_tx()?;
        }
        self.table.r2t_complete(r2t.cccid, r2t.ttag);
        Ok(())
    }

    /// Fabrics Connect on the admin queue, creating an association
    pub fn fabrics_connect(&mut self, subnqn: &str) -> NvmeTcpResult<FabricsCompletion> {
        self.require(ConnectionState::Ready)?;
        if let Some(assoc) = &self.association {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "already associated with controller {:#06x} of {}",
                assoc.cntlid, assoc.subnqn
            )));
        }

        let data = ConnectData::for_host(&self.host, subnqn)?;
        let command = FabricsCommand::connect(
            0,
            self.config.queue_size - 1,
            0,
            self.config.keep_alive_timeout_ms,
        );
        let done = self
            .execute(command, DataTransfer::ToController(data.to_bytes()))?
            .into_result()?;
        let view = done.fabrics().ok_or_else(|| {
            NvmeTcpError::sequence(format!("cid {} completed without a Fabrics type", done.cid()))
        })?;

        let cntlid = view.cntlid().unwrap_or_default();
        if view.authentication_required() {
            warn!(
                "Controller {:#06x} requires in-band authentication, which is not performed",
                cntlid
            );
        }
        info!("Associated with controller {:#06x} of {}", cntlid, subnqn);
        self.association = Some(Association {
            cntlid,
            subnqn: subnqn.to_string(),
            qid: 0,
        });
        Ok(view)
    }

    /// Read a controller property
    pub fn property_get(&mut self, property: PropertyOffset) -> NvmeTcpResult<u64> {
        let command = FabricsCommand::property_get(property as u32, property.is_eight_bytes());
        let done = self.execute(command, DataTransfer::None)?.into_result()?;
        let value = done
            .fabrics()
            .and_then(|f| f.property_value())
            .unwrap_or_default();
        Ok(if property.is_eight_bytes() {
            value
        } else {
            value & 0xFFFF_FFFF
        })
    }

    /// Write a controller property
    pub fn property_set(&mut self, property: PropertyOffset, value: u64) -> NvmeTcpResult<()> {
        let command =
            FabricsCommand::property_set(property as u32, property.is_eight_bytes(), value);
        self.execute(command, DataTransfer::None)?.into_result()?;
        Ok(())
    }

    /// Orderly shutdown (`Ready -> Terminating -> Closed`)
    ///
    /// Sends a Fabrics Disconnect first when an association exists; its
    /// failure is logged and teardown continues.
    pub fn disconnect(&mut self) -> NvmeTcpResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(NvmeTcpError::ConnectionClosed);
        }

        if self.state == ConnectionState::Ready {
            if let Some(assoc) = self.association.clone() {
                match self
                    .execute(FabricsCommand::disconnect(), DataTransfer::None)
                    .and_then(CompletedCommand::into_result)
                {
                    Ok(_) => debug!("Disconnected from controller {:#06x}", assoc.cntlid),
                    Err(e) => warn!(
                        "Disconnect from controller {:#06x} failed: {}",
                        assoc.cntlid, e
                    ),
                }
            }
            if self.state == ConnectionState::Ready {
                self.set_state(ConnectionState::Terminating);
            }
        }

        self.close();
        Ok(())
    }

    /// Send an H2CTermReq citing `fes`/`fei` and close the connection
    ///
    /// `offending_header` is truncated to 152 bytes.
    pub fn abort(
        &mut self,
        fes: FatalErrorStatus,
        fei: u32,
        offending_header: &[u8],
    ) -> NvmeTcpResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(NvmeTcpError::ConnectionClosed);
        }
        self.pending_abort = None;
        let result = self.send_term_req(fes, fei, offending_header);
        self.close();
        result
    }

    fn send_term_req(
        &mut self,
        fes: FatalErrorStatus,
        fei: u32,
        offending_header: &[u8],
    ) -> NvmeTcpResult<()> {
        if self.transport.is_none() {
            return Ok(());
        }
        warn!("Terminating connection: fes={} fei={:#x}", fes, fei);
        reserve(&mut self.tx, TermReq::SIZE + MAX_TERM_REQ_DATA)?;
        TermReq::new(TermDirection::HostToController, fes, fei)
            .encode(&mut self.tx, offending_header);
        self.send_tx()
    }

    /// Release the transport and scratch buffers (`-> Closed`)
    ///
    /// A host-detected protocol violation is reported to the controller in an
    /// H2CTermReq first.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(abort) = self.pending_abort.take() {
            if let Err(e) = self.send_term_req(abort.fes, abort.fei, &abort.header) {
                debug!("H2CTermReq not delivered: {}", e);
            }
        }

        let abandoned = self.table.drain();
        if !abandoned.is_empty() {
            debug!("Abandoning {} in-flight commands: {:?}", abandoned.len(), abandoned);
        }
        self.release_transport();
        self.completed.clear();
        self.tx = Vec::new();
        self.rx = Vec::new();
        self.association = None;
        self.set_state(ConnectionState::Closed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.config.target())
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .field("association", &self.association)
            .field("in_flight", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory transport: replays scripted controller bytes, records host bytes
    struct ScriptedTransport {
        inbound: Vec<u8>,
        pos: usize,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    impl TransportConnection for ScriptedTransport {
        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            let end = self.pos + buf.len();
            if end > self.inbound.len() {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buf.copy_from_slice(&self.inbound[self.pos..end]);
            self.pos = end;
            Ok(())
        }

        fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedDialer {
        inbound: Vec<u8>,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    impl Dialer for ScriptedDialer {
        fn transport_type(&self) -> crate::config::TransportType {
            crate::config::TransportType::Tcp
        }

        fn dial(&self, _config: &ConnectionConfig) -> NvmeTcpResult<Box<dyn TransportConnection>> {
            Ok(Box::new(ScriptedTransport {
                inbound: self.inbound.clone(),
                pos: 0,
                sent: self.sent.clone(),
            }))
        }
    }

    struct RefusingDialer;

    impl Dialer for RefusingDialer {
        fn transport_type(&self) -> crate::config::TransportType {
            crate::config::TransportType::Tcp
        }

        fn dial(&self, _config: &ConnectionConfig) -> NvmeTcpResult<Box<dyn TransportConnection>> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
        }
    }

    fn icresp(resp: IcResp) -> Vec<u8> {
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        buf
    }

    fn scripted(config: ConnectionConfig, inbound: Vec<u8>) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let dialer = ScriptedDialer {
            inbound,
            sent: sent.clone(),
        };
        (Connection::with_dialer(config, Box::new(dialer)).unwrap(), sent)
    }

    fn capsule_resp(cqe: NvmeCompletion) -> Vec<u8> {
        let mut buf = Vec::new();
        crate::pdu::CapsuleResp::new(cqe.to_bytes()).encode(&mut buf, &PduOptions::plain());
        buf
    }

    #[test]
    fn test_negotiation_stores_parameters() {
        let inbound = icresp(IcResp::new(1, DigestOptions::NONE, 8192));
        let (mut conn, sent) = scripted(ConnectionConfig::default(), inbound);
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::TcpConnected);
        let params = conn.negotiate().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(params.cpda, 1);
        assert_eq!(params.maxh2cdata, 8192);
        assert_eq!(conn.negotiated(), Some(&params));

        // Scenario A: the ICReq on the wire
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 128);
        assert_eq!(&sent[..8], &[0x00, 0x00, 0x80, 0x00, 0x80, 0x00, 0x00, 0x00]);
        assert_eq!(sent[11], 0);
    }

    #[test]
    fn test_negotiation_rejects_bad_pfv() {
        let mut resp = IcResp::new(0, DigestOptions::NONE, 8192);
        resp.pfv = 1;
        let (mut conn, _) = scripted(ConnectionConfig::default(), icresp(resp));
        conn.connect().unwrap();
        let err = conn.negotiate().unwrap_err();
        assert!(matches!(
            err,
            NvmeTcpError::Protocol {
                fes: FatalErrorStatus::UnsupportedParameters,
                ..
            }
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.negotiated().is_none());
    }

    #[test]
    fn test_negotiation_rejects_bad_maxh2cdata_and_cpda() {
        for resp in [
            IcResp::new(0, DigestOptions::NONE, 2048),
            IcResp::new(0, DigestOptions::NONE, 4098),
            IcResp::new(32, DigestOptions::NONE, 8192),
        ] {
            let (mut conn, _) = scripted(ConnectionConfig::default(), icresp(resp));
            conn.connect().unwrap();
            assert!(matches!(
                conn.negotiate(),
                Err(NvmeTcpError::Protocol { .. })
            ));
            assert_eq!(conn.state(), ConnectionState::Idle);
        }
    }

    #[test]
    fn test_negotiation_rejects_unrequested_digest() {
        let inbound = icresp(IcResp::new(0, DigestOptions::new(true, false), 8192));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        assert!(matches!(
            conn.negotiate(),
            Err(NvmeTcpError::Protocol { fei: 11, .. })
        ));
    }

    #[test]
    fn test_negotiation_truncated_icresp() {
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound.truncate(100);
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        assert!(matches!(
            conn.negotiate(),
            Err(NvmeTcpError::Protocol { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_negotiation_wrong_pdu_type() {
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound[0] = PduType::CapsuleResp as u8;
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        let err = conn.negotiate().unwrap_err();
        assert_eq!(
            err.termination_cause(),
            Some((FatalErrorStatus::PduSequenceError, 0))
        );
    }

    #[test]
    fn test_connect_failure_stays_idle() {
        let mut conn =
            Connection::with_dialer(ConnectionConfig::default(), Box::new(RefusingDialer)).unwrap();
        assert!(matches!(conn.connect(), Err(NvmeTcpError::Transport(_))));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_state_guards() {
        let inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);

        let err = conn
            .submit(FabricsCommand::disconnect(), DataTransfer::None)
            .unwrap_err();
        assert!(matches!(
            err,
            NvmeTcpError::InvalidState {
                expected: ConnectionState::Ready,
                actual: ConnectionState::Idle,
            }
        ));
        assert!(matches!(
            conn.negotiate(),
            Err(NvmeTcpError::InvalidState { .. })
        ));

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.connect(), Err(NvmeTcpError::ConnectionClosed)));
        assert!(matches!(
            conn.disconnect(),
            Err(NvmeTcpError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_command_ids_increase_and_unknown_completion_fails() {
        // Scenario C
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound.extend(capsule_resp(NvmeCompletion::success(7)));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let first = conn
            .submit(FabricsCommand::property_get(0x08, false), DataTransfer::None)
            .unwrap();
        let second = conn
            .submit(FabricsCommand::property_get(0x00, true), DataTransfer::None)
            .unwrap();
        assert!(second > first);
        assert_eq!(conn.in_flight(), 2);

        let err = conn.wait(first).unwrap_err();
        assert!(matches!(err, NvmeTcpError::Protocol { .. }));
        assert_eq!(conn.state(), ConnectionState::Terminating);
    }

    #[test]
    fn test_command_ids_wrap_and_skip_busy_ids() {
        let inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let property_get = || FabricsCommand::property_get(0x1C, false);
        conn.next_cid = u16::MAX;
        let a = conn.submit(property_get(), DataTransfer::None).unwrap();
        let b = conn.submit(property_get(), DataTransfer::None).unwrap();
        assert_eq!((a, b), (u16::MAX, 0));

        // 65535 and 0 are in flight, 2 is waiting to be picked up
        conn.completed.push_back(CompletedCommand {
            completion: NvmeCompletion::success(2),
            fabrics_type: None,
            data: Bytes::new(),
        });
        conn.next_cid = u16::MAX;
        assert_eq!(conn.submit(property_get(), DataTransfer::None).unwrap(), 1);
        assert_eq!(conn.submit(property_get(), DataTransfer::None).unwrap(), 3);
        assert_eq!(conn.in_flight(), 4);
    }

    #[test]
    fn test_repeated_r2t_is_not_answered_twice() {
        let r2t = R2T {
            cccid: 0,
            ttag: 1,
            r2to: 0,
            r2tl: 4096,
        };
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        r2t.encode(&mut inbound, &PduOptions::plain());
        r2t.encode(&mut inbound, &PduOptions::plain());
        let (mut conn, sent) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let cid = conn
            .submit(
                crate::command::NvmeCommand::write(1, 0, 31),
                DataTransfer::ToController(Bytes::from(vec![0xA5u8; 16384])),
            )
            .unwrap();
        assert_eq!(cid, 0);
        let err = conn.wait(cid).unwrap_err();
        assert_eq!(
            err.termination_cause(),
            Some((FatalErrorStatus::PduSequenceError, R2T::R2TO_OFFSET))
        );
        assert_eq!(conn.state(), ConnectionState::Terminating);

        // ICReq, the capsule and a single H2CData for the first R2T
        let before = sent.lock().unwrap().len();
        assert_eq!(before, IcReq::SIZE + CapsuleCmd::SIZE + H2CData::SIZE + 4096);

        conn.close();
        let sent = sent.lock().unwrap();
        let (req, data) =
            TermReq::decode(&sent[before..], TermDirection::HostToController).unwrap();
        assert_eq!(req.status(), Some(FatalErrorStatus::PduSequenceError));
        assert_eq!(req.fei, R2T::R2TO_OFFSET);
        assert_eq!(data[0], PduType::R2T as u8);
    }

    #[test]
    fn test_pipelined_completions_are_queued() {
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound.extend(capsule_resp(NvmeCompletion::success(1)));
        inbound.extend(capsule_resp(NvmeCompletion::success(0)));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let a = conn
            .submit(FabricsCommand::property_get(0x1C, false), DataTransfer::None)
            .unwrap();
        let b = conn
            .submit(FabricsCommand::property_get(0x14, false), DataTransfer::None)
            .unwrap();
        assert_eq!((a, b), (0, 1));

        assert_eq!(conn.wait(a).unwrap().cid(), 0);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.wait(b).unwrap().cid(), 1);
    }

    #[test]
    fn test_phase_tag_checked() {
        let mut cqe = NvmeCompletion::success(0);
        cqe.set_phase(true);
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound.extend(capsule_resp(cqe));
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();
        let err = conn
            .execute(FabricsCommand::property_get(0x08, false), DataTransfer::None)
            .unwrap_err();
        assert_eq!(
            err.termination_cause(),
            Some((FatalErrorStatus::InvalidPduHeaderField, FEI_CQE_STATUS))
        );
    }

    #[test]
    fn test_c2h_term_req_moves_to_terminating() {
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        TermReq::new(
            TermDirection::ControllerToHost,
            FatalErrorStatus::PduSequenceError,
            0,
        )
        .encode(&mut inbound, &[0xAB; 8]);
        let (mut conn, _) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let err = conn
            .execute(FabricsCommand::property_get(0x08, false), DataTransfer::None)
            .unwrap_err();
        assert!(matches!(
            err,
            NvmeTcpError::TerminationNotice { fes: 0x02, fei: 0 }
        ));
        assert_eq!(conn.state(), ConnectionState::Terminating);
        let info = conn.termination().unwrap();
        assert_eq!(info.status(), Some(FatalErrorStatus::PduSequenceError));
        assert_eq!(info.data, vec![0xAB; 8]);

        conn.disconnect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_abort_sends_h2c_term_req() {
        let inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        let (mut conn, sent) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();

        let header = [0x07u8, 0, 24, 24, 48, 0, 0, 0];
        conn.abort(FatalErrorStatus::DataTransferOutOfRange, 12, &header)
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let sent = sent.lock().unwrap();
        let term = &sent[IcReq::SIZE..];
        let (req, data) = TermReq::decode(term, TermDirection::HostToController).unwrap();
        assert_eq!(req.status(), Some(FatalErrorStatus::DataTransferOutOfRange));
        assert_eq!(req.fei, 12);
        assert_eq!(data, &header);
    }

    #[test]
    fn test_close_reports_pending_violation() {
        let mut inbound = icresp(IcResp::new(0, DigestOptions::NONE, 8192));
        inbound.extend(capsule_resp(NvmeCompletion::success(42)));
        let (mut conn, sent) = scripted(ConnectionConfig::default(), inbound);
        conn.connect().unwrap();
        conn.negotiate().unwrap();
        let cid = conn
            .submit(FabricsCommand::property_get(0x08, false), DataTransfer::None)
            .unwrap();
        assert!(conn.wait(cid).is_err());

        let before = sent.lock().unwrap().len();
        conn.close();
        let sent = sent.lock().unwrap();
        let (req, data) =
            TermReq::decode(&sent[before..], TermDirection::HostToController).unwrap();
        assert_eq!(req.status(), Some(FatalErrorStatus::InvalidPduHeaderField));
        assert_eq!(data.len(), 24);
        assert_eq!(data[0], PduType::CapsuleResp as u8);
    }
}
