//! NVMe over TCP (NVMe/TCP) initiator
//!
//! This crate implements the host side of an NVMe/TCP connection: the PDU
//! wire format, connection initialization, Fabrics command capsules and the
//! R2T/H2CData/C2HData data transfer engine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Connection                           │
//! │   Idle → TcpConnected → Negotiating → Ready                │
//! │        → Terminating → Closed                              │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐  ┌──────────────────┐  ┌─────────────┐  │
//! │  │ FabricsCommand│  │ CorrelationTable │  │ ConnectData │  │
//! │  │ NvmeCommand   │  │  cid → transfer  │  │ properties  │  │
//! │  └───────┬───────┘  └────────┬─────────┘  └─────────────┘  │
//! │          ▼                   ▼                             │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │ PDU codec: ICReq/ICResp, CapsuleCmd/Resp, R2T,     │    │
//! │  │ H2CData, C2HData, TermReq  (+ CRC32C digests)      │    │
//! │  └──────────────────────────┬─────────────────────────┘    │
//! └─────────────────────────────┼──────────────────────────────┘
//!                               ▼
//!                  Dialer → TransportConnection (TCP)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nvmf_tcp::{Connection, ConnectionConfig, PropertyOffset};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("192.168.1.100", 4420).with_digests(true, true);
//! let mut conn = Connection::establish(config)?;
//!
//! conn.fabrics_connect("nqn.2024-01.io.example:storage")?;
//! let cap = conn.property_get(PropertyOffset::Cap)?;
//! println!("CAP = {:#018x}", cap);
//!
//! conn.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod capsule;
pub mod command;
pub mod config;
pub mod connection;
pub mod digest;
pub mod error;
pub mod pdu;
pub mod transfer;
pub mod transport;

// Re-exports
pub use capsule::{
    validate_nqn, ConnectData, ControllerCapabilities, FabricsCompletion, FabricsResult,
    HostIdentity, NvmeVersion, PropertyOffset, DISCOVERY_NQN,
};
pub use command::{
    FabricsBody, FabricsCommand, FabricsType, IoOpcode, NvmeCommand, NvmeCompletion,
    SglDescriptor, SubmissionEntry,
};
pub use config::{ConnectionConfig, TransportType, DEFAULT_PORT, DISCOVERY_PORT};
pub use connection::{
    Association, Connection, ConnectionState, NegotiatedParams, TerminationInfo,
};
pub use digest::{crc32c, DigestOptions};
pub use error::{FatalErrorStatus, NvmeStatus, NvmeTcpError, NvmeTcpResult};
pub use pdu::{
    decode_pdu, C2HData, CapsuleCmd, CapsuleResp, H2CData, IcReq, IcResp, Pdu, PduFlags,
    PduHeader, PduOptions, PduType, TermDirection, TermReq, R2T,
};
pub use transfer::{CompletedCommand, CorrelationTable, DataTransfer};
pub use transport::{Dialer, TcpConnection, TcpDialer, TransportConnection};
