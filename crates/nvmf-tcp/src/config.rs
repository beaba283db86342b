//! NVMe/TCP connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::digest::DigestOptions;
use crate::error::{NvmeTcpError, NvmeTcpResult};
use crate::pdu::MAX_PDA;

/// IANA port for NVMe/TCP I/O controllers
pub const DEFAULT_PORT: u16 = 4420;

/// IANA port for NVMe/TCP discovery controllers
pub const DISCOVERY_PORT: u16 = 8009;

/// Smallest `maxh2cdata` a controller may advertise
pub const MIN_MAXH2CDATA: u32 = 4096;

/// Smallest scratch buffer capacity
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TransportType {
    /// TCP transport
    #[default]
    Tcp,
}

impl TransportType {
    /// Get the default port for this transport
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Tcp => DEFAULT_PORT,
        }
    }

    /// Get the transport string (for nvme-cli compatibility)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
        }
    }
}

/// Settings for one host-side NVMe/TCP connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport used to reach the controller
    pub transport: TransportType,

    /// Controller host name or IP address
    pub addr: String,

    /// Controller port (default: 4420)
    pub port: u16,

    /// Request header digests (CRC32C)
    pub header_digest: bool,

    /// Request data digests (CRC32C)
    pub data_digest: bool,

    /// Host PDU data alignment, 0's based dwords (0-31)
    pub hpda: u8,

    /// Maximum outstanding R2Ts per command, 0's based
    pub maxr2t: u32,

    /// Enable TCP_NODELAY
    pub nodelay: bool,

    /// Timeout for establishing the TCP connection
    pub connect_timeout: Option<Duration>,

    /// Socket read timeout
    pub read_timeout: Option<Duration>,

    /// Socket write timeout
    pub write_timeout: Option<Duration>,

    /// Initial capacity of each scratch buffer
    pub buffer_size: usize,

    /// Largest write sent as in-capsule data
    pub max_in_capsule_data: u32,

    /// Largest PDU accepted from the controller
    pub max_pdu_len: u32,

    /// Admin queue size used by Fabrics Connect (1's based)
    pub queue_size: u16,

    /// Keep alive timeout sent in Fabrics Connect (0 disables)
    pub keep_alive_timeout_ms: u32,

    /// Reject completions whose phase tag is set
    pub strict_phase: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportType::Tcp,
            addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            header_digest: false,
            data_digest: false,
            hpda: 0,
            maxr2t: 0,
            nodelay: true,
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            write_timeout: None,
            buffer_size: 64 * 1024,         // 64KB
            max_in_capsule_data: 8192,      // 8KB
            max_pdu_len: 4 * 1024 * 1024,   // 4MB
            queue_size: 32,
            keep_alive_timeout_ms: 0,
            strict_phase: true,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for `addr:port` with defaults otherwise
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            ..Self::default()
        }
    }

    /// Configuration for a discovery controller at `addr`
    pub fn discovery(addr: impl Into<String>) -> Self {
        Self::new(addr, DISCOVERY_PORT)
    }

    /// Request or decline header and data digests
    pub fn with_digests(mut self, header: bool, data: bool) -> Self {
        self.header_digest = header;
        self.data_digest = data;
        self
    }

    /// Set the socket read and write timeouts
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    /// Digests requested in the ICReq
    pub fn requested_digests(&self) -> DigestOptions {
        DigestOptions::new(self.header_digest, self.data_digest)
    }

    /// `addr:port` as passed to the dialer
    pub fn target(&self) -> String {
        if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> NvmeTcpResult<()> {
        if self.addr.is_empty() {
            return Err(NvmeTcpError::InvalidArgument(
                "addr must not be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(NvmeTcpError::InvalidArgument(
                "port must be > 0".to_string(),
            ));
        }

        if self.hpda > MAX_PDA {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "hpda must be <= {}, got {}",
                MAX_PDA, self.hpda
            )));
        }

        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "buffer_size must be >= {}",
                MIN_BUFFER_SIZE
            )));
        }

        if self.max_pdu_len < MIN_MAXH2CDATA {
            return Err(NvmeTcpError::InvalidArgument(format!(
                "max_pdu_len must be >= {}",
                MIN_MAXH2CDATA
            )));
        }

        if self.max_in_capsule_data >= self.max_pdu_len {
            return Err(NvmeTcpError::InvalidArgument(
                "max_in_capsule_data must be < max_pdu_len".to_string(),
            ));
        }

        if self.queue_size < 2 {
            return Err(NvmeTcpError::InvalidArgument(
                "queue_size must be >= 2".to_string(),
            ));
        }

        if self.connect_timeout == Some(Duration::ZERO)
            || self.read_timeout == Some(Duration::ZERO)
            || self.write_timeout == Some(Duration::ZERO)
        {
            return Err(NvmeTcpError::InvalidArgument(
                "timeouts must be non-zero; use None to disable".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.port, 4420);
        assert_eq!(config.hpda, 0);
        assert_eq!(config.maxr2t, 0);
        assert!(!config.header_digest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_type() {
        assert_eq!(TransportType::Tcp.default_port(), 4420);
        assert_eq!(TransportType::Tcp.as_str(), "tcp");
        assert_eq!(ConnectionConfig::discovery("10.0.0.1").port, 8009);
    }

    #[test]
    fn test_validation() {
        let mut config = ConnectionConfig::default();
        config.hpda = 32;
        assert!(matches!(
            config.validate(),
            Err(NvmeTcpError::InvalidArgument(_))
        ));

        let mut config = ConnectionConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = ConnectionConfig::default();
        config.buffer_size = 64;
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_io_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_formatting() {
        assert_eq!(ConnectionConfig::new("10.0.0.2", 4420).target(), "10.0.0.2:4420");
        assert_eq!(ConnectionConfig::new("::1", 4420).target(), "[::1]:4420");
        assert_eq!(
            ConnectionConfig::new("nvme.example.com", 8009).target(),
            "nvme.example.com:8009"
        );
    }

    #[test]
    fn test_serialization() {
        let config = ConnectionConfig::new("192.168.1.10", 4420)
            .with_digests(true, true)
            .with_io_timeout(Some(Duration::from_secs(5)));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let sparse: ConnectionConfig =
            serde_json::from_str(r#"{"addr":"10.1.1.1","transport":"tcp"}"#).unwrap();
        assert_eq!(sparse.addr, "10.1.1.1");
        assert_eq!(sparse.port, DEFAULT_PORT);
    }
}
