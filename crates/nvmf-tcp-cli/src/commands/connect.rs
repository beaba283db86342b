//! connect command - establish an NVMe/TCP connection
//!
//! Opens the TCP stream, negotiates digests and alignment with the controller
//! and prints the result. With a subsystem NQN it also performs a Fabrics
//! Connect on the admin queue, reads CAP and VS, then disconnects.

use anyhow::{Context, Result};
use std::time::Duration;

use nvmf_tcp::{
    Connection, ConnectionConfig, ControllerCapabilities, NvmeVersion, PropertyOffset,
    DISCOVERY_PORT,
};

/// Arguments of the connect command
pub struct ConnectArgs<'a> {
    pub address: &'a str,
    pub port: u16,
    pub discovery: bool,
    pub header_digest: bool,
    pub data_digest: bool,
    pub subnqn: Option<&'a str>,
    pub timeout_secs: u64,
}

impl ConnectArgs<'_> {
    fn config(&self) -> ConnectionConfig {
        let port = if self.discovery { DISCOVERY_PORT } else { self.port };
        let timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        let mut config = ConnectionConfig::new(self.address, port)
            .with_digests(self.header_digest, self.data_digest)
            .with_io_timeout(timeout);
        config.connect_timeout = timeout;
        config
    }
}

/// Execute the connect command
///
/// # Errors
/// Returns an error if:
/// - The configuration is invalid
/// - The TCP connection or ICReq/ICResp negotiation fails
/// - Fabrics Connect or a property read fails (with `--subnqn`)
pub fn execute(args: ConnectArgs<'_>) -> Result<()> {
    let config = args.config();
    let target = config.target();

    tracing::info!("Connecting to {}", target);
    let mut conn = Connection::new(config).context("Invalid connection settings")?;
    conn.connect()
        .with_context(|| format!("Failed to connect to {}", target))?;
    let params = conn
        .negotiate()
        .with_context(|| format!("Connection initialization with {} failed", target))?;

    println!("Connected to {}", target);
    println!("  Header digest:  {}", on_off(params.digests.header));
    println!("  Data digest:    {}", on_off(params.digests.data));
    println!("  CPDA:           {}", params.cpda);
    println!("  MAXH2CDATA:     {} bytes", params.maxh2cdata);

    if let Some(subnqn) = args.subnqn {
        let view = conn
            .fabrics_connect(subnqn)
            .with_context(|| format!("Fabrics Connect to {} failed", subnqn))?;
        println!();
        println!("Associated with {}", subnqn);
        if let Some(cntlid) = view.cntlid() {
            println!("  Controller ID:  {:#06x}", cntlid);
        }
        if view.authentication_required() {
            println!("  Warning: controller requires in-band authentication");
        }

        let cap = conn
            .property_get(PropertyOffset::Cap)
            .context("Failed to read CAP")?;
        let caps = ControllerCapabilities::from_u64(cap);
        println!("  CAP:            {:#018x}", cap);
        println!("  Max queue size: {}", caps.max_queue_entries());
        println!("  Ready timeout:  {} ms", caps.timeout_ms());

        let vs = conn
            .property_get(PropertyOffset::Vs)
            .context("Failed to read VS")?;
        println!("  Version:        {}", NvmeVersion::from_u32(vs as u32));
    }

    conn.disconnect().context("Disconnect failed")?;
    tracing::debug!("Connection to {} closed", target);
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
