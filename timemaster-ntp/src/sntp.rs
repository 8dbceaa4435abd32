//! SNTP client (RFC 4330) used as the authoritative time source.
//!
//! Servers are tried in order; the first valid reply wins. The returned time
//! is the local receive time corrected by the computed clock offset.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use timemaster_core::time::unix_millis;
use timemaster_core::{Result, TimeMasterError, TimeSource};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

const PACKET_LEN: usize = 48;
const DEFAULT_PORT: u16 = 123;
/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_OFFSET_SECS: i64 = 2_208_988_800;
/// LI = 0, VN = 4, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0b00_100_011;

/// Configuration for the SNTP time source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SntpConfig {
    /// `host` or `host:port`, tried in order
    pub servers: Vec<String>,
    /// Per-server reply timeout
    pub timeout: Duration,
}

impl Default for SntpConfig {
    fn default() -> Self {
        Self {
            servers: vec!["pool.ntp.org".to_string()],
            timeout: Duration::from_millis(1500),
        }
    }
}

/// Time source backed by one or more SNTP servers.
#[derive(Debug, Clone)]
pub struct SntpTimeSource {
    config: SntpConfig,
}

impl SntpTimeSource {
    pub fn new(config: SntpConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(TimeMasterError::config("at least one NTP server is required"));
        }
        if config.timeout.is_zero() {
            return Err(TimeMasterError::config("NTP timeout must be positive"));
        }
        Ok(Self { config })
    }

    pub fn servers(&self) -> &[String] {
        &self.config.servers
    }

    async fn query(&self, server: &str) -> Result<i64> {
        let addr = resolve(server).await?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;

        let originate = unix_millis()?;
        let request = encode_request(originate);
        socket.send(&request).await?;

        let mut buf = [0u8; 128];
        let len = timeout(self.config.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| TimeMasterError::Timeout {
                operation: format!("SNTP query to {server}"),
            })??;
        let destination = unix_millis()?;

        let reply = decode_reply(&buf[..len], &request[40..48])?;
        let offset = reply.offset_millis(originate, destination);
        debug!("SNTP server {} answered, clock offset {} ms", server, offset);

        Ok(destination + offset)
    }
}

#[async_trait]
impl TimeSource for SntpTimeSource {
    async fn now_millis(&self) -> Result<i64> {
        for server in &self.config.servers {
            match self.query(server).await {
                Ok(now) => return Ok(now),
                Err(e) => warn!("SNTP server {} failed: {}", server, e),
            }
        }

        Err(TimeMasterError::time_source(format!(
            "impossible to retrieve network time, tried {:?}",
            self.config.servers
        )))
    }
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    let target = if server.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok())
        && !server.ends_with(']')
    {
        server.to_string()
    } else {
        format!("{server}:{DEFAULT_PORT}")
    };

    let address = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| TimeMasterError::time_source(format!("no address for {target}")));
    address
}

/// Server timestamps of a reply, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reply {
    receive: i64,
    transmit: i64,
}

impl Reply {
    /// `((T2 - T1) + (T3 - T4)) / 2`
    fn offset_millis(&self, originate: i64, destination: i64) -> i64 {
        ((self.receive - originate) + (self.transmit - destination)) / 2
    }
}

fn encode_request(originate_millis: i64) -> [u8; PACKET_LEN] {
    let mut buf = BytesMut::with_capacity(PACKET_LEN);
    buf.put_u8(CLIENT_HEADER);
    buf.put_bytes(0, 39);
    buf.put_u64(to_ntp(originate_millis));

    let mut packet = [0u8; PACKET_LEN];
    packet.copy_from_slice(&buf);
    packet
}

fn decode_reply(packet: &[u8], sent_transmit: &[u8]) -> Result<Reply> {
    if packet.len() < PACKET_LEN {
        return Err(TimeMasterError::time_source(format!(
            "short SNTP reply: {} bytes",
            packet.len()
        )));
    }

    let mode = packet[0] & 0b111;
    if mode != 4 && mode != 5 {
        return Err(TimeMasterError::time_source(format!(
            "unexpected SNTP mode {mode}"
        )));
    }
    if packet[1] == 0 {
        return Err(TimeMasterError::time_source("kiss-o'-death reply (stratum 0)"));
    }
    if &packet[24..32] != sent_transmit {
        return Err(TimeMasterError::time_source(
            "SNTP reply does not answer our request",
        ));
    }

    let mut fields = &packet[32..48];
    let receive = fields.get_u64();
    let transmit = fields.get_u64();
    if transmit == 0 {
        return Err(TimeMasterError::time_source("SNTP reply has no transmit time"));
    }

    Ok(Reply {
        receive: from_ntp(receive),
        transmit: from_ntp(transmit),
    })
}

fn to_ntp(unix_millis: i64) -> u64 {
    let secs = unix_millis.div_euclid(1000) + NTP_UNIX_OFFSET_SECS;
    let millis = unix_millis.rem_euclid(1000) as u64;
    // Rounded up so that `from_ntp` truncates back to the same millisecond.
    let fraction = ((millis << 32) + 999) / 1000;
    ((secs as u64) << 32) | fraction
}

fn from_ntp(timestamp: u64) -> i64 {
    let secs = (timestamp >> 32) as i64 - NTP_UNIX_OFFSET_SECS;
    let fraction = timestamp & 0xffff_ffff;
    let millis = ((fraction * 1000) >> 32) as i64;
    secs * 1000 + millis
}
