use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use tracing::{debug, instrument, trace, warn};

use crate::protocols::error::{ReadError, ReadResult};
use crate::storage::schema::{CommState, ReachabilityTransition};

const PAYLOAD: [u8; 56] = [0; 56];

impl ReachabilityTransition {
    /// Transition logged when a device moves from `prior` to `current`.
    /// An unset prior state never produces one.
    pub fn between(prior: Option<CommState>, current: CommState) -> Option<Self> {
        match (prior?, current) {
            (CommState::Ok, CommState::Nok) => Some(ReachabilityTransition::Alarm),
            (CommState::Nok, CommState::Ok) => Some(ReachabilityTransition::BackToNormal),
            _ => None,
        }
    }
}

/// Outcome of one echo request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub alive: bool,

    /// Unknown when the device did not answer
    pub round_trip_ms: Option<f64>,

    pub packet_loss_pct: f64,
}

impl ProbeResult {
    pub fn reached(round_trip: Duration) -> Self {
        Self {
            alive: true,
            round_trip_ms: Some(round_trip.as_secs_f64() * 1000.0),
            packet_loss_pct: 0.0,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            alive: false,
            round_trip_ms: None,
            packet_loss_pct: 100.0,
        }
    }

    pub fn comm_state(&self) -> CommState {
        CommState::from_alive(self.alive)
    }
}

/// Reachability check against a device address. Never fails: any error is
/// reported as an unreachable device.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// Single ICMP echo per probe
pub struct IcmpProber {
    v4: Client,
    v6: Option<Client>,
    timeout: Duration,
    ident: AtomicU16,
}

impl IcmpProber {
    /// Needs permission to open ICMP sockets (raw, or datagram where the
    /// kernel allows unprivileged ping).
    pub fn new(timeout: Duration) -> std::io::Result<Self> {
        let v4 = Client::new(&Config::default())?;
        let v6 = match Client::new(&Config::builder().kind(ICMP::V6).build()) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("ICMPv6 unavailable, IPv6 devices will be reported unreachable: {e}");
                None
            }
        };

        Ok(Self {
            v4,
            v6,
            timeout,
            ident: AtomicU16::new(std::process::id() as u16),
        })
    }

    async fn echo(&self, address: &str) -> ReadResult<Duration> {
        let ip = resolve(address).await?;
        let client = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => self
                .v6
                .as_ref()
                .ok_or_else(|| ReadError::Config("no ICMPv6 socket".to_string()))?,
        };

        let ident = PingIdentifier(self.ident.fetch_add(1, Ordering::Relaxed));
        let mut pinger = client.pinger(ip, ident).await;
        pinger.timeout(self.timeout);

        match pinger.ping(PingSequence(0), &PAYLOAD).await {
            Ok((_, round_trip)) => Ok(round_trip),
            Err(surge_ping::SurgeError::Timeout { .. }) => Err(ReadError::Timeout(self.timeout)),
            Err(e) => Err(ReadError::Connection(e.to_string())),
        }
    }
}

#[async_trait]
impl Prober for IcmpProber {
    #[instrument(skip(self))]
    async fn probe(&self, address: &str) -> ProbeResult {
        match self.echo(address).await {
            Ok(round_trip) => {
                trace!(?round_trip, "echo reply");
                ProbeResult::reached(round_trip)
            }
            Err(e) => {
                debug!("no echo reply: {e}");
                ProbeResult::unreachable()
            }
        }
    }
}

async fn resolve(address: &str) -> ReadResult<IpAddr> {
    let address = address.trim();
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await?
        .next()
        .map(|socket| socket.ip())
        .ok_or_else(|| ReadError::Connection(format!("{address} does not resolve")))
}
