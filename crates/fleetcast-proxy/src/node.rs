//! The per-peer runtime.
//!
//! One [`Peer`] exists for every other node of the cluster. It runs three
//! independent one-second tickers:
//!
//! - **ping** tracks reachability and smooths the measured latency,
//! - **metrics** samples the peer's CPU and memory,
//! - **files** collects the peer's file inventory across its in-memory
//!   and on-disk filesystems and, where advertised, its RTMP and SRT
//!   channel lists.
//!
//! Nothing here holds a lock across network I/O: samples are taken, then
//! swapped into the runtime state under the state lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetcast_consensus::api::{ConfigResponse, MetricsResponse, CONFIG_VERSION};
use fleetcast_core::{Error, ErrorKind, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Cadence of the ping, metrics and files tickers.
const TICK: Duration = Duration::from_secs(1);

/// Peer HTTP timeout.
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The peer does not answer.
    Disconnected,
    /// The peer answers pings.
    Connected,
}

impl PeerState {
    /// Returns the state string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// Last known resource sample of a peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerResources {
    /// Number of cores.
    pub ncpu: f64,
    /// Current load, 0-100 per core times `ncpu`.
    pub cpu_load: f64,
    /// Used memory in bytes.
    pub mem_used: u64,
    /// Total memory in bytes.
    pub mem_total: u64,
}

/// Snapshot of a peer for observability.
#[derive(Debug, Clone)]
pub struct PeerAbout {
    /// Node id.
    pub id: u64,
    /// Cluster API address.
    pub address: String,
    /// Connection state.
    pub state: PeerState,
    /// When the peer last answered.
    pub last_contact: Option<Instant>,
    /// Exponentially smoothed latency.
    pub latency: Duration,
    /// Last resource sample.
    pub resources: PeerResources,
}

/// A file inventory update pushed towards the cluster file index.
#[derive(Debug, Clone)]
pub struct PeerFiles {
    /// Node id.
    pub id: u64,
    /// Connection state at collection time.
    pub state: PeerState,
    /// Prefixed file names (`mem:`, `disk:`, `rtmp:`, `srt:`).
    pub files: Vec<String>,
    /// When the inventory was collected.
    pub last_update: Instant,
}

#[derive(Debug)]
struct RtmpAccess {
    address: String,
    token: String,
}

#[derive(Debug)]
struct SrtAccess {
    address: String,
    passphrase: String,
    token: String,
}

#[derive(Debug)]
struct RuntimeState {
    state: PeerState,
    last_contact: Option<Instant>,
    latency_seconds: f64,
    resources: PeerResources,
    files: Vec<String>,
    last_update: Option<Instant>,
}

/// The runtime of one remote node.
pub struct Peer {
    id: u64,
    address: String,
    username: String,
    password: String,
    client: reqwest::Client,

    rtmp: Option<RtmpAccess>,
    srt: Option<SrtAccess>,

    state: RwLock<RuntimeState>,
    updates: mpsc::Sender<PeerFiles>,
    stop_tx: watch::Sender<bool>,
}

impl Peer {
    /// Connects to a peer's cluster API: fetches and checks its config
    /// (version 3 required) and derives the RTMP/SRT access coordinates.
    ///
    /// # Errors
    ///
    /// Returns `Upstream` if the peer is unreachable, `InvalidArgument`
    /// if it speaks another config version.
    pub async fn connect(
        id: u64,
        address: String,
        username: String,
        password: String,
        updates: mpsc::Sender<PeerFiles>,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(e.to_string()))?;

        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .ok_or_else(|| Error::invalid_argument(format!("invalid address '{address}'")))?;

        let config: ConfigResponse = client
            .get(format!("http://{address}/v1/config"))
            .basic_auth(&username, Some(&password))
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, format!("peer config: {e}")))?
            .json()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, format!("peer config: {e}")))?;

        if config.version != CONFIG_VERSION {
            return Err(Error::invalid_argument(format!(
                "unsupported peer config version: {}",
                config.version
            )));
        }

        let rtmp = if config.rtmp.enable {
            derive_rtmp_access(&host, &config)
        } else {
            None
        };

        let srt = if config.srt.enable {
            port_of(&config.srt.address).map(|port| SrtAccess {
                address: format!("srt://{host}:{port}"),
                passphrase: config.srt.passphrase.clone(),
                token: config.srt.token.clone(),
            })
        } else {
            None
        };

        let (stop_tx, _) = watch::channel(false);

        let peer = Arc::new(Self {
            id,
            address,
            username,
            password,
            client,
            rtmp,
            srt,
            state: RwLock::new(RuntimeState {
                state: PeerState::Disconnected,
                last_contact: None,
                latency_seconds: 0.0,
                resources: PeerResources::default(),
                files: Vec::new(),
                last_update: None,
            }),
            updates,
            stop_tx,
        });

        peer.clone().spawn_ping();
        peer.clone().spawn_metrics();
        peer.clone().spawn_files();

        info!(node_id = id, address = %peer.address, "connected peer");

        Ok(peer)
    }

    /// Stops all tickers of this peer.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Returns the node id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns an observability snapshot.
    #[must_use]
    pub fn about(&self) -> PeerAbout {
        let state = self.state.read();
        PeerAbout {
            id: self.id,
            address: self.address.clone(),
            state: state.state,
            last_contact: state.last_contact,
            latency: Duration::from_secs_f64(state.latency_seconds.max(0.0)),
            resources: state.resources,
        }
    }

    /// Returns the current file inventory. Stale or disconnected peers
    /// report an empty list.
    #[must_use]
    pub fn files(&self) -> PeerFiles {
        let state = self.state.read();

        let fresh = state
            .last_update
            .is_some_and(|t| t.elapsed() <= crate::index::FRESHNESS_WINDOW);

        PeerFiles {
            id: self.id,
            state: state.state,
            files: if state.state == PeerState::Connected && fresh {
                state.files.clone()
            } else {
                Vec::new()
            },
            last_update: state.last_update.unwrap_or_else(Instant::now),
        }
    }

    /// Builds the URL under which a prefixed path is reachable on this
    /// peer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown prefixes, `NotFound` for
    /// media prefixes the peer does not serve.
    pub fn url_for(&self, prefixed_path: &str) -> Result<String> {
        let (prefix, path) = prefixed_path
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument("no prefix provided"))?;

        match prefix {
            "mem" => Ok(format!("http://{}/v1/fs/mem{path}", self.address)),
            "disk" => Ok(format!("http://{}/v1/fs/disk{path}", self.address)),
            "rtmp" => {
                let rtmp = self
                    .rtmp
                    .as_ref()
                    .ok_or_else(|| Error::not_found("peer serves no rtmp"))?;
                Ok(rtmp_url(&rtmp.address, &rtmp.token, path))
            }
            "srt" => {
                let srt = self
                    .srt
                    .as_ref()
                    .ok_or_else(|| Error::not_found("peer serves no srt"))?;
                Ok(srt_url(&srt.address, &srt.passphrase, &srt.token, path))
            }
            _ => Err(Error::invalid_argument(format!("unknown prefix '{prefix}'"))),
        }
    }

    /// Fetches the content of a `mem:` or `disk:` file from this peer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`Upstream` per the peer's answer.
    pub async fn get_file(&self, prefixed_path: &str) -> Result<bytes::Bytes> {
        let (prefix, _) = prefixed_path
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument("no prefix provided"))?;

        if prefix != "mem" && prefix != "disk" {
            return Err(Error::invalid_argument(format!("unknown prefix '{prefix}'")));
        }

        let url = self.url_for(prefixed_path)?;
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(Error::not_found(format!("file '{prefixed_path}'")));
        }
        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::Upstream,
                format!("peer returned {}", response.status()),
            ));
        }

        response.bytes().await.map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("http://{}{path}", self.address))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::Upstream,
                format!("peer returned {}", response.status()),
            ));
        }

        response.json().await.map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))
    }

    fn spawn_ping(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => return,
                }

                let started = Instant::now();
                let ok = self
                    .client
                    .get(format!("http://{}/v1/ping", self.address))
                    .basic_auth(&self.username, Some(&self.password))
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);
                let measured = started.elapsed().as_secs_f64();

                let mut state = self.state.write();
                if ok {
                    state.state = PeerState::Connected;
                    state.last_contact = Some(Instant::now());
                } else {
                    state.state = PeerState::Disconnected;
                }
                state.latency_seconds = state.latency_seconds * 0.2 + measured * 0.8;

                metrics::gauge!("fleetcast_peer_latency_seconds", "node_id" => self.id.to_string())
                    .set(state.latency_seconds);
            }
        });
    }

    fn spawn_metrics(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => return,
                }

                match self.get_json::<MetricsResponse>("/v1/metrics").await {
                    Ok(sample) => {
                        let mut state = self.state.write();
                        state.resources = PeerResources {
                            ncpu: sample.cpu_ncpu,
                            cpu_load: (100.0 - sample.cpu_idle) * sample.cpu_ncpu,
                            mem_used: sample.mem_total.saturating_sub(sample.mem_free),
                            mem_total: sample.mem_total,
                        };
                        state.last_contact = Some(Instant::now());
                    }
                    Err(e) => {
                        debug!(node_id = self.id, error = %e, "metrics query failed");
                        let mut state = self.state.write();
                        state.resources = PeerResources {
                            ncpu: 1.0,
                            cpu_load: 100.0,
                            mem_used: 0,
                            mem_total: 0,
                        };
                    }
                }
            }
        });
    }

    fn spawn_files(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => return,
                }

                self.collect_files().await;

                // Non-blocking push; a full channel drops the update, the
                // next tick delivers a fresh one.
                if self.updates.try_send(self.files()).is_err() {
                    warn!(node_id = self.id, "updates channel full, dropping inventory");
                }
            }
        });
    }

    /// Fans out the inventory queries concurrently and swaps the merged
    /// list into the runtime state.
    async fn collect_files(&self) {
        let mem = self.get_json::<Vec<String>>("/v1/fs/mem");
        let disk = self.get_json::<Vec<String>>("/v1/fs/disk");
        let rtmp = async {
            if self.rtmp.is_some() {
                self.get_json::<Vec<String>>("/v1/rtmp").await
            } else {
                Ok(Vec::new())
            }
        };
        let srt = async {
            if self.srt.is_some() {
                self.get_json::<Vec<String>>("/v1/srt").await
            } else {
                Ok(Vec::new())
            }
        };

        let (mem, disk, rtmp, srt) = tokio::join!(mem, disk, rtmp, srt);

        let mut files = Vec::new();
        files.extend(mem.unwrap_or_default().into_iter().map(|f| format!("mem:{f}")));
        files.extend(disk.unwrap_or_default().into_iter().map(|f| format!("disk:{f}")));
        files.extend(rtmp.unwrap_or_default().into_iter().map(|f| format!("rtmp:{f}")));
        files.extend(srt.unwrap_or_default().into_iter().map(|f| format!("srt:{f}")));

        let mut state = self.state.write();
        state.files = files;
        state.last_update = Some(Instant::now());
        state.last_contact = Some(Instant::now());
    }
}

fn port_of(address: &str) -> Option<&str> {
    address.rsplit_once(':').map(|(_, port)| port)
}

fn derive_rtmp_access(host: &str, config: &ConfigResponse) -> Option<RtmpAccess> {
    let host_is_ip = host.parse::<std::net::IpAddr>().is_ok();

    // rtmps only when the peer has TLS and the host is a name a
    // certificate can cover.
    let (scheme, address) = if config.rtmp.enable_tls && !host_is_ip {
        ("rtmps", config.rtmp.address_tls.as_str())
    } else {
        ("rtmp", config.rtmp.address.as_str())
    };

    let port = port_of(address)?;

    Some(RtmpAccess {
        address: format!("{scheme}://{host}:{port}"),
        token: config.rtmp.token.clone(),
    })
}

fn query_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                escaped.push(byte as char);
            }
            _ => escaped.push_str(&format!("%{byte:02X}")),
        }
    }
    escaped
}

fn rtmp_url(base: &str, token: &str, path: &str) -> String {
    let mut url = format!("{base}{path}");
    if !token.is_empty() {
        url.push_str("?token=");
        url.push_str(&query_escape(token));
    }
    url
}

fn srt_url(base: &str, passphrase: &str, token: &str, path: &str) -> String {
    let mut url = format!("{base}?mode=caller");
    if !passphrase.is_empty() {
        url.push_str("&passphrase=");
        url.push_str(&query_escape(passphrase));
    }

    let mut streamid = format!("#!:m=request,r={path}");
    if !token.is_empty() {
        streamid.push_str(",token=");
        streamid.push_str(token);
    }

    url.push_str("&streamid=");
    url.push_str(&query_escape(&streamid));
    url
}

#[cfg(test)]
mod tests {
    use fleetcast_consensus::api::MediaEndpoint;

    use super::*;

    #[test]
    fn test_rtmp_url() {
        assert_eq!(rtmp_url("rtmp://peer:1935", "", "/live/cam"), "rtmp://peer:1935/live/cam");
        assert_eq!(
            rtmp_url("rtmp://peer:1935", "s&cret", "/live/cam"),
            "rtmp://peer:1935/live/cam?token=s%26cret"
        );
    }

    #[test]
    fn test_srt_url() {
        let url = srt_url("srt://peer:6000", "", "", "foo");
        assert_eq!(url, "srt://peer:6000?mode=caller&streamid=%23%21%3Am%3Drequest%2Cr%3Dfoo");

        let url = srt_url("srt://peer:6000", "pass", "tok", "foo");
        assert!(url.starts_with("srt://peer:6000?mode=caller&passphrase=pass&streamid="));
        assert!(url.contains("token"));
    }

    fn config(rtmp: MediaEndpoint, srt: MediaEndpoint) -> ConfigResponse {
        ConfigResponse { version: CONFIG_VERSION, id: 2, name: "peer".to_string(), rtmp, srt }
    }

    #[test]
    fn test_rtmp_tls_needs_name_host() {
        let endpoint = MediaEndpoint {
            enable: true,
            address: ":1935".to_string(),
            address_tls: ":1936".to_string(),
            enable_tls: true,
            ..Default::default()
        };

        let access = derive_rtmp_access("peer.example.com", &config(endpoint.clone(), MediaEndpoint::default()))
            .unwrap();
        assert_eq!(access.address, "rtmps://peer.example.com:1936");

        // a raw IP never gets rtmps
        let access =
            derive_rtmp_access("192.168.1.10", &config(endpoint, MediaEndpoint::default())).unwrap();
        assert_eq!(access.address, "rtmp://192.168.1.10:1935");
    }

    #[test]
    fn test_query_escape() {
        assert_eq!(query_escape("abc-123_~."), "abc-123_~.");
        assert_eq!(query_escape("#!:m=request"), "%23%21%3Am%3Drequest");
    }

    #[test]
    fn test_peer_state_strings() {
        assert_eq!(PeerState::Connected.as_str(), "connected");
        assert_eq!(PeerState::Disconnected.as_str(), "disconnected");
    }
}
