//! The SRT server: local channels and the cross-node proxy table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetcast_core::{Error, ErrorKind, Result};
use fleetcast_proxy::ClusterReader;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::conn::{parse_stream_id, ConnectMode, Dialer, SrtConn, StreamInfo};
use crate::pubsub::PubSub;

/// Receive latency configured on upstream dials.
const PROXY_LATENCY: Duration = Duration::from_millis(200);

/// A locally published resource with its subscribers.
struct Channel {
    pubsub: PubSub,
    subscribers: RwLock<HashMap<String, Arc<dyn SrtConn>>>,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self { pubsub: PubSub::new(), subscribers: RwLock::new(HashMap::new()) })
    }

    fn add_subscriber(&self, conn: Arc<dyn SrtConn>) -> String {
        let id = conn.remote_addr();
        self.subscribers.write().insert(id.clone(), conn);
        id
    }

    fn remove_subscriber(&self, id: &str) {
        if let Some(conn) = self.subscribers.write().remove(id) {
            conn.close();
        }
    }
}

/// A resource whose publisher lives on another node: one upstream dial,
/// one fan-out, a listener count.
struct ProxyEntry {
    listeners: AtomicU64,
    pubsub: PubSub,
    upstream: Arc<dyn SrtConn>,
}

/// Configuration of the SRT server.
pub struct SrtServerConfig {
    /// Token required in stream ids. Empty = no token required.
    pub token: String,
    /// Passphrase for encrypted connections. Empty = encryption rejected.
    pub passphrase: String,
    /// Resolves resources published on other nodes.
    pub cluster: Arc<dyn ClusterReader>,
    /// Dials upstream publishers.
    pub dialer: Arc<dyn Dialer>,
}

/// The SRT server.
pub struct SrtServer {
    token: String,
    passphrase: String,
    cluster: Arc<dyn ClusterReader>,
    dialer: Arc<dyn Dialer>,

    channels: RwLock<HashMap<String, Arc<Channel>>>,
    // The proxy table lock spans URL lookup and upstream dial so a
    // resource is dialed at most once per node.
    proxies: Mutex<HashMap<String, Arc<ProxyEntry>>>,
}

impl SrtServer {
    /// Creates the server.
    #[must_use]
    pub fn new(config: SrtServerConfig) -> Arc<Self> {
        Arc::new(Self {
            token: config.token,
            passphrase: config.passphrase,
            cluster: config.cluster,
            dialer: config.dialer,
            channels: RwLock::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
        })
    }

    /// Gate for incoming connections: parses the stream id and checks
    /// mode, resource, encryption pairing and token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed stream ids or modes,
    /// `Forbidden` for encryption or token mismatches.
    pub fn check_connect(
        &self,
        stream_id: &str,
        is_encrypted: bool,
    ) -> Result<(ConnectMode, StreamInfo)> {
        let info = parse_stream_id(stream_id)?;

        if info.resource.is_empty() {
            return Err(Error::invalid_argument("stream resource not provided"));
        }

        let mode = match info.mode.as_str() {
            "publish" => ConnectMode::Publish,
            "request" => ConnectMode::Subscribe,
            _ => return Err(Error::invalid_argument("invalid connection mode")),
        };

        if self.passphrase.is_empty() {
            if is_encrypted {
                return Err(Error::new(
                    ErrorKind::Forbidden,
                    "connection must not be encrypted",
                ));
            }
        } else if !is_encrypted {
            return Err(Error::new(ErrorKind::Forbidden, "connection has to be encrypted"));
        }

        if !self.token.is_empty() && self.token != info.token {
            return Err(Error::new(ErrorKind::Forbidden, "invalid token"));
        }

        Ok((mode, info))
    }

    /// Serves a publisher connection. Blocks until the publisher
    /// disconnects; all subscribers of the channel are closed then.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the resource is already published on
    /// this node.
    pub async fn handle_publish(&self, conn: Arc<dyn SrtConn>) -> Result<()> {
        let info = parse_stream_id(&conn.stream_id())?;
        let resource = info.resource;

        let channel = {
            let mut channels = self.channels.write();
            if channels.contains_key(&resource) {
                None
            } else {
                let channel = Channel::new();
                channels.insert(resource.clone(), channel.clone());
                Some(channel)
            }
        };

        let Some(channel) = channel else {
            conn.close();
            return Err(Error::already_exists(format!("'{resource}' is already publishing")));
        };

        info!(resource = %resource, client = %conn.remote_addr(), "publish start");

        if let Err(e) = channel.pubsub.publish(conn.as_ref()).await {
            error!(resource = %resource, error = %e, "publish ended with error");
        }

        self.channels.write().remove(&resource);

        let subscribers: Vec<String> = channel.subscribers.read().keys().cloned().collect();
        for id in subscribers {
            channel.remove_subscriber(&id);
        }

        info!(resource = %resource, "publish stop");

        conn.close();
        Ok(())
    }

    /// Serves a subscriber connection. Blocks until the subscriber or the
    /// publisher disconnects.
    ///
    /// If no local publisher exists, the cluster file index is consulted;
    /// a fresh hit is dialed once and fanned out to every local
    /// subscriber of the resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no publisher for the resource is known
    /// anywhere in the cluster.
    pub async fn handle_subscribe(self: &Arc<Self>, conn: Arc<dyn SrtConn>) -> Result<()> {
        let info = parse_stream_id(&conn.stream_id())?;
        let resource = info.resource;

        // Local publisher first.
        let local = self.channels.read().get(&resource).cloned();
        if let Some(channel) = local {
            info!(resource = %resource, client = %conn.remote_addr(), "subscribe start");

            let id = channel.add_subscriber(conn.clone());
            let _ = channel.pubsub.subscribe(conn.as_ref()).await;
            channel.remove_subscriber(&id);

            info!(resource = %resource, client = %conn.remote_addr(), "subscribe stop");
            return Ok(());
        }

        let entry = self.attach_proxy(&resource, &conn).await?;

        info!(resource = %resource, client = %conn.remote_addr(), "proxy subscribe start");

        let _ = entry.pubsub.subscribe(conn.as_ref()).await;

        info!(resource = %resource, client = %conn.remote_addr(), "proxy subscribe stop");

        // Last one out closes the upstream; the pump then removes the
        // entry.
        let mut proxies = self.proxies.lock().await;
        let remaining = entry.listeners.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            entry.upstream.close();
            proxies.remove(&resource);
        }

        conn.close();
        Ok(())
    }

    /// Finds or installs the proxy entry for a remote resource,
    /// incrementing its listener count.
    async fn attach_proxy(
        self: &Arc<Self>,
        resource: &str,
        conn: &Arc<dyn SrtConn>,
    ) -> Result<Arc<ProxyEntry>> {
        let mut proxies = self.proxies.lock().await;

        if let Some(entry) = proxies.get(resource) {
            entry.listeners.fetch_add(1, Ordering::SeqCst);
            return Ok(entry.clone());
        }

        let url = self.cluster.get_url(&format!("srt:{resource}")).map_err(|_| {
            info!(resource = %resource, client = %conn.remote_addr(), "no publisher found");
            Error::not_found(format!("no publisher for '{resource}'"))
        })?;

        let upstream: Arc<dyn SrtConn> =
            Arc::from(self.dialer.dial(&url, PROXY_LATENCY).await.map_err(|e| {
                error!(address = %url, error = %e, "proxying address failed");
                Error::not_found(format!("no publisher for '{resource}'"))
            })?);

        info!(address = %url, "proxy publish start");

        let entry = Arc::new(ProxyEntry {
            listeners: AtomicU64::new(1),
            pubsub: PubSub::new(),
            upstream,
        });
        proxies.insert(resource.to_string(), entry.clone());

        let server = self.clone();
        let pump_entry = entry.clone();
        let pump_resource = resource.to_string();
        tokio::spawn(async move {
            if let Err(e) = pump_entry.pubsub.publish(pump_entry.upstream.as_ref()).await {
                error!(resource = %pump_resource, error = %e, "proxy publish failed");
            }

            pump_entry.upstream.close();
            server.proxies.lock().await.remove(&pump_resource);

            info!(resource = %pump_resource, "proxy publish stop");
        });

        Ok(entry)
    }

    /// Returns the listener count of a proxied resource.
    pub async fn proxy_listeners(&self, resource: &str) -> Option<u64> {
        let proxies = self.proxies.lock().await;
        proxies.get(resource).map(|e| e.listeners.load(Ordering::SeqCst))
    }

    /// Returns the names of the locally publishing channels.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }
}

impl fleetcast_consensus::api::ChannelLister for SrtServer {
    fn channels(&self) -> Vec<String> {
        SrtServer::channels(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    use super::*;

    /// In-memory connection: frames pushed into `feed` come out of
    /// `read_frame`; frames written go into `written`.
    struct TestConn {
        stream_id: String,
        addr: String,
        feed: Mutex<mpsc::UnboundedReceiver<Bytes>>,
        written: mpsc::UnboundedSender<Bytes>,
        closed: tokio::sync::watch::Sender<bool>,
    }

    struct TestConnDriver {
        feed: mpsc::UnboundedSender<Bytes>,
        written: Mutex<mpsc::UnboundedReceiver<Bytes>>,
        closed: tokio::sync::watch::Receiver<bool>,
    }

    fn test_conn(stream_id: &str, addr: &str) -> (Arc<TestConn>, TestConnDriver) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);

        let conn = Arc::new(TestConn {
            stream_id: stream_id.to_string(),
            addr: addr.to_string(),
            feed: Mutex::new(feed_rx),
            written: written_tx,
            closed: closed_tx,
        });
        let driver =
            TestConnDriver { feed: feed_tx, written: Mutex::new(written_rx), closed: closed_rx };

        (conn, driver)
    }

    #[async_trait]
    impl SrtConn for TestConn {
        fn stream_id(&self) -> String {
            self.stream_id.clone()
        }

        fn remote_addr(&self) -> String {
            self.addr.clone()
        }

        fn is_encrypted(&self) -> bool {
            false
        }

        async fn read_frame(&self) -> Result<Option<Bytes>> {
            if *self.closed.subscribe().borrow() {
                return Ok(None);
            }
            let mut feed = self.feed.lock().await;
            let mut closed = self.closed.subscribe();
            tokio::select! {
                frame = feed.recv() => Ok(frame),
                _ = closed.changed() => Ok(None),
            }
        }

        async fn write_frame(&self, frame: Bytes) -> Result<()> {
            if *self.closed.subscribe().borrow() {
                return Err(Error::internal("connection closed"));
            }
            self.written
                .send(frame)
                .map_err(|_| Error::internal("connection closed"))
        }

        fn close(&self) {
            let _ = self.closed.send(true);
        }
    }

    impl TestConnDriver {
        async fn next_written(&self) -> Option<Bytes> {
            let mut written = self.written.lock().await;
            timeout(Duration::from_secs(1), written.recv()).await.ok().flatten()
        }

        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }

    struct StaticCluster {
        url: Option<String>,
    }

    impl ClusterReader for StaticCluster {
        fn get_url(&self, _path: &str) -> Result<String> {
            self.url.clone().ok_or_else(|| Error::not_found("file"))
        }
    }

    /// A dialer handing out one prepared upstream connection.
    struct TestDialer {
        dials: AtomicUsize,
        upstream: Mutex<Option<Box<dyn SrtConn>>>,
    }

    #[async_trait]
    impl Dialer for TestDialer {
        async fn dial(&self, _url: &str, _latency: Duration) -> Result<Box<dyn SrtConn>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.upstream
                .lock()
                .await
                .take()
                .ok_or_else(|| Error::internal("no more upstreams"))
        }
    }

    fn server_with(url: Option<String>, dialer: Arc<TestDialer>) -> Arc<SrtServer> {
        SrtServer::new(SrtServerConfig {
            token: String::new(),
            passphrase: String::new(),
            cluster: Arc::new(StaticCluster { url }),
            dialer,
        })
    }

    fn no_dialer() -> Arc<TestDialer> {
        Arc::new(TestDialer { dials: AtomicUsize::new(0), upstream: Mutex::new(None) })
    }

    #[test]
    fn test_check_connect() {
        let server = server_with(None, no_dialer());

        let (mode, info) = server.check_connect("#!:m=publish,r=foo", false).unwrap();
        assert_eq!(mode, ConnectMode::Publish);
        assert_eq!(info.resource, "foo");

        let (mode, _) = server.check_connect("#!:m=request,r=foo", false).unwrap();
        assert_eq!(mode, ConnectMode::Subscribe);

        assert!(server.check_connect("#!:m=bogus,r=foo", false).is_err());
        assert!(server.check_connect("#!:m=publish", false).is_err());
        // no passphrase configured: encrypted connections are rejected
        assert!(server.check_connect("#!:m=publish,r=foo", true).is_err());
    }

    #[test]
    fn test_check_connect_with_passphrase_and_token() {
        let server = SrtServer::new(SrtServerConfig {
            token: "tok".to_string(),
            passphrase: "secret".to_string(),
            cluster: Arc::new(StaticCluster { url: None }),
            dialer: no_dialer(),
        });

        assert!(server.check_connect("#!:m=publish,r=foo,token=tok", true).is_ok());
        // unencrypted rejected when a passphrase is set
        assert!(server.check_connect("#!:m=publish,r=foo,token=tok", false).is_err());
        // wrong token
        assert!(server.check_connect("#!:m=publish,r=foo,token=no", true).is_err());
    }

    #[tokio::test]
    async fn test_local_publish_subscribe() {
        let server = server_with(None, no_dialer());

        let (pub_conn, pub_driver) = test_conn("#!:m=publish,r=foo", "10.0.0.1:50000");
        let (sub_conn, sub_driver) = test_conn("#!:m=request,r=foo", "10.0.0.2:50000");

        let pub_server = server.clone();
        let publisher =
            tokio::spawn(async move { pub_server.handle_publish(pub_conn).await });

        // wait for the channel to appear
        while server.channels().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }

        let sub_server = server.clone();
        let subscriber =
            tokio::spawn(async move { sub_server.handle_subscribe(sub_conn).await });
        sleep(Duration::from_millis(20)).await;

        pub_driver.feed.send(Bytes::from_static(b"frame-1")).unwrap();
        assert_eq!(sub_driver.next_written().await.unwrap(), Bytes::from_static(b"frame-1"));

        // publisher disconnect ends the subscriber without error
        pub_driver.feed.send(Bytes::new()).ok();
        drop(pub_driver);
        publisher.await.unwrap().unwrap();
        subscriber.await.unwrap().unwrap();
        assert!(server.channels().is_empty());
    }

    #[tokio::test]
    async fn test_second_publisher_is_rejected() {
        let server = server_with(None, no_dialer());

        let (first, _first_driver) = test_conn("#!:m=publish,r=foo", "10.0.0.1:1");
        let (second, second_driver) = test_conn("#!:m=publish,r=foo", "10.0.0.2:2");

        let pub_server = server.clone();
        tokio::spawn(async move { pub_server.handle_publish(first).await });
        while server.channels().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }

        let err = server.handle_publish(second).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(second_driver.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_resource_is_not_found() {
        let server = server_with(None, no_dialer());

        let (conn, _driver) = test_conn("#!:m=request,r=ghost", "10.0.0.2:1");
        let err = server.handle_subscribe(conn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_proxy_fan_out_reference_counting() {
        let (upstream, upstream_driver) = test_conn("", "10.0.0.9:1");
        let dialer = Arc::new(TestDialer {
            dials: AtomicUsize::new(0),
            upstream: Mutex::new(Some(Box::new(TestConnShim(upstream)) as Box<dyn SrtConn>)),
        });
        let server = server_with(Some("srt://peer:6000?mode=caller".to_string()), dialer.clone());

        let (sub1, sub1_driver) = test_conn("#!:m=request,r=foo", "10.0.0.2:1");
        let (sub2, sub2_driver) = test_conn("#!:m=request,r=foo", "10.0.0.3:1");

        let s1 = server.clone();
        let sub1_task = tokio::spawn(async move { s1.handle_subscribe(sub1).await });
        // the first subscriber installs the proxy entry
        while server.proxy_listeners("foo").await.is_none() {
            sleep(Duration::from_millis(5)).await;
        }

        let s2 = server.clone();
        let sub2_task = tokio::spawn(async move { s2.handle_subscribe(sub2).await });
        while server.proxy_listeners("foo").await != Some(2) {
            sleep(Duration::from_millis(5)).await;
        }

        // one dial, both subscribers receive data
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        upstream_driver.feed.send(Bytes::from_static(b"payload")).unwrap();
        assert_eq!(sub1_driver.next_written().await.unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(sub2_driver.next_written().await.unwrap(), Bytes::from_static(b"payload"));

        // first subscriber leaves: upstream stays open. Closing the
        // driver's write side makes the subscriber's next write fail,
        // which ends its loop once a frame flows.
        close_subscriber(&sub1_driver).await;
        upstream_driver.feed.send(Bytes::from_static(b"tick")).unwrap();
        sub1_task.await.unwrap().unwrap();

        assert_eq!(server.proxy_listeners("foo").await, Some(1));
        assert!(!upstream_driver.is_closed());

        // last subscriber leaves: upstream is closed, entry removed
        close_subscriber(&sub2_driver).await;
        upstream_driver.feed.send(Bytes::from_static(b"tick")).unwrap();
        sub2_task.await.unwrap().unwrap();

        assert!(upstream_driver.is_closed());
        while server.proxy_listeners("foo").await.is_some() {
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close_subscriber(driver: &TestConnDriver) {
        driver.written.lock().await.close();
    }

    /// Unwraps the Arc-based test conn into the boxed trait object the
    /// dialer returns.
    struct TestConnShim(Arc<TestConn>);

    #[async_trait]
    impl SrtConn for TestConnShim {
        fn stream_id(&self) -> String {
            self.0.stream_id()
        }
        fn remote_addr(&self) -> String {
            self.0.remote_addr()
        }
        fn is_encrypted(&self) -> bool {
            self.0.is_encrypted()
        }
        async fn read_frame(&self) -> Result<Option<Bytes>> {
            self.0.read_frame().await
        }
        async fn write_frame(&self, frame: Bytes) -> Result<()> {
            self.0.write_frame(frame).await
        }
        fn close(&self) {
            self.0.close();
        }
    }
}
