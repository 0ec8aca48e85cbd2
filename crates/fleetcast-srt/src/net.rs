//! Framed TCP transport behind the connection seam.
//!
//! Frames travel length-prefixed (u32 big-endian) after a one-line
//! handshake carrying the stream id. This is the transport the proxy
//! needs to forward streams between nodes; the public-facing SRT wire
//! protocol is handled outside the cluster core.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleetcast_core::{Error, ErrorKind, Result};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::conn::{ConnectMode, Dialer, SrtConn};
use crate::server::SrtServer;

/// Largest accepted frame.
const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// A length-prefixed framed connection.
pub struct FramedConn {
    stream_id: String,
    addr: String,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl FramedConn {
    fn new(stream_id: String, addr: String, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Self {
            stream_id,
            addr,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            closed,
        }
    }
}

#[async_trait]
impl SrtConn for FramedConn {
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
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;

        let read = async {
            let len = match reader.read_u32().await {
                Ok(len) => len,
                Err(_) => return Ok(None),
            };
            if len > MAX_FRAME {
                return Err(Error::internal(format!("frame of {len} bytes refused")));
            }

            let mut frame = vec![0u8; len as usize];
            if reader.read_exact(&mut frame).await.is_err() {
                return Ok(None);
            }
            Ok(Some(Bytes::from(frame)))
        };

        tokio::select! {
            result = read => result,
            _ = closed.changed() => Ok(None),
        }
    }

    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        if *self.closed.subscribe().borrow() {
            return Err(Error::internal("connection closed"));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_u32(frame.len() as u32)
            .await
            .map_err(|e| Error::internal(e.to_string()))?;
        writer.write_all(&frame).await.map_err(|e| Error::internal(e.to_string()))?;
        Ok(())
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }
}

/// Dials upstream publishers over the framed TCP transport.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, url: &str, _latency: Duration) -> Result<Box<dyn SrtConn>> {
        let (address, stream_id) = parse_caller_url(url)?;

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| Error::new(ErrorKind::Upstream, format!("dialing {address}: {e}")))?;

        let conn = FramedConn::new(stream_id.clone(), address, stream);

        // Handshake: one line carrying the stream id.
        {
            let mut writer = conn.writer.lock().await;
            writer
                .write_all(format!("{stream_id}\n").as_bytes())
                .await
                .map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))?;
        }

        Ok(Box::new(conn))
    }
}

/// Extracts `host:port` and the decoded `streamid` parameter from a
/// `srt://host:port?mode=caller&streamid=…` URL.
fn parse_caller_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("srt://")
        .ok_or_else(|| Error::invalid_argument(format!("not an srt url: '{url}'")))?;

    let (address, query) = rest
        .split_once('?')
        .ok_or_else(|| Error::invalid_argument("missing query in srt url"))?;

    let stream_id = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("streamid="))
        .ok_or_else(|| Error::invalid_argument("missing streamid in srt url"))?;

    let stream_id = percent_decode_str(stream_id)
        .decode_utf8()
        .map_err(|_| Error::invalid_argument("undecodable streamid"))?
        .to_string();

    Ok((address.to_string(), stream_id))
}

/// Accepts framed connections and dispatches them into the server.
///
/// The returned sender shuts the listener down; in-flight connections end
/// when the server closes them.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve_srt(
    addr: &str,
    server: Arc<SrtServer>,
) -> std::io::Result<tokio::sync::oneshot::Sender<()>> {
    let listener = TcpListener::bind(addr).await?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    info!(addr = %addr, "srt transport listening");

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown_rx => return,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };

            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(server, stream, peer_addr.to_string()).await {
                    warn!(client = %peer_addr, error = %e, "connection rejected");
                }
            });
        }
    });

    Ok(shutdown_tx)
}

async fn handle_conn(server: Arc<SrtServer>, mut stream: TcpStream, addr: String) -> Result<()> {
    // Read the handshake line unbuffered so no frame bytes are consumed.
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.map_err(|e| Error::internal(e.to_string()))?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 4096 {
            return Err(Error::invalid_argument("handshake line too long"));
        }
    }
    let stream_id = String::from_utf8(line)
        .map_err(|_| Error::invalid_argument("handshake line is not utf-8"))?;

    let (mode, _info) = server.check_connect(&stream_id, false)?;

    let conn: Arc<dyn SrtConn> = Arc::new(FramedConn::new(stream_id, addr, stream));

    match mode {
        ConnectMode::Publish => server.handle_publish(conn).await,
        ConnectMode::Subscribe => server.handle_subscribe(conn).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_caller_url() {
        let (addr, stream_id) = parse_caller_url(
            "srt://peer:6000?mode=caller&streamid=%23%21%3Am%3Drequest%2Cr%3Dfoo",
        )
        .unwrap();
        assert_eq!(addr, "peer:6000");
        assert_eq!(stream_id, "#!:m=request,r=foo");
    }

    #[test]
    fn test_parse_caller_url_rejects_garbage() {
        assert!(parse_caller_url("http://peer:6000?streamid=x").is_err());
        assert!(parse_caller_url("srt://peer:6000").is_err());
        assert!(parse_caller_url("srt://peer:6000?mode=caller").is_err());
    }
}
