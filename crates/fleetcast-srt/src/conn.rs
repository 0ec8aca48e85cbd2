//! Connection seams and stream id parsing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleetcast_core::{Error, Result};

/// One SRT connection, publisher or subscriber side.
///
/// Implementations wrap the actual wire protocol; tests use in-memory
/// pairs.
#[async_trait]
pub trait SrtConn: Send + Sync {
    /// The stream id presented at connect time.
    fn stream_id(&self) -> String;

    /// The remote address, used as the subscriber key.
    fn remote_addr(&self) -> String;

    /// Whether the connection negotiated encryption.
    fn is_encrypted(&self) -> bool;

    /// Reads the next frame. `None` means the connection ended.
    async fn read_frame(&self) -> Result<Option<Bytes>>;

    /// Writes one frame.
    async fn write_frame(&self, frame: Bytes) -> Result<()>;

    /// Closes the connection. Pending reads return `None`.
    fn close(&self);
}

/// Dials an upstream publisher on another node.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `url` in caller mode with the given receive latency.
    async fn dial(&self, url: &str, latency: Duration) -> Result<Box<dyn SrtConn>>;
}

/// What a connection wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Publish the resource.
    Publish,
    /// Subscribe to the resource.
    Subscribe,
}

/// Parsed stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Connection mode string (`publish` or `request`).
    pub mode: String,
    /// The resource name.
    pub resource: String,
    /// Access token, if presented.
    pub token: String,
}

/// Parses a stream id of the form `#!:key=value,key=value,...`.
///
/// Recognized keys are `m` (mode), `r` (resource) and `token`; unknown
/// keys are ignored.
///
/// # Errors
///
/// Returns `InvalidArgument` if the stream id does not carry the
/// `#!:` prefix.
pub fn parse_stream_id(stream_id: &str) -> Result<StreamInfo> {
    let Some(body) = stream_id.strip_prefix("#!:") else {
        return Err(Error::invalid_argument("unknown streamid format"));
    };

    let mut info = StreamInfo::default();

    for kv in body.split(',') {
        let Some((key, value)) = kv.split_once('=') else {
            continue;
        };

        match key {
            "m" => info.mode = value.to_string(),
            "r" => info.resource = value.to_string(),
            "token" => info.token = value.to_string(),
            _ => {}
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_id() {
        let info = parse_stream_id("#!:m=request,r=foo,token=abc").unwrap();
        assert_eq!(info.mode, "request");
        assert_eq!(info.resource, "foo");
        assert_eq!(info.token, "abc");
    }

    #[test]
    fn test_parse_without_token() {
        let info = parse_stream_id("#!:m=publish,r=live/cam").unwrap();
        assert_eq!(info.mode, "publish");
        assert_eq!(info.resource, "live/cam");
        assert!(info.token.is_empty());
    }

    #[test]
    fn test_unknown_keys_and_bad_pairs_are_ignored() {
        let info = parse_stream_id("#!:m=request,bogus,x=y,r=foo").unwrap();
        assert_eq!(info.mode, "request");
        assert_eq!(info.resource, "foo");
    }

    #[test]
    fn test_missing_prefix_rejected() {
        assert!(parse_stream_id("m=request,r=foo").is_err());
        assert!(parse_stream_id("").is_err());
    }
}
