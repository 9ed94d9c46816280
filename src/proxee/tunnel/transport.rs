use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// One virtual stream multiplexed over a session.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Client side of a transport. The proxee only ever dials.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// A multiplexed session over one physical connection.
///
/// `accept_stream` returning an error means the connection is gone; callers
/// treat it as the end of the session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp)"),
    }
}

pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    match parse_transport(name)?.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        other => anyhow::bail!("tunnel: transport {other:?} not built in"),
    }
}
