use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{net::TcpStream, sync::mpsc};

use crate::proxee::tunnel::transport::{BoxedStream, Transport, TransportSession};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Arc::new(YamuxSession::client(c)))
    }
}

/// The accepting side of a session, for loopback proxies in tests.
#[cfg(test)]
pub(crate) fn server_session(c: TcpStream) -> Arc<dyn TransportSession> {
    let _ = c.set_nodelay(true);
    Arc::new(YamuxSession::server(c))
}

struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    #[cfg(test)]
    fn server(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        let session = tokio_yamux::Session::new_server(c, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    fn client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        let session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    fn from_session(
        mut session: tokio_yamux::Session<TcpStream>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();

        // The session future drives all I/O for the connection. It ends when the
        // peer goes away, which drops `tx` and turns `accept_stream` into an error.
        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err=%err, "tunnel: yamux session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            remote,
            local,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.task.is_finished() {
            anyhow::bail!("tunnel: session closed");
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        {
            let mut ctrl = self.control.lock().await;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ctrl.close()).await;
        }
        self.task.abort();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
