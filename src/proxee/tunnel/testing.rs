//! Fakes shared by the tunnel tests: an in-memory session and a loopback proxy.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

use crate::proxee::tunnel::{
    protocol::{self, PONG, REGISTER_OK, SELECTOR_PING, SELECTOR_REGISTER},
    select,
    transport::{BoxedStream, TransportSession, tcp},
};

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Line(&'static str),
    /// Read the request and never answer.
    Silent,
}

/// Session over in-memory pipes that answers `/register` and `/ping` like a
/// proxy. Replies come from the script first, then default to `OK`/`pong`.
pub struct PipeSession {
    script: Mutex<VecDeque<Reply>>,
    seen: Arc<Mutex<Vec<(String, String)>>>,
    answered: Arc<AtomicUsize>,
    muted: AtomicBool,
    pub opened: AtomicUsize,
    closed: AtomicBool,
    inbound_tx: Mutex<Option<mpsc::Sender<BoxedStream>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,
}

impl PipeSession {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            seen: Arc::new(Mutex::new(Vec::new())),
            answered: Arc::new(AtomicUsize::new(0)),
            muted: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().unwrap().extend(replies);
    }

    /// Leave every unscripted request unanswered.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// `(selector, request line)` pairs in the order they were read.
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn pings_answered(&self) -> usize {
        self.answered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver a new inbound stream; returns the proxy's end of it.
    pub async fn push_inbound(&self) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(4096);
        let tx = self.inbound_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Box::new(theirs)).await;
        }
        ours
    }

    /// Make `accept_stream` fail, as if the connection dropped.
    pub fn hang_up(&self) {
        self.inbound_tx.lock().unwrap().take();
    }
}

#[async_trait::async_trait]
impl TransportSession for PipeSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.is_closed() {
            anyhow::bail!("pipe session closed");
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.muted.load(Ordering::SeqCst).then_some(Reply::Silent));

        let (ours, mut theirs) = tokio::io::duplex(4096);
        let seen = self.seen.clone();
        let answered = self.answered.clone();
        tokio::spawn(async move {
            let Ok(selector) =
                select::negotiate(&mut theirs, &[SELECTOR_REGISTER, SELECTOR_PING]).await
            else {
                return;
            };
            let Ok(line) = protocol::read_line(&mut theirs).await else {
                return;
            };
            seen.lock().unwrap().push((selector.clone(), line));

            let reply = scripted.unwrap_or(if selector == SELECTOR_REGISTER {
                Reply::Line(REGISTER_OK)
            } else {
                Reply::Line(PONG)
            });
            match reply {
                Reply::Line(l) => {
                    let _ = protocol::write_line(&mut theirs, l).await;
                    let _ = theirs.shutdown().await;
                    if selector == SELECTOR_PING && l == PONG {
                        answered.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Reply::Silent => std::future::pending::<()>().await,
            }
        });
        Ok(Box::new(ours))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("pipe session closed"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hang_up();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Connected,
    Registered(String),
    Ping,
}

/// Loopback TCP+yamux proxy that answers `/register` with a fixed reply and
/// every `/ping` with `pong`.
pub struct FakeProxy {
    pub addr: String,
    pub events: mpsc::UnboundedReceiver<ProxyEvent>,
    sessions: Arc<Mutex<Vec<Arc<dyn TransportSession>>>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeProxy {
    pub async fn start(register_reply: &'static str) -> Self {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, events) = mpsc::unbounded_channel();
        let sessions: Arc<Mutex<Vec<Arc<dyn TransportSession>>>> = Arc::new(Mutex::new(Vec::new()));

        let all = sessions.clone();
        let task = tokio::spawn(async move {
            while let Ok((c, _)) = ln.accept().await {
                let sess = tcp::server_session(c);
                all.lock().unwrap().push(sess.clone());
                let _ = tx.send(ProxyEvent::Connected);
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Ok(st) = sess.accept_stream().await {
                        let tx = tx.clone();
                        tokio::spawn(answer(st, register_reply, tx));
                    }
                });
            }
        });

        Self {
            addr,
            events,
            sessions,
            task,
        }
    }

    /// The most recently accepted session.
    pub fn latest(&self) -> Option<Arc<dyn TransportSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    /// Drop every live connection; the listener keeps accepting.
    pub async fn kill_connections(&self) {
        let all: Vec<_> = self.sessions.lock().unwrap().drain(..).collect();
        for s in all {
            s.close().await;
        }
    }

    /// Wait for the next event matching `want`, skipping others.
    pub async fn wait_for(&mut self, limit: Duration, want: impl Fn(&ProxyEvent) -> bool) -> Option<ProxyEvent> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let ev = tokio::time::timeout_at(deadline, self.events.recv()).await.ok()??;
            if want(&ev) {
                return Some(ev);
            }
        }
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(
    mut st: BoxedStream,
    register_reply: &'static str,
    tx: mpsc::UnboundedSender<ProxyEvent>,
) {
    let Ok(selector) = select::negotiate(&mut st, &[SELECTOR_REGISTER, SELECTOR_PING]).await else {
        return;
    };
    let Ok(line) = protocol::read_line(&mut st).await else {
        return;
    };
    if selector == SELECTOR_REGISTER {
        let _ = tx.send(ProxyEvent::Registered(line));
        let _ = protocol::write_line(&mut st, register_reply).await;
    } else {
        let _ = tx.send(ProxyEvent::Ping);
        let _ = protocol::write_line(&mut st, PONG).await;
    }
    let _ = st.shutdown().await;
}
