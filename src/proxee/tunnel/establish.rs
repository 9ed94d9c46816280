use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use crate::proxee::tunnel::{
    identity::PeerIdentity,
    transport::{Transport, TransportSession, transport_by_name},
};

/// How the supervisor obtains a fresh session to the proxy.
#[async_trait]
pub trait Establish: Send + Sync {
    /// Short description of the target for logs.
    fn describe(&self) -> String;
    async fn establish(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// Dial a known proxy address.
pub struct DirectDial {
    addr: String,
    transport: Arc<dyn Transport>,
}

impl DirectDial {
    pub fn new(addr: impl Into<String>, transport: &str) -> anyhow::Result<Self> {
        let addr = addr.into();
        if addr.trim().is_empty() {
            anyhow::bail!("tunnel: proxy address is required");
        }
        Ok(Self {
            addr,
            transport: transport_by_name(transport)?,
        })
    }
}

#[async_trait]
impl Establish for DirectDial {
    fn describe(&self) -> String {
        format!("{}://{}", self.transport.name(), self.addr)
    }

    async fn establish(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        self.transport
            .dial(&self.addr)
            .await
            .with_context(|| format!("dial {}", self.addr))
    }
}

#[derive(Debug, Clone)]
pub struct RendezvousOptions {
    pub base_url: String,
    pub hostname: String,
    pub advertised_host: String,
    pub advertised_port: u16,
    pub identity: PeerIdentity,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ProxeePut<'a> {
    hostname: &'a str,
    #[serde(rename = "p2pAddr")]
    p2p_addr: String,
}

/// Ask the rendezvous service where the proxy is, then dial it.
///
/// The request advertises this node's address and identity; the response body
/// is the proxy's address.
pub struct Rendezvous {
    opts: RendezvousOptions,
    http: reqwest::Client,
    transport: Arc<dyn Transport>,
}

impl Rendezvous {
    pub fn new(opts: RendezvousOptions, transport: &str) -> anyhow::Result<Self> {
        if opts.base_url.trim().is_empty() {
            anyhow::bail!("tunnel: rendezvous base_url is required");
        }
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .build()
            .context("rendezvous: build http client")?;
        Ok(Self {
            opts,
            http,
            transport: transport_by_name(transport)?,
        })
    }

    fn advertised_addr(&self) -> String {
        format!(
            "{}/p2p/{}",
            host_multiaddr(&self.opts.advertised_host, self.opts.advertised_port),
            self.opts.identity.id()
        )
    }

    async fn lookup(&self) -> anyhow::Result<String> {
        let url = format!("{}/proxeePut", self.opts.base_url.trim_end_matches('/'));
        let body = ProxeePut {
            hostname: &self.opts.hostname,
            p2p_addr: self.advertised_addr(),
        };
        tracing::info!(url=%url, p2p_addr=%body.p2p_addr, "rendezvous: announcing");

        let text = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("rendezvous: POST {url}"))?
            .error_for_status()
            .with_context(|| format!("rendezvous: POST {url}"))?
            .text()
            .await
            .context("rendezvous: read body")?;

        let addr = parse_proxy_addr(&text)?;
        tracing::info!(proxy=%addr, "rendezvous: proxy address");
        Ok(addr)
    }
}

#[async_trait]
impl Establish for Rendezvous {
    fn describe(&self) -> String {
        format!("rendezvous {}", self.opts.base_url)
    }

    async fn establish(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let addr = self.lookup().await?;
        self.transport
            .dial(&addr)
            .await
            .with_context(|| format!("dial {addr}"))
    }
}

fn host_multiaddr(host: &str, port: u16) -> String {
    let proto = match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(_)) => "ip4",
        Ok(std::net::IpAddr::V6(_)) => "ip6",
        Err(_) => "dns",
    };
    format!("/{proto}/{host}/tcp/{port}")
}

/// Accepts `host:port` or a multiaddr such as `/ip4/1.2.3.4/tcp/7000/p2p/<id>`.
pub fn parse_proxy_addr(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("rendezvous: empty proxy address");
    }

    if !raw.starts_with('/') {
        let Some((host, port)) = raw.rsplit_once(':') else {
            anyhow::bail!("rendezvous: proxy address {raw:?} has no port");
        };
        if host.is_empty() {
            anyhow::bail!("rendezvous: proxy address {raw:?} has no host");
        }
        port.parse::<u16>()
            .with_context(|| format!("rendezvous: bad port in {raw:?}"))?;
        return Ok(raw.to_string());
    }

    let parts: Vec<&str> = raw.split('/').skip(1).collect();
    let [proto, host, "tcp", port, rest @ ..] = parts.as_slice() else {
        anyhow::bail!("rendezvous: unsupported multiaddr {raw:?}");
    };
    if !matches!(rest, [] | ["p2p", _]) {
        anyhow::bail!("rendezvous: unsupported multiaddr {raw:?}");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("rendezvous: bad port in {raw:?}"))?;
    match *proto {
        "ip4" | "dns" | "dns4" | "dns6" => Ok(format!("{host}:{port}")),
        "ip6" => Ok(format!("[{host}]:{port}")),
        other => anyhow::bail!("rendezvous: unsupported address protocol {other:?}"),
    }
}
