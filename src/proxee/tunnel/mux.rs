use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use async_trait::async_trait;

use crate::proxee::tunnel::{dispatch::StreamHandler, select, transport::BoxedStream};

const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub selector: String,
    pub local_addr: String,
}

/// Routes inbound streams to local TCP services by the selector the proxy asks for.
#[derive(Debug)]
pub struct SelectorMux {
    services: HashMap<String, String>,
    selectors: Vec<String>,
}

impl SelectorMux {
    pub fn new(services: impl IntoIterator<Item = Service>) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        let mut selectors = Vec::new();
        for svc in services {
            select::validate_selector(&svc.selector)?;
            let local = svc.local_addr.trim().to_string();
            if local.is_empty() {
                anyhow::bail!("service {}: local_addr is required", svc.selector);
            }
            if map.insert(svc.selector.clone(), local).is_some() {
                anyhow::bail!("service {}: duplicate selector", svc.selector);
            }
            selectors.push(svc.selector);
        }
        Ok(Self {
            services: map,
            selectors,
        })
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }
}

#[async_trait]
impl StreamHandler for SelectorMux {
    async fn handle(&self, mut stream: BoxedStream) -> anyhow::Result<()> {
        let supported: Vec<&str> = self.selectors.iter().map(String::as_str).collect();
        let selector = tokio::time::timeout(NEGOTIATE_TIMEOUT, select::negotiate(&mut stream, &supported))
            .await
            .context("mux: negotiate timed out")??;

        let Some(local) = self.services.get(&selector) else {
            return Ok(());
        };

        let mut up = tokio::net::TcpStream::connect(local)
            .await
            .with_context(|| format!("mux: connect {local} for {selector}"))?;
        let _ = up.set_nodelay(true);
        tracing::debug!(selector=%selector, local=%local, "mux: forwarding");

        let (tx, rx) = tokio::io::copy_bidirectional(&mut stream, &mut up).await?;
        tracing::trace!(selector=%selector, to_local = tx, from_local = rx, "mux: stream closed");
        Ok(())
    }
}
