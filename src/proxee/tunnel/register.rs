use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::proxee::tunnel::{
    protocol::{self, ProtocolError, REGISTER_OK, SELECTOR_REGISTER},
    select,
    transport::TransportSession,
};

/// Announce `hostname` to the proxy on a fresh `/register` stream.
///
/// Succeeds only when the proxy answers with the literal `OK` line. The stream
/// is shut down afterwards whatever the outcome.
pub async fn register(
    sess: &dyn TransportSession,
    hostname: &str,
    io_timeout: Option<Duration>,
) -> anyhow::Result<()> {
    if hostname.is_empty() || hostname.contains(['\n', '\r']) {
        return Err(ProtocolError::InvalidLine(hostname.to_string()).into());
    }

    let mut st = sess.open_stream().await?;

    let res = protocol::with_timeout(io_timeout, async {
        select::select(&mut st, SELECTOR_REGISTER).await?;
        protocol::write_line(&mut st, hostname).await?;
        protocol::expect_line(&mut st, REGISTER_OK).await
    })
    .await;

    let _ = tokio::time::timeout(Duration::from_secs(1), st.shutdown()).await;
    res.map_err(anyhow::Error::from)
}
