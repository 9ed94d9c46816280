use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxee::tunnel::select::SelectError;

pub const SELECTOR_REGISTER: &str = "/register";
pub const SELECTOR_PING: &str = "/ping";

pub const REGISTER_OK: &str = "OK";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

pub const MAX_LINE_BYTES: u64 = 4 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("select: {0}")]
    Select(#[from] SelectError),
    #[error("no response")]
    NoResponse,
    #[error("expected {expected:?} got {got:?}")]
    UnexpectedResponse { expected: &'static str, got: String },
    #[error("line too long")]
    LineTooLong,
    #[error("invalid line {0:?}")]
    InvalidLine(String),
    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Write `line` followed by `\n`.
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    line: &str,
) -> Result<(), ProtocolError> {
    if line.contains('\n') || line.contains('\r') {
        return Err(ProtocolError::InvalidLine(line.to_string()));
    }
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

/// Read one line, without its terminator.
///
/// Reads a byte at a time and stops at `\n`, so whatever follows the line stays
/// on the stream for the next read. EOF before any byte is `NoResponse`; a final
/// line without `\n` is accepted.
pub async fn read_line<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<String, ProtocolError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte).await? == 0 {
            if buf.is_empty() {
                return Err(ProtocolError::NoResponse);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if buf.len() as u64 >= MAX_LINE_BYTES {
            return Err(ProtocolError::LineTooLong);
        }
        buf.push(byte[0]);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read one line and require it to be `expected`.
pub async fn expect_line<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    expected: &'static str,
) -> Result<(), ProtocolError> {
    let got = read_line(r).await?;
    if got != expected {
        return Err(ProtocolError::UnexpectedResponse { expected, got });
    }
    Ok(())
}

/// Bound `fut` by `limit` when one is configured.
pub async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ProtocolError>
where
    F: std::future::Future<Output = Result<T, ProtocolError>>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| ProtocolError::Timeout(d))?,
        None => fut.await,
    }
}
