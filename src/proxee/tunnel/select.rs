//! Stream selector negotiation.
//!
//! Every virtual stream starts with a multistream-select 1.0.0 exchange that
//! tags it with a selector (`/register`, `/ping`, or an application selector)
//! so the remote end can route it. Messages are framed as an unsigned varint
//! length followed by the message bytes and a trailing `\n`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MULTISTREAM_HEADER: &str = "/multistream/1.0.0";
const NOT_AVAILABLE: &str = "na";

pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("unexpected multistream header {0:?}")]
    BadHeader(String),
    #[error("selector {0:?} not supported by peer")]
    NotSupported(String),
    #[error("peer answered {got:?} while selecting {want:?}")]
    UnexpectedReply { want: String, got: String },
    #[error("message too large: {0}")]
    TooLarge(u64),
    #[error("malformed message")]
    Malformed,
    #[error("invalid selector {0:?}")]
    InvalidSelector(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Initiator side: propose `selector` and wait for the peer to accept it.
pub async fn select<S>(st: &mut S, selector: &str) -> Result<(), SelectError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    validate_selector(selector)?;

    // Header and selector go out in one write so the peer sees them together.
    let mut out = Vec::with_capacity(MULTISTREAM_HEADER.len() + selector.len() + 8);
    encode_message(&mut out, MULTISTREAM_HEADER);
    encode_message(&mut out, selector);
    st.write_all(&out).await?;
    st.flush().await?;

    let header = read_message(st).await?;
    if header != MULTISTREAM_HEADER {
        return Err(SelectError::BadHeader(header));
    }

    let reply = read_message(st).await?;
    if reply == selector {
        return Ok(());
    }
    if reply == NOT_AVAILABLE {
        return Err(SelectError::NotSupported(selector.to_string()));
    }
    Err(SelectError::UnexpectedReply {
        want: selector.to_string(),
        got: reply,
    })
}

/// Responder side: answer proposals until one matches `supported`.
///
/// Returns the accepted selector. Unsupported proposals are answered with `na`
/// and the responder keeps listening; the stream ending before a match is an
/// I/O error.
pub async fn negotiate<S>(st: &mut S, supported: &[&str]) -> Result<String, SelectError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let header = read_message(st).await?;
    if header != MULTISTREAM_HEADER {
        return Err(SelectError::BadHeader(header));
    }
    write_message(st, MULTISTREAM_HEADER).await?;

    loop {
        let proposal = read_message(st).await?;
        if supported.iter().any(|s| *s == proposal) {
            write_message(st, &proposal).await?;
            return Ok(proposal);
        }
        tracing::debug!(selector=%proposal, "select: refusing unsupported selector");
        write_message(st, NOT_AVAILABLE).await?;
    }
}

pub fn validate_selector(selector: &str) -> Result<(), SelectError> {
    if selector.is_empty()
        || selector == NOT_AVAILABLE
        || selector.contains('\n')
        || selector.len() as u64 + 1 > MAX_MESSAGE_BYTES
    {
        return Err(SelectError::InvalidSelector(selector.to_string()));
    }
    Ok(())
}

fn encode_message(out: &mut Vec<u8>, msg: &str) {
    encode_uvarint(out, msg.len() as u64 + 1);
    out.extend_from_slice(msg.as_bytes());
    out.push(b'\n');
}

async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    msg: &str,
) -> Result<(), SelectError> {
    let mut out = Vec::with_capacity(msg.len() + 4);
    encode_message(&mut out, msg);
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<String, SelectError> {
    let n = read_uvarint(r).await?;
    if n == 0 {
        return Err(SelectError::Malformed);
    }
    if n > MAX_MESSAGE_BYTES {
        return Err(SelectError::TooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(SelectError::Malformed);
    }
    String::from_utf8(buf).map_err(|_| SelectError::Malformed)
}

fn encode_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut temp = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            temp |= 0x80;
        }
        out.push(temp);
        if v == 0 {
            break;
        }
    }
}

async fn read_uvarint<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u64, SelectError> {
    let mut result: u64 = 0;
    for i in 0..10 {
        let read = r.read_u8().await?;
        result |= u64::from(read & 0x7f) << (7 * i);
        if (read & 0x80) == 0 {
            return Ok(result);
        }
    }
    Err(SelectError::Malformed)
}
