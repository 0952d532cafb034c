//! Connection handshake: each side sends magic + version + its process name.
//! The dialing side (a receiver) speaks first; the accepting server answers with its own name.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wimp_core::protocol::{handshake_bytes, parse_handshake, HANDSHAKE_SIZE};

fn invalid_data(msg: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

async fn read_handshake<S>(stream: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    parse_handshake(&buf).map_err(invalid_data)
}

async fn write_handshake<S>(stream: &mut S, own_name: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let out = handshake_bytes(own_name)
        .ok_or_else(|| invalid_data(format!("invalid process name {own_name:?}")))?;
    stream.write_all(&out).await?;
    stream.flush().await
}

/// Accepting side: read the peer's name, then answer with ours. Returns the peer's name.
pub async fn handshake_accept<S>(stream: &mut S, own_name: &str) -> std::io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = read_handshake(stream).await?;
    write_handshake(stream, own_name).await?;
    Ok(peer)
}

/// Dialing side: send our name, then read the server's. Returns the server's name.
pub async fn handshake_connect<S>(stream: &mut S, own_name: &str) -> std::io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_handshake(stream, own_name).await?;
    read_handshake(stream).await
}
