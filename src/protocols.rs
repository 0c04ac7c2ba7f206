use crate::types::{TrustQuery, TrustResponse};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::request_response::Codec;
use std::io;

/// Single p2p protocol id used by this node for trust queries (spec §4.4/§6).
#[derive(Debug, Clone)]
pub struct TrustProtocol;

impl AsRef<str> for TrustProtocol {
    fn as_ref(&self) -> &str {
        "trust/query/1.0.0"
    }
}

pub const MAX_MESSAGE_BYTES: usize = 1_048_576;

/// Length-prefixed JSON codec: a 4-byte big-endian length, then a UTF-8 JSON
/// payload capped at 1 MiB (spec §4.4/§6).
#[derive(Debug, Clone, Default)]
pub struct TrustCodec;

#[async_trait]
impl Codec for TrustCodec {
    type Protocol = TrustProtocol;
    type Request = TrustQuery;
    type Response = TrustResponse;

    async fn read_request<T>(&mut self, _: &TrustProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let vec = read_length_prefixed(io, MAX_MESSAGE_BYTES).await?;
        serde_json::from_slice(&vec).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(&mut self, _: &TrustProtocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let vec = read_length_prefixed(io, MAX_MESSAGE_BYTES).await?;
        serde_json::from_slice(&vec).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(&mut self, _: &TrustProtocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_json::to_vec(&req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, data).await
    }

    async fn write_response<T>(&mut self, _: &TrustProtocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_json::to_vec(&res).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, data).await
    }
}

async fn read_length_prefixed<T>(io: &mut T, max_len: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    use futures::AsyncReadExt;

    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_length_prefixed<T>(io: &mut T, data: Vec<u8>) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    use futures::AsyncWriteExt;

    let len = data.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&data).await?;
    io.flush().await?;
    Ok(())
}

/// Build the outbound request sent to a single peer for a transitive query.
///
/// The remote side is always forced to depth 0, regardless of the local
/// query's `max_depth`: this is the structural loop-avoidance measure of
/// spec §4.3 — a node never asks its peers to ask their peers.
pub fn remote_depth0_request(query: &TrustQuery) -> TrustQuery {
    TrustQuery {
        agents: query.agents.clone(),
        max_depth: 0,
        point_in_time: query.point_in_time,
        forget_rate: query.forget_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentIdentifier;

    #[test]
    fn remote_request_is_always_depth_zero() {
        let query = TrustQuery {
            agents: vec![AgentIdentifier::new("ethereum", "0x1")],
            max_depth: 5,
            point_in_time: None,
            forget_rate: None,
        };
        let remote = remote_depth0_request(&query);
        assert_eq!(remote.max_depth, 0);
        assert_eq!(remote.agents, query.agents);
    }
}
