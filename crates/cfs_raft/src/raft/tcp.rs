//! TCP transport for raft RPCs.
//!
//! Frames are a big-endian u32 length followed by a JSON body. The same
//! framing helpers are reused by the master's admin service.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::node::RaftNode;
use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, Member, RequestVoteRequest, RequestVoteResponse,
    Transport,
};

const MAX_FRAME_BYTES: usize = 64 << 20;
/// Pause before retrying a failed accept.
pub const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).context("encode frame")?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_BYTES,
        "frame too large: {} bytes",
        payload.len()
    );
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame too large: {len} bytes");
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(
        serde_json::from_slice(&payload).context("decode frame")?,
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpc {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

/// Client side. Keeps one idle connection per peer address.
#[derive(Default)]
pub struct TcpTransport {
    conns: Mutex<HashMap<String, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn call(&self, addr: &str, rpc: RaftRpc) -> anyhow::Result<RaftRpcResponse> {
        let cached = self.conns.lock().await.remove(addr);
        let mut stream = match cached {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connect raft peer {addr}"))?;
                stream.set_nodelay(true)?;
                stream
            }
        };
        write_frame(&mut stream, &rpc).await?;
        let resp = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("raft peer {addr} closed the connection"))?;
        self.conns.lock().await.insert(addr.to_string(), stream);
        Ok(resp)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        target: &Member,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        match self.call(&target.addr, RaftRpc::RequestVote(req)).await? {
            RaftRpcResponse::RequestVote(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to request_vote: {other:?}")),
        }
    }

    async fn append_entries(
        &self,
        target: &Member,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        match self.call(&target.addr, RaftRpc::AppendEntries(req)).await? {
            RaftRpcResponse::AppendEntries(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to append_entries: {other:?}")),
        }
    }
}

/// Serve raft RPCs for `node`. Accept errors are logged and retried.
pub async fn serve(listener: TcpListener, node: Arc<RaftNode>) -> anyhow::Result<()> {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "raft accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, peer = %peer, "set_nodelay failed");
        }
        let node = node.clone();
        tokio::spawn(async move {
            loop {
                let rpc: RaftRpc = match read_frame(&mut stream).await {
                    Ok(Some(rpc)) => rpc,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(error = ?err, peer = %peer, "raft connection read failed");
                        break;
                    }
                };
                if node.is_shutdown() {
                    break;
                }
                let resp = match rpc {
                    RaftRpc::RequestVote(req) => {
                        RaftRpcResponse::RequestVote(node.handle_request_vote(req).await)
                    }
                    RaftRpc::AppendEntries(req) => {
                        RaftRpcResponse::AppendEntries(node.handle_append_entries(req).await)
                    }
                };
                if let Err(err) = write_frame(&mut stream, &resp).await {
                    tracing::debug!(error = ?err, peer = %peer, "raft connection write failed");
                    break;
                }
            }
        });
    }
}
