//! RPC transport (spec.md §6): an in-memory duplex for deterministic
//! tests and a length-prefixed-bincode TCP listener for the real path.
//! Framing mirrors `disklog`'s self-delimiting record format: a
//! little-endian `u32` length prefix followed by the bincode payload.
use std::sync::Arc;

use anyhow::Context;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
    },
    sync::mpsc,
};

use crate::{
    dispatch::handle,
    rpc::{
        Request,
        Response,
    },
    state::ServerState,
};

/// One in-memory client connection to an in-process server: a duplex
/// built from two unbounded channels, with the server's side spawned as
/// its own task so a client can pipeline requests without waiting for
/// earlier ones to finish (matching the concurrent-dispatch the TCP path
/// gets from one task per connection).
#[derive(Clone)]
pub struct InMemoryConn {
    requests: mpsc::UnboundedSender<(Request, tokio::sync::oneshot::Sender<Response>)>,
}

impl InMemoryConn {
    pub fn connect(state: Arc<ServerState>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Request, tokio::sync::oneshot::Sender<Response>)>();
        tokio::spawn(async move {
            while let Some((req, reply)) = rx.recv().await {
                let state = state.clone();
                tokio::spawn(async move {
                    let resp = handle(&state, req).await;
                    let _ = reply.send(resp);
                });
            }
        });
        InMemoryConn { requests: tx }
    }

    pub async fn call(&self, req: Request) -> anyhow::Result<Response> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.requests.send((req, tx)).map_err(|_| anyhow::anyhow!("server task gone"))?;
        rx.await.context("server task dropped the reply channel")
    }
}

/// Serves `state` over `listener` until the listener errors or the
/// process is asked to shut down. Each connection gets its own task;
/// each request on a connection gets its own task too, so one request
/// parked on a deferred read (spec.md §4.C) never blocks its connection's
/// other in-flight requests.
pub async fn serve_tcp(state: Arc<ServerState>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::info!(?peer, "accepted connection");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(state, socket).await {
                tracing::warn!(?peer, ?err, "connection ended");
            }
        });
    }
}

async fn serve_connection(state: Arc<ServerState>, socket: TcpStream) -> anyhow::Result<()> {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    loop {
        let req = match read_frame(&mut reader).await {
            Ok(Some(bytes)) => bincode::deserialize::<Request>(&bytes).context("decoding request frame")?,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };
        let state = state.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let resp = handle(&state, req).await;
            if let Err(err) = write_response(&writer, &resp).await {
                tracing::warn!(?err, "failed to write response frame");
            }
        });
    }
}

async fn write_response(writer: &Arc<tokio::sync::Mutex<impl AsyncWriteExt + Unpin>>, resp: &Response) -> anyhow::Result<()> {
    let encoded = bincode::serialize(resp)?;
    let mut writer = writer.lock().await;
    writer.write_all(&(encoded.len() as u32).to_le_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame(reader: &mut (impl AsyncReadExt + Unpin)) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.context("reading request frame body")?;
    Ok(Some(payload))
}

/// A single bincode-over-TCP client connection, matching `serve_tcp`'s
/// framing. Used by the client crate's transport impl and by this
/// crate's own `#[ignore]`d smoke test.
pub struct TcpConn {
    reader: tokio::sync::Mutex<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpConn {
    pub async fn connect(addr: std::net::SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(TcpConn {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        })
    }

    /// Not safe to call concurrently from multiple tasks without
    /// external pipelining: this sends one request and waits for the
    /// very next frame back, which only works if nothing else is
    /// interleaving requests on the same connection.
    pub async fn call(&self, req: &Request) -> anyhow::Result<Response> {
        {
            let encoded = bincode::serialize(req)?;
            let mut writer = self.writer.lock().await;
            writer.write_all(&(encoded.len() as u32).to_le_bytes()).await?;
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }
        let mut reader = self.reader.lock().await;
        let bytes = read_frame(&mut *reader).await?.context("connection closed before a response arrived")?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
