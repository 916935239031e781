use std::{io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use smu_core::{Command, Response, decode_request};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Semaphore, oneshot},
    time::{sleep, timeout},
};

use crate::{
    IpcError,
    codec::encode,
    framing::{MAX_FRAME_SIZE, read_frame, write_frame},
    registry::SessionRegistry,
};

/// Pause after a failed `accept` so persistent errors do not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// How long a refused client gets to send its first request.
const REFUSAL_GRACE: Duration = Duration::from_secs(2);

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> Response;
}

/// Limits applied by the acceptor.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    /// Maximum concurrently served sessions.
    pub max_sessions: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self { max_sessions: 64 }
    }
}

/// Accepts connections forever, spawning one session task per client.
pub async fn serve_tcp(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    registry: SessionRegistry,
    limits: ServerLimits,
) -> Result<(), IpcError> {
    let slots = Arc::new(Semaphore::new(limits.max_sessions));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(error = %err, "error accepting connection");
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let Ok(slot) = Arc::clone(&slots).try_acquire_owned() else {
            tracing::warn!(
                %peer,
                max_sessions = limits.max_sessions,
                "session limit reached, refusing client"
            );
            tokio::spawn(refuse_busy(stream));
            continue;
        };

        let handler = Arc::clone(&handler);
        let registry = registry.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let Some(ticket) = registry.register(peer).await else {
                tracing::debug!(%peer, "registry closed, dropping connection");
                return;
            };

            tracing::info!(session = %ticket.id, %peer, "client connected");
            if let Err(err) = handle_connection(stream, peer, ticket.shutdown, handler).await {
                tracing::debug!(
                    session = %ticket.id,
                    error = %err,
                    "connection handler exited with error"
                );
            }
            registry.deregister(ticket.id).await;
            tracing::info!(session = %ticket.id, %peer, "client disconnected");
        });
    }
}

/// Answers the refused client's first request so its data is consumed before close.
async fn refuse_busy(stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let _ = timeout(REFUSAL_GRACE, read_frame(&mut reader)).await;
    let _ = write_response(&mut writer, &Response::failure("server busy")).await;
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: oneshot::Receiver<()>,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => return Ok(()),
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(IpcError::Io(err))
                if matches!(
                    err.kind(),
                    ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
                ) =>
            {
                return Ok(());
            }
            Err(err @ IpcError::FrameTooLarge { .. }) => {
                let _ = write_response(&mut writer, &Response::failure(err.to_string())).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let response = match decode_request(&frame) {
            Ok(command) => {
                if !matches!(command, Command::Read) {
                    tracing::info!(%peer, command = command.tag(), "command received");
                }
                handler.handle(command).await
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "rejecting undecodable request");
                Response::failure(err.to_string())
            }
        };

        write_response(&mut writer, &response).await?;
    }
}

/// Writes one response frame. A response too large for a frame is replaced by
/// a failure naming its size, so the client still gets exactly one reply.
async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), IpcError> {
    let mut payload = encode(response)?;
    if payload.len() > MAX_FRAME_SIZE {
        tracing::warn!(
            size = payload.len(),
            max = MAX_FRAME_SIZE,
            "response exceeds frame limit, replying with failure"
        );
        payload = encode(&oversized_failure(payload.len()))?;
    }
    write_frame(writer, &payload).await
}

fn oversized_failure(size: usize) -> Response {
    Response::failure(format!(
        "response of {size} bytes exceeds the {MAX_FRAME_SIZE}-byte frame limit"
    ))
}
