use std::time::Duration;

use smu_core::{Command, Response};
use tokio::{
    io::BufReader,
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

use crate::{
    IpcError,
    codec::{decode, encode},
    framing::{read_frame, write_frame},
};

/// Long enough for a default sweep with generous settling delays.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Request/response client for the SMU server.
///
/// After a [`IpcError::Timeout`] the stream may hold a late reply, so the
/// client should be dropped and reconnected.
pub struct SmuClient {
    /// Buffered read side of the connection.
    reader: BufReader<OwnedReadHalf>,
    /// Write side of the connection.
    writer: OwnedWriteHalf,
    /// Per-call timeout.
    timeout: Duration,
}

impl SmuClient {
    /// Connects a client to the server address.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, IpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Overrides the default call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one command and waits for its response.
    pub async fn call(&mut self, command: Command) -> Result<Response, IpcError> {
        let payload = encode(&command)?;
        self.call_raw(&payload).await
    }

    /// Sends one pre-encoded request line and waits for its response.
    pub async fn call_raw(&mut self, payload: &[u8]) -> Result<Response, IpcError> {
        timeout(self.timeout, async {
            write_frame(&mut self.writer, payload).await?;
            let frame = read_frame(&mut self.reader).await?;
            decode::<Response>(&frame)
        })
        .await
        .map_err(|_| IpcError::Timeout)?
    }
}
