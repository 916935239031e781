use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::{InstrumentError, ScpiTransport};

/// Raw SCPI over TCP with `\n` as the message terminator.
///
/// A query abandoned by the caller's timeout can leave its late reply in the
/// stream; callers that see a timeout should treat the next reply with care.
pub struct SocketTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SocketTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, InstrumentError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        tracing::debug!(host, port, "instrument socket connected");
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, command: &str) -> Result<(), InstrumentError> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for SocketTransport {
    async fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.send(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        self.send(command).await?;
        let mut reply = String::new();
        let read = self.reader.read_line(&mut reply).await?;
        if read == 0 {
            return Err(InstrumentError::Transport(
                "instrument closed the connection".to_string(),
            ));
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
