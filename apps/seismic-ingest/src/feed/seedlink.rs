use super::miniseed::{decode_record, RECORD_LEN};
use super::{FeedConnection, FeedConnector, FeedEvent};
use crate::error::FeedError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const DEFAULT_PORT: u16 = 18000;
const HEADER_LEN: usize = 8;
const MAX_RESPONSE_LINE: usize = 1024;

/// Connects to SeedLink v3 servers over TCP.
#[derive(Clone, Debug)]
pub struct SeedLinkConnector {
    connect_timeout: Duration,
}

impl SeedLinkConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl FeedConnector for SeedLinkConnector {
    async fn connect(&self, server: &str) -> Result<Box<dyn FeedConnection>, FeedError> {
        let address = server_address(server);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                FeedError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;

        let mut connection = SeedLinkConnection::new(stream);
        connection.handshake().await?;
        tracing::info!(server = %address, "connected to SeedLink server");
        Ok(Box::new(connection))
    }
}

/// Appends the default SeedLink port when the address has none.
pub fn server_address(server: &str) -> String {
    let trimmed = server.trim();
    let has_port = trimmed
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        trimmed.to_string()
    } else {
        format!("{trimmed}:{DEFAULT_PORT}")
    }
}

struct SeedLinkConnection<S> {
    stream: BufReader<S>,
    streaming: bool,
}

impl<S> SeedLinkConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            streaming: false,
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), FeedError> {
        let writer = self.stream.get_mut();
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, FeedError> {
        let mut line = Vec::new();
        let read = (&mut self.stream)
            .take(MAX_RESPONSE_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(FeedError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed connection during command exchange",
            )));
        }
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    async fn handshake(&mut self) -> Result<(), FeedError> {
        self.send("HELLO").await?;
        let version = self.read_line().await?;
        let organization = self.read_line().await?;
        if !version.starts_with("SeedLink") {
            return Err(FeedError::Protocol(format!(
                "unexpected HELLO response: {version}"
            )));
        }
        tracing::debug!(%version, %organization, "SeedLink handshake complete");
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<(), FeedError> {
        self.send(command).await?;
        let reply = self.read_line().await?;
        match reply.as_str() {
            "OK" => Ok(()),
            "ERROR" => Err(FeedError::Rejected(command.to_string())),
            other => Err(FeedError::Protocol(format!(
                "unexpected reply to {command}: {other}"
            ))),
        }
    }

    /// Reads the 8-byte packet header. `Ok(false)` means the server closed
    /// the stream cleanly before a new packet started.
    async fn read_header(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<bool, FeedError> {
        let first = self.stream.read(&mut header[..1]).await?;
        if first == 0 {
            return Ok(false);
        }
        self.stream.read_exact(&mut header[1..]).await?;
        Ok(true)
    }
}

#[async_trait]
impl<S> FeedConnection for SeedLinkConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn subscribe(
        &mut self,
        network: &str,
        station: &str,
        channel: &str,
    ) -> Result<(), FeedError> {
        if self.streaming {
            return Err(FeedError::Protocol(
                "cannot subscribe after streaming has started".to_string(),
            ));
        }
        self.command(&format!("STATION {station} {network}")).await?;
        self.command(&format!("SELECT {channel}")).await?;
        self.command("DATA").await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<FeedEvent, FeedError> {
        if !self.streaming {
            self.send("END").await?;
            self.streaming = true;
        }

        let mut header = [0u8; HEADER_LEN];
        let mut record = vec![0u8; RECORD_LEN];
        loop {
            if !self.read_header(&mut header).await? {
                return Ok(FeedEvent::Closed);
            }

            if header.starts_with(b"SLINFO") {
                self.stream.read_exact(&mut record).await?;
                continue;
            }
            if header.starts_with(b"ERROR") {
                return Err(FeedError::Protocol("server reported ERROR".to_string()));
            }
            if !header.starts_with(b"SL") {
                return Err(FeedError::Protocol(format!(
                    "unexpected packet header {:?}",
                    String::from_utf8_lossy(&header)
                )));
            }

            self.stream.read_exact(&mut record).await?;
            match decode_record(&record) {
                Ok(Some(packet)) => return Ok(FeedEvent::Packet(packet)),
                Ok(None) => continue,
                Err(err) => {
                    let sequence = String::from_utf8_lossy(&header[2..]).to_string();
                    tracing::warn!(error = %err, %sequence, "skipping undecodable SeedLink record");
                }
            }
        }
    }
}
