//! Malware scanning.
//!
//! The gate consumes any [`MalwareScanner`]. [`ClamdScanner`] talks to a
//! clamd daemon over TCP with the `INSTREAM` command.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest chunk sent per `INSTREAM` frame.
const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a completed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Infected { label: String },
}

/// Errors reaching or talking to the scanner.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scanner connection failed: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Scanner timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected scanner reply: {0}")]
    Protocol(String),
}

/// A service that inspects bytes for malware.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MalwareScanner: Send + Sync {
    /// Scans a payload.
    async fn scan(&self, data: &[u8]) -> Result<ScanOutcome, ScanError>;
}

/// clamd client.
#[derive(Debug, Clone)]
pub struct ClamdScanner {
    address: String,
    timeout: Duration,
}

impl ClamdScanner {
    /// Creates a client for `host:port`.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            address: format!("{host}:{port}"),
            timeout,
        }
    }

    /// Checks that the daemon answers `PING`.
    pub async fn ping(&self) -> Result<(), ScanError> {
        let reply = self.exchange(b"zPING\0", None).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ScanError::Protocol(reply))
        }
    }

    async fn exchange(&self, command: &[u8], payload: Option<&[u8]>) -> Result<String, ScanError> {
        let io = async {
            let mut stream = TcpStream::connect(&self.address).await?;
            stream.write_all(command).await?;
            if let Some(data) = payload {
                for chunk in data.chunks(CHUNK_SIZE) {
                    stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
                    stream.write_all(chunk).await?;
                }
                stream.write_all(&0u32.to_be_bytes()).await?;
            }
            stream.flush().await?;

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| ScanError::Timeout(self.timeout))??;

        Ok(String::from_utf8_lossy(&reply)
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string())
    }
}

/// Parses a clamd `INSTREAM` reply such as `stream: Eicar-Signature FOUND`.
fn parse_reply(reply: &str) -> Result<ScanOutcome, ScanError> {
    let body = reply.strip_prefix("stream:").unwrap_or(reply).trim();
    if body == "OK" {
        return Ok(ScanOutcome::Clean);
    }
    match body.strip_suffix(" FOUND") {
        Some(label) => Ok(ScanOutcome::Infected {
            label: label.trim().to_string(),
        }),
        None => Err(ScanError::Protocol(reply.to_string())),
    }
}

#[async_trait]
impl MalwareScanner for ClamdScanner {
    async fn scan(&self, data: &[u8]) -> Result<ScanOutcome, ScanError> {
        let reply = self.exchange(b"zINSTREAM\0", Some(data)).await?;
        let outcome = parse_reply(&reply)?;
        tracing::debug!(address = %self.address, ?outcome, "clamd scan finished");
        Ok(outcome)
    }
}
