//! MCP transport layer.
//!
//! Frames are newline-delimited JSON. A transport is split into a
//! [`FrameReader`] and a [`FrameWriter`] so a background task can own the
//! read side while requests are written concurrently.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::McpError;

/// Read side of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next JSON-RPC message line.
    /// Returns `None` when the transport is closed.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;
}

/// Write side of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one JSON-RPC message line.
    async fn send(&mut self, message: &str) -> Result<(), McpError>;
}

/// Newline-delimited reader over any async byte source.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for LineReader<R> {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        loop {
            let mut line = String::new();
            let bytes_read = self.inner.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

/// Newline-delimited writer over any async byte sink.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for LineWriter<W> {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.inner.write_all(message.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Stdio-based transport: reads stdin, writes stdout.
///
/// Used by a process acting as a tool provider.
pub struct StdioTransport {
    reader: LineReader<tokio::io::Stdin>,
    writer: LineWriter<tokio::io::Stdout>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: LineReader::new(tokio::io::stdin()),
            writer: LineWriter::new(tokio::io::stdout()),
        }
    }

    pub fn split(self) -> (LineReader<tokio::io::Stdin>, LineWriter<tokio::io::Stdout>) {
        (self.reader, self.writer)
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory transport for testing, backed by channel pairs.
pub struct ChannelTransport {
    reader: ChannelReader,
    writer: ChannelWriter,
}

/// Receiving half of a [`ChannelTransport`].
pub struct ChannelReader {
    rx: mpsc::Receiver<String>,
}

/// Sending half of a [`ChannelTransport`].
pub struct ChannelWriter {
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a pair of connected transports.
    ///
    /// Messages sent on one transport are received by the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(32);
        let (tx_b, rx_a) = mpsc::channel(32);
        (
            Self {
                reader: ChannelReader { rx: rx_a },
                writer: ChannelWriter { tx: tx_a },
            },
            Self {
                reader: ChannelReader { rx: rx_b },
                writer: ChannelWriter { tx: tx_b },
            },
        )
    }

    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.tx.send(message.to_string()).await.map_err(|e| {
            McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        })
    }
}

#[async_trait]
impl FrameReader for ChannelTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        self.reader.receive().await
    }
}

#[async_trait]
impl FrameWriter for ChannelTransport {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_pair() {
        let (mut a, mut b) = ChannelTransport::pair();

        a.send("hello from a").await.unwrap();
        let msg = b.receive().await.unwrap();
        assert_eq!(msg, Some("hello from a".to_string()));

        b.send("hello from b").await.unwrap();
        let msg = a.receive().await.unwrap();
        assert_eq!(msg, Some("hello from b".to_string()));
    }

    #[tokio::test]
    async fn test_channel_transport_closed() {
        let (mut a, b) = ChannelTransport::pair();
        drop(b);
        let result = a.receive().await.unwrap();
        assert_eq!(result, None);
        assert!(a.send("anyone?").await.is_err());
    }

    #[tokio::test]
    async fn test_line_reader_skips_blank_lines() {
        let input: &[u8] = b"\n  \n{\"a\":1}\r\n\n{\"b\":2}\n";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.receive().await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(reader.receive().await.unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(reader.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_writer_appends_newline() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = LineWriter::new(client);
        let mut reader = LineReader::new(server);
        writer.send("{\"x\":true}").await.unwrap();
        assert_eq!(reader.receive().await.unwrap().as_deref(), Some("{\"x\":true}"));
    }
}
