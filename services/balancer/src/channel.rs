//! Line-framed control channel with read and write deadlines.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::time::timeout;

/// Longest accepted control line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1024;

/// Control channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no message within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    #[error("line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    /// Line was not valid UTF-8; carries a lossy rendering.
    #[error("line is not valid UTF-8")]
    InvalidUtf8(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Newline-delimited control connection.
pub struct ControlChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
            read_timeout,
            write_timeout,
        }
    }

    /// Read one line within the read timeout.
    ///
    /// The terminator (`\n` or `\r\n`) is stripped.
    pub async fn read_line(&mut self) -> Result<String, ChannelError> {
        let limit = self.read_timeout;
        self.read_line_within(limit).await
    }

    /// Read one line within `limit`.
    pub async fn read_line_within(&mut self, limit: Duration) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let mut bounded = (&mut self.reader).take(MAX_LINE_LEN as u64 + 1);

        let n = timeout(limit, bounded.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| ChannelError::ReadTimeout(limit))??;

        if n == 0 {
            return Err(ChannelError::Closed);
        }
        if !buf.ends_with(b"\n") && buf.len() > MAX_LINE_LEN {
            return Err(ChannelError::LineTooLong);
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }

        String::from_utf8(buf).map_err(|e| {
            ChannelError::InvalidUtf8(String::from_utf8_lossy(e.as_bytes()).into_owned())
        })
    }

    /// Write one line within the write timeout.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let limit = self.write_timeout;
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push('\n');

        let writer = &mut self.writer;
        timeout(limit, async move {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ChannelError::WriteTimeout(limit))??;

        Ok(())
    }

    /// Write a message using its wire (`Display`) form.
    pub async fn send<M: fmt::Display>(&mut self, message: &M) -> Result<(), ChannelError> {
        self.write_line(&message.to_string()).await
    }

    /// Close the write side of the connection.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        let limit = self.write_timeout;
        timeout(limit, self.writer.shutdown())
            .await
            .map_err(|_| ChannelError::WriteTimeout(limit))??;
        Ok(())
    }
}
