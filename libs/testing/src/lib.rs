//! Test helpers shared by the balancer and agent test suites.
//!
//! - [`LineClient`] drives the control protocol one line at a time, the way
//!   a scripted backend would.
//! - [`free_udp_port`] finds a UDP port that is free on a given address.
//! - [`init_tracing`] routes `tracing` output through the test writer.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use fluxlb_proto::Reply;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;

/// Default time a [`LineClient`] waits for a line.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented control client.
pub struct LineClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    timeout: Duration,
}

impl LineClient<TcpStream> {
    /// Connect to a control listener.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> LineClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
            timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// Override how long `recv` waits.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one line; the newline is appended.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Send raw bytes as-is, without appending a newline.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Receive one line with the line terminator stripped.
    ///
    /// Fails with `TimedOut` if nothing arrives in time and with
    /// `UnexpectedEof` if the peer closed the connection.
    pub async fn recv(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no line received"))??;

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Receive and decode one balancer reply.
    pub async fn recv_reply(&mut self) -> io::Result<Reply> {
        let line = self.recv().await?;
        Reply::decode(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Assert that the peer closes the connection without sending more.
    pub async fn expect_closed(&mut self) -> io::Result<()> {
        match self.recv().await {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            // a reset also counts as closed
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
            Err(e) => Err(e),
            Ok(line) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected close, received {:?}", line),
            )),
        }
    }

    /// Close the write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Find a UDP port that is currently free on `ip`.
pub fn free_udp_port(ip: IpAddr) -> io::Result<u16> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0))?;
    Ok(socket.local_addr()?.port())
}

/// Install a test-writer subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
