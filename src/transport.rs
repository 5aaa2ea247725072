//! Byte streams the runtime talks to the broker over.
//!
//! [`MqttTransport`] is the seam between the runtime and a network stack; [`TcpTransport`]
//! implements it on an `embassy-net` socket. Anything else that moves ordered bytes (TLS,
//! a UART bridge, an in-memory pipe in tests) only needs the four methods.

use core::pin::pin;

use embassy_net::IpEndpoint;
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
use futures::future::{Either, select};

/// A reliable, ordered byte stream to the broker.
///
/// A transport may be opened again after `close`; the runtime does so on every reconnect.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// Where to connect, e.g. a socket address.
    type Endpoint;
    /// Failure reported by `open`, `send` or `recv`. Only its presence matters to the runtime.
    type Error: core::fmt::Debug;

    /// Opens a session to `endpoint`.
    async fn open(&mut self, endpoint: &Self::Endpoint) -> Result<(), Self::Error>;

    /// Writes all of `buf`. A frame is handed over whole, never split across calls.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Reads whatever is available into `buf`, waiting for at least one byte.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the stream.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Tears the session down. Must be safe to call on a closed transport.
    async fn close(&mut self);
}

/// Errors from [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTransportError {
    Connect(ConnectError),
    Io(TcpError),
    /// No data arrived within the configured read timeout.
    Timeout,
}

/// [`MqttTransport`] over an `embassy-net` TCP socket.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    read_timeout: Option<Duration>,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` around an unconnected socket.
    pub fn new(socket: TcpSocket<'a>) -> Self {
        Self {
            socket,
            read_timeout: None,
        }
    }

    /// Fails a read if the broker stays silent for `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    async fn read_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TcpTransportError> {
        let read = pin!(self.socket.read(buf));
        let timer = pin!(Timer::after(timeout));
        match select(read, timer).await {
            Either::Left((result, _)) => result.map_err(TcpTransportError::Io),
            Either::Right(((), _)) => {
                warn!("TCP read timed out after {} ms", timeout.as_millis());
                Err(TcpTransportError::Timeout)
            }
        }
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Endpoint = IpEndpoint;
    type Error = TcpTransportError;

    async fn open(&mut self, endpoint: &IpEndpoint) -> Result<(), Self::Error> {
        debug!("TCP connect");
        self.socket
            .connect(*endpoint)
            .await
            .map_err(TcpTransportError::Connect)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("TCP TX {} bytes", buf.len());
        self.socket
            .write_all(buf)
            .await
            .map_err(TcpTransportError::Io)?;
        self.socket.flush().await.map_err(TcpTransportError::Io)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = match self.read_timeout {
            Some(timeout) => self.read_within(buf, timeout).await?,
            None => self.socket.read(buf).await.map_err(TcpTransportError::Io)?,
        };
        if n == 0 {
            debug!("TCP connection closed by peer");
        } else {
            trace!("TCP RX {} bytes", n);
        }
        Ok(n)
    }

    async fn close(&mut self) {
        self.socket.abort();
        // Waits until the RST is out so the socket can connect again.
        let _ = self.socket.flush().await;
    }
}
