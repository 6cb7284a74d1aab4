//! Framed PDU transport over asynchronous byte streams.
//!
//! [`Connection`] frames PDUs over any async byte stream:
//! it reads the fixed 6-octet PDU header,
//! validates the announced length,
//! and hands complete buffers to the [codec](crate::pdu).
//! Writes are bounded by an optional per-PDU deadline,
//! which matters when a large store operation
//! spans many PDUs over a slow link.
//!
//! The [`Connector`] trait abstracts over how the underlying stream
//! is obtained, so that plain TCP, TLS and in-memory test doubles
//! all share one contract.

use std::future::Future;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::pdu::{
    self, Pdu, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

/// An error handling PDU traffic on a connection.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the connection is closed
    Closed { backtrace: Backtrace },

    /// failed to read from the underlying stream
    Read {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the peer closed the stream in the middle of a PDU
    TruncatedPdu { backtrace: Backtrace },

    #[snafu(display(
        "incoming PDU too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// failed to decode PDU
    Decode {
        #[snafu(backtrace)]
        source: pdu::reader::Error,
    },

    /// failed to encode PDU
    Encode {
        #[snafu(backtrace)]
        source: pdu::writer::Error,
    },

    #[snafu(display("write timed out after {:?}", timeout))]
    WriteTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    /// failed to write to the underlying stream
    Write {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not connect to `{}`", address))]
    Connect {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("connect to `{}` timed out after {:?}", address, timeout))]
    ConnectTimeout {
        address: String,
        timeout: Duration,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A PDU-framed view over an asynchronous byte stream.
///
/// Reading is resumable:
/// partially received PDUs are buffered internally,
/// so a dropped `read_pdu` future never desynchronizes the stream.
#[derive(Debug)]
pub struct Connection<S> {
    stream: Option<S>,
    read_buf: BytesMut,
    max_pdu_length: u32,
    strict: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new PDU-framed connection over the given stream.
    ///
    /// `max_pdu_length` is the maximum length
    /// this node is willing to receive.
    pub fn new(stream: S, max_pdu_length: u32, strict: bool) -> Self {
        let max_pdu_length = max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);
        Connection {
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(PDU_HEADER_SIZE as usize),
            max_pdu_length,
            strict,
        }
    }

    /// The maximum PDU length admitted on the inbound direction.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Whether the connection was closed locally.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Read a single PDU,
    /// waiting until one is fully framed or the peer closes the stream.
    pub async fn read_pdu(&mut self) -> Result<Pdu> {
        let effective_max = if self.strict {
            self.max_pdu_length
        } else {
            MAXIMUM_PDU_SIZE
        };
        loop {
            if self.read_buf.len() >= PDU_HEADER_SIZE as usize {
                let pdu_length = u32::from_be_bytes([
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                    self.read_buf[5],
                ]);
                snafu::ensure!(
                    pdu_length <= effective_max,
                    PduTooLargeSnafu {
                        pdu_length,
                        max_pdu_length: effective_max,
                    }
                );

                let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
                if self.read_buf.len() >= total {
                    let bytes = self.read_buf.copy_to_bytes(total);
                    let pdu = pdu::read_pdu(&mut &bytes[..], self.max_pdu_length, self.strict)
                        .context(DecodeSnafu)?;
                    return Ok(pdu);
                }
            }

            let stream = self.stream.as_mut().context(ClosedSnafu)?;
            // read_buf is cancel safe, a dropped future leaves
            // any bytes received so far in the buffer
            let n = stream.read_buf(&mut self.read_buf).await.context(ReadSnafu)?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return ClosedSnafu.fail();
                }
                return TruncatedPduSnafu.fail();
            }
        }
    }

    /// Write a single PDU, flushing it to the stream.
    ///
    /// When `write_timeout` is given and the kernel does not accept
    /// all bytes before the deadline elapses,
    /// the write fails with [`Error::WriteTimeout`].
    pub async fn write_pdu(&mut self, pdu: &Pdu, write_timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream.as_mut().context(ClosedSnafu)?;

        let mut buffer = Vec::with_capacity(PDU_HEADER_SIZE as usize + 128);
        pdu::write_pdu(&mut buffer, pdu).context(EncodeSnafu)?;

        match write_timeout {
            Some(timeout) => {
                let deadline = tokio::time::Instant::now() + timeout;
                let write = async {
                    stream.write_all(&buffer).await?;
                    stream.flush().await
                };
                match tokio::time::timeout_at(deadline, write).await {
                    Ok(result) => result.context(WriteSnafu),
                    Err(_) => WriteTimeoutSnafu { timeout }.fail(),
                }
            }
            None => {
                stream.write_all(&buffer).await.context(WriteSnafu)?;
                stream.flush().await.context(WriteSnafu)
            }
        }
    }

    /// Shut down the connection.
    ///
    /// Closing an already closed connection is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// A factory of asynchronous byte streams towards one peer.
///
/// Implementations exist for plain TCP ([`TcpConnector`])
/// and, with the `tls` feature, TLS ([`TlsConnector`]).
/// Tests provide their own implementations
/// to decorate the stream with faults or latency.
pub trait Connector {
    /// The type of stream this connector produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to the peer.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A connector opening plain TCP streams.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Create a connector for the given socket address
    /// (such as `"pacs.example.com:104"`).
    pub fn new(address: impl Into<String>) -> Self {
        TcpConnector {
            address: address.into(),
            connect_timeout: None,
        }
    }

    /// Bound the time spent establishing the TCP connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The socket address this connector points at.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(self.address.as_str()))
                .await
                .ok()
                .context(ConnectTimeoutSnafu {
                    address: self.address.clone(),
                    timeout,
                })?
                .context(ConnectSnafu {
                    address: self.address.clone(),
                })?,
            None => TcpStream::connect(self.address.as_str())
                .await
                .context(ConnectSnafu {
                    address: self.address.clone(),
                })?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        self.open().await
    }
}

/// Open a TCP stream to `address`,
/// for callers establishing associations by address
/// rather than through a [`Connector`].
pub async fn connect<A>(address: A) -> Result<TcpStream>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let description = format!("{:?}", address);
    let stream = TcpStream::connect(address).await.context(ConnectSnafu {
        address: description,
    })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// A connector wrapping TCP streams in TLS.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    config: std::sync::Arc<rustls::ClientConfig>,
    server_name: rustls::pki_types::ServerName<'static>,
}

#[cfg(feature = "tls")]
impl TlsConnector {
    /// Create a TLS connector towards the given address,
    /// presenting `server_name` for certificate validation.
    pub fn new(
        tcp: TcpConnector,
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Self {
        TlsConnector {
            tcp,
            config,
            server_name,
        }
    }
}

#[cfg(feature = "tls")]
impl Connector for TlsConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream> {
        let stream = self.tcp.open().await?;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        connector
            .connect(self.server_name.clone(), stream)
            .await
            .context(ConnectSnafu {
                address: self.tcp.address.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AbortRQSource, DEFAULT_MAX_PDU};

    #[tokio::test]
    async fn roundtrip_over_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sender = Connection::new(client, DEFAULT_MAX_PDU, true);
        let mut receiver = Connection::new(server, DEFAULT_MAX_PDU, true);

        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        sender.write_pdu(&pdu, None).await.unwrap();
        let received = receiver.read_pdu().await.unwrap();
        assert_eq!(received, pdu);
    }

    #[tokio::test]
    async fn clean_peer_shutdown_reports_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sender = Connection::new(client, DEFAULT_MAX_PDU, true);
        let mut receiver = Connection::new(server, DEFAULT_MAX_PDU, true);

        sender.close().await;
        // a second close is a no-op
        sender.close().await;

        match receiver.read_pdu().await {
            Err(Error::Closed { .. }) => (),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_pdu_reports_truncation() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut receiver = Connection::new(server, DEFAULT_MAX_PDU, true);

        // a release PDU header announcing 4 bytes, with only 2 sent
        client.write_all(&[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00])
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        match receiver.read_pdu().await {
            Err(Error::TruncatedPdu { .. }) => (),
            other => panic!("expected TruncatedPdu, got {:?}", other),
        }
    }
}
