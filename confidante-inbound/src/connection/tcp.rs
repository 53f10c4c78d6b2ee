use std::{pin::Pin, sync::Arc, task::ready};

use anyhow::{anyhow, bail, Error};
use async_compression::tokio::{bufread::ZlibDecoder, write::ZlibEncoder};
use futures::Future;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
};
use tokio_rustls::{rustls::ServerConfig, server::TlsStream, Accept, TlsAcceptor};

use confidante_core::xmpp::stream::Connection;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    Compressed {
        reader: ZlibDecoder<BufReader<BoxedReader>>,
        writer: ZlibEncoder<BoxedWriter>,
    },
    /// Only ever observed transiently, while `enable_compression` swaps the
    /// variant out from under `&mut self`.
    Empty,
}

pub struct TcpConnection {
    socket: Socket,
    server_config: Arc<ServerConfig>,
    starttls_allowed: bool,
    secure: bool,
    authenticated: bool,
}

impl TcpConnection {
    pub fn new(socket: TcpStream, server_config: Arc<ServerConfig>, starttls_allowed: bool) -> Self {
        TcpConnection {
            socket: Socket::Plain(socket),
            server_config,
            starttls_allowed,
            secure: false,
            authenticated: false,
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        match self.socket {
            Socket::Plain(socket) => {
                let accept = TlsAcceptor::from(self.server_config.clone()).accept(socket);

                Ok(TcpConnectionUpgrade {
                    accept,
                    server_config: self.server_config,
                })
            }
            _ => Err(anyhow!("connection is already secure")),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        self.starttls_allowed && !self.is_secure()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn enable_compression(&mut self) -> Result<(), Error> {
        let socket = std::mem::replace(&mut self.socket, Socket::Empty);

        let (reader, writer): (BoxedReader, BoxedWriter) = match socket {
            Socket::Plain(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                (Box::new(reader), Box::new(writer))
            }
            Socket::Tls(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                (Box::new(reader), Box::new(writer))
            }
            Socket::Compressed { reader, writer } => {
                self.socket = Socket::Compressed { reader, writer };
                bail!("compression is already enabled");
            }
            Socket::Empty => unreachable!("socket is only Empty within enable_compression"),
        };

        self.socket = Socket::Compressed {
            reader: ZlibDecoder::new(BufReader::new(reader)),
            writer: ZlibEncoder::new(writer),
        };
        self.starttls_allowed = false;

        Ok(())
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Compressed { reader, .. } => Pin::new(reader).poll_read(cx, buf),
            Socket::Empty => unreachable!("socket is only Empty within enable_compression"),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Compressed { writer, .. } => Pin::new(writer).poll_write(cx, buf),
            Socket::Empty => unreachable!("socket is only Empty within enable_compression"),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Compressed { writer, .. } => Pin::new(writer).poll_flush(cx),
            Socket::Empty => unreachable!("socket is only Empty within enable_compression"),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Compressed { writer, .. } => Pin::new(writer).poll_shutdown(cx),
            Socket::Empty => unreachable!("socket is only Empty within enable_compression"),
        }
    }
}

pub struct TcpConnectionUpgrade {
    accept: Accept<TcpStream>,
    server_config: Arc<ServerConfig>,
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.accept).poll(cx))?;
        let authenticated = tls_stream.get_ref().1.peer_certificates().is_some();
        let connection = TcpConnection {
            socket: Socket::Tls(tls_stream),
            server_config: self.server_config.clone(),
            starttls_allowed: false,
            secure: true,
            authenticated,
        };
        std::task::Poll::Ready(Ok(connection))
    }
}
