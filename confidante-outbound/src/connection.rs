use std::{pin::Pin, sync::Arc, task::ready};

use anyhow::{Error, anyhow};
use futures::Future;
use tokio::net::TcpStream;
use tokio_rustls::{
    Connect, TlsConnector, client::TlsStream,
    rustls::{ClientConfig, pki_types::ServerName},
};

use confidante_core::xmpp::stream::Connection;

enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// The client side of a dialed s2s connection. Compression is never offered
/// on s2s streams, so unlike the inbound `TcpConnection` this has no
/// `Compressed` socket variant.
pub struct OutboundConnection {
    socket: Socket,
    client_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    secure: bool,
}

impl OutboundConnection {
    pub fn new(
        socket: TcpStream,
        client_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        OutboundConnection {
            socket: Socket::Plain(socket),
            client_config,
            server_name,
            secure: false,
        }
    }
}

impl Connection for OutboundConnection {
    type Upgrade = OutboundConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        match self.socket {
            Socket::Plain(socket) => {
                let connect = TlsConnector::from(self.client_config.clone())
                    .connect(self.server_name.clone(), socket);

                Ok(OutboundConnectionUpgrade {
                    connect,
                    client_config: self.client_config,
                    server_name: self.server_name,
                })
            }
            Socket::Tls(_) => Err(anyhow!("connection is already secure")),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        !self.secure
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    /// EXTERNAL eligibility for a dialed stream is decided by the out stream
    /// state machine from the remote's advertised mechanisms, not from this
    /// flag; it exists only to satisfy the trait.
    fn is_authenticated(&self) -> bool {
        false
    }

    fn enable_compression(&mut self) -> Result<(), Error> {
        Err(anyhow!("compression is not offered on s2s streams"))
    }
}

impl tokio::io::AsyncRead for OutboundConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for OutboundConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

pub struct OutboundConnectionUpgrade {
    connect: Connect<TcpStream>,
    client_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl Future for OutboundConnectionUpgrade {
    type Output = Result<OutboundConnection, Error>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.connect).poll(cx)).map_err(|err| anyhow!(err))?;
        let connection = OutboundConnection {
            socket: Socket::Tls(tls_stream),
            client_config: self.client_config.clone(),
            server_name: self.server_name.clone(),
            secure: true,
        };
        std::task::Poll::Ready(Ok(connection))
    }
}
