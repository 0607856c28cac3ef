//! Listening endpoint for debugger clients

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpSocket};
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::errors::{BrokerError, Result};
use crate::net::{Connection, ListenAddress};

/// Listen backlog. Test harnesses open many connections at once.
pub const DEFAULT_BACKLOG: u32 = 100;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

/// Bound listening socket
pub struct Acceptor {
    listener: Listener,
    identity: String,
}

impl Acceptor {
    /// Bind and start listening on `address`
    ///
    /// # Errors
    /// `BrokerError::Listen` if the address cannot be resolved or bound.
    pub async fn listen(address: &ListenAddress, backlog: u32) -> Result<Self> {
        let listen_error = |source: std::io::Error| BrokerError::Listen {
            address: address.to_string(),
            source,
        };

        let listener = match address {
            ListenAddress::Tcp { .. } => {
                let addr = address.resolve().await.map_err(listen_error)?;
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4(),
                    SocketAddr::V6(_) => TcpSocket::new_v6(),
                }
                .map_err(listen_error)?;
                #[cfg(unix)]
                socket.set_reuseaddr(true).map_err(listen_error)?;
                socket.bind(addr).map_err(listen_error)?;
                Listener::Tcp(socket.listen(backlog).map_err(listen_error)?)
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => Listener::Unix {
                listener: UnixListener::bind(path).map_err(listen_error)?,
                path: path.clone(),
            },
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => {
                return Err(listen_error(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )))
            }
        };

        let identity = match &listener {
            Listener::Tcp(tcp) => tcp.local_addr().map_err(listen_error)?.to_string(),
            #[cfg(unix)]
            Listener::Unix { path, .. } => path.display().to_string(),
        };

        info!(address = %address, identity = %identity, "listening");
        Ok(Self { listener, identity })
    }

    /// Wait for the next client
    ///
    /// The returned connection is a blocking std stream.
    pub async fn accept(&self) -> Result<Connection> {
        let conn = match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted tcp connection");
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Connection::Tcp(stream)
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted unix connection");
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                Connection::Unix(stream)
            }
        };
        Ok(conn)
    }

    /// Stable text naming the bound endpoint: `host:port` or the socket path
    pub fn local_identity(&self) -> &str {
        &self.identity
    }

    /// Bound TCP address, if listening on TCP
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }
}

#[cfg(unix)]
impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = &self.listener {
            std::fs::remove_file(path).ok();
        }
    }
}
