//! Listen address specifiers
//!
//! Accepted forms:
//! - `host:port`, `[v6-addr]:port`, `tcp://host:port`
//! - `*:port` (all interfaces)
//! - `:port` or a bare `port` (localhost)
//! - `unix:///path/to/socket`

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{BrokerError, Result};

const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

/// Where the broker listens for debugger clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ListenAddress {
    /// Resolve a TCP address to the first socket address it names
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            ListenAddress::Tcp { host, port } => tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    )
                }),
            ListenAddress::Unix(path) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a TCP address", path.display()),
            )),
        }
    }
}

impl FromStr for ListenAddress {
    type Err = BrokerError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BrokerError::Config("empty listen address".to_string()));
        }

        if let Some(path) = input.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(BrokerError::Config(format!("missing socket path in {:?}", input)));
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }

        let rest = input.strip_prefix(TCP_SCHEME).unwrap_or(input);
        let invalid = || BrokerError::Config(format!("invalid listen address {:?}", input));

        if rest.bytes().all(|b| b.is_ascii_digit()) {
            let port = rest.parse().map_err(|_| invalid())?;
            return Ok(ListenAddress::Tcp {
                host: "localhost".to_string(),
                port,
            });
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = tail.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            rest.rsplit_once(':').ok_or_else(invalid)?
        };

        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = match host {
            "" => "localhost",
            "*" => "0.0.0.0",
            h if h.contains(':') && !rest.starts_with('[') => return Err(invalid()),
            h => h,
        };

        Ok(ListenAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            ListenAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ListenAddress::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}
