//! TCP/TLS transport
//!
//! Owns the socket for the lifetime of the session: resolve, connect,
//! handshake, byte-counted reads, fully flushed writes, and the TLS
//! close_notify shutdown.

use maildrain_common::config::{AccountConfig, TlsConfig};
use maildrain_common::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

#[derive(Debug)]
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// The connected byte pipe, plain or TLS
#[derive(Debug)]
pub struct Transport {
    stream: Stream,
    bytes_read: u64,
}

impl Transport {
    /// Resolve the configured host, connect, and shake hands if TLS is on.
    pub async fn establish(account: &AccountConfig, tls: &TlsConfig) -> Result<Self> {
        info!("Resolving {}...", account.host);
        let endpoints: Vec<SocketAddr> = lookup_host((account.host.as_str(), account.port))
            .await
            .map_err(|e| Error::Connect(format!("Failed to resolve {}: {}", account.host, e)))?
            .collect();
        if endpoints.is_empty() {
            return Err(Error::Connect(format!(
                "No addresses found for {}",
                account.host
            )));
        }
        info!("{} resolved.", account.host);

        info!("Connecting to {}...", account.host);
        let tcp = connect_any(&endpoints, &account.host).await?;
        info!("{} connected.", account.host);

        let stream = if tls.enabled {
            if !tls.cipher.is_empty() {
                info!("Cipher list: {}", tls.cipher.join(":"));
            }
            info!("Shaking hands with {}...", account.host);
            let connector = TlsConnector::from(Arc::new(crate::tls::client_config(tls)?));
            let server_name = crate::tls::server_name(&account.host)?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Tls(format!("Handshake with {} failed: {}", account.host, e)))?;
            info!("Handshake completed.");
            Stream::Tls(Box::new(tls_stream))
        } else {
            Stream::Plain(tcp)
        };

        Ok(Self {
            stream,
            bytes_read: 0,
        })
    }

    /// Read some bytes. Errors are returned raw so the session can tell
    /// benign shutdown races from real failures.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = match &mut self.stream {
            Stream::Plain(s) => s.read(buf).await?,
            Stream::Tls(s) => s.read(buf).await?,
        };
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Write a full command buffer.
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => s.write_all(data).await?,
            Stream::Tls(s) => s.write_all(data).await?,
        }
        Ok(())
    }

    /// Initiate an orderly shutdown (close_notify on TLS).
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Tls(s) => s.shutdown().await,
        }
    }

    /// Total bytes read since the connection was established.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

async fn connect_any(endpoints: &[SocketAddr], host: &str) -> Result<TcpStream> {
    let mut last_err: Option<std::io::Error> = None;
    for endpoint in endpoints {
        debug!("Trying endpoint {}", endpoint);
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Endpoint {} failed: {}", endpoint, e);
                last_err = Some(e);
            }
        }
    }
    Err(Error::Connect(match last_err {
        Some(e) => format!("Failed to connect to {}: {}", host, e),
        None => format!("Failed to connect to {}", host),
    }))
}
