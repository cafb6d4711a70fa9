use super::protocol::{Request, Response, read_frame, ttl_to_millis, write_frame};
use crate::cluster::node::Node;
use crate::config::{NodeConfig, PeerConfig};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// A replica reached over TCP.
///
/// Holds at most one pooled connection. It is opened lazily, reused while healthy,
/// and dropped after any I/O error or timeout so the next call reconnects.
pub struct RemoteNode {
    id: String,
    addr: SocketAddr,
    connection: Mutex<Option<TcpStream>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteNode {
    pub fn new(
        id: impl Into<String>,
        addr: SocketAddr,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            addr,
            connection: Mutex::new(None),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn from_config(peer: &PeerConfig, config: &NodeConfig) -> Self {
        Self::new(
            peer.id.clone(),
            peer.addr,
            config.connect_timeout(),
            config.request_timeout(),
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                anyhow!(
                    "Connecting to {} ({}) timed out after {:?}",
                    self.id,
                    self.addr,
                    self.connect_timeout
                )
            })?
            .with_context(|| format!("Failed to connect to {} ({})", self.id, self.addr))?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {} ({})", self.id, self.addr);
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
        write_frame(stream, request).await?;
        match read_frame(stream).await? {
            Some(response) => Ok(response),
            None => Err(anyhow!("Connection closed before a response arrived")),
        }
    }

    /// Sends one request and waits for its response. Server-side failures come
    /// back as `Err` without dropping the connection.
    async fn call(&self, request: Request) -> Result<Response> {
        let mut connection = self.connection.lock().await;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let response = match timeout(self.request_timeout, Self::exchange(&mut stream, &request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(e.context(format!("Request to {} ({}) failed", self.id, self.addr)));
            }
            Err(_) => {
                return Err(anyhow!(
                    "Request to {} ({}) timed out after {:?}",
                    self.id,
                    self.addr,
                    self.request_timeout
                ));
            }
        };
        *connection = Some(stream);

        match response {
            Response::Error(message) => Err(anyhow!("{} rejected request: {}", self.id, message)),
            response => Ok(response),
        }
    }

    fn unexpected(&self, response: Response) -> anyhow::Error {
        anyhow!("Unexpected response from {}: {:?}", self.id, response)
    }

    pub async fn ping(&self) -> Result<()> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let request = Request::Set {
            key: key.to_string(),
            value,
            ttl_ms: ttl_to_millis(ttl),
        };
        match self.call(request).await? {
            Response::Stored(stored) => Ok(stored),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.call(request).await? {
            Response::Value(value) => Ok(value),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get_with_token(&self, key: &str) -> Result<Option<(Bytes, u64)>> {
        let request = Request::GetWithToken {
            key: key.to_string(),
        };
        match self.call(request).await? {
            Response::ValueWithToken(found) => Ok(found),
            other => Err(self.unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let request = Request::Delete {
            key: key.to_string(),
        };
        match self.call(request).await? {
            Response::Deleted(deleted) => Ok(deleted),
            other => Err(self.unexpected(other)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    ) -> Result<bool> {
        let request = Request::Cas {
            key: key.to_string(),
            value,
            expected,
            ttl_ms: ttl_to_millis(ttl),
        };
        match self.call(request).await? {
            Response::Swapped(swapped) => Ok(swapped),
            other => Err(self.unexpected(other)),
        }
    }

    async fn clear(&self) -> Result<()> {
        match self.call(Request::Clear).await? {
            Response::Cleared => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }
}
