use super::protocol::{ClientRequest, Request, Response, read_payload, ttl_from_millis, write_frame};
use crate::cluster::ClusterClient;
use crate::storage::{CacheEngine, CasOutcome};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Serves the local engine to peer replicas and, when a cluster client is
/// attached, coordinates replicated requests from applications.
pub struct NodeServer {
    engine: Arc<CacheEngine>,
    cluster: Option<Arc<ClusterClient>>,
    listener: TcpListener,
}

impl NodeServer {
    pub async fn bind(addr: SocketAddr, engine: Arc<CacheEngine>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            engine,
            cluster: None,
            listener,
        })
    }

    /// Routes [`Request::Client`] through `cluster`. Without one, such requests
    /// are answered with [`Response::Error`].
    pub fn with_cluster(mut self, cluster: Arc<ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped. Each connection gets its
    /// own task.
    pub async fn serve(self) {
        tracing::info!(
            "Node server listening on {} (cluster routing {})",
            self.listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            if self.cluster.is_some() { "on" } else { "off" }
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    continue;
                }
            };

            let engine = self.engine.clone();
            let cluster = self.cluster.clone();
            tokio::spawn(async move {
                tracing::debug!("Connection from {}", peer);
                if let Err(e) = serve_connection(engine, cluster, stream).await {
                    tracing::debug!("Connection from {} closed: {:#}", peer, e);
                }
            });
        }
    }
}

async fn serve_connection(
    engine: Arc<CacheEngine>,
    cluster: Option<Arc<ClusterClient>>,
    mut stream: TcpStream,
) -> Result<()> {
    stream.set_nodelay(true)?;

    while let Some(payload) = read_payload(&mut stream).await? {
        let response = match bincode::deserialize::<Request>(&payload) {
            Ok(Request::Client(request)) => match &cluster {
                Some(cluster) => handle_client_request(cluster, request).await,
                None => Response::Error("cluster routing is not enabled on this node".to_string()),
            },
            Ok(request) => handle_request(&engine, request),
            Err(e) => {
                tracing::warn!("Malformed request: {}", e);
                Response::Error(format!("malformed request: {}", e))
            }
        };
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// Applies one request to the local engine.
pub fn handle_request(engine: &CacheEngine, request: Request) -> Response {
    match request {
        Request::Set { key, value, ttl_ms } => {
            Response::Stored(engine.set(&key, value, ttl_from_millis(ttl_ms)))
        }
        Request::Get { key } => Response::Value(engine.get(&key)),
        Request::GetWithToken { key } => Response::ValueWithToken(engine.get_with_token(&key)),
        Request::Delete { key } => Response::Deleted(engine.delete(&key)),
        Request::Cas {
            key,
            value,
            expected,
            ttl_ms,
        } => {
            let outcome = engine.compare_and_swap(&key, value, expected, ttl_from_millis(ttl_ms));
            Response::Swapped(matches!(outcome, CasOutcome::Stored(_)))
        }
        Request::Clear => {
            engine.clear();
            Response::Cleared
        }
        Request::Ping => Response::Pong,
        Request::Client(_) => {
            Response::Error("replicated requests need a cluster client".to_string())
        }
    }
}

/// Runs one replicated request through the cluster client.
pub async fn handle_client_request(cluster: &ClusterClient, request: ClientRequest) -> Response {
    match request {
        ClientRequest::Set { key, value, ttl_ms } => {
            match cluster.set(&key, value, ttl_from_millis(ttl_ms)).await {
                Ok(stored) => Response::Stored(stored),
                Err(e) => Response::Error(format!("{:#}", e)),
            }
        }
        ClientRequest::Get { key } => Response::Value(cluster.get(&key).await),
        ClientRequest::GetWithToken { key } => {
            Response::ValueWithToken(cluster.get_with_token(&key).await)
        }
        ClientRequest::Delete { key } => Response::Deleted(cluster.delete(&key).await),
        ClientRequest::Cas {
            key,
            value,
            expected,
            ttl_ms,
        } => {
            match cluster
                .compare_and_swap(&key, value, expected, ttl_from_millis(ttl_ms))
                .await
            {
                Ok(swapped) => Response::Swapped(swapped),
                Err(e) => Response::Error(format!("{:#}", e)),
            }
        }
        ClientRequest::Clear => {
            cluster.clear().await;
            Response::Cleared
        }
    }
}
