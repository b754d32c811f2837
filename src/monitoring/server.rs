//! Monitoring query service.
//!
//! Newline-delimited JSON over TCP. Each request line is
//! `{"names": ["a", "b"]}`; each response line is `{"points": [...]}` holding
//! the subset of requested points that exist.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{IngestError, IngestResult};
use crate::monitoring::store::{MonitoringPoint, MonitoringStore};

/// Query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Requested point names
    pub names: Vec<String>,
}

/// Query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Existing points among those requested
    pub points: Vec<MonitoringPoint>,
}

/// Serve queries on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    store: Arc<MonitoringStore>,
    shutdown: F,
) -> IngestResult<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Monitoring query service listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Monitoring query service stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let Some((socket, peer)) = accepted_or_skip(accepted) else {
                    continue;
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, store).await {
                        warn!(%peer, error = %e, "Monitoring client error");
                    }
                });
            }
        }
    }
}

/// A failed `accept` (e.g. descriptor exhaustion) skips one client only.
fn accepted_or_skip<T>(accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            warn!(error = %e, "Monitoring accept failed");
            None
        }
    }
}

async fn handle_connection(socket: TcpStream, store: Arc<MonitoringStore>) -> IngestResult<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: QueryRequest = serde_json::from_str(&line)?;
        let response = QueryResponse {
            points: store.get(&request.names),
        };
        debug!(
            requested = request.names.len(),
            returned = response.points.len(),
            "Monitoring query"
        );
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        writer.write_all(&body).await?;
    }
    Ok(())
}

/// One-shot client query, used by tooling and tests.
pub async fn query(addr: SocketAddr, names: &[&str]) -> IngestResult<Vec<MonitoringPoint>> {
    let socket = TcpStream::connect(addr)
        .await
        .map_err(|e| IngestError::Transport(format!("connect to {}: {}", addr, e)))?;
    let (reader, mut writer) = socket.into_split();

    let request = QueryRequest {
        names: names.iter().map(|n| n.to_string()).collect(),
    };
    let mut body = serde_json::to_vec(&request)?;
    body.push(b'\n');
    writer.write_all(&body).await?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| IngestError::Transport("connection closed before response".into()))?;
    let response: QueryResponse = serde_json::from_str(&line)?;
    Ok(response.points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::store::{MonitorValue, PointStatus};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_query_round_trip() {
        let store = Arc::new(MonitoringStore::new());
        store.update("ingest.cycles", 12i64, PointStatus::Ok, "");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::clone(&store), async move {
            let _ = rx.await;
        }));

        let points = query(addr, &["ingest.cycles", "nope"]).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, MonitorValue::Int64(12));

        store.invalidate("ingest.cycles");
        let points = query(addr, &["ingest.cycles"]).await.unwrap();
        assert!(points.is_empty());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn failed_accept_is_skipped() {
        let emfile = std::io::Error::from_raw_os_error(24);
        assert!(accepted_or_skip::<()>(Err(emfile)).is_none());
        assert_eq!(accepted_or_skip(Ok(7)), Some(7));
    }

    #[tokio::test]
    async fn malformed_client_does_not_stop_service() {
        let store = Arc::new(MonitoringStore::new());
        store.update("ingest.cycles", 3i64, PointStatus::Ok, "");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::clone(&store), async move {
            let _ = rx.await;
        }));

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"not json\n").await.unwrap();
        drop(bad);

        let points = query(addr, &["ingest.cycles"]).await.unwrap();
        assert_eq!(points.len(), 1);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
