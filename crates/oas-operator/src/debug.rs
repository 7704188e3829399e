//! Diagnostic HTTP surface
//!
//! Only exists when the process is given a listen address. Controllers mount
//! read-only handlers on it; `/healthz` is always served.

use std::net::SocketAddr;

use axum::routing::{get, MethodRouter};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

/// Path of the resource-sync rules handler
pub const RESOURCE_SYNC_DEBUG_PATH: &str = "/debug/controllers/resourcesync";

/// Registry of diagnostic handlers
pub struct DebugServer {
    router: Router,
    paths: Vec<String>,
}

impl Default for DebugServer {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugServer {
    /// Create a surface serving only `/healthz`
    pub fn new() -> Self {
        Self {
            router: Router::new().route("/healthz", get(|| async { "ok" })),
            paths: vec!["/healthz".to_string()],
        }
    }

    /// Mount `handler` at `path`
    pub fn handle(&mut self, path: &str, handler: MethodRouter) {
        self.router = std::mem::take(&mut self.router).route(path, handler);
        self.paths.push(path.to_string());
    }

    /// Mounted paths
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// The assembled router
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind `addr`. Failing here is a startup fault, before anything runs.
    pub async fn bind(self, addr: SocketAddr) -> Result<BoundDebugServer> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::DebugServer(format!("failed to bind {}: {}", addr, e)))?;
        Ok(BoundDebugServer {
            listener,
            router: self.router,
            paths: self.paths,
        })
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        self.bind(addr).await?.serve(shutdown).await
    }
}

/// Diagnostic surface holding its listening socket
pub struct BoundDebugServer {
    listener: tokio::net::TcpListener,
    router: Router,
    paths: Vec<String>,
}

impl BoundDebugServer {
    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::DebugServer(e.to_string()))
    }

    /// Serve until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, paths = ?self.paths, "Serving diagnostics");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::DebugServer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    async fn status_of(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn serves_healthz() {
        let server = DebugServer::new();
        assert_eq!(status_of(server.router(), "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn mounted_handlers_are_routed() {
        let mut server = DebugServer::new();
        assert_eq!(
            status_of(server.router(), RESOURCE_SYNC_DEBUG_PATH).await,
            StatusCode::NOT_FOUND
        );

        server.handle(RESOURCE_SYNC_DEBUG_PATH, get(|| async { "rules" }));
        assert_eq!(
            status_of(server.router(), RESOURCE_SYNC_DEBUG_PATH).await,
            StatusCode::OK
        );
        assert_eq!(server.paths().len(), 2);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let server = DebugServer::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.serve("127.0.0.1:0".parse().unwrap(), shutdown),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bind_fails_when_address_is_taken() {
        let first = DebugServer::new()
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let result = DebugServer::new().bind(taken).await;
        match result {
            Err(Error::DebugServer(message)) => assert!(message.contains(&taken.to_string())),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bound {} twice", taken),
        }
    }

    #[tokio::test]
    async fn bound_server_answers_healthz() {
        let server = DebugServer::new()
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
