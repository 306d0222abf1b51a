// SPDX-License-Identifier: Apache-2.0

//! Introspection endpoint: `GET /stats` returns every registered counter
//! plus the running configuration (secrets redacted) as JSON. Bound to
//! loopback only; no authentication.

use crate::telemetry::registry;

use http::Method;
use http_body_util::Full;
use hyper::body::Body;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener as AsyncTcpListener;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

/// The stats endpoint's socket. Loopback-only by construction (the endpoint
/// is unauthenticated) and bound with std so the port is claimed, and a bad
/// or busy port rejected, before the runtime starts.
pub struct StatsListener {
    inner: StdTcpListener,
}

impl StatsListener {
    /// Bind `127.0.0.1:<port>`. Port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        match StdTcpListener::bind(endpoint) {
            Ok(inner) => Ok(Self { inner }),
            Err(e) => Err(format!("unable to bind stats endpoint {}: {}", endpoint, e).into()),
        }
    }

    pub fn bound_address(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn into_async(self) -> io::Result<AsyncTcpListener> {
        // tokio requires the socket in non-blocking mode
        self.inner.set_nonblocking(true)?;
        AsyncTcpListener::from_std(self.inner)
    }
}

pub struct StatsServer {
    config: Arc<serde_json::Value>,
}

impl StatsServer {
    /// `config` is the redacted running configuration echoed in responses.
    pub fn new(config: serde_json::Value) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Serve requests until cancelled.
    pub async fn serve(
        &self,
        listener: StatsListener,
        cancellation: CancellationToken,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let svc = StatsService {
            config: self.config.clone(),
        };

        // To bridge Tower->Hyper we must wrap the tower service
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        let listener = listener.into_async()?;
        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);

            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                let _ = fut.await.map_err(|e| {
                    error!("error serving stats connection: {:?}", e);
                });
            });
        }

        // let in-flight connections finish
        graceful.shutdown().await;

        Ok(())
    }
}

#[derive(Clone)]
struct StatsService {
    config: Arc<serde_json::Value>,
}

impl<H> Service<Request<H>> for StatsService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/stats") => {
                let body = serde_json::json!({
                    "counters": registry().snapshot(),
                    "config": &*self.config,
                });
                let response = match serde_json::to_vec(&body) {
                    Ok(buf) => Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", "application/json")
                        .body(Full::new(Bytes::from(buf)))
                        .unwrap(),
                    Err(err) => Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::new(Bytes::from(format!(
                            "Failed to serialize: {}",
                            err
                        ))))
                        .unwrap(),
                };
                Box::pin(futures::future::ok(response))
            }
            // Return 404 Not Found for other routes
            _ => {
                let response = Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::from_static(b"Not Found")))
                    .unwrap();
                Box::pin(futures::future::ok(response))
            }
        }
    }
}
