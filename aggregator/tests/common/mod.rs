//! Fixtures shared by the integration tests: index files on disk and a
//! throwaway HTTP server standing in for remote archives.

#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Reply {
    pub delay: Option<Duration>,
    pub response: Response<Body>,
}

impl Reply {
    pub fn ok(body: impl Into<Body>) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: impl Into<Body>) -> Self {
        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        Self { delay: None, response }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = hyper::header::HeaderValue::from_str(value) {
            self.response.headers_mut().append(name, value);
        }
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Start a server on an ephemeral local port and return its address.
pub async fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&Request<Body>) -> Reply + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let make_svc = make_service_fn(move |_| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let handler = handler.clone();
                async move {
                    let reply = handler(&req);
                    if let Some(delay) = reply.delay {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, Infallible>(reply.response)
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// A CDXJ line for `http://example.com{path}`.
pub fn cdxj(path: &str, timestamp: &str, body: &str) -> String {
    let mut fields = format!("\"url\": \"http://example.com{}\"", path);
    if !body.is_empty() {
        fields.push_str(", ");
        fields.push_str(body);
    }
    format!("com,example){} {} {{{}}}", path, timestamp, fields)
}

/// Write sorted index lines to `dir/name`.
pub fn write_index(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let mut sorted = lines.to_vec();
    sorted.sort();
    let path = dir.join(name);
    std::fs::write(&path, sorted.join("\n") + "\n").unwrap();
    path
}
