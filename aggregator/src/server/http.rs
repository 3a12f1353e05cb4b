//! HTTP server: capture-index queries plus health checks and metrics
//!
//! * `/cdx?url=...` runs a query; `output=cdxj|json|link` picks the format.
//!   Per-source failures travel as a JSON object in `X-Cdxfed-Errors`.
//! * `/sources` lists the configured source tree.
//! * `/healthz`, `/readyz`, `/metrics` for operations.

use crate::aggregate::Aggregator;
use crate::audit;
use crate::metrics;
use crate::source::SourceResult;
use cdxfed_shared::{ErrorMap, IndexError, IndexQuery, OutputFormat};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode, Uri};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ERRORS_HEADER: &str = "X-Cdxfed-Errors";

/// Serve queries and admin endpoints until the server fails.
pub async fn serve(addr: SocketAddr, aggregator: Arc<Aggregator>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let aggregator = aggregator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let aggregator = aggregator.clone();
                async move { handle(req, &aggregator).await }
            }))
        }
    });

    tracing::info!("HTTP server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: String) -> Response<Body> {
    let mut response = text(status, body);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn with_errors(mut response: Response<Body>, errors: &ErrorMap) -> Response<Body> {
    if errors.is_empty() {
        return response;
    }
    let encoded = serde_json::to_string(errors).unwrap_or_default();
    match hyper::header::HeaderValue::from_str(&encoded) {
        Ok(value) => {
            response.headers_mut().insert(ERRORS_HEADER, value);
        }
        Err(e) => warn!(error = %e, "error map not representable as a header"),
    }
    response
}

/// Decoded `key=value` pairs of the request's query string.
fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };
    match reqwest::Url::parse(&format!("http://localhost/?{}", query)) {
        Ok(url) => url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub async fn handle(req: Request<Body>, aggregator: &Aggregator) -> Result<Response<Body>, Infallible> {
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let response = match path.as_str() {
        "/healthz" => text(StatusCode::OK, "ok\n"),

        "/readyz" => {
            if aggregator.is_empty() {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready: no sources configured\n")
            } else {
                text(StatusCode::OK, "ready\n")
            }
        }

        "/metrics" => {
            let mut response = text(StatusCode::OK, metrics::encode_metrics());
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }

        "/sources" => {
            let body = serde_json::to_string_pretty(&aggregator.sources()).unwrap_or_default();
            json(StatusCode::OK, body)
        }

        "/cdx" => handle_cdx(&uri, aggregator).await,

        _ => text(StatusCode::NOT_FOUND, "not found\n"),
    };

    if path != "/cdx" {
        audit::admin_http_request(&path, response.status().as_u16());
    }
    Ok(response)
}

async fn handle_cdx(uri: &Uri, aggregator: &Aggregator) -> Response<Body> {
    let pairs = query_pairs(uri);
    let format = match pairs.iter().find(|(k, _)| k == "output") {
        Some((_, v)) => match v.parse::<OutputFormat>() {
            Ok(format) => format,
            Err(e) => return error_response(e),
        },
        None => OutputFormat::default(),
    };
    let query = match IndexQuery::from_params(&pairs) {
        Ok(query) => query,
        Err(e) => return error_response(e),
    };

    if query.show_num_pages {
        return match aggregator.num_pages(&query).await {
            Ok(count) => json(
                StatusCode::OK,
                serde_json::to_string(&count).unwrap_or_default(),
            ),
            Err(e) => error_response(e),
        };
    }

    let SourceResult { records, errors } = match aggregator.search(&query).await {
        Ok(result) => result,
        Err(e) => return error_response(e),
    };

    // Sources may read files lazily while the stream is consumed
    let rendered = tokio::task::spawn_blocking(move || {
        let mut count = 0usize;
        let body = format.render_all(records.inspect(|_| count += 1));
        (body, count)
    })
    .await;
    let (body, count) = match rendered {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!(error = %e, "rendering failed");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "rendering failed\n");
        }
    };
    debug!(url = %query.url, records = count, errors = errors.len(), "query answered");

    let status = if count == 0 {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    let mut response = text(status, body);
    if let Ok(value) = hyper::header::HeaderValue::from_str(format.content_type()) {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    with_errors(response, &errors)
}

fn error_response(error: IndexError) -> Response<Body> {
    match error {
        IndexError::BadQuery(_) => text(StatusCode::BAD_REQUEST, format!("{}\n", error)),
        IndexError::AllSourcesFailed(errors) => {
            let response = text(StatusCode::SERVICE_UNAVAILABLE, "all sources failed\n");
            with_errors(response, &errors)
        }
        IndexError::NotFound(_) => text(StatusCode::NOT_FOUND, format!("{}\n", error)),
        IndexError::AccessDenied(_) => text(StatusCode::FORBIDDEN, format!("{}\n", error)),
        other => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", other)),
    }
}
