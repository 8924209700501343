//! HTTP/1.1 origin client.
//!
//! # Responsibilities
//! - Keep one pooled client per backend (connect timeout is per backend)
//! - Enforce first-byte and between-bytes timeouts
//! - Buffer the response body into a `CachedResponse`

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, Request};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time;

use crate::cache::CachedResponse;
use crate::director::Backend;
use crate::error::BackendError;
use crate::origin::{BackendRequest, OriginFetch};

/// Headers that only describe one hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Origin fetcher backed by hyper-util's pooled client.
#[derive(Default)]
pub struct HttpOrigin {
    clients: DashMap<String, Client<HttpConnector, Body>>,
}

impl HttpOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, backend: &Backend) -> Client<HttpConnector, Body> {
        self.clients
            .entry(backend.name.clone())
            .or_insert_with(|| {
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(Some(backend.timeouts.connect));
                connector.set_nodelay(true);
                Client::builder(TokioExecutor::new()).build(connector)
            })
            .clone()
    }

    async fn fetch_inner(&self, backend: &Backend, request: &BackendRequest) -> Result<CachedResponse, BackendError> {
        let url = backend
            .url_for(&request.path)
            .map_err(|e| BackendError::Transport(format!("invalid path {}: {e}", request.path)))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(url.as_str());
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers.clone();
            strip_hop_by_hop(headers);
        }
        let outbound = builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let client = self.client_for(backend);
        let response = match time::timeout(backend.timeouts.first_byte, client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_connect() => {
                tracing::debug!(backend = %backend.name, error = %e, "Origin connect failed");
                return Err(BackendError::Connect(backend.authority()));
            }
            Ok(Err(e)) => return Err(BackendError::Transport(e.to_string())),
            Err(_) => return Err(BackendError::FirstByteTimeout(backend.name.clone())),
        };

        let (parts, incoming) = response.into_parts();
        let body = read_body(Body::new(incoming), backend.timeouts.between_bytes, &backend.name).await?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // Body is buffered; the front-end recomputes the length.
        headers.remove(header::CONTENT_LENGTH);

        Ok(CachedResponse::new(parts.status, headers, body))
    }
}

impl OriginFetch for HttpOrigin {
    fn fetch<'a>(
        &'a self,
        backend: &'a Backend,
        request: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<CachedResponse, BackendError>> {
        Box::pin(self.fetch_inner(backend, request))
    }
}

async fn read_body(body: Body, between_bytes: Duration, backend: &str) -> Result<Bytes, BackendError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    loop {
        match time::timeout(between_bytes, stream.next()).await {
            Ok(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
            Ok(Some(Err(e))) => return Err(BackendError::Transport(e.to_string())),
            Ok(None) => return Ok(Bytes::from(buf)),
            Err(_) => return Err(BackendError::BetweenBytesTimeout(backend.to_string())),
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}
