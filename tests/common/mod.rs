//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use edge_pipeline::cache::CachedResponse;
use edge_pipeline::config::DirectorPolicy;
use edge_pipeline::director::{Backend, Director, DirectorSet, Member};
use edge_pipeline::error::BackendError;
use edge_pipeline::origin::{BackendRequest, OriginFetch};
use edge_pipeline::pipeline::RequestContext;

type Script = dyn Fn(&str, &BackendRequest, usize) -> Result<CachedResponse, BackendError> + Send + Sync;

/// In-process origin driven by a closure `(backend, request, call#) -> result`.
pub struct ScriptedOrigin {
    script: Box<Script>,
    delay: Duration,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ScriptedOrigin {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, &BackendRequest, usize) -> Result<CachedResponse, BackendError> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, script)
    }

    pub fn with_delay<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(&str, &BackendRequest, usize) -> Result<CachedResponse, BackendError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Backend names in the order they were contacted.
    pub fn backends_contacted(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl OriginFetch for ScriptedOrigin {
    fn fetch<'a>(
        &'a self,
        backend: &'a Backend,
        request: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<CachedResponse, BackendError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(backend.name.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(&backend.name, request, call)
        })
    }
}

/// 200 response with an optional Cache-Control header.
pub fn response(status: u16, cache_control: Option<&'static str>, body: impl Into<String>) -> CachedResponse {
    let mut headers = HeaderMap::new();
    if let Some(cc) = cache_control {
        headers.insert("cache-control", HeaderValue::from_static(cc));
    }
    CachedResponse::new(StatusCode::from_u16(status).unwrap(), headers, body.into())
}

/// One director named `web` over backends named after `names`.
pub fn director_set(policy: DirectorPolicy, names: &[&str], retries: u32) -> Arc<DirectorSet> {
    let mut set = DirectorSet::default();
    let members = names
        .iter()
        .map(|name| {
            let backend = Arc::new(Backend::new(*name, "127.0.0.1", 80));
            set.add_backend(backend.clone());
            Member::new(backend)
        })
        .collect();
    set.add_director(Arc::new(Director::new("web", policy, members, 256, 0).with_retries(retries)));
    Arc::new(set)
}

pub fn get(url: &str) -> RequestContext {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("example.com"));
    RequestContext::new(Method::GET, url, headers).with_client_ip("192.0.2.10".parse().unwrap())
}

pub fn body(delivery: &edge_pipeline::pipeline::Delivery) -> String {
    String::from_utf8(delivery.response.body.to_vec()).unwrap()
}

pub fn x_cache(delivery: &edge_pipeline::pipeline::Delivery) -> String {
    delivery.response.headers["x-cache"].to_str().unwrap().to_string()
}

/// Raw TCP origin answering every connection with a fixed response.
pub struct MockOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a mock origin on an ephemeral port.
pub async fn start_mock_origin(status_line: &'static str, extra_headers: &'static str, body: &'static str) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = socket.read(&mut buf).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
                            status_line,
                            body.len(),
                            extra_headers,
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockOrigin { addr, hits }
}
