//! End-to-end behaviour of the request state machine against scripted origins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};

use edge_pipeline::cache::KeyBuilder;
use edge_pipeline::config::{CacheConfig, DirectorPolicy, PipelineConfig};
use edge_pipeline::error::{BackendError, PipelineError};
use edge_pipeline::pipeline::{Action, Delivery, Pipeline, RequestContext, StageHandlers};
use edge_pipeline::security::{Acl, RateLimiter};

mod common;
use common::{body, director_set, get, response, x_cache, ScriptedOrigin};

fn pipeline(origin: Arc<ScriptedOrigin>, names: &[&str], retries: u32) -> Pipeline {
    Pipeline::builder(director_set(DirectorPolicy::Fallback, names, retries), origin).build()
}

#[tokio::test]
async fn test_miss_then_hit_fetches_once() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, Some("max-age=60"), "hello")));
    let pipeline = pipeline(origin.clone(), &["a"], 0);

    let first = pipeline.handle(get("/page")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body(&first), "hello");
    assert_eq!(x_cache(&first), "MISS");

    let second = pipeline.handle(get("/page")).await;
    assert_eq!(body(&second), "hello");
    assert_eq!(x_cache(&second), "HIT");
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_issue_one_fetch() {
    let origin = ScriptedOrigin::with_delay(Duration::from_millis(200), |_, _, n| {
        Ok(response(200, Some("max-age=60"), format!("v{n}")))
    });
    let pipeline = pipeline(origin.clone(), &["a"], 0);

    let mut handles = Vec::new();
    for _ in 0..25 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.handle(get("/hot")).await }));
    }
    for handle in handles {
        let delivery = handle.await.unwrap();
        assert_eq!(body(&delivery), "v0");
    }
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_object_served_while_one_refresh_runs() {
    let origin = ScriptedOrigin::new(|_, _, n| Ok(response(200, Some("max-age=60"), format!("v{n}"))));
    let cache = CacheConfig {
        default_grace_secs: 3600,
        ..CacheConfig::default()
    };
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .cache_config(cache)
        .build();

    assert_eq!(body(&pipeline.handle(get("/k")).await), "v0");

    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..5 {
        let delivery = pipeline.handle(get("/k")).await;
        assert_eq!(body(&delivery), "v0");
        assert_eq!(x_cache(&delivery), "STALE");
        assert_eq!(delivery.response.headers["age"], "61");
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(origin.calls(), 2);
    let refreshed = pipeline.handle(get("/k")).await;
    assert_eq!(body(&refreshed), "v1");
    assert_eq!(x_cache(&refreshed), "HIT");

    tokio::time::advance(Duration::from_secs(3700)).await;
    let expired = pipeline.handle(get("/k")).await;
    assert_eq!(body(&expired), "v2");
    assert_eq!(x_cache(&expired), "MISS");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stale_if_error_fallback() {
    let origin = ScriptedOrigin::new(|_, _, n| {
        if n == 0 {
            Ok(response(200, Some("max-age=10, stale-if-error=600"), "original"))
        } else {
            Err(BackendError::Connect("127.0.0.1:80".into()))
        }
    });
    let cache = CacheConfig {
        default_grace_secs: 0,
        ..CacheConfig::default()
    };
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .cache_config(cache)
        .build();

    pipeline.handle(get("/sie")).await;
    tokio::time::advance(Duration::from_secs(20)).await;

    let delivery = pipeline.handle(get("/sie")).await;
    assert_eq!(delivery.status(), StatusCode::OK);
    assert_eq!(body(&delivery), "original");
    assert_eq!(x_cache(&delivery), "STALE");

    // Past ttl + sie the failure surfaces.
    tokio::time::advance(Duration::from_secs(600)).await;
    let delivery = pipeline.handle(get("/sie")).await;
    assert_eq!(delivery.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(x_cache(&delivery), "SYNTH");
}

#[tokio::test]
async fn test_server_errors_are_not_cached() {
    let origin = ScriptedOrigin::new(|_, _, n| {
        if n == 0 {
            Ok(response(503, None, "down"))
        } else {
            Ok(response(200, Some("max-age=60"), "up"))
        }
    });
    let pipeline = pipeline(origin.clone(), &["a"], 0);

    assert_eq!(pipeline.handle(get("/x")).await.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body(&pipeline.handle(get("/x")).await), "up");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn test_retry_excludes_failed_backend_for_that_request_only() {
    let origin = ScriptedOrigin::new(|backend, _, _| match backend {
        "a" => Err(BackendError::Connect("a".into())),
        _ => Ok(response(200, Some("max-age=60"), "from b")),
    });
    let pipeline = pipeline(origin.clone(), &["a", "b", "c"], 1);

    let delivery = pipeline.handle(get("/one")).await;
    assert_eq!(body(&delivery), "from b");
    let delivery = pipeline.handle(get("/two")).await;
    assert_eq!(body(&delivery), "from b");

    assert_eq!(origin.backends_contacted(), ["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_retries_exhausted_surface_as_error() {
    let origin = ScriptedOrigin::new(|backend, _, _| Err(BackendError::FirstByteTimeout(backend.to_string())));
    let pipeline = pipeline(origin.clone(), &["a", "b", "c"], 1);

    let delivery = pipeline.handle(get("/slow")).await;
    assert_eq!(delivery.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(origin.calls(), 2);

    let json: serde_json::Value = serde_json::from_slice(&delivery.response.body).unwrap();
    assert_eq!(json["error"]["status"], 504);
}

#[tokio::test]
async fn test_uncacheable_response_becomes_hit_for_pass() {
    let origin = ScriptedOrigin::new(|_, _, _| {
        let mut r = response(200, Some("max-age=60"), "personal");
        r.headers.insert("set-cookie", HeaderValue::from_static("sid=1"));
        Ok(r)
    });
    let pipeline = pipeline(origin.clone(), &["a"], 0);

    assert_eq!(x_cache(&pipeline.handle(get("/me")).await), "MISS");
    assert_eq!(x_cache(&pipeline.handle(get("/me")).await), "PASS");
    assert_eq!(x_cache(&pipeline.handle(get("/me")).await), "PASS");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test]
async fn test_post_is_passed_with_body() {
    let origin = ScriptedOrigin::new(|_, request, _| {
        assert_eq!(request.method, Method::POST);
        Ok(response(200, Some("max-age=60"), String::from_utf8(request.body.to_vec()).unwrap()))
    });
    let pipeline = pipeline(origin.clone(), &["a"], 3);

    for _ in 0..2 {
        let ctx = RequestContext::new(Method::POST, "/submit", HeaderMap::new()).with_body("payload".into());
        let delivery = pipeline.handle(ctx).await;
        assert_eq!(body(&delivery), "payload");
        assert_eq!(x_cache(&delivery), "PASS");
    }
    assert_eq!(origin.calls(), 2);
}

#[derive(Default)]
struct AlwaysRestart {
    receives: AtomicUsize,
    errors: AtomicUsize,
}

impl StageHandlers for AlwaysRestart {
    fn receive(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        Ok(Action::Restart)
    }

    /// Tries to restart again; a spent budget must refuse it.
    fn error(&self, _ctx: &mut RequestContext, _resp: &mut Delivery) -> Result<Action, PipelineError> {
        self.errors.fetch_add(1, Ordering::SeqCst);
        Ok(Action::Restart)
    }
}

#[tokio::test]
async fn test_restart_loop_terminates() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "unused")));
    let handlers = Arc::new(AlwaysRestart::default());
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .handlers(handlers.clone())
        .settings(PipelineConfig {
            max_restarts: 3,
            ..PipelineConfig::default()
        })
        .build();

    let delivery = pipeline.handle(get("/loop")).await;
    assert_eq!(delivery.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(handlers.receives.load(Ordering::SeqCst), 4);
    assert_eq!(handlers.errors.load(Ordering::SeqCst), 1);
    assert_eq!(origin.calls(), 0);
    assert_eq!(x_cache(&delivery), "SYNTH");

    let json: serde_json::Value = serde_json::from_slice(&delivery.response.body).unwrap();
    assert_eq!(json["error"]["reason"], "too many restarts (3)");
}

/// Restarts once from Deliver after tagging the request.
struct RestartOnce;

impl StageHandlers for RestartOnce {
    fn hash(&self, ctx: &RequestContext, key: &mut KeyBuilder) -> Result<Action, PipelineError> {
        key.add(&ctx.url);
        if let Some(variant) = ctx.headers.get("x-variant") {
            key.add(variant.as_bytes());
        }
        Ok(Action::Hash)
    }

    fn deliver(&self, ctx: &mut RequestContext, resp: &mut Delivery) -> Result<Action, PipelineError> {
        if ctx.restarts() == 0 {
            ctx.headers.insert("x-variant", HeaderValue::from_static("b"));
            return Ok(Action::Restart);
        }
        edge_pipeline::pipeline::hooks::builtin::deliver(ctx, resp)
    }
}

#[tokio::test]
async fn test_restart_keeps_request_headers() {
    let origin = ScriptedOrigin::new(|_, request, _| {
        let variant = request
            .headers
            .get("x-variant")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_else(|| "a".to_string());
        Ok(response(200, Some("max-age=60"), variant))
    });
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .handlers(Arc::new(RestartOnce))
        .build();

    let delivery = pipeline.handle(get("/variant")).await;
    assert_eq!(body(&delivery), "b");
    assert_eq!(origin.calls(), 2);
}

struct BadMiss;

impl StageHandlers for BadMiss {
    fn miss(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        Ok(Action::Hash)
    }
}

#[tokio::test]
async fn test_disallowed_action_is_a_500() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "unused")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .handlers(Arc::new(BadMiss))
        .build();

    let delivery = pipeline.handle(get("/bad")).await;
    assert_eq!(delivery.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(origin.calls(), 0);
}

struct BrokenErrorStage;

impl StageHandlers for BrokenErrorStage {
    fn receive(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        Err(PipelineError::client(StatusCode::BAD_REQUEST, "malformed"))
    }

    fn error(&self, _ctx: &mut RequestContext, _resp: &mut Delivery) -> Result<Action, PipelineError> {
        Err(PipelineError::Handler("template missing".into()))
    }
}

#[tokio::test]
async fn test_fault_inside_error_stage_yields_generic_500() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "unused")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin)
        .handlers(Arc::new(BrokenErrorStage))
        .build();

    let delivery = pipeline.handle(get("/")).await;
    assert_eq!(delivery.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_slice(&delivery.response.body).unwrap();
    assert_eq!(json["error"]["reason"], "internal error");
}

#[tokio::test]
async fn test_client_error_from_receive() {
    struct Reject;
    impl StageHandlers for Reject {
        fn receive(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
            Err(PipelineError::client(StatusCode::BAD_REQUEST, "malformed"))
        }
    }
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "unused")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin)
        .handlers(Arc::new(Reject))
        .build();

    let delivery = pipeline.handle(get("/")).await;
    assert_eq!(delivery.status(), StatusCode::BAD_REQUEST);
    assert_eq!(delivery.response.headers["content-type"], "application/json");
}

#[tokio::test]
async fn test_rate_limited_client_gets_429() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, Some("max-age=60"), "ok")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .rate_limiter(RateLimiter::new(2, 0.5), None)
        .build();

    assert_eq!(pipeline.handle(get("/")).await.status(), StatusCode::OK);
    assert_eq!(pipeline.handle(get("/")).await.status(), StatusCode::OK);

    let limited = pipeline.handle(get("/")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.response.headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=2).contains(&retry_after));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test]
async fn test_denied_client_gets_403() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "ok")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .acl(Acl::parse(&["192.0.2.0/24"]).unwrap())
        .build();

    let delivery = pipeline.handle(get("/")).await;
    assert_eq!(delivery.status(), StatusCode::FORBIDDEN);
    assert_eq!(origin.calls(), 0);
}

/// Error handler that always asks for another pass through Receive.
struct RestartFromError;

impl StageHandlers for RestartFromError {
    fn error(&self, _ctx: &mut RequestContext, _resp: &mut Delivery) -> Result<Action, PipelineError> {
        Ok(Action::Restart)
    }
}

#[tokio::test]
async fn test_denied_client_cannot_restart_past_acl() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, Some("max-age=60"), "secret")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin.clone())
        .acl(Acl::parse(&["192.0.2.0/24"]).unwrap())
        .handlers(Arc::new(RestartFromError))
        .build();

    let delivery = pipeline.handle(get("/")).await;
    assert_eq!(delivery.status(), StatusCode::FORBIDDEN);
    assert_ne!(body(&delivery), "secret");
    assert_eq!(origin.calls(), 0);
}

#[tokio::test]
async fn test_rate_limited_retry_after_is_capped() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, Some("max-age=60"), "ok")));
    let pipeline = Pipeline::builder(director_set(DirectorPolicy::Fallback, &["a"], 0), origin)
        .rate_limiter(RateLimiter::new(1, 1e-300), None)
        .build();

    assert_eq!(pipeline.handle(get("/")).await.status(), StatusCode::OK);
    let limited = pipeline.handle(get("/")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.response.headers["retry-after"], "86400");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_private_response_not_shared_with_collapsed_requests() {
    let origin = ScriptedOrigin::with_delay(Duration::from_millis(200), |_, _, n| {
        let mut r = response(200, Some("max-age=60"), format!("private-{n}"));
        r.headers
            .insert("set-cookie", HeaderValue::from_str(&format!("sid=user{n}")).unwrap());
        Ok(r)
    });
    let pipeline = pipeline(origin.clone(), &["a"], 0);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.handle(get("/me")).await }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let delivery = handle.await.unwrap();
        let cookie = delivery.response.headers["set-cookie"].to_str().unwrap().to_string();
        let body = body(&delivery);
        assert_eq!(cookie, format!("sid=user{}", body.trim_start_matches("private-")));
        bodies.push(body);
    }
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 5, "every request saw its own response");
    assert_eq!(origin.calls(), 5);
}

#[tokio::test]
async fn test_unhealthy_director_fails_closed() {
    let origin = ScriptedOrigin::new(|_, _, _| Ok(response(200, None, "ok")));
    let directors = director_set(DirectorPolicy::Fallback, &["a", "b"], 0);
    for backend in directors.all_backends() {
        backend.set_healthy(false);
    }
    let pipeline = Pipeline::builder(directors, origin.clone()).build();

    let delivery = pipeline.handle(get("/")).await;
    assert_eq!(delivery.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(origin.calls(), 0);
}
