//! The request state machine.
//!
//! # Responsibilities
//! - Drive a request from Receive to Log through the stage handlers
//! - Reject actions outside a stage's allowed set
//! - Bound restarts; the loop always terminates
//! - Talk to the cache engine, the directors and the origin
//!
//! # Design Decisions
//! - Control flow is a `Step` value consumed by one loop, never recursion
//! - Once a request is terminal (restart budget spent, denied by the ACL, rate
//!   limited, fault in Error) no handler can send it back to Receive
//! - Cache fetches run on the engine's shared task; pass fetches run inline

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use tokio::time::Instant;

use crate::cache::{
    policy, Admission, CacheEngine, CacheEntry, CacheKey, CachedResponse, Diversion, FetchedObject, FlightResult,
    Freshness, KeyBuilder, Lookup,
};
use crate::config::validation::ValidationError;
use crate::config::{CacheConfig, ConfigError, EdgeConfig, PipelineConfig};
use crate::director::hash::hash64;
use crate::director::{DirectorSet, SelectContext};
use crate::error::{BackendError, PipelineError};
use crate::observability::metrics;
use crate::origin::{BackendRequest, OriginFetch};
use crate::pipeline::context::{BackendResponse, CacheStatus, Delivery, RequestContext};
use crate::pipeline::hooks::{BuiltinHandlers, StageHandlers};
use crate::pipeline::state::{Action, Stage};
use crate::pipeline::synthetic::{JsonSynthesizer, Synthesizer};
use crate::resilience::RetryPolicy;
use crate::security::{Acl, RateLimiter};

/// Where the loop goes next, with the data that stage needs.
enum Step {
    Receive,
    Hash,
    Lookup,
    Hit(Arc<CacheEntry>),
    /// Carries an expired entry that may back a stale-if-error fallback.
    Miss(Option<Arc<CacheEntry>>),
    Pass,
    Fetch(Option<Arc<CacheEntry>>),
    Error {
        status: StatusCode,
        reason: String,
        stale: Option<Arc<CacheEntry>>,
    },
    Deliver(Delivery),
    Log(Delivery),
}

impl Step {
    fn error(status: StatusCode, stale: Option<Arc<CacheEntry>>) -> Self {
        Step::Error {
            status,
            reason: status.canonical_reason().unwrap_or("error").to_string(),
            stale,
        }
    }

    fn fault(err: PipelineError, stale: Option<Arc<CacheEntry>>) -> Self {
        Step::Error {
            status: err.status(),
            reason: err.to_string(),
            stale,
        }
    }
}

struct Shared {
    handlers: Arc<dyn StageHandlers>,
    synthesizer: Arc<dyn Synthesizer>,
    directors: Arc<DirectorSet>,
    origin: Arc<dyn OriginFetch>,
    engine: CacheEngine,
    limiter: Option<RateLimiter>,
    rate_key_header: Option<String>,
    acl: Acl,
    cache: CacheConfig,
    settings: PipelineConfig,
}

/// Request pipeline. Cheap to clone; every clone shares the same cache.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    directors: Arc<DirectorSet>,
    origin: Arc<dyn OriginFetch>,
    handlers: Arc<dyn StageHandlers>,
    synthesizer: Arc<dyn Synthesizer>,
    engine: Option<CacheEngine>,
    limiter: Option<RateLimiter>,
    rate_key_header: Option<String>,
    acl: Acl,
    cache: CacheConfig,
    settings: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(directors: Arc<DirectorSet>, origin: Arc<dyn OriginFetch>) -> Self {
        Self {
            directors,
            origin,
            handlers: Arc::new(BuiltinHandlers),
            synthesizer: Arc::new(JsonSynthesizer),
            engine: None,
            limiter: None,
            rate_key_header: None,
            acl: Acl::default(),
            cache: CacheConfig::default(),
            settings: PipelineConfig::default(),
        }
    }

    pub fn handlers(mut self, handlers: Arc<dyn StageHandlers>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Share an existing engine instead of creating one from the cache config.
    pub fn engine(mut self, engine: CacheEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter, key_header: Option<String>) -> Self {
        self.limiter = Some(limiter);
        self.rate_key_header = key_header;
        self
    }

    pub fn acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn settings(mut self, settings: PipelineConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Pipeline {
        let engine = self.engine.unwrap_or_else(|| CacheEngine::new(&self.cache));
        Pipeline {
            shared: Arc::new(Shared {
                handlers: self.handlers,
                synthesizer: self.synthesizer,
                directors: self.directors,
                origin: self.origin,
                engine,
                limiter: self.limiter,
                rate_key_header: self.rate_key_header,
                acl: self.acl,
                cache: self.cache,
                settings: self.settings,
            }),
        }
    }
}

impl Pipeline {
    pub fn builder(directors: Arc<DirectorSet>, origin: Arc<dyn OriginFetch>) -> PipelineBuilder {
        PipelineBuilder::new(directors, origin)
    }

    /// Builder preloaded with every section of a validated configuration.
    pub fn from_config(
        config: &EdgeConfig,
        directors: Arc<DirectorSet>,
        origin: Arc<dyn OriginFetch>,
    ) -> Result<PipelineBuilder, ConfigError> {
        let acl = Acl::parse(config.acl.deny.as_slice())
            .map_err(|e| ConfigError::Validation(vec![ValidationError::InvalidAcl(e.to_string())]))?;

        let mut builder = PipelineBuilder::new(directors, origin)
            .acl(acl)
            .cache_config(config.cache.clone())
            .settings(config.pipeline.clone());
        if config.rate_limit.enabled {
            builder = builder.rate_limiter(
                RateLimiter::from_config(&config.rate_limit),
                config.rate_limit.key_header.clone(),
            );
        }
        Ok(builder)
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.shared.engine
    }

    /// Run one request through every stage and return what the client gets.
    pub async fn handle(&self, mut ctx: RequestContext) -> Delivery {
        let handlers = self.shared.handlers.clone();
        // Terminal requests can no longer restart.
        let mut terminal = false;
        // Set once the Error stage ran since the last restart.
        let mut errored = false;

        let mut step = match self.screen(&ctx) {
            Some(rejection) => {
                terminal = true;
                rejection
            }
            None => Step::Receive,
        };

        loop {
            step = match step {
                Step::Receive => {
                    let result = handlers.receive(&mut ctx);
                    match self.decide(&ctx, Stage::Receive, result) {
                        Ok(Action::Hash) => Step::Hash,
                        Ok(Action::Pass) => Step::Pass,
                        Ok(Action::Error(status)) => Step::error(status, None),
                        Ok(Action::Restart) => self.restart(&mut ctx, &mut terminal, &mut errored),
                        Ok(other) => self.invalid(Stage::Receive, other),
                        Err(step) => step,
                    }
                }

                Step::Hash => {
                    let mut key = KeyBuilder::new();
                    match self.decide(&ctx, Stage::Hash, handlers.hash(&ctx, &mut key)) {
                        Ok(Action::Hash) => {
                            ctx.key = Some(key.finish());
                            Step::Lookup
                        }
                        Ok(other) => self.invalid(Stage::Hash, other),
                        Err(step) => step,
                    }
                }

                Step::Lookup => match ctx.key {
                    Some(key) => match self.shared.engine.lookup(&key) {
                        Lookup::Hit(entry) => Step::Hit(entry),
                        Lookup::Miss(expired) => Step::Miss(expired),
                        Lookup::HitForPass => Step::Pass,
                    },
                    None => Step::fault(PipelineError::Cache("lookup without a cache key".into()), None),
                },

                Step::Hit(entry) => {
                    let result = handlers.hit(&mut ctx, &entry);
                    match self.decide(&ctx, Stage::Hit, result) {
                        Ok(Action::Deliver) => self.deliver_hit(&ctx, &entry),
                        Ok(Action::Pass) => Step::Pass,
                        Ok(Action::Restart) => self.restart(&mut ctx, &mut terminal, &mut errored),
                        Ok(Action::Error(status)) => Step::error(status, None),
                        Ok(other) => self.invalid(Stage::Hit, other),
                        Err(step) => step,
                    }
                }

                Step::Miss(expired) => {
                    let result = handlers.miss(&mut ctx);
                    match self.decide(&ctx, Stage::Miss, result) {
                        Ok(Action::Fetch) => Step::Fetch(expired),
                        Ok(Action::Pass) => Step::Pass,
                        Ok(Action::Error(status)) => Step::error(status, expired),
                        Ok(Action::DeliverStale) => self.deliver_stale(expired),
                        Ok(other) => self.invalid(Stage::Miss, other),
                        Err(step) => step,
                    }
                }

                Step::Fetch(expired) => {
                    let result = self.collapsed_fetch(&ctx).await;
                    self.complete_fetch(&mut ctx, result, expired, CacheStatus::Miss, &mut terminal, &mut errored)
                }

                Step::Pass => {
                    let result = handlers.pass(&mut ctx);
                    match self.decide(&ctx, Stage::Pass, result) {
                        Ok(Action::Pass) => {
                            let request = ctx.backend_request(false);
                            let result = self.shared.fetch_and_handle(&ctx, &request).await;
                            self.complete_fetch(&mut ctx, result, None, CacheStatus::Pass, &mut terminal, &mut errored)
                        }
                        Ok(Action::Error(status)) => Step::error(status, None),
                        Ok(other) => self.invalid(Stage::Pass, other),
                        Err(step) => step,
                    }
                }

                Step::Error { status, reason, stale } => {
                    errored = true;
                    tracing::debug!(request_id = %ctx.id, %status, %reason, "Entering error stage");
                    let response = self.shared.synthesizer.synthesize(status, &reason, &ctx.id);
                    let mut delivery = Delivery::new(response, CacheStatus::Synth);
                    let result = handlers.error(&mut ctx, &mut delivery);
                    match self.decide(&ctx, Stage::Error, result) {
                        Ok(Action::Deliver) => Step::Deliver(delivery),
                        Ok(Action::Restart) if !terminal => self.restart(&mut ctx, &mut terminal, &mut errored),
                        Ok(Action::Restart) => {
                            tracing::warn!(request_id = %ctx.id, %status, "Restart refused for terminal error");
                            Step::Deliver(delivery)
                        }
                        Ok(Action::DeliverStale) => match stale {
                            Some(entry) => Step::Deliver(stale_delivery(&entry)),
                            None => Step::Deliver(delivery),
                        },
                        // A fault inside Error is not recoverable.
                        Ok(_) | Err(_) => {
                            terminal = true;
                            tracing::error!(request_id = %ctx.id, "Error stage failed, sending generic 500");
                            Step::Deliver(self.generic_error(&ctx))
                        }
                    }
                }

                Step::Deliver(mut delivery) => {
                    let result = handlers.deliver(&mut ctx, &mut delivery);
                    match self.decide(&ctx, Stage::Deliver, result) {
                        Ok(Action::Restart) if !terminal => self.restart(&mut ctx, &mut terminal, &mut errored),
                        Ok(Action::Restart) => {
                            tracing::warn!(request_id = %ctx.id, "Restart refused for terminal response");
                            Step::Log(delivery)
                        }
                        Ok(_) => Step::Log(delivery),
                        Err(_) if terminal || errored => Step::Log(delivery),
                        Err(step) => step,
                    }
                }

                Step::Log(delivery) => {
                    let result = handlers.log(&ctx, &delivery);
                    if let Err(Step::Error { reason, .. }) = self.decide(&ctx, Stage::Log, result) {
                        tracing::warn!(request_id = %ctx.id, %reason, "Log handler failed");
                    }
                    self.log(&ctx, &delivery);
                    return delivery;
                }
            };
        }
    }

    /// ACL and rate limit, checked once on first entry.
    fn screen(&self, ctx: &RequestContext) -> Option<Step> {
        if let Some(ip) = ctx.client_ip {
            if self.shared.acl.contains(ip) {
                tracing::info!(request_id = %ctx.id, client = %ip, "Client denied by ACL");
                let err = PipelineError::client(StatusCode::FORBIDDEN, "client address denied");
                return Some(Step::fault(err, None));
            }
        }

        let limiter = self.shared.limiter.as_ref()?;
        let identity = ctx.client_identity(self.shared.rate_key_header.as_deref());
        if limiter.consume(&identity, 1) {
            return None;
        }

        let retry_after = limiter.retry_after(&identity, 1);
        metrics::record_rate_limited();
        tracing::info!(request_id = %ctx.id, client = %identity, ?retry_after, "Rate limit exceeded");

        let err = PipelineError::RateLimited { retry_after };
        let mut response = self.shared.synthesizer.synthesize(err.status(), &err.to_string(), &ctx.id);
        response
            .headers
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        Some(Step::Deliver(Delivery::new(response, CacheStatus::Synth)))
    }

    /// Enforce the allowed-action table. Faults become an Error step.
    fn decide(&self, ctx: &RequestContext, stage: Stage, result: Result<Action, PipelineError>) -> Result<Action, Step> {
        match result {
            Ok(action) if stage.allows(&action) => {
                tracing::trace!(request_id = %ctx.id, %stage, %action, "Stage decided");
                Ok(action)
            }
            Ok(action) => {
                tracing::error!(request_id = %ctx.id, %stage, %action, "Handler returned an action not allowed here");
                Err(self.invalid(stage, action))
            }
            Err(err) => {
                tracing::warn!(request_id = %ctx.id, %stage, error = %err, "Stage handler failed");
                Err(Step::fault(err, None))
            }
        }
    }

    fn invalid(&self, stage: Stage, action: Action) -> Step {
        Step::fault(
            PipelineError::InvalidAction {
                stage: stage.as_str(),
                action: action.to_string(),
            },
            None,
        )
    }

    fn restart(&self, ctx: &mut RequestContext, terminal: &mut bool, errored: &mut bool) -> Step {
        let restarts = ctx.record_restart();
        *errored = false;
        if restarts > self.shared.settings.max_restarts {
            *terminal = true;
            tracing::warn!(request_id = %ctx.id, restarts, "Restart budget exhausted");
            return Step::fault(PipelineError::TooManyRestarts(restarts - 1), None);
        }
        metrics::record_restart();
        tracing::debug!(request_id = %ctx.id, restarts, "Restarting request");
        Step::Receive
    }

    fn generic_error(&self, ctx: &RequestContext) -> Delivery {
        let response = self
            .shared
            .synthesizer
            .synthesize(StatusCode::INTERNAL_SERVER_ERROR, "internal error", &ctx.id);
        Delivery::new(response, CacheStatus::Synth)
    }

    fn deliver_hit(&self, ctx: &RequestContext, entry: &Arc<CacheEntry>) -> Step {
        let now = Instant::now();
        let status = if entry.freshness(now) == Freshness::Stale {
            self.revalidate(ctx, entry.key);
            CacheStatus::Stale
        } else {
            CacheStatus::Hit
        };
        Step::Deliver(Delivery::new(entry.response.clone(), status).with_age(entry.age(now)))
    }

    fn deliver_stale(&self, expired: Option<Arc<CacheEntry>>) -> Step {
        match expired {
            Some(entry) => Step::Deliver(stale_delivery(&entry)),
            None => Step::error(StatusCode::SERVICE_UNAVAILABLE, None),
        }
    }

    /// Start a background refresh unless one is running.
    fn revalidate(&self, ctx: &RequestContext, key: CacheKey) {
        let shared = self.shared.clone();
        let mut snapshot = ctx.clone();
        snapshot.key = Some(key);
        self.shared.engine.revalidate(&key, move || async move {
            let request = snapshot.backend_request(true);
            let result = shared.fetch_and_handle(&snapshot, &request).await;
            if let FlightResult::Failed(ref err) = result {
                tracing::warn!(key = ?key, error = %err, "Background revalidation failed");
            }
            result
        });
    }

    /// Fetch through the engine's shared flight for the request's key.
    async fn collapsed_fetch(&self, ctx: &RequestContext) -> FlightResult {
        let Some(key) = ctx.key else {
            return FlightResult::Failed(BackendError::Transport("fetch without a cache key".into()));
        };
        let shared = self.shared.clone();
        let snapshot = ctx.clone();
        self.shared
            .engine
            .fetch(&key, move || async move {
                let request = snapshot.backend_request(true);
                shared.fetch_and_handle(&snapshot, &request).await
            })
            .await
    }

    /// Route the outcome of a Fetch (cache or pass) to the next step.
    fn complete_fetch(
        &self,
        ctx: &mut RequestContext,
        result: FlightResult,
        expired: Option<Arc<CacheEntry>>,
        cache_status: CacheStatus,
        terminal: &mut bool,
        errored: &mut bool,
    ) -> Step {
        let now = Instant::now();
        let fallback = expired.filter(|entry| entry.within_stale_if_error(now));

        match result {
            FlightResult::Object(object) => {
                ctx.backend = Some(object.backend.clone());
                match fallback {
                    Some(entry) if object.response.status.is_server_error() => {
                        tracing::info!(request_id = %ctx.id, status = %object.response.status, "Origin error, serving stale-if-error copy");
                        Step::Deliver(stale_delivery(&entry))
                    }
                    _ => Step::Deliver(Delivery::new(object.response.clone(), cache_status)),
                }
            }
            FlightResult::Failed(err) => match fallback {
                Some(entry) => {
                    tracing::info!(request_id = %ctx.id, error = %err, "Fetch failed, serving stale-if-error copy");
                    Step::Deliver(stale_delivery(&entry))
                }
                None => Step::fault(PipelineError::Backend(err), None),
            },
            FlightResult::Diverted(Diversion::Restart) => self.restart(ctx, terminal, errored),
            FlightResult::Diverted(Diversion::Error(status)) => Step::error(status, fallback),
            FlightResult::Diverted(Diversion::DeliverStale) => self.deliver_stale(fallback),
            FlightResult::Diverted(Diversion::Pass) => Step::Pass,
        }
    }

    fn log(&self, ctx: &RequestContext, delivery: &Delivery) {
        let status = delivery.status().as_u16();
        tracing::info!(
            request_id = %ctx.id,
            method = %ctx.method,
            url = %ctx.url,
            status,
            cache = delivery.cache_status.as_str(),
            backend = ctx.backend.as_deref().unwrap_or("-"),
            restarts = ctx.restarts(),
            elapsed_ms = millis(ctx.started.elapsed()),
            "Request completed"
        );
        metrics::record_request(ctx.method.as_str(), status, delivery.cache_status.label(), ctx.started);
    }
}

impl Shared {
    /// Fetch from the request's director with retries, then run the Fetch handler.
    async fn fetch_and_handle(&self, ctx: &RequestContext, request: &BackendRequest) -> FlightResult {
        let (backend, response) = match self.fetch_from_director(ctx, request).await {
            Ok(fetched) => fetched,
            Err(err) => return FlightResult::Failed(err),
        };

        let (storage, cacheable) = policy::from_response(response.status, &response.headers, &self.cache);
        let mut beresp = BackendResponse {
            response,
            policy: storage,
            cacheable,
            hit_for_pass_ttl: Duration::from_secs(self.cache.hit_for_pass_secs),
            backend,
        };

        let action = match self.handlers.fetch(ctx, &mut beresp) {
            Ok(action) if Stage::Fetch.allows(&action) => action,
            Ok(action) => {
                tracing::error!(request_id = %ctx.id, %action, "Fetch handler returned an action not allowed here");
                return FlightResult::Diverted(Diversion::Error(StatusCode::INTERNAL_SERVER_ERROR));
            }
            Err(err) => {
                tracing::warn!(request_id = %ctx.id, error = %err, "Fetch handler failed");
                return FlightResult::Diverted(Diversion::Error(err.status()));
            }
        };

        let admission = match action {
            Action::Deliver if beresp.cacheable => Admission::Cache(beresp.policy),
            Action::Deliver | Action::Pass => Admission::Uncacheable,
            Action::HitForPass => Admission::HitForPass(beresp.hit_for_pass_ttl),
            Action::Restart => return FlightResult::Diverted(Diversion::Restart),
            Action::Error(status) => return FlightResult::Diverted(Diversion::Error(status)),
            Action::DeliverStale => return FlightResult::Diverted(Diversion::DeliverStale),
            Action::Hash | Action::Fetch => {
                return FlightResult::Diverted(Diversion::Error(StatusCode::INTERNAL_SERVER_ERROR))
            }
        };

        FlightResult::Object(Arc::new(FetchedObject {
            response: beresp.response,
            admission,
            backend: beresp.backend,
        }))
    }

    /// Select, fetch, and retry on a different backend while attempts remain.
    async fn fetch_from_director(
        &self,
        ctx: &RequestContext,
        request: &BackendRequest,
    ) -> Result<(String, CachedResponse), BackendError> {
        let director_name = ctx.director.as_deref();
        let director = self.directors.get(director_name).ok_or_else(|| {
            BackendError::NoHealthyBackend(director_name.unwrap_or("default").to_string())
        })?;

        let retry = RetryPolicy::for_request(&request.method, director.retries(), &self.settings);
        let key_hash = ctx
            .key
            .map(|key| key.as_u64())
            .unwrap_or_else(|| hash64(ctx.url.as_bytes()));
        let client_hash = hash64(ctx.client_identity(self.rate_key_header.as_deref()).as_bytes());

        let mut exclude: Vec<String> = Vec::new();
        let mut last_error: Option<BackendError> = None;
        let mut last_response: Option<(String, CachedResponse)> = None;

        for attempt in 0..retry.attempts {
            if attempt > 0 {
                let delay = retry.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let select = SelectContext {
                key_hash,
                client_hash,
                exclude: &exclude,
            };
            let backend = match director.select(&select) {
                Ok(backend) => backend,
                Err(err) => {
                    if let Some(response) = last_response {
                        return Ok(response);
                    }
                    return Err(last_error.unwrap_or(err));
                }
            };

            match self.origin.fetch(&backend, request).await {
                Ok(response) if response.status.is_server_error() && retry.has_more(attempt) => {
                    metrics::record_origin_fetch(&backend.name, "server_error");
                    tracing::warn!(
                        request_id = %ctx.id,
                        backend = %backend.name,
                        status = %response.status,
                        attempt,
                        "Origin answered with server error, retrying"
                    );
                    exclude.push(backend.name.clone());
                    last_response = Some((backend.name.clone(), response));
                }
                Ok(response) => {
                    metrics::record_origin_fetch(&backend.name, "ok");
                    return Ok((backend.name.clone(), response));
                }
                Err(err) => {
                    metrics::record_origin_fetch(&backend.name, "error");
                    tracing::warn!(
                        request_id = %ctx.id,
                        backend = %backend.name,
                        error = %err,
                        attempt,
                        "Origin fetch failed"
                    );
                    exclude.push(backend.name.clone());
                    last_error = Some(err);
                }
            }
        }

        match last_response {
            Some(response) => Ok(response),
            None => Err(last_error.unwrap_or_else(|| BackendError::NoHealthyBackend(director.name().to_string()))),
        }
    }
}

/// `Retry-After` never advertises more than a day.
const MAX_RETRY_AFTER_SECS: u64 = 86_400;

/// Whole seconds, rounded up, within `1..=MAX_RETRY_AFTER_SECS`.
fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs()
        .saturating_add(u64::from(wait.subsec_nanos() > 0))
        .clamp(1, MAX_RETRY_AFTER_SECS)
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn stale_delivery(entry: &CacheEntry) -> Delivery {
    Delivery::new(entry.response.clone(), CacheStatus::Stale).with_age(entry.age(Instant::now()))
}
