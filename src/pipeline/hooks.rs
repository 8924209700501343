//! Stage handlers.
//!
//! Every method has a builtin default; implementors override only the
//! stages they care about. A handler returns the next action or an error;
//! an error is routed to the Error stage with `PipelineError::status()`.
//!
//! Handlers are synchronous. The Fetch handler runs on the shared fetch
//! task and sees a snapshot of the request that started it.

use axum::http::{header, HeaderValue, Method};

use crate::cache::{CacheEntry, KeyBuilder};
use crate::error::PipelineError;
use crate::pipeline::context::{BackendResponse, Delivery, RequestContext};
use crate::pipeline::state::Action;

pub trait StageHandlers: Send + Sync + 'static {
    fn receive(&self, ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        builtin::receive(ctx)
    }

    fn hash(&self, ctx: &RequestContext, key: &mut KeyBuilder) -> Result<Action, PipelineError> {
        builtin::hash(ctx, key)
    }

    fn hit(&self, _ctx: &mut RequestContext, _entry: &CacheEntry) -> Result<Action, PipelineError> {
        Ok(Action::Deliver)
    }

    fn miss(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        Ok(Action::Fetch)
    }

    fn pass(&self, _ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        Ok(Action::Pass)
    }

    fn fetch(&self, ctx: &RequestContext, beresp: &mut BackendResponse) -> Result<Action, PipelineError> {
        builtin::fetch(ctx, beresp)
    }

    fn error(&self, _ctx: &mut RequestContext, _resp: &mut Delivery) -> Result<Action, PipelineError> {
        Ok(Action::Deliver)
    }

    fn deliver(&self, ctx: &mut RequestContext, resp: &mut Delivery) -> Result<Action, PipelineError> {
        builtin::deliver(ctx, resp)
    }

    fn log(&self, _ctx: &RequestContext, _resp: &Delivery) -> Result<Action, PipelineError> {
        Ok(Action::Deliver)
    }
}

/// Handlers with no overrides.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHandlers;

impl StageHandlers for BuiltinHandlers {}

/// Default stage behaviour, callable from custom handlers.
pub mod builtin {
    use super::*;

    /// Pass anything that is not a plain GET/HEAD or that carries credentials.
    pub fn receive(ctx: &mut RequestContext) -> Result<Action, PipelineError> {
        if ctx.method != Method::GET && ctx.method != Method::HEAD {
            return Ok(Action::Pass);
        }
        if ctx.headers.contains_key(header::AUTHORIZATION) {
            return Ok(Action::Pass);
        }
        Ok(Action::Hash)
    }

    /// Key on url, then host.
    pub fn hash(ctx: &RequestContext, key: &mut KeyBuilder) -> Result<Action, PipelineError> {
        key.add(&ctx.url);
        key.add(ctx.host().unwrap_or_default());
        Ok(Action::Hash)
    }

    /// Uncacheable responses become hit-for-pass markers.
    pub fn fetch(_ctx: &RequestContext, beresp: &mut BackendResponse) -> Result<Action, PipelineError> {
        if beresp.cacheable {
            Ok(Action::Deliver)
        } else {
            Ok(Action::HitForPass)
        }
    }

    /// Stamp `Age` and `X-Cache`.
    pub fn deliver(_ctx: &mut RequestContext, resp: &mut Delivery) -> Result<Action, PipelineError> {
        let headers = &mut resp.response.headers;
        headers.insert(header::AGE, HeaderValue::from(resp.age.as_secs()));
        headers.insert("x-cache", HeaderValue::from_static(resp.cache_status.as_str()));
        Ok(Action::Deliver)
    }
}
