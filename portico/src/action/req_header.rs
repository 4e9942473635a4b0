//! Request-direction actions: `set-header`, `del-header`, `limit-referer`

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::header::{HeaderName, HeaderValue, REFERER};
use http::{Request, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

use super::variable::{compile_param, VarContext, Variable};
use super::{text_response, ActionHandler, Builder, Compiled};
use crate::error::{Error, Result};

pub(super) fn register(map: &mut HashMap<&'static str, Builder>) {
    map.insert("set-header", set_header);
    map.insert("del-header", del_header);
    map.insert("limit-referer", limit_referer);
}

struct SetHeader {
    key: HeaderName,
    value: Variable,
    inner: Arc<dyn ActionHandler>,
}

#[async_trait]
impl ActionHandler for SetHeader {
    async fn handle(&self, mut req: Request<Body>) -> Response {
        let value = {
            let ctx = VarContext::from_request(&req);
            self.value.eval(&ctx)
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            req.headers_mut().insert(self.key.clone(), value);
        }
        self.inner.handle(req).await
    }
}

fn set_header(args: &[String], underlying: Compiled) -> Result<Compiled> {
    if args.len() != 2 {
        return Err(Error::ParamCount {
            action: "set-header",
        });
    }
    let key =
        HeaderName::try_from(args[0].as_str()).map_err(|_| Error::BadHeaderName(args[0].clone()))?;
    let value = compile_param(&args[1])?;
    let inner = underlying.handler.clone();
    Ok(underlying.wrap(Arc::new(SetHeader { key, value, inner })))
}

struct DelHeader {
    key: HeaderName,
    inner: Arc<dyn ActionHandler>,
}

#[async_trait]
impl ActionHandler for DelHeader {
    async fn handle(&self, mut req: Request<Body>) -> Response {
        req.headers_mut().remove(&self.key);
        self.inner.handle(req).await
    }
}

fn del_header(args: &[String], underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount {
            action: "del-header",
        });
    }
    let key =
        HeaderName::try_from(args[0].as_str()).map_err(|_| Error::BadHeaderName(args[0].clone()))?;
    let inner = underlying.handler.clone();
    Ok(underlying.wrap(Arc::new(DelHeader { key, inner })))
}

/// Denies requests whose `Referer` does not start with the configured
/// prefix. The site root (`/`) is always allowed through so direct visits
/// still work.
struct LimitReferer {
    prefix: Variable,
    inner: Arc<dyn ActionHandler>,
}

#[async_trait]
impl ActionHandler for LimitReferer {
    async fn handle(&self, req: Request<Body>) -> Response {
        if req.uri().path() != "/" {
            let referer = req
                .headers()
                .get(REFERER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            let prefix = {
                let ctx = VarContext::from_request(&req);
                self.prefix.eval(&ctx)
            };
            if !referer.starts_with(&prefix) {
                return text_response(StatusCode::FORBIDDEN, "Forbidden");
            }
        }
        self.inner.handle(req).await
    }
}

fn limit_referer(args: &[String], underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount {
            action: "limit-referer",
        });
    }
    let prefix = compile_param(&args[0])?;
    let inner = underlying.handler.clone();
    Ok(underlying.wrap(Arc::new(LimitReferer { prefix, inner })))
}
