//! Response modifiers
//!
//! The four actions here do not wrap the handler chain; they install
//! transformers into the terminal handler's response path. Header
//! modifiers rewrite the upstream response headers, content modifiers
//! rewrite the (textual) body. Both run in installation order, which is
//! the reverse of textual order, so the outermost action has the final
//! say on the wire.

use http::header::{HeaderName, HeaderValue, SET_COOKIE};
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::variable::{compile_param, VarContext, Variable};
use super::{Builder, Compiled};
use crate::error::{Error, Result};

/// Transforms upstream response headers before they reach the client.
pub trait RspHeaderModifier: Send + Sync {
    fn modify(&self, ctx: &VarContext<'_>, headers: &mut HeaderMap);
}

/// Transforms the buffered upstream response body.
pub trait RspContentModifier: Send + Sync {
    fn modify(&self, ctx: &VarContext<'_>, content: Vec<u8>) -> Vec<u8>;
}

/// Header-modifier slot of a terminal handler. Filled exactly once when
/// the rule finishes compiling; reads afterwards are lock-free.
#[derive(Default)]
pub struct HeaderChain(OnceLock<Vec<Box<dyn RspHeaderModifier>>>);

impl HeaderChain {
    pub(super) fn install(&self, modifiers: Vec<Box<dyn RspHeaderModifier>>) {
        let _ = self.0.set(modifiers);
    }

    pub fn modifiers(&self) -> &[Box<dyn RspHeaderModifier>] {
        self.0.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn apply(&self, ctx: &VarContext<'_>, headers: &mut HeaderMap) {
        for modifier in self.modifiers() {
            modifier.modify(ctx, headers);
        }
    }
}

/// Content-modifier slot of a terminal handler.
#[derive(Default)]
pub struct ContentChain(OnceLock<Vec<Box<dyn RspContentModifier>>>);

impl ContentChain {
    pub(super) fn install(&self, modifiers: Vec<Box<dyn RspContentModifier>>) {
        let _ = self.0.set(modifiers);
    }

    pub fn is_empty(&self) -> bool {
        self.0.get().map(Vec::is_empty).unwrap_or(true)
    }

    pub fn apply(&self, ctx: &VarContext<'_>, mut content: Vec<u8>) -> Vec<u8> {
        if let Some(modifiers) = self.0.get() {
            for modifier in modifiers {
                content = modifier.modify(ctx, content);
            }
        }
        content
    }
}

pub(super) fn register(map: &mut HashMap<&'static str, Builder>) {
    map.insert("set-rsp-header", set_rsp_header);
    map.insert("del-rsp-header", del_rsp_header);
    map.insert("proxy-cookie", proxy_cookie);
    map.insert("filter-content", filter_content);
}

// ---------------------------------------------------------------------------

struct HeaderSetter {
    key: HeaderName,
    value: Variable,
}

impl RspHeaderModifier for HeaderSetter {
    fn modify(&self, ctx: &VarContext<'_>, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.value.eval(ctx)) {
            headers.insert(self.key.clone(), value);
        }
    }
}

fn set_rsp_header(args: &[String], mut underlying: Compiled) -> Result<Compiled> {
    if args.len() != 2 {
        return Err(Error::ParamCount {
            action: "set-rsp-header",
        });
    }
    let key = header_name(&args[0])?;
    let value = compile_param(&args[1])?;
    underlying.add_header_modifier("set-rsp-header", Box::new(HeaderSetter { key, value }))?;
    Ok(underlying)
}

// ---------------------------------------------------------------------------

struct HeaderDropper(HeaderName);

impl RspHeaderModifier for HeaderDropper {
    fn modify(&self, _ctx: &VarContext<'_>, headers: &mut HeaderMap) {
        headers.remove(&self.0);
    }
}

fn del_rsp_header(args: &[String], mut underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount {
            action: "del-rsp-header",
        });
    }
    let key = header_name(&args[0])?;
    underlying.add_header_modifier("del-rsp-header", Box::new(HeaderDropper(key)))?;
    Ok(underlying)
}

// ---------------------------------------------------------------------------

struct CookieRewriter {
    this_domain: Variable,
    upstream_domain: Variable,
}

impl RspHeaderModifier for CookieRewriter {
    fn modify(&self, ctx: &VarContext<'_>, headers: &mut HeaderMap) {
        if !headers.contains_key(SET_COOKIE) {
            return;
        }

        let original: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
        let this_domain = self.this_domain.eval(ctx);
        let upstream = self.upstream_domain.eval(ctx);
        let upper = format!("Domain={upstream}");
        let lower = format!("domain={upstream}");

        headers.remove(SET_COOKIE);

        for value in original {
            let cookie = String::from_utf8_lossy(value.as_bytes()).into_owned();
            let mut segs: Vec<String> = cookie.split("; ").map(String::from).collect();

            for seg in &mut segs {
                if *seg == upper {
                    *seg = format!("Domain={this_domain}");
                    break;
                }
                if *seg == lower {
                    *seg = format!("domain={this_domain}");
                    break;
                }
            }

            match HeaderValue::from_str(&segs.join("; ")) {
                Ok(rewritten) => headers.append(SET_COOKIE, rewritten),
                // The substituted domain was not a legal header value;
                // keep the cookie untouched rather than dropping it.
                Err(_) => headers.append(SET_COOKIE, value),
            };
        }
    }
}

fn proxy_cookie(args: &[String], mut underlying: Compiled) -> Result<Compiled> {
    if args.len() != 2 {
        return Err(Error::ParamCount {
            action: "proxy-cookie",
        });
    }
    let this_domain = compile_param(&args[0])?;
    let upstream_domain = compile_param(&args[1])?;
    underlying.add_header_modifier(
        "proxy-cookie",
        Box::new(CookieRewriter {
            this_domain,
            upstream_domain,
        }),
    )?;
    Ok(underlying)
}

// ---------------------------------------------------------------------------

struct ContentFilter {
    pattern: regex::bytes::Regex,
    replacement: Variable,
}

impl RspContentModifier for ContentFilter {
    fn modify(&self, ctx: &VarContext<'_>, content: Vec<u8>) -> Vec<u8> {
        let replacement = self.replacement.eval(ctx);
        self.pattern
            .replace_all(&content, replacement.as_bytes())
            .into_owned()
    }
}

fn filter_content(args: &[String], mut underlying: Compiled) -> Result<Compiled> {
    if args.len() != 2 {
        return Err(Error::ParamCount {
            action: "filter-content",
        });
    }
    let pattern = regex::bytes::Regex::new(&args[0])?;
    let replacement = compile_param(&args[1])?;
    underlying.add_content_modifier(
        "filter-content",
        Box::new(ContentFilter {
            pattern,
            replacement,
        }),
    )?;
    Ok(underlying)
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::try_from(name).map_err(|_| Error::BadHeaderName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::{build_handler, ActionHandler, Compiled};
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::response::Response;
    use http::header::CONTENT_LENGTH;
    use http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    /// Stand-in terminal: emits a canned upstream response through the
    /// modifier chains the way the proxy does.
    struct CannedUpstream {
        header_chain: Arc<HeaderChain>,
        content_chain: Arc<ContentChain>,
    }

    #[async_trait]
    impl ActionHandler for CannedUpstream {
        async fn handle(&self, req: Request<Body>) -> Response {
            let (parts, _body) = req.into_parts();
            let ctx = VarContext::from_parts(&parts);

            let mut headers = HeaderMap::new();
            headers.append(
                SET_COOKIE,
                HeaderValue::from_static("mur=kmr; Domain=yjsnpi.com; Secure; HttpOnly"),
            );
            headers.append(
                SET_COOKIE,
                HeaderValue::from_static("szk=yjsnpi; Domain=yjsnpi.com; Secure; HttpOnly"),
            );
            headers.insert("Header-To-Delete", HeaderValue::from_static("xxxxxxxx"));

            self.header_chain.apply(&ctx, &mut headers);

            let content = self.content_chain.apply(
                &ctx,
                br#"<a href="https://kmr.yjsnpi.com/chapter_4.mp4">Tohno</a>"#.to_vec(),
            );
            if let Ok(length) = HeaderValue::from_str(&content.len().to_string()) {
                headers.insert(CONTENT_LENGTH, length);
            }

            let mut response = Response::new(Body::from(content));
            *response.headers_mut() = headers;
            response
        }
    }

    fn canned_terminal() -> Compiled {
        let header_chain = Arc::new(HeaderChain::default());
        let content_chain = Arc::new(ContentChain::default());
        Compiled::mutable_terminal(
            Arc::new(CannedUpstream {
                header_chain: header_chain.clone(),
                content_chain: content_chain.clone(),
            }),
            header_chain,
            content_chain,
        )
    }

    async fn run_actions(actions: &[&str]) -> Response {
        let mut compiled = canned_terminal();
        for action in actions.iter().rev() {
            compiled = build_handler(action, compiled).expect("action builds");
        }
        let handler = compiled.finalize();

        let req = Request::builder()
            .uri("http://www.mur.com/")
            .body(Body::empty())
            .unwrap();
        handler.handle(req).await
    }

    #[tokio::test]
    async fn rewrites_cookies_headers_and_content() {
        let rsp = run_actions(&[
            "set-rsp-header Hello world",
            "del-rsp-header Header-To-Delete",
            "proxy-cookie mur.com yjsnpi.com",
            r"filter-content ://([a-z]+).yjsnpi.com/ ://www.mur.com/yjsnpi/{re[1]}/",
        ])
        .await;

        let expected = r#"<a href="https://www.mur.com/yjsnpi/kmr/chapter_4.mp4">Tohno</a>"#;

        assert!(rsp.headers().get("Header-To-Delete").is_none());
        assert_eq!(rsp.headers().get("Hello").unwrap(), "world");

        let cookies: Vec<_> = rsp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        for cookie in &cookies {
            assert!(cookie.contains("mur.com"), "cookie not rewritten: {cookie}");
        }

        assert_eq!(
            rsp.headers().get(CONTENT_LENGTH).unwrap(),
            &expected.len().to_string()
        );

        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), expected.as_bytes());
    }

    #[tokio::test]
    async fn cookie_rewrite_preserves_key_casing() {
        let mut compiled = canned_terminal();
        compiled = build_handler("proxy-cookie mur.com yjsnpi.com", compiled).unwrap();
        let handler = compiled.finalize();

        let req = Request::builder()
            .uri("http://www.mur.com/")
            .body(Body::empty())
            .unwrap();
        let rsp = handler.handle(req).await;

        for value in rsp.headers().get_all(SET_COOKIE) {
            let cookie = value.to_str().unwrap();
            assert!(cookie.contains("Domain=mur.com"));
            assert!(!cookie.contains("yjsnpi.com"));
        }
    }

    #[tokio::test]
    async fn modifiers_apply_outermost_textual_last() {
        // Both actions set the same header; the textually first (outermost)
        // action runs last and wins.
        let rsp = run_actions(&["set-rsp-header Who outer", "set-rsp-header Who inner"]).await;
        assert_eq!(rsp.headers().get("Who").unwrap(), "outer");
    }

    #[test]
    fn modifier_actions_require_capabilities() {
        let terminal = Compiled::not_found();
        let err = build_handler("set-rsp-header Hello world", terminal);
        assert!(matches!(err, Err(Error::CapabilityMissing { .. })));

        let terminal = Compiled::not_found();
        let err = build_handler("filter-content a b", terminal);
        assert!(matches!(err, Err(Error::CapabilityMissing { .. })));
    }

    #[test]
    fn argument_counts_are_validated() {
        assert!(matches!(
            build_handler("set-rsp-header OnlyKey", canned_terminal()),
            Err(Error::ParamCount { .. })
        ));
        assert!(matches!(
            build_handler("del-rsp-header", canned_terminal()),
            Err(Error::ParamCount { .. })
        ));
        assert!(matches!(
            build_handler("proxy-cookie onearg", canned_terminal()),
            Err(Error::ParamCount { .. })
        ));
    }

    #[test]
    fn bad_filter_regex_fails_at_build_time() {
        assert!(build_handler("filter-content ([unclosed x", canned_terminal()).is_err());
    }
}
