//! `wwwroot` terminal action
//!
//! Serves a directory with two screening rules applied before the file
//! system is consulted: any `..` in the path is refused outright, and any
//! path segment starting with `.` is reported as absent. Textual responses
//! are gzip-encoded on the fly when the client accepts it.

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, StatusCode};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::compression::predicate::Predicate;
use tower_http::compression::Compression;
use tower_http::services::ServeDir;

use super::proxy::{accepts_gzip, gzip_encode, is_textual};
use super::rsp_modify::{ContentChain, HeaderChain};
use super::variable::VarContext;
use super::{text_response, ActionHandler, Builder, Compiled};
use crate::error::{Error, Result};

pub(super) fn register(map: &mut HashMap<&'static str, Builder>) {
    map.insert("wwwroot", wwwroot);
}

/// Gzip only responses whose content type is textual; everything else
/// streams through untouched.
#[derive(Clone, Copy, Debug, Default)]
struct TextualFiles;

impl Predicate for TextualFiles {
    fn should_compress<B>(&self, response: &http::Response<B>) -> bool
    where
        B: http_body::Body,
    {
        is_textual(response.headers().get(CONTENT_TYPE))
    }
}

struct Wwwroot {
    files: ServeDir,
    compressed: Compression<ServeDir, TextualFiles>,
    header_chain: Arc<HeaderChain>,
    content_chain: Arc<ContentChain>,
}

fn wwwroot(args: &[String], _underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount { action: "wwwroot" });
    }

    let files = ServeDir::new(PathBuf::from(&args[0]));
    let compressed = Compression::new(files.clone()).compress_when(TextualFiles);
    let header_chain = Arc::new(HeaderChain::default());
    let content_chain = Arc::new(ContentChain::default());

    Ok(Compiled::mutable_terminal(
        Arc::new(Wwwroot {
            files,
            compressed,
            header_chain: header_chain.clone(),
            content_chain: content_chain.clone(),
        }),
        header_chain,
        content_chain,
    ))
}

#[async_trait]
impl ActionHandler for Wwwroot {
    async fn handle(&self, req: Request<Body>) -> Response {
        let path = req.uri().path();

        // Parent-directory traversal is refused before touching the tree.
        if path.contains("..") {
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        // Hidden files and directories are reported as absent.
        if path.split('/').any(|segment| segment.starts_with('.')) {
            return text_response(StatusCode::NOT_FOUND, "Not found");
        }

        if self.content_chain.is_empty() {
            let (parts, body) = req.into_parts();
            let ctx = VarContext::from_parts(&parts);
            let req = Request::from_parts(parts.clone(), body);

            let rsp = match self.compressed.clone().oneshot(req).await {
                Ok(rsp) => rsp,
                Err(never) => match never {},
            };
            let mut rsp = rsp.map(Body::new);
            self.header_chain.apply(&ctx, rsp.headers_mut());
            return rsp;
        }

        // A content modifier is installed: buffer the file, rewrite, and
        // re-encode, the same way the reverse proxy does.
        let (parts, body) = req.into_parts();
        let ctx = VarContext::from_parts(&parts);
        let req = Request::from_parts(parts.clone(), body);

        let rsp = match self.files.clone().oneshot(req).await {
            Ok(rsp) => rsp,
            Err(never) => match never {},
        };
        let (mut rsp_parts, rsp_body) = rsp.into_parts();
        self.header_chain.apply(&ctx, &mut rsp_parts.headers);

        let collected = match rsp_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                tracing::error!("read file response failed: {err}");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };

        let textual = is_textual(rsp_parts.headers.get(CONTENT_TYPE));
        let mut content = collected.to_vec();
        if textual {
            content = self.content_chain.apply(&ctx, content);
        }

        if textual
            && accepts_gzip(&parts.headers)
            && !rsp_parts.headers.contains_key(CONTENT_ENCODING)
        {
            match gzip_encode(&content) {
                Ok(encoded) => {
                    content = encoded;
                    rsp_parts
                        .headers
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                }
                Err(err) => {
                    tracing::error!("gzip encode failed: {err}");
                }
            }
        }

        rsp_parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(content.len()));
        Response::from_parts(rsp_parts, Body::from(content))
    }
}
