//! `redirect` terminal action

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::header::{HeaderValue, LOCATION};
use http::{Request, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

use super::variable::{compile_param, VarContext, Variable};
use super::{text_response, ActionHandler, Builder, Compiled};
use crate::error::{Error, Result};

pub(super) fn register(map: &mut HashMap<&'static str, Builder>) {
    map.insert("redirect", redirect);
}

/// Replies 301 with an interpolated `Location`.
struct Redirect {
    location: Variable,
}

#[async_trait]
impl ActionHandler for Redirect {
    async fn handle(&self, req: Request<Body>) -> Response {
        let (parts, _body) = req.into_parts();
        let ctx = VarContext::from_parts(&parts);
        let location = self.location.eval(&ctx);

        match HeaderValue::from_str(&location) {
            Ok(value) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "redirect target is not a valid header value",
            ),
        }
    }
}

fn redirect(args: &[String], _underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount { action: "redirect" });
    }
    let location = compile_param(&args[0])?;
    Ok(Compiled::terminal(Arc::new(Redirect { location })))
}

#[cfg(test)]
mod tests {
    use super::super::build_handler;
    use super::*;

    #[tokio::test]
    async fn redirects_with_interpolated_location() {
        let handler = build_handler(
            "redirect https://www.mur.com{fullpath}",
            Compiled::not_found(),
        )
        .unwrap()
        .finalize();

        let req = Request::builder()
            .uri("/videos?ep=4")
            .body(Body::empty())
            .unwrap();
        let rsp = handler.handle(req).await;

        assert_eq!(rsp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            rsp.headers().get(LOCATION).unwrap(),
            "https://www.mur.com/videos?ep=4"
        );
    }

    #[test]
    fn argument_count_is_validated() {
        assert!(build_handler("redirect", Compiled::not_found()).is_err());
        assert!(build_handler("redirect a b", Compiled::not_found()).is_err());
    }
}
