//! `proxy` terminal action
//!
//! `proxy TARGET` selects the data path from the target scheme:
//! `http`/`https` run the HTTP reverse proxy, `ws`/`wss` run the
//! full-duplex WebSocket bridge. The target is interpolated per request,
//! so it usually embeds `{up:...}` and `{fullpath}`.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::header::{
    HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, LazyLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::rsp_modify::{ContentChain, HeaderChain};
use super::variable::{compile_param, VarContext, Variable};
use super::{text_response, ActionHandler, Builder, Compiled};
use crate::error::{Error, Result};

/// Read/write buffer size of the downstream WebSocket.
const WS_BUFFER_SIZE: usize = 1 << 14;

/// Hop-by-hop headers stripped from the downstream request before dialing
/// the upstream WebSocket.
const WS_REQUEST_HOP_HEADERS: [HeaderName; 5] = [
    UPGRADE,
    CONNECTION,
    SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION,
    SEC_WEBSOCKET_EXTENSIONS,
];

/// Hop-by-hop headers stripped from the upstream handshake response before
/// echoing its headers into the downstream upgrade response.
const WS_RESPONSE_HOP_HEADERS: [HeaderName; 4] = [
    UPGRADE,
    CONNECTION,
    SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS,
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(super) fn register(map: &mut HashMap<&'static str, Builder>) {
    map.insert("proxy", proxy);
}

fn proxy(args: &[String], _underlying: Compiled) -> Result<Compiled> {
    if args.len() != 1 {
        return Err(Error::ParamCount { action: "proxy" });
    }

    let scheme = args[0]
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| Error::BadScheme(args[0].clone()))?;

    match scheme {
        "http" | "https" => {
            let target = compile_param(&args[0])?;
            let header_chain = Arc::new(HeaderChain::default());
            let content_chain = Arc::new(ContentChain::default());
            Ok(Compiled::mutable_terminal(
                Arc::new(HttpProxy {
                    target,
                    header_chain: header_chain.clone(),
                    content_chain: content_chain.clone(),
                }),
                header_chain,
                content_chain,
            ))
        }
        "ws" | "wss" => {
            let target = compile_param(&args[0])?;
            Ok(Compiled::terminal(Arc::new(WebSocketProxy { target })))
        }
        other => Err(Error::BadScheme(other.to_string())),
    }
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);
    &CLIENT
}

fn bad_gateway(target: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!("upstream request ({target}) failed: {err}");
    text_response(StatusCode::BAD_GATEWAY, err.to_string())
}

// ---------------------------------------------------------------------------
// HTTP path

struct HttpProxy {
    target: Variable,
    header_chain: Arc<HeaderChain>,
    content_chain: Arc<ContentChain>,
}

#[async_trait]
impl ActionHandler for HttpProxy {
    async fn handle(&self, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let ctx = VarContext::from_parts(&parts);
        let target = self.target.eval(&ctx);

        let url = match url::Url::parse(&target) {
            Ok(url) => url,
            Err(err) => return bad_gateway(&target, err),
        };

        // Clone the downstream headers and point Host at the upstream.
        let mut headers = parts.headers.clone();
        if let Some(host) = url.host_str() {
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HOST, value);
            }
        }

        // A content rewrite needs an uncompressed upstream body.
        if !self.content_chain.is_empty() {
            headers.remove(ACCEPT_ENCODING);
        }

        let upstream = match http_client()
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => return bad_gateway(&target, err),
        };

        let status = upstream.status();
        let mut rsp_headers = upstream.headers().clone();
        self.header_chain.apply(&ctx, &mut rsp_headers);

        if self.content_chain.is_empty() {
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = rsp_headers;
            return response;
        }

        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(err) => return bad_gateway(&target, err),
        };

        let mut content = body.to_vec();
        if is_textual(rsp_headers.get(CONTENT_TYPE)) {
            content = self.content_chain.apply(&ctx, content);
        }

        if accepts_gzip(&parts.headers) {
            content = match gzip_encode(&content) {
                Ok(encoded) => encoded,
                Err(err) => return bad_gateway(&target, err),
            };
            rsp_headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        rsp_headers.insert(CONTENT_LENGTH, HeaderValue::from(content.len()));

        let mut response = Response::new(Body::from(content));
        *response.status_mut() = status;
        *response.headers_mut() = rsp_headers;
        response
    }
}

/// Whether the first `Accept-Encoding` value of the original request
/// admits gzip.
pub(crate) fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"))
}

/// Content types whose bodies may be rewritten or gzip-encoded. Matching
/// ignores parameters after `;`. A missing or empty `Content-Type` counts
/// as textual.
pub(crate) fn is_textual(content_type: Option<&HeaderValue>) -> bool {
    let Some(value) = content_type else {
        return true;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime.is_empty() || mime.starts_with("text/") {
        return true;
    }
    matches!(
        mime.as_str(),
        "application/atom+xml"
            | "application/ecmascript"
            | "application/json"
            | "application/javascript"
            | "application/rss+xml"
            | "application/soap+xml"
            | "application/xhtml+xml"
            | "application/xml"
    )
}

pub(crate) fn gzip_encode(content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(content)?;
    encoder.finish()
}

// ---------------------------------------------------------------------------
// WebSocket path

struct WebSocketProxy {
    target: Variable,
}

#[async_trait]
impl ActionHandler for WebSocketProxy {
    async fn handle(&self, req: Request<Body>) -> Response {
        let (mut parts, _body) = req.into_parts();
        let target = {
            let ctx = VarContext::from_parts(&parts);
            self.target.eval(&ctx)
        };

        let mut ws_req = match target.as_str().into_client_request() {
            Ok(ws_req) => ws_req,
            Err(err) => return bad_gateway(&target, err),
        };
        let mut forwarded = parts.headers.clone();
        for name in &WS_REQUEST_HOP_HEADERS {
            forwarded.remove(name);
        }
        ws_req.headers_mut().extend(forwarded);

        let (upstream, handshake) = match connect_async(ws_req).await {
            Ok(pair) => pair,
            Err(err) => return bad_gateway(&target, err),
        };

        let mut extra_headers = handshake.headers().clone();
        for name in &WS_RESPONSE_HOP_HEADERS {
            extra_headers.remove(name);
        }

        let upgrade = match <WebSocketUpgrade as axum::extract::FromRequestParts<()>>::from_request_parts(
            &mut parts,
            &(),
        )
        .await
        {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                tracing::error!("upgrade to websocket ({target}) failed: {rejection}");
                return rejection.into_response();
            }
        };

        let mut response = upgrade
            .write_buffer_size(WS_BUFFER_SIZE)
            .on_upgrade(move |downstream| bridge(downstream, upstream));
        response.headers_mut().extend(extra_headers);
        response
    }
}

/// Copy frames in both directions until each side has terminated. Each
/// direction posts one completion token; the bridge returns after both.
async fn bridge(downstream: WebSocket, upstream: UpstreamSocket) {
    let (down_sink, down_stream) = downstream.split();
    let (up_sink, up_stream) = upstream.split();
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    tokio::spawn(pump_to_upstream(down_stream, up_sink, done_tx.clone()));
    tokio::spawn(pump_to_downstream(up_stream, down_sink, done_tx));

    let _ = done_rx.recv().await;
    let _ = done_rx.recv().await;
}

fn upstream_close_frame() -> UpstreamMessage {
    UpstreamMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

fn downstream_close_frame() -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code: ws::close_code::NORMAL,
        reason: "".into(),
    }))
}

/// Forward text and binary frames read from the client to the upstream.
async fn pump_to_upstream(
    mut from: SplitStream<WebSocket>,
    mut to: SplitSink<UpstreamSocket, UpstreamMessage>,
    done: mpsc::Sender<()>,
) {
    loop {
        match from.next().await {
            Some(Ok(ws::Message::Text(text))) => {
                if let Err(err) = to.send(UpstreamMessage::Text(text.as_str().into())).await {
                    tracing::error!("websocket write failed: {err}");
                    break;
                }
            }
            Some(Ok(ws::Message::Binary(data))) => {
                if let Err(err) = to.send(UpstreamMessage::Binary(data)).await {
                    tracing::error!("websocket write failed: {err}");
                    break;
                }
            }
            // Control frames are answered by the protocol layer.
            Some(Ok(ws::Message::Ping(_))) | Some(Ok(ws::Message::Pong(_))) => {}
            Some(Ok(ws::Message::Close(_))) | None => {
                let _ = to.send(upstream_close_frame()).await;
                break;
            }
            Some(Err(err)) => {
                tracing::error!("websocket read failed: {err}");
                let _ = to.send(upstream_close_frame()).await;
                break;
            }
        }
    }
    let _ = done.send(()).await;
}

/// Forward text and binary frames read from the upstream to the client.
async fn pump_to_downstream(
    mut from: SplitStream<UpstreamSocket>,
    mut to: SplitSink<WebSocket, ws::Message>,
    done: mpsc::Sender<()>,
) {
    loop {
        match from.next().await {
            Some(Ok(UpstreamMessage::Text(text))) => {
                if let Err(err) = to.send(ws::Message::Text(text.as_str().into())).await {
                    tracing::error!("websocket write failed: {err}");
                    break;
                }
            }
            Some(Ok(UpstreamMessage::Binary(data))) => {
                if let Err(err) = to.send(ws::Message::Binary(data)).await {
                    tracing::error!("websocket write failed: {err}");
                    break;
                }
            }
            Some(Ok(UpstreamMessage::Close(_))) | None => {
                let _ = to.send(downstream_close_frame()).await;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::error!("websocket read failed: {err}");
                let _ = to.send(downstream_close_frame()).await;
                break;
            }
        }
    }
    let _ = done.send(()).await;
}

#[cfg(test)]
mod tests {
    use super::super::build_handler;
    use super::*;

    #[test]
    fn scheme_selects_the_data_path() {
        assert!(build_handler("proxy http://backend/", Compiled::not_found()).is_ok());
        assert!(build_handler("proxy https://backend/", Compiled::not_found()).is_ok());
        assert!(build_handler("proxy ws://backend/", Compiled::not_found()).is_ok());
        assert!(build_handler("proxy wss://backend/", Compiled::not_found()).is_ok());

        assert!(matches!(
            build_handler("proxy ftp://backend/", Compiled::not_found()),
            Err(Error::BadScheme(_))
        ));
        assert!(matches!(
            build_handler("proxy backend", Compiled::not_found()),
            Err(Error::BadScheme(_))
        ));
    }

    #[test]
    fn http_targets_accept_response_modifiers_ws_targets_do_not() {
        let compiled = build_handler("proxy http://backend/", Compiled::not_found()).unwrap();
        assert!(build_handler("set-rsp-header Hello world", compiled).is_ok());

        let compiled = build_handler("proxy ws://backend/", Compiled::not_found()).unwrap();
        assert!(matches!(
            build_handler("set-rsp-header Hello world", compiled),
            Err(Error::CapabilityMissing { .. })
        ));
    }

    #[test]
    fn textual_content_types() {
        let textual = |value: &str| is_textual(Some(&HeaderValue::from_str(value).unwrap()));

        assert!(textual("text/html"));
        assert!(textual("text/html; charset=utf-8"));
        assert!(textual("application/json"));
        assert!(textual("Application/XML"));
        assert!(!textual("image/png"));
        assert!(!textual("application/octet-stream"));

        // Missing and empty content types take the permissive reading:
        // both code paths treat them as rewritable text.
        assert!(is_textual(None));
        assert!(textual(""));
    }

    #[test]
    fn gzip_round_trips() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let encoded = gzip_encode(b"hello gzip world").unwrap();
        let mut decoder = GzDecoder::new(encoded.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"hello gzip world");
    }

    #[test]
    fn accept_encoding_detection() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        assert!(accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        assert!(!accepts_gzip(&headers));
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_502() {
        let handler = build_handler(
            // Port 9 on localhost: nothing listens there.
            "proxy http://127.0.0.1:9/nowhere",
            Compiled::not_found(),
        )
        .unwrap()
        .finalize();

        let req = Request::builder().uri("/nowhere").body(Body::empty()).unwrap();
        let rsp = handler.handle(req).await;
        assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
    }
}
