//! End-to-end action pipeline tests against a live local upstream.

use axum::body::Body;
use axum::response::Response;
use axum::routing::get;
use http::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, SET_COOKIE,
};
use http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use portico::{compile_rule, ActionHandler};
use std::net::SocketAddr;

const UPSTREAM_BODY: &str = r#"<a href="https://kmr.yjsnpi.com/chapter_4.mp4">Tohno</a>"#;
const REWRITTEN_BODY: &str = r#"<a href="https://www.mur.com/yjsnpi/kmr/chapter_4.mp4">Tohno</a>"#;

async fn upstream_page() -> Response {
    let mut rsp = Response::new(Body::from(UPSTREAM_BODY));
    let headers = rsp.headers_mut();
    headers.append(
        SET_COOKIE,
        "mur=kmr; Domain=yjsnpi.com; Secure; HttpOnly".parse().unwrap(),
    );
    headers.append(
        SET_COOKIE,
        "szk=yjsnpi; Domain=yjsnpi.com; Secure; HttpOnly".parse().unwrap(),
    );
    headers.insert("Header-To-Delete", "xxxxxxxx".parse().unwrap());
    headers.insert(CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
    rsp
}

async fn echo_host(headers: HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string()
}

async fn echo_encoding(headers: HeaderMap) -> String {
    headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string()
}

async fn start_upstream() -> SocketAddr {
    let app = axum::Router::new()
        .route("/", get(upstream_page))
        .route("/echo-host", get(echo_host))
        .route("/echo-encoding", get(echo_encoding));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn rewrite_actions(addr: SocketAddr) -> Vec<String> {
    vec![
        "set-rsp-header Hello world".to_string(),
        "del-rsp-header Header-To-Delete".to_string(),
        "proxy-cookie mur.com yjsnpi.com".to_string(),
        r"filter-content ://([a-z]+).yjsnpi.com/ ://www.mur.com/yjsnpi/{re[1]}/".to_string(),
        format!("proxy http://{addr}{{fullpath}}"),
    ]
}

#[tokio::test]
async fn rewrites_cookies_headers_and_content_end_to_end() {
    let addr = start_upstream().await;
    let handler = compile_rule(&rewrite_actions(addr)).expect("pipeline compiles");

    let req = Request::builder()
        .uri("/")
        .header(HOST, "www.mur.com")
        .body(Body::empty())
        .unwrap();
    let rsp = handler.handle(req).await;

    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(rsp.headers().get("Hello").unwrap(), "world");
    assert!(rsp.headers().get("Header-To-Delete").is_none());

    let cookies: Vec<String> = rsp
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies.len(), 2);
    for cookie in &cookies {
        assert!(cookie.contains("Domain=mur.com"), "cookie: {cookie}");
    }

    assert_eq!(
        rsp.headers().get(CONTENT_LENGTH).unwrap(),
        &REWRITTEN_BODY.len().to_string()
    );

    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), REWRITTEN_BODY.as_bytes());
}

#[tokio::test]
async fn rewritten_responses_gzip_for_accepting_clients() {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let addr = start_upstream().await;
    let handler = compile_rule(&rewrite_actions(addr)).expect("pipeline compiles");

    let req = Request::builder()
        .uri("/")
        .header(HOST, "www.mur.com")
        .header(ACCEPT_ENCODING, "gzip, deflate")
        .body(Body::empty())
        .unwrap();
    let rsp = handler.handle(req).await;

    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(rsp.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

    let declared_length: usize = rsp
        .headers()
        .get(CONTENT_LENGTH)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();

    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(declared_length, body.len());

    let mut decoded = String::new();
    GzDecoder::new(body.as_ref())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, REWRITTEN_BODY);
}

#[tokio::test]
async fn upstream_sees_its_own_host_header() {
    let addr = start_upstream().await;
    let handler =
        compile_rule(&[format!("proxy http://{addr}{{fullpath}}")]).expect("proxy compiles");

    let req = Request::builder()
        .uri("/echo-host")
        .header(HOST, "www.mur.com")
        .body(Body::empty())
        .unwrap();
    let rsp = handler.handle(req).await;

    assert_eq!(rsp.status(), StatusCode::OK);
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), addr.to_string().as_bytes());
}

#[tokio::test]
async fn content_modifiers_force_identity_upstream_bodies() {
    let addr = start_upstream().await;
    let handler = compile_rule(&[
        "filter-content nothing-matches replacement".to_string(),
        format!("proxy http://{addr}{{fullpath}}"),
    ])
    .expect("pipeline compiles");

    let req = Request::builder()
        .uri("/echo-encoding")
        .header(HOST, "www.mur.com")
        .header(ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let rsp = handler.handle(req).await;

    assert_eq!(rsp.status(), StatusCode::OK);
    // We asked the upstream without Accept-Encoding, then gzipped the
    // result ourselves for the client.
    assert_eq!(rsp.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

    use flate2::read::GzDecoder;
    use std::io::Read;
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    let mut decoded = String::new();
    GzDecoder::new(body.as_ref())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, "none");
}
