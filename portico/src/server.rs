//! Server slots and bring-up
//!
//! Sites sharing a port share one server slot; all sites on a slot must
//! agree on http vs https. Every request is access-logged, tagged with its
//! original `Host` header, and dispatched through the slot's host router
//! into the compiled action chain. Port 80 additionally answers ACME
//! HTTP-01 challenges before host routing, and a default plain-HTTP slot
//! is created there when the configuration names none.

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::header::HOST;
use http::StatusCode;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;

use crate::acme::AcmeManager;
use crate::action::{compile_rule, text_response};
use crate::certs::{CertRegistry, CertResolver, CertSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ocsp::OcspStapler;
use crate::router::{HostRouter, OriginalHost};
use crate::tls::{server_config, TlsListener};

/// One listener's routing state.
pub struct ServerSlot {
    pub port: u16,
    pub tls: bool,
    router: HostRouter,
}

/// Output of [`build_server_slots`].
pub struct BuiltSlots {
    pub slots: HashMap<u16, ServerSlot>,
    pub cert_registry: CertRegistry,
    /// Hosts with `autocert = true`, for the ACME whitelist.
    pub autocert_hosts: Vec<String>,
}

/// Compile the configured sites into per-port slots, the certificate
/// registry, and the autocert host list.
pub fn build_server_slots(config: &Config) -> Result<BuiltSlots> {
    let mut slots: HashMap<u16, ServerSlot> = HashMap::new();
    let mut cert_registry = CertRegistry::default();
    let mut autocert_hosts = Vec::new();

    for (host, site_list) in &config.sites {
        for site in site_list {
            let (scheme, port) = site.scheme_and_port(host)?;

            let slot = slots.entry(port).or_insert_with(|| ServerSlot {
                port,
                tls: scheme.is_tls(),
                router: HostRouter::default(),
            });
            if slot.tls != scheme.is_tls() {
                return Err(Error::BadSite {
                    host: host.clone(),
                    reason: format!("port {port} mixes http and https sites"),
                });
            }

            if slot.tls {
                if site.autocert {
                    cert_registry.insert(host, CertSource::AutoCert)?;
                    autocert_hosts.push(host.clone());
                } else {
                    let cert = site.ssl_cert.clone().ok_or_else(|| Error::BadSite {
                        host: host.clone(),
                        reason: "https site needs ssl_cert or autocert".to_string(),
                    })?;
                    let key = site.ssl_key.clone().ok_or_else(|| Error::BadSite {
                        host: host.clone(),
                        reason: "https site needs ssl_key or autocert".to_string(),
                    })?;
                    cert_registry.insert(host, CertSource::Static { cert, key })?;
                }
            }

            let path_router = slot.router.host_mut(host);
            for rule in &site.rules {
                for (prefix, actions) in rule {
                    let handler = compile_rule(actions)?;
                    path_router.add_rule(prefix, handler)?;
                }
            }
        }
    }

    Ok(BuiltSlots {
        slots,
        cert_registry,
        autocert_hosts,
    })
}

struct SlotState {
    slot: ServerSlot,
    acme: Arc<AcmeManager>,
}

/// Serve every slot until a shutdown signal arrives. `request_timeout`
/// bounds how long any single exchange may take end to end; upgraded
/// WebSocket connections are not affected once established.
pub async fn run(
    mut slots: HashMap<u16, ServerSlot>,
    cert_registry: CertRegistry,
    acme: Arc<AcmeManager>,
    request_timeout: Duration,
) -> Result<()> {
    match slots.get(&80) {
        Some(slot) if slot.tls => {
            return Err(Error::BadSite {
                host: String::new(),
                reason: "port 80 cannot run HTTPS".to_string(),
            });
        }
        Some(_) => {}
        None => {
            slots.insert(
                80,
                ServerSlot {
                    port: 80,
                    tls: false,
                    router: HostRouter::default(),
                },
            );
        }
    }

    let needs_tls = slots.values().any(|slot| slot.tls);
    let tls_config = if needs_tls {
        let ocsp = Arc::new(OcspStapler::new(tokio::runtime::Handle::current()));
        let resolver = Arc::new(CertResolver::new(cert_registry, acme.clone(), ocsp));
        Some(server_config(resolver))
    } else {
        None
    };

    let shutdown_rx = spawn_shutdown_watcher();

    let mut servers = Vec::new();

    for (port, slot) in slots {
        let tls = slot.tls;
        let state = Arc::new(SlotState {
            slot,
            acme: acme.clone(),
        });
        let app = build_app(state, port == 80, request_timeout);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut shutdown = shutdown_rx.clone();

        let tls_config = tls_config.clone();
        servers.push(tokio::spawn(async move {
            let tcp = TcpListener::bind(addr).await?;
            if tls {
                let config = tls_config.ok_or_else(|| {
                    Error::Tls("TLS slot started without a server config".to_string())
                })?;
                tracing::info!("start HTTPS on port {port}");
                axum::serve(
                    TlsListener::new(tcp, config),
                    app.into_make_service_with_connect_info::<crate::tls::RemoteAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            } else {
                tracing::info!("start HTTP on port {port}");
                axum::serve(
                    tcp,
                    app.into_make_service_with_connect_info::<crate::tls::RemoteAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            }
            Ok::<(), Error>(())
        }));
    }

    for server in servers {
        server
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))??;
    }

    tracing::info!("all listeners drained");
    Ok(())
}

fn build_app(
    state: Arc<SlotState>,
    serve_acme_challenges: bool,
    request_timeout: Duration,
) -> axum::Router {
    let mut app = axum::Router::new();
    if serve_acme_challenges {
        app = app.route(
            "/.well-known/acme-challenge/{token}",
            get(acme_challenge),
        );
    }
    app.fallback(dispatch)
        .with_state(state)
        // Stalled clients and unresponsive upstreams both land here: the
        // exchange is answered with 408 instead of pinning a connection.
        .layer(TimeoutLayer::new(request_timeout))
}

async fn acme_challenge(
    State(state): State<Arc<SlotState>>,
    Path(token): Path<String>,
) -> Response {
    match state.acme.challenge_response(&token) {
        Some(key_auth) => key_auth.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn dispatch(
    State(state): State<Arc<SlotState>>,
    ConnectInfo(remote): ConnectInfo<crate::tls::RemoteAddr>,
    mut req: Request,
) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();

    tracing::info!(
        "ACCESS {} {} {} {} {:?}",
        remote.0,
        req.method(),
        host,
        req.uri(),
        req.version()
    );

    req.extensions_mut().insert(OriginalHost(host.clone()));

    match state.slot.router.lookup(&host, req.uri().path()) {
        Some((handler, params)) => {
            req.extensions_mut().insert(params);
            handler.handle(req).await
        }
        None => text_response(StatusCode::NOT_FOUND, "404 page not found"),
    }
}

/// Broadcast channel that fires once when the process is asked to exit.
/// Every slot holds a receiver and drains its connections on the signal.
fn spawn_shutdown_watcher() -> watch::Receiver<()> {
    let (tx, rx) = watch::channel(());
    tokio::spawn(async move {
        let name = exit_signal().await;
        tracing::info!("{name} received, draining listeners");
        let _ = tx.send(());
    });
    rx
}

/// Resolve when SIGINT or SIGTERM arrives, naming the signal. If the
/// handlers cannot be installed the process simply runs until killed.
#[cfg(unix)]
async fn exit_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut interrupt), Ok(mut terminate)) => {
            tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            }
        }
        (interrupt, terminate) => {
            for err in [interrupt.err(), terminate.err()].into_iter().flatten() {
                tracing::error!("installing exit signal handler failed: {err}");
            }
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn exit_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "interrupt",
        Err(err) => {
            tracing::error!("installing ctrl-c handler failed: {err}");
            std::future::pending().await
        }
    }
}
