mod cli;
mod config;
mod tls;
mod web;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gatehouse_core::transport::udp::UdpTransportFactory;
use gatehouse_core::{Gateway, PluginHost};
use gatehouse_videocall::VideoCallPlugin;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();

    // Load configuration and fold in the CLI overrides
    let mut config = config::load_config(&args.config)?;
    args.apply(&mut config);

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let interface: IpAddr = config
        .general
        .interface
        .parse()
        .with_context(|| format!("Invalid interface address '{}'", config.general.interface))?;
    let public_ip: Option<IpAddr> = match &config.nat.public_ip {
        Some(ip) => Some(ip.parse().context("Invalid public_ip")?),
        None => None,
    };
    if let Some(stun) = &config.nat.stun_server {
        tracing::info!(
            "STUN server configured: {stun}:{} (reflexive candidates are resolved by the media layer)",
            config.nat.stun_port
        );
    }

    // The TLS certificate also supplies the DTLS fingerprint merged into
    // outbound SDP, so it is needed even when the HTTPS listener is off.
    let tls_material = tls::load_or_generate(
        config.certificates.cert_pem.as_deref(),
        config.certificates.cert_key.as_deref(),
        &config.general.configs_folder,
    )?;

    // Global stop flag: every cooperative loop watches this.
    let (stop_tx, stop_rx) = watch::channel(false);

    // Plugin host with the built-in plugin set
    let mut host = PluginHost::new();
    host.register(VideoCallPlugin::new())
        .context("Failed to register the videocall plugin")?;

    let transports = Arc::new(UdpTransportFactory::new(
        interface,
        public_ip,
        config.rtp_port_range(),
        tls_material.fingerprint.clone(),
    ));

    let gateway = Gateway::new(host, transports, stop_rx.clone());
    gateway
        .start(Path::new(&config.general.plugins_folder))
        .await
        .context("Plugin startup failed")?;

    // Build the dispatcher router
    let state = Arc::new(AppState {
        gateway: Arc::clone(&gateway),
        base_path: config.webserver.base_path.clone(),
    });
    let app = web::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::DEBUG,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let mut listeners = Vec::new();

    if config.webserver.http {
        let bind_addr = SocketAddr::new(interface, config.webserver.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener to {bind_addr}"))?;
        tracing::info!(
            "Control endpoint on http://{bind_addr}{}",
            config.webserver.base_path
        );

        let app = app.clone();
        let mut stop = stop_rx.clone();
        listeners.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("HTTP listener failed: {e}");
            }
        }));
    }

    if config.webserver.https {
        let bind_addr = SocketAddr::new(interface, config.webserver.secure_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener to {bind_addr}"))?;
        tracing::info!(
            "Secure control endpoint on https://{bind_addr}{}",
            config.webserver.base_path
        );

        let acceptor = tls::make_acceptor(tls_material.server_config.clone());
        let app = app.clone();
        let mut stop = stop_rx.clone();
        listeners.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let (stream, peer_addr) = match result {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!("Failed to accept TCP connection: {e}");
                                continue;
                            }
                        };
                        let acceptor = acceptor.clone();
                        let app = app.clone();
                        tokio::spawn(async move {
                            // TLS handshake timeout (10 seconds)
                            let tls_stream = match tokio::time::timeout(
                                std::time::Duration::from_secs(10),
                                acceptor.accept(stream),
                            ).await {
                                Ok(Ok(stream)) => stream,
                                Ok(Err(e)) => {
                                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };

                            let io = hyper_util::rt::TokioIo::new(tls_stream);
                            let service = hyper_util::service::TowerToHyperService::new(app);
                            let builder = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            );
                            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                                tracing::debug!(%peer_addr, "Connection error: {e}");
                            }
                        });
                    }
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
        }));
    }

    tracing::info!("{} ready", gatehouse_core::gateway::SERVER_NAME);

    // SIGINT counting: first one starts the graceful shutdown, the third
    // forces the process out.
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            let mut received = 0u32;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                received += 1;
                match received {
                    1 => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                        let _ = stop_tx.send(true);
                    }
                    2 => tracing::warn!("Shutdown in progress; one more SIGINT forces exit"),
                    _ => {
                        tracing::error!("Forced exit");
                        std::process::exit(1);
                    }
                }
            }
        });
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut stop_wait = stop_rx.clone();
    tokio::select! {
        _ = stop_wait.wait_for(|stopped| *stopped) => {}
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
            let _ = stop_tx.send(true);
        }
    }

    // Drain listeners, then tear down sessions and plugins.
    for listener in listeners {
        let _ = listener.await;
    }
    gateway.shutdown().await;

    tracing::info!("Gatehouse shut down cleanly");
    Ok(())
}
