use clap::Parser;
use kromi_signal::{router, AppState, Args, SignalHub};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn ws_signaling_url_for_bound_addr(bound_addr: SocketAddr) -> String {
    let host = if bound_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound_addr.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, bound_addr.port())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    args.check_public_bind_allowed()?;
    let rtc_config = args.rtc_config()?;
    if !rtc_config.has_relay_fallback() {
        tracing::warn!("no TURN server configured; viewers behind symmetric NAT will fail");
    }

    let hub = SignalHub::new();
    let app_state = AppState::new(hub.clone(), args.signal_limits(), rtc_config);

    let sweeper = hub.clone();
    let negotiation_timeout = args.negotiation_timeout();
    let sweep_interval = args.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let closed = sweeper.sweep_stalled(negotiation_timeout).await;
            if closed > 0 {
                tracing::info!("closed {} stalled negotiations", closed);
            }
        }
    });

    let app = router(app_state);

    let addr = args.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(addr.ip(), 0);
            tracing::warn!(
                "signal bind {} is already in use, falling back to {}",
                addr,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound_addr = listener.local_addr()?;
    let ws_signaling_url = std::env::var("WS_SIGNALING_URL")
        .unwrap_or_else(|_| ws_signaling_url_for_bound_addr(bound_addr));
    std::env::set_var("WS_SIGNALING_URL", ws_signaling_url.clone());
    tracing::info!("signal relay listening on {}", bound_addr);
    tracing::info!("signaling url {}", ws_signaling_url);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
