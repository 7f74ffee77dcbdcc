use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use game_master::config::{Config, GameRules};
use game_master::identity::HttpIdentityVerifier;
use game_master::rpc::AppState;
use game_master::session_manager::SessionManager;
use game_master::ship_map::DEFAULT_SHIP_MAP;
use game_master::task_catalog::DEFAULT_TASK_CATALOG;
use game_master::{http as game_http, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    let bind_addr: SocketAddr = config.bind_addr.parse()?;

    let rules = GameRules::from(&config);
    let identity = Arc::new(HttpIdentityVerifier::new(
        config.registry_url.clone(),
        Duration::from_secs(config.registry_cache_ttl_secs),
    ));
    let sessions = SessionManager::new(rules, &DEFAULT_SHIP_MAP, &DEFAULT_TASK_CATALOG, false);
    let state = Arc::new(AppState::new(sessions, identity, config.dev_mode));

    spawn_reaper(state.clone(), Duration::from_secs(config.session_grace_secs));
    spawn_timer_sweep(state.clone());

    info!("(main) game-master listening on {} (dev_mode={})", bind_addr, config.dev_mode);
    println!("game-master listening on {bind_addr}");

    let listener = TcpListener::bind(bind_addr).await?;
    let bind_addr_str = config.bind_addr.clone();

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();
        let bind_addr_str = bind_addr_str.clone();

        tokio::task::spawn(async move {
            let handler = move |req| {
                let state = state.clone();
                let bind_addr_str = bind_addr_str.clone();
                async move { game_http::serve(state, bind_addr_str, req).await }
            };
            if let Err(err) = http1::Builder::new().serve_connection(io, service_fn(handler)).await {
                game_master::warn!("(main) connection error: {:?}", err);
            }
        });
    }
}

/// Background janitor: periodically removes sessions that have been Ended
/// past their configured grace period (spec §4.6 `reap_ended`).
fn spawn_reaper(state: Arc<AppState>, grace: Duration) {
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            state.sessions.reap_ended(grace);
        }
    });
}

/// Drives Discussion -> Voting -> resolved transitions once their deadline
/// elapses (spec §4.5 timers), without a spawned task per meeting.
fn spawn_timer_sweep(state: Arc<AppState>) {
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            state.sessions.tick_all(&state.hub);
        }
    });
}
