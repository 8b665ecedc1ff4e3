use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

mod chat;
mod config;
mod context;
mod directors;
mod infractions;
mod locale;
mod net;
mod otp;
mod protohelp;
mod records;
mod registry;
mod relay;
mod rooms;
mod scheduler;
mod tracker;

use config::Config;
use context::ServerContext;
use directors::lobby::LobbyDirector;
use directors::race::RaceDirector;
use directors::ranch::RanchDirector;
use infractions::InfractionSystem;
use net::CommandServer;
use records::{DataDirector, JsonStore};
use registry::CourseRegistry;

/// Director tick interval. Stage timeouts are observed within one of these.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,canterd=info".into()),
        )
        .with_target(false)
        .init();

    let config = Config::load_default()?;

    let store = Arc::new(JsonStore::load(&config.data_dir));
    let data = DataDirector::new(store);
    let registry = CourseRegistry::load(config.registry_dir.as_deref())?;
    let infractions = InfractionSystem::load(&config.data_dir.join("punishments.json"));

    let relay_addr = SocketAddr::from((config.relay.address, config.relay.port));
    let lobby_addr = SocketAddr::from((config.lobby.listen.address, config.lobby.listen.port));
    let ranch_addr = SocketAddr::from((config.ranch.listen.address, config.ranch.listen.port));
    let race_addr = SocketAddr::from((config.race.listen.address, config.race.listen.port));

    let ctx = ServerContext::new(config, data, registry, infractions);

    let lobby_server = CommandServer::new("lobby");
    let ranch_server = CommandServer::new("ranch");
    let race_server = CommandServer::new("race");

    let lobby = LobbyDirector::new(ctx.clone(), lobby_server.clone());
    let ranch = RanchDirector::new(ctx.clone(), ranch_server.clone());
    let race = RaceDirector::new(ctx.clone(), race_server.clone());
    lobby.set_ranch_director(ranch.clone());

    lobby_server.set_event_handler(lobby.clone());
    ranch_server.set_event_handler(ranch.clone());
    race_server.set_event_handler(race.clone());

    lobby_server.begin_host(lobby_addr).await?;
    ranch_server.begin_host(ranch_addr).await?;
    race_server.begin_host(race_addr).await?;

    tokio::spawn(async move {
        if let Err(e) = relay::run_relay(relay_addr).await {
            tracing::error!(err = %e, "relay failed");
        }
    });

    {
        let lobby = lobby.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                lobby.tick();
            }
        });
    }
    {
        let race = race.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                race.tick();
            }
        });
    }

    info!("canterd is up");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    lobby_server.end_host();
    ranch_server.end_host();
    race_server.end_host();
    Ok(())
}
