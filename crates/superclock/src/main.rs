mod backlight;
mod bus;
mod clock;
mod config;
mod dispatch;
mod heartbeat;
mod mqtt;
mod render;
mod scheduler;
mod store;
mod widget;

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backlight::Dimmer;
use bus::BusClient;
use clock::LocalClock;
use heartbeat::{Announcer, SystemProbe};
use render::{HeadlessBackend, RenderBackend, SetupError};
use scheduler::RenderScheduler;
use store::TelemetryStore;

fn main() -> ExitCode {
    // Must happen while the process is still single-threaded.
    let clock = LocalClock::capture();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("can't start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(clock)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.exit_code(), "setup failed: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(clock: LocalClock) -> Result<(), SetupError> {
    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "superclock.toml".to_string());
    let cfg = config::load(&config_path).map_err(SetupError::Config)?;

    // ── Display & backlight ─────────────────────────────────────────
    let mut backend = HeadlessBackend::open(&cfg.display)?;
    let dimmer = Dimmer::new(backlight::open(&cfg.backlight), &cfg.backlight);

    // ── Telemetry pipeline ──────────────────────────────────────────
    let node = cfg
        .mqtt
        .node
        .clone()
        .or_else(System::host_name)
        .unwrap_or_default();
    let store = TelemetryStore::shared();
    let table = cfg.topics.dispatch_table();
    info!(%node, topics = table.len(), "superclock starting");

    let bus = BusClient::connect(
        &cfg.mqtt,
        &node,
        table,
        Arc::clone(&store),
        SystemProbe::new(cfg.heartbeat.thermal_zone),
        clock,
    );

    let shutdown = CancellationToken::new();

    let announcer = Announcer::new(bus.publisher(), &cfg.heartbeat, clock, dimmer.level_handle());
    let heartbeat = tokio::spawn(announcer.run(shutdown.clone()));

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    // ── Render loop (until Quit or interrupt) ───────────────────────
    let (width, height) = backend.output_size();
    let scheduler = RenderScheduler::new(
        widget::layout(width, height, &cfg.power_off),
        dimmer,
        cfg.display.idle_after(),
        clock,
    );
    scheduler
        .run(
            store,
            &mut backend,
            bus.publisher(),
            cfg.display.tick(),
            shutdown.clone(),
        )
        .await;

    // ── Teardown ────────────────────────────────────────────────────
    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        warn!("heartbeat task ended abnormally: {e}");
    }
    bus.shutdown().await;

    info!(
        frames = backend.frames(),
        leaked_visuals = backend.live_visuals(),
        "superclock stopped"
    );
    Ok(())
}
