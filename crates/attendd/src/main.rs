use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod coordinator;
mod dbus_interface;
mod engine;
mod gallery;

use config::Config;
use coordinator::{CoordinatorSettings, FaceObservation, RejectReason, SignInCoordinator, SignInOutcome};
use dbus_interface::AttendService;
use engine::{spawn_engine, EngineConfig};
use gallery::Gallery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");
    let config = Config::from_env();

    let store = attend_store::Store::open(&config.db_path, &config.key_path)
        .await
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    store.normalize_stored_cards().await?;

    let gallery = Arc::new(Gallery::new());
    let count = gallery.reload(&store).await?;
    tracing::info!(identities = count, "gallery loaded");

    // Capacity 1: at most one observation waits while the coordinator
    // works; the engine drops the rest.
    let (obs_tx, obs_rx) = mpsc::channel(1);
    let engine = spawn_engine(
        EngineConfig {
            camera_device: config.camera_device.clone(),
            camera_width: config.camera_width,
            camera_height: config.camera_height,
            warmup_frames: config.warmup_frames,
            min_match_interval_ms: config.min_match_interval_ms,
        },
        &config.embed_model_path(),
        obs_tx,
    )
    .context("failed to start capture engine")?;

    let (tag_tx, tag_rx) = mpsc::channel(32);
    attend_hw::TagReader::new(&config.tag_device)
        .spawn(tag_tx)
        .await
        .with_context(|| format!("failed to open tag reader at {}", config.tag_device))?;

    let (expire_tx, expire_rx) = mpsc::channel(8);
    let coordinator = SignInCoordinator::new(
        store.clone(),
        gallery.clone(),
        CoordinatorSettings {
            match_threshold: config.match_threshold,
            strict_threshold: config.strict_threshold,
            pairing_window_ms: config.pairing_window_ms,
            duplicate_window_ms: config.duplicate_window_ms,
        },
        expire_tx,
    );
    tokio::spawn(run_loop(coordinator, obs_rx, tag_rx, expire_rx));

    let service = AttendService {
        store,
        gallery,
        engine,
        export_dir: config.export_dir.clone(),
        frames_per_enroll: config.frames_per_enroll,
        started_at_ms: attend_core::now_ms(),
    };
    let builder = if config.use_system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name("org.freedesktop.Attend1")?
        .serve_at("/org/freedesktop/Attend1", service)?
        .build()
        .await
        .context("failed to claim bus name org.freedesktop.Attend1")?;

    tracing::info!("attendd ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");
    Ok(())
}

/// Event loop driving the coordinator. Tag events pass through a bounded
/// recent-events queue so a burst of taps resolves to the newest one.
async fn run_loop(
    mut coordinator: SignInCoordinator,
    mut obs_rx: mpsc::Receiver<FaceObservation>,
    mut tag_rx: mpsc::Receiver<attend_hw::TagEvent>,
    mut expire_rx: mpsc::Receiver<u64>,
) {
    let mut tag_queue = attend_hw::TagQueue::new();
    loop {
        tokio::select! {
            obs = obs_rx.recv() => {
                let Some(obs) = obs else { break };
                let outcome = coordinator.on_face(obs).await;
                report(outcome.as_ref());
            }
            event = tag_rx.recv() => {
                let Some(event) = event else { break };
                tag_queue.push(event);
                while let Ok(event) = tag_rx.try_recv() {
                    tag_queue.push(event);
                }
                if let Some(latest) = tag_queue.pop_latest() {
                    let outcome = coordinator.on_tag(latest).await;
                    report(outcome.as_ref());
                }
            }
            generation = expire_rx.recv() => {
                let Some(generation) = generation else { break };
                report(coordinator.on_expired(generation).as_ref());
            }
        }
    }
    tracing::info!("event loop stopped");
}

fn report(outcome: Option<&SignInOutcome>) {
    let Some(outcome) = outcome else { return };
    match outcome {
        SignInOutcome::Recorded {
            name, timestamp_ms, ..
        } => {
            tracing::info!("{name} signed in at {}", format_ms(*timestamp_ms));
        }
        SignInOutcome::Rejected(reason) => match reason {
            RejectReason::Duplicate { last_seen_ms, .. } => {
                tracing::info!("already signed in at {}", format_ms(*last_seen_ms));
            }
            RejectReason::OwnedByOther { card, owner } => {
                tracing::warn!("card {card} belongs to {owner}");
            }
            RejectReason::WrongCard { expected, got } => {
                tracing::warn!("card {got} tapped, expected {expected}");
            }
            RejectReason::CardNotRecognized { card } => {
                tracing::warn!("card {card} is not enrolled");
            }
            RejectReason::Timeout => {
                tracing::info!("sign-in timed out waiting for the other half");
            }
            RejectReason::StoreUnavailable => {
                tracing::error!("sign-in dropped; storage unavailable");
            }
        },
    }
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}
