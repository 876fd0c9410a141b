//! Composition root: configuration → message bus → supervised sessions.

use crate::audio::{AudioSource, FfmpegSource};
use crate::config::{Config, DeviceConfig};
use crate::detect::{EnergyClassifier, ProcessWakeword, SharedSpeechClassifier, WakewordClassifier};
use crate::error::{MicwatchError, Result};
use crate::publish::{DeviceTopics, EventPublisher, MqttBus};
use crate::session::{SessionOptions, SessionSupervisor};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often ended sessions are collected.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Resolved devices, restricted to `only` when it is not empty.
///
/// Unknown ids in `only` are an error.
pub fn select_devices(config: &Config, only: &[String]) -> Result<Vec<DeviceConfig>> {
    let devices = config.device_configs();
    if only.is_empty() {
        return Ok(devices);
    }
    if let Some(unknown) = only.iter().find(|id| !devices.iter().any(|d| &d.id == *id)) {
        return Err(MicwatchError::ConfigInvalidValue {
            key: "--device".to_string(),
            message: format!("unknown device id '{unknown}'"),
        });
    }
    Ok(devices
        .into_iter()
        .filter(|d| only.contains(&d.id))
        .collect())
}

/// Human-readable summary of a validated configuration.
pub fn describe_config(config: &Config) -> String {
    let mut out = String::new();
    let mqtt = &config.mqtt;
    let _ = writeln!(
        out,
        "mqtt: {}:{} (client id {}, qos {})",
        mqtt.broker, mqtt.port, mqtt.client_id, mqtt.qos
    );
    let helper = if config.wakeword.command.is_empty() {
        "(not set)".to_string()
    } else {
        config.wakeword.command.join(" ")
    };
    let _ = writeln!(
        out,
        "wakeword: {} (keyword {}, sensitivity {})",
        helper, config.wakeword.keyword, config.wakeword.sensitivity
    );
    let _ = writeln!(out, "devices: {}", config.devices.len());

    for device in config.device_configs() {
        let topics = DeviceTopics::new(&mqtt.topics, &device.id);
        let vad = &device.vad;
        let _ = writeln!(out, "  {} ({})", device.id, device.name);
        let _ = writeln!(
            out,
            "    stream: rtsp://{}{}",
            device.address, config.stream.rtsp_path
        );
        let _ = writeln!(
            out,
            "    vad: threshold {} min_recording {}ms min_silence {}ms max_recording {}ms",
            vad.threshold,
            vad.min_recording_time_ms,
            vad.min_silence_duration_ms,
            vad.max_recording_time_ms
        );
        let _ = writeln!(
            out,
            "    topics: {} {} {} {}",
            topics.wakeword, topics.vad_start, topics.vad_stop, topics.status
        );
    }
    out
}

/// Runs every selected device until SIGINT/SIGTERM or until all sessions end.
pub async fn run_monitor(config: Config, only: Vec<String>) -> Result<()> {
    config.validate()?;
    if config.wakeword.command.is_empty() {
        return Err(MicwatchError::ConfigInvalidValue {
            key: "wakeword.command".to_string(),
            message: "must name the wakeword helper program".to_string(),
        });
    }
    let devices = select_devices(&config, &only)?;
    info!(
        version = %crate::version_string(),
        devices = devices.len(),
        "micwatch starting"
    );

    let bus = Arc::new(MqttBus::connect(&config.mqtt)?);
    let publisher = EventPublisher::from_config(bus.clone(), &config.mqtt);
    let vad = SharedSpeechClassifier::new(EnergyClassifier::default());
    let mut supervisor =
        SessionSupervisor::new(vad, publisher, SessionOptions::from(&config.stream));

    let stream = &config.stream;
    let wakeword = &config.wakeword;
    let started = tokio::task::block_in_place(|| {
        supervisor.start_all(
            &devices,
            |device| -> Result<Box<dyn AudioSource>> {
                Ok(Box::new(FfmpegSource::new(stream, device)))
            },
            |_| -> Result<Box<dyn WakewordClassifier>> {
                Ok(Box::new(ProcessWakeword::spawn(wakeword)?))
            },
        )
    });
    if let Err(e) = started {
        tokio::task::block_in_place(|| bus.disconnect());
        return Err(e);
    }

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    let mut reap = tokio::time::interval(REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = reap.tick() => {
                let ended = tokio::task::block_in_place(|| supervisor.reap());
                if !ended.is_empty() && supervisor.is_empty() {
                    error!("every session has ended");
                    break;
                }
            }
        }
    }

    tokio::task::block_in_place(|| {
        supervisor.stop_all();
        bus.disconnect();
    });
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for SIGINT");
            }
            info!("received SIGINT, shutting down");
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for SIGTERM");
            }
            info!("received SIGTERM, shutting down");
        }
    }
}

/// Wait for SIGTERM signal (used by systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| MicwatchError::Other(format!("Failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}
