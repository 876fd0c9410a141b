//! Event publishing to the message bus.
//!
//! Delivery is fire-and-forget: a failed publish is logged and dropped, and
//! never reaches the tracker.

use crate::config::{MqttConfig, TopicTemplates};
use crate::defaults::DEVICE_ID_PLACEHOLDER;
use crate::error::{MicwatchError, Result};
use crate::tracker::EndReason;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Payload sent to the wakeword topic on detection.
pub const WAKE_PAYLOAD: &str = "DETECTED";
/// Payload sent to the recording-start topic on detection.
pub const RECORDING_PAYLOAD: &str = "RECORDING";
/// Payload sent to the recording-stop topic, for silence and timeout alike.
pub const SILENCE_PAYLOAD: &str = "SILENCE";
pub const ONLINE_PAYLOAD: &str = "online";
pub const OFFLINE_PAYLOAD: &str = "offline";

/// Trait for message bus clients.
///
/// This trait allows swapping implementations (MQTT vs in-memory recorder).
pub trait MessageBus: Send + Sync {
    /// Hands one message to the bus. Must not block on network I/O.
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> Result<()>;
}

/// Replaces `{device_id}` in a topic template.
pub fn render_topic(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_ID_PLACEHOLDER, device_id)
}

/// Topics of one device, rendered from the templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub wakeword: String,
    pub vad_start: String,
    pub vad_stop: String,
    pub status: String,
}

impl DeviceTopics {
    pub fn new(templates: &TopicTemplates, device_id: &str) -> Self {
        Self {
            wakeword: render_topic(&templates.wakeword, device_id),
            vad_start: render_topic(&templates.vad_start, device_id),
            vad_stop: render_topic(&templates.vad_stop, device_id),
            status: render_topic(&templates.status, device_id),
        }
    }
}

/// Publishes session events on device-scoped topics.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    templates: TopicTemplates,
    qos: u8,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, templates: TopicTemplates, qos: u8) -> Self {
        Self {
            bus,
            templates,
            qos,
        }
    }

    /// Publisher using the topics and delivery quality of an MQTT section.
    pub fn from_config(bus: Arc<dyn MessageBus>, config: &MqttConfig) -> Self {
        Self::new(bus, config.topics.clone(), config.qos)
    }

    pub fn topics(&self, device_id: &str) -> DeviceTopics {
        DeviceTopics::new(&self.templates, device_id)
    }

    pub fn qos(&self) -> u8 {
        self.qos
    }

    /// Wake detected: `DETECTED` on the wakeword topic, `RECORDING` on the
    /// recording-start topic.
    pub fn publish_wake(&self, device_id: &str) {
        let topics = self.topics(device_id);
        self.send(&topics.wakeword, WAKE_PAYLOAD, false);
        self.send(&topics.vad_start, RECORDING_PAYLOAD, false);
    }

    /// Recording ended. The stop payload is the same for both reasons.
    pub fn publish_silence(&self, device_id: &str, reason: EndReason) {
        let topics = self.topics(device_id);
        debug!(device = device_id, %reason, "publishing recording stop");
        self.send(&topics.vad_stop, SILENCE_PAYLOAD, false);
    }

    /// Retained session status.
    pub fn publish_status(&self, device_id: &str, online: bool) {
        let topics = self.topics(device_id);
        let payload = if online {
            ONLINE_PAYLOAD
        } else {
            OFFLINE_PAYLOAD
        };
        self.send(&topics.status, payload, true);
    }

    fn send(&self, topic: &str, payload: &str, retain: bool) {
        if let Err(e) = self.bus.publish(topic, payload, self.qos, retain) {
            warn!(topic, payload, error = %e, "publish failed; event dropped");
        }
    }
}

/// A message captured by [`RecordingBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// In-memory bus that records every publish (for tests and dry runs).
#[derive(Debug, Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<Published>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail (messages are not recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Messages published to `topic`, in order.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }

    /// Polls until `predicate` holds for the recorded messages or `timeout` passes.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[Published]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.messages()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MicwatchError::Publish {
                topic: topic.to_string(),
                message: "bus unavailable".to_string(),
            });
        }
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Published {
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos,
                retain,
            });
        Ok(())
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::MessageBus;
    use crate::config::MqttConfig;
    use crate::error::{MicwatchError, Result};
    use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use tracing::{debug, info, warn};

    /// Outgoing requests queued in the client before `try_publish` fails.
    const REQUEST_CAPACITY: usize = 64;
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);
    const MIN_KEEP_ALIVE_SECS: u64 = 5;

    fn qos_level(qos: u8) -> QoS {
        match qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    /// MQTT client driven by a background event-loop thread.
    pub struct MqttBus {
        client: Mutex<Client>,
        shutdown: Arc<AtomicBool>,
        event_loop: Mutex<Option<JoinHandle<()>>>,
    }

    impl MqttBus {
        /// Creates the client and starts its event loop.
        ///
        /// The broker connection is established in the background and
        /// re-established after failures.
        pub fn connect(config: &MqttConfig) -> Result<Self> {
            if config.broker.trim().is_empty() {
                return Err(MicwatchError::BusConnection {
                    message: "mqtt.broker is empty".to_string(),
                });
            }

            let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
            options.set_keep_alive(Duration::from_secs(
                config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
            ));
            if let Some(username) = &config.username {
                options.set_credentials(username, config.password.as_deref().unwrap_or(""));
            }

            let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
            let shutdown = Arc::new(AtomicBool::new(false));
            let broker = format!("{}:{}", config.broker, config.port);

            let stop = shutdown.clone();
            let event_loop = thread::Builder::new()
                .name("mqtt-event-loop".to_string())
                .spawn(move || {
                    for notification in connection.iter() {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!(%broker, "connected to MQTT broker");
                            }
                            Ok(event) => debug!(?event, "mqtt event"),
                            Err(e) => {
                                warn!(%broker, error = %e, "MQTT connection error, retrying");
                                thread::sleep(RECONNECT_DELAY);
                            }
                        }
                    }
                    debug!("mqtt event loop exited");
                })?;

            Ok(Self {
                client: Mutex::new(client),
                shutdown,
                event_loop: Mutex::new(Some(event_loop)),
            })
        }

        /// Sends a disconnect and stops the event loop.
        pub fn disconnect(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
            {
                let client = self.client.lock().unwrap_or_else(|p| p.into_inner());
                if let Err(e) = client.try_disconnect() {
                    debug!(error = %e, "mqtt disconnect request failed");
                }
            }
            let handle = self
                .event_loop
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            if let Some(handle) = handle {
                // The loop only notices the flag on its next notification.
                let deadline = Instant::now() + Duration::from_secs(2);
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(20));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                }
            }
        }
    }

    impl MessageBus for MqttBus {
        fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> Result<()> {
            let client = self.client.lock().unwrap_or_else(|p| p.into_inner());
            client
                .try_publish(topic, qos_level(qos), retain, payload.as_bytes().to_vec())
                .map_err(|e| MicwatchError::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })
        }
    }

}
