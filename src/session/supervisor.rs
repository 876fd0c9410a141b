//! Owns the sessions of every configured device.

use super::device::{DeviceSession, SessionContext, SessionOptions};
use crate::audio::AudioSource;
use crate::config::DeviceConfig;
use crate::detect::{SharedSpeechClassifier, WakewordClassifier};
use crate::error::{MicwatchError, Result};
use crate::publish::EventPublisher;
use crate::tracker::{Clock, SystemClock};
use std::thread;
use tracing::{error, info, warn};

/// Starts, watches and stops device sessions.
///
/// Devices are independent: one failing to start or ending early never
/// touches the others.
pub struct SessionSupervisor<C: Clock + Clone = SystemClock> {
    context: SessionContext<C>,
    sessions: Vec<DeviceSession>,
}

impl SessionSupervisor<SystemClock> {
    pub fn new(
        vad: SharedSpeechClassifier,
        publisher: EventPublisher,
        options: SessionOptions,
    ) -> Self {
        Self::with_clock(vad, publisher, options, SystemClock)
    }
}

impl<C: Clock + Clone + 'static> SessionSupervisor<C> {
    /// Creates a supervisor whose trackers read time from `clock`.
    pub fn with_clock(
        vad: SharedSpeechClassifier,
        publisher: EventPublisher,
        options: SessionOptions,
        clock: C,
    ) -> Self {
        Self {
            context: SessionContext {
                vad,
                publisher,
                options,
                clock,
            },
            sessions: Vec::new(),
        }
    }

    /// Starts one device session.
    pub fn start_device(
        &mut self,
        device: DeviceConfig,
        source: Box<dyn AudioSource>,
        wakeword: Box<dyn WakewordClassifier>,
    ) -> Result<()> {
        if self.session(&device.id).is_some() {
            return Err(MicwatchError::Session {
                device: device.id,
                message: "already running".to_string(),
            });
        }
        let session = DeviceSession::start(device, source, wakeword, &self.context)?;
        self.sessions.push(session);
        Ok(())
    }

    /// Starts a session for every device, skipping those that fail.
    ///
    /// Returns how many started; none starting is [`MicwatchError::NoSessions`].
    pub fn start_all<S, W>(
        &mut self,
        devices: &[DeviceConfig],
        mut make_source: S,
        mut make_wakeword: W,
    ) -> Result<usize>
    where
        S: FnMut(&DeviceConfig) -> Result<Box<dyn AudioSource>>,
        W: FnMut(&DeviceConfig) -> Result<Box<dyn WakewordClassifier>>,
    {
        let mut started = 0;
        for device in devices {
            let result = make_wakeword(device).and_then(|wakeword| {
                let source = make_source(device)?;
                self.start_device(device.clone(), source, wakeword)
            });
            match result {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(device = %device.id, error = %e, "device failed to start; skipping")
                }
            }
        }

        if started == 0 {
            return Err(MicwatchError::NoSessions);
        }
        info!(started, configured = devices.len(), "sessions running");
        Ok(started)
    }

    /// Removes sessions whose audio source ended, returning their device ids.
    pub fn reap(&mut self) -> Vec<String> {
        let (running, mut ended): (Vec<_>, Vec<_>) = self
            .sessions
            .drain(..)
            .partition(DeviceSession::is_running);
        self.sessions = running;

        ended
            .iter_mut()
            .map(|session| {
                warn!(device = %session.device().id, "session ended");
                session.stop();
                session.device().id.clone()
            })
            .collect()
    }

    /// Stops every session concurrently and waits for all of them.
    pub fn stop_all(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        info!(sessions = self.sessions.len(), "stopping sessions");
        thread::scope(|scope| {
            for session in self.sessions.iter_mut() {
                scope.spawn(move || session.stop());
            }
        });
        self.sessions.clear();
    }

    pub fn session(&self, device_id: &str) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.device().id == device_id)
    }

    /// Ids of sessions still running, in start order.
    pub fn running_devices(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.is_running())
            .map(|s| s.device().id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<C: Clock + Clone> Drop for SessionSupervisor<C> {
    fn drop(&mut self) {
        // Each session also stops itself on drop; stopping them here keeps
        // shutdown concurrent.
        if !self.sessions.is_empty() {
            thread::scope(|scope| {
                for session in self.sessions.iter_mut() {
                    scope.spawn(move || session.stop());
                }
            });
        }
    }
}
