//! Clock coordinator
//!
//! Fuses the time-reference service and the device-command server into
//! per-device sync-quality tracking and recording-session lifecycle. The
//! device and session tables are mutated only by the coordinator's ingest
//! and monitoring tasks; everyone else reads snapshots or listens on the
//! [`CoordinatorEvent`] channel.

mod events;

pub use events::CoordinatorEvent;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::{CommandKind, CommandParameters, WireMessage};
use crate::server::{CommandHandle, DeviceCommandServer, ServerEvent};
use crate::timeref::{Clock, TimeReferenceService};
use crate::types::{CoordinatorConfig, RecordingSession, SyncStatus, TimeServerStatus};

/// Map an observed offset to the synchronized flag and quality score
///
/// Quality is 1 at zero offset, falls linearly to 0 at the tolerance bound,
/// and is 0 beyond it.
#[must_use]
pub fn quality_from_offset(offset_ms: f64, tolerance_ms: f64) -> (bool, f64) {
    let magnitude = offset_ms.abs();
    if magnitude <= tolerance_ms {
        (true, (1.0 - magnitude / tolerance_ms).max(0.0))
    } else {
        (false, 0.0)
    }
}

/// State shared with the ingest and monitoring tasks
struct Shared {
    config: CoordinatorConfig,
    clock: Clock,
    commands: CommandHandle,
    devices: RwLock<HashMap<String, SyncStatus>>,
    sessions: RwLock<HashMap<String, RecordingSession>>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl Shared {
    /// Apply one server event to the device and session tables
    async fn ingest(&self, event: ServerEvent) {
        match event {
            ServerEvent::DeviceConnected {
                device_id, info, ..
            } => {
                let now = self.clock.now().await;
                self.devices.write().await.insert(
                    device_id.clone(),
                    SyncStatus::new(&device_id, info.device_type, now),
                );
                tracing::info!("device connected: {}", device_id);
                self.probe(&device_id).await;
            }
            ServerEvent::DeviceDisconnected { device_id, .. } => {
                self.devices.write().await.remove(&device_id);
                let mut sessions = self.sessions.write().await;
                for session in sessions.values_mut() {
                    session.devices.remove(&device_id);
                }
                tracing::info!("device disconnected: {}", device_id);
            }
            ServerEvent::Message { device_id, message } => {
                self.observe(&device_id, &message).await;
            }
            ServerEvent::CommandAcknowledged {
                device_id,
                latency_ms,
                ..
            } => {
                tracing::debug!("command to {} acknowledged in {:.1}ms", device_id, latency_ms);
            }
            ServerEvent::DeliveryFailed {
                device_id,
                command,
                attempts,
                ..
            } => {
                tracing::warn!(
                    "delivery of {} to {} failed after {} attempts",
                    command.as_str(),
                    device_id,
                    attempts
                );
            }
        }
    }

    /// Update a device's sync state from any timestamped message
    async fn observe(&self, device_id: &str, message: &WireMessage) {
        let now = self.clock.now().await;
        let mut devices = self.devices.write().await;
        let Some(status) = devices.get_mut(device_id) else {
            return;
        };

        let offset_ms = (now - message.timestamp()) * 1000.0;
        let (synchronized, quality) =
            quality_from_offset(offset_ms, self.config.sync_tolerance_ms);
        status.time_offset_ms = offset_ms;
        status.last_sync_time = now;
        status.is_synchronized = synchronized;
        status.sync_quality = quality;

        match message {
            WireMessage::Status {
                recording,
                frame_count,
                ..
            } => {
                status.recording_active = *recording;
                if let Some(frame_count) = frame_count {
                    status.frame_count = *frame_count;
                }
            }
            WireMessage::Frame { .. } => {
                status.frame_count += 1;
            }
            _ => {}
        }

        tracing::debug!(
            "device {} sync update: offset {:.1}ms, quality {:.2}",
            device_id,
            offset_ms,
            quality
        );
    }

    /// Send a sync probe stamped with the master clock
    async fn probe(&self, device_id: &str) {
        let timestamp = self.clock.now().await;
        match self
            .commands
            .send_message(device_id, WireMessage::SyncTimestamp { timestamp })
            .await
        {
            Ok(()) => tracing::debug!("sync probe sent to {}", device_id),
            Err(e) => tracing::warn!("failed to send sync probe to {}: {}", device_id, e),
        }
    }

    /// One monitoring pass: re-probe stale devices, refresh session quality,
    /// publish a snapshot
    async fn monitor_tick(&self) {
        let now = self.clock.now().await;
        let stale_after = 2.0 * self.config.sync_interval.as_secs_f64();

        let stale: Vec<String> = {
            let devices = self.devices.read().await;
            devices
                .values()
                .filter(|status| now - status.last_sync_time > stale_after)
                .map(|status| status.device_id.clone())
                .collect()
        };
        for device_id in stale {
            tracing::warn!("device {} sync timeout, re-initiating", device_id);
            self.probe(&device_id).await;
        }

        {
            let devices = self.devices.read().await;
            let mut sessions = self.sessions.write().await;
            for session in sessions.values_mut().filter(|s| s.is_active) {
                let qualities: Vec<f64> = session
                    .devices
                    .iter()
                    .filter_map(|id| devices.get(id).map(|status| status.sync_quality))
                    .collect();
                session.sync_quality = if qualities.is_empty() {
                    0.0
                } else {
                    qualities.iter().sum::<f64>() / qualities.len() as f64
                };
            }
        }

        let snapshot = self.devices.read().await.clone();
        let _ = self
            .event_tx
            .send(CoordinatorEvent::SyncSnapshot { devices: snapshot });
    }
}

/// Coordinates time synchronization and synchronized recording across the
/// connected device fleet
pub struct ClockCoordinator {
    shared: Arc<Shared>,
    time_service: TimeReferenceService,
    server: DeviceCommandServer,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClockCoordinator {
    /// Create a stopped coordinator owning both services
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        let time_service = TimeReferenceService::new(config.time_service.clone());
        let server = DeviceCommandServer::new(config.command_server.clone());
        let (event_tx, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(Shared {
                clock: time_service.clock(),
                commands: server.handle(),
                config,
                devices: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                event_tx,
            }),
            time_service,
            server,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Subscribe to coordinator events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Handle to the corrected master clock
    #[must_use]
    pub fn clock(&self) -> Clock {
        self.shared.clock.clone()
    }

    /// Handle for direct device commands and statistics
    #[must_use]
    pub fn command_handle(&self) -> CommandHandle {
        self.shared.commands.clone()
    }

    /// Port the time-sync endpoint is listening on, once started
    #[must_use]
    pub fn time_port(&self) -> Option<u16> {
        self.time_service.port()
    }

    /// Port the device-command server is listening on, once started
    #[must_use]
    pub fn command_port(&self) -> Option<u16> {
        self.server.port()
    }

    /// Whether the coordinator is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Start both services, the ingest task and the monitoring loop
    ///
    /// # Errors
    /// Returns `SyncError::AlreadyRunning` if already started, or the first
    /// service start failure (the time service is rolled back if the command
    /// server fails to start).
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.shutdown_tx.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        tracing::info!("starting clock synchronization system");

        self.time_service.start().await?;
        if let Err(e) = self.server.start().await {
            self.time_service.stop().await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let shared = self.shared.clone();
        let mut events = self.server.subscribe();
        let mut ingest_shutdown = shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => shared.ingest(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("coordinator ingest lagged, missed {} events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ingest_shutdown.changed() => break,
                }
            }
        }));

        let shared = self.shared.clone();
        let mut monitor_shutdown = shutdown_rx;
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.config.sync_interval);
            // The first tick fires immediately; skip it so probes have a
            // chance to be answered before staleness checks run.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => shared.monitor_tick().await,
                    _ = monitor_shutdown.changed() => break,
                }
            }
        }));

        tracing::info!("clock synchronization system started");
        Ok(())
    }

    /// Stop every active session, both services, and all owned tasks
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        tracing::info!("stopping clock synchronization system");

        let active: Vec<String> = {
            let sessions = self.shared.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_active)
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in active {
            if let Err(e) = self.stop_synchronized_recording(&session_id).await {
                tracing::error!("failed to stop session {}: {}", session_id, e);
            }
        }

        let _ = shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.server.stop().await;
        self.time_service.stop().await;
        tracing::info!("clock synchronization system stopped");
    }

    /// Start a synchronized recording across the target devices
    ///
    /// One master timestamp is stamped before any command is sent, so every
    /// device receives the same nominal start instant. Start commands go to
    /// Android devices over the command channel; webcam-type devices align
    /// to the [`CoordinatorEvent::WebcamSync`] tick instead.
    ///
    /// # Errors
    /// Returns `SessionAlreadyActive` for a duplicate session ID and
    /// `NoTargetDevices` when the resolved device list is empty; neither
    /// mutates any state.
    pub async fn start_synchronized_recording(
        &self,
        session_id: &str,
        target_devices: Option<Vec<String>>,
        record_video: bool,
        record_thermal: bool,
        record_shimmer: bool,
    ) -> Result<(), SyncError> {
        let shared = &self.shared;

        let (master_timestamp, android_targets, session) = {
            let devices = shared.devices.read().await;
            let mut sessions = shared.sessions.write().await;

            if sessions.contains_key(session_id) {
                return Err(SyncError::SessionAlreadyActive {
                    session_id: session_id.to_string(),
                });
            }

            let targets: Vec<String> = match target_devices {
                Some(requested) => {
                    let (known, unknown): (Vec<String>, Vec<String>) = requested
                        .into_iter()
                        .partition(|id| devices.contains_key(id));
                    if !unknown.is_empty() {
                        tracing::warn!("ignoring unknown target devices: {:?}", unknown);
                    }
                    known
                }
                None => devices.keys().cloned().collect(),
            };
            if targets.is_empty() {
                return Err(SyncError::NoTargetDevices);
            }

            let poor: Vec<&String> = targets
                .iter()
                .filter(|id| {
                    devices
                        .get(*id)
                        .is_some_and(|s| s.sync_quality < shared.config.quality_threshold)
                })
                .collect();
            if !poor.is_empty() {
                tracing::warn!("devices with poor sync quality: {:?}", poor);
            }

            let master_timestamp = shared.clock.now().await;
            let android_targets: Vec<String> = targets
                .iter()
                .filter(|id| {
                    devices
                        .get(*id)
                        .is_some_and(|s| s.device_type.commands_over_network())
                })
                .cloned()
                .collect();

            let session = RecordingSession::new(
                session_id,
                master_timestamp,
                targets.into_iter().collect(),
            );
            sessions.insert(session_id.to_string(), session.clone());
            (master_timestamp, android_targets, session)
        };

        for device_id in &android_targets {
            let parameters = CommandParameters::for_session(
                session_id,
                record_video,
                record_thermal,
                record_shimmer,
            );
            match shared
                .commands
                .send_command(device_id, CommandKind::StartRecord, parameters, true)
                .await
            {
                Ok(_) => tracing::info!("start recording command sent to {}", device_id),
                Err(e) => {
                    tracing::error!("failed to send start command to {}: {}", device_id, e);
                }
            }
        }

        let _ = shared
            .event_tx
            .send(CoordinatorEvent::WebcamSync { master_timestamp });
        let _ = shared
            .event_tx
            .send(CoordinatorEvent::SessionStarted { session });

        tracing::info!(
            "synchronized recording started: session {} at {:.3}",
            session_id,
            master_timestamp
        );
        Ok(())
    }

    /// Stop a synchronized recording
    ///
    /// Stopping an already-inactive session logs and succeeds without
    /// resending commands. A session whose member set has emptied is closed
    /// normally with the per-device commands skipped.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session ID.
    pub async fn stop_synchronized_recording(&self, session_id: &str) -> Result<(), SyncError> {
        let shared = &self.shared;

        let (android_members, duration_secs) = {
            let devices = shared.devices.read().await;
            let mut sessions = shared.sessions.write().await;

            let Some(session) = sessions.get_mut(session_id) else {
                return Err(SyncError::SessionNotFound {
                    session_id: session_id.to_string(),
                });
            };
            if !session.is_active {
                tracing::warn!("session {} already stopped", session_id);
                return Ok(());
            }

            let master_timestamp = shared.clock.now().await;
            let android_members: Vec<String> = session
                .devices
                .iter()
                .filter(|id| {
                    devices
                        .get(*id)
                        .is_some_and(|s| s.device_type.commands_over_network())
                })
                .cloned()
                .collect();

            session.is_active = false;
            (android_members, session.duration_secs(master_timestamp))
        };

        for device_id in &android_members {
            let parameters = CommandParameters {
                session_id: Some(session_id.to_string()),
                ..CommandParameters::default()
            };
            match shared
                .commands
                .send_command(device_id, CommandKind::StopRecord, parameters, true)
                .await
            {
                Ok(_) => tracing::info!("stop recording command sent to {}", device_id),
                Err(e) => {
                    tracing::error!("failed to send stop command to {}: {}", device_id, e);
                }
            }
        }

        let _ = shared.event_tx.send(CoordinatorEvent::SessionStopped {
            session_id: session_id.to_string(),
            duration_secs,
        });

        tracing::info!(
            "synchronized recording stopped: session {}, duration {:.1}s",
            session_id,
            duration_secs
        );
        Ok(())
    }

    /// Snapshot of every connected device's sync state
    pub async fn get_connected_devices(&self) -> HashMap<String, SyncStatus> {
        self.shared.devices.read().await.clone()
    }

    /// Snapshot of every known recording session
    pub async fn get_active_sessions(&self) -> HashMap<String, RecordingSession> {
        self.shared.sessions.read().await.clone()
    }

    /// Snapshot of the time-reference service state
    pub async fn time_server_status(&self) -> TimeServerStatus {
        self.time_service.status().await
    }
}

#[cfg(test)]
mod tests;
