//! Pending-acknowledgment tracking and bounded retry
//!
//! Every acknowledged command gets one entry here; a single sweeper task
//! drives all deadlines, so retries never spawn per-message timers. An entry
//! always terminates: resolved by an acknowledgment, exhausted after
//! `max_attempts` sends, or dropped with its device.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{CommandKind, CommandParameters};

/// A command awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Correlation ID shared with the wire message
    pub message_id: String,
    /// Target device
    pub device_id: String,
    /// The command being delivered
    pub command: CommandKind,
    /// Parameters to repeat on retry
    pub parameters: CommandParameters,
    /// Sends so far (1 after the initial send)
    pub attempts: u32,
    /// Total sends allowed
    pub max_attempts: u32,
    /// When the current attempt was sent
    pub sent_at: Instant,
    /// When the current attempt times out
    pub deadline: Instant,
}

/// Sweep outcome: entries to resend and entries that exhausted their retries
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Entries re-armed for another attempt; send each with `retry_attempt`
    pub retries: Vec<PendingCommand>,
    /// Entries removed after the final attempt timed out
    pub exhausted: Vec<PendingCommand>,
}

/// Table of commands awaiting acknowledgment
#[derive(Debug)]
pub struct PendingAcks {
    entries: HashMap<String, PendingCommand>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl PendingAcks {
    /// Create an empty table with the given retry policy
    #[must_use]
    pub fn new(ack_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            entries: HashMap::new(),
            ack_timeout,
            max_attempts,
        }
    }

    /// Register a freshly sent command (attempt 1)
    pub fn register(
        &mut self,
        message_id: impl Into<String>,
        device_id: impl Into<String>,
        command: CommandKind,
        parameters: CommandParameters,
    ) {
        let message_id = message_id.into();
        let now = Instant::now();
        self.entries.insert(
            message_id.clone(),
            PendingCommand {
                message_id,
                device_id: device_id.into(),
                command,
                parameters,
                attempts: 1,
                max_attempts: self.max_attempts,
                sent_at: now,
                deadline: now + self.ack_timeout,
            },
        );
    }

    /// Resolve an entry by acknowledgment, returning it together with the
    /// observed latency in milliseconds
    pub fn resolve(&mut self, message_id: &str) -> Option<(PendingCommand, f64)> {
        let entry = self.entries.remove(message_id)?;
        let latency_ms = entry.sent_at.elapsed().as_secs_f64() * 1000.0;
        Some((entry, latency_ms))
    }

    /// Advance every expired entry: re-arm those with attempts left, remove
    /// the rest
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for message_id in expired {
            let Some(entry) = self.entries.get_mut(&message_id) else {
                continue;
            };
            if entry.attempts < entry.max_attempts {
                entry.attempts += 1;
                entry.sent_at = now;
                entry.deadline = now + self.ack_timeout;
                outcome.retries.push(entry.clone());
            } else if let Some(entry) = self.entries.remove(&message_id) {
                outcome.exhausted.push(entry);
            }
        }

        outcome
    }

    /// Drop every entry targeting a removed device
    pub fn remove_device(&mut self, device_id: &str) {
        self.entries.retain(|_, entry| entry.device_id != device_id);
    }

    /// Drop a single entry by ID
    pub fn remove(&mut self, message_id: &str) {
        self.entries.remove(message_id);
    }

    /// Number of commands currently awaiting acknowledgment
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no commands are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
