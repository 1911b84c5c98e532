//! # labsync
//!
//! Clock synchronization and coordinated recording control for
//! heterogeneous multi-device sensing rigs.
//!
//! A research rig correlates signals sampled by physically separate clocks
//! (128 Hz GSR, 25 Hz thermal, 30 fps video). This crate establishes the
//! shared time reference, tracks per-device clock drift, and issues
//! recording commands whose effective start instant is known to all devices
//! within a bounded tolerance.
//!
//! ## Example
//!
//! ```rust,no_run
//! use labsync::{ClockCoordinator, CoordinatorConfig};
//!
//! # async fn example() -> Result<(), labsync::SyncError> {
//! let mut coordinator = ClockCoordinator::new(CoordinatorConfig::default());
//! coordinator.start().await?;
//!
//! // Devices connect and synchronize in the background...
//! coordinator
//!     .start_synchronized_recording("sess-1", None, true, true, false)
//!     .await?;
//!
//! coordinator.stop_synchronized_recording("sess-1").await?;
//! coordinator.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Three components, composed bottom-up:
//!
//! - [`TimeReferenceService`] — corrects the local clock against upstream
//!   NTP hosts and serves it to devices over a stateless JSON protocol
//! - [`DeviceCommandServer`] — one persistent JSON connection per device,
//!   with bounded-retry command delivery and liveness detection
//! - [`ClockCoordinator`] — fuses the two into per-device sync quality and
//!   recording-session lifecycle

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

// Public modules
/// Coordinator: sync tracking and session lifecycle
pub mod coordinator;
/// Error types
pub mod error;
/// Wire protocol
pub mod protocol;
/// Device-command server
pub mod server;
/// Time-reference service
pub mod timeref;
/// Core types
pub mod types;

// Re-exports
pub use coordinator::{quality_from_offset, ClockCoordinator, CoordinatorEvent};
pub use error::SyncError;
pub use protocol::{CommandKind, CommandParameters, WireMessage};
pub use server::{CommandHandle, DeviceCommandServer, NetworkStatistics, ServerEvent};
pub use timeref::{Clock, TimeReferenceService, TimeSyncEvent};
pub use types::{
    CommandServerConfig, CoordinatorConfig, DeviceInfo, DeviceType, RecordingSession,
    ReferenceSource, SyncStatus, TimeServerStatus, TimeServiceConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
///
/// Convenient re-exports
pub mod prelude {
    pub use crate::{
        ClockCoordinator, CommandKind, CoordinatorConfig, CoordinatorEvent, DeviceInfo,
        DeviceType, RecordingSession, SyncError, SyncStatus, TimeServerStatus, WireMessage,
    };
}
