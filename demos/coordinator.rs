//! Run a coordinator with both services on their default ports and print
//! device/session state as it changes.
//!
//! ```sh
//! cargo run --example coordinator
//! ```

use labsync::{ClockCoordinator, CoordinatorConfig, CoordinatorEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labsync=info".into()),
        )
        .init();

    let mut coordinator = ClockCoordinator::new(CoordinatorConfig::default());
    coordinator.start().await?;
    println!(
        "coordinator running: time port {:?}, command port {:?}",
        coordinator.time_port(),
        coordinator.command_port()
    );

    let mut events = coordinator.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoordinatorEvent::SyncSnapshot { devices } => {
                    for status in devices.values() {
                        println!(
                            "  {} offset={:+.1}ms quality={:.2} synced={}",
                            status.device_id,
                            status.time_offset_ms,
                            status.sync_quality,
                            status.is_synchronized
                        );
                    }
                }
                CoordinatorEvent::SessionStarted { session } => {
                    println!("session started: {}", session.session_id);
                }
                CoordinatorEvent::SessionStopped {
                    session_id,
                    duration_secs,
                } => {
                    println!("session stopped: {session_id} ({duration_secs:.1}s)");
                }
                CoordinatorEvent::WebcamSync { master_timestamp } => {
                    println!("webcam sync tick at {master_timestamp:.3}");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("shutting down...");
    coordinator.stop().await;
    watcher.abort();
    Ok(())
}
