//! Graceful shutdown (spec §5): a fixed five-step cancellation sequence
//! driven off `CancellationToken`s, triggered by SIGINT/SIGTERM.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// How long in-flight worker handlers get to finish after drain begins,
/// before their per-call context is cancelled (spec §5 step 3).
pub const GRACE_PERIOD: Duration = Duration::from_secs(25);

/// Waits for SIGINT or SIGTERM, then drives the shutdown sequence: stop the
/// scheduler, drain workers, wait out the grace period, hard-stop anything
/// still running, force-flush the audit writer, and finally tear down the
/// broker connection. Each step is a distinct token so components only ever
/// observe the signal relevant to them.
pub async fn wait_for_signal_and_shut_down(
    scheduler_shutdown: CancellationToken,
    drain: CancellationToken,
    hard_stop: CancellationToken,
    writer_shutdown: CancellationToken,
    broker_shutdown: CancellationToken,
) {
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutdown: stopping scheduler ticker");
    scheduler_shutdown.cancel();

    tracing::info!("shutdown: pausing worker reservations, draining in-flight handlers");
    drain.cancel();

    tokio::time::sleep(GRACE_PERIOD).await;

    tracing::info!("shutdown: grace period elapsed, cancelling any still-running handler contexts");
    hard_stop.cancel();

    tracing::info!("shutdown: force-flushing batched audit writer");
    writer_shutdown.cancel();

    tracing::info!("shutdown: closing broker connection");
    broker_shutdown.cancel();
}
