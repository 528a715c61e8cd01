// ABOUTME: Background idle reaper for sandboxes
// ABOUTME: Periodically stops running sandboxes whose last access is older than the idle timeout

use crate::orchestrator::SandboxOrchestrator;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Start the idle reaper task.
///
/// Sweeps every `reaper_interval` and stops `running` sandboxes that have not been
/// touched for `idle_timeout`. Abort the returned handle to stop sweeping.
///
/// # Examples
///
/// ```no_run
/// use appforge_preview::{start_idle_reaper, SandboxConfig, SandboxOrchestrator};
///
/// #[tokio::main]
/// async fn main() {
///     let orchestrator = SandboxOrchestrator::new(SandboxConfig::default());
///     let reaper = start_idle_reaper(orchestrator.clone());
///
///     // On shutdown:
///     reaper.abort();
///     orchestrator.cleanup_all().await;
/// }
/// ```
pub fn start_idle_reaper(orchestrator: SandboxOrchestrator) -> JoinHandle<()> {
    let period = orchestrator.config().reaper_interval;
    info!(
        "Starting idle sandbox reaper (interval: {}s, idle timeout: {}s)",
        period.as_secs(),
        orchestrator.config().idle_timeout.as_secs()
    );

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be idle yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            debug!("Sweeping for idle sandboxes");

            let reaped = orchestrator.reap_idle().await;
            if !reaped.is_empty() {
                info!("Reaped {} idle sandbox(es): {}", reaped.len(), reaped.join(", "));
            }
        }
    })
}
