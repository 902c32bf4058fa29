use std::time::Duration;

use session_engine::{run_sweep, EngineContext};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

/// Runs the cleanup sweep on a fixed interval until the runtime shuts down.
pub(crate) fn spawn_sweeper(engine: EngineContext, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "sweeper: scheduled");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_sweep(&engine).await;
        }
    })
}
