use crate::engine::PresenceEngine;
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};

/// Periodically expire stale online users. The task runs until aborted.
pub fn spawn_sweeper(engine: PresenceEngine, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        tick.tick().await;
        loop {
            tick.tick().await;
            let expired = engine.sweep().await;
            if expired > 0 {
                tracing::debug!(expired, "sweep expired stale users");
            }
        }
    })
}
