//! Periodic presence tasks
//!
//! Two kinds of task run per presence channel: one broadcast loop sending the
//! local snapshot, and one liveness monitor per tracked remote node. Both
//! hold a weak reference to the channel and stop when it is dropped or their
//! token is cancelled.

use std::sync::Weak;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PresenceChannel;
use crate::types::NodeId;

/// Lower bound on the tick period
pub const MIN_TICK: Duration = Duration::from_millis(10);

/// Liveness tick period: GRTT x multiplier once an estimate is known,
/// `fallback` until then.
pub fn tick_interval(grtt: Option<Duration>, multiplier: u32, fallback: Duration) -> Duration {
    match grtt {
        Some(grtt) => (grtt * multiplier.max(1)).max(MIN_TICK),
        None => fallback.max(MIN_TICK),
    }
}

/// Send the local snapshot now and then once per tick.
pub(super) async fn broadcast_loop(presence: Weak<PresenceChannel>, cancel: CancellationToken) {
    debug!("Presence broadcast started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let interval = {
            let Some(presence) = presence.upgrade() else {
                break;
            };
            if let Err(e) = presence.broadcast_snapshot() {
                warn!(error = %e, "Snapshot broadcast failed");
            }
            presence.tick_interval()
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Presence broadcast stopped");
}

/// Count down one remote node's liveness until it is reaped or cancelled.
pub(super) async fn monitor_loop(
    presence: Weak<PresenceChannel>,
    node: NodeId,
    cancel: CancellationToken,
) {
    debug!(node_id = %node, "Liveness monitor started");
    loop {
        let Some(interval) = presence.upgrade().map(|p| p.tick_interval()) else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(presence) = presence.upgrade() else {
            break;
        };
        if presence.liveness_tick(node) {
            break;
        }
    }
    debug!(node_id = %node, "Liveness monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_interval() {
        let fallback = Duration::from_secs(4);
        assert_eq!(tick_interval(None, 3, fallback), fallback);
        assert_eq!(
            tick_interval(Some(Duration::from_millis(200)), 3, fallback),
            Duration::from_millis(600)
        );
        assert_eq!(tick_interval(Some(Duration::ZERO), 1, fallback), MIN_TICK);
        assert_eq!(
            tick_interval(Some(Duration::from_millis(50)), 0, fallback),
            Duration::from_millis(50)
        );
    }
}
