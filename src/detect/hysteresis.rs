//! Anti-flapping rule for published node statuses.

use tracing::debug;

use crate::detect::Status;

/// What the machine decided for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: Status,
    /// The previous status was kept in place of the proposed one.
    pub held: bool,
    /// Epoch since which `status` has been published.
    pub since_epoch: i64,
}

/// The previously published status for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub status: Status,
    pub since_epoch: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct HysteresisMachine {
    window_sec: i64,
}

impl HysteresisMachine {
    pub fn new(window_sec: u64) -> Self {
        Self {
            window_sec: i64::try_from(window_sec).unwrap_or(i64::MAX),
        }
    }

    /// Decide whether `proposed` may replace `previous` at `now_epoch`.
    ///
    /// - no previous status (or an Offline placeholder): accept
    /// - `bypass` (guardrail hit or extreme deviation): accept
    /// - Warning/Danger recovering to Safe/Abnormal: accept immediately
    /// - otherwise a change is held until the previous status has been
    ///   published for `window_sec`
    ///
    /// The window runs from when the previous status was first published,
    /// not from the last recompute, so a node that has been Safe for longer
    /// than `window_sec` escalates on the first pass that proposes it.
    pub fn decide(
        &self,
        node_id: &str,
        previous: Option<Published>,
        proposed: Status,
        now_epoch: i64,
        bypass: bool,
    ) -> Transition {
        let accept = |since_epoch| Transition {
            status: proposed,
            held: false,
            since_epoch,
        };

        let Some(prev) = previous.filter(|p| !matches!(p.status, Status::Offline | Status::NoData))
        else {
            return accept(now_epoch);
        };
        if prev.status == proposed {
            return accept(prev.since_epoch);
        }
        if bypass {
            return accept(now_epoch);
        }
        if prev.status.is_alerting() && matches!(proposed, Status::Safe | Status::Abnormal) {
            return accept(now_epoch);
        }
        if now_epoch - prev.since_epoch < self.window_sec {
            debug!(
                node = node_id,
                held = %prev.status,
                proposed = %proposed,
                "status change held by hysteresis"
            );
            return Transition {
                status: prev.status,
                held: true,
                since_epoch: prev.since_epoch,
            };
        }
        accept(now_epoch)
    }
}
