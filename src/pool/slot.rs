use std::fmt;

/// Where a pool slot is in its life.
///
/// ```text
/// Warming ─booted─▶ Available ─acquired─▶ InUse ─restored─▶ Available
///    │                  │                   │
///    └──────failed──────┴──────failed───────┴──▶ Unhealthy (destroyed, never reused)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Warming,
    Available,
    InUse,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// Boot finished and the baseline snapshot exists.
    Booted,
    Acquired,
    /// Baseline restored after a healthy release.
    Restored,
    /// Boot, restore, or health check failed, or the holder gave the slot
    /// back unhealthy.
    Failed,
}

impl SlotState {
    /// Slots that count toward the pool's size cap.
    pub fn is_live(self) -> bool {
        !matches!(self, SlotState::Unhealthy)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Warming => "warming",
            SlotState::Available => "available",
            SlotState::InUse => "in-use",
            SlotState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// The only place slot states change. `None` means the event is not valid
/// in `state`.
pub fn transition(state: SlotState, event: SlotEvent) -> Option<SlotState> {
    use SlotEvent as E;
    use SlotState as S;
    match (state, event) {
        (S::Warming, E::Booted) => Some(S::Available),
        (S::Available, E::Acquired) => Some(S::InUse),
        (S::InUse, E::Restored) => Some(S::Available),
        (S::Warming | S::Available | S::InUse, E::Failed) => Some(S::Unhealthy),
        _ => None,
    }
}
