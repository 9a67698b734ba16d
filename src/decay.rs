//! Time-based decay of engagement levels.
//!
//! Between LLM touches, `level_current` drifts deterministically toward
//! `level_ideal`. The drift follows a logarithmic curve over elapsed time
//! and is damped near the extremes of the range, so levels pinned at 0 or 1
//! are stickier than mid-range ones and never oscillate.

/// Hours after which the time factor saturates (30 days).
const FULL_DECAY_HOURS: f64 = 720.0;

/// Damping floor at the extremes. A level sitting exactly at 0 or 1 still
/// moves, just four times slower than one at 0.5.
const STICKINESS_FLOOR: f64 = 0.25;

/// Updates smaller than this are skipped entirely so no-op decay never
/// churns `last_updated`.
pub const DECAY_EPSILON: f64 = 1e-3;

/// Fraction of the remaining gap closed after `hours` of inactivity.
fn time_factor(hours: f64) -> f64 {
    if hours <= 0.0 {
        return 0.0;
    }
    ((1.0 + hours).ln() / (1.0 + FULL_DECAY_HOURS).ln()).min(1.0)
}

/// Damping based on where the level currently sits: 1.0 mid-range,
/// `STICKINESS_FLOOR` at the extremes.
fn stickiness(current: f64) -> f64 {
    let mid = 4.0 * current * (1.0 - current);
    STICKINESS_FLOOR + (1.0 - STICKINESS_FLOOR) * mid.clamp(0.0, 1.0)
}

/// Compute the decayed level after `hours` without reinforcement.
/// The result never overshoots `ideal`.
pub fn decay_level(current: f64, ideal: f64, hours: f64) -> f64 {
    let current = current.clamp(0.0, 1.0);
    let ideal = ideal.clamp(0.0, 1.0);

    let gap = ideal - current;
    let delta = gap * time_factor(hours) * stickiness(current);

    (current + delta).clamp(0.0, 1.0)
}

/// Apply decay, returning the new level only when the change clears the
/// epsilon. `None` means "skip the write".
pub fn apply_decay(current: f64, ideal: f64, hours: f64) -> Option<f64> {
    let next = decay_level(current, ideal, hours);
    if (next - current).abs() < DECAY_EPSILON {
        None
    } else {
        Some(next)
    }
}

/// The scalar "desire gap" over a set of (current, ideal) pairs: the
/// largest absolute distance from ideal.
pub fn desire_gap(levels: impl IntoIterator<Item = (f64, f64)>) -> f64 {
    levels
        .into_iter()
        .map(|(current, ideal)| (ideal - current).abs())
        .fold(0.0, f64::max)
}
