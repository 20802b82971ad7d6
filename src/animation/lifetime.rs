use std::time::Duration;

use super::template::TimedEmitters;

/// Longest time before an effect is guaranteed visually finished.
///
/// Each sub-emitter contributes `duration + timing.peak()`; the result is the
/// maximum contribution. Falls back to `default` when there are no timed
/// sub-emitters or the maximum is not positive. `default` must be non-zero.
/// Bounds too large for a `Duration` saturate to `Duration::MAX`.
pub fn estimate_lifetime<T: TimedEmitters + ?Sized>(template: &T, default: Duration) -> Duration {
    let longest = template
        .timed_sub_emitters()
        .iter()
        .map(|emitter| emitter.duration + emitter.timing.peak())
        .filter(|secs| secs.is_finite())
        .fold(0.0_f32, f32::max);

    if longest > 0.0 {
        Duration::try_from_secs_f32(longest).unwrap_or(Duration::MAX)
    } else {
        default
    }
}
