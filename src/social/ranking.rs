use chrono::{DateTime, Utc};

/// Power-law decay exponent applied to the post age in hours.
pub const DECAY_EXPONENT: f64 = 1.5;
/// Hours added to the age so brand-new posts don't divide by ~zero.
pub const AGE_OFFSET_HOURS: f64 = 2.0;

/// `(up - down + log10(1 + aggressive_views)) / (hours_since_published + 2)^1.5`
///
/// Posts published after `now` are treated as zero hours old.
pub fn rank_score(
    upvotes: i32,
    downvotes: i32,
    aggressive_views: i64,
    published_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let engagement = f64::from(upvotes) - f64::from(downvotes) + (1.0 + aggressive_views.max(0) as f64).log10();
    let hours = ((now - published_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
    engagement / (hours + AGE_OFFSET_HOURS).powf(DECAY_EXPONENT)
}
