//! Pure PV-ROI valuation and score aggregation (spec §4.1).
//!
//! Nothing in this module performs I/O or suspends; it is the only part of
//! the core whose correctness can be pinned down with closed-form numeric
//! expectations, so it carries the bulk of the unit tests for spec §8's
//! invariants.

use crate::error::CoreError;
use crate::types::{TrustExperience, TrustScore};
use chrono::{DateTime, Utc};

pub const DEFAULT_DISCOUNT_RATE: f64 = 0.05;

/// Present-value return on investment.
///
/// `pv = return_value / (1 + discount_rate) ^ (timeframe_days / 365)`,
/// `result = pv / investment`.
pub fn pv_roi(
    investment: f64,
    return_value: f64,
    timeframe_days: f64,
    discount_rate: f64,
) -> Result<f64, CoreError> {
    if investment <= 0.0 {
        return Err(CoreError::invalid("investment must be > 0"));
    }
    if timeframe_days < 0.0 {
        return Err(CoreError::invalid("timeframe_days must be >= 0"));
    }

    let years = timeframe_days / 365.0;
    let pv = return_value / (1.0 + discount_rate).powf(years);
    Ok(pv / investment)
}

/// Linear, clamped-non-negative age factor: `max(0, 1 - years_elapsed * forget_rate)`.
///
/// `forget_rate = 0` disables decay. Beyond `1/forget_rate` years an
/// experience contributes zero (spec §4.1).
pub fn age_factor(years_elapsed: f64, forget_rate: f64) -> f64 {
    (1.0 - years_elapsed.max(0.0) * forget_rate).max(0.0)
}

fn aged_volume(exp: &TrustExperience, now: DateTime<Utc>, forget_rate: f64) -> f64 {
    let years_elapsed = (now - exp.timestamp).num_days() as f64 / 365.0;
    exp.invested_volume * age_factor(years_elapsed, forget_rate)
}

/// Aggregate a set of experiences into a `TrustScore` under temporal decay.
pub fn aggregate(experiences: &[TrustExperience], now: DateTime<Utc>, forget_rate: f64) -> TrustScore {
    let mut total_weighted_roi = 0.0;
    let mut total_aged_volume = 0.0;

    for exp in experiences {
        let volume = aged_volume(exp, now, forget_rate);
        total_weighted_roi += exp.pv_roi * volume;
        total_aged_volume += volume;
    }

    let expected_pv_roi = if total_aged_volume > 0.0 {
        total_weighted_roi / total_aged_volume
    } else {
        1.0
    };

    TrustScore {
        expected_pv_roi,
        total_volume: total_aged_volume,
        data_points: experiences.len(),
    }
}

/// Blend a local score with a set of peer-supplied scores, each weighted by
/// the peer's `recommender_quality` (spec §4.3).
///
/// Negative quality mirrors the peer's `expected_pv_roi` around 1.0
/// ("contrarian"); magnitude governs weight regardless of sign.
pub fn combine(local: TrustScore, peer_contributions: &[(TrustScore, f64)]) -> TrustScore {
    let mut total_volume = local.total_volume;
    let mut total_weighted = local.expected_pv_roi * local.total_volume;
    let mut data_points = local.data_points;

    for (score, quality) in peer_contributions {
        if *quality == 0.0 {
            continue;
        }
        let contrib_volume = score.total_volume * quality.abs();
        let contrib_roi = if *quality > 0.0 {
            score.expected_pv_roi
        } else {
            2.0 - score.expected_pv_roi
        };

        total_volume += contrib_volume;
        total_weighted += contrib_roi * contrib_volume;
        data_points += score.data_points;
    }

    let expected_pv_roi = if total_volume > 0.0 {
        total_weighted / total_volume
    } else {
        1.0
    };

    TrustScore {
        expected_pv_roi,
        total_volume,
        data_points,
    }
}
