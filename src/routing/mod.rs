//! Weighted variant selection for split-tested links.
//!
//! Selection is a pure function over the active variant list and an injected
//! random source, so the distribution is testable with a seeded RNG.

use rand::{Rng, RngExt};

use crate::models::Variant;

/// Pick a destination variant, or `None` for the implicit control group.
///
/// Each active variant owns a `[cumulative, cumulative + weight)` slice of
/// `[0, total)`; the control group owns the remainder
/// `max(0, 100 - sum of weights)`. When the weights sum to 100 or more the
/// control group can never win. When every weight is zero (and so is the
/// control share) the draw falls back to a uniform choice among the variants
/// and the control group.
pub fn select_variant<'a, R: Rng + ?Sized>(
    variants: &'a [Variant],
    rng: &mut R,
) -> Option<&'a Variant> {
    let active: Vec<&Variant> = variants.iter().filter(|v| v.is_active).collect();
    if active.is_empty() {
        return None;
    }

    let weight_sum: i64 = active.iter().map(|v| v.weight.max(0)).sum();
    let control_weight = (100 - weight_sum).max(0);
    let total = weight_sum + control_weight;

    if total == 0 {
        // All weights zero: uniform among variants plus control.
        let idx = rng.random_range(0..=active.len());
        return active.get(idx).copied();
    }

    let draw = rng.random_range(0..total);
    let mut cumulative = 0;
    for variant in &active {
        cumulative += variant.weight.max(0);
        if draw < cumulative {
            return Some(variant);
        }
    }

    // Draw landed in the control range.
    None
}
