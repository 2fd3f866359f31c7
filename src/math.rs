use std::time::Duration;

use num_rational::Ratio;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Computes `val * num / denom` without overflowing the intermediate product.
///
/// The result saturates at `u64::MAX`. A zero `denom` yields `u64::MAX`, mirroring
/// an infinite ratio.
#[inline]
pub fn scale(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let wide = val as u128 * num as u128 / denom as u128;
    u64::try_from(wide).unwrap_or(u64::MAX)
}

/// Signed variant of [`scale`]; negative inputs scale towards zero symmetrically.
#[inline]
pub fn scale_signed(val: i64, num: u64, denom: u64) -> i64 {
    let magnitude = scale(val.unsigned_abs(), num, denom).min(i64::MAX as u64) as i64;
    if val < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Converts a count of units running at `rate` units per second to nanoseconds.
///
/// Saturates at `u64::MAX` when the result does not fit.
pub fn units_to_nanos(units: u64, rate: Ratio<u64>) -> u64 {
    let num = u128::from(NANOS_PER_SEC) * u128::from(*rate.denom());
    match u128::from(units).checked_mul(num) {
        Some(wide) => u64::try_from(wide / u128::from(*rate.numer())).unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}

/// Inverse of [`units_to_nanos`], rounding down.
pub fn nanos_to_units(nanos: u64, rate: Ratio<u64>) -> u64 {
    let denom = u128::from(NANOS_PER_SEC) * u128::from(*rate.denom());
    let wide = u128::from(nanos) * u128::from(*rate.numer()) / denom;
    u64::try_from(wide).unwrap_or(u64::MAX)
}

#[inline]
pub fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
