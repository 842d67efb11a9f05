use rand::Rng;

/// Rounds `value` down or up at random, rounding up with probability equal to its fractional part.
///
/// The expectation over draws equals `value` for any finite, non-negative input.
pub fn stochastic_round<R: Rng + ?Sized>(value: f64, rng: &mut R) -> u64 {
    let base = value.floor();
    let fraction = value - base;
    // non-finite estimates fall back to the integer part
    let round_up = fraction.is_finite() && rng.random_bool(fraction.clamp(0.0, 1.0));
    base.max(0.0) as u64 + u64::from(round_up)
}

/// Stochastically rounds a fractional accumulation-depth estimate, never returning less than one.
pub fn discretize_depth<R: Rng + ?Sized>(estimate: f64, rng: &mut R) -> usize {
    stochastic_round(estimate, rng).max(1) as usize
}
