use serde::{Deserialize, Serialize};

/// Multiplicative learning-rate schedule, applied on top of a parameter group's base rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Linear ramp from `floor` to 1.0 over `warmup_steps`, then `(step + 1 - warmup)^exponent`.
    WarmupPowerLaw {
        floor: f64,
        warmup_steps: u32,
        exponent: f64,
    },
    /// `(step + 1)^exponent`, starting at 1.0.
    PowerLaw { exponent: f64 },
    /// `decay^step`.
    ExponentialDecay { decay: f64 },
}

impl LrSchedule {
    pub fn multiplier(&self, step: u32) -> f64 {
        let step = step as f64;
        match *self {
            LrSchedule::WarmupPowerLaw {
                floor,
                warmup_steps,
                exponent,
            } => {
                let warmup = warmup_steps as f64;
                if step < warmup {
                    floor + step / warmup * (1.0 - floor)
                } else {
                    (step + 1.0 - warmup).powf(exponent)
                }
            }
            LrSchedule::PowerLaw { exponent } => (step + 1.0).powf(exponent),
            LrSchedule::ExponentialDecay { decay } => decay.powf(step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: LrSchedule = LrSchedule::WarmupPowerLaw {
        floor: 2e-2,
        warmup_steps: 100,
        exponent: -0.08,
    };

    #[test]
    fn warmup_is_linear_and_increasing() {
        assert!((DEFAULT.multiplier(0) - 2e-2).abs() < 1e-12);
        let first_delta = DEFAULT.multiplier(1) - DEFAULT.multiplier(0);
        assert!(first_delta > 0.0);
        for step in 1..99 {
            let delta = DEFAULT.multiplier(step + 1) - DEFAULT.multiplier(step);
            assert!(delta > 0.0, "not increasing at step {step}");
            assert!(
                (delta - first_delta).abs() < 1e-12,
                "warmup slope changed at step {step}"
            );
        }
    }

    #[test]
    fn peaks_at_one_after_warmup() {
        assert!((DEFAULT.multiplier(100) - 1.0).abs() < 1e-12);
        assert!(DEFAULT.multiplier(99) < 1.0);
    }

    #[test]
    fn power_law_tail_is_decreasing_and_convex() {
        for step in 100..5000 {
            let a = DEFAULT.multiplier(step);
            let b = DEFAULT.multiplier(step + 1);
            let c = DEFAULT.multiplier(step + 2);
            assert!(b < a, "not decreasing at step {step}");
            assert!(a - 2.0 * b + c > 0.0, "not convex at step {step}");
        }
    }

    #[test]
    fn no_warmup_power_law_starts_at_one() {
        let outputs = LrSchedule::PowerLaw { exponent: -0.2 };
        assert_eq!(outputs.multiplier(0), 1.0);
        assert!(outputs.multiplier(10) < DEFAULT.multiplier(110));
    }

    #[test]
    fn exponential_decay() {
        let decay = LrSchedule::ExponentialDecay { decay: 0.995 };
        assert_eq!(decay.multiplier(0), 1.0);
        assert!((decay.multiplier(2) - 0.995 * 0.995).abs() < 1e-12);
    }

    #[test]
    fn deserializes_tagged() {
        let schedule: LrSchedule =
            serde_json::from_str(r#"{"type":"exponential_decay","decay":0.9}"#).unwrap();
        assert_eq!(schedule, LrSchedule::ExponentialDecay { decay: 0.9 });
    }
}
