//! Learning-rate schedules for the Adam optimizer.

/// A learning rate as a pure function of the (1-based) optimizer step.
pub trait LearningRateSchedule: Send {
    fn learning_rate(&self, step: usize) -> f64;
}

/// Warmup-then-decay schedule from "Attention Is All You Need":
///
/// `lr(step) = d_model^-0.5 * min(step^-0.5, step * warmup_steps^-1.5)`
///
/// Grows linearly for the first `warmup_steps` steps, then decays with the
/// inverse square root of the step. The two branches meet at `warmup_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomSchedule {
    d_model: f64,
    warmup_steps: f64,
}

impl CustomSchedule {
    pub fn new(d_model: i64) -> Self {
        Self::with_warmup(d_model, 4000.0)
    }

    pub fn with_warmup(d_model: i64, warmup_steps: f64) -> Self {
        Self {
            d_model: d_model as f64,
            warmup_steps,
        }
    }
}

impl LearningRateSchedule for CustomSchedule {
    fn learning_rate(&self, step: usize) -> f64 {
        let step = step as f64;
        let arg1 = step.sqrt().recip();
        let arg2 = step * self.warmup_steps.powf(-1.5);
        self.d_model.sqrt().recip() * arg1.min(arg2)
    }
}

/// A fixed learning rate supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantLearningRate(pub f64);

impl LearningRateSchedule for ConstantLearningRate {
    fn learning_rate(&self, _step: usize) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_schedule_positive() {
        let schedule = CustomSchedule::new(256);
        for step in [1, 2, 10, 100, 3999, 4000, 4001, 50_000, 1_000_000] {
            assert!(schedule.learning_rate(step) > 0.0, "step {}", step);
        }
    }

    #[test]
    fn test_custom_schedule_branches_meet_at_warmup() {
        let d_model = 128;
        let warmup = 4000.0;
        let schedule = CustomSchedule::with_warmup(d_model, warmup);

        let at_warmup = schedule.learning_rate(4000);
        let expected = (d_model as f64).powf(-0.5) * warmup.powf(-0.5);
        assert!((at_warmup - expected).abs() < 1e-12);

        // Warmup rises, decay falls, and neither jumps across the boundary.
        let before = schedule.learning_rate(3999);
        let after = schedule.learning_rate(4001);
        assert!(before < at_warmup);
        assert!(after < at_warmup);
        assert!((at_warmup - before) / at_warmup < 1e-3);
        assert!((at_warmup - after) / at_warmup < 1e-3);
    }

    #[test]
    fn test_custom_schedule_linear_warmup() {
        let schedule = CustomSchedule::with_warmup(64, 100.0);
        let lr10 = schedule.learning_rate(10);
        let lr20 = schedule.learning_rate(20);
        assert!((lr20 / lr10 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_learning_rate() {
        let schedule = ConstantLearningRate(1e-3);
        assert_eq!(schedule.learning_rate(1), 1e-3);
        assert_eq!(schedule.learning_rate(10_000), 1e-3);
    }
}
