use serde::{Deserialize, Serialize};

/// Minimum number of warmup steps.
pub const MIN_WARMUP_STEPS: usize = 10;
/// Fraction of the run spent warming up when that exceeds the minimum.
pub const WARMUP_FRACTION: f64 = 0.03;

/// Optimizer steps per epoch for `batches` mini-batches with gradient accumulation.
pub fn steps_per_epoch(batches: usize, accumulation: usize) -> usize {
    batches.div_ceil(accumulation.max(1)).max(1)
}

/// Linear warmup followed by a cosine decay to zero, expressed as a multiplier of each
/// group's base learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupCosineSchedule {
    total_steps: usize,
    warmup_steps: usize,
    step: usize,
}

impl WarmupCosineSchedule {
    pub fn new(total_steps: usize) -> Self {
        let total_steps = total_steps.max(1);
        let warmup_steps = MIN_WARMUP_STEPS.max((WARMUP_FRACTION * total_steps as f64) as usize);
        Self {
            total_steps,
            warmup_steps,
            step: 0,
        }
    }

    /// Multiplier at an arbitrary step.
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return (step + 1) as f64 / self.warmup_steps as f64;
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / span as f64;
        0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    pub fn current_factor(&self) -> f64 {
        self.factor(self.step)
    }

    /// Advances by one optimizer step.
    pub fn step(&mut self) {
        self.step += 1;
    }

    pub const fn steps_taken(&self) -> usize {
        self.step
    }

    pub const fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub const fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_uses_floor_of_ten_steps() {
        assert_eq!(WarmupCosineSchedule::new(100).warmup_steps(), 10);
        assert_eq!(WarmupCosineSchedule::new(1000).warmup_steps(), 30);
        assert_eq!(WarmupCosineSchedule::new(0).total_steps(), 1);
    }

    #[test]
    fn first_step_is_base_over_warmup() {
        let schedule = WarmupCosineSchedule::new(1000);
        assert!((schedule.current_factor() - 1.0 / 30.0).abs() < 1e-12);
        assert!((schedule.factor(29) - 1.0).abs() < 1e-12);
        assert!((schedule.factor(30) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn decays_to_zero_at_the_end() {
        let mut schedule = WarmupCosineSchedule::new(200);
        for _ in 0..200 {
            schedule.step();
        }
        assert!(schedule.current_factor() < 1e-9);

        let mid = schedule.factor(10 + 95);
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn steps_per_epoch_rounds_up() {
        assert_eq!(steps_per_epoch(10, 4), 3);
        assert_eq!(steps_per_epoch(0, 1), 1);
        assert_eq!(steps_per_epoch(7, 0), 7);
    }

    #[test]
    fn state_survives_json() {
        let mut schedule = WarmupCosineSchedule::new(50);
        schedule.step();
        schedule.step();
        let json = serde_json::to_string(&schedule).unwrap();
        let restored: WarmupCosineSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, schedule);
    }
}
