use crate::{
    common::*,
    config::{SolverConfig, WarmupMethod},
};

/// Multi-step learning rate decay with warmup.
#[derive(Debug, Clone)]
pub struct WarmupMultiStepLr {
    base_lr: f64,
    steps: Vec<usize>,
    gamma: f64,
    warmup_factor: f64,
    warmup_iters: usize,
    warmup_method: WarmupMethod,
    next_iter: usize,
    lr: f64,
}

impl WarmupMultiStepLr {
    /// Create a scheduler whose first [step](Self::step) yields the rate of `start_iter`.
    pub fn new(config: &SolverConfig, start_iter: usize) -> Result<Self> {
        let SolverConfig {
            base_lr,
            ref steps,
            gamma,
            warmup_factor,
            warmup_iters,
            warmup_method,
            ..
        } = *config;

        ensure!(
            steps.windows(2).all(|pair| pair[0] < pair[1]),
            "steps should be a list of increasing integers, but get {:?}",
            steps
        );

        let mut scheduler = Self {
            base_lr: base_lr.raw(),
            steps: steps.clone(),
            gamma: gamma.raw(),
            warmup_factor: warmup_factor.raw(),
            warmup_iters,
            warmup_method,
            next_iter: start_iter,
            lr: 0.0,
        };
        scheduler.lr = scheduler.lr_at(start_iter);
        Ok(scheduler)
    }

    /// The learning rate at iteration `iter`.
    pub fn lr_at(&self, iter: usize) -> f64 {
        let warmup = if iter < self.warmup_iters {
            match self.warmup_method {
                WarmupMethod::Constant => self.warmup_factor,
                WarmupMethod::Linear => {
                    let alpha = iter as f64 / self.warmup_iters as f64;
                    self.warmup_factor * (1.0 - alpha) + alpha
                }
            }
        } else {
            1.0
        };
        let num_decays = self.steps.iter().take_while(|&&step| step <= iter).count();

        self.base_lr * warmup * self.gamma.powi(num_decays as i32)
    }

    /// Advance to the next iteration and return its learning rate.
    pub fn step(&mut self) -> f64 {
        self.lr = self.lr_at(self.next_iter);
        self.next_iter += 1;
        self.lr
    }

    /// The most recent learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn config(warmup_method: WarmupMethod) -> SolverConfig {
        SolverConfig {
            base_lr: r64(0.1),
            momentum: r64(0.9),
            weight_decay: r64(0.0001),
            steps: vec![10, 20],
            gamma: r64(0.1),
            warmup_factor: r64(0.5),
            warmup_iters: 4,
            warmup_method,
            checkpoint_period: NonZeroUsize::new(5).unwrap(),
            max_iter: 30,
            ims_per_batch: NonZeroUsize::new(2).unwrap(),
        }
    }

    #[test]
    fn linear_warmup() -> Result<()> {
        let scheduler = WarmupMultiStepLr::new(&config(WarmupMethod::Linear), 0)?;
        assert!(abs_diff_eq!(scheduler.lr_at(0), 0.05));
        assert!(abs_diff_eq!(scheduler.lr_at(2), 0.075));
        assert!(abs_diff_eq!(scheduler.lr_at(4), 0.1));
        Ok(())
    }

    #[test]
    fn constant_warmup() -> Result<()> {
        let scheduler = WarmupMultiStepLr::new(&config(WarmupMethod::Constant), 0)?;
        assert!(abs_diff_eq!(scheduler.lr_at(3), 0.05));
        assert!(abs_diff_eq!(scheduler.lr_at(4), 0.1));
        Ok(())
    }

    #[test]
    fn decays_at_steps() -> Result<()> {
        let scheduler = WarmupMultiStepLr::new(&config(WarmupMethod::Linear), 0)?;
        assert!(abs_diff_eq!(scheduler.lr_at(9), 0.1));
        assert!(abs_diff_eq!(scheduler.lr_at(10), 0.01));
        assert!(abs_diff_eq!(scheduler.lr_at(20), 0.001, epsilon = 1e-12));
        Ok(())
    }

    #[test]
    fn step_resumes_from_start_iter() -> Result<()> {
        let mut scheduler = WarmupMultiStepLr::new(&config(WarmupMethod::Linear), 10)?;
        assert!(abs_diff_eq!(scheduler.step(), 0.01));
        assert!(abs_diff_eq!(scheduler.lr(), 0.01));
        Ok(())
    }

    #[test]
    fn reject_unsorted_steps() {
        let config = SolverConfig {
            steps: vec![20, 10],
            ..config(WarmupMethod::Linear)
        };
        assert!(WarmupMultiStepLr::new(&config, 0).is_err());
    }
}
