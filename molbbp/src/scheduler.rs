use log::info;

use crate::config::{SchedulerKind, TrainConfig};

/// relative improvement needed to reset the plateau counter
const PLATEAU_THRESHOLD: f64 = 1e-4;

/// Epoch-level learning rate schedule
#[derive(Clone, Debug)]
pub struct LrScheduler {
    kind: SchedulerKind,
    lr: f64,
    factor: f64,
    step_size: usize,
    patience: usize,
    epoch: usize,
    best: f64,
    num_bad_epochs: usize,
}

impl LrScheduler {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            kind: config.scheduler,
            lr: config.init_lr,
            factor: config.lr_reduce_factor,
            step_size: config.step_size.max(1),
            patience: config.lr_schedule_patience,
            epoch: 0,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    /// Advance one epoch and return the rate for the next
    ///
    /// * `val_loss` - validation loss of the finished epoch (plateau only)
    pub fn step(&mut self, val_loss: f64) -> f64 {
        self.epoch += 1;
        match self.kind {
            SchedulerKind::Step => {
                if self.epoch % self.step_size == 0 {
                    self.reduce();
                }
            }
            SchedulerKind::Plateau => {
                if val_loss < self.best * (1. - PLATEAU_THRESHOLD) {
                    self.best = val_loss;
                    self.num_bad_epochs = 0;
                } else {
                    self.num_bad_epochs += 1;
                }
                if self.num_bad_epochs > self.patience {
                    self.reduce();
                    self.num_bad_epochs = 0;
                }
            }
        }
        self.lr
    }

    fn reduce(&mut self) {
        let lr = self.lr * self.factor;
        info!("epoch {}: reducing learning rate {:.3e} -> {:.3e}", self.epoch, self.lr, lr);
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerKind;
    use approx::assert_abs_diff_eq;

    fn config(kind: SchedulerKind) -> TrainConfig {
        TrainConfig {
            optimizer: OptimizerKind::Adam,
            init_lr: 1e-3,
            weight_decay: 0.,
            scheduler: kind,
            step_size: 2,
            lr_reduce_factor: 0.5,
            lr_schedule_patience: 1,
            min_lr: 1e-5,
            epochs: 10,
            batch_size: 4,
            max_time: 1.,
            seed: 0,
            kl_weight: None,
            eval_num_samples: 2,
            save_params: false,
        }
    }

    #[test]
    fn test_step_schedule() {
        let mut s = LrScheduler::new(&config(SchedulerKind::Step));
        assert_abs_diff_eq!(s.step(1.), 1e-3);
        assert_abs_diff_eq!(s.step(1.), 5e-4);
        assert_abs_diff_eq!(s.step(1.), 5e-4);
        assert_abs_diff_eq!(s.step(1.), 2.5e-4);
    }

    #[test]
    fn test_plateau_schedule() {
        let mut s = LrScheduler::new(&config(SchedulerKind::Plateau));
        assert_abs_diff_eq!(s.step(1.0), 1e-3);
        assert_abs_diff_eq!(s.step(0.5), 1e-3);
        // first bad epoch is within patience
        assert_abs_diff_eq!(s.step(0.5), 1e-3);
        assert_abs_diff_eq!(s.step(0.6), 5e-4);
        assert_abs_diff_eq!(s.step(0.4), 5e-4);
    }
}
