use crate::{common::*, config::SolverConfig};

/// Build the SGD optimizer over the trainable variables of `vs`.
///
/// The learning rate is set by [WarmupMultiStepLr](super::WarmupMultiStepLr) before each step.
pub fn build_optimizer(vs: &nn::VarStore, config: &SolverConfig) -> Result<nn::Optimizer> {
    let SolverConfig {
        base_lr,
        momentum,
        weight_decay,
        ..
    } = *config;

    let optimizer = nn::Sgd {
        momentum: momentum.raw(),
        dampening: 0.0,
        wd: weight_decay.raw(),
        nesterov: false,
    }
    .build(vs, base_lr.raw())?;

    Ok(optimizer)
}
