//! Optimizer and learning rate schedule.

mod lr_scheduler;
pub use lr_scheduler::*;

mod optimizer;
pub use optimizer::*;
