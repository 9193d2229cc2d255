pub use anyhow::{ensure, Result};
pub use num_traits::{Float, One, Zero};
pub use serde::{Deserialize, Serialize};
