pub use anyhow::{bail, ensure, format_err, Error, Result};
pub use bbox::{prelude::*, TLBR};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::{Borrow, Cow},
    cmp::Ordering,
    collections::HashMap,
    fmt::Debug,
    iter,
};
pub use tch::{
    nn::{self, ModuleT},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tracing::{debug, warn};
