//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, TLBR};
pub use chrono::Local;
pub use futures::{future, future::FutureExt};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use scene_parser::{
    Annotation, Detection, Detections, ImageList, LossDict, ObjectLabel, SceneParser,
    SceneParserConfig,
};
pub use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    borrow::{Borrow, Cow},
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt::{self, Debug, Display},
    fs,
    future::Future,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Barrier, Mutex},
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    vision, Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::broadcast;
pub use tracing::{debug, error, info, info_span, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
