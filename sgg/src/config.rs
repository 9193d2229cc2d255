//! Training and evaluation configuration format.

use crate::common::*;

pub use dataset::*;
pub use device::*;
pub use eval::*;
pub use input::*;
pub use model::*;
pub use solver::*;

/// The main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub input: InputConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub dataloader: DataLoaderConfig,
    pub solver: SolverConfig,
    #[serde(default)]
    pub test: TestConfig,
    pub device_config: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub visualize: VisualizeConfig,
    /// The directory where checkpoints, results and summaries are saved.
    pub output_dir: PathBuf,
    /// Checkpoint file loading method.
    #[serde(default)]
    pub resume: LoadCheckpoint,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let steps = &self.solver.steps;
        ensure!(
            steps.windows(2).all(|pair| pair[0] < pair[1]),
            "solver steps should be a list of increasing integers, but get {:?}",
            steps
        );
        ensure!(self.solver.max_iter > 0, "solver max_iter must be positive");

        let world_size = self.device_config.devices().len();
        ensure!(world_size > 0, "at least one device is required");
        ensure!(
            self.solver.ims_per_batch.get() % world_size == 0,
            "solver ims_per_batch ({}) must be divisible by the number of devices ({})",
            self.solver.ims_per_batch,
            world_size
        );
        ensure!(
            self.test.ims_per_batch.get() % world_size == 0,
            "test ims_per_batch ({}) must be divisible by the number of devices ({})",
            self.test.ims_per_batch,
            world_size
        );
        Ok(())
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// If set, the model only produces class-agnostic box proposals.
        #[serde(default)]
        pub rpn_only: bool,
        /// If set, the model is a single-stage detector and `rpn_only` is ignored.
        #[serde(default)]
        pub retinanet_on: bool,
        pub scene_parser: SceneParserConfig,
    }

    impl ModelConfig {
        /// Whether inference produces proposals instead of classified boxes.
        pub fn box_only(&self) -> bool {
            !self.retinanet_on && self.rpn_only
        }
    }
}

mod input {
    use super::*;

    /// Image preprocessing options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InputConfig {
        #[serde(default = "default_min_size")]
        pub min_size_train: usize,
        #[serde(default = "default_max_size")]
        pub max_size_train: usize,
        #[serde(default = "default_min_size")]
        pub min_size_test: usize,
        #[serde(default = "default_max_size")]
        pub max_size_test: usize,
        /// Per-channel mean subtracted from input pixels.
        #[serde(default = "default_pixel_mean")]
        pub pixel_mean: [f64; 3],
        /// Per-channel standard deviation dividing input pixels.
        #[serde(default = "default_pixel_std")]
        pub pixel_std: [f64; 3],
        /// If set, images are in BGR order with values in 0 to 255.
        #[serde(default = "default_true")]
        pub to_bgr255: bool,
    }

    fn default_min_size() -> usize {
        800
    }

    fn default_max_size() -> usize {
        1333
    }

    fn default_pixel_mean() -> [f64; 3] {
        [102.9801, 115.9465, 122.7717]
    }

    fn default_pixel_std() -> [f64; 3] {
        [1.0, 1.0, 1.0]
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        pub train: SplitConfig,
        pub test: SplitConfig,
    }

    /// A COCO-format dataset split.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SplitConfig {
        pub annotation_file: PathBuf,
        pub image_dir: PathBuf,
    }

    /// Data loading options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DataLoaderConfig {
        /// Batched images are padded to a multiple of this value.
        #[serde(default = "default_size_divisibility")]
        pub size_divisibility: usize,
        /// The seed of training set shuffling.
        #[serde(default)]
        pub shuffle_seed: u64,
        /// The number of batches loaded ahead of the training loop.
        #[serde(default = "default_prefetch")]
        pub prefetch: usize,
    }

    impl Default for DataLoaderConfig {
        fn default() -> Self {
            Self {
                size_divisibility: default_size_divisibility(),
                shuffle_seed: 0,
                prefetch: default_prefetch(),
            }
        }
    }

    fn default_size_divisibility() -> usize {
        32
    }

    fn default_prefetch() -> usize {
        2
    }
}

mod solver {
    use super::*;

    /// Optimization options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SolverConfig {
        pub base_lr: R64,
        #[serde(default = "default_momentum")]
        pub momentum: R64,
        #[serde(default = "default_weight_decay")]
        pub weight_decay: R64,
        /// Iterations where the learning rate is multiplied by `gamma`.
        #[serde(default)]
        pub steps: Vec<usize>,
        #[serde(default = "default_gamma")]
        pub gamma: R64,
        #[serde(default = "default_warmup_factor")]
        pub warmup_factor: R64,
        #[serde(default = "default_warmup_iters")]
        pub warmup_iters: usize,
        #[serde(default)]
        pub warmup_method: WarmupMethod,
        /// Save a checkpoint file per this number of iterations.
        pub checkpoint_period: NonZeroUsize,
        pub max_iter: usize,
        /// The batch size summed over all devices.
        pub ims_per_batch: NonZeroUsize,
    }

    /// The learning rate warmup strategy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum WarmupMethod {
        Constant,
        Linear,
    }

    impl Default for WarmupMethod {
        fn default() -> Self {
            Self::Linear
        }
    }

    fn default_momentum() -> R64 {
        r64(0.9)
    }

    fn default_weight_decay() -> R64 {
        r64(0.0001)
    }

    fn default_gamma() -> R64 {
        r64(0.1)
    }

    fn default_warmup_factor() -> R64 {
        r64(1.0 / 3.0)
    }

    fn default_warmup_iters() -> usize {
        500
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the checkpoint recorded in `last_checkpoint` of the output directory.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::FromRecent
        }
    }
}

mod eval {
    use super::*;

    /// Evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TestConfig {
        /// The batch size summed over all devices.
        #[serde(default = "default_test_batch_size")]
        pub ims_per_batch: NonZeroUsize,
        /// Expected metrics checked after evaluation.
        #[serde(default)]
        pub expected_results: Vec<ExpectedResult>,
        /// The tolerance of expected metrics in units of standard deviation.
        #[serde(default = "default_sigma_tol")]
        pub expected_results_sigma_tol: R64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                ims_per_batch: default_test_batch_size(),
                expected_results: vec![],
                expected_results_sigma_tol: default_sigma_tol(),
            }
        }
    }

    /// An expected metric in `[task, metric, mean, std]` form.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ExpectedResult(pub String, pub String, pub R64, pub R64);

    fn default_test_batch_size() -> NonZeroUsize {
        NonZeroUsize::new(8).unwrap()
    }

    fn default_sigma_tol() -> R64 {
        r64(4.0)
    }
}

/// Logging and summary options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write TensorBoard summaries of losses and learning rate.
    #[serde(default = "default_true")]
    pub enable_summary: bool,
    /// Print training status per this number of iterations.
    #[serde(default = "default_log_period")]
    pub log_period: NonZeroUsize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_summary: true,
            log_period: default_log_period(),
        }
    }
}

fn default_log_period() -> NonZeroUsize {
    NonZeroUsize::new(20).unwrap()
}

/// Detection visualization options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizeConfig {
    /// Detections with score below this value are not drawn.
    #[serde(default = "default_visualize_threshold")]
    pub score_threshold: R64,
    /// The TrueType font to render class names. Class names are skipped if unset.
    #[serde(default)]
    pub font_file: Option<PathBuf>,
}

impl Default for VisualizeConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_visualize_threshold(),
            font_file: None,
        }
    }
}

fn default_visualize_threshold() -> R64 {
    r64(0.7)
}

fn default_true() -> bool {
    true
}

mod device {
    use super::*;

    /// Training device options. Each device runs one rank.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DeviceConfig {
        /// Use single device.
        SingleDevice {
            #[serde(with = "tch_serde::serde_device")]
            device: Device,
        },
        /// Use multiple devices with one rank per device.
        MultiDevice {
            #[serde(with = "serde_vec_device")]
            devices: Vec<Device>,
        },
    }

    impl DeviceConfig {
        /// The device of each rank.
        pub fn devices(&self) -> Vec<Device> {
            match self {
                Self::SingleDevice { device } => vec![*device],
                Self::MultiDevice { devices } => devices.clone(),
            }
        }
    }

    mod serde_vec_device {
        use super::*;

        #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
        struct DeviceWrapper(#[serde(with = "tch_serde::serde_device")] Device);

        pub fn serialize<S>(devices: &Vec<Device>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let devices: Vec<_> = devices.iter().cloned().map(DeviceWrapper).collect();
            devices.serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Device>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let devices = Vec::<DeviceWrapper>::deserialize(deserializer)?;
            let devices: Vec<_> = devices
                .into_iter()
                .map(|DeviceWrapper(device)| device)
                .collect();
            Ok(devices)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        model: {
            rpn_only: false,
            scene_parser: { num_classes: 151 },
        },
        input: { min_size_train: 600, max_size_train: 1000 },
        dataset: {
            train: { annotation_file: "vg/train.json", image_dir: "vg/images" },
            test: { annotation_file: "vg/test.json", image_dir: "vg/images" },
        },
        solver: {
            base_lr: 0.005,
            steps: [30000, 45000],
            checkpoint_period: 5000,
            max_iter: 50000,
            ims_per_batch: 4,
        },
        test: {
            expected_results: [["bbox", "AP", 0.21, 0.01]],
        },
        device_config: { type: "MultiDevice", devices: ["cpu", "cpu"] },
        output_dir: "output",
    }"#;

    #[test]
    fn parse_example_config() -> Result<()> {
        let config: Config = json5::from_str(EXAMPLE)?;
        config.validate()?;

        assert_eq!(config.model.scene_parser.num_classes, 151);
        assert!(!config.model.box_only());
        assert_eq!(config.input.min_size_test, 800);
        assert_eq!(config.solver.warmup_method, WarmupMethod::Linear);
        assert_eq!(config.device_config.devices().len(), 2);
        assert_eq!(config.logging.log_period.get(), 20);
        assert!(matches!(config.resume, LoadCheckpoint::FromRecent));
        assert_eq!(
            config.test.expected_results,
            vec![ExpectedResult(
                "bbox".into(),
                "AP".into(),
                r64(0.21),
                r64(0.01)
            )]
        );
        Ok(())
    }

    #[test]
    fn reject_decreasing_steps() -> Result<()> {
        let mut config: Config = json5::from_str(EXAMPLE)?;
        config.solver.steps = vec![100, 50];
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn reject_indivisible_batch_size() -> Result<()> {
        let mut config: Config = json5::from_str(EXAMPLE)?;
        config.solver.ims_per_batch = NonZeroUsize::new(3).unwrap();
        assert!(config.validate().is_err());
        Ok(())
    }
}
