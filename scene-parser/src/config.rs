//! Scene parser configuration format.

use crate::common::*;

/// The scene parser options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneParserConfig {
    /// The number of classes including the background class.
    pub num_classes: usize,
    /// Output channels of each strided backbone stage.
    #[serde(default = "default_backbone_channels")]
    pub backbone_channels: Vec<usize>,
    /// The minimum score of a detection kept at inference.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: R64,
    /// The IoU threshold of non-maximum suppression.
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: R64,
    /// The maximum number of detections per image.
    #[serde(default = "default_detections_per_image")]
    pub detections_per_image: usize,
    /// The weighting factor of box regression loss.
    #[serde(default = "default_loss_weight")]
    pub box_loss_weight: R64,
    /// The weighting factor of classification loss.
    #[serde(default = "default_loss_weight")]
    pub classification_loss_weight: R64,
    /// The weighting factor of objectness loss.
    #[serde(default = "default_loss_weight")]
    pub objectness_loss_weight: R64,
}

impl SceneParserConfig {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            backbone_channels: default_backbone_channels(),
            score_threshold: default_score_threshold(),
            nms_threshold: default_nms_threshold(),
            detections_per_image: default_detections_per_image(),
            box_loss_weight: default_loss_weight(),
            classification_loss_weight: default_loss_weight(),
            objectness_loss_weight: default_loss_weight(),
        }
    }

    /// The ratio of input size to the size of the output feature map.
    pub fn stride(&self) -> usize {
        1 << self.backbone_channels.len()
    }
}

fn default_backbone_channels() -> Vec<usize> {
    vec![32, 64, 128, 256]
}

fn default_score_threshold() -> R64 {
    r64(0.05)
}

fn default_nms_threshold() -> R64 {
    r64(0.5)
}

fn default_detections_per_image() -> usize {
    100
}

fn default_loss_weight() -> R64 {
    r64(1.0)
}
