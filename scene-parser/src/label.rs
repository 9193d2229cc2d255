//! Ground truth and prediction containers.

use crate::common::*;

/// A ground truth object in pixel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub tlbr: TLBR<f64>,
    /// The class index, where zero is reserved for background.
    pub class_index: usize,
}

/// The targets of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Image size in `[height, width]`.
    pub image_size: [usize; 2],
    pub objects: Vec<ObjectLabel>,
}

impl Annotation {
    /// Rescale boxes to a new image size.
    pub fn resize(&self, image_size: [usize; 2]) -> Self {
        let (scale_y, scale_x) = scale_factors(self.image_size, image_size);
        let objects = self
            .objects
            .iter()
            .map(|obj| ObjectLabel {
                tlbr: obj.tlbr.scale(scale_y, scale_x),
                class_index: obj.class_index,
            })
            .collect();

        Self {
            image_size,
            objects,
        }
    }
}

/// A predicted box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub tlbr: TLBR<f64>,
    /// The class index. Class-agnostic proposals use zero.
    pub class_index: usize,
    pub score: f64,
}

/// The predictions on one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    /// Image size in `[height, width]`.
    pub image_size: [usize; 2],
    pub detections: Vec<Detection>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Rescale boxes to a new image size.
    pub fn resize(&self, image_size: [usize; 2]) -> Self {
        let (scale_y, scale_x) = scale_factors(self.image_size, image_size);
        let detections = self
            .detections
            .iter()
            .map(|det| Detection {
                tlbr: det.tlbr.scale(scale_y, scale_x),
                ..*det
            })
            .collect();

        Self {
            image_size,
            detections,
        }
    }
}

fn scale_factors(from: [usize; 2], to: [usize; 2]) -> (f64, f64) {
    let [from_h, from_w] = from;
    let [to_h, to_w] = to;
    (to_h as f64 / from_h as f64, to_w as f64 / from_w as f64)
}
