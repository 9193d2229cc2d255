//! Image resizing and normalization.

use crate::{common::*, config::InputConfig};

/// The preprocessing applied to every image and its targets.
#[derive(Debug, Clone)]
pub struct Transforms {
    pub min_size: usize,
    pub max_size: usize,
    pub pixel_mean: [f64; 3],
    pub pixel_std: [f64; 3],
    pub to_bgr255: bool,
}

impl Transforms {
    pub fn for_training(config: &InputConfig) -> Self {
        Self {
            min_size: config.min_size_train,
            max_size: config.max_size_train,
            pixel_mean: config.pixel_mean,
            pixel_std: config.pixel_std,
            to_bgr255: config.to_bgr255,
        }
    }

    pub fn for_testing(config: &InputConfig) -> Self {
        Self {
            min_size: config.min_size_test,
            max_size: config.max_size_test,
            ..Self::for_training(config)
        }
    }

    /// The output `[height, width]` that makes the shorter side `min_size`
    /// unless the longer side exceeds `max_size`.
    pub fn target_size(&self, image_size: [usize; 2]) -> [usize; 2] {
        let [h, w] = image_size;
        let mut size = self.min_size as f64;

        let min_orig = h.min(w) as f64;
        let max_orig = h.max(w) as f64;
        if max_orig / min_orig * size > self.max_size as f64 {
            size = (self.max_size as f64 * min_orig / max_orig).round();
        }
        let size_int = size as usize;

        if (w <= h && w == size_int) || (h <= w && h == size_int) {
            return [h, w];
        }

        if w < h {
            [(size * h as f64 / w as f64) as usize, size_int]
        } else {
            [size_int, (size * w as f64 / h as f64) as usize]
        }
    }

    /// Resize and normalize an RGB `u8` image in `[3, height, width]` shape, and rescale
    /// the annotation accordingly.
    pub fn apply(&self, image: &Tensor, annotation: &Annotation) -> Result<(Tensor, Annotation)> {
        let (_c, h, w) = image.size3()?;
        let [out_h, out_w] = self.target_size([h as usize, w as usize]);

        let resized = if [out_h, out_w] == [h as usize, w as usize] {
            image.shallow_clone()
        } else {
            vision::image::resize(image, out_w as i64, out_h as i64)?
        };
        let normalized = self.normalize(&resized);
        let annotation = annotation.resize([out_h, out_w]);

        Ok((normalized, annotation))
    }

    fn normalize(&self, image: &Tensor) -> Tensor {
        let image = image.to_kind(Kind::Float);
        let image = if self.to_bgr255 {
            image.flip(&[0])
        } else {
            image / 255.0
        };
        let mean = Tensor::of_slice(&self.pixel_mean)
            .to_kind(Kind::Float)
            .view([3, 1, 1]);
        let std = Tensor::of_slice(&self.pixel_std)
            .to_kind(Kind::Float)
            .view([3, 1, 1]);
        (image - mean) / std
    }

    /// Undo normalization and produce an RGB `u8` image in `[3, height, width]` shape.
    pub fn denormalize(&self, image: &Tensor) -> Tensor {
        let device = image.device();
        let mean = Tensor::of_slice(&self.pixel_mean)
            .to_kind(Kind::Float)
            .view([3, 1, 1])
            .to_device(device);
        let std = Tensor::of_slice(&self.pixel_std)
            .to_kind(Kind::Float)
            .view([3, 1, 1])
            .to_device(device);
        let image = image.to_kind(Kind::Float) * std + mean;
        let image = if self.to_bgr255 {
            image.flip(&[0])
        } else {
            image * 255.0
        };
        image.clamp(0.0, 255.0).to_kind(Kind::Uint8)
    }
}
