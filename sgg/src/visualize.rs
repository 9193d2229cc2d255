//! Drawing predictions onto test images.

use crate::{common::*, config::VisualizeConfig, data::SceneDataset};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect as PixelRect,
};

const PALETTE: [u64; 3] = [(1 << 25) - 1, (1 << 15) - 1, (1 << 21) - 1];
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const FONT_SIZE: f32 = 12.0;

/// Keep detections scoring above `threshold` in decreasing score order.
pub fn select_top_predictions(predictions: &Detections, threshold: f64) -> Detections {
    let detections = predictions
        .detections
        .iter()
        .filter(|det| det.score > threshold)
        .cloned()
        .sorted_by(|lhs, rhs| {
            rhs.score
                .partial_cmp(&lhs.score)
                .unwrap_or(Ordering::Equal)
        })
        .collect();

    Detections {
        image_size: predictions.image_size,
        detections,
    }
}

/// The box color of a class index.
pub fn compute_color(class_index: usize) -> Rgb<u8> {
    let [r, g, b] = PALETTE.map(|p| (class_index as u64 * p % 255) as u8);
    Rgb([r, g, b])
}

/// Draw the box of every detection.
pub fn overlay_boxes(image: &mut RgbImage, detections: &Detections) {
    let (width, height) = image.dimensions();

    for det in &detections.detections {
        let t = det.tlbr.t().max(0.0).round() as i32;
        let l = det.tlbr.l().max(0.0).round() as i32;
        let b = det.tlbr.b().min(height as f64 - 1.0).round() as i32;
        let r = det.tlbr.r().min(width as f64 - 1.0).round() as i32;
        if b <= t || r <= l {
            continue;
        }

        let rect = PixelRect::at(l, t).of_size((r - l) as u32, (b - t) as u32);
        draw_hollow_rect_mut(image, rect, compute_color(det.class_index));
    }
}

/// Write `name: score` at the top-left corner of every detection.
pub fn overlay_class_names(
    image: &mut RgbImage,
    detections: &Detections,
    class_names: &IndexSet<String>,
    font: &FontVec,
) {
    let scale = PxScale::from(FONT_SIZE);

    for det in &detections.detections {
        let name = class_names
            .get_index(det.class_index)
            .map(|name| name.as_str())
            .unwrap_or("unknown");
        let text = format!("{}: {:.2}", name, det.score);
        let x = det.tlbr.l().max(0.0) as i32;
        let y = det.tlbr.t().max(0.0) as i32;
        draw_text_mut(image, TEXT_COLOR, x, y, scale, font, &text);
    }
}

/// Convert a `[3, height, width]` RGB `u8` tensor to an image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = tensor.size3()?;
    ensure!(channels == 3, "expect 3 channels, but get {}", channels);
    ensure!(tensor.kind() == Kind::Uint8, "expect uint8 tensor");

    let data = Vec::<u8>::from(
        &tensor
            .to_device(Device::Cpu)
            .permute(&[1, 2, 0])
            .contiguous()
            .view([-1]),
    );
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| format_err!("image buffer size mismatch"))
}

/// Saves test images with predictions drawn.
#[derive(Debug)]
pub struct Visualizer {
    output_dir: PathBuf,
    score_threshold: f64,
    font: Option<FontVec>,
}

impl Visualizer {
    /// Create a visualizer writing under `<output_dir>/visualize`.
    pub fn new<P>(output_dir: P, config: &VisualizeConfig) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let font = config
            .font_file
            .as_ref()
            .map(|path| -> Result<_> {
                let bytes = fs::read(path)
                    .with_context(|| format!("failed to read font file '{}'", path.display()))?;
                let font = FontVec::try_from_vec(bytes)
                    .map_err(|_| format_err!("invalid font file '{}'", path.display()))?;
                Ok(font)
            })
            .transpose()?;
        if font.is_none() {
            warn!("no font file is configured, class names will not be drawn");
        }

        let output_dir = output_dir.as_ref().join("visualize");
        fs::create_dir_all(&output_dir)?;

        Ok(Self {
            output_dir,
            score_threshold: config.score_threshold.raw(),
            font,
        })
    }

    /// Draw predictions on a batch and write `detection_<id>.jpg` per image.
    ///
    /// Predictions are in the scale of the transformed images in `images`.
    pub fn visualize_detection(
        &self,
        dataset: &SceneDataset,
        image_ids: &[usize],
        images: &ImageList,
        predictions: &[Detections],
    ) -> Result<()> {
        ensure!(
            image_ids.len() == predictions.len() && images.len() == predictions.len(),
            "batch size mismatch"
        );

        for (index, (&image_id, prediction)) in izip!(image_ids, predictions).enumerate() {
            let [height, width] = images.image_sizes[index];
            let tensor = images
                .tensors
                .get(index as i64)
                .narrow(1, 0, height as i64)
                .narrow(2, 0, width as i64);
            let mut image = tensor_to_image(&dataset.transforms().denormalize(&tensor))?;

            let top = select_top_predictions(prediction, self.score_threshold);
            overlay_boxes(&mut image, &top);
            if let Some(font) = &self.font {
                overlay_class_names(&mut image, &top, dataset.ind_to_classes(), font);
            }

            let path = self.output_dir.join(format!("detection_{}.jpg", image_id));
            image
                .save(&path)
                .with_context(|| format!("failed to save '{}'", path.display()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(score: f64, class_index: usize) -> Detection {
        Detection {
            tlbr: TLBR::try_from_tlbr([2.0, 2.0, 8.0, 12.0]).unwrap(),
            class_index,
            score,
        }
    }

    #[test]
    fn top_predictions_are_sorted() {
        let dets = Detections {
            image_size: [16, 16],
            detections: vec![detection(0.5, 1), detection(0.9, 2), detection(0.2, 1)],
        };
        let top = select_top_predictions(&dets, 0.3);
        let scores: Vec<_> = top.detections.iter().map(|det| det.score).collect();
        assert_eq!(scores, vec![0.9, 0.5]);
        assert_eq!(top.image_size, [16, 16]);
    }

    #[test]
    fn palette_colors() {
        assert_eq!(compute_color(0), Rgb([0, 0, 0]));
        assert_eq!(
            compute_color(1),
            Rgb([
                (33554431u64 % 255) as u8,
                (32767u64 % 255) as u8,
                (2097151u64 % 255) as u8
            ])
        );
    }

    #[test]
    fn draw_boxes_on_image() -> Result<()> {
        let tensor = Tensor::zeros(&[3, 16, 16], (Kind::Uint8, Device::Cpu));
        let mut image = tensor_to_image(&tensor)?;
        assert_eq!(image.dimensions(), (16, 16));

        let dets = Detections {
            image_size: [16, 16],
            detections: vec![detection(0.9, 1)],
        };
        overlay_boxes(&mut image, &dets);
        assert_eq!(*image.get_pixel(2, 2), compute_color(1));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
        Ok(())
    }
}
