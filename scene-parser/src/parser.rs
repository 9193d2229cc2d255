//! The scene parser model.

use crate::{
    common::*,
    config::SceneParserConfig,
    image_list::ImageList,
    label::{Annotation, Detection, Detections},
    loss::LossDict,
    model::{Backbone, DenseHead, DenseOutput},
    nms::nms,
};

const INPUT_CHANNELS: usize = 3;
const PRE_NMS_TOP_N: usize = 1000;
/// The number of proposals kept per image in box-only mode.
const POST_NMS_TOP_N: usize = 1000;
const MAX_LOG_SIZE: f64 = 10.0;
const BOX_LOSS_BETA: f64 = 1.0 / 9.0;

/// The object detector producing losses in training and detections in inference.
#[derive(Debug)]
pub struct SceneParser {
    backbone: Backbone,
    head: DenseHead,
    config: SceneParserConfig,
    box_only: bool,
}

/// Per-cell training targets.
#[derive(Debug)]
struct DenseTarget {
    /// Objectness targets in `[b, h, w]`.
    obj: Tensor,
    /// Flat `b * h * w` indexes of positive cells.
    positives: Tensor,
    /// Box targets of positive cells in `[n, 4]`.
    bbox: Tensor,
    /// Zero-based foreground class of positive cells.
    class: Tensor,
}

impl SceneParser {
    /// Build the parser. If `box_only` is set, inference produces class-agnostic proposals.
    pub fn new<'p, P>(path: P, config: &SceneParserConfig, box_only: bool) -> Result<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        ensure!(
            config.num_classes >= 2,
            "num_classes must include background and at least one object class"
        );

        let backbone = Backbone::new(path / "backbone", INPUT_CHANNELS, &config.backbone_channels)?;
        let head = DenseHead::new(
            path / "head",
            backbone.out_channels(),
            config.num_classes - 1,
        )?;

        Ok(Self {
            backbone,
            head,
            config: config.clone(),
            box_only,
        })
    }

    pub fn config(&self) -> &SceneParserConfig {
        &self.config
    }

    pub fn box_only(&self) -> bool {
        self.box_only
    }

    fn forward_dense(&self, images: &ImageList, train: bool) -> DenseOutput {
        let features = self.backbone.forward_t(&images.tensors, train);
        self.head.forward_t(&features, train)
    }

    /// Run a training forward pass and compute the losses.
    pub fn forward_train(&self, images: &ImageList, targets: &[Annotation]) -> Result<LossDict> {
        ensure!(
            images.len() == targets.len(),
            "the number of images ({}) and targets ({}) mismatch",
            images.len(),
            targets.len()
        );

        let output = self.forward_dense(images, true);
        let device = output.obj.device();
        let target = self.build_targets(targets, output.grid_size(), device)?;

        let SceneParserConfig {
            box_loss_weight,
            classification_loss_weight,
            objectness_loss_weight,
            num_classes,
            ..
        } = self.config;
        let num_fg = (num_classes - 1) as i64;

        let loss_objectness = output.obj.binary_cross_entropy_with_logits::<Tensor>(
            &target.obj,
            None,
            None,
            Reduction::Mean,
        ) * objectness_loss_weight.raw();

        let (loss_classifier, loss_box_reg) = if target.positives.numel() > 0 {
            let pred_bbox = output
                .bbox
                .permute(&[0, 2, 3, 1])
                .reshape(&[-1, 4])
                .index_select(0, &target.positives);
            let pred_bbox = Tensor::cat(
                &[pred_bbox.narrow(1, 0, 2).sigmoid(), pred_bbox.narrow(1, 2, 2)],
                1,
            );
            let pred_class = output
                .class
                .permute(&[0, 2, 3, 1])
                .reshape(&[-1, num_fg])
                .index_select(0, &target.positives);

            let loss_classifier = pred_class.cross_entropy_for_logits(&target.class)
                * classification_loss_weight.raw();
            let loss_box_reg =
                pred_bbox.smooth_l1_loss(&target.bbox, Reduction::Mean, BOX_LOSS_BETA)
                    * box_loss_weight.raw();
            (loss_classifier, loss_box_reg)
        } else {
            // keep the graph connected when no object is assigned
            let zero = output.class.sum(Kind::Float) * 0.0 + output.bbox.sum(Kind::Float) * 0.0;
            (zero.shallow_clone(), zero)
        };

        let mut losses = LossDict::new();
        losses.insert("loss_objectness", loss_objectness);
        losses.insert("loss_classifier", loss_classifier);
        losses.insert("loss_box_reg", loss_box_reg);
        Ok(losses)
    }

    /// Run inference and produce detections for each image.
    pub fn forward_inference(&self, images: &ImageList) -> Result<Vec<Detections>> {
        tch::no_grad(|| {
            let output = self.forward_dense(images, false);
            let (grid_h, grid_w) = output.grid_size();
            let (grid_h, grid_w) = (grid_h as usize, grid_w as usize);
            let num_fg = self.config.num_classes - 1;
            let stride = self.config.stride() as f64;
            let max_detections = if self.box_only {
                POST_NMS_TOP_N
            } else {
                self.config.detections_per_image
            };

            let to_vec = |tensor: Tensor| -> Vec<f32> {
                let flat = tensor
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .contiguous()
                    .view([-1]);
                Vec::<f32>::from(&flat)
            };
            let obj = to_vec(output.obj.sigmoid());
            let bbox = to_vec(output.bbox);
            let class = to_vec(output.class.softmax(1, Kind::Float));

            let cells = grid_h * grid_w;

            let detections = images
                .image_sizes
                .iter()
                .enumerate()
                .map(|(batch_index, &image_size)| {
                    let [image_h, image_w] = image_size;
                    let mut candidates = vec![];

                    for cell in 0..cells {
                        let gy = cell / grid_w;
                        let gx = cell % grid_w;
                        let obj_score = obj[batch_index * cells + cell] as f64;

                        let bbox_at = |param: usize| -> f64 {
                            bbox[(batch_index * 4 + param) * cells + cell] as f64
                        };
                        let dy = sigmoid(bbox_at(0));
                        let dx = sigmoid(bbox_at(1));
                        let h = bbox_at(2).min(MAX_LOG_SIZE).exp() * stride;
                        let w = bbox_at(3).min(MAX_LOG_SIZE).exp() * stride;
                        let cy = (gy as f64 + dy) * stride;
                        let cx = (gx as f64 + dx) * stride;

                        let tlbr = match TLBR::try_from_cycxhw([cy, cx, h, w]) {
                            Ok(tlbr) => tlbr.clip(image_h as f64, image_w as f64),
                            Err(_) => continue,
                        };
                        if tlbr.area() <= 0.0 {
                            continue;
                        }

                        // proposals are ranked by objectness without thresholding
                        if self.box_only {
                            candidates.push(Detection {
                                tlbr,
                                class_index: 0,
                                score: obj_score,
                            });
                        } else {
                            for fg_index in 0..num_fg {
                                let prob =
                                    class[(batch_index * num_fg + fg_index) * cells + cell] as f64;
                                let score = obj_score * prob;

                                if score > self.config.score_threshold.raw() {
                                    candidates.push(Detection {
                                        tlbr,
                                        class_index: fg_index + 1,
                                        score,
                                    });
                                }
                            }
                        }
                    }

                    // keep the best candidates before suppression
                    candidates.sort_by(|lhs, rhs| {
                        rhs.score
                            .partial_cmp(&lhs.score)
                            .unwrap_or(Ordering::Equal)
                    });
                    candidates.truncate(PRE_NMS_TOP_N);

                    let mut detections = nms(candidates, self.config.nms_threshold.raw());
                    detections.truncate(max_detections);

                    Detections {
                        image_size,
                        detections,
                    }
                })
                .collect();

            Ok(detections)
        })
    }

    fn build_targets(
        &self,
        targets: &[Annotation],
        grid_size: (i64, i64),
        device: Device,
    ) -> Result<DenseTarget> {
        let (grid_h, grid_w) = (grid_size.0 as usize, grid_size.1 as usize);
        let stride = self.config.stride() as f64;
        let num_classes = self.config.num_classes;
        let batch_size = targets.len();

        // (batch, gy, gx) -> (box target, zero-based class)
        let mut assignments: HashMap<(usize, usize, usize), ([f32; 4], i64)> = HashMap::new();

        for (batch_index, annotation) in targets.iter().enumerate() {
            // assign large objects first so that small objects win shared cells
            let objects = annotation
                .objects
                .iter()
                .filter(|obj| {
                    let valid = obj.class_index > 0 && obj.class_index < num_classes;
                    if !valid {
                        warn!("ignore object with invalid class index {}", obj.class_index);
                    }
                    valid && obj.tlbr.h() > 0.0 && obj.tlbr.w() > 0.0
                })
                .sorted_by(|lhs, rhs| {
                    rhs.tlbr
                        .area()
                        .partial_cmp(&lhs.tlbr.area())
                        .unwrap_or(Ordering::Equal)
                });

            for obj in objects {
                let [cy, cx, h, w] = obj.tlbr.cycxhw();
                let gy = ((cy / stride).floor().max(0.0) as usize).min(grid_h - 1);
                let gx = ((cx / stride).floor().max(0.0) as usize).min(grid_w - 1);
                let bbox_target = [
                    (cy / stride - gy as f64).clamp(0.0, 1.0) as f32,
                    (cx / stride - gx as f64).clamp(0.0, 1.0) as f32,
                    (h / stride).ln() as f32,
                    (w / stride).ln() as f32,
                ];
                assignments.insert(
                    (batch_index, gy, gx),
                    (bbox_target, (obj.class_index - 1) as i64),
                );
            }
        }

        let mut obj = vec![0f32; batch_size * grid_h * grid_w];
        let mut positives = vec![];
        let mut bbox = vec![];
        let mut class = vec![];

        for ((batch_index, gy, gx), (bbox_target, class_target)) in assignments
            .into_iter()
            .sorted_by_key(|(key, _)| *key)
        {
            let flat = (batch_index * grid_h + gy) * grid_w + gx;
            obj[flat] = 1.0;
            positives.push(flat as i64);
            bbox.extend_from_slice(&bbox_target);
            class.push(class_target);
        }

        let num_positives = positives.len() as i64;
        debug!(
            "assigned {} positive cells in a batch of {}",
            num_positives, batch_size
        );

        Ok(DenseTarget {
            obj: Tensor::of_slice(&obj)
                .view([batch_size as i64, grid_h as i64, grid_w as i64])
                .to_device(device),
            positives: Tensor::of_slice(&positives).to_device(device),
            bbox: Tensor::of_slice(&bbox)
                .view([num_positives, 4])
                .to_device(device),
            class: Tensor::of_slice(&class).to_device(device),
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
