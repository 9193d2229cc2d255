//! Bounding box and proposal evaluation.

mod coco;
pub use coco::*;

mod expected;
pub use expected::*;

mod recall;
pub use recall::*;

use crate::{common::*, config::ExpectedResult, data::SceneDataset};

const PROPOSAL_LIMITS: [usize; 2] = [100, 1000];

/// The kind of predictions to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IouType {
    Bbox,
}

impl IouType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bbox => "bbox",
        }
    }
}

/// Evaluation options.
#[derive(Debug, Clone)]
pub struct EvalArgs {
    /// Evaluate class-agnostic proposal recall instead of detection precision.
    pub box_only: bool,
    pub iou_types: Vec<IouType>,
    pub expected_results: Vec<ExpectedResult>,
    pub expected_results_sigma_tol: R64,
}

/// Metrics grouped by task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    results: IndexMap<String, IndexMap<String, f64>>,
}

impl EvalResults {
    pub fn insert<T, M>(&mut self, task: T, metric: M, value: f64)
    where
        T: Into<String>,
        M: Into<String>,
    {
        self.results
            .entry(task.into())
            .or_default()
            .insert(metric.into(), value);
    }

    pub fn get(&self, task: &str, metric: &str) -> Option<f64> {
        self.results.get(task)?.get(metric).copied()
    }

    /// Iterate `(task, metric, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.results.iter().flat_map(|(task, metrics)| {
            metrics
                .iter()
                .map(move |(metric, &value)| (task.as_str(), metric.as_str(), value))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Display for EvalResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (task, metrics) in &self.results {
            writeln!(f, "Task: {}", task)?;
            writeln!(f, "{}", metrics.keys().join(", "))?;
            writeln!(
                f,
                "{}",
                metrics.values().map(|value| format!("{:.4}", value)).join(", ")
            )?;
        }
        Ok(())
    }
}

/// Evaluate predictions indexed by dataset image index.
///
/// Predictions are rescaled to the original image sizes. If `output_folder` is given,
/// `bbox.json` and `coco_results.json` are written there.
pub fn evaluate(
    dataset: &SceneDataset,
    predictions: &[Detections],
    output_folder: Option<&Path>,
    args: &EvalArgs,
) -> Result<EvalResults> {
    // SequentialBatchSampler shards the test split without padding, so the
    // gathered predictions cover every image exactly once.
    ensure!(
        predictions.len() == dataset.len(),
        "expect predictions of {} images, but get {}",
        dataset.len(),
        predictions.len()
    );

    if let Some(dir) = output_folder {
        fs::create_dir_all(dir)?;
    }

    let (ground_truth, predictions): (Vec<Annotation>, Vec<Detections>) = predictions
        .iter()
        .enumerate()
        .map(|(index, prediction)| -> Result<_> {
            let info = dataset
                .image_info(index)
                .ok_or_else(|| format_err!("image index {} is out of bound", index))?;
            let gt = dataset
                .annotation(index)
                .ok_or_else(|| format_err!("image index {} is out of bound", index))?;
            Ok((gt.clone(), prediction.resize([info.height, info.width])))
        })
        .process_results(|iter| iter.unzip())?;

    let mut results = EvalResults::default();

    if args.box_only {
        info!("Evaluating bbox proposals");

        for limit in PROPOSAL_LIMITS {
            for (area, suffix) in [("all", ""), ("small", "s"), ("medium", "m"), ("large", "l")] {
                let recall =
                    evaluate_box_proposals(&ground_truth, &predictions, area, Some(limit))?;
                results.insert("box_proposal", format!("AR{}@{}", suffix, limit), recall.ar);
            }
        }
    } else {
        for iou_type in &args.iou_types {
            match iou_type {
                IouType::Bbox => {
                    info!("Preparing bbox results");
                    let coco_results = prepare_for_coco_detection(dataset, &predictions)?;

                    if let Some(dir) = output_folder {
                        let path = dir.join("bbox.json");
                        fs::write(&path, serde_json::to_string(&coco_results)?)
                            .with_context(|| format!("failed to write '{}'", path.display()))?;
                    }

                    info!("Evaluating predictions");
                    let metrics = BboxEvaluator::default().evaluate(&ground_truth, &predictions)?;
                    for (metric, value) in metrics.to_pairs() {
                        results.insert(iou_type.as_str(), metric, value);
                    }
                }
            }
        }
    }

    info!("\n{}", results);
    check_expected_results(
        &results,
        &args.expected_results,
        args.expected_results_sigma_tol,
    );

    if let Some(dir) = output_folder {
        let path = dir.join("coco_results.json");
        fs::write(&path, serde_json::to_string_pretty(&results)?)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
    }

    Ok(results)
}

/// Convert predictions in original image size to COCO results.
fn prepare_for_coco_detection(
    dataset: &SceneDataset,
    predictions: &[Detections],
) -> Result<Vec<CocoResult>> {
    let mut coco_results = vec![];

    for (index, prediction) in predictions.iter().enumerate() {
        let image_id = dataset
            .image_info(index)
            .ok_or_else(|| format_err!("image index {} is out of bound", index))?
            .id;

        for det in &prediction.detections {
            let category_id = dataset
                .category_id(det.class_index)
                .filter(|_| det.class_index > 0)
                .ok_or_else(|| format_err!("invalid class index {}", det.class_index))?;

            coco_results.push(CocoResult {
                image_id,
                category_id,
                bbox: [det.tlbr.l(), det.tlbr.t(), det.tlbr.w(), det.tlbr.h()],
                score: det.score,
            });
        }
    }

    Ok(coco_results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CocoDataset, Transforms};
    use approx::abs_diff_eq;

    fn dataset() -> SceneDataset {
        let coco: CocoDataset = serde_json::from_str(
            r#"{
                "images": [{"id": 42, "file_name": "a.png", "height": 100, "width": 200}],
                "annotations": [{"image_id": 42, "category_id": 5, "bbox": [20, 10, 40, 30]}],
                "categories": [{"id": 5, "name": "cup"}]
            }"#,
        )
        .unwrap();
        let transforms = Transforms {
            min_size: 200,
            max_size: 400,
            pixel_mean: [0.0; 3],
            pixel_std: [1.0; 3],
            to_bgr255: true,
        };
        SceneDataset::from_coco(coco, "images", transforms, false).unwrap()
    }

    fn args(box_only: bool) -> EvalArgs {
        EvalArgs {
            box_only,
            iou_types: vec![IouType::Bbox],
            expected_results: vec![],
            expected_results_sigma_tol: r64(4.0),
        }
    }

    /// The ground truth box predicted on the image resized to 200x400.
    fn predictions(class_index: usize) -> Vec<Detections> {
        vec![Detections {
            image_size: [200, 400],
            detections: vec![Detection {
                tlbr: TLBR::try_from_tlbr([20.0, 40.0, 80.0, 120.0]).unwrap(),
                class_index,
                score: 0.8,
            }],
        }]
    }

    #[test]
    fn evaluate_bbox() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let results = evaluate(&dataset(), &predictions(1), Some(dir.path()), &args(false))?;

        assert!(abs_diff_eq!(results.get("bbox", "AP").unwrap(), 1.0));
        assert!(abs_diff_eq!(results.get("bbox", "AP50").unwrap(), 1.0));

        let text = fs::read_to_string(dir.path().join("bbox.json"))?;
        let coco_results: Vec<CocoResult> = serde_json::from_str(&text)?;
        assert_eq!(
            coco_results,
            vec![CocoResult {
                image_id: 42,
                category_id: 5,
                bbox: [20.0, 10.0, 40.0, 30.0],
                score: 0.8,
            }]
        );
        assert!(dir.path().join("coco_results.json").is_file());
        Ok(())
    }

    #[test]
    fn evaluate_proposals() -> Result<()> {
        let results = evaluate(&dataset(), &predictions(0), None, &args(true))?;
        let metrics: Vec<_> = results.iter().map(|(_, metric, _)| metric).collect();
        assert_eq!(
            metrics,
            vec![
                "AR@100", "ARs@100", "ARm@100", "ARl@100", "AR@1000", "ARs@1000", "ARm@1000",
                "ARl@1000"
            ]
        );
        assert!(abs_diff_eq!(results.get("box_proposal", "AR@100").unwrap(), 1.0));
        Ok(())
    }

    #[test]
    fn reject_mismatched_predictions() {
        assert!(evaluate(&dataset(), &[], None, &args(false)).is_err());
    }
}
