//! COCO-style bounding box average precision.

use crate::common::*;

/// `[min, max)` object areas of the all/small/medium/large ranges.
pub const AREA_RANGES: [(&str, f64, f64); 4] = [
    ("all", 0.0, 1e10),
    ("small", 0.0, 32.0 * 32.0),
    ("medium", 32.0 * 32.0, 96.0 * 96.0),
    ("large", 96.0 * 96.0, 1e10),
];

/// A detection in the COCO results format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoResult {
    pub image_id: i64,
    pub category_id: i64,
    /// Box in `[x, y, width, height]`.
    pub bbox: [f64; 4],
    pub score: f64,
}

/// The summary metrics of bounding box evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct BboxMetrics {
    pub AP: f64,
    pub AP50: f64,
    pub AP75: f64,
    pub APs: f64,
    pub APm: f64,
    pub APl: f64,
}

impl BboxMetrics {
    pub fn to_pairs(&self) -> [(&'static str, f64); 6] {
        [
            ("AP", self.AP),
            ("AP50", self.AP50),
            ("AP75", self.AP75),
            ("APs", self.APs),
            ("APm", self.APm),
            ("APl", self.APl),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct PrecRec {
    pub precision: f64,
    pub recall: f64,
}

/// Computes interpolated average precision from precision/recall curves.
#[derive(Debug, Clone)]
pub struct ApCalculator {
    num_points: usize,
}

impl ApCalculator {
    /// The 101-point interpolation used by COCO.
    pub fn new_coco() -> Self {
        Self { num_points: 101 }
    }

    pub fn new(num_points: usize) -> Result<Self> {
        ensure!(
            num_points >= 2,
            "invalid number of interpolated points {}",
            num_points
        );
        Ok(Self { num_points })
    }

    /// Compute average precision from a curve ordered by non-decreasing recall.
    ///
    /// The precision at recall `r` is the maximum precision at any recall `>= r`,
    /// and zero if `r` is never reached.
    pub fn compute_by_prec_rec(&self, sorted_prec_rec: &[PrecRec]) -> f64 {
        // precision envelope
        let mut envelope: Vec<f64> = sorted_prec_rec.iter().map(|pr| pr.precision).collect();
        for index in (0..envelope.len().saturating_sub(1)).rev() {
            envelope[index] = envelope[index].max(envelope[index + 1]);
        }

        let sum: f64 = (0..self.num_points)
            .map(|index| {
                let recall = index as f64 / (self.num_points - 1) as f64;
                let pos = sorted_prec_rec.partition_point(|pr| pr.recall < recall);
                envelope.get(pos).copied().unwrap_or(0.0)
            })
            .sum();
        sum / self.num_points as f64
    }
}

/// The mean of values, or -1 if there are none.
fn mean_or_missing<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), &value| {
        (sum + value, count + 1)
    });
    if count == 0 {
        -1.0
    } else {
        sum / count as f64
    }
}

/// A scored detection after matching.
#[derive(Debug, Clone, Copy)]
struct MatchedDetection {
    score: f64,
    is_tp: bool,
    ignored: bool,
}

/// Per image and class boxes with the pairwise IoU precomputed.
#[derive(Debug)]
struct ImageClassEntry {
    gt_areas: Vec<f64>,
    det_scores: Vec<f64>,
    det_areas: Vec<f64>,
    /// IoU in `[num_dets][num_gts]`.
    ious: Vec<Vec<f64>>,
}

/// Evaluates bounding boxes with COCO semantics.
#[derive(Debug, Clone)]
pub struct BboxEvaluator {
    iou_thresholds: Vec<f64>,
    max_dets: usize,
    ap_calculator: ApCalculator,
}

impl Default for BboxEvaluator {
    fn default() -> Self {
        Self {
            iou_thresholds: (0..10).map(|index| 0.5 + index as f64 * 0.05).collect(),
            max_dets: 100,
            ap_calculator: ApCalculator::new_coco(),
        }
    }
}

impl BboxEvaluator {
    /// Compute the metrics over images, given ground truth and detections of
    /// the same image at the same index and in the same pixel scale.
    pub fn evaluate(
        &self,
        ground_truth: &[Annotation],
        detections: &[Detections],
    ) -> Result<BboxMetrics> {
        ensure!(
            ground_truth.len() == detections.len(),
            "the number of ground truth ({}) and predictions ({}) mismatch",
            ground_truth.len(),
            detections.len()
        );

        let entries = self.collect_entries(ground_truth, detections);
        let classes: Vec<usize> = entries
            .keys()
            .map(|(class_index, _)| *class_index)
            .unique()
            .collect();

        // ap[area][iou] per class, None if the class has no ground truth in the range
        let mut aps = vec![vec![vec![]; self.iou_thresholds.len()]; AREA_RANGES.len()];

        for &class_index in &classes {
            let class_entries: Vec<&ImageClassEntry> = entries
                .range((class_index, 0)..(class_index + 1, 0))
                .map(|(_, entry)| entry)
                .collect();

            for (area_index, &(_, min_area, max_area)) in AREA_RANGES.iter().enumerate() {
                for (iou_index, &iou_threshold) in self.iou_thresholds.iter().enumerate() {
                    if let Some(ap) =
                        self.class_ap(&class_entries, iou_threshold, min_area, max_area)
                    {
                        aps[area_index][iou_index].push(ap);
                    }
                }
            }
        }

        let area_mean = |area_index: usize| mean_or_missing(aps[area_index].iter().flatten());

        Ok(BboxMetrics {
            AP: area_mean(0),
            AP50: mean_or_missing(aps[0][0].iter()),
            AP75: mean_or_missing(aps[0][5].iter()),
            APs: area_mean(1),
            APm: area_mean(2),
            APl: area_mean(3),
        })
    }

    fn collect_entries(
        &self,
        ground_truth: &[Annotation],
        detections: &[Detections],
    ) -> BTreeMap<(usize, usize), ImageClassEntry> {
        let mut entries = BTreeMap::new();

        for (image_index, (gt, dets)) in izip!(ground_truth, detections).enumerate() {
            let gt_groups = gt
                .objects
                .iter()
                .map(|obj| (obj.class_index, obj.tlbr))
                .into_group_map();
            let det_groups = dets
                .detections
                .iter()
                .map(|det| (det.class_index, det))
                .into_group_map();
            let class_indexes: HashSet<usize> =
                gt_groups.keys().chain(det_groups.keys()).copied().collect();

            for class_index in class_indexes {
                let gts = gt_groups.get(&class_index).cloned().unwrap_or_default();
                let dets: Vec<&Detection> = det_groups
                    .get(&class_index)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .sorted_by(|lhs, rhs| {
                        rhs.score
                            .partial_cmp(&lhs.score)
                            .unwrap_or(Ordering::Equal)
                    })
                    .take(self.max_dets)
                    .collect();

                let ious = dets
                    .iter()
                    .map(|det| gts.iter().map(|gt| det.tlbr.iou_with(gt)).collect())
                    .collect();

                entries.insert(
                    (class_index, image_index),
                    ImageClassEntry {
                        gt_areas: gts.iter().map(|gt| gt.area()).collect(),
                        det_scores: dets.iter().map(|det| det.score).collect(),
                        det_areas: dets.iter().map(|det| det.tlbr.area()).collect(),
                        ious,
                    },
                );
            }
        }

        entries
    }

    fn class_ap(
        &self,
        entries: &[&ImageClassEntry],
        iou_threshold: f64,
        min_area: f64,
        max_area: f64,
    ) -> Option<f64> {
        let in_range = |area: f64| area >= min_area && area <= max_area;
        let mut num_gts = 0;
        let mut matched_dets = vec![];

        for entry in entries {
            let gt_ignored: Vec<bool> = entry.gt_areas.iter().map(|&area| !in_range(area)).collect();
            num_gts += gt_ignored.iter().filter(|&&ignored| !ignored).count();

            // visit non-ignored ground truth first
            let gt_order: Vec<usize> = (0..gt_ignored.len())
                .sorted_by_key(|&index| gt_ignored[index])
                .collect();
            let mut gt_taken = vec![false; gt_ignored.len()];

            for (det_index, &score) in entry.det_scores.iter().enumerate() {
                let mut best_iou = iou_threshold.min(1.0 - 1e-10);
                let mut best_gt: Option<usize> = None;

                for &gt_index in &gt_order {
                    if gt_taken[gt_index] {
                        continue;
                    }
                    // stop once a regular match is found and only ignored ones remain
                    if let Some(matched) = best_gt {
                        if !gt_ignored[matched] && gt_ignored[gt_index] {
                            break;
                        }
                    }
                    let iou = entry.ious[det_index][gt_index];
                    if iou < best_iou {
                        continue;
                    }
                    best_iou = iou;
                    best_gt = Some(gt_index);
                }

                let matched = match best_gt {
                    Some(gt_index) => {
                        gt_taken[gt_index] = true;
                        MatchedDetection {
                            score,
                            is_tp: true,
                            ignored: gt_ignored[gt_index],
                        }
                    }
                    None => MatchedDetection {
                        score,
                        is_tp: false,
                        ignored: !in_range(entry.det_areas[det_index]),
                    },
                };
                matched_dets.push(matched);
            }
        }

        if num_gts == 0 {
            return None;
        }

        // stable sort by decreasing score
        matched_dets.sort_by(|lhs, rhs| {
            rhs.score
                .partial_cmp(&lhs.score)
                .unwrap_or(Ordering::Equal)
        });

        let prec_rec: Vec<PrecRec> = matched_dets
            .into_iter()
            .filter(|det| !det.ignored)
            .scan((0usize, 0usize), |(acc_tp, acc_fp), det| {
                if det.is_tp {
                    *acc_tp += 1;
                } else {
                    *acc_fp += 1;
                }
                let tp = *acc_tp as f64;
                let fp = *acc_fp as f64;
                Some(PrecRec {
                    precision: tp / (tp + fp),
                    recall: tp / num_gts as f64,
                })
            })
            .collect();

        Some(self.ap_calculator.compute_by_prec_rec(&prec_rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn object(tlbr: [f64; 4], class_index: usize) -> ObjectLabel {
        ObjectLabel {
            tlbr: TLBR::try_from_tlbr(tlbr).unwrap(),
            class_index,
        }
    }

    fn detection(tlbr: [f64; 4], class_index: usize, score: f64) -> Detection {
        Detection {
            tlbr: TLBR::try_from_tlbr(tlbr).unwrap(),
            class_index,
            score,
        }
    }

    #[test]
    fn envelope_interpolation() -> Result<()> {
        let ap_cal = ApCalculator::new_coco();
        let perfect = [PrecRec {
            precision: 1.0,
            recall: 1.0,
        }];
        assert!(abs_diff_eq!(ap_cal.compute_by_prec_rec(&perfect), 1.0));

        // reaching half recall with full precision covers recall points 0.00..=0.50
        let half = [PrecRec {
            precision: 1.0,
            recall: 0.5,
        }];
        assert!(abs_diff_eq!(ap_cal.compute_by_prec_rec(&half), 51.0 / 101.0));

        let ap_cal_11 = ApCalculator::new(11)?;
        let curve = [
            PrecRec {
                precision: 1.0,
                recall: 0.2,
            },
            PrecRec {
                precision: 0.5,
                recall: 0.2,
            },
            PrecRec {
                precision: 0.6,
                recall: 0.6,
            },
        ];
        // 0.0..=0.2 -> 1.0, 0.3..=0.6 -> 0.6, 0.7..=1.0 -> 0
        assert!(abs_diff_eq!(
            ap_cal_11.compute_by_prec_rec(&curve),
            (3.0 * 1.0 + 4.0 * 0.6) / 11.0,
            epsilon = 1e-12
        ));
        Ok(())
    }

    #[test]
    fn perfect_detections() -> Result<()> {
        let gt = vec![Annotation {
            image_size: [200, 200],
            objects: vec![
                object([10.0, 10.0, 20.0, 20.0], 1),
                object([50.0, 50.0, 150.0, 150.0], 2),
            ],
        }];
        let dets = vec![Detections {
            image_size: [200, 200],
            detections: vec![
                detection([10.0, 10.0, 20.0, 20.0], 1, 0.9),
                detection([50.0, 50.0, 150.0, 150.0], 2, 0.8),
            ],
        }];

        let metrics = BboxEvaluator::default().evaluate(&gt, &dets)?;
        assert!(abs_diff_eq!(metrics.AP, 1.0));
        assert!(abs_diff_eq!(metrics.AP50, 1.0));
        assert!(abs_diff_eq!(metrics.APs, 1.0));
        assert!(abs_diff_eq!(metrics.APl, 1.0));
        // no medium-sized object exists
        assert_eq!(metrics.APm, -1.0);
        Ok(())
    }

    #[test]
    fn misses_and_false_positives() -> Result<()> {
        let gt = vec![Annotation {
            image_size: [100, 100],
            objects: vec![
                object([0.0, 0.0, 40.0, 40.0], 1),
                object([50.0, 50.0, 90.0, 90.0], 1),
            ],
        }];
        let dets = vec![Detections {
            image_size: [100, 100],
            detections: vec![
                detection([0.0, 0.0, 40.0, 40.0], 1, 0.9),
                detection([0.0, 60.0, 30.0, 90.0], 1, 0.95),
            ],
        }];

        let metrics = BboxEvaluator::default().evaluate(&gt, &dets)?;
        // precision 0.5 up to recall 0.5
        assert!(abs_diff_eq!(metrics.AP50, 0.5 * 51.0 / 101.0, epsilon = 1e-12));
        Ok(())
    }

    #[test]
    fn wrong_class_is_false_positive() -> Result<()> {
        let gt = vec![Annotation {
            image_size: [100, 100],
            objects: vec![object([0.0, 0.0, 40.0, 40.0], 1)],
        }];
        let dets = vec![Detections {
            image_size: [100, 100],
            detections: vec![detection([0.0, 0.0, 40.0, 40.0], 2, 0.9)],
        }];

        let metrics = BboxEvaluator::default().evaluate(&gt, &dets)?;
        assert_eq!(metrics.AP, 0.0);
        Ok(())
    }
}
