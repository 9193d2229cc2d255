//! Average recall of class-agnostic proposals.

use super::coco::AREA_RANGES;
use crate::common::*;

/// Recall statistics of one area range and proposal limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecall {
    /// Mean recall over IoU thresholds 0.5:0.05:0.95.
    pub ar: f64,
    /// Recall at each threshold.
    pub recalls: Vec<f64>,
    pub thresholds: Vec<f64>,
    /// The best-match IoU of every ground truth box.
    pub gt_overlaps: Vec<f64>,
    pub num_pos: usize,
}

/// Evaluate proposal recall for the area range `area` keeping `limit` proposals per image.
///
/// Ground truth and proposals of the same image are at the same index and in the same scale.
pub fn evaluate_box_proposals(
    ground_truth: &[Annotation],
    proposals: &[Detections],
    area: &str,
    limit: Option<usize>,
) -> Result<ProposalRecall> {
    ensure!(
        ground_truth.len() == proposals.len(),
        "the number of ground truth ({}) and proposals ({}) mismatch",
        ground_truth.len(),
        proposals.len()
    );
    let (_, min_area, max_area) = *AREA_RANGES
        .iter()
        .find(|(name, _, _)| *name == area)
        .ok_or_else(|| format_err!("unknown area range '{}'", area))?;

    let mut gt_overlaps = vec![];
    let mut num_pos = 0;

    for (gt, props) in izip!(ground_truth, proposals) {
        let gt_boxes: Vec<&TLBR<f64>> = gt
            .objects
            .iter()
            .map(|obj| &obj.tlbr)
            .filter(|tlbr| {
                let area = tlbr.area();
                area >= min_area && area <= max_area
            })
            .collect();
        num_pos += gt_boxes.len();

        if gt_boxes.is_empty() {
            continue;
        }

        let props: Vec<&TLBR<f64>> = props
            .detections
            .iter()
            .sorted_by(|lhs, rhs| {
                rhs.score
                    .partial_cmp(&lhs.score)
                    .unwrap_or(Ordering::Equal)
            })
            .take(limit.unwrap_or(usize::MAX))
            .map(|det| &det.tlbr)
            .collect();

        if props.is_empty() {
            continue;
        }

        // overlaps[prop][gt]
        let mut overlaps: Vec<Vec<f64>> = props
            .iter()
            .map(|prop| gt_boxes.iter().map(|gt| prop.iou_with(*gt)).collect())
            .collect();

        // greedily take the best (proposal, ground truth) pair
        for _ in 0..gt_boxes.len().min(props.len()) {
            let best = (0..gt_boxes.len())
                .map(|gt_index| {
                    let (prop_index, iou) = overlaps
                        .iter()
                        .enumerate()
                        .map(|(prop_index, row)| (prop_index, row[gt_index]))
                        .fold((0, f64::NEG_INFINITY), |best, curr| {
                            if curr.1 > best.1 {
                                curr
                            } else {
                                best
                            }
                        });
                    (gt_index, prop_index, iou)
                })
                .fold((0, 0, f64::NEG_INFINITY), |best, curr| {
                    if curr.2 > best.2 {
                        curr
                    } else {
                        best
                    }
                });
            let (gt_index, prop_index, iou) = best;
            if iou < 0.0 {
                break;
            }
            gt_overlaps.push(iou);

            overlaps[prop_index].iter_mut().for_each(|v| *v = -1.0);
            overlaps.iter_mut().for_each(|row| row[gt_index] = -1.0);
        }
    }

    let thresholds: Vec<f64> = (0..10).map(|index| 0.5 + index as f64 * 0.05).collect();
    let recalls: Vec<f64> = thresholds
        .iter()
        .map(|&threshold| {
            if num_pos == 0 {
                0.0
            } else {
                gt_overlaps.iter().filter(|&&iou| iou >= threshold).count() as f64 / num_pos as f64
            }
        })
        .collect();
    let ar = recalls.iter().sum::<f64>() / recalls.len() as f64;

    Ok(ProposalRecall {
        ar,
        recalls,
        thresholds,
        gt_overlaps,
        num_pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn annotation() -> Annotation {
        Annotation {
            image_size: [200, 200],
            objects: vec![
                ObjectLabel {
                    tlbr: TLBR::try_from_tlbr([0.0, 0.0, 20.0, 20.0]).unwrap(),
                    class_index: 1,
                },
                ObjectLabel {
                    tlbr: TLBR::try_from_tlbr([100.0, 100.0, 200.0, 200.0]).unwrap(),
                    class_index: 2,
                },
            ],
        }
    }

    fn proposal(tlbr: [f64; 4], score: f64) -> Detection {
        Detection {
            tlbr: TLBR::try_from_tlbr(tlbr).unwrap(),
            class_index: 0,
            score,
        }
    }

    #[test]
    fn recall_of_exact_and_missing_proposals() -> Result<()> {
        let proposals = vec![Detections {
            image_size: [200, 200],
            detections: vec![proposal([0.0, 0.0, 20.0, 20.0], 0.9)],
        }];

        let all = evaluate_box_proposals(&[annotation()], &proposals, "all", Some(100))?;
        assert_eq!(all.num_pos, 2);
        assert!(abs_diff_eq!(all.ar, 0.5));

        let small = evaluate_box_proposals(&[annotation()], &proposals, "small", Some(100))?;
        assert_eq!(small.num_pos, 1);
        assert!(abs_diff_eq!(small.ar, 1.0));

        let large = evaluate_box_proposals(&[annotation()], &proposals, "large", Some(100))?;
        assert_eq!(large.num_pos, 1);
        assert!(abs_diff_eq!(large.ar, 0.0));
        Ok(())
    }

    #[test]
    fn limit_keeps_best_scored_proposals() -> Result<()> {
        let proposals = vec![Detections {
            image_size: [200, 200],
            detections: vec![
                proposal([100.0, 100.0, 200.0, 200.0], 0.2),
                proposal([0.0, 0.0, 20.0, 20.0], 0.9),
            ],
        }];

        let limited = evaluate_box_proposals(&[annotation()], &proposals, "all", Some(1))?;
        assert!(abs_diff_eq!(limited.ar, 0.5));
        let unlimited = evaluate_box_proposals(&[annotation()], &proposals, "all", None)?;
        assert!(abs_diff_eq!(unlimited.ar, 1.0));
        Ok(())
    }

    #[test]
    fn reject_unknown_area() {
        assert!(evaluate_box_proposals(&[], &[], "huge", None).is_err());
    }
}
