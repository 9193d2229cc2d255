//! Non-maximum suppression over per-image detections.

use crate::{common::*, label::Detection};

/// Greedy non-maximum suppression. Boxes of different classes never suppress each other.
///
/// The output is ordered by decreasing score.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    detections.sort_by(|lhs, rhs| {
        rhs.score
            .partial_cmp(&lhs.score)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = vec![];

    for det in detections {
        let suppressed = kept.iter().any(|prev| {
            prev.class_index == det.class_index && prev.tlbr.iou_with(&det.tlbr) > iou_threshold
        });

        if !suppressed {
            kept.push(det);
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(tlbr: [f64; 4], class_index: usize, score: f64) -> Detection {
        Detection {
            tlbr: TLBR::try_from_tlbr(tlbr).unwrap(),
            class_index,
            score,
        }
    }

    #[test]
    fn suppress_overlapping_boxes_of_same_class() {
        let dets = vec![
            det([0.0, 0.0, 10.0, 10.0], 1, 0.6),
            det([0.0, 1.0, 10.0, 11.0], 1, 0.9),
            det([0.0, 1.0, 10.0, 11.0], 2, 0.5),
            det([20.0, 20.0, 30.0, 30.0], 1, 0.4),
        ];
        let kept = nms(dets, 0.5);

        let scores: Vec<_> = kept.iter().map(|det| det.score).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.4]);
    }
}
