use super::Rect;
use crate::common::*;

/// Bounding box in TLBR format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T>
where
    T: Float,
{
    pub fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self { t, l, b, r })
    }

    /// Build from the top-left corner and the size, which is the layout of COCO `[x, y, w, h]`
    /// boxes once swapped to `[y, x, h, w]`.
    pub fn try_from_tlhw(tlhw: [T; 4]) -> Result<Self> {
        let [t, l, h, w] = tlhw;
        ensure!(
            h >= T::zero() && w >= T::zero(),
            "h and w must be non-negative"
        );
        Self::try_from_tlbr([t, l, t + h, l + w])
    }

    pub fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        ensure!(
            h >= T::zero() && w >= T::zero(),
            "h and w must be non-negative"
        );
        let two = T::one() + T::one();
        Ok(Self {
            t: cy - h / two,
            l: cx - w / two,
            b: cy + h / two,
            r: cx + w / two,
        })
    }

    /// Clamp the box into an image of size `height` x `width`.
    pub fn clip(&self, height: T, width: T) -> Self {
        let zero = T::zero();
        let clamp = |val: T, max: T| val.max(zero).min(max);

        Self {
            t: clamp(self.t, height),
            l: clamp(self.l, width),
            b: clamp(self.b, height),
            r: clamp(self.r, width),
        }
    }

    pub fn scale(&self, scale_y: T, scale_x: T) -> Self {
        Self {
            t: self.t * scale_y,
            l: self.l * scale_x,
            b: self.b * scale_y,
            r: self.r * scale_x,
        }
    }
}

impl<T> Rect for TLBR<T>
where
    T: Float,
{
    type Type = T;

    fn t(&self) -> T {
        self.t
    }

    fn l(&self) -> T {
        self.l
    }

    fn b(&self) -> T {
        self.b
    }

    fn r(&self) -> T {
        self.r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let lhs = TLBR::try_from_tlbr([0.0, 0.0, 10.0, 10.0]).unwrap();
        let rhs = TLBR::try_from_tlbr([0.0, 5.0, 10.0, 15.0]).unwrap();
        assert!(abs_diff_eq!(lhs.iou_with(&rhs), 50.0 / 150.0));
        assert!(abs_diff_eq!(lhs.iou_with(&lhs), 1.0));
    }

    #[test]
    fn disjoint_boxes_do_not_intersect() {
        let lhs = TLBR::try_from_tlbr([0.0, 0.0, 1.0, 1.0]).unwrap();
        let rhs = TLBR::try_from_tlbr([2.0, 2.0, 3.0, 3.0]).unwrap();
        assert!(lhs.intersect_with(&rhs).is_none());
        assert_eq!(lhs.iou_with(&rhs), 0.0);
    }

    #[test]
    fn inverted_box_is_rejected() {
        assert!(TLBR::try_from_tlbr([5.0, 0.0, 1.0, 1.0]).is_err());
        assert!(TLBR::try_from_tlhw([0.0, 0.0, -1.0, 1.0]).is_err());
    }

    #[test]
    fn center_size_construction() {
        let tlbr = TLBR::try_from_cycxhw([5.0, 4.0, 2.0, 6.0]).unwrap();
        assert_eq!(tlbr.tlbr(), [4.0, 1.0, 6.0, 7.0]);
        assert_eq!(tlbr.cycxhw(), [5.0, 4.0, 2.0, 6.0]);
        assert!(TLBR::try_from_cycxhw([0.0, 0.0, -1.0, 1.0]).is_err());
    }

    #[test]
    fn clip_and_scale() {
        let tlbr = TLBR::try_from_tlbr([-4.0, 2.0, 20.0, 8.0]).unwrap();
        let clipped = tlbr.clip(16.0, 6.0);
        assert_eq!(clipped.tlbr(), [0.0, 2.0, 16.0, 6.0]);

        let scaled = clipped.scale(0.5, 2.0);
        assert_eq!(scaled.tlbr(), [0.0, 4.0, 8.0, 12.0]);
    }
}
