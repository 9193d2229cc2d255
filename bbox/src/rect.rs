use super::TLBR;
use crate::common::*;

/// The generic rectangle with floating point coordinates.
pub trait Rect {
    type Type: Float;

    fn t(&self) -> Self::Type;
    fn l(&self) -> Self::Type;
    fn b(&self) -> Self::Type;
    fn r(&self) -> Self::Type;

    fn h(&self) -> Self::Type {
        self.b() - self.t()
    }

    fn w(&self) -> Self::Type {
        self.r() - self.l()
    }

    fn cy(&self) -> Self::Type {
        let two = Self::Type::one() + Self::Type::one();
        self.t() + self.h() / two
    }

    fn cx(&self) -> Self::Type {
        let two = Self::Type::one() + Self::Type::one();
        self.l() + self.w() / two
    }

    fn tlbr(&self) -> [Self::Type; 4] {
        [self.t(), self.l(), self.b(), self.r()]
    }

    fn cycxhw(&self) -> [Self::Type; 4] {
        [self.cy(), self.cx(), self.h(), self.w()]
    }

    fn area(&self) -> Self::Type {
        self.h() * self.w()
    }

    /// Compute the intersection in TLBR format, or `None` if the rectangles are disjoint.
    fn intersect_with<R>(&self, other: &R) -> Option<TLBR<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let t = self.t().max(other.t());
        let l = self.l().max(other.l());
        let b = self.b().min(other.b());
        let r = self.r().min(other.r());
        (b > t && r > l).then(|| TLBR { t, l, b, r })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union. Two empty rectangles have zero IoU.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area;

        if union_area <= Self::Type::zero() {
            Self::Type::zero()
        } else {
            inter_area / union_area
        }
    }
}
