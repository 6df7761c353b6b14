use super::{CxCyWH, Rect, XYXY};
use crate::common::*;

/// Regression offsets of a box with respect to a reference box.
///
/// The center moves by `dx * w` and `dy * h`, while the size scales by
/// `exp(dw)` and `exp(dh)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxDelta<T> {
    pub dx: T,
    pub dy: T,
    pub dw: T,
    pub dh: T,
}

impl<T> BoxDelta<T>
where
    T: Float,
{
    /// Compute the offsets that move `reference` onto `target`.
    pub fn encode<R1, R2>(reference: &R1, target: &R2) -> Self
    where
        R1: Rect<Type = T>,
        R2: Rect<Type = T>,
    {
        let dx = (target.cx() - reference.cx()) / reference.w();
        let dy = (target.cy() - reference.cy()) / reference.h();
        let dw = (target.w() / reference.w()).ln();
        let dh = (target.h() / reference.h()).ln();
        Self { dx, dy, dw, dh }
    }

    /// Apply the offsets on `reference`.
    pub fn decode<R>(&self, reference: &R) -> XYXY<T>
    where
        R: Rect<Type = T>,
    {
        let Self { dx, dy, dw, dh } = *self;
        let w = reference.w();
        let h = reference.h();
        let center = CxCyWH {
            cx: dx * w + reference.cx(),
            cy: dy * h + reference.cy(),
            w: dw.exp() * w,
            h: dh.exp() * h,
        };
        XYXY::from(center)
    }

    pub fn from_array(array: [T; 4]) -> Self {
        let [dx, dy, dw, dh] = array;
        Self { dx, dy, dw, dh }
    }

    pub fn to_array(&self) -> [T; 4] {
        [self.dx, self.dy, self.dw, self.dh]
    }
}
