use super::{Rect, XYXY};
use crate::common::*;

/// Bounding box in center-size format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CxCyWH<T> {
    pub(crate) cx: T,
    pub(crate) cy: T,
    pub(crate) w: T,
    pub(crate) h: T,
}

impl<T> Rect for CxCyWH<T>
where
    T: Float,
{
    type Type = T;

    fn x1(&self) -> T {
        self.cx - self.w / (T::one() + T::one())
    }

    fn y1(&self) -> T {
        self.cy - self.h / (T::one() + T::one())
    }

    fn x2(&self) -> T {
        self.cx + self.w / (T::one() + T::one()) - T::one()
    }

    fn y2(&self) -> T {
        self.cy + self.h / (T::one() + T::one()) - T::one()
    }

    fn cx(&self) -> T {
        self.cx
    }

    fn cy(&self) -> T {
        self.cy
    }

    fn w(&self) -> T {
        self.w
    }

    fn h(&self) -> T {
        self.h
    }

    fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let xyxy = XYXY::try_from_xyxy(xyxy)?;
        Ok(Self::from(&xyxy))
    }

    fn try_from_cxcywh(cxcywh: [T; 4]) -> Result<Self> {
        let [cx, cy, w, h] = cxcywh;
        ensure!(
            w >= T::zero() && h >= T::zero(),
            "w and h must be non-negative"
        );
        Ok(Self { cx, cy, w, h })
    }
}

impl<T> From<XYXY<T>> for CxCyWH<T>
where
    T: Float,
{
    fn from(from: XYXY<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&XYXY<T>> for CxCyWH<T>
where
    T: Float,
{
    fn from(from: &XYXY<T>) -> Self {
        Self {
            cx: from.cx(),
            cy: from.cy(),
            w: from.w(),
            h: from.h(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;

    #[test]
    fn corner_center_conversion() {
        let xyxy = XYXY::from_xyxy([10.0, 20.0, 49.0, 39.0]);
        let cxcywh = CxCyWH::from(&xyxy);
        assert_eq!(cxcywh.cxcywh(), [30.0, 30.0, 40.0, 20.0]);
        assert_eq!(XYXY::from(cxcywh), xyxy);
    }
}
