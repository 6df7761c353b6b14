use super::{CxCyWH, Rect};
use crate::common::*;

/// Bounding box in corner format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYXY<T> {
    pub(crate) x1: T,
    pub(crate) y1: T,
    pub(crate) x2: T,
    pub(crate) y2: T,
}

impl<T> XYXY<T> {
    pub fn try_cast<V>(self) -> Option<XYXY<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(XYXY {
            x1: V::from(self.x1)?,
            y1: V::from(self.y1)?,
            x2: V::from(self.x2)?,
            y2: V::from(self.y2)?,
        })
    }

    pub fn cast<V>(self) -> XYXY<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> Rect for XYXY<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn x1(&self) -> T {
        self.x1
    }

    fn y1(&self) -> T {
        self.y1
    }

    fn x2(&self) -> T {
        self.x2
    }

    fn y2(&self) -> T {
        self.y2
    }

    fn cx(&self) -> T {
        let two = T::one() + T::one();
        self.x1 + self.w() / two
    }

    fn cy(&self) -> T {
        let two = T::one() + T::one();
        self.y1 + self.h() / two
    }

    fn w(&self) -> T {
        self.x2 - self.x1 + T::one()
    }

    fn h(&self) -> T {
        self.y2 - self.y1 + T::one()
    }

    fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        ensure!(
            x2 + T::one() >= x1 && y2 + T::one() >= y1,
            "x2 + 1 >= x1 and y2 + 1 >= y1 must hold"
        );
        Ok(Self { x1, y1, x2, y2 })
    }

    fn try_from_cxcywh(cxcywh: [T; 4]) -> Result<Self> {
        let [cx, cy, w, h] = cxcywh;
        let zero = T::zero();
        ensure!(w >= zero && h >= zero, "w and h must be non-negative");

        let two = T::one() + T::one();
        let x1 = cx - w / two;
        let y1 = cy - h / two;
        let x2 = x1 + w - T::one();
        let y2 = y1 + h - T::one();
        Ok(Self { x1, y1, x2, y2 })
    }
}

impl<T> From<CxCyWH<T>> for XYXY<T>
where
    T: Float,
{
    fn from(from: CxCyWH<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&CxCyWH<T>> for XYXY<T>
where
    T: Float,
{
    fn from(from: &CxCyWH<T>) -> Self {
        Self {
            x1: from.x1(),
            y1: from.y1(),
            x2: from.x2(),
            y2: from.y2(),
        }
    }
}
