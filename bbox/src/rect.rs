use super::{CxCyWH, XYXY};
use crate::common::*;

/// The generic rectangle in inclusive pixel coordinates.
pub trait Rect {
    type Type;

    fn x1(&self) -> Self::Type;
    fn y1(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cxcywh(cxcywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn from_xyxy(xyxy: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_xyxy(xyxy).unwrap()
    }

    fn from_cxcywh(cxcywh: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_cxcywh(cxcywh).unwrap()
    }

    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x1(), self.y1(), self.x2(), self.y2()]
    }

    fn cxcywh(&self) -> [Self::Type; 4] {
        [self.cx(), self.cy(), self.w(), self.h()]
    }

    fn to_xyxy(&self) -> XYXY<Self::Type> {
        XYXY {
            x1: self.x1(),
            y1: self.y1(),
            x2: self.x2(),
            y2: self.y2(),
        }
    }

    fn area(&self) -> Self::Type {
        self.w() * self.h()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    fn to_cxcywh(&self) -> CxCyWH<Self::Type> {
        CxCyWH {
            cx: self.cx(),
            cy: self.cy(),
            w: self.w(),
            h: self.h(),
        }
    }

    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let one = Self::Type::one();
        let x1 = self.x1().max(other.x1());
        let y1 = self.y1().max(other.y1());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 - x1 + one > Self::Type::zero() && y2 - y1 + one > Self::Type::zero())
            .then(|| XYXY { x1, y1, x2, y2 })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    fn iou_with<R>(&self, other: &R, epsilon: Self::Type) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area + epsilon;
        inter_area / union_area
    }

    /// Clamp the corners into an image of `width` by `height` pixels.
    fn clip(&self, width: Self::Type, height: Self::Type) -> XYXY<Self::Type> {
        let zero = Self::Type::zero();
        let one = Self::Type::one();
        let max_x = width - one;
        let max_y = height - one;
        XYXY {
            x1: self.x1().max(zero).min(max_x),
            y1: self.y1().max(zero).min(max_y),
            x2: self.x2().max(zero).min(max_x),
            y2: self.y2().max(zero).min(max_y),
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}
