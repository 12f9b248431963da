use std::marker::PhantomData;

use itertools::Itertools;
use tessera_derive::TaskOp;

use crate::loom::{
    num::Scalar,
    ops::{Access, InnerOp, TaskIr},
    tile::Tile,
};

/// The sub-box shared by a source and a destination box placed in one coordinate system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Intersection {
    /// Start of the sub-box in source coordinates.
    pub src_start: Vec<usize>,
    /// Start of the sub-box in destination coordinates.
    pub dst_start: Vec<usize>,
    pub shape: Vec<usize>,
    /// The sub-box covers the whole destination box.
    pub full_overwrite: bool,
}

impl Intersection {
    /// Intersects `[src_offset, src_offset + src_shape)` with `[dst_offset, dst_offset + dst_shape)`
    /// in every dimension. Returns `None` if the boxes share no element.
    ///
    /// # Panics
    /// Panics if the arguments have different ranks.
    pub fn new(
        src_offset: &[usize],
        src_shape: &[usize],
        dst_offset: &[usize],
        dst_shape: &[usize],
    ) -> Option<Self> {
        let ndim = dst_shape.len();
        assert!(
            [src_offset.len(), src_shape.len(), dst_offset.len()]
                .iter()
                .all(|&len| len == ndim),
            "intersected boxes have different ranks"
        );

        let mut src_start = Vec::with_capacity(ndim);
        let mut dst_start = Vec::with_capacity(ndim);
        let mut shape = Vec::with_capacity(ndim);
        for (&src_offset, &src_len, &dst_offset, &dst_len) in
            itertools::izip!(src_offset, src_shape, dst_offset, dst_shape)
        {
            let lo = src_offset.max(dst_offset);
            let hi = (src_offset + src_len).min(dst_offset + dst_len);
            if hi <= lo {
                return None;
            }
            src_start.push(lo - src_offset);
            dst_start.push(lo - dst_offset);
            shape.push(hi - lo);
        }
        let full_overwrite = shape == dst_shape;

        Some(Self {
            src_start,
            dst_start,
            shape,
            full_overwrite,
        })
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Copies the whole source buffer into the destination buffer.
#[derive(Debug, Clone, TaskOp)]
#[task_op(crate = "crate", bound = "T: Scalar", name = "copy")]
pub struct CopyOp<T> {
    #[task_op]
    pub op: InnerOp,
    pub phantom: PhantomData<T>,
}

impl<T: Scalar> CopyOp<T> {
    pub fn new(src: &Tile<T>, dst: &Tile<T>) -> Self {
        let op = InnerOp::new([TaskIr::read(src.handle()), TaskIr::write(dst.handle())]);
        Self {
            op,
            phantom: PhantomData,
        }
    }
}

/// Copies a sub-box of the source tile into a sub-box of the destination tile.
///
/// Buffers are the source, the destination, and scratch room for two multi-indices.
#[derive(Debug, Clone, TaskOp)]
#[task_op(crate = "crate", bound = "T: Scalar", name = "copy_intersection")]
pub struct CopyIntersectionOp<T> {
    #[task_op]
    pub op: InnerOp,
    pub src_start: Vec<usize>,
    pub src_stride: Vec<usize>,
    pub dst_start: Vec<usize>,
    pub dst_stride: Vec<usize>,
    pub shape: Vec<usize>,
    pub phantom: PhantomData<T>,
}

impl<T: Scalar> CopyIntersectionOp<T> {
    /// `access` is the mode of the destination, either [`Access::Write`] or [`Access::ReadWrite`].
    pub fn new(src: &Tile<T>, dst: &Tile<T>, plan: &Intersection, access: Access) -> Self {
        let output = match access {
            Access::Write => TaskIr::write(dst.handle()),
            _ => TaskIr::read_write(dst.handle()),
        };
        let scratch = TaskIr::scratch(2 * plan.ndim() * size_of::<usize>());
        let op = InnerOp::new([TaskIr::read(src.handle()), output, scratch]);
        Self {
            op,
            src_start: plan.src_start.clone(),
            src_stride: src.traits().stride().to_vec(),
            dst_start: plan.dst_start.clone(),
            dst_stride: dst.traits().stride().to_vec(),
            shape: plan.shape.clone(),
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Offset of the first element of the sub-box in the source and destination buffers.
    pub fn start_offsets(&self) -> (usize, usize) {
        let dot = |start: &[usize], stride: &[usize]| -> usize {
            start.iter().zip_eq(stride).map(|(x, y)| x * y).sum()
        };
        (
            dot(&self.src_start, &self.src_stride),
            dot(&self.dst_start, &self.dst_stride),
        )
    }
}

/// Fills a tile with zeros.
#[derive(Debug, Clone, TaskOp)]
#[task_op(crate = "crate", bound = "T: Scalar", name = "clear")]
pub struct ClearOp<T> {
    #[task_op]
    pub op: InnerOp,
    pub phantom: PhantomData<T>,
}

impl<T: Scalar> ClearOp<T> {
    pub fn new(tile: &Tile<T>) -> Self {
        let op = InnerOp::new([TaskIr::write(tile.handle())]);
        Self {
            op,
            phantom: PhantomData,
        }
    }
}
