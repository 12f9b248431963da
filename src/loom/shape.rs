use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ordered sequence of non-negative dimension sizes.
///
/// An empty shape describes a scalar: it has `ndim() == 0` and exactly one element.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({})", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of elements; `1` for a scalar shape.
    #[inline]
    pub fn nelems(&self) -> usize {
        self.0.iter().product()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<usize> {
        self.0.to_vec()
    }
}

/// Shape and Fortran-order strides of one contiguous tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TileTraits {
    shape: Shape,
    stride: Arc<[usize]>,
    nelems: usize,
}

impl TileTraits {
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let stride: Arc<[usize]> = shape
            .iter()
            .scan(1, |acc, &dim| {
                let stride = *acc;
                *acc *= dim;
                Some(stride)
            })
            .collect();
        let nelems = shape.nelems();
        Self {
            shape,
            stride,
            nelems,
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.nelems
    }

    /// Decomposes a linear offset into a multi-index, first dimension varying fastest.
    ///
    /// # Panics
    /// Panics if `offset` is not smaller than `nelems`.
    pub fn linear_to_index(&self, offset: usize) -> Vec<usize> {
        assert!(
            offset < self.nelems,
            "linear offset {offset} out of range for shape {}",
            self.shape
        );
        let mut rest = offset;
        self.shape
            .iter()
            .map(|&dim| {
                let index = rest % dim;
                rest /= dim;
                index
            })
            .collect()
    }

    /// Inverse of [`TileTraits::linear_to_index`].
    ///
    /// # Panics
    /// Panics if `index` has a different number of dimensions than the shape,
    /// or if any coordinate is out of bounds.
    pub fn index_to_linear(&self, index: &[usize]) -> usize {
        assert_eq!(
            index.len(),
            self.ndim(),
            "index {index:?} does not match the rank of shape {}",
            self.shape
        );
        assert!(
            self.contains(index),
            "index {index:?} out of bounds for shape {}",
            self.shape
        );
        itertools::izip!(index, self.stride.iter())
            .map(|(&index, &stride)| index * stride)
            .sum()
    }

    /// Returns `true` if every coordinate of `index` lies inside the shape.
    #[inline]
    pub fn contains(&self, index: &[usize]) -> bool {
        index.len() == self.ndim()
            && itertools::izip!(index, self.shape.iter()).all(|(&index, &dim)| index < dim)
    }
}

/// Odometer over all multi-indices of the box `[start, start + shape)`,
/// first dimension varying fastest.
///
/// A box with a zero-sized dimension yields nothing; an empty box (`ndim == 0`)
/// yields a single empty index.
#[derive(Debug, Clone)]
pub struct BoxIndices {
    start: Vec<usize>,
    shape: Vec<usize>,
    current: Option<Vec<usize>>,
}

impl BoxIndices {
    pub fn new(start: &[usize], shape: &[usize]) -> Self {
        assert_eq!(start.len(), shape.len(), "box start and shape ranks differ");
        let current = match shape.iter().any(|&dim| dim == 0) {
            true => None,
            false => Some(start.to_vec()),
        };
        Self {
            start: start.to_vec(),
            shape: shape.to_vec(),
            current,
        }
    }
}

impl Iterator for BoxIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.take()?;
        let mut next = current.clone();
        let mut carry = true;
        for (index, (&start, &dim)) in next.iter_mut().zip(self.start.iter().zip(&self.shape)) {
            *index += 1;
            if *index < start + dim {
                carry = false;
                break;
            }
            *index = start;
        }
        if !carry {
            self.current = Some(next);
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{BoxIndices, Shape, TileTraits};

    #[test]
    fn test_strides() {
        let traits = TileTraits::new([3, 4, 5]);
        assert_eq!(traits.stride(), &[1, 3, 12]);
        assert_eq!(traits.nelems(), 60);
        assert_eq!(traits.ndim(), 3);
        assert_eq!(format!("{}", traits.shape()), "(3, 4, 5)");
    }

    #[test]
    fn test_scalar() {
        let traits = TileTraits::new(Shape::default());
        assert_eq!(traits.nelems(), 1);
        assert_eq!(traits.linear_to_index(0), Vec::<usize>::new());
        assert_eq!(traits.index_to_linear(&[]), 0);
    }

    #[test]
    fn test_linear_round_trip() {
        let traits = TileTraits::new([2, 3, 4, 1]);
        for offset in 0..traits.nelems() {
            let index = traits.linear_to_index(offset);
            assert_eq!(traits.index_to_linear(&index), offset);
        }
        assert_eq!(traits.linear_to_index(1), vec![1, 0, 0, 0]);
        assert_eq!(traits.linear_to_index(2), vec![0, 1, 0, 0]);
        assert_eq!(traits.linear_to_index(23), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_zero_dim() {
        let traits = TileTraits::new([3, 0, 2]);
        assert_eq!(traits.nelems(), 0);
        assert!(!traits.contains(&[0, 0, 0]));
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_bounds() {
        let traits = TileTraits::new([2, 3]);
        traits.index_to_linear(&[2, 0]);
    }

    #[test]
    #[should_panic]
    fn test_index_rank_mismatch() {
        let traits = TileTraits::new([2, 3]);
        traits.index_to_linear(&[1]);
    }

    #[test]
    #[should_panic]
    fn test_linear_out_of_bounds() {
        let traits = TileTraits::new([2, 3]);
        traits.linear_to_index(6);
    }

    #[test]
    fn test_box_indices() {
        let traits = TileTraits::new([2, 3]);
        let indices = BoxIndices::new(&[0, 0], &[2, 3]).collect_vec();
        let expected = (0..6).map(|i| traits.linear_to_index(i)).collect_vec();
        assert_eq!(indices, expected);

        let indices = BoxIndices::new(&[1, 2], &[2, 1]).collect_vec();
        assert_eq!(indices, vec![vec![1, 2], vec![2, 2]]);

        assert_eq!(BoxIndices::new(&[0, 0], &[2, 0]).count(), 0);
        assert_eq!(BoxIndices::new(&[], &[]).collect_vec(), vec![Vec::<usize>::new()]);
    }
}
