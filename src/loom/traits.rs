use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::shape::{Shape, TileTraits};

/// A logical array shape cut into a regular grid of tiles.
///
/// Every tile has the `basetile` shape, except that the last tile along a dimension
/// is shrunk to the `leftover` size of that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorTraits {
    traits: TileTraits,
    basetile: Shape,
    leftover: Shape,
    grid: TileTraits,
}

impl TensorTraits {
    /// # Panics
    /// Panics if `shape` and `basetile` have different ranks, or if a basetile
    /// dimension is zero while the matching shape dimension is not.
    pub fn new(shape: impl Into<Shape>, basetile: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let basetile = basetile.into();
        assert_eq!(
            shape.ndim(),
            basetile.ndim(),
            "shape {shape} and basetile {basetile} have different ranks"
        );
        assert!(
            itertools::izip!(shape.iter(), basetile.iter()).all(|(&dim, &tile)| tile > 0 || dim == 0),
            "basetile {basetile} must be positive for shape {shape}"
        );

        let grid: Vec<_> = itertools::izip!(shape.iter(), basetile.iter())
            .map(|(&dim, &tile)| match dim {
                0 => 0,
                _ => dim.div_ceil(tile),
            })
            .collect();
        let leftover: Vec<_> = itertools::izip!(shape.iter(), basetile.iter())
            .map(|(&dim, &tile)| match tile {
                0 => 0,
                _ if dim % tile == 0 => tile,
                _ => dim % tile,
            })
            .collect();

        Self {
            traits: TileTraits::new(shape),
            basetile,
            leftover: leftover.into(),
            grid: TileTraits::new(grid),
        }
    }

    /// Traits of the whole, untiled tensor.
    #[inline]
    pub fn traits(&self) -> &TileTraits {
        &self.traits
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.traits.shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.traits.ndim()
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.traits.nelems()
    }

    #[inline]
    pub fn basetile(&self) -> &Shape {
        &self.basetile
    }

    #[inline]
    pub fn leftover(&self) -> &Shape {
        &self.leftover
    }

    /// Traits of the grid of tiles.
    #[inline]
    pub fn grid(&self) -> &TileTraits {
        &self.grid
    }

    /// Shape of the tile at grid coordinate `index`. Each dimension is checked on its own:
    /// a tile is a boundary tile only along the dimensions where it is the last one.
    ///
    /// # Panics
    /// Panics if `index` is outside the grid or its rank differs.
    pub fn get_tile_shape(&self, index: &[usize]) -> Shape {
        assert!(
            self.grid.contains(index),
            "tile index {index:?} out of bounds for grid {}",
            self.grid.shape()
        );
        itertools::izip!(index, self.grid.shape().iter(), self.basetile.iter(), self.leftover.iter())
            .map(|(&index, &grid, &basetile, &leftover)| match index + 1 == grid {
                true => leftover,
                false => basetile,
            })
            .collect_vec()
            .into()
    }

    /// Global coordinate of the first element of the tile at grid coordinate `index`.
    ///
    /// # Panics
    /// Panics if `index` is outside the grid or its rank differs.
    pub fn get_tile_offset(&self, index: &[usize]) -> Vec<usize> {
        assert!(
            self.grid.contains(index),
            "tile index {index:?} out of bounds for grid {}",
            self.grid.shape()
        );
        itertools::izip!(index, self.basetile.iter())
            .map(|(&index, &basetile)| index * basetile)
            .collect()
    }

    /// Traits of the tile with linear grid offset `tile`.
    ///
    /// # Panics
    /// Panics if `tile` is not smaller than the number of tiles.
    #[inline]
    pub fn get_tile_traits(&self, tile: usize) -> TileTraits {
        let index = self.grid.linear_to_index(tile);
        TileTraits::new(self.get_tile_shape(&index))
    }
}

impl std::fmt::Display for TensorTraits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ndim={}", self.ndim())?;
        writeln!(f, "shape={}", self.shape())?;
        writeln!(f, "basetile={}", self.basetile)?;
        writeln!(f, "leftover={}", self.leftover)?;
        writeln!(f, "grid={}", self.grid.shape())?;
        writeln!(f, "tiles")?;
        for tile in 0..self.grid.nelems() {
            let index = self.grid.linear_to_index(tile);
            let shape = self.get_tile_shape(&index);
            writeln!(f, "  {tile}\tindex=({})\tshape={shape}", index.iter().format(", "))?;
        }
        Ok(())
    }
}
