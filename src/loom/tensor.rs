use std::sync::Arc;

use thiserror::Error;

use super::{
    comm::Tag,
    handle::DataHandle,
    num::Scalar,
    runtime::{Runtime, TaskError},
    shape::{Shape, TileTraits},
    tile::Tile,
    traits::TensorTraits,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor rank error: {0} dimensions mismatch {1}")]
    Rank(usize, usize),
    #[error("tensor shape error: shape {0} mismatches {1}")]
    Shape(Shape, Shape),
    #[error("tensor grid error: expected a single tile, found grid {0}")]
    SingleTile(Shape),
    #[error("tensor distribution error: {0} owners given for {1} tiles")]
    Distribution(usize, usize),
    #[error("tensor distribution error: tile {0} owned by rank {1} outside a world of size {2}")]
    Owner(usize, usize, usize),
    #[error("tensor offset error: {0} offsets given for {1} dimensions")]
    Offsets(usize, usize),
    #[error("tile creation error: buffer of {0} elements cannot back a tile of {1}")]
    Capacity(usize, usize),
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// A logical N-D array stored as a grid of tiles spread over ranks.
///
/// Every rank builds the same tensor with the same distribution and tag; a rank only ever
/// materialises the tiles it owns, plus cached copies of remote tiles it reads.
#[derive(Debug)]
pub struct Tensor<T> {
    runtime: Runtime,
    traits: TensorTraits,
    distribution: Arc<[usize]>,
    tag: Tag,
    tiles: Vec<Tile<T>>,
}

impl<T: Scalar> Tensor<T> {
    /// Creates the tensor, with tile `i` owned by rank `distribution[i]`.
    ///
    /// `last_tag` is the last tag used by a distributed object. Tile `i` gets `last_tag + i`,
    /// and `last_tag` is advanced past the tags of this tensor.
    pub fn new(
        runtime: &Runtime,
        traits: TensorTraits,
        distribution: &[usize],
        last_tag: &mut Tag,
    ) -> Result<Self, TensorError> {
        let ntiles = traits.grid().nelems();
        if distribution.len() != ntiles {
            return Err(TensorError::Distribution(distribution.len(), ntiles));
        }
        let size = runtime.world_size();
        if let Some((tile, &owner)) = distribution
            .iter()
            .enumerate()
            .find(|&(_, &owner)| owner >= size)
        {
            return Err(TensorError::Owner(tile, owner, size));
        }

        let tag = *last_tag;
        let tiles = distribution
            .iter()
            .enumerate()
            .map(|(index, &owner)| {
                let traits = traits.get_tile_traits(index);
                Tile::distributed(traits, owner, Some(tag.offset(index)))
            })
            .collect();
        *last_tag = tag.offset(ntiles);

        Ok(Self {
            runtime: runtime.clone(),
            traits,
            distribution: distribution.into(),
            tag,
            tiles,
        })
    }

    /// A tensor whose tiles all live on the calling rank.
    pub fn local(runtime: &Runtime, traits: TensorTraits, last_tag: &mut Tag) -> Self {
        let rank = runtime.world_rank();
        let distribution = vec![rank; traits.grid().nelems()];
        let ntiles = distribution.len();
        let tag = *last_tag;
        let tiles = (0..ntiles)
            .map(|index| Tile::distributed(traits.get_tile_traits(index), rank, Some(tag.offset(index))))
            .collect();
        *last_tag = tag.offset(ntiles);
        Self {
            runtime: runtime.clone(),
            traits,
            distribution: distribution.into(),
            tag,
            tiles,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    #[inline]
    pub fn traits(&self) -> &TensorTraits {
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
    pub fn grid(&self) -> &TileTraits {
        self.traits.grid()
    }

    /// Owner rank of every tile, in grid order.
    #[inline]
    pub fn distribution(&self) -> &[usize] {
        &self.distribution
    }

    /// Tag of the first tile.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn tiles(&self) -> &[Tile<T>] {
        &self.tiles
    }

    /// # Panics
    /// Panics if `tile` is outside the grid.
    #[inline]
    pub fn get_tile(&self, tile: usize) -> &Tile<T> {
        &self.tiles[tile]
    }

    /// # Panics
    /// Panics if `tile` is outside the grid.
    #[inline]
    pub fn get_tile_traits(&self, tile: usize) -> &TileTraits {
        self.tiles[tile].traits()
    }

    /// # Panics
    /// Panics if `tile` is outside the grid.
    #[inline]
    pub fn get_tile_handle(&self, tile: usize) -> &DataHandle {
        self.tiles[tile].handle()
    }

    /// # Panics
    /// Panics if `tile` is outside the grid.
    #[inline]
    pub fn owner_rank(&self, tile: usize) -> usize {
        self.distribution[tile]
    }

    /// Returns `true` if the calling rank owns the tile.
    #[inline]
    pub fn is_local(&self, tile: usize) -> bool {
        self.owner_rank(tile) == self.runtime.world_rank()
    }

    /// Global coordinates of the first element of a tile.
    pub fn tile_offset(&self, tile: usize) -> Vec<usize> {
        let index = self.grid().linear_to_index(tile);
        self.traits.get_tile_offset(&index)
    }
}

impl<T> Drop for Tensor<T> {
    fn drop(&mut self) {
        let end = self.tag.offset(self.tiles.len());
        let handles = self.tiles.iter().map(Tile::handle);
        self.runtime.retire(handles, self.tag..end);
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Tensor, TensorError};
    use crate::loom::{
        comm::{LocalCluster, Tag},
        runtime::RuntimeBuilder,
        shape::Shape,
        traits::TensorTraits,
    };

    #[tokio::test]
    async fn test_tensor() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(3);
        let runtime = RuntimeBuilder::new()
            .transport(world[1].clone())
            .build()
            .await;

        let traits = TensorTraits::new([5, 4], [2, 3]);
        let distribution: Vec<_> = (0..6).map(|tile| (tile + 1) % 3).collect();
        let mut last_tag = Tag(10);
        let tensor = Tensor::<f32>::new(&runtime, traits, &distribution, &mut last_tag)?;
        assert_eq!(last_tag, Tag(16));
        assert_eq!(tensor.tag(), Tag(10));

        assert_eq!(tensor.get_tile_handle(4).tag(), Some(Tag(14)));
        assert_eq!(tensor.get_tile_traits(5).shape(), &Shape::from([1, 1]));
        assert_eq!(tensor.tile_offset(5), vec![4, 3]);
        assert_eq!(tensor.owner_rank(2), 0);
        assert!(tensor.is_local(0));
        assert!(!tensor.is_local(1));
        assert_eq!(tensor.get_tile(3).owner(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_distribution() {
        let world = LocalCluster::new(2);
        let runtime = RuntimeBuilder::new()
            .transport(world[0].clone())
            .build()
            .await;
        let traits = TensorTraits::new([4], [2]);
        let mut last_tag = Tag(0);

        let err = Tensor::<f32>::new(&runtime, traits.clone(), &[0], &mut last_tag);
        assert!(matches!(err, Err(TensorError::Distribution(1, 2))));

        let err = Tensor::<f32>::new(&runtime, traits, &[0, 2], &mut last_tag);
        assert!(matches!(err, Err(TensorError::Owner(1, 2, 2))));
        assert_eq!(last_tag, Tag(0));
    }
}
