use itertools::Itertools;

use super::ops::{ClearOp, CopyIntersectionOp, CopyOp, Intersection};
use crate::loom::{
    num::Scalar,
    ops::Access,
    runtime::Runtime,
    shape::BoxIndices,
    tensor::{Tensor, TensorError},
    tile::Tile,
};

fn add(x: &[usize], y: &[usize]) -> Vec<usize> {
    x.iter().zip_eq(y).map(|(x, y)| x + y).collect()
}

/// Copies the part of `src` that overlaps `dst`, both placed in one coordinate system at the
/// given offsets. Submits on the calling rank, which must hold both tiles.
///
/// Elements of `dst` outside the overlap are left untouched. Disjoint tiles are a no-op.
pub fn copy_intersection_tile<T: Scalar>(
    runtime: &Runtime,
    src: &Tile<T>,
    src_offset: &[usize],
    dst: &Tile<T>,
    dst_offset: &[usize],
) -> Result<(), TensorError> {
    let ndim = dst.ndim();
    if src.ndim() != ndim {
        return Err(TensorError::Rank(src.ndim(), ndim));
    }
    for offset in [src_offset, dst_offset] {
        if offset.len() != ndim {
            return Err(TensorError::Offsets(offset.len(), ndim));
        }
    }

    if ndim == 0 {
        runtime.submit(CopyOp::new(src, dst))?;
        return Ok(());
    }
    let Some(plan) = Intersection::new(src_offset, src.shape(), dst_offset, dst.shape()) else {
        return Ok(());
    };
    let access = match plan.full_overwrite {
        true => Access::Write,
        false => Access::ReadWrite,
    };
    runtime.submit(CopyIntersectionOp::new(src, dst, &plan, access))?;
    Ok(())
}

impl<T: Scalar> Tensor<T> {
    /// Copies every tile into the matching tile of `dst`, on the owner of the destination tile.
    fn copy_tiles(&self, dst: &Tensor<T>) -> Result<(), TensorError> {
        let runtime = self.runtime();
        let rank = runtime.world_rank();
        for (src_tile, dst_tile) in self.tiles().iter().zip_eq(dst.tiles()) {
            let owner = dst_tile.owner();
            runtime.mpi_transfer(src_tile.handle(), owner)?;
            if rank == owner {
                runtime.submit(CopyOp::new(src_tile, dst_tile))?;
            }
            runtime.mpi_flush(dst_tile.handle())?;
        }
        Ok(())
    }

    /// Copies the part of `self` that overlaps `dst`, with `self` placed at `src_offset` and `dst`
    /// at `dst_offset` of one coordinate system. Elements of `dst` outside the overlap keep their
    /// values.
    ///
    /// For every destination tile, each overlapping source tile is transferred to the owner of
    /// the destination tile, which runs the copy. Every rank must make the same call.
    pub fn copy_intersection(
        &self,
        src_offset: &[usize],
        dst: &Tensor<T>,
        dst_offset: &[usize],
    ) -> Result<(), TensorError> {
        let ndim = dst.ndim();
        if self.ndim() != ndim {
            return Err(TensorError::Rank(self.ndim(), ndim));
        }
        for offset in [src_offset, dst_offset] {
            if offset.len() != ndim {
                return Err(TensorError::Offsets(offset.len(), ndim));
            }
        }

        if ndim == 0 {
            return self.copy_tiles(dst);
        }
        if Intersection::new(src_offset, self.shape(), dst_offset, dst.shape()).is_none() {
            return Ok(());
        }

        let runtime = self.runtime();
        let rank = runtime.world_rank();
        let basetile = self.traits().basetile();
        for (index, dst_tile) in dst.tiles().iter().enumerate() {
            let dst_tile_offset = add(dst_offset, &dst.tile_offset(index));
            // the part of the source box covering this tile, in source coordinates
            let Some(overlap) =
                Intersection::new(src_offset, self.shape(), &dst_tile_offset, dst_tile.shape())
            else {
                continue;
            };

            let first = overlap
                .src_start
                .iter()
                .zip_eq(basetile.iter())
                .map(|(start, tile)| start / tile)
                .collect_vec();
            let count = itertools::izip!(&overlap.src_start, &overlap.shape, basetile.iter(), &first)
                .map(|(start, len, tile, first)| (start + len - 1) / tile - first + 1)
                .collect_vec();

            let owner = dst_tile.owner();
            // source tiles jointly cover the destination tile: the first copy needs no old data
            let mut covered = overlap.full_overwrite;
            for src_index in BoxIndices::new(&first, &count) {
                let src_id = self.grid().index_to_linear(&src_index);
                let src_tile = self.get_tile(src_id);
                let src_tile_offset = add(src_offset, &self.tile_offset(src_id));
                let Some(plan) = Intersection::new(
                    &src_tile_offset,
                    src_tile.shape(),
                    &dst_tile_offset,
                    dst_tile.shape(),
                ) else {
                    continue;
                };

                runtime.mpi_transfer(src_tile.handle(), owner)?;
                if rank == owner {
                    let access = match plan.full_overwrite || covered {
                        true => Access::Write,
                        false => Access::ReadWrite,
                    };
                    runtime.submit(CopyIntersectionOp::new(src_tile, dst_tile, &plan, access))?;
                }
                covered = false;
            }
            runtime.mpi_flush(dst_tile.handle())?;
        }
        Ok(())
    }

    /// Copies into a tensor of the same shape and any tiling.
    pub fn copy_to(&self, dst: &Tensor<T>) -> Result<(), TensorError> {
        if self.ndim() != dst.ndim() {
            return Err(TensorError::Rank(self.ndim(), dst.ndim()));
        }
        if self.shape() != dst.shape() {
            return Err(TensorError::Shape(self.shape().clone(), dst.shape().clone()));
        }
        match self.traits().basetile() == dst.traits().basetile() {
            true => self.copy_tiles(dst),
            false => {
                let offset = vec![0; self.ndim()];
                self.copy_intersection(&offset, dst, &offset)
            }
        }
    }

    /// Collects the whole tensor into the single tile of `dst`, on the rank that owns it.
    pub fn gather(&self, dst: &Tensor<T>) -> Result<(), TensorError> {
        if dst.grid().nelems() != 1 {
            return Err(TensorError::SingleTile(dst.grid().shape().clone()));
        }
        self.copy_to(dst)
    }

    /// Spreads the single tile of `self` over the tiles of `dst`.
    pub fn scatter(&self, dst: &Tensor<T>) -> Result<(), TensorError> {
        if self.grid().nelems() != 1 {
            return Err(TensorError::SingleTile(self.grid().shape().clone()));
        }
        self.copy_to(dst)
    }

    /// Zeroes every tile. Each rank clears the tiles it owns.
    pub fn clear(&self) -> Result<(), TensorError> {
        let runtime = self.runtime();
        for (index, tile) in self.tiles().iter().enumerate() {
            if self.is_local(index) {
                runtime.submit(ClearOp::new(tile))?;
            }
            runtime.mpi_flush(tile.handle())?;
        }
        Ok(())
    }
}
