use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use super::{
    comm::Tag,
    handle::DataHandle,
    num::Scalar,
    ops::Access,
    runtime::{AccessGuard, Runtime, TaskError},
    shape::{Shape, TileTraits},
    tensor::TensorError,
};

/// A dense N-D block: traits plus the handle of its buffer.
#[derive(Debug, Clone)]
pub struct Tile<T> {
    traits: TileTraits,
    handle: DataHandle,
    phantom: PhantomData<T>,
}

impl<T> Tile<T> {
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
    pub fn handle(&self) -> &DataHandle {
        &self.handle
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.handle.owner()
    }
}

impl<T: Scalar> Tile<T> {
    /// A tile owned by the calling rank. Memory is allocated on first access.
    pub fn new(runtime: &Runtime, traits: TileTraits) -> Self {
        Self::distributed(traits, runtime.world_rank(), None)
    }

    pub(crate) fn distributed(traits: TileTraits, owner: usize, tag: Option<Tag>) -> Self {
        let handle = DataHandle::new::<T>(traits.nelems(), owner, tag);
        Self {
            traits,
            handle,
            phantom: PhantomData,
        }
    }

    /// A tile owned by the calling rank backed by `data`.
    /// Only the first `traits.nelems()` elements are part of the tile.
    pub fn from_vec(runtime: &Runtime, traits: TileTraits, data: Vec<T>) -> Result<Self, TensorError> {
        if data.len() < traits.nelems() {
            return Err(TensorError::Capacity(data.len(), traits.nelems()));
        }
        let handle = DataHandle::from_vec(data, traits.nelems(), runtime.world_rank());
        Ok(Self {
            traits,
            handle,
            phantom: PhantomData,
        })
    }

    /// Scoped access to the elements of the tile. See [`Runtime::acquire`].
    pub async fn acquire(
        &self,
        runtime: &Runtime,
        access: Access,
    ) -> Result<TileLocalData<'_, T>, TaskError> {
        let guard = runtime.acquire(&self.handle, access).await?;
        Ok(TileLocalData {
            traits: &self.traits,
            guard,
            phantom: PhantomData,
        })
    }

    /// Copies the elements out, after every earlier write to the tile.
    pub async fn to_vec(&self, runtime: &Runtime) -> Result<Vec<T>, TaskError> {
        let data = self.acquire(runtime, Access::Read).await?;
        Ok(data.to_vec())
    }
}

/// Elements of a tile while access to it is held.
pub struct TileLocalData<'a, T> {
    traits: &'a TileTraits,
    guard: AccessGuard<'a>,
    phantom: PhantomData<T>,
}

impl<T: Scalar> TileLocalData<'_, T> {
    /// # Panics
    /// Panics if `index` lies outside the tile.
    #[inline]
    pub fn get(&self, index: &[usize]) -> T {
        self[self.traits.index_to_linear(index)]
    }

    /// # Panics
    /// Panics if `index` lies outside the tile, or if the access is read only.
    #[inline]
    pub fn set(&mut self, index: &[usize], value: T) {
        let offset = self.traits.index_to_linear(index);
        self[offset] = value;
    }
}

impl<T: Scalar> Deref for TileLocalData<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.guard.as_slice()
    }
}

impl<T: Scalar> DerefMut for TileLocalData<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Tile;
    use crate::loom::{
        handle::HandleState, ops::Access, runtime::RuntimeBuilder, shape::TileTraits,
        tensor::TensorError,
    };

    #[tokio::test]
    async fn test_tile_access() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new().build().await;
        let tile = Tile::<f64>::new(&runtime, TileTraits::new([2, 3]));
        assert!(!tile.handle().is_materialized());
        {
            let mut data = tile.acquire(&runtime, Access::Write).await?;
            for (x, value) in data.iter_mut().zip(0..) {
                *x = value as f64;
            }
            data.set(&[1, 2], -1.0);
        }
        assert_eq!(tile.handle().state(), HandleState::LocalValid);

        let data = tile.acquire(&runtime, Access::Read).await?;
        assert_eq!(data.get(&[1, 0]), 1.0);
        assert_eq!(data.get(&[0, 2]), 4.0);
        assert_eq!(&data[..], &[0.0, 1.0, 2.0, 3.0, 4.0, -1.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_from_vec() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new().build().await;
        let tile = Tile::from_vec(&runtime, TileTraits::new([2, 2]), vec![1i64, 2, 3, 4, 5])?;
        assert_eq!(tile.to_vec(&runtime).await?, vec![1, 2, 3, 4]);

        let err = Tile::from_vec(&runtime, TileTraits::new([2, 2]), vec![1i64, 2, 3]);
        assert!(matches!(err, Err(TensorError::Capacity(3, 4))));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_reads() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new().build().await;
        let tile = Tile::from_vec(&runtime, TileTraits::new([3]), vec![1.0f32, 2.0, 3.0])?;
        let a = tile.acquire(&runtime, Access::Read).await?;
        let b = tile.acquire(&runtime, Access::Read).await?;
        assert_eq!(&a[..], &b[..]);
        Ok(())
    }
}
