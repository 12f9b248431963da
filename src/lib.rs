pub mod hal;
pub mod loom;

pub use hal::frontend::copy_intersection_tile;
pub use loom::{
    comm::{LocalCluster, Tag, Transport},
    num::{DataType, Scalar},
    ops::Access,
    runtime::{Runtime, RuntimeBuilder, TaskError},
    shape::{Shape, TileTraits},
    tensor::{Tensor, TensorError},
    tile::Tile,
    traits::TensorTraits,
};
