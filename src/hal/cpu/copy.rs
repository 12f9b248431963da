use crate::{
    hal::ops::{CopyIntersectionOp, CopyOp},
    loom::{
        handle::BufferGuard,
        num::Scalar,
        ops::{BackendOp, TaskOp},
        runtime::cpu::Backend,
    },
};

impl<T: Scalar> BackendOp<Backend> for CopyOp<T> {
    fn execute(&self, _backend: &Backend, buffers: &mut [BufferGuard<'_>]) {
        let [src, dst] = buffers else {
            log::error!("{}: expected 2 buffers, got {}", self.name(), buffers.len());
            return;
        };
        let src = src.as_slice::<T>();
        let dst = dst.as_mut_slice::<T>();
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
    }
}

impl<T: Scalar> BackendOp<Backend> for CopyIntersectionOp<T> {
    fn execute(&self, _backend: &Backend, buffers: &mut [BufferGuard<'_>]) {
        let [src, dst, scratch] = buffers else {
            log::error!("{}: expected 3 buffers, got {}", self.name(), buffers.len());
            return;
        };
        let src = src.as_slice::<T>();
        let dst = dst.as_mut_slice::<T>();

        let ndim = self.ndim();
        if ndim == 0 {
            dst[0] = src[0];
            return;
        }
        if self.shape.contains(&0) {
            return;
        }

        // odometers over dimensions 1.., rows along dimension 0 are contiguous
        let (src_index, dst_index) = scratch.as_mut_slice::<usize>().split_at_mut(ndim);
        src_index.copy_from_slice(&self.src_start);
        dst_index.copy_from_slice(&self.dst_start);

        let row = self.shape[0];
        let rows: usize = self.shape[1..].iter().product();
        let (mut src_offset, mut dst_offset) = self.start_offsets();

        for _ in 0..rows {
            dst[dst_offset..dst_offset + row].copy_from_slice(&src[src_offset..src_offset + row]);
            advance(src_index, &self.src_start, &self.shape, &self.src_stride, &mut src_offset);
            advance(dst_index, &self.dst_start, &self.shape, &self.dst_stride, &mut dst_offset);
        }
    }
}

/// Steps `index` to the next row of the box at `start`, carrying into higher dimensions,
/// and moves `offset` with it.
fn advance(index: &mut [usize], start: &[usize], shape: &[usize], stride: &[usize], offset: &mut usize) {
    for j in 1..index.len() {
        index[j] += 1;
        *offset += stride[j];
        if index[j] < start[j] + shape[j] {
            return;
        }
        index[j] = start[j];
        *offset -= shape[j] * stride[j];
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use crate::{
        hal::ops::{CopyIntersectionOp, Intersection},
        loom::{
            ops::{Access, BackendOp, TaskIr, TaskOp},
            runtime::{RuntimeBuilder, cpu::Backend},
            shape::{BoxIndices, TileTraits},
            tile::Tile,
        },
    };

    fn run<T: crate::loom::num::Scalar>(op: &CopyIntersectionOp<T>) {
        let io = op.io();
        let mut buffers = io.iter().map(TaskIr::lock).collect_vec();
        let backend = Backend { worker: 0, rank: 0 };
        op.execute(&backend, &mut buffers);
    }

    /// Copies a random sub-box between random tiles and compares with a per-element copy.
    #[tokio::test]
    async fn test_copy_intersection_random() {
        let runtime = RuntimeBuilder::new().build().await;
        for _ in 0..64 {
            let ndim = fastrand::usize(1..=4);
            let src_shape = (0..ndim).map(|_| fastrand::usize(1..6)).collect_vec();
            let dst_shape = (0..ndim).map(|_| fastrand::usize(1..6)).collect_vec();
            let src_offset = (0..ndim).map(|_| fastrand::usize(0..4)).collect_vec();
            let dst_offset = (0..ndim).map(|_| fastrand::usize(0..4)).collect_vec();
            let Some(plan) = Intersection::new(&src_offset, &src_shape, &dst_offset, &dst_shape) else {
                continue;
            };

            let src_traits = TileTraits::new(src_shape.clone());
            let dst_traits = TileTraits::new(dst_shape.clone());
            let data = (0..src_traits.nelems()).map(|x| x as f64).collect_vec();
            let src = Tile::from_vec(&runtime, src_traits.clone(), data).expect("tile");
            let dst = Tile::from_vec(&runtime, dst_traits.clone(), vec![-1.0; dst_traits.nelems()])
                .expect("tile");

            let op = CopyIntersectionOp::new(&src, &dst, &plan, Access::ReadWrite);
            run(&op);

            let mut expected = vec![-1.0; dst_traits.nelems()];
            for offset in BoxIndices::new(&vec![0; ndim], &plan.shape) {
                let src_index = offset.iter().zip(&plan.src_start).map(|(x, y)| x + y).collect_vec();
                let dst_index = offset.iter().zip(&plan.dst_start).map(|(x, y)| x + y).collect_vec();
                expected[dst_traits.index_to_linear(&dst_index)] =
                    src_traits.index_to_linear(&src_index) as f64;
            }
            assert_eq!(dst.handle().lock_read().as_slice::<f64>(), &expected[..]);
        }
    }

    #[test]
    fn test_advance() {
        // box [0, 2) x [1, 3) x [2, 4) in a tile of shape [3, 4, 5]
        let (start, shape, stride): ([usize; 3], [usize; 3], [usize; 3]) = ([0, 1, 2], [2, 2, 2], [1, 3, 12]);
        let mut index = start;
        let mut offset = 27;

        let mut rows = vec![(index, offset)];
        for _ in 0..4 {
            super::advance(&mut index, &start, &shape, &stride, &mut offset);
            rows.push((index, offset));
        }
        assert_eq!(
            rows,
            vec![
                ([0, 1, 2], 27),
                ([0, 2, 2], 30),
                ([0, 1, 3], 39),
                ([0, 2, 3], 42),
                // wrapped back to the start of the box
                ([0, 1, 2], 27),
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_scalar() {
        let runtime = RuntimeBuilder::new().build().await;
        let traits = TileTraits::new(Vec::<usize>::new());
        let src = Tile::from_vec(&runtime, traits.clone(), vec![7i64]).expect("tile");
        let dst = Tile::from_vec(&runtime, traits, vec![0i64]).expect("tile");
        let plan = Intersection::new(&[], &[], &[], &[]).expect("plan");
        run(&CopyIntersectionOp::new(&src, &dst, &plan, Access::Write));
        assert_eq!(dst.handle().lock_read().as_slice::<i64>(), &[7]);
    }
}
