use crate::{
    hal::ops::ClearOp,
    loom::{
        handle::BufferGuard,
        num::Scalar,
        ops::{BackendOp, TaskOp},
        runtime::cpu::Backend,
    },
};

impl<T: Scalar> BackendOp<Backend> for ClearOp<T> {
    fn execute(&self, _backend: &Backend, buffers: &mut [BufferGuard<'_>]) {
        let [output] = buffers else {
            log::error!("{}: expected 1 buffer, got {}", self.name(), buffers.len());
            return;
        };
        let output = output.as_mut_slice::<T>();

        #[cfg(not(feature = "rayon"))]
        output.fill(T::zero());

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            output.par_iter_mut().for_each(|x| *x = T::zero());
        }
    }
}
