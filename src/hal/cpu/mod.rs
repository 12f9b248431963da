use half::{bf16, f16};

use super::ops::{ClearOp, CopyIntersectionOp, CopyOp};
use crate::loom::{num::Scalar, runtime::RuntimeBuilder};

mod clear;
mod copy;

impl RuntimeBuilder {
    /// Registers the CPU codelets of this crate: copies and clears, for every element type.
    pub fn add_default_ops(self) -> Self {
        self.add_ops::<f32>()
            .add_ops::<f64>()
            .add_ops::<f16>()
            .add_ops::<bf16>()
            .add_ops::<i64>()
    }

    fn add_ops<T: Scalar>(self) -> Self {
        self.add_op::<CopyOp<T>>()
            .add_op::<CopyIntersectionOp<T>>()
            .add_op::<ClearOp<T>>()
    }
}
