//! Data movement built on the [`loom`](crate::loom) runtime: copy ops, their CPU codelets,
//! and the tile and tensor level copy, gather, scatter and clear operations.

pub mod cpu;
pub mod frontend;
pub mod ops;
