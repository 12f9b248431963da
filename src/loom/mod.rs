//! The `loom` module provides the foundational abstractions for tiled, distributed tensors.
//! It describes how a logical N-D array is cut into tiles, where every tile lives, and how work
//! on tiles is submitted to an asynchronous task runtime.
//!
//! ## Key Components
//! 1. **Index Algebra**:
//!    - Multi-index ↔ linear-index maps over Fortran-ordered shapes (`TileTraits`).
//!    - Regular tilings with a smaller boundary tile (`TensorTraits`).
//!
//! 2. **Data Model**:
//!    - `DataHandle`: a refcounted, lazily materialised buffer with a coherence state.
//!    - `Tile` pairs traits with a handle; `Tensor` owns a grid of tiles spread over ranks.
//!
//! 3. **Execution Model**:
//!    - Tasks declare per-buffer `Access` modes; the runtime derives a dependency graph from
//!      submission order and runs independent tasks on CPU workers.
//!    - Codelets are registered per op type and device class when the runtime is built.
//!
//! 4. **Distribution**:
//!    - Every tile handle has an owning rank and a distributed `Tag`.
//!    - Cross-rank movement goes through a `Transport`; `mpi_transfer`/`mpi_flush` keep
//!      single-writer, flush-on-write coherence.

#![cfg_attr(target_arch = "wasm32", allow(async_fn_in_trait))]

pub mod comm;
pub mod handle;
pub mod num;
pub mod ops;
pub mod platform;
pub mod runtime;
pub mod shape;
pub mod tensor;
pub mod tile;
pub mod traits;
