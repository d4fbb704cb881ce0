//! The `loom` module provides the device-side building blocks of an accelerated solver.
//! It offers padded device matrices placed by a deferred allocator, and a queue that
//! interleaves device compute with point-to-point communication.
//!
//! ## Key Components
//! 1. **Matrices**:
//!    - Padded 2-D layouts (`MatrixLayout`) folded from arbitrary logical shapes.
//!    - Row slices, rotating banks and indexed gather/scatter views over matrices.
//!    - Host staging buffers (`MpiMatrix`, `MpiView`) for exchanging data across ranks.
//!
//! 2. **Device Abstraction**:
//!    - Driver primitives via the `Device` and `Stream` traits.
//!    - Extent-grouped allocation with two-phase placement.
//!    - A host-emulated device (`Cpu`) running each stream on a worker thread.
//!
//! 3. **Communication**:
//!    - Non-blocking send and receive via the `Communicator` trait.
//!    - An in-process communicator (`LocalComm`) connecting ranks through channels.
//!
//! 4. **Execution Model**:
//!    - Compute and communication kernels (`Kernel`) issued asynchronously.
//!    - Queues that only block where the kind of work changes.
//!    - Side-by-side running of several queues for overlap.

pub mod backend;
pub mod bank;
pub mod comm;
pub mod device;
pub mod matrix;
pub mod num;
pub mod ops;
pub mod queue;
pub mod slice;
pub mod view;
