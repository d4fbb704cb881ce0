//! Kernels built on top of the `loom` primitives.

pub mod packing;
