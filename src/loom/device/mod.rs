use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::Display;
use thiserror::Error;

use super::num::DataType;

pub use cpu::{Cpu, CpuBuilder, HostStream};

pub mod allocator;
pub mod cpu;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId;

/// An opaque address in device memory.
///
/// Only byte offsets can be applied to it; it never takes part in general integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{_0:#x}")]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Wraps a raw address handed out by a device driver.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw address, for handing back to a device driver.
    #[inline]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Advances the address by `bytes`.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Number of bytes `self` lies past `base`, if it does not lie before it.
    #[inline]
    pub fn offset_from(self, base: DevicePtr) -> Option<usize> {
        self.0.checked_sub(base.0).map(|bytes| bytes as usize)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("invalid device address {0}")]
    InvalidAddress(DevicePtr),
    #[error("device access of {size} bytes at {ptr} crosses its allocation")]
    OutOfBounds { ptr: DevicePtr, size: usize },
    #[error("host buffer of {len} bytes is too small, {required} required")]
    HostBounds { len: usize, required: usize },
    #[error("stream worker has shut down")]
    StreamClosed,
    #[error("failed to spawn stream worker")]
    Spawn(#[from] std::io::Error),
}

/// Arguments of a gather/scatter launch through an indexed view.
///
/// Element `k` of view entry `i` lives at element `mapping[i] + k * strides[i]` past `base`,
/// and at element `k * packed_ld + i` past `packed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherArgs {
    pub dtype: DataType,
    /// Number of view entries.
    pub n: usize,
    /// Vector length of each entry.
    pub vlen: usize,
    pub base: DevicePtr,
    /// `n` 32-bit element offsets relative to `base`.
    pub mapping: DevicePtr,
    /// `n` 32-bit element strides.
    pub strides: DevicePtr,
    pub packed: DevicePtr,
    pub packed_ld: usize,
}

/// An ordered asynchronous execution context on a device.
pub trait Stream: Send {
    /// Blocks until all work issued to the stream has completed.
    /// Reports the first error raised by that work, if any.
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// The driver-level primitives the matrices and queues are built upon.
pub trait Device: Send + Sync + 'static {
    type Stream: Stream;

    /// Alignment in bytes of allocations and padded leading dimensions.
    fn alignb(&self) -> usize;

    fn malloc(&self, size: usize) -> Result<DevicePtr, DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    fn create_stream(&self) -> Result<Self::Stream, DeviceError>;

    /// Synchronous strided copy of `height` rows of `width` bytes from host to device.
    fn memcpy2d_htod(
        &self,
        dst: DevicePtr,
        dpitch: usize,
        src: &[u8],
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Synchronous strided copy of `height` rows of `width` bytes from device to host.
    fn memcpy2d_dtoh(
        &self,
        dst: &mut [u8],
        dpitch: usize,
        src: DevicePtr,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Asynchronous counterpart of [`Device::memcpy2d_htod`] reading from a staging buffer.
    #[allow(clippy::too_many_arguments)]
    fn memcpy2d_htod_async(
        &self,
        stream: &Self::Stream,
        dst: DevicePtr,
        dpitch: usize,
        src: &Staging,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Asynchronous counterpart of [`Device::memcpy2d_dtoh`] writing into a staging buffer.
    #[allow(clippy::too_many_arguments)]
    fn memcpy2d_dtoh_async(
        &self,
        stream: &Self::Stream,
        dst: &Staging,
        dpitch: usize,
        src: DevicePtr,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Packs view elements into a dense buffer.
    fn gather(&self, stream: &Self::Stream, args: GatherArgs) -> Result<(), DeviceError>;

    /// Unpacks a dense buffer back into view elements.
    fn scatter(&self, stream: &Self::Stream, args: GatherArgs) -> Result<(), DeviceError>;
}

/// A host-resident buffer shared between device copies and communication requests.
#[derive(Debug, Clone)]
pub struct Staging(Arc<RwLock<Box<[u8]>>>);

impl Staging {
    pub fn new(size: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; size].into_boxed_slice())))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.0.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.0.write().expect("failed to lock")
    }

    /// Reads the contents as a slice of `T`.
    #[inline]
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.read())
    }
}
