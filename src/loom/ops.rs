use std::borrow::Cow;

use derive_more::Display;

use super::{
    comm::{CommError, Communicator},
    device::{Device, DeviceError, DevicePtr},
};

/// The two categories of asynchronous work a queue interleaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum KernelKind {
    Compute,
    Mpi,
}

/// A runtime argument passed to a kernel when it is executed.
#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum RuntimeArg {
    #[display("{_0}")]
    Int(i64),
    #[display("{_0}")]
    Float(f64),
    #[display("{_0}")]
    Ptr(DevicePtr),
}

/// Work issued onto the device streams of a queue.
///
/// Completion is only observable through synchronizing the streams.
pub trait ComputeKernel<D: Device>: Send {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    fn run(
        &self,
        comp: &D::Stream,
        copy: &D::Stream,
        args: &[RuntimeArg],
    ) -> Result<(), DeviceError>;
}

/// Work issued as non-blocking point-to-point communication.
///
/// Every request issued must be appended to `reqs`; completion is only observable
/// through waiting on them.
pub trait MpiKernel<C: Communicator>: Send {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    fn run(&self, reqs: &mut Vec<C::Request>, args: &[RuntimeArg]) -> Result<(), CommError>;
}

/// A work item of a queue.
pub enum Kernel<D: Device, C: Communicator> {
    Compute(Box<dyn ComputeKernel<D>>),
    Mpi(Box<dyn MpiKernel<C>>),
}

impl<D: Device, C: Communicator> std::fmt::Debug for Kernel<D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(&self.kind().to_string())
            .field(&self.name())
            .finish()
    }
}

impl<D: Device, C: Communicator> Kernel<D, C> {
    #[inline]
    pub fn compute(kernel: impl ComputeKernel<D> + 'static) -> Self {
        Self::Compute(Box::new(kernel))
    }

    #[inline]
    pub fn mpi(kernel: impl MpiKernel<C> + 'static) -> Self {
        Self::Mpi(Box::new(kernel))
    }

    #[inline]
    pub fn kind(&self) -> KernelKind {
        match self {
            Kernel::Compute(_) => KernelKind::Compute,
            Kernel::Mpi(_) => KernelKind::Mpi,
        }
    }

    #[inline]
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Kernel::Compute(kernel) => kernel.name(),
            Kernel::Mpi(kernel) => kernel.name(),
        }
    }
}

/// A compute kernel defined by a closure.
pub struct ComputeFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> ComputeFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        let name = name.into();
        Self { name, f }
    }
}

impl<D, F> ComputeKernel<D> for ComputeFn<F>
where
    D: Device,
    F: Fn(&D::Stream, &D::Stream, &[RuntimeArg]) -> Result<(), DeviceError> + Send,
{
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    #[inline]
    fn run(
        &self,
        comp: &D::Stream,
        copy: &D::Stream,
        args: &[RuntimeArg],
    ) -> Result<(), DeviceError> {
        (self.f)(comp, copy, args)
    }
}

/// A communication kernel defined by a closure.
pub struct MpiFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> MpiFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        let name = name.into();
        Self { name, f }
    }
}

impl<C, F> MpiKernel<C> for MpiFn<F>
where
    C: Communicator,
    F: Fn(&mut Vec<C::Request>, &[RuntimeArg]) -> Result<(), CommError> + Send,
{
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    #[inline]
    fn run(&self, reqs: &mut Vec<C::Request>, args: &[RuntimeArg]) -> Result<(), CommError> {
        (self.f)(reqs, args)
    }
}
