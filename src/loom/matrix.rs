use std::sync::{Arc, Mutex};

use derive_more::{Deref, Display};
use half::f16;
use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    device::{
        Device, DeviceError, DevicePtr, Staging,
        allocator::{AllocError, Extent, Placement, Reservation},
    },
    num::{DataType, Scalar},
    ops::RuntimeArg,
};

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix shape error: array shape {0:?} does not match {1:?}")]
    Shape(Vec<usize>, Vec<usize>),
    #[error("matrix type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("array creation error: shape {0:?}'s size does not match data len {1}")]
    Create(Vec<usize>, usize),
    #[error("matrix {0} has not been placed by the allocator")]
    Unplaced(MatrixId),
    #[error("row slice [{0}, {1}) out of range for {2} rows")]
    RowRange(usize, usize, usize),
    #[error("bank matrices must share one layout")]
    BankLayout,
    #[error("bank index {0} out of range for {1} matrices")]
    BankIndex(usize, usize),
    #[error("bank must hold at least one matrix")]
    EmptyBank,
    #[error("view maps of lengths {0}, {1} and {2} mismatch")]
    ViewLength(usize, usize, usize),
    #[error("view must map at least one element")]
    EmptyView,
    #[error("view element ({1}, {2}) out of range of matrix {0}")]
    ViewIndex(MatrixId, usize, usize),
    #[error("view matrices do not share one base allocation")]
    ViewBase,
    #[error("view offset overflows a 32-bit index")]
    ViewOverflow,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct MatrixId(uid::Id<MatrixId>);

impl MatrixId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Free-form tags attached to matrices at construction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tags(HashSet<Arc<str>>);

impl Tags {
    /// Requests the leading dimension to be padded to the device alignment.
    pub const ALIGN: &'static str = "align";

    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with(mut self, tag: &str) -> Self {
        self.0.insert(tag.into());
        self
    }

    #[inline]
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }
}

impl<const N: usize> From<[&str; N]> for Tags {
    fn from(value: [&str; N]) -> Self {
        Self(value.into_iter().map(Arc::from).collect())
    }
}

/// Shape and stride metadata of a padded device matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MatrixLayout {
    pub dtype: DataType,
    /// The logical shape callers read and write.
    pub ioshape: Arc<[usize]>,
    pub nrow: usize,
    pub ncol: usize,
    /// Padded number of columns between rows.
    pub leaddim: usize,
    /// Length of the innermost logical axis.
    pub leadsubdim: usize,
}

impl MatrixLayout {
    pub fn new(dtype: DataType, ioshape: &[usize], ldmod: usize) -> Self {
        let (nrow, ncol) = Self::compact_shape(ioshape);
        let leaddim = Self::lead_dim(ncol, ldmod);
        let leadsubdim = ioshape.last().copied().unwrap_or(1);
        Self {
            dtype,
            ioshape: ioshape.into(),
            nrow,
            ncol,
            leaddim,
            leadsubdim,
        }
    }

    /// Folds a logical shape into `(nrow, ncol)`: the leading half of the axes form rows,
    /// the trailing half columns.
    pub fn compact_shape(ioshape: &[usize]) -> (usize, usize) {
        let (rows, cols) = ioshape.split_at(ioshape.len() / 2);
        (rows.iter().product(), cols.iter().product())
    }

    /// Smallest multiple of `ldmod` no less than `ncol`.
    #[inline]
    pub fn lead_dim(ncol: usize, ldmod: usize) -> usize {
        let ldmod = ldmod.max(1);
        ncol.div_ceil(ldmod) * ldmod
    }

    #[inline]
    pub fn itemsize(&self) -> usize {
        self.dtype.size()
    }

    /// Bytes between the starts of consecutive rows.
    #[inline]
    pub fn pitch(&self) -> usize {
        self.leaddim * self.itemsize()
    }

    /// Bytes of one compacted row.
    #[inline]
    pub fn row_size(&self) -> usize {
        self.ncol * self.itemsize()
    }

    /// Bytes of device storage, padding included.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.nrow * self.pitch()
    }
}

/// A dense row-major array in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray<T> {
    shape: Vec<usize>,
    data: Box<[T]>,
}

impl<T: Scalar> HostArray<T> {
    pub fn from_vec(shape: impl Into<Vec<usize>>, data: impl Into<Box<[T]>>) -> Result<Self, MatrixError> {
        let shape = shape.into();
        let data = data.into();
        if shape.iter().product::<usize>() != data.len() {
            return Err(MatrixError::Create(shape, data.len()));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let data = vec![T::zero(); shape.iter().product()].into();
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn into_data(self) -> Box<[T]> {
        self.data
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

#[derive(Debug)]
struct MatrixInner {
    id: MatrixId,
    layout: MatrixLayout,
    tags: Tags,
    extent: Option<Extent>,
    reservation: Reservation,
    /// Contents to upload once placed.
    initval: Mutex<Option<Box<[u8]>>>,
}

/// A 2-D, alignment-padded device buffer whose storage is owned by an allocator extent.
///
/// A matrix is constructed unplaced. Reading, writing or passing it to a kernel fails
/// with [`MatrixError::Unplaced`] until the allocator commits its extent.
#[derive(Debug)]
pub struct Matrix<D> {
    device: Arc<D>,
    inner: Arc<MatrixInner>,
}

impl<D> Clone for Matrix<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<D> PartialEq for Matrix<D> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<D> Eq for Matrix<D> {}

impl<D> std::hash::Hash for Matrix<D> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<D: Device> Matrix<D> {
    /// Creates an unplaced matrix. `initval` must already be compacted to `nrow × ncol`.
    pub(crate) fn new(
        device: Arc<D>,
        layout: MatrixLayout,
        tags: Tags,
        extent: Option<Extent>,
        reservation: Reservation,
        initval: Option<Box<[u8]>>,
    ) -> Self {
        let id = MatrixId::new();
        let initval = Mutex::new(initval);
        let inner = Arc::new(MatrixInner {
            id,
            layout,
            tags,
            extent,
            reservation,
            initval,
        });
        Self { device, inner }
    }

    /// Uploads and discards the deferred initial value. Called once after placement.
    pub(crate) fn on_place(&self) -> Result<(), MatrixError> {
        let initval = self.inner.initval.lock().expect("failed to lock").take();
        if let Some(initval) = initval {
            self.upload(&initval)?;
        }
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> MatrixId {
        self.inner.id
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn layout(&self) -> &MatrixLayout {
        &self.inner.layout
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.inner.layout.dtype
    }

    #[inline]
    pub fn ioshape(&self) -> &[usize] {
        &self.inner.layout.ioshape
    }

    #[inline]
    pub fn nrow(&self) -> usize {
        self.inner.layout.nrow
    }

    #[inline]
    pub fn ncol(&self) -> usize {
        self.inner.layout.ncol
    }

    #[inline]
    pub fn leaddim(&self) -> usize {
        self.inner.layout.leaddim
    }

    #[inline]
    pub fn leadsubdim(&self) -> usize {
        self.inner.layout.leadsubdim
    }

    #[inline]
    pub fn itemsize(&self) -> usize {
        self.inner.layout.itemsize()
    }

    #[inline]
    pub fn pitch(&self) -> usize {
        self.inner.layout.pitch()
    }

    #[inline]
    pub fn tags(&self) -> &Tags {
        &self.inner.tags
    }

    #[inline]
    pub fn extent(&self) -> Option<&Extent> {
        self.inner.extent.as_ref()
    }

    #[inline]
    pub fn is_placed(&self) -> bool {
        self.inner.reservation.is_placed()
    }

    #[inline]
    pub fn placement(&self) -> Result<Placement, MatrixError> {
        self.inner
            .reservation
            .placement()
            .ok_or(MatrixError::Unplaced(self.inner.id))
    }

    /// Address of the allocation the matrix lives in.
    #[inline]
    pub fn basedata(&self) -> Result<DevicePtr, MatrixError> {
        Ok(self.placement()?.basedata)
    }

    /// Address of the first element.
    #[inline]
    pub fn data(&self) -> Result<DevicePtr, MatrixError> {
        Ok(self.placement()?.data())
    }

    /// Element offset of the first element relative to [`Matrix::basedata`].
    #[inline]
    pub fn offset(&self) -> Result<usize, MatrixError> {
        Ok(self.placement()?.byte_offset / self.itemsize())
    }

    /// The matrix as a kernel argument.
    #[inline]
    pub fn arg(&self) -> Result<RuntimeArg, MatrixError> {
        Ok(RuntimeArg::Ptr(self.data()?))
    }

    fn check_type<T: Scalar>(&self) -> Result<(), MatrixError> {
        match T::DATA_TYPE == self.dtype() {
            true => Ok(()),
            false => Err(MatrixError::Type(T::DATA_TYPE, self.dtype())),
        }
    }

    fn upload(&self, contents: &[u8]) -> Result<(), MatrixError> {
        let layout = self.layout();
        let width = layout.row_size();
        let data = self.data()?;
        self.device
            .memcpy2d_htod(data, layout.pitch(), contents, width, width, layout.nrow)?;
        Ok(())
    }

    /// Reads the matrix back to the host in its logical shape.
    pub fn get<T: Scalar>(&self) -> Result<HostArray<T>, MatrixError> {
        self.check_type::<T>()?;
        let layout = self.layout();
        let width = layout.row_size();
        let data = self.data()?;

        let mut buf = vec![T::zero(); layout.nrow * layout.ncol];
        self.device.memcpy2d_dtoh(
            bytemuck::cast_slice_mut(&mut buf),
            width,
            data,
            layout.pitch(),
            width,
            layout.nrow,
        )?;
        HostArray::from_vec(layout.ioshape.to_vec(), buf)
    }

    /// Writes `value` into the matrix, converting its elements to the matrix's data type.
    /// Padding columns are left untouched.
    pub fn set<T: Scalar>(&self, value: &HostArray<T>) -> Result<(), MatrixError> {
        check_shape(value.shape(), self.ioshape())?;
        match T::DATA_TYPE == self.dtype() {
            true => self.upload(value.bytes()),
            false => self.upload(&cast_bytes(value.data(), self.dtype())),
        }
    }
}

/// Converts `data` element-wise to `dtype` and returns the raw bytes.
fn cast_bytes<T: Scalar>(data: &[T], dtype: DataType) -> Vec<u8> {
    fn cast<T: Scalar, U: Scalar>(data: &[T]) -> Vec<u8> {
        let data = data.iter().map(|&x| U::from_f64(x.to_f64())).collect_vec();
        bytemuck::cast_slice(&data).to_vec()
    }

    match dtype {
        DataType::F64 => cast::<T, f64>(data),
        DataType::F32 => cast::<T, f32>(data),
        DataType::F16 => cast::<T, f16>(data),
        DataType::I32 => cast::<T, i32>(data),
        DataType::U32 => cast::<T, u32>(data),
        DataType::U8 => cast::<T, u8>(data),
    }
}

pub(crate) fn check_shape(shape: &[usize], ioshape: &[usize]) -> Result<(), MatrixError> {
    match shape == ioshape {
        true => Ok(()),
        false => Err(MatrixError::Shape(shape.to_vec(), ioshape.to_vec())),
    }
}

/// A matrix whose contents are fixed at construction.
#[derive(Debug, Deref)]
pub struct ConstMatrix<D>(pub(crate) Matrix<D>);

impl<D> Clone for ConstMatrix<D> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: Device> ConstMatrix<D> {
    #[inline]
    pub fn into_inner(self) -> Matrix<D> {
        self.0
    }
}

/// A matrix paired with a host staging buffer that point-to-point transfers read and write.
#[derive(Debug, Deref)]
pub struct MpiMatrix<D> {
    #[deref]
    matrix: Matrix<D>,
    staging: Staging,
}

impl<D> Clone for MpiMatrix<D> {
    fn clone(&self) -> Self {
        Self {
            matrix: self.matrix.clone(),
            staging: self.staging.clone(),
        }
    }
}

impl<D: Device> MpiMatrix<D> {
    pub(crate) fn new(matrix: Matrix<D>) -> Self {
        let layout = matrix.layout();
        let staging = Staging::new(layout.nrow * layout.row_size());
        Self { matrix, staging }
    }

    #[inline]
    pub fn matrix(&self) -> &Matrix<D> {
        &self.matrix
    }

    /// The compacted `nrow × ncol` host copy.
    #[inline]
    pub fn staging(&self) -> &Staging {
        &self.staging
    }
}

/// Unique matrices in first-appearance order.
pub(crate) fn unique<'a, D: 'a>(matrices: impl IntoIterator<Item = &'a Matrix<D>>) -> Vec<Matrix<D>> {
    matrices.into_iter().unique().cloned().collect()
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;

    use super::{HostArray, MatrixError, MatrixLayout, Tags};
    use crate::loom::{
        backend::BackendBuilder,
        device::{CpuBuilder, DeviceError},
        num::DataType,
    };

    #[test]
    fn test_lead_dim() {
        assert_eq!(MatrixLayout::lead_dim(13, 4), 16);
        assert_eq!(MatrixLayout::lead_dim(16, 4), 16);
        assert_eq!(MatrixLayout::lead_dim(13, 1), 13);
        assert_eq!(MatrixLayout::lead_dim(1, 8), 8);

        for _ in 0..256 {
            let ncol = fastrand::usize(1..1000);
            let ldmod = fastrand::usize(1..64);
            let leaddim = MatrixLayout::lead_dim(ncol, ldmod);
            assert!(leaddim >= ncol);
            assert_eq!(leaddim % ldmod, 0);
            assert!(leaddim - ldmod < ncol);
        }
    }

    #[test]
    fn test_compact_shape() {
        assert_eq!(MatrixLayout::compact_shape(&[7]), (1, 7));
        assert_eq!(MatrixLayout::compact_shape(&[3, 5]), (3, 5));
        assert_eq!(MatrixLayout::compact_shape(&[3, 5, 2]), (3, 10));
        assert_eq!(MatrixLayout::compact_shape(&[3, 5, 2, 4]), (15, 8));

        let layout = MatrixLayout::new(DataType::F64, &[4, 3, 5], 4);
        assert_eq!((layout.nrow, layout.ncol, layout.leaddim), (4, 15, 16));
        assert_eq!(layout.pitch(), 128);
        assert_eq!(layout.leadsubdim, 5);
        assert_eq!(layout.data_size(), 4 * 128);
    }

    #[test]
    fn test_round_trip() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(32).build();
        let backend = BackendBuilder::new(cpu).build();

        let shapes: [&[usize]; 4] = [&[5], &[3, 13], &[2, 3, 7], &[2, 2, 3, 3]];
        let mut matrices = vec![];
        for shape in shapes {
            let tags = Tags::from([Tags::ALIGN]);
            let matrix = backend.matrix::<f32>(shape, None, None, tags)?;
            matrices.push(matrix);
        }
        backend.commit()?;

        for matrix in matrices {
            let shape = matrix.ioshape().to_vec();
            let len = shape.iter().product();
            let data: Vec<f32> = (0..len).map(|_| fastrand::f32()).collect();
            let value = HostArray::from_vec(shape, data)?;
            matrix.set(&value)?;
            assert_eq!(matrix.get::<f32>()?, value);
            assert_eq!(matrix.leaddim() % 8, 0);
        }
        Ok(())
    }

    #[test]
    fn test_padding_untouched() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(16).build();
        let backend = BackendBuilder::new(cpu.clone()).build();
        let matrix = backend.matrix::<u8>(&[2, 3], None, None, Tags::from([Tags::ALIGN]))?;
        backend.commit()?;
        assert_eq!(matrix.leaddim(), 16);

        // scribble over the padding, then write the logical contents
        let data = matrix.data()?;
        let device = matrix.device();
        use crate::loom::device::Device;
        device.memcpy2d_htod(data, 16, &[0xff; 32], 16, 16, 2)?;
        matrix.set(&HostArray::from_vec([2, 3], vec![1u8, 2, 3, 4, 5, 6])?)?;

        let mut raw = [0u8; 32];
        device.memcpy2d_dtoh(&mut raw, 16, data, 16, 16, 2)?;
        assert_eq!(&raw[..4], &[1, 2, 3, 0xff]);
        assert_eq!(&raw[16..20], &[4, 5, 6, 0xff]);
        assert_eq!(matrix.get::<u8>()?.data(), &[1, 2, 3, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let backend = BackendBuilder::new(cpu).build();
        let initval = HostArray::from_vec([2, 2], vec![1.0f64, 2.0, 3.0, 4.0])?;
        let matrix = backend.matrix(&[2, 2], Some(initval.clone()), None, Tags::new())?;
        backend.commit()?;

        let wrong = HostArray::<f64>::zeros([4]);
        let err = matrix.set(&wrong).err().ok_or("set must fail")?;
        assert!(matches!(err, MatrixError::Shape(_, _)));
        // no partial write
        assert_eq!(matrix.get::<f64>()?, initval);

        let err = matrix.get::<f32>().err().ok_or("get must fail")?;
        assert!(matches!(err, MatrixError::Type(DataType::F32, DataType::F64)));
        Ok(())
    }

    #[test]
    fn test_set_converts() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(32).build();
        let backend = BackendBuilder::new(cpu).build();
        let matrix = backend.matrix::<f64>(&[2, 3], None, None, Tags::from([Tags::ALIGN]))?;
        let counts = backend.matrix::<u8>(&[3], None, None, Tags::new())?;
        backend.commit()?;

        let value = HostArray::from_vec([2, 3], vec![0.5f32, -1.0, 2.25, 3.0, 4.5, -6.0])?;
        matrix.set(&value)?;
        assert_eq!(matrix.get::<f64>()?.data(), &[0.5, -1.0, 2.25, 3.0, 4.5, -6.0]);

        counts.set(&HostArray::from_vec([3], vec![1.9f64, 256.0, -3.0])?)?;
        assert_eq!(counts.get::<u8>()?.data(), &[1, 255, 0]);

        // shape is still checked first
        let err = matrix.set(&HostArray::<f32>::zeros([3, 2])).err().ok_or("set must fail")?;
        assert!(matches!(err, MatrixError::Shape(..)));
        Ok(())
    }

    #[test]
    fn test_unplaced_fails_fast() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let backend = BackendBuilder::new(cpu).build();
        let matrix = backend.matrix::<f16>(&[4, 4], None, None, Tags::new())?;

        assert!(!matrix.is_placed());
        assert!(matches!(matrix.data(), Err(MatrixError::Unplaced(_))));
        assert!(matches!(matrix.arg(), Err(MatrixError::Unplaced(_))));
        assert!(matches!(matrix.get::<f16>(), Err(MatrixError::Unplaced(_))));

        backend.commit()?;
        assert!(matrix.is_placed());
        assert_eq!(matrix.get::<f16>()?, HostArray::zeros([4, 4]));
        Ok(())
    }

    #[test]
    fn test_deferred_initval() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(32).build();
        let backend = BackendBuilder::new(cpu).build();
        let value = HostArray::from_vec([3, 5], (0..15).map(|x| x as f32).collect::<Vec<_>>())?;
        let matrix = backend.const_matrix(value.clone(), Some("consts".into()), Tags::from([Tags::ALIGN]))?;
        let other = backend.matrix::<f32>(&[3, 5], Some(value.clone()), Some("consts".into()), Tags::new())?;
        backend.commit()?;

        assert_eq!(matrix.get::<f32>()?, value);
        assert_eq!(other.get::<f32>()?, value);
        assert_eq!(matrix.basedata()?, other.basedata()?);
        assert_eq!(matrix.offset()?, 0);
        assert_eq!(other.offset()?, 3 * 8);
        Ok(())
    }

    #[test]
    fn test_allocation_failure() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().capacity(64).build();
        let backend = BackendBuilder::new(cpu).build();
        let matrix = backend.matrix::<f64>(&[16, 16], None, None, Tags::new())?;
        let err = backend.commit().err().ok_or("commit must fail")?;
        assert!(matches!(
            err,
            MatrixError::Alloc(crate::loom::device::allocator::AllocError::Device(
                DeviceError::OutOfMemory { .. }
            ))
        ));
        assert!(!matrix.is_placed());
        Ok(())
    }
}
