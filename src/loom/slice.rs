use std::ops::Range;

use super::{
    device::{Device, DevicePtr},
    matrix::{Matrix, MatrixError},
    num::DataType,
    ops::RuntimeArg,
};

/// A read-only view onto the rows `[p, q)` of a matrix. Shares the parent's storage.
///
/// The slice starts `p * pitch` bytes into the parent. It is aligned whenever the parent
/// pads its leading dimension, and may be unaligned otherwise; see [`MatrixRSlice::is_aligned`].
#[derive(Debug)]
pub struct MatrixRSlice<D> {
    parent: Matrix<D>,
    rows: Range<usize>,
}

impl<D> Clone for MatrixRSlice<D> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            rows: self.rows.clone(),
        }
    }
}

impl<D: Device> MatrixRSlice<D> {
    pub fn new(parent: &Matrix<D>, p: usize, q: usize) -> Result<Self, MatrixError> {
        if p >= q || q > parent.nrow() {
            return Err(MatrixError::RowRange(p, q, parent.nrow()));
        }
        let parent = parent.clone();
        let rows = p..q;
        Ok(Self { parent, rows })
    }

    #[inline]
    pub fn parent(&self) -> &Matrix<D> {
        &self.parent
    }

    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    #[inline]
    pub fn nrow(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn ncol(&self) -> usize {
        self.parent.ncol()
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.parent.dtype()
    }

    #[inline]
    pub fn leaddim(&self) -> usize {
        self.parent.leaddim()
    }

    #[inline]
    pub fn pitch(&self) -> usize {
        self.parent.pitch()
    }

    /// Byte offset of the first row relative to the parent's data.
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.rows.start * self.parent.pitch()
    }

    #[inline]
    pub fn data(&self) -> Result<DevicePtr, MatrixError> {
        Ok(self.parent.data()?.offset(self.byte_offset()))
    }

    #[inline]
    pub fn arg(&self) -> Result<RuntimeArg, MatrixError> {
        Ok(RuntimeArg::Ptr(self.data()?))
    }

    /// Whether the slice's first row lies on an `alignb` byte boundary.
    #[inline]
    pub fn is_aligned(&self, alignb: usize) -> Result<bool, MatrixError> {
        let placement = self.parent.placement()?;
        let base = placement.basedata.into_raw() as usize;
        Ok((base + placement.byte_offset + self.byte_offset()) % alignb.max(1) == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::MatrixRSlice;
    use crate::loom::{
        backend::BackendBuilder,
        device::CpuBuilder,
        matrix::{MatrixError, Tags},
    };

    #[test]
    fn test_row_slice() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(32).build();
        let backend = BackendBuilder::new(cpu).build();
        let aligned = backend.matrix::<f32>(&[8, 13], None, None, Tags::from([Tags::ALIGN]))?;
        let packed = backend.matrix::<f32>(&[8, 13], None, None, Tags::new())?;

        let slice = MatrixRSlice::new(&aligned, 2, 5)?;
        assert!(matches!(slice.data(), Err(MatrixError::Unplaced(_))));
        backend.commit()?;

        assert_eq!(slice.nrow(), 3);
        assert_eq!(slice.pitch(), 16 * 4);
        assert_eq!(slice.data()?, aligned.data()?.offset(2 * 64));
        assert!(slice.is_aligned(32)?);

        // without padding a row start may fall off the alignment
        let slice = MatrixRSlice::new(&packed, 1, 8)?;
        assert_eq!(slice.byte_offset(), 13 * 4);
        assert!(!slice.is_aligned(32)?);
        assert!(slice.is_aligned(4)?);

        for (p, q) in [(3, 3), (4, 2), (0, 9)] {
            assert!(matches!(
                MatrixRSlice::new(&aligned, p, q),
                Err(MatrixError::RowRange(..))
            ));
        }
        MatrixRSlice::new(&aligned, 0, 8)?;
        Ok(())
    }
}
