use super::{
    device::{Device, DevicePtr},
    matrix::{Matrix, MatrixError},
    ops::RuntimeArg,
};

/// A rotating set of same-layout matrices, one of which is current.
///
/// Switching the current matrix moves no data, so solver stages can swap
/// double-buffered state for free.
#[derive(Debug)]
pub struct MatrixBank<D> {
    matrices: Vec<Matrix<D>>,
    current: usize,
}

impl<D> Clone for MatrixBank<D> {
    fn clone(&self) -> Self {
        Self {
            matrices: self.matrices.clone(),
            current: self.current,
        }
    }
}

impl<D: Device> MatrixBank<D> {
    pub fn new(matrices: Vec<Matrix<D>>, current: usize) -> Result<Self, MatrixError> {
        let first = matrices.first().ok_or(MatrixError::EmptyBank)?;
        if matrices.iter().any(|x| x.layout() != first.layout()) {
            return Err(MatrixError::BankLayout);
        }
        if current >= matrices.len() {
            return Err(MatrixError::BankIndex(current, matrices.len()));
        }
        Ok(Self { matrices, current })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Matrix<D>> {
        self.matrices.get(index)
    }

    #[inline]
    pub fn current(&self) -> &Matrix<D> {
        &self.matrices[self.current]
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn select(&mut self, index: usize) -> Result<(), MatrixError> {
        if index >= self.matrices.len() {
            return Err(MatrixError::BankIndex(index, self.matrices.len()));
        }
        self.current = index;
        Ok(())
    }

    /// Advances to the next matrix, wrapping around. Returns the new current index.
    pub fn rotate(&mut self) -> usize {
        self.current = (self.current + 1) % self.matrices.len();
        self.current
    }

    /// Address of the current matrix.
    #[inline]
    pub fn data(&self) -> Result<DevicePtr, MatrixError> {
        self.current().data()
    }

    #[inline]
    pub fn arg(&self) -> Result<RuntimeArg, MatrixError> {
        self.current().arg()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::MatrixBank;
    use crate::loom::{
        backend::BackendBuilder,
        device::CpuBuilder,
        matrix::{HostArray, MatrixError, Tags},
    };

    #[test]
    fn test_bank_rotation() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let backend = BackendBuilder::new(cpu).build();
        let matrices = (0..3)
            .map(|x| {
                let value = HostArray::from_vec([2, 2], vec![x as f32; 4])?;
                backend.matrix(&[2, 2], Some(value), Some("bank".into()), Tags::new())
            })
            .collect::<Result<Vec<_>, MatrixError>>()?;
        let mut bank = backend.matrix_bank(matrices.clone(), 0)?;
        backend.commit()?;

        assert_eq!(bank.len(), 3);
        assert_eq!(bank.data()?, matrices[0].data()?);
        assert_eq!(bank.rotate(), 1);
        assert_eq!(bank.data()?, matrices[1].data()?);
        assert_eq!(bank.current().get::<f32>()?.data(), &[1.0; 4]);
        assert_eq!(bank.rotate(), 2);
        assert_eq!(bank.rotate(), 0);

        bank.select(2)?;
        assert_eq!(bank.current_index(), 2);
        assert!(matches!(bank.select(3), Err(MatrixError::BankIndex(3, 3))));
        assert_eq!(bank.current_index(), 2);
        Ok(())
    }

    #[test]
    fn test_bank_validation() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let backend = BackendBuilder::new(cpu).build();
        let a = backend.matrix::<f32>(&[2, 2], None, None, Tags::new())?;
        let b = backend.matrix::<f32>(&[2, 3], None, None, Tags::new())?;

        assert!(matches!(
            MatrixBank::new(vec![a.clone(), b], 0),
            Err(MatrixError::BankLayout)
        ));
        assert!(matches!(
            MatrixBank::<crate::loom::device::Cpu>::new(vec![], 0),
            Err(MatrixError::EmptyBank)
        ));
        assert!(matches!(
            MatrixBank::new(vec![a], 1),
            Err(MatrixError::BankIndex(1, 1))
        ));
        Ok(())
    }
}
