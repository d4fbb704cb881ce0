use std::sync::{Arc, Mutex};

use super::{
    bank::MatrixBank,
    comm::Communicator,
    device::{
        Device,
        allocator::{Allocator, Extent},
    },
    matrix::{ConstMatrix, HostArray, Matrix, MatrixError, MatrixLayout, MpiMatrix, Tags, check_shape},
    num::{DataType, Scalar},
    queue::{Queue, QueueError},
    slice::MatrixRSlice,
    view::{self, MpiView, View},
};

/// Factory of matrices, views and queues on one device.
///
/// Matrices are created unplaced; [`Backend::commit`] allocates all of them at once
/// and uploads their initial values.
#[derive(Debug)]
pub struct Backend<D: Device> {
    device: Arc<D>,
    alignb: usize,
    allocator: Mutex<Allocator<D>>,
    /// Matrices created since the last successful commit.
    pending: Mutex<Vec<Matrix<D>>>,
}

pub struct BackendBuilder<D> {
    pub device: D,
    /// Byte alignment leading dimensions of `align`-tagged matrices are padded to.
    /// Defaults to the device alignment.
    pub alignb: Option<usize>,
}

impl<D: Device> BackendBuilder<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            alignb: None,
        }
    }

    pub fn alignb(mut self, alignb: usize) -> Self {
        self.alignb = Some(alignb);
        self
    }

    pub fn build(self) -> Backend<D> {
        let Self { device, alignb } = self;
        let alignb = alignb.unwrap_or_else(|| device.alignb()).max(1);
        let device = Arc::new(device);
        let allocator = Mutex::new(Allocator::new(device.clone()));
        let pending = Mutex::new(vec![]);
        Backend {
            device,
            alignb,
            allocator,
            pending,
        }
    }
}

impl<D: Device> Backend<D> {
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn alignb(&self) -> usize {
        self.alignb
    }

    /// Creates an unplaced matrix of logical shape `ioshape`.
    ///
    /// If given, `initval` must match `ioshape` and is uploaded on commit.
    pub fn matrix<T: Scalar>(
        &self,
        ioshape: &[usize],
        initval: Option<HostArray<T>>,
        extent: Option<Extent>,
        tags: Tags,
    ) -> Result<Matrix<D>, MatrixError> {
        if let Some(value) = &initval {
            check_shape(value.shape(), ioshape)?;
        }
        let initval = initval.map(|value| Box::from(value.bytes()));
        self.alloc_matrix(T::DATA_TYPE, ioshape, initval, extent, tags)
    }

    /// Creates a matrix with the shape and contents of `value`.
    pub fn const_matrix<T: Scalar>(
        &self,
        value: HostArray<T>,
        extent: Option<Extent>,
        tags: Tags,
    ) -> Result<ConstMatrix<D>, MatrixError> {
        let ioshape = value.shape().to_vec();
        let matrix = self.matrix(&ioshape, Some(value), extent, tags)?;
        Ok(ConstMatrix(matrix))
    }

    /// Creates a matrix paired with a host staging buffer for point-to-point transfers.
    pub fn mpi_matrix<T: Scalar>(
        &self,
        ioshape: &[usize],
        initval: Option<HostArray<T>>,
        extent: Option<Extent>,
        tags: Tags,
    ) -> Result<MpiMatrix<D>, MatrixError> {
        let matrix = self.matrix(ioshape, initval, extent, tags)?;
        Ok(MpiMatrix::new(matrix))
    }

    pub fn matrix_rslice(&self, matrix: &Matrix<D>, p: usize, q: usize) -> Result<MatrixRSlice<D>, MatrixError> {
        MatrixRSlice::new(matrix, p, q)
    }

    pub fn matrix_bank(&self, matrices: Vec<Matrix<D>>, current: usize) -> Result<MatrixBank<D>, MatrixError> {
        MatrixBank::new(matrices, current)
    }

    /// Creates a view of the elements `(matmap[i], rcmap[i])`, each of `vlen` components.
    ///
    /// Referenced matrices must be placed. The offset and stride maps are uploaded on commit.
    pub fn view(
        &self,
        matmap: &[&Matrix<D>],
        rcmap: &[[usize; 2]],
        stridemap: Option<&[usize]>,
        vlen: usize,
        tags: Tags,
    ) -> Result<View<D>, MatrixError> {
        let map = view::compile(matmap, rcmap, stridemap, vlen)?;
        let n = map.offsets.len();

        let offsets = HostArray::from_vec([n], map.offsets.clone())?;
        let strides = HostArray::from_vec([n], map.strides.clone())?;
        let mapping = self.matrix(&[n], Some(offsets), None, tags.clone())?;
        let strides = self.matrix(&[n], Some(strides), None, tags)?;
        Ok(View::new(matmap, vlen, map, mapping, strides))
    }

    /// Creates a view together with a compact `vlen × n` exchange matrix.
    pub fn mpi_view(
        &self,
        matmap: &[&Matrix<D>],
        rcmap: &[[usize; 2]],
        stridemap: Option<&[usize]>,
        vlen: usize,
        tags: Tags,
    ) -> Result<MpiView<D>, MatrixError> {
        let view = self.view(matmap, rcmap, stridemap, vlen, tags)?;
        let ioshape = [vlen, view.n()];
        let xchgmat = self.alloc_matrix(view.refdtype(), &ioshape, None, None, Tags::new())?;
        Ok(MpiView::new(view, MpiMatrix::new(xchgmat)))
    }

    fn alloc_matrix(
        &self,
        dtype: DataType,
        ioshape: &[usize],
        initval: Option<Box<[u8]>>,
        extent: Option<Extent>,
        tags: Tags,
    ) -> Result<Matrix<D>, MatrixError> {
        let ldmod = match tags.contains(Tags::ALIGN) {
            true => self.alignb / dtype.size(),
            false => 1,
        };
        let layout = MatrixLayout::new(dtype, ioshape, ldmod);
        let reservation = self
            .allocator
            .lock()
            .expect("failed to lock")
            .reserve(layout.data_size(), extent.clone())?;

        let matrix = Matrix::new(self.device.clone(), layout, tags, extent, reservation, initval);
        self.pending.lock().expect("failed to lock").push(matrix.clone());
        Ok(matrix)
    }

    /// Allocates every pending matrix and uploads the initial values.
    ///
    /// On allocation failure the device error is returned and the matrices stay unplaced.
    /// A failed upload does not stop the others; the first such error is returned.
    pub fn commit(&self) -> Result<(), MatrixError> {
        self.allocator.lock().expect("failed to lock").commit()?;

        let pending = std::mem::take(&mut *self.pending.lock().expect("failed to lock"));
        let (placed, unplaced): (Vec<_>, Vec<_>) = pending.into_iter().partition(Matrix::is_placed);
        log::debug!("placed {} matrices", placed.len());
        self.pending.lock().expect("failed to lock").extend(unplaced);

        let mut result = Ok(());
        for matrix in placed {
            if let Err(err) = matrix.on_place() {
                log::error!("failed to initialize matrix {}: {err}", matrix.id());
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Frees the storage of `extent`. Matrices placed in it must no longer be used.
    pub fn release(&self, extent: &Extent) -> Result<(), MatrixError> {
        self.allocator.lock().expect("failed to lock").release(extent)?;
        Ok(())
    }

    /// Creates an empty queue with fresh streams, communicating through `comm`.
    pub fn queue<C: Communicator>(&self, comm: C) -> Result<Queue<D, C>, QueueError> {
        Queue::new(&*self.device, comm)
    }
}
