use derive_more::Deref;
use itertools::{Itertools, izip};

use super::{
    device::{Device, DevicePtr, GatherArgs},
    matrix::{Matrix, MatrixError, MpiMatrix, unique},
    num::DataType,
};

/// Offsets and strides of view elements, relative to the shared base allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ViewMapping {
    pub basedata: DevicePtr,
    pub refdtype: DataType,
    pub offsets: Vec<i32>,
    pub strides: Vec<i32>,
}

/// Resolves every `(matrix, row, col)` triple into an element offset from the base allocation
/// and a stride between the `vlen` components of the element.
pub(crate) fn compile<D: Device>(
    matmap: &[&Matrix<D>],
    rcmap: &[[usize; 2]],
    stridemap: Option<&[usize]>,
    vlen: usize,
) -> Result<ViewMapping, MatrixError> {
    if matmap.len() != rcmap.len() || stridemap.is_some_and(|x| x.len() != matmap.len()) {
        let strides = stridemap.map_or(matmap.len(), <[_]>::len);
        return Err(MatrixError::ViewLength(matmap.len(), rcmap.len(), strides));
    }

    let mats = unique(matmap.iter().copied());
    let (basedata, refdtype) = match mats.first() {
        Some(first) => (first.basedata()?, first.dtype()),
        None => return Err(MatrixError::EmptyView),
    };
    for m in &mats {
        if m.dtype() != refdtype {
            return Err(MatrixError::Type(m.dtype(), refdtype));
        }
        if m.basedata()? != basedata {
            return Err(MatrixError::ViewBase);
        }
    }

    let stridemap = stridemap.map(<[_]>::iter).into_iter().flatten().map(Some);
    let stridemap = stridemap.chain(std::iter::repeat(None));

    let (offsets, strides): (Vec<_>, Vec<_>) = izip!(matmap, rcmap, stridemap)
        .map(|(m, &[row, col], stride)| {
            let stride = stride.copied().unwrap_or(m.leaddim());
            let index = row * m.leaddim() + col;
            let last = index + vlen.saturating_sub(1) * stride;
            if row >= m.nrow() || col >= m.ncol() || last >= m.nrow() * m.leaddim() {
                return Err(MatrixError::ViewIndex(m.id(), row, col));
            }
            let offset = i32::try_from(m.offset()? + index).map_err(|_| MatrixError::ViewOverflow)?;
            let stride = i32::try_from(stride).map_err(|_| MatrixError::ViewOverflow)?;
            Ok((offset, stride))
        })
        .process_results(|iter| iter.unzip())?;

    Ok(ViewMapping {
        basedata,
        refdtype,
        offsets,
        strides,
    })
}

/// An element-level gather/scatter map over one or more matrices.
///
/// Element `i` has `vlen` components; component `k` lives `mapping[i] + k * strides[i]`
/// elements past [`View::basedata`]. Both maps are stored on the device as `i32` matrices.
#[derive(Debug)]
pub struct View<D> {
    mats: Vec<Matrix<D>>,
    basedata: DevicePtr,
    refdtype: DataType,
    vlen: usize,
    mapping: Matrix<D>,
    strides: Matrix<D>,
}

impl<D> Clone for View<D> {
    fn clone(&self) -> Self {
        Self {
            mats: self.mats.clone(),
            basedata: self.basedata,
            refdtype: self.refdtype,
            vlen: self.vlen,
            mapping: self.mapping.clone(),
            strides: self.strides.clone(),
        }
    }
}

impl<D: Device> View<D> {
    pub(crate) fn new(
        matmap: &[&Matrix<D>],
        vlen: usize,
        map: ViewMapping,
        mapping: Matrix<D>,
        strides: Matrix<D>,
    ) -> Self {
        let mats = unique(matmap.iter().copied());
        let ViewMapping {
            basedata, refdtype, ..
        } = map;
        Self {
            mats,
            basedata,
            refdtype,
            vlen,
            mapping,
            strides,
        }
    }

    /// Number of view elements.
    #[inline]
    pub fn n(&self) -> usize {
        self.mapping.ncol()
    }

    #[inline]
    pub fn vlen(&self) -> usize {
        self.vlen
    }

    #[inline]
    pub fn refdtype(&self) -> DataType {
        self.refdtype
    }

    /// The distinct matrices the view addresses.
    #[inline]
    pub fn matrices(&self) -> &[Matrix<D>] {
        &self.mats
    }

    #[inline]
    pub fn basedata(&self) -> DevicePtr {
        self.basedata
    }

    /// Per-element offsets relative to [`View::basedata`].
    #[inline]
    pub fn mapping(&self) -> &Matrix<D> {
        &self.mapping
    }

    /// Per-element strides between components.
    #[inline]
    pub fn strides(&self) -> &Matrix<D> {
        &self.strides
    }

    /// Launch arguments for packing the view into, or unpacking it from, `packed`.
    pub fn gather_args(&self, packed: &Matrix<D>) -> Result<GatherArgs, MatrixError> {
        if packed.dtype() != self.refdtype {
            return Err(MatrixError::Type(packed.dtype(), self.refdtype));
        }
        if (packed.nrow(), packed.ncol()) != (self.vlen, self.n()) {
            let shape = vec![self.vlen, self.n()];
            return Err(MatrixError::Shape(packed.ioshape().to_vec(), shape));
        }
        Ok(GatherArgs {
            dtype: self.refdtype,
            n: self.n(),
            vlen: self.vlen,
            base: self.basedata,
            mapping: self.mapping.data()?,
            strides: self.strides.data()?,
            packed: packed.data()?,
            packed_ld: packed.leaddim(),
        })
    }
}

/// A view paired with a `vlen × n` exchange matrix whose host staging buffer
/// carries the view's elements across ranks.
#[derive(Debug, Deref)]
pub struct MpiView<D> {
    #[deref]
    view: View<D>,
    xchgmat: MpiMatrix<D>,
}

impl<D> Clone for MpiView<D> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            xchgmat: self.xchgmat.clone(),
        }
    }
}

impl<D: Device> MpiView<D> {
    pub(crate) fn new(view: View<D>, xchgmat: MpiMatrix<D>) -> Self {
        Self { view, xchgmat }
    }

    #[inline]
    pub fn view(&self) -> &View<D> {
        &self.view
    }

    #[inline]
    pub fn xchgmat(&self) -> &MpiMatrix<D> {
        &self.xchgmat
    }

    /// Launch arguments for packing into the exchange matrix.
    #[inline]
    pub fn xchg_args(&self) -> Result<GatherArgs, MatrixError> {
        self.view.gather_args(self.xchgmat.matrix())
    }
}
