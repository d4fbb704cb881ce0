use std::sync::Arc;

use crate::loom::{
    comm::{CommError, Communicator},
    device::{Device, DeviceError, DevicePtr, GatherArgs, Staging},
    matrix::{MatrixError, MpiMatrix},
    ops::{ComputeKernel, Kernel, MpiKernel, RuntimeArg},
    view::MpiView,
};

/// Geometry of an exchange matrix copy between device and its staging buffer.
#[derive(Debug, Clone, Copy)]
struct Transfer {
    data: DevicePtr,
    pitch: usize,
    width: usize,
    height: usize,
}

impl Transfer {
    fn new<D: Device>(matrix: &MpiMatrix<D>) -> Result<Self, MatrixError> {
        Ok(Self {
            data: matrix.data()?,
            pitch: matrix.pitch(),
            width: matrix.layout().row_size(),
            height: matrix.nrow(),
        })
    }
}

/// Gathers the elements of a view into its exchange matrix, then copies that
/// to the host staging buffer. Both steps go onto the compute stream.
#[derive(Debug)]
pub struct PackKernel<D> {
    device: Arc<D>,
    args: GatherArgs,
    transfer: Transfer,
    staging: Staging,
}

impl<D: Device> PackKernel<D> {
    /// The view and its exchange matrix must be placed.
    pub fn new(view: &MpiView<D>) -> Result<Self, MatrixError> {
        let xchgmat = view.xchgmat();
        Ok(Self {
            device: xchgmat.device().clone(),
            args: view.xchg_args()?,
            transfer: Transfer::new(xchgmat)?,
            staging: xchgmat.staging().clone(),
        })
    }
}

impl<D: Device> ComputeKernel<D> for PackKernel<D> {
    fn run(&self, comp: &D::Stream, _copy: &D::Stream, _args: &[RuntimeArg]) -> Result<(), DeviceError> {
        let Transfer {
            data,
            pitch,
            width,
            height,
        } = self.transfer;
        self.device.gather(comp, self.args)?;
        self.device
            .memcpy2d_dtoh_async(comp, &self.staging, width, data, pitch, width, height)
    }
}

/// Copies the host staging buffer into the exchange matrix, then scatters it
/// back through the view. Both steps go onto the compute stream.
#[derive(Debug)]
pub struct UnpackKernel<D> {
    device: Arc<D>,
    args: GatherArgs,
    transfer: Transfer,
    staging: Staging,
}

impl<D: Device> UnpackKernel<D> {
    pub fn new(view: &MpiView<D>) -> Result<Self, MatrixError> {
        let xchgmat = view.xchgmat();
        Ok(Self {
            device: xchgmat.device().clone(),
            args: view.xchg_args()?,
            transfer: Transfer::new(xchgmat)?,
            staging: xchgmat.staging().clone(),
        })
    }
}

impl<D: Device> ComputeKernel<D> for UnpackKernel<D> {
    fn run(&self, comp: &D::Stream, _copy: &D::Stream, _args: &[RuntimeArg]) -> Result<(), DeviceError> {
        let Transfer {
            data,
            pitch,
            width,
            height,
        } = self.transfer;
        self.device
            .memcpy2d_htod_async(comp, data, pitch, &self.staging, width, width, height)?;
        self.device.scatter(comp, self.args)
    }
}

/// Sends the staging buffer of an exchange matrix to a peer.
#[derive(Debug)]
pub struct SendKernel<C> {
    comm: C,
    staging: Staging,
    dest: usize,
    tag: u32,
}

impl<C: Communicator> SendKernel<C> {
    pub fn new<D: Device>(comm: C, matrix: &MpiMatrix<D>, dest: usize, tag: u32) -> Self {
        let staging = matrix.staging().clone();
        Self {
            comm,
            staging,
            dest,
            tag,
        }
    }
}

impl<C: Communicator> MpiKernel<C> for SendKernel<C> {
    fn run(&self, reqs: &mut Vec<C::Request>, _args: &[RuntimeArg]) -> Result<(), CommError> {
        reqs.push(self.comm.isend(&self.staging, self.dest, self.tag)?);
        Ok(())
    }
}

/// Receives into the staging buffer of an exchange matrix from a peer.
#[derive(Debug)]
pub struct RecvKernel<C> {
    comm: C,
    staging: Staging,
    source: usize,
    tag: u32,
}

impl<C: Communicator> RecvKernel<C> {
    pub fn new<D: Device>(comm: C, matrix: &MpiMatrix<D>, source: usize, tag: u32) -> Self {
        let staging = matrix.staging().clone();
        Self {
            comm,
            staging,
            source,
            tag,
        }
    }
}

impl<C: Communicator> MpiKernel<C> for RecvKernel<C> {
    fn run(&self, reqs: &mut Vec<C::Request>, _args: &[RuntimeArg]) -> Result<(), CommError> {
        reqs.push(self.comm.irecv(&self.staging, self.source, self.tag)?);
        Ok(())
    }
}

/// Builds the four kernels of a halo exchange over one view.
#[derive(Debug)]
pub struct Exchange<D, C> {
    pub view: MpiView<D>,
    pub comm: C,
    pub peer: usize,
    pub tag: u32,
}

impl<D: Device, C: Communicator + Clone + 'static> Exchange<D, C> {
    pub fn new(view: MpiView<D>, comm: C, peer: usize, tag: u32) -> Self {
        Self {
            view,
            comm,
            peer,
            tag,
        }
    }

    pub fn pack(&self) -> Result<Kernel<D, C>, MatrixError> {
        Ok(Kernel::compute(PackKernel::new(&self.view)?))
    }

    pub fn unpack(&self) -> Result<Kernel<D, C>, MatrixError> {
        Ok(Kernel::compute(UnpackKernel::new(&self.view)?))
    }

    pub fn send(&self) -> Kernel<D, C> {
        let comm = self.comm.clone();
        Kernel::mpi(SendKernel::new(comm, self.view.xchgmat(), self.peer, self.tag))
    }

    pub fn recv(&self) -> Kernel<D, C> {
        let comm = self.comm.clone();
        Kernel::mpi(RecvKernel::new(comm, self.view.xchgmat(), self.peer, self.tag))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Exchange, PackKernel, SendKernel, UnpackKernel};
    use crate::loom::{
        backend::BackendBuilder,
        comm::{Communicator, LocalComm},
        device::{Cpu, CpuBuilder},
        matrix::{HostArray, Tags},
        ops::Kernel,
        queue::Queue,
    };

    #[test]
    fn test_pack_unpack() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(32).build();
        let backend = BackendBuilder::new(cpu).build();
        let value = HostArray::from_vec([4, 6], (0..24).map(|x| x as f32).collect_vec())?;
        let m = backend.matrix(&[4, 6], Some(value), Some("soln".into()), Tags::from([Tags::ALIGN]))?;
        backend.commit()?;
        assert_eq!(m.leaddim(), 8);

        // two entries of two adjacent components each
        let view = backend.mpi_view(&[&m, &m], &[[0, 4], [2, 0]], Some(&[1, 1][..]), 2, Tags::new())?;
        backend.commit()?;

        let comm = LocalComm::world(1).remove(0);
        let mut queue = backend.queue(comm)?;
        queue.push(Kernel::compute(PackKernel::new(&view)?), vec![])?;
        queue.run()?;
        // row k holds component k of every entry
        assert_eq!(view.xchgmat().staging().to_vec::<f32>(), vec![4.0, 12.0, 5.0, 13.0]);
        assert_eq!(view.xchgmat().get::<f32>()?.data(), &[4.0, 12.0, 5.0, 13.0]);

        view.xchgmat()
            .staging()
            .write()
            .copy_from_slice(bytemuck::cast_slice(&[-1.0f32, -2.0, -3.0, -4.0]));
        queue.push(Kernel::compute(UnpackKernel::new(&view)?), vec![])?;
        queue.run()?;

        let output = m.get::<f32>()?;
        assert_eq!(&output.data()[3..6], &[3.0, -1.0, -3.0]);
        assert_eq!(&output.data()[11..14], &[11.0, -2.0, -4.0]);
        Ok(())
    }

    #[test]
    fn test_kernels_need_placement() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let backend = BackendBuilder::new(cpu).build();
        let m = backend.matrix::<f64>(&[2, 2], None, None, Tags::new())?;
        backend.commit()?;
        let view = backend.mpi_view(&[&m], &[[1, 1]], None, 1, Tags::new())?;
        assert!(PackKernel::new(&view).is_err());
        assert!(UnpackKernel::new(&view).is_err());

        // transfers only capture the staging buffer
        let comm = LocalComm::world(1).remove(0);
        let _: Kernel<Cpu, LocalComm> = Kernel::mpi(SendKernel::new(comm, view.xchgmat(), 0, 0));
        Ok(())
    }

    /// Each rank owns a row of five cells and swaps one boundary cell with its neighbour.
    #[test]
    fn test_halo_exchange() -> Result<(), Box<dyn Error>> {
        type RankError = Box<dyn Error + Send + Sync>;

        fn rank_main(comm: LocalComm) -> Result<Vec<f64>, RankError> {
            let rank = comm.rank();
            let peer = 1 - rank;

            let cpu = CpuBuilder::new().build();
            let backend = BackendBuilder::new(cpu).build();
            let data = (0..5).map(|x| (10 * rank + x) as f64).collect_vec();
            let value = HostArray::from_vec([1, 5], data)?;
            let m = backend.matrix(&[1, 5], Some(value), Some("soln".into()), Tags::new())?;
            backend.commit()?;

            // rank 0 sends its cell 3 and fills cell 0; rank 1 sends cell 1 and fills cell 4
            let (send, recv) = match rank {
                0 => ([0, 3], [0, 0]),
                _ => ([0, 1], [0, 4]),
            };
            let outgoing = backend.mpi_view(&[&m], &[send], None, 1, Tags::new())?;
            let incoming = backend.mpi_view(&[&m], &[recv], None, 1, Tags::new())?;
            backend.commit()?;

            let outgoing = Exchange::new(outgoing, comm.clone(), peer, 7);
            let incoming = Exchange::new(incoming, comm.clone(), peer, 7);

            let mut queues = vec![backend.queue(comm.clone())?, backend.queue(comm)?];
            queues[0].enqueue([(outgoing.pack()?, vec![]), (outgoing.send(), vec![])])?;
            queues[1].enqueue([(incoming.recv(), vec![]), (incoming.unpack()?, vec![])])?;
            Queue::run_all(&mut queues)?;

            Ok(m.get::<f64>()?.into_data().into_vec())
        }

        let world = LocalComm::world(2);
        let handles = world
            .into_iter()
            .map(|comm| std::thread::spawn(move || rank_main(comm)))
            .collect_vec();
        let mut outputs = vec![];
        for handle in handles {
            let output = handle.join().map_err(|_| "rank panicked")?;
            outputs.push(output.map_err(|err| -> Box<dyn Error> { err })?);
        }
        assert_eq!(outputs[0], vec![11.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(outputs[1], vec![10.0, 11.0, 12.0, 13.0, 3.0]);
        Ok(())
    }
}
