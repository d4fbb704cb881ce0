use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
    thread::JoinHandle,
};

use super::{Device, DeviceError, DeviceId, DevicePtr, GatherArgs, Staging, Stream};

/// Base of the emulated address space. Keeps null out of reach.
const BASE_ADDRESS: u64 = 0x1000_0000;

#[derive(Debug, Default)]
struct Memory {
    /// Next free address.
    next: u64,
    /// Bytes currently allocated.
    used: usize,
    /// Live allocations keyed by their base address.
    allocs: BTreeMap<u64, Box<[u8]>>,
}

impl Memory {
    /// Finds the allocation containing `[ptr, ptr + size)`.
    fn locate(&self, ptr: DevicePtr, size: usize) -> Result<(u64, usize), DeviceError> {
        let raw = ptr.into_raw();
        let (&base, data) = self
            .allocs
            .range(..=raw)
            .next_back()
            .ok_or(DeviceError::InvalidAddress(ptr))?;
        let start = (raw - base) as usize;
        match start.checked_add(size) {
            Some(end) if end <= data.len() => Ok((base, start)),
            _ if start >= data.len() => Err(DeviceError::InvalidAddress(ptr)),
            _ => Err(DeviceError::OutOfBounds { ptr, size }),
        }
    }

    fn slice(&self, ptr: DevicePtr, size: usize) -> Result<&[u8], DeviceError> {
        let (base, start) = self.locate(ptr, size)?;
        Ok(&self.allocs[&base][start..start + size])
    }

    fn slice_mut(&mut self, ptr: DevicePtr, size: usize) -> Result<&mut [u8], DeviceError> {
        let (base, start) = self.locate(ptr, size)?;
        let data = self
            .allocs
            .get_mut(&base)
            .ok_or(DeviceError::InvalidAddress(ptr))?;
        Ok(&mut data[start..start + size])
    }

    fn read_i32(&self, ptr: DevicePtr, count: usize) -> Result<Vec<i32>, DeviceError> {
        let bytes = self.slice(ptr, count * size_of::<i32>())?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_in(
        &mut self,
        dst: DevicePtr,
        dpitch: usize,
        src: &[u8],
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        check_host(src.len(), spitch, width, height)?;
        for row in 0..height {
            let src = &src[row * spitch..row * spitch + width];
            self.slice_mut(dst.offset(row * dpitch), width)?
                .copy_from_slice(src);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_out(
        &self,
        dst: &mut [u8],
        dpitch: usize,
        src: DevicePtr,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        check_host(dst.len(), dpitch, width, height)?;
        for row in 0..height {
            let src = self.slice(src.offset(row * spitch), width)?;
            dst[row * dpitch..row * dpitch + width].copy_from_slice(src);
        }
        Ok(())
    }

    /// Byte offsets past `args.base` of every element of one view entry row `k`.
    fn element_offsets(&self, args: &GatherArgs) -> Result<Vec<Vec<usize>>, DeviceError> {
        let size = args.dtype.size();
        let mapping = self.read_i32(args.mapping, args.n)?;
        let strides = self.read_i32(args.strides, args.n)?;
        let offsets = (0..args.vlen)
            .map(|k| {
                mapping
                    .iter()
                    .zip(strides.iter())
                    .map(|(&offset, &stride)| (offset as usize + k * stride as usize) * size)
                    .collect()
            })
            .collect();
        Ok(offsets)
    }

    fn gather(&mut self, args: GatherArgs) -> Result<(), DeviceError> {
        let size = args.dtype.size();
        let offsets = self.element_offsets(&args)?;
        for (k, offsets) in offsets.iter().enumerate() {
            #[cfg(not(feature = "rayon"))]
            let row: Vec<u8> = {
                let row: Result<Vec<_>, _> = offsets
                    .iter()
                    .map(|&offset| self.slice(args.base.offset(offset), size))
                    .collect();
                row?.concat()
            };
            #[cfg(feature = "rayon")]
            let row: Vec<u8> = {
                use rayon::prelude::*;
                let row: Result<Vec<_>, _> = offsets
                    .par_iter()
                    .map(|&offset| self.slice(args.base.offset(offset), size))
                    .collect();
                row?.concat()
            };
            let dst = args.packed.offset(k * args.packed_ld * size);
            self.slice_mut(dst, row.len())?.copy_from_slice(&row);
        }
        Ok(())
    }

    fn scatter(&mut self, args: GatherArgs) -> Result<(), DeviceError> {
        let size = args.dtype.size();
        let offsets = self.element_offsets(&args)?;
        for (k, offsets) in offsets.iter().enumerate() {
            let src = args.packed.offset(k * args.packed_ld * size);
            let row = self.slice(src, args.n * size)?.to_vec();
            for (&offset, value) in offsets.iter().zip(row.chunks_exact(size)) {
                self.slice_mut(args.base.offset(offset), size)?
                    .copy_from_slice(value);
            }
        }
        Ok(())
    }
}

fn check_host(len: usize, pitch: usize, width: usize, height: usize) -> Result<(), DeviceError> {
    let required = match height {
        0 => 0,
        _ => (height - 1) * pitch + width,
    };
    match len >= required {
        true => Ok(()),
        false => Err(DeviceError::HostBounds { len, required }),
    }
}

#[derive(Debug)]
struct CpuInner {
    id: uid::Id<DeviceId>,
    alignb: usize,
    capacity: Option<usize>,
    memory: RwLock<Memory>,
}

/// A host-emulated accelerator.
///
/// Device memory lives in host allocations addressed through [`DevicePtr`]s, and each
/// [`HostStream`] is a worker thread that executes its work in issue order.
#[derive(Debug, Clone)]
pub struct Cpu(Arc<CpuInner>);

impl Cpu {
    #[inline]
    pub fn id(&self) -> uid::Id<DeviceId> {
        self.0.id
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn used(&self) -> usize {
        self.0.memory.read().expect("failed to lock").used
    }

    /// Number of live allocations.
    #[inline]
    pub fn num_allocs(&self) -> usize {
        self.0.memory.read().expect("failed to lock").allocs.len()
    }

    fn launch(
        &self,
        stream: &HostStream,
        f: impl FnOnce(&mut Memory) -> Result<(), DeviceError> + Send + 'static,
    ) -> Result<(), DeviceError> {
        let inner = self.0.clone();
        stream.launch(move || f(&mut inner.memory.write().expect("failed to lock")))
    }
}

impl Device for Cpu {
    type Stream = HostStream;

    #[inline]
    fn alignb(&self) -> usize {
        self.0.alignb
    }

    fn malloc(&self, size: usize) -> Result<DevicePtr, DeviceError> {
        let mut memory = self.0.memory.write().expect("failed to lock");
        if let Some(capacity) = self.0.capacity {
            let available = capacity.saturating_sub(memory.used);
            if size > available {
                return Err(DeviceError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }

        let alignb = self.0.alignb.max(1) as u64;
        let base = memory.next;
        // keep a gap so that one-past-the-end never aliases the next allocation
        memory.next = (base + size as u64 + alignb).div_ceil(alignb) * alignb;
        memory.used += size;
        memory.allocs.insert(base, vec![0; size].into_boxed_slice());

        log::trace!("malloc {size} bytes at {:#x}", base);
        Ok(DevicePtr::from_raw(base))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut memory = self.0.memory.write().expect("failed to lock");
        let data = memory
            .allocs
            .remove(&ptr.into_raw())
            .ok_or(DeviceError::InvalidAddress(ptr))?;
        memory.used -= data.len();
        log::trace!("free {} bytes at {ptr}", data.len());
        Ok(())
    }

    fn create_stream(&self) -> Result<Self::Stream, DeviceError> {
        HostStream::new()
    }

    fn memcpy2d_htod(
        &self,
        dst: DevicePtr,
        dpitch: usize,
        src: &[u8],
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let mut memory = self.0.memory.write().expect("failed to lock");
        memory.copy_in(dst, dpitch, src, spitch, width, height)
    }

    fn memcpy2d_dtoh(
        &self,
        dst: &mut [u8],
        dpitch: usize,
        src: DevicePtr,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let memory = self.0.memory.read().expect("failed to lock");
        memory.copy_out(dst, dpitch, src, spitch, width, height)
    }

    fn memcpy2d_htod_async(
        &self,
        stream: &Self::Stream,
        dst: DevicePtr,
        dpitch: usize,
        src: &Staging,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let src = src.clone();
        self.launch(stream, move |memory| {
            memory.copy_in(dst, dpitch, &src.read(), spitch, width, height)
        })
    }

    fn memcpy2d_dtoh_async(
        &self,
        stream: &Self::Stream,
        dst: &Staging,
        dpitch: usize,
        src: DevicePtr,
        spitch: usize,
        width: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let dst = dst.clone();
        self.launch(stream, move |memory| {
            memory.copy_out(&mut dst.write(), dpitch, src, spitch, width, height)
        })
    }

    fn gather(&self, stream: &Self::Stream, args: GatherArgs) -> Result<(), DeviceError> {
        self.launch(stream, move |memory| memory.gather(args))
    }

    fn scatter(&self, stream: &Self::Stream, args: GatherArgs) -> Result<(), DeviceError> {
        self.launch(stream, move |memory| memory.scatter(args))
    }
}

#[derive(Debug, Clone)]
pub struct CpuBuilder {
    pub alignb: usize,
    pub capacity: Option<usize>,
}

impl Default for CpuBuilder {
    fn default() -> Self {
        Self {
            alignb: 32,
            capacity: None,
        }
    }
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Cpu {
        let Self { alignb, capacity } = self;
        let memory = RwLock::new(Memory {
            next: BASE_ADDRESS,
            ..Default::default()
        });
        let id = uid::Id::new();
        Cpu(Arc::new(CpuInner {
            id,
            alignb,
            capacity,
            memory,
        }))
    }

    /// Byte alignment of allocations and padded rows.
    pub fn alignb(mut self, alignb: usize) -> Self {
        self.alignb = alignb;
        self
    }

    /// Limits the total number of bytes that may be allocated at once.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

type Job = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

enum StreamEvent {
    Launch(Job),
    Fence(flume::Sender<Option<DeviceError>>),
}

/// An in-order stream of work executed by a dedicated worker thread.
#[derive(Debug)]
pub struct HostStream {
    sender: Option<flume::Sender<StreamEvent>>,
    handle: Option<JoinHandle<()>>,
    /// Number of jobs issued since the stream was created.
    issued: Arc<Mutex<usize>>,
}

impl HostStream {
    pub fn new() -> Result<Self, DeviceError> {
        let (sender, receiver) = flume::unbounded();
        let handle = std::thread::Builder::new()
            .name("weft-stream".into())
            .spawn(move || serve(receiver))?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            issued: Default::default(),
        })
    }

    /// Issues `f` to run after all previously issued work.
    pub fn launch(
        &self,
        f: impl FnOnce() -> Result<(), DeviceError> + Send + 'static,
    ) -> Result<(), DeviceError> {
        let sender = self.sender.as_ref().ok_or(DeviceError::StreamClosed)?;
        sender
            .send(StreamEvent::Launch(Box::new(f)))
            .map_err(|_| DeviceError::StreamClosed)?;
        *self.issued.lock().expect("failed to lock") += 1;
        Ok(())
    }

    /// Number of jobs issued to this stream so far.
    #[inline]
    pub fn issued(&self) -> usize {
        *self.issued.lock().expect("failed to lock")
    }
}

impl Stream for HostStream {
    fn synchronize(&self) -> Result<(), DeviceError> {
        let sender = self.sender.as_ref().ok_or(DeviceError::StreamClosed)?;
        let (fence, receiver) = flume::bounded(1);
        sender
            .send(StreamEvent::Fence(fence))
            .map_err(|_| DeviceError::StreamClosed)?;
        match receiver.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(DeviceError::StreamClosed),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // closing the channel lets the worker drain and exit
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("stream worker panicked");
            }
        }
    }
}

fn serve(receiver: flume::Receiver<StreamEvent>) {
    let mut error = None;
    while let Ok(event) = receiver.recv() {
        match event {
            StreamEvent::Launch(job) => {
                if let Err(err) = job() {
                    log::error!("stream job failed: {err}");
                    error.get_or_insert(err);
                }
            }
            StreamEvent::Fence(sender) => _ = sender.send(error.take()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{Arc, Mutex},
    };

    use super::{CpuBuilder, HostStream};
    use crate::loom::{
        device::{Device, DeviceError, DevicePtr, Staging, Stream},
        num::DataType,
    };

    #[test]
    fn test_malloc_alignment() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().alignb(64).build();
        let a = cpu.malloc(100)?;
        let b = cpu.malloc(8)?;
        assert_eq!(a.into_raw() % 64, 0);
        assert_eq!(b.into_raw() % 64, 0);
        assert!(b.offset_from(a).ok_or("order")? >= 100);
        assert_eq!(cpu.used(), 108);

        cpu.free(a)?;
        assert_eq!(cpu.used(), 8);
        assert!(matches!(cpu.free(a), Err(DeviceError::InvalidAddress(_))));
        Ok(())
    }

    #[test]
    fn test_out_of_memory() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().capacity(128).build();
        let _ = cpu.malloc(100)?;
        let err = cpu.malloc(64).err().ok_or("allocation must fail")?;
        assert!(matches!(
            err,
            DeviceError::OutOfMemory {
                requested: 64,
                available: 28
            }
        ));
        Ok(())
    }

    #[test]
    fn test_memcpy2d_pitch() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let ptr = cpu.malloc(4 * 8)?;

        // 4 rows of 3 bytes with a device pitch of 8
        let src: Vec<u8> = (1..=12).collect();
        cpu.memcpy2d_htod(ptr, 8, &src, 3, 3, 4)?;

        let mut raw = vec![0u8; 32];
        cpu.memcpy2d_dtoh(&mut raw, 8, ptr, 8, 8, 4)?;
        assert_eq!(&raw[0..3], &[1, 2, 3]);
        assert_eq!(&raw[3..8], &[0; 5]);
        assert_eq!(&raw[8..11], &[4, 5, 6]);

        let mut dst = vec![0u8; 12];
        cpu.memcpy2d_dtoh(&mut dst, 3, ptr, 8, 3, 4)?;
        assert_eq!(dst, src);

        let err = cpu.memcpy2d_htod(ptr, 8, &src[..10], 3, 3, 4);
        assert!(matches!(err, Err(DeviceError::HostBounds { .. })));
        let err = cpu.memcpy2d_htod(ptr, 10, &src, 3, 3, 4);
        assert!(matches!(err, Err(DeviceError::OutOfBounds { .. })));
        let err = cpu.memcpy2d_htod(DevicePtr::from_raw(8), 16, &src, 3, 3, 4);
        assert!(matches!(err, Err(DeviceError::InvalidAddress(_))));
        Ok(())
    }

    #[test]
    fn test_stream_order() -> Result<(), Box<dyn Error>> {
        let stream = HostStream::new()?;
        let log = Arc::new(Mutex::new(vec![]));
        for index in 0..16 {
            let log = log.clone();
            stream.launch(move || {
                log.lock().expect("failed to lock").push(index);
                Ok(())
            })?;
        }
        stream.synchronize()?;
        assert_eq!(*log.lock().expect("failed to lock"), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.issued(), 16);
        Ok(())
    }

    #[test]
    fn test_stream_error_at_sync() -> Result<(), Box<dyn Error>> {
        let stream = HostStream::new()?;
        stream.launch(|| Err(DeviceError::StreamClosed))?;
        stream.launch(|| Ok(()))?;
        assert!(stream.synchronize().is_err());
        // the error is reported once
        stream.synchronize()?;
        Ok(())
    }

    #[test]
    fn test_async_staging_copy() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let stream = cpu.create_stream()?;
        let ptr = cpu.malloc(16)?;

        let staging = Staging::new(8);
        staging.write().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        cpu.memcpy2d_htod_async(&stream, ptr, 8, &staging, 4, 4, 2)?;

        let back = Staging::new(16);
        cpu.memcpy2d_dtoh_async(&stream, &back, 8, ptr, 8, 8, 2)?;
        stream.synchronize()?;

        assert_eq!(
            &back.read()[..],
            &[1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn test_gather_scatter() -> Result<(), Box<dyn Error>> {
        use crate::loom::device::GatherArgs;

        let cpu = CpuBuilder::new().build();
        let stream = cpu.create_stream()?;

        let base = cpu.malloc(16 * 4)?;
        let values: Vec<f32> = (0..16).map(|x| x as f32).collect();
        cpu.memcpy2d_htod(base, 64, bytemuck::cast_slice(&values), 64, 64, 1)?;

        let mapping = cpu.malloc(3 * 4)?;
        let strides = cpu.malloc(3 * 4)?;
        let offsets: [i32; 3] = [5, 0, 10];
        let steps: [i32; 3] = [4, 4, 1];
        cpu.memcpy2d_htod(mapping, 12, bytemuck::cast_slice(&offsets), 12, 12, 1)?;
        cpu.memcpy2d_htod(strides, 12, bytemuck::cast_slice(&steps), 12, 12, 1)?;

        let packed = cpu.malloc(2 * 3 * 4)?;
        let args = GatherArgs {
            dtype: DataType::F32,
            n: 3,
            vlen: 2,
            base,
            mapping,
            strides,
            packed,
            packed_ld: 3,
        };
        cpu.gather(&stream, args)?;
        stream.synchronize()?;

        let mut output = vec![0f32; 6];
        cpu.memcpy2d_dtoh(bytemuck::cast_slice_mut(&mut output), 24, packed, 24, 24, 1)?;
        assert_eq!(output, vec![5.0, 0.0, 10.0, 9.0, 4.0, 11.0]);

        let update: Vec<f32> = vec![-1.0, -2.0, -3.0, -4.0, -5.0, -6.0];
        cpu.memcpy2d_htod(packed, 24, bytemuck::cast_slice(&update), 24, 24, 1)?;
        cpu.scatter(&stream, args)?;
        stream.synchronize()?;

        let mut output = vec![0f32; 16];
        cpu.memcpy2d_dtoh(bytemuck::cast_slice_mut(&mut output), 64, base, 64, 64, 1)?;
        assert_eq!(output[5], -1.0);
        assert_eq!(output[0], -2.0);
        assert_eq!(output[10], -3.0);
        assert_eq!(output[9], -4.0);
        assert_eq!(output[4], -5.0);
        assert_eq!(output[11], -6.0);
        assert_eq!(output[1], 1.0);
        Ok(())
    }
}
