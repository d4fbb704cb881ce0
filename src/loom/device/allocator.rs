use std::sync::{Arc, OnceLock};

use derive_more::{Display, From};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{Device, DeviceError, DevicePtr};
use crate::loom::num::DataType;

/// A tag grouping allocations with matching lifetimes into one device allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From)]
pub struct Extent(Arc<str>);

impl From<&str> for Extent {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("extent {0} has already been committed")]
    Committed(Extent),
    #[error("extent {0} is unknown")]
    Unknown(Extent),
}

/// Where a reservation ended up in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    /// Base address of the owning device allocation.
    pub basedata: DevicePtr,
    /// Byte offset of the reservation within the allocation.
    pub byte_offset: usize,
}

impl Placement {
    #[inline]
    pub fn data(&self) -> DevicePtr {
        self.basedata.offset(self.byte_offset)
    }
}

/// A pending request for device storage, placed exactly once by [`Allocator::commit`].
#[derive(Debug, Default, Clone)]
pub struct Reservation(Arc<OnceLock<Placement>>);

impl Reservation {
    #[inline]
    pub fn placement(&self) -> Option<Placement> {
        self.0.get().copied()
    }

    #[inline]
    pub fn is_placed(&self) -> bool {
        self.0.get().is_some()
    }

    fn place(&self, placement: Placement) {
        if self.0.set(placement).is_err() {
            log::error!("reservation placed twice");
        }
    }
}

#[derive(Debug, Clone)]
struct Request {
    size: usize,
    extent: Option<Extent>,
    reservation: Reservation,
}

/// Defers device allocation until all buffers of an extent are known,
/// then packs them into one allocation at aligned offsets.
#[derive(Debug)]
pub struct Allocator<D: Device> {
    device: Arc<D>,
    pending: Vec<Request>,
    /// Committed extents and their allocations.
    extents: HashMap<Extent, DevicePtr>,
    /// Allocations of reservations without an extent.
    anonymous: Vec<DevicePtr>,
}

impl<D: Device> Allocator<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            pending: vec![],
            extents: HashMap::default(),
            anonymous: vec![],
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Rounds `size` up to the device alignment, and to a whole number of the widest
    /// scalar so that every byte offset within an extent is a whole element offset.
    #[inline]
    fn align(&self, size: usize) -> usize {
        let alignb = lcm(self.device.alignb().max(1), DataType::MAX_SIZE);
        size.div_ceil(alignb) * alignb
    }

    /// Number of reservations waiting for [`Allocator::commit`].
    #[inline]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Requests `size` bytes of storage within `extent`. No device memory is touched.
    pub fn reserve(
        &mut self,
        size: usize,
        extent: Option<Extent>,
    ) -> Result<Reservation, AllocError> {
        if let Some(extent) = extent.as_ref().filter(|x| self.extents.contains_key(*x)) {
            return Err(AllocError::Committed(extent.clone()));
        }
        let reservation = Reservation::default();
        self.pending.push(Request {
            size,
            extent,
            reservation: reservation.clone(),
        });
        Ok(reservation)
    }

    /// Allocates every pending reservation: one allocation per extent,
    /// and one allocation per reservation without an extent.
    ///
    /// On failure, the reservations not yet placed stay pending and the device error
    /// is returned unmodified.
    pub fn commit(&mut self) -> Result<Vec<Reservation>, AllocError> {
        let pending = std::mem::take(&mut self.pending);
        let (named, anonymous): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|x| x.extent.is_some());

        let groups = named
            .into_iter()
            .into_group_map_by(|x| x.extent.clone())
            .into_iter()
            .chain(anonymous.into_iter().map(|x| (None, vec![x])))
            .collect_vec();

        let mut placed = vec![];
        let mut groups = groups.into_iter();
        while let Some((extent, requests)) = groups.next() {
            let size: usize = requests.iter().map(|x| self.align(x.size)).sum();
            let basedata = match self.device.malloc(size) {
                Ok(ptr) => ptr,
                Err(err) => {
                    self.pending.extend(requests);
                    self.pending.extend(groups.flat_map(|(_, requests)| requests));
                    return Err(err.into());
                }
            };
            log::debug!(
                "commit extent {} of {} buffers, {size} bytes at {basedata}",
                extent.as_ref().map_or("<anonymous>".into(), |x| x.to_string()),
                requests.len()
            );

            let mut byte_offset = 0;
            for request in requests {
                request.reservation.place(Placement {
                    basedata,
                    byte_offset,
                });
                byte_offset += self.align(request.size);
                placed.push(request.reservation);
            }

            match extent {
                Some(extent) => _ = self.extents.insert(extent, basedata),
                None => self.anonymous.push(basedata),
            }
        }
        Ok(placed)
    }

    /// Frees the allocation backing `extent`. Buffers placed in it must no longer be used.
    pub fn release(&mut self, extent: &Extent) -> Result<(), AllocError> {
        let ptr = self
            .extents
            .remove(extent)
            .ok_or_else(|| AllocError::Unknown(extent.clone()))?;
        self.device.free(ptr)?;
        Ok(())
    }
}

fn lcm(x: usize, y: usize) -> usize {
    let (mut a, mut b) = (x, y);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    x / a * y
}

impl<D: Device> Drop for Allocator<D> {
    fn drop(&mut self) {
        let ptrs = self.extents.drain().map(|(_, ptr)| ptr);
        for ptr in ptrs.chain(self.anonymous.drain(..)).collect_vec() {
            if let Err(err) = self.device.free(ptr) {
                log::error!("failed to free {ptr}: {err}");
            }
        }
    }
}
