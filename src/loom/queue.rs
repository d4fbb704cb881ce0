use std::{borrow::Cow, collections::VecDeque};

use derive_more::{Deref, Display};
use thiserror::Error;

use super::{
    comm::{CommError, Communicator},
    device::{Device, DeviceError, Stream},
    ops::{Kernel, KernelKind, RuntimeArg},
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("queue {0} has been poisoned by an earlier failure")]
    Poisoned(QueueId),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct QueueId(uid::Id<QueueId>);

impl QueueId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Why a queue blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum WaitReason {
    /// The next item is of a different kind than the last one issued.
    SequencePoint,
    /// The queue ran out of items.
    Quiesce,
}

/// What a queue did, reported to its observer in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Issue {
        queue: QueueId,
        kind: KernelKind,
        name: Cow<'static, str>,
    },
    Wait {
        queue: QueueId,
        kind: KernelKind,
        reason: WaitReason,
    },
}

/// A FIFO of kernels with synchronization inserted where the kind of work changes.
///
/// Consecutive items of one kind are issued back-to-back and left to the ordering of
/// the underlying stream or requests. Before an item whose kind differs from the last
/// issued one, the queue blocks until the earlier work completes: compute work by
/// synchronizing both streams, communication by waiting on every outstanding request.
///
/// Any failure poisons the queue; it then refuses further items and runs.
pub struct Queue<D: Device, C: Communicator> {
    id: QueueId,
    items: VecDeque<(Kernel<D, C>, Vec<RuntimeArg>)>,
    last: Option<KernelKind>,
    comp: D::Stream,
    copy: D::Stream,
    comm: C,
    reqs: Vec<C::Request>,
    poisoned: bool,
    observer: Option<flume::Sender<QueueEvent>>,
}

impl<D: Device, C: Communicator> std::fmt::Debug for Queue<D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("items", &self.items)
            .field("last", &self.last)
            .field("reqs", &self.reqs.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<D: Device, C: Communicator> Queue<D, C> {
    pub fn new(device: &D, comm: C) -> Result<Self, QueueError> {
        let comp = device.create_stream()?;
        let copy = device.create_stream()?;
        Ok(Self {
            id: QueueId::new(),
            items: VecDeque::new(),
            last: None,
            comp,
            copy,
            comm,
            reqs: vec![],
            poisoned: false,
            observer: None,
        })
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Kind of the last issued item not yet waited for.
    #[inline]
    pub fn last(&self) -> Option<KernelKind> {
        self.last
    }

    #[inline]
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Reports every issue and wait to `sender`.
    pub fn observe(&mut self, sender: flume::Sender<QueueEvent>) {
        self.observer = Some(sender);
    }

    fn check(&self) -> Result<(), QueueError> {
        match self.poisoned {
            true => Err(QueueError::Poisoned(self.id)),
            false => Ok(()),
        }
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(observer) = &self.observer {
            _ = observer.send(event);
        }
    }

    /// Appends items without running anything.
    pub fn enqueue(
        &mut self,
        items: impl IntoIterator<Item = (Kernel<D, C>, Vec<RuntimeArg>)>,
    ) -> Result<(), QueueError> {
        self.check()?;
        self.items.extend(items);
        Ok(())
    }

    #[inline]
    pub fn push(&mut self, kernel: Kernel<D, C>, args: Vec<RuntimeArg>) -> Result<(), QueueError> {
        self.enqueue([(kernel, args)])
    }

    fn poison<T, E>(&mut self, result: Result<T, E>) -> Result<T, QueueError>
    where
        QueueError: From<E>,
    {
        if result.is_err() {
            log::error!("queue {} poisoned", self.id);
            self.poisoned = true;
        }
        result.map_err(QueueError::from)
    }

    /// Blocks until the work of the last issued kind completes.
    fn wait(&mut self, reason: WaitReason) -> Result<(), QueueError> {
        let Some(kind) = self.last.take() else {
            return Ok(());
        };
        log::trace!("queue {} waits on {kind} ({reason})", self.id);
        self.emit(QueueEvent::Wait {
            queue: self.id,
            kind,
            reason,
        });
        match kind {
            KernelKind::Compute => {
                let result = self.comp.synchronize().and_then(|_| self.copy.synchronize());
                self.poison(result)
            }
            KernelKind::Mpi => {
                let reqs = std::mem::take(&mut self.reqs);
                let result = self.comm.wait_all(reqs);
                self.poison(result)
            }
        }
    }

    fn execute(&mut self, kernel: Kernel<D, C>, args: Vec<RuntimeArg>) -> Result<(), QueueError> {
        let kind = kernel.kind();
        let name = kernel.name();
        log::trace!("queue {} issues {kind} {name}", self.id);
        self.emit(QueueEvent::Issue {
            queue: self.id,
            kind,
            name,
        });

        self.last = Some(kind);
        match kernel {
            Kernel::Compute(kernel) => {
                let result = kernel.run(&self.comp, &self.copy, &args);
                self.poison(result)
            }
            Kernel::Mpi(kernel) => {
                let result = kernel.run(&mut self.reqs, &args);
                self.poison(result)
            }
        }
    }

    #[inline]
    fn is_sequence_point(&self, kind: KernelKind) -> bool {
        self.last.is_some_and(|last| last != kind)
    }

    /// Runs the front item, waiting first if it starts a new kind.
    /// Returns `false` if there was nothing to run.
    fn step(&mut self) -> Result<bool, QueueError> {
        let Some((kernel, args)) = self.items.pop_front() else {
            return Ok(false);
        };
        if self.is_sequence_point(kernel.kind()) {
            self.wait(WaitReason::SequencePoint)?;
        }
        self.execute(kernel, args)?;
        Ok(true)
    }

    /// Runs front items for as long as none of them needs a wait.
    fn drain(&mut self) -> Result<(), QueueError> {
        while let Some((kernel, _)) = self.items.front() {
            if self.is_sequence_point(kernel.kind()) {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Runs every pending item and waits until all issued work has completed.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(queue = %self.id)))]
    pub fn run(&mut self) -> Result<(), QueueError> {
        self.check()?;
        while self.step()? {}
        self.wait(WaitReason::Quiesce)
    }

    /// Runs the pending items, then `items`.
    pub fn run_with(
        &mut self,
        items: impl IntoIterator<Item = (Kernel<D, C>, Vec<RuntimeArg>)>,
    ) -> Result<(), QueueError> {
        self.run()?;
        self.enqueue(items)?;
        self.run()
    }

    /// Runs several queues side by side.
    ///
    /// Every queue first issues as much as it can without blocking. The queues then take
    /// turns running one possibly blocking item followed by what can again be issued
    /// without blocking, until all are empty. Finally each queue is waited out.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(queues = queues.len())))]
    pub fn run_all(queues: &mut [Self]) -> Result<(), QueueError> {
        for queue in queues.iter_mut() {
            queue.check()?;
            queue.drain()?;
        }
        while queues.iter().any(|queue| !queue.is_empty()) {
            for queue in queues.iter_mut().filter(|queue| !queue.is_empty()) {
                queue.step()?;
                queue.drain()?;
            }
        }
        for queue in queues.iter_mut() {
            queue.wait(WaitReason::Quiesce)?;
        }
        Ok(())
    }
}

impl<D: Device, C: Communicator> Drop for Queue<D, C> {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Err(err) = self.wait(WaitReason::Quiesce) {
            log::error!("failed to wait out queue {}: {err}", self.id);
        }
    }
}
