use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use rustc_hash::FxHashMap as HashMap;

use super::{CommError, Communicator};
use crate::loom::device::Staging;

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: u32,
    data: Box<[u8]>,
}

#[derive(Debug)]
struct Inbox {
    receiver: flume::Receiver<Envelope>,
    /// Messages that arrived before a matching receive was waited on.
    unmatched: Mutex<HashMap<(usize, u32), VecDeque<Box<[u8]>>>>,
}

impl Inbox {
    /// Blocks until a message from `source` with `tag` is available.
    fn take(&self, source: usize, tag: u32) -> Result<Box<[u8]>, CommError> {
        let mut unmatched = self.unmatched.lock().expect("failed to lock");
        if let Some(data) = unmatched.get_mut(&(source, tag)).and_then(VecDeque::pop_front) {
            return Ok(data);
        }
        loop {
            let envelope = self
                .receiver
                .recv()
                .map_err(|_| CommError::Disconnected(source))?;
            if (envelope.source, envelope.tag) == (source, tag) {
                return Ok(envelope.data);
            }
            unmatched
                .entry((envelope.source, envelope.tag))
                .or_default()
                .push_back(envelope.data);
        }
    }
}

/// An outstanding operation of a [`LocalComm`].
#[derive(Debug)]
pub enum LocalRequest {
    /// Sends complete eagerly.
    Send,
    Recv {
        buf: Staging,
        source: usize,
        tag: u32,
    },
}

/// A communicator connecting ranks within one process through channels.
#[derive(Debug, Clone)]
pub struct LocalComm {
    rank: usize,
    senders: Arc<[flume::Sender<Envelope>]>,
    inbox: Arc<Inbox>,
}

impl LocalComm {
    /// Creates `size` connected ranks.
    pub fn world(size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| flume::unbounded()).unzip();
        let senders: Arc<[_]> = senders.into();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                let inbox = Arc::new(Inbox {
                    receiver,
                    unmatched: Default::default(),
                });
                let senders = senders.clone();
                Self {
                    rank,
                    senders,
                    inbox,
                }
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        match rank < self.senders.len() {
            true => Ok(()),
            false => Err(CommError::InvalidRank(rank, self.senders.len())),
        }
    }
}

impl Communicator for LocalComm {
    type Request = LocalRequest;

    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.senders.len()
    }

    fn isend(&self, buf: &Staging, dest: usize, tag: u32) -> Result<Self::Request, CommError> {
        self.check_rank(dest)?;
        let envelope = Envelope {
            source: self.rank,
            tag,
            data: buf.read().clone(),
        };
        self.senders[dest]
            .send(envelope)
            .map_err(|_| CommError::Disconnected(dest))?;
        log::trace!("rank {} isend to {dest} tag {tag}", self.rank);
        Ok(LocalRequest::Send)
    }

    fn irecv(&self, buf: &Staging, source: usize, tag: u32) -> Result<Self::Request, CommError> {
        self.check_rank(source)?;
        let buf = buf.clone();
        log::trace!("rank {} irecv from {source} tag {tag}", self.rank);
        Ok(LocalRequest::Recv { buf, source, tag })
    }

    fn wait_all(&self, reqs: Vec<Self::Request>) -> Result<(), CommError> {
        for req in reqs {
            let LocalRequest::Recv { buf, source, tag } = req else {
                continue;
            };
            let data = self.inbox.take(source, tag)?;
            let mut buf = buf.write();
            if data.len() != buf.len() {
                return Err(CommError::Truncated {
                    peer: source,
                    tag,
                    len: data.len(),
                    expected: buf.len(),
                });
            }
            buf.copy_from_slice(&data);
        }
        Ok(())
    }
}
