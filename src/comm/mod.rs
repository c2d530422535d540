//! Communication abstraction for the message-passing rank model.
//!
//! Wire format conventions (for higher-level protocols):
//! - All integers are LE fixed width (u64 counts/ids, f64 fields).
//! - Payloads are `bytemuck`-cast POD slices; decode with
//!   `pod_collect_to_vec` so alignment never matters.
//! - Messages arrive whole; a receiver always gets exactly the bytes the
//!   sender passed to [`Communicator::isend`].
//!
//! [`NoComm`] is the serial backend. [`RayonComm`] provides in-process
//! multi-rank runs (one rank per thread) for tests, backed by a
//! process-global post office with per-phase inboxes; concurrent worlds
//! must use disjoint tag ranges.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

/// Base tag for global node numbering exchanges.
pub const TAG_GLOBAL_NUMBERING: u16 = 0x10;
/// Base tag for halo coordinate/metric refreshes.
pub const TAG_HALO_FIELDS: u16 = 0x20;
/// Base tag for forwarding collapse directives and unknown entities.
pub const TAG_COARSEN_FORWARD: u16 = 0x30;
/// Base tag for the halo-extension round of coarsening.
pub const TAG_COARSEN_HALO: u16 = 0x40;
/// Base tag for the global colour-class size reduction.
pub const TAG_COARSEN_SIZES: u16 = 0x50;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for serial comms).
    fn barrier(&self) {}
}

/// Exchange one buffer with every rank. `bufs[p]` is sent to rank `p`;
/// the returned vector holds what rank `p` sent here. The self slot is a
/// loopback. Sizes travel on `tag`, payloads on `tag + 1`.
pub fn all_to_all<C: Communicator>(com: &C, tag: u16, mut bufs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let size = com.size();
    let me = com.rank();
    debug_assert_eq!(bufs.len(), size);

    let mut out: Vec<Vec<u8>> = vec![Vec::new(); size];
    if size == 1 {
        out[me] = std::mem::take(&mut bufs[me]);
        return out;
    }

    let mut size_sends = Vec::with_capacity(size);
    let mut size_recvs = Vec::with_capacity(size);
    for p in 0..size {
        if p == me {
            continue;
        }
        let n = (bufs[p].len() as u64).to_le_bytes();
        size_sends.push(com.isend(p, tag, &n));
        size_recvs.push((p, com.irecv(p, tag)));
    }
    let mut incoming = vec![0usize; size];
    for (p, h) in size_recvs {
        let bytes = h.wait().unwrap_or_default();
        let mut n = [0u8; 8];
        n.copy_from_slice(&bytes[..8]);
        incoming[p] = u64::from_le_bytes(n) as usize;
    }
    for h in size_sends {
        h.wait();
    }

    let mut data_sends = Vec::with_capacity(size);
    let mut data_recvs = Vec::with_capacity(size);
    for p in 0..size {
        if p == me {
            continue;
        }
        if !bufs[p].is_empty() {
            data_sends.push(com.isend(p, tag + 1, &bufs[p]));
        }
        if incoming[p] > 0 {
            data_recvs.push((p, com.irecv(p, tag + 1)));
        }
    }
    for (p, h) in data_recvs {
        out[p] = h.wait().unwrap_or_default();
    }
    for h in data_sends {
        h.wait();
    }
    out[me] = std::mem::take(&mut bufs[me]);
    out
}

/// Gather one `usize` from every rank (allgather of counts).
pub fn all_gather_count<C: Communicator>(com: &C, count: usize) -> Vec<usize> {
    let size = com.size();
    if size == 1 {
        return vec![count];
    }
    let bufs: Vec<Vec<u8>> = (0..size)
        .map(|_| (count as u64).to_le_bytes().to_vec())
        .collect();
    let received = all_to_all(com, TAG_GLOBAL_NUMBERING + 2, bufs);
    (0..size)
        .map(|p| {
            if p == com.rank() {
                count
            } else {
                let mut n = [0u8; 8];
                n.copy_from_slice(&received[p][..8]);
                u64::from_le_bytes(n) as usize
            }
        })
        .collect()
}

// --- NoComm: single-rank ----------------------------------------------

/// Serial communicator: rank 0 of 1. Point-to-point operations are never
/// issued because every exchange loop skips the self rank.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoComm;

/// Handle for operations that complete immediately with no data.
pub struct NoWait;

impl Wait for NoWait {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = NoWait;
    type RecvHandle = NoWait;

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) -> NoWait {
        NoWait
    }
    fn irecv(&self, _peer: usize, _tag: u16) -> NoWait {
        NoWait
    }
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / multi-thread ---------------------------

/// In-flight messages for the in-process backend.
///
/// The exchange helpers above drive every conversation phase under its own
/// tag, so the post office files inboxes by `(destination, tag)` — one per
/// rank per phase — with a FIFO lane per sender inside each inbox. A single
/// table lock plus one condvar is enough: exchanges are short-lived and a
/// delivery can only unblock receivers of its own phase.
struct PostOffice {
    inboxes: Mutex<HashMap<(usize, u16), HashMap<usize, VecDeque<Vec<u8>>>>>,
    delivered: Condvar,
}

static POST_OFFICE: Lazy<PostOffice> = Lazy::new(|| PostOffice {
    inboxes: Mutex::new(HashMap::new()),
    delivered: Condvar::new(),
});

impl PostOffice {
    fn deliver(&self, src: usize, dst: usize, tag: u16, bytes: Vec<u8>) {
        let mut inboxes = self.inboxes.lock().expect("post office lock");
        inboxes
            .entry((dst, tag))
            .or_default()
            .entry(src)
            .or_default()
            .push_back(bytes);
        self.delivered.notify_all();
    }

    fn collect(&self, src: usize, dst: usize, tag: u16) -> Vec<u8> {
        let mut inboxes = self.inboxes.lock().expect("post office lock");
        loop {
            let next = inboxes
                .get_mut(&(dst, tag))
                .and_then(|inbox| inbox.get_mut(&src))
                .and_then(VecDeque::pop_front);
            if let Some(bytes) = next {
                return bytes;
            }
            inboxes = self.delivered.wait(inboxes).expect("post office lock");
        }
    }
}

/// Send side completes as soon as the message is filed.
pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Blocks until the sender's lane for this phase holds a message.
pub struct LocalRecvHandle {
    src: usize,
    dst: usize,
    tag: u16,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(POST_OFFICE.collect(self.src, self.dst, self.tag))
    }
}

/// In-process communicator: each rank lives on its own thread and messages
/// travel through the process-global post office.
#[derive(Copy, Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }
}

impl Communicator for RayonComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> LocalSendHandle {
        POST_OFFICE.deliver(self.rank, peer, tag, buf.to_vec());
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16) -> LocalRecvHandle {
        LocalRecvHandle {
            src: peer,
            dst: self.rank,
            tag,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}
