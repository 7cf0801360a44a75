//! Outgoing report queue
//!
//! A fixed 64-slot ring decouples callers from USB write latency: producers
//! enqueue chunks, a dedicated writer thread drains them and issues the
//! paced device writes. Pushes coalesce semantically before consuming a
//! slot: a newer PBA supersedes a queued one outright, and an SBA may
//! overwrite the last queued SBA as long as no PBA for the same device sits
//! after it (a client that sets brightness right before switching an output
//! on must not have that switch re-ordered ahead of the brightness update).

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::device::UsbDevice;
use crate::protocol::{MAX_WRITE, QUEUE_LEN};

/// Command family of a queued chunk, as far as coalescing cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    Sba,
    Pba,
    Raw,
}

struct Chunk {
    /// Strong reference so a device removal cannot free the endpoint
    /// underneath an in-flight write. `None` only for the sentinel.
    device: Option<Arc<UsbDevice>>,
    kind: ChunkKind,
    len: usize,
    data: [u8; MAX_WRITE],
}

#[derive(PartialEq, Eq)]
enum QueueState {
    Running,
    ShuttingDown,
}

struct Ring {
    slots: Vec<Option<Chunk>>,
    rpos: usize,
    wpos: usize,
    level: usize,
    state: QueueState,
    /// Writer thread is parked waiting for data (drain-wait condition)
    consumer_parked: bool,
    /// A drain-waiter is present
    drain_waiting: bool,
    writer_exited: bool,
}

/// Ring state plus the condition signals. Shared between producers, the
/// writer thread and the shutdown path.
pub(crate) struct QueueCore {
    ring: Mutex<Ring>,
    /// Producers wait here while the ring is full
    space: Condvar,
    /// The writer waits here while the ring is empty
    data: Condvar,
    /// Drain-waiters wait here until the writer goes idle
    drain: Condvar,
    /// Signalled once the writer thread has returned
    exited: Condvar,
}

impl QueueCore {
    pub(crate) fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: (0..QUEUE_LEN).map(|_| None).collect(),
                rpos: 0,
                wpos: 0,
                level: 0,
                state: QueueState::Running,
                consumer_parked: false,
                drain_waiting: false,
                writer_exited: false,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
            drain: Condvar::new(),
            exited: Condvar::new(),
        }
    }

    /// Enqueue one chunk, coalescing where the rules allow.
    ///
    /// A missing device or an empty/oversized payload degrades to the
    /// shutdown sentinel. Blocks while the ring is full; returns the
    /// accepted payload length, or 0 once the queue is shutting down.
    pub(crate) fn push(
        &self,
        device: Option<Arc<UsbDevice>>,
        kind: ChunkKind,
        payload: &[u8],
    ) -> usize {
        let sentinel = device.is_none() || payload.is_empty() || payload.len() > MAX_WRITE;
        let (device, payload) = if sentinel {
            (None, &[][..])
        } else {
            (device, payload)
        };

        let mut ring = self.ring.lock();
        loop {
            if ring.state != QueueState::Running {
                return 0;
            }

            if let Some(dev) = device.as_ref() {
                if let Some(pos) = coalesce_target(&ring, dev, kind) {
                    let chunk = ring.slots[pos]
                        .as_mut()
                        .expect("coalesce target must be occupied");
                    chunk.data[..payload.len()].copy_from_slice(payload);
                    chunk.len = payload.len();
                    return payload.len();
                }
            }

            if ring.level == QUEUE_LEN {
                self.space.wait(&mut ring);
                continue;
            }

            let wpos = ring.wpos;
            let mut data = [0u8; MAX_WRITE];
            data[..payload.len()].copy_from_slice(payload);
            ring.slots[wpos] = Some(Chunk {
                device: device.clone(),
                kind,
                len: payload.len(),
                data,
            });
            ring.wpos = (wpos + 1) % QUEUE_LEN;
            ring.level += 1;

            self.data.notify_one();
            return payload.len();
        }
    }

    /// Dequeue the next chunk into `buf` (which must hold 32 bytes).
    ///
    /// Blocks while the ring is empty. A zero-length result is the
    /// sentinel: the queue has flipped to shutting-down and the caller
    /// should exit.
    pub(crate) fn shift(&self, buf: &mut [u8]) -> (Option<Arc<UsbDevice>>, usize) {
        if buf.len() < MAX_WRITE {
            return (None, 0);
        }

        let mut ring = self.ring.lock();
        loop {
            if ring.state != QueueState::Running {
                return (None, 0);
            }

            if ring.level == 0 {
                ring.consumer_parked = true;
                if ring.drain_waiting {
                    self.drain.notify_all();
                }
                self.data.wait(&mut ring);
                continue;
            }

            let rpos = ring.rpos;
            let chunk = ring.slots[rpos].take().expect("read slot must be occupied");
            ring.rpos = (rpos + 1) % QUEUE_LEN;
            ring.level -= 1;
            ring.consumer_parked = false;

            if chunk.len == 0 {
                ring.state = QueueState::ShuttingDown;
                // Wake everyone parked on the queue so they observe the
                // state change.
                self.space.notify_all();
                self.drain.notify_all();
                return (None, 0);
            }

            buf[..chunk.len].copy_from_slice(&chunk.data[..chunk.len]);
            self.space.notify_one();
            return (chunk.device, chunk.len);
        }
    }

    /// Block until every previously pushed chunk has been handed to its
    /// device.
    ///
    /// "Empty" means the ring level is zero *and* the writer is parked:
    /// a popped chunk still inside `device.write` is not yet delivered,
    /// so an empty ring alone is not enough.
    pub(crate) fn wait_empty(&self) {
        let mut ring = self.ring.lock();
        loop {
            if ring.state != QueueState::Running {
                return;
            }
            if ring.level == 0 && ring.consumer_parked {
                ring.drain_waiting = false;
                return;
            }
            ring.drain_waiting = true;
            self.drain.wait(&mut ring);
        }
    }

    #[cfg(test)]
    fn level(&self) -> usize {
        self.ring.lock().level
    }
}

/// Position of the queued chunk the incoming one may overwrite, if any
fn coalesce_target(ring: &Ring, device: &Arc<UsbDevice>, kind: ChunkKind) -> Option<usize> {
    let occupied = (0..ring.level).map(|i| (ring.rpos + i) % QUEUE_LEN);

    match kind {
        ChunkKind::Raw => None,
        ChunkKind::Pba => {
            // A PBA rewrites all 32 profile values, so any queued PBA for
            // the same device is fully superseded.
            for pos in occupied {
                let chunk = ring.slots[pos].as_ref().expect("occupied slot");
                if let Some(dev) = &chunk.device {
                    if Arc::ptr_eq(dev, device) && chunk.kind == ChunkKind::Pba {
                        return Some(pos);
                    }
                }
            }
            None
        }
        ChunkKind::Sba => {
            // Last queued SBA is a candidate, but a PBA for the same
            // device behind it voids the candidate: the switch update
            // must stay after that brightness update.
            let mut candidate = None;
            for pos in occupied {
                let chunk = ring.slots[pos].as_ref().expect("occupied slot");
                if let Some(dev) = &chunk.device {
                    if Arc::ptr_eq(dev, device) {
                        match chunk.kind {
                            ChunkKind::Sba => candidate = Some(pos),
                            ChunkKind::Pba => candidate = None,
                            ChunkKind::Raw => {}
                        }
                    }
                }
            }
            candidate
        }
    }
}

/// Queue handle owning the writer thread
pub(crate) struct WriteQueue {
    core: Arc<QueueCore>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Allocate the ring and spawn the writer thread
    pub(crate) fn open() -> Self {
        let core = Arc::new(QueueCore::new());
        let writer_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("ledwiz-writer".into())
            .spawn(move || writer_loop(writer_core))
            .expect("failed to spawn writer thread");

        Self {
            core,
            writer: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn push(
        &self,
        device: Option<Arc<UsbDevice>>,
        kind: ChunkKind,
        payload: &[u8],
    ) -> usize {
        self.core.push(device, kind, payload)
    }

    pub(crate) fn wait_empty(&self) {
        self.core.wait_empty()
    }

    /// Stop the writer.
    ///
    /// `unloading` selects how the shutdown is observed: normally the
    /// thread is joined; during a library-unload callback joining a thread
    /// of the current process deadlocks, so that path waits on the
    /// thread-exited signal instead and lets the handle detach.
    pub(crate) fn close(&self, unloading: bool) {
        self.core.push(None, ChunkKind::Raw, &[]);

        if unloading {
            let mut ring = self.core.ring.lock();
            while !ring.writer_exited {
                self.core.exited.wait(&mut ring);
            }
            drop(ring);
            drop(self.writer.lock().take());
        } else if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        if self.writer.lock().is_some() {
            self.close(false);
        }
    }
}

fn writer_loop(core: Arc<QueueCore>) {
    let mut buf = [0u8; MAX_WRITE];
    loop {
        let (device, n) = core.shift(&mut buf);
        let Some(device) = device else { break };
        if n == 0 {
            break;
        }
        device.write(&buf[..n]);
        // chunk's device reference is released here
    }

    let mut ring = core.ring.lock();
    ring.writer_exited = true;
    core.exited.notify_all();
    debug!("writer thread exited");
}
