use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accelport_core::{ErrorStatus, OutputShape, Timing};
use accelport_memory::{Memory, MemoryId, Request, RequestPool};
use tracing::{debug, warn};

use crate::fmq::{RingChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::protocol::{
    deserialize_request, deserialize_result, serialize_request, serialize_result, BurstRequest,
    RequestDatum, ResultDatum,
};

/// How long a burst receiver busy-polls before parking. Matches the original
/// runtime's default; zero when the caller prefers power over latency.
pub const DEFAULT_POLLING_WINDOW: Duration = Duration::from_micros(50);

/// Side channel through which the receiving end learns which buffer a newly
/// allocated slot refers to. Called at most once per distinct buffer.
pub trait BurstSlotListener: Send + Sync {
    fn on_slot_bound(&self, slot: u32, memory: Memory);
    fn on_slot_freed(&self, slot: u32);
}

/// Maps stable buffer identities to small slot integers so repeated bursts
/// re-serialize only the integer, never the buffer description.
struct SlotCache {
    slots: HashMap<MemoryId, u32>,
    free: Vec<u32>,
    next: u32,
}

impl SlotCache {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            free: Vec::new(),
            next: 0,
        }
    }

    /// Slot for `memory`, allocating on first sight. The listener is told
    /// about new bindings only.
    fn resolve(&mut self, memory: &Memory, listener: &dyn BurstSlotListener) -> u32 {
        let id = MemoryId::of(memory);
        if let Some(&slot) = self.slots.get(&id) {
            return slot;
        }
        let slot = self.free.pop().unwrap_or_else(|| {
            let slot = self.next;
            self.next += 1;
            slot
        });
        self.slots.insert(id, slot);
        listener.on_slot_bound(slot, memory.clone());
        debug!(slot, "bound burst memory slot");
        slot
    }

    fn forget(&mut self, id: MemoryId, listener: &dyn BurstSlotListener) {
        if let Some(slot) = self.slots.remove(&id) {
            self.free.push(slot);
            listener.on_slot_freed(slot);
        }
    }
}

/// Outcome of a burst send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// The channel has been invalidated or lacks space; nothing was written.
    ChannelUnavailable,
    /// The request references a pool the slot protocol cannot express; the
    /// caller should fall back to a control-plane execution path.
    NotRepresentable,
}

/// Client end of a burst session: serializes requests into the request ring
/// and reads results back from the result ring.
pub struct ExecutionBurstController {
    requests: Arc<RingChannel<RequestDatum>>,
    results: Arc<RingChannel<ResultDatum>>,
    slots: Mutex<SlotCache>,
    listener: Arc<dyn BurstSlotListener>,
    polling_window: Duration,
}

impl ExecutionBurstController {
    pub fn new(
        requests: Arc<RingChannel<RequestDatum>>,
        results: Arc<RingChannel<ResultDatum>>,
        listener: Arc<dyn BurstSlotListener>,
        polling_window: Duration,
    ) -> Self {
        Self {
            requests,
            results,
            slots: Mutex::new(SlotCache::new()),
            listener,
            polling_window,
        }
    }

    /// Serializes and enqueues one request. Never blocks indefinitely.
    pub fn send(&self, request: &Request, measure: bool) -> SendStatus {
        let mut slots = Vec::with_capacity(request.pools.len());
        {
            let mut cache = self.slots.lock().unwrap();
            for pool in &request.pools {
                match pool {
                    RequestPool::Memory(memory) => {
                        slots.push(cache.resolve(memory, self.listener.as_ref()));
                    }
                    RequestPool::DeviceToken(_) => {
                        debug!("request pool is not slot-representable");
                        return SendStatus::NotRepresentable;
                    }
                }
            }
        }
        let burst = BurstRequest {
            inputs: request.inputs.clone(),
            outputs: request.outputs.clone(),
        };
        let stream = serialize_request(&burst, &slots, measure);
        if stream.len() > self.requests.capacity() {
            debug!(len = stream.len(), "request exceeds burst channel capacity");
            return SendStatus::NotRepresentable;
        }
        if self.requests.write(&stream) {
            SendStatus::Sent
        } else {
            SendStatus::ChannelUnavailable
        }
    }

    /// Blocks (poll-then-park) for the next result. None once the session is
    /// invalidated.
    pub fn receive(&self) -> Option<(ErrorStatus, Vec<OutputShape>, Timing)> {
        let header = self.results.read(self.polling_window)?;
        let packet_size = match header {
            // The smallest packet is the header plus the timing datum.
            ResultDatum::PacketInformation { packet_size, .. } if packet_size >= 2 => packet_size,
            other => {
                warn!(?other, "malformed result stream header");
                self.invalidate();
                return None;
            }
        };
        let mut stream = Vec::with_capacity(packet_size as usize);
        stream.push(header);
        stream.extend(
            self.results
                .read_exact(packet_size as usize - 1, self.polling_window)?,
        );
        match deserialize_result(&stream) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(error = %err, "failed to deserialize burst result");
                self.invalidate();
                None
            }
        }
    }

    /// Drops a buffer from the slot cache, recycling its slot.
    pub fn forget_memory(&self, id: MemoryId) {
        self.slots.lock().unwrap().forget(id, self.listener.as_ref());
    }

    /// Idempotent; wakes any blocked `receive` and fails later sends.
    pub fn invalidate(&self) {
        self.requests.invalidate();
        self.results.invalidate();
    }

    pub fn is_invalidated(&self) -> bool {
        self.requests.is_invalidated() || self.results.is_invalidated()
    }
}

/// Server end of a burst session, held by the driver: reads requests off the
/// request ring, resolves slots to buffers, and writes results back.
pub struct BurstServer {
    requests: Arc<RingChannel<RequestDatum>>,
    results: Arc<RingChannel<ResultDatum>>,
    memories: Mutex<HashMap<u32, Memory>>,
    polling_window: Duration,
}

impl BurstServer {
    pub fn new(
        requests: Arc<RingChannel<RequestDatum>>,
        results: Arc<RingChannel<ResultDatum>>,
        polling_window: Duration,
    ) -> Self {
        Self {
            requests,
            results,
            memories: Mutex::new(HashMap::new()),
            polling_window,
        }
    }

    /// Blocks for the next request. None once the session is invalidated or
    /// the stream is malformed.
    pub fn wait_request(&self) -> Option<(BurstRequest, Vec<Memory>, bool)> {
        let header = self.requests.read(self.polling_window)?;
        let packet_size = match header {
            // The smallest packet is the header plus the measure datum.
            RequestDatum::PacketInformation { packet_size, .. } if packet_size >= 2 => packet_size,
            other => {
                warn!(?other, "malformed request stream header");
                return None;
            }
        };
        let mut stream = Vec::with_capacity(packet_size as usize);
        stream.push(header);
        stream.extend(
            self.requests
                .read_exact(packet_size as usize - 1, self.polling_window)?,
        );
        let (request, slots, measure) = match deserialize_request(&stream) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "failed to deserialize burst request");
                return None;
            }
        };
        let memories = {
            let bound = self.memories.lock().unwrap();
            slots
                .iter()
                .map(|slot| bound.get(slot).cloned())
                .collect::<Option<Vec<_>>>()?
        };
        Some((request, memories, measure))
    }

    pub fn send_result(
        &self,
        status: ErrorStatus,
        shapes: &[OutputShape],
        timing: Timing,
    ) -> bool {
        self.results.write(&serialize_result(status, shapes, timing))
    }

    pub fn invalidate(&self) {
        self.requests.invalidate();
        self.results.invalidate();
    }
}

impl BurstSlotListener for BurstServer {
    fn on_slot_bound(&self, slot: u32, memory: Memory) {
        self.memories.lock().unwrap().insert(slot, memory);
    }

    fn on_slot_freed(&self, slot: u32) {
        self.memories.lock().unwrap().remove(&slot);
    }
}

/// Creates a bound burst session: the controller (request sender / result
/// receiver) and the server (request receiver / result sender) share two
/// fixed-length ring channels for the session's lifetime.
pub fn create_burst(
    polling_window: Duration,
) -> (Arc<ExecutionBurstController>, Arc<BurstServer>) {
    create_burst_with_capacity(polling_window, DEFAULT_CHANNEL_CAPACITY)
}

pub fn create_burst_with_capacity(
    polling_window: Duration,
    capacity: usize,
) -> (Arc<ExecutionBurstController>, Arc<BurstServer>) {
    let requests = Arc::new(RingChannel::new(capacity));
    let results = Arc::new(RingChannel::new(capacity));
    let server = Arc::new(BurstServer::new(
        requests.clone(),
        results.clone(),
        polling_window,
    ));
    let controller = Arc::new(ExecutionBurstController::new(
        requests,
        results,
        server.clone(),
        polling_window,
    ));
    (controller, server)
}
