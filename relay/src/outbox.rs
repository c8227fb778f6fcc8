//! Per-client outbound rings.
//!
//! Each connected consumer gets its own [`ByteRing`]; a stream thread on
//! the far side drains it with [`StreamPump::pump_ring`]. The event source
//! pushes typed packets through the [`PacketListener`] impl, which encodes
//! them and writes whole frames without blocking. A frame that does not
//! fit is counted against the client and reported later as a
//! [`LostEvents`] packet, so a slow consumer never stalls the source and
//! never observes a torn frame.
//!
//! [`StreamPump::pump_ring`]: crate::StreamPump::pump_ring

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace, warn};

use bytering::ByteRing;
use protocol::{ClientId, LostEvents, Packet, PacketListener};

struct ClientOutbox {
    ring: Arc<ByteRing>,
    lost: u64,
}

impl ClientOutbox {
    /// Write `frame` whole or not at all. If the client fell behind
    /// earlier, a LostEvents frame is prepended in the same write so the
    /// gap report cannot itself be dropped between the two frames.
    fn deliver(&mut self, frame: &[u8], scratch: &mut Vec<u8>) {
        let bytes = if self.lost > 0 {
            scratch.clear();
            Packet::LostEvents(LostEvents {
                cpu: -1,
                count: self.lost,
            })
            .encode(scratch);
            scratch.extend_from_slice(frame);
            &scratch[..]
        } else {
            frame
        };

        // Single writer per ring: free() can only grow between this check
        // and the write, so a passing check means the whole frame lands.
        if self.ring.writes_allowed() && self.ring.free() >= bytes.len() {
            let written = self.ring.write(bytes, false);
            debug_assert_eq!(written, bytes.len());
            self.lost = 0;
        } else {
            self.lost += 1;
            trace!(lost = self.lost, "client ring full, frame dropped");
        }
    }
}

/// Fan-out registry keyed by client id. Shared between the accept path
/// (register/remove) and the event source (the [`PacketListener`] calls).
pub struct Outboxes {
    ring_capacity: usize,
    clients: Mutex<HashMap<ClientId, ClientOutbox>>,
    scratch: Vec<u8>,
}

impl Outboxes {
    /// `ring_capacity` is the per-client buffer size in bytes.
    pub fn new(ring_capacity: usize) -> Self {
        Outboxes {
            ring_capacity,
            clients: Mutex::new(HashMap::new()),
            scratch: Vec::new(),
        }
    }

    /// Register a client and hand back the ring its stream thread should
    /// drain. Re-registering an id replaces the old outbox.
    pub fn register_client(&self, id: ClientId) -> Arc<ByteRing> {
        let ring = Arc::new(ByteRing::new(self.ring_capacity));
        let mut clients = self.lock_clients();
        if let Some(old) = clients.insert(
            id,
            ClientOutbox {
                ring: ring.clone(),
                lost: 0,
            },
        ) {
            warn!(client = id, "replacing existing outbox");
            old.ring.readonly();
        }
        debug!(client = id, "client registered");
        ring
    }

    /// Drop a client. Its ring goes read-only, so the stream thread
    /// drains what is buffered and then sees a clean end of stream.
    pub fn remove_client(&self, id: ClientId) {
        let mut clients = self.lock_clients();
        if let Some(outbox) = clients.remove(&id) {
            outbox.ring.readonly();
            debug!(client = id, lost = outbox.lost, "client removed");
        }
    }

    /// Frames this client has dropped since its last successful write.
    pub fn lost(&self, id: ClientId) -> Option<u64> {
        self.lock_clients().get(&id).map(|outbox| outbox.lost)
    }

    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, ClientOutbox>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PacketListener for Outboxes {
    fn unicast(&mut self, destination: ClientId, packet: &Packet) {
        let mut frame = Vec::with_capacity(packet.frame_len());
        packet.encode(&mut frame);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outbox) = clients.get_mut(&destination) {
            outbox.deliver(&frame, &mut self.scratch);
        }
    }

    fn multicast(&mut self, packet: &Packet) {
        let mut frame = Vec::with_capacity(packet.frame_len());
        packet.encode(&mut frame);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        for outbox in clients.values_mut() {
            outbox.deliver(&frame, &mut self.scratch);
        }
    }
}
