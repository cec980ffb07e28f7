use crate::buffer::packet::PacketBuffer;
use std::sync::Mutex;

/// Recycling pool for packet buffers
///
/// Each peer owns two pools, one per direction, so the audio path never
/// allocates once the call reaches a steady state: buffers circulate between
/// the pool, the queue, and the caller that checked them out.
///
/// The pool lock covers only the free list. It is distinct from the queue
/// locks holding in-flight buffers, so a caller filling a fresh buffer never
/// contends with a peer's transmit or delivery path.
pub struct PacketPool {
    free: Mutex<Vec<PacketBuffer>>,
}

impl PacketPool {
    pub fn new() -> Self {
        PacketPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a recycled buffer, or allocate a fresh one if the pool is dry
    ///
    /// Contents are not zeroed; overwrite the payload before use.
    pub fn checkout(&self) -> PacketBuffer {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop().unwrap_or_default()
    }

    /// Return a buffer to the pool
    ///
    /// Ownership moves back to the pool; the buffer will be handed out again
    /// by a later `checkout`.
    pub fn retire(&self, packet: PacketBuffer) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(packet);
    }

    /// Number of buffers currently sitting in the pool
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_then_checkout_reuses_allocation() {
        let pool = PacketPool::new();
        let mut packet = pool.checkout();
        packet.set_payload(b"frame").unwrap();
        let storage = packet.payload().as_ptr();

        pool.retire(packet);
        assert_eq!(pool.available(), 1);

        let recycled = pool.checkout();
        assert_eq!(recycled.payload().as_ptr(), storage);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_empty_pool_allocates() {
        let pool = PacketPool::new();
        let a = pool.checkout();
        let b = pool.checkout();
        assert_ne!(a.payload().as_ptr(), b.payload().as_ptr());
    }
}
