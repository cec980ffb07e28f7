pub mod jitter;
pub mod packet;
pub mod pool;

pub use jitter::JitterBuffer;
pub use packet::{PacketBuffer, BUFFER_CAPACITY};
pub use pool::PacketPool;
