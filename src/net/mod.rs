//! Networking layer: wire codec, message set, address type, and the TCP
//! connection pool built on top of them.

pub mod address;
pub mod message;
pub mod pool;
pub mod wire;

pub use address::Address;
pub use message::{Message, MessageHeader, MessageType, WorkerInfoFields, WorkerListEntry};
pub use pool::{ConnectionPool, Handler};
pub use wire::{MAX_FRAME_LEN, MAX_PAYLOAD_LEN, MAX_STRING_LEN};
