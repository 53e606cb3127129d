//! Job queue for Media Lab
//!
//! At-least-once delivery with leases. A consumer that dies mid-job stops
//! renewing its lease; once the lease expires the job is handed to the next
//! consumer with an incremented attempt count.
//!
//! - [`RedisJobQueue`] keeps state in Redis lists, sorted sets and hashes and
//!   mutates it only through Lua scripts, so claim, ack and nack are atomic
//! - [`MemoryJobQueue`] has the same semantics inside one process
//!
//! Lease tokens guard ack, nack and extend: a consumer whose lease was
//! reclaimed cannot remove or reschedule the job it no longer owns.

pub mod keys;
pub mod memory;
pub mod redis_queue;

pub use keys::QueueKeys;
pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;
