//! Collective communication over a one-sided RDMA-style transport.
//!
//! The crate has no async runtime and no background threads: every collective call builds an
//! [`op::OpRecord`] state machine and links it onto the [`engine::Engine`]'s active list, and
//! progress only happens inside an explicit [`engine::Engine::poll`] call (which the blocking
//! entry points in [`dispatch`] and [`handle::wait_sync`] drive in a loop, and which a caller
//! running its own event loop can drive directly). Nothing here touches thread-local storage or
//! a process-wide singleton; every entry point takes the [`engine::Engine`] and the calling
//! thread's [`pool::ThreadContext`] explicitly.
//!
//! Start by constructing a [`transport::Transport`] (or, in tests, a [`testing::LoopbackTransport`]),
//! calling [`init`] to get an [`engine::Engine`], and a [`pool::ThreadContext`] per calling thread.

mod aggregate;
mod algo;
pub mod consensus;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flags;
pub mod handle;
mod op;
pub mod pool;
mod p2p;
pub mod team;
pub mod testing;
pub mod transport;
pub mod tree;

use std::sync::Arc;

pub use dispatch::{
    broadcast, broadcast_nb, exchange, exchange_m, exchange_m_nb, exchange_nb, gather, gather_all,
    gather_all_m, gather_all_m_nb, gather_all_nb, gather_nb, scatter, scatter_nb, EAGER_MIN,
};
pub use engine::Engine;
pub use error::FatalError;
pub use flags::CollFlags;
pub use handle::{try_sync, try_sync_all, try_sync_some, wait_sync, wait_sync_all, wait_sync_some, Handle};
pub use op::{Addr, Target};
pub use pool::ThreadContext;
pub use transport::Transport;
pub use tree::TreeKind;

/// Build the engine for this process.
///
/// `image_counts[n]` is the number of images (ranks) hosted on node `n`; `my_image` is this
/// process's own image id within that global numbering. There is one [`engine::Engine`] per
/// process — callers that used to reach for a process-wide singleton should instead hold this
/// behind whatever lifetime fits their program (a `static` behind `OnceLock`, a field on a larger
/// context, or just a stack local in a single-threaded test).
pub fn init(transport: Arc<dyn Transport>, image_counts: &[u32], my_image: u32) -> Engine {
    Engine::new(transport, image_counts, my_image)
}
