//! The one-sided transport collaborator (§6).
//!
//! Everything in this module is a *contract*: the real RDMA-style substrate (blocking/
//! non-blocking put/get, a short active-message facility, named barriers) is out of scope for
//! this crate (§1) and is supplied by the host runtime. `Transport` is that contract expressed as
//! a trait rather than the reserved-FFI-slot arrangement the GASNet original uses, so that the
//! engine in the rest of this crate can be written and tested without linking a real fabric.

use std::sync::Arc;

/// Opaque completion token for a non-blocking bulk transfer.
///
/// Mirrors the handles `nb_put_bulk`/`nb_get_bulk` hand back in the GASNet sources
/// (`extended-ref/gasnet_coll_putget.c`): meaningless to the engine beyond passing it back into
/// `try_sync_nb`/`wait_sync_nb`.
pub type CompletionToken = u64;

/// An active-message handler: invoked at the destination node with the sender's node id, a short
/// argument vector, and an optional payload.
pub type AmHandler = Arc<dyn Fn(u32, &[u64], &[u8]) + Send + Sync>;

/// Reserved active-message handler table indices (§4.3): the P2P subsystem installs its handlers
/// at these slots during `init`.
pub const HANDLER_EAGER_SHORT: u32 = 0;
pub const HANDLER_EAGER_MED: u32 = 1;
pub const HANDLER_EAGER_LONG: u32 = 2;

/// The one-sided transport contract (§6).
///
/// Implementors must guarantee: (a) the state-update action within a single `short_request_reply`
/// call is observed by the receiver only after that call's payload, if any, is stored (the
/// ordering guarantee §4.3 relies on for `signalling_put`/`eager_putM`); (b) `wait_sync_nb`
/// returning implies the transfer's remote writes are visible under the transport's own memory
/// model (I7).
pub trait Transport: Send + Sync {
    /// Copy `n` bytes from `src_node`'s memory at `src` into local `dst`. Blocks until complete.
    fn blocking_get(&self, dst: &mut [u8], src_node: u32, src: usize);

    /// Copy `src` into `dst_node`'s memory at `dst`. Returns once the local buffer is reusable.
    fn blocking_put(&self, dst_node: u32, dst: usize, src: &[u8]);

    /// Non-blocking put with an explicit completion token.
    fn nb_put_bulk(&self, dst_node: u32, dst: usize, src: &[u8]) -> CompletionToken;

    /// Non-blocking get with an explicit completion token.
    fn nb_get_bulk(&self, dst: &mut [u8], src_node: u32, src: usize) -> CompletionToken;

    /// Non-blocking put whose completion is bound to the ambient implicit-op region.
    fn nbi_put_bulk(&self, dst_node: u32, dst: usize, src: &[u8]);

    /// Non-blocking get whose completion is bound to the ambient implicit-op region.
    fn nbi_get_bulk(&self, dst: &mut [u8], src_node: u32, src: usize);

    /// Open an implicit-completion region; returns the token that will track every
    /// `nbi_put_bulk`/`nbi_get_bulk` issued before the matching `end_nbi_region`.
    fn begin_nbi_region(&self) -> CompletionToken;

    /// Close the current implicit-completion region, returning its token.
    fn end_nbi_region(&self) -> CompletionToken;

    /// Non-blocking probe: true if `token`'s transfer(s) have completed.
    fn try_sync_nb(&self, token: CompletionToken) -> bool;

    /// Block until `token`'s transfer(s) have completed.
    fn wait_sync_nb(&self, token: CompletionToken);

    /// Maximum payload size of a single "long" active-message request.
    fn max_long_request(&self) -> usize;

    /// Maximum payload size of a single "medium" active-message request.
    fn max_medium(&self) -> usize;

    /// Register the handler invoked for active messages addressed to `handler_idx`. The P2P
    /// subsystem registers `HANDLER_EAGER_{SHORT,MED,LONG}` during `init`.
    fn register_handler(&self, handler_idx: u32, handler: AmHandler);

    /// Send a short active-message request to `dst_node`, addressed to `handler_idx`, carrying
    /// `args` and an optional `payload`. Handlers are dispatched synchronously from the
    /// perspective of the transport (no completion token: delivery is "fire and forget" from the
    /// sender's point of view, acknowledged only via the P2P state array).
    fn short_request_reply(&self, dst_node: u32, handler_idx: u32, args: &[u64], payload: &[u8]);

    /// Issue (or join) a notify phase of the named barrier `name`.
    fn barrier_notify(&self, name: u32, flags: u32);

    /// Block until the named barrier `name` has drained.
    fn barrier_wait(&self, name: u32);

    /// Non-blocking probe of the named barrier `name`.
    fn barrier_try(&self, name: u32) -> bool;

    /// Drive the transport's own incoming-message service. Never blocks.
    fn poll(&self);

    /// Total number of process nodes in the job.
    fn node_count(&self) -> u32;

    /// This process's node id.
    fn my_node(&self) -> u32;

    /// The registered communication segment's `(base, length)` on `node`.
    fn segment_of(&self, node: u32) -> (usize, usize);

    /// Write `src` into *this* node's own registered segment at `addr`.
    ///
    /// Not part of the original §6 list: the GASNet original reaches registered memory through
    /// ordinary pointer dereference, which Rust can't do across this trait boundary without
    /// `unsafe`. Algorithms that need to touch their own local share of a `SINGLE` buffer (e.g.
    /// applying an eager broadcast's local contribution, or the M-variant local fan-out) go
    /// through this instead of casting `addr` back into a raw pointer.
    fn local_write(&self, addr: usize, src: &[u8]);

    /// Read `len` bytes out of *this* node's own registered segment at `addr`. See
    /// [`Transport::local_write`].
    fn local_read(&self, addr: usize, len: usize) -> Vec<u8>;
}
