//! Handle allocator (C4, §4.4).
//!
//! A handle carries three distinguishable states — in-flight, complete-but-not-freed, freed (I7)
//! — but rather than model "freed" as a sentinel a caller could accidentally poke after the fact,
//! this crate encodes it with ownership: [`try_sync`]/[`wait_sync`] *consume* the [`Handle`] and
//! only return success once it is safe to treat the op's effects as visible, so a freed handle
//! simply can't exist as a value anymore. [`crate::pool::ThreadContext`] still pools the
//! underlying cells so repeated collective calls don't allocate once warmed up.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IN_FLIGHT: u8 = 0;
const COMPLETE: u8 = 1;

/// The shared cell a [`Handle`] points at. Reused across ops via
/// [`crate::pool::ThreadContext`]'s handle freelist.
pub(crate) struct HandleCell {
    state: AtomicU8,
}

impl HandleCell {
    fn new() -> Arc<HandleCell> {
        Arc::new(HandleCell {
            state: AtomicU8::new(IN_FLIGHT),
        })
    }

    fn reset(&self) {
        self.state.store(IN_FLIGHT, Ordering::Relaxed);
    }
}

/// A completion handle for a non-aggregated, non-blocking collective request.
///
/// `signal` is called by the progress engine ([`crate::engine`]) with write-release ordering so
/// that any memory a remote node wrote as part of the op is visible to whichever thread later
/// observes completion with acquire ordering (I7).
pub struct Handle {
    pub(crate) cell: Arc<HandleCell>,
}

impl Handle {
    pub(crate) fn new() -> Handle {
        Handle { cell: HandleCell::new() }
    }

    pub(crate) fn from_cell(cell: Arc<HandleCell>) -> Handle {
        cell.reset();
        Handle { cell }
    }

    /// A second `Handle` pointing at the same cell, for the engine to hold (and signal) while the
    /// original is handed to the caller to sync on. Both are "the same opaque signaling cell" per
    /// the data model — this just makes that sharing explicit instead of reaching for `unsafe`.
    pub(crate) fn share(&self) -> Handle {
        Handle { cell: self.cell.clone() }
    }

    /// Mark this handle's op complete. Write-release: any writes a remote node made as part of
    /// the op must happen-before this store is observed (I7).
    pub(crate) fn signal(&self) {
        self.cell.state.store(COMPLETE, Ordering::Release);
    }

    /// Non-blocking probe, acquire-ordered so a `true` result makes the op's remote writes
    /// visible to the caller (I7). Does not consume the handle — used internally by
    /// [`try_sync`]/[`try_sync_some`]/[`try_sync_all`].
    fn is_done(&self) -> bool {
        self.cell.state.load(Ordering::Acquire) == COMPLETE
    }
}

/// Probe `h`: `Ok(())` if the op completed (consuming the handle, which is returned to its
/// thread-local pool), `Err(h)` to retry later.
pub fn try_sync(ctx: &mut crate::pool::ThreadContext, h: Handle) -> Result<(), Handle> {
    if h.is_done() {
        ctx.release_handle(h);
        Ok(())
    } else {
        Err(h)
    }
}

/// Probe every handle in `handles`, removing and counting the ones that completed. Returns the
/// number removed.
pub fn try_sync_some(ctx: &mut crate::pool::ThreadContext, handles: &mut Vec<Handle>) -> usize {
    let mut done = 0;
    let mut i = 0;
    while i < handles.len() {
        if handles[i].is_done() {
            let h = handles.remove(i);
            ctx.release_handle(h);
            done += 1;
        } else {
            i += 1;
        }
    }
    done
}

/// `true`, consuming every handle, iff every handle in `handles` had completed; otherwise
/// `handles` is left untouched and this returns `false`.
pub fn try_sync_all(ctx: &mut crate::pool::ThreadContext, handles: &mut Vec<Handle>) -> bool {
    if handles.iter().all(|h| h.is_done()) {
        for h in handles.drain(..) {
            ctx.release_handle(h);
        }
        true
    } else {
        false
    }
}

/// Block until `h` completes, driving the engine and transport poll loops meanwhile (§4.8 step
/// 7's blocking-entry-point loop).
pub fn wait_sync(
    ctx: &mut crate::pool::ThreadContext,
    engine: &crate::engine::Engine,
    mut h: Handle,
) {
    loop {
        match try_sync(ctx, h) {
            Ok(()) => return,
            Err(back) => {
                h = back;
                engine.poll();
                engine.transport().poll();
            }
        }
    }
}

/// Block until every handle in `handles` completes.
pub fn wait_sync_some(
    ctx: &mut crate::pool::ThreadContext,
    engine: &crate::engine::Engine,
    handles: &mut Vec<Handle>,
) {
    while try_sync_some(ctx, handles) == 0 && !handles.is_empty() {
        engine.poll();
        engine.transport().poll();
    }
}

/// Block until every handle in `handles` completes, consuming all of them.
pub fn wait_sync_all(
    ctx: &mut crate::pool::ThreadContext,
    engine: &crate::engine::Engine,
    handles: &mut Vec<Handle>,
) {
    while !try_sync_all(ctx, handles) {
        engine.poll();
        engine.transport().poll();
    }
}
