//! Module for the collapse gate of a cache.
//!
//! Collapsing a cache into its sole consumer needs the consumer's lock and
//! then the cache's own lock, the reverse of the order the cache found itself
//! in. The gate records that the cache lock was dropped for that purpose:
//! while it is closed, contexts that want to attach to the cache wait for the
//! collapse to finish instead of racing with it.
//!
//! ```text
//!   Idle --try_enter--> Collapsing --guard dropped--> Idle
//! ```
//!
//! Entering the gate publishes the cache's wait channel; leaving it
//! unpublishes the channel, which wakes every waiter.

use core::{
    marker::PhantomData,
    sync::atomic::{AtomicU8, Ordering},
};

use strum::FromRepr;

use crate::notify::{WaitNotify, WaitTarget};

#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CollapseState {
    Idle = 0,
    Collapsing = 1,
}

pub struct CollapseGate {
    state: AtomicU8,
}

impl CollapseGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(CollapseState::Idle as u8),
        }
    }

    pub fn state(&self) -> CollapseState {
        let raw = self.state.load(Ordering::Acquire);
        CollapseState::from_repr(raw).unwrap_or_else(|| fatal!("collapse gate in bad state {}", raw))
    }

    pub fn is_collapsing(&self) -> bool {
        self.state() == CollapseState::Collapsing
    }

    /// Moves the gate from `Idle` to `Collapsing` and publishes `target`.
    ///
    /// Returns `None` if a collapse is already in progress.
    pub fn try_enter<'a>(&'a self, notifier: &'a dyn WaitNotify, target: WaitTarget) -> Option<CollapseGuard<'a>> {
        self.state
            .compare_exchange(
                CollapseState::Idle as u8,
                CollapseState::Collapsing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        notifier.publish(target, "cache");
        Some(CollapseGuard {
            gate: self,
            notifier,
            target,
            _not_send: PhantomData,
        })
    }
}

impl Default for CollapseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Open collapse of a cache. Dropping it reopens the gate.
///
/// Waiters check the gate under the cache lock, so the guard has to be
/// dropped with the cache lock held.
#[must_use = "the gate reopens as soon as the guard is dropped"]
pub struct CollapseGuard<'a> {
    gate: &'a CollapseGate,
    notifier: &'a dyn WaitNotify,
    target: WaitTarget,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CollapseGuard<'_> {
    fn drop(&mut self) {
        self.gate.state.store(CollapseState::Idle as u8, Ordering::Release);
        self.notifier.unpublish(self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::CacheId, notify::SpinNotifier};

    const TARGET: WaitTarget = WaitTarget::Cache(CacheId::from_usize(0x1000));

    #[test]
    fn gate_admits_one_collapse_at_a_time() {
        let notifier = SpinNotifier::new();
        let gate = CollapseGate::new();

        let guard = gate.try_enter(&notifier, TARGET).unwrap();
        assert!(gate.is_collapsing());
        assert_eq!(notifier.published(TARGET), Some("cache"));
        assert!(gate.try_enter(&notifier, TARGET).is_none());

        drop(guard);
        assert_eq!(gate.state(), CollapseState::Idle);
        assert_eq!(notifier.published(TARGET), None);
        assert!(gate.try_enter(&notifier, TARGET).is_some());
    }

    #[test]
    fn leaving_the_gate_wakes_waiters() {
        let notifier = SpinNotifier::new();
        let gate = CollapseGate::new();

        let guard = gate.try_enter(&notifier, TARGET).unwrap();
        let ticket = notifier.prepare_wait(TARGET);
        drop(guard);
        // Returns at once: the generation moved on when the guard dropped.
        notifier.wait(ticket);
        assert!(!gate.is_collapsing());
    }
}
