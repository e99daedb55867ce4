//! Module for the wait/notify primitive.
//!
//! Contexts that find a page or a cache busy sleep until whoever made it busy
//! is done with it. The protocol is split in two so that no wakeup is lost:
//! 1. With the lock guarding the condition still held, the waiter calls
//!    [`WaitNotify::prepare_wait`] and receives a [`WaitTicket`].
//! 2. It releases every lock and calls [`WaitNotify::wait`] with the ticket.
//!
//! A notification sent after step 1 always ends the wait in step 2.
//!
//! Objects may additionally be *published* under a name while they are busy,
//! mostly so that a debugger can tell what a context is waiting for.
//! Unpublishing wakes every waiter.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use mutex::SpinNoIrqLock;

use crate::cache::CacheId;

/// Object a context can wait on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitTarget {
    /// A page, identified by the address of its descriptor.
    Page(usize),
    /// A cache that is being collapsed.
    Cache(CacheId),
}

/// Registration of a waiter, obtained by [`WaitNotify::prepare_wait`].
#[derive(Debug)]
#[must_use = "a prepared wait has to be completed with `WaitNotify::wait`"]
pub struct WaitTicket {
    target: WaitTarget,
    generation: u64,
}

impl WaitTicket {
    pub fn new(target: WaitTarget, generation: u64) -> Self {
        Self { target, generation }
    }

    pub fn target(&self) -> WaitTarget {
        self.target
    }

    /// Notification count of the target when the wait was prepared.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Wait/notify primitive used for busy pages and collapsing caches.
pub trait WaitNotify: Send + Sync {
    /// Publishes `target` under `name`.
    fn publish(&self, target: WaitTarget, name: &'static str);

    /// Withdraws a published target and wakes all its waiters.
    fn unpublish(&self, target: WaitTarget);

    /// Wakes all waiters of `target`.
    fn notify_all(&self, target: WaitTarget);

    /// Registers the caller as a waiter of `target`.
    ///
    /// Must be called while holding the lock that protects the awaited
    /// condition.
    fn prepare_wait(&self, target: WaitTarget) -> WaitTicket;

    /// Blocks until `target` is notified after the ticket was prepared.
    ///
    /// Must be called with no lock held.
    fn wait(&self, ticket: WaitTicket);

    /// Withdraws a prepared wait whose condition turned out to hold already.
    fn cancel_wait(&self, ticket: WaitTicket);
}

#[derive(Debug, Default)]
struct Channel {
    name: Option<&'static str>,
    waiters: usize,
    generation: Arc<AtomicU64>,
}

/// [`WaitNotify`] that keeps a notification counter per target and lets
/// waiters spin on it with no lock held.
///
/// A channel only exists while the target is published or has waiters.
#[derive(Default)]
pub struct SpinNotifier {
    channels: SpinNoIrqLock<HashMap<WaitTarget, Channel>>,
}

impl SpinNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the name `target` is published under.
    pub fn published(&self, target: WaitTarget) -> Option<&'static str> {
        self.channels.lock().get(&target).and_then(|channel| channel.name)
    }

    /// Returns the number of contexts waiting on `target`.
    pub fn waiters(&self, target: WaitTarget) -> usize {
        self.channels.lock().get(&target).map_or(0, |channel| channel.waiters)
    }

    fn bump(channel: &Channel) {
        channel.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl WaitNotify for SpinNotifier {
    fn publish(&self, target: WaitTarget, name: &'static str) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(target).or_default();
        if let Some(current) = channel.name {
            drop(channels);
            fatal!("{:?} published as {:?} while already published as {:?}", target, name, current);
        }
        channel.name = Some(name);
    }

    fn unpublish(&self, target: WaitTarget) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&target) else {
            return;
        };
        channel.name = None;
        Self::bump(channel);
        if channel.waiters == 0 {
            channels.remove(&target);
        }
    }

    fn notify_all(&self, target: WaitTarget) {
        if let Some(channel) = self.channels.lock().get(&target) {
            Self::bump(channel);
        }
    }

    fn prepare_wait(&self, target: WaitTarget) -> WaitTicket {
        let mut channels = self.channels.lock();
        let channel = channels.entry(target).or_default();
        channel.waiters += 1;
        WaitTicket::new(target, channel.generation.load(Ordering::Acquire))
    }

    fn wait(&self, ticket: WaitTicket) {
        let generation = match self.channels.lock().get(&ticket.target) {
            Some(channel) => channel.generation.clone(),
            None => fatal!("waiting on {:?} without a prepared wait", ticket.target),
        };
        while generation.load(Ordering::Acquire) == ticket.generation {
            core::hint::spin_loop();
        }
        self.cancel_wait(ticket);
    }

    fn cancel_wait(&self, ticket: WaitTicket) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(&ticket.target) {
            channel.waiters -= 1;
            if channel.waiters == 0 && channel.name.is_none() {
                channels.remove(&ticket.target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn notification_before_wait_is_not_lost() {
        let notifier = SpinNotifier::new();
        let target = WaitTarget::Page(0x1000);
        let ticket = notifier.prepare_wait(target);
        notifier.notify_all(target);
        notifier.wait(ticket);
        assert_eq!(notifier.waiters(target), 0);
    }

    #[test]
    fn unpublish_wakes_waiters() {
        let notifier = Arc::new(SpinNotifier::new());
        let target = WaitTarget::Cache(CacheId::from_usize(0x2000));
        notifier.publish(target, "cache");
        assert_eq!(notifier.published(target), Some("cache"));

        let ticket = notifier.prepare_wait(target);
        let waiter = {
            let notifier = notifier.clone();
            thread::spawn(move || notifier.wait(ticket))
        };
        thread::sleep(Duration::from_millis(20));
        notifier.unpublish(target);
        waiter.join().unwrap();

        assert_eq!(notifier.published(target), None);
        assert_eq!(notifier.waiters(target), 0);
    }

    #[test]
    fn cancelled_wait_drops_the_channel() {
        let notifier = SpinNotifier::new();
        let target = WaitTarget::Page(0x5000);
        let ticket = notifier.prepare_wait(target);
        assert_eq!(notifier.waiters(target), 1);
        notifier.cancel_wait(ticket);
        assert_eq!(notifier.waiters(target), 0);
        assert!(notifier.channels.lock().is_empty());
    }

    #[test]
    fn notify_without_waiters_is_a_no_op() {
        let notifier = SpinNotifier::new();
        notifier.notify_all(WaitTarget::Page(0x3000));
        assert_eq!(notifier.waiters(WaitTarget::Page(0x3000)), 0);
    }

    #[test]
    #[should_panic]
    fn double_publish_is_fatal() {
        let notifier = SpinNotifier::new();
        let target = WaitTarget::Page(0x4000);
        notifier.publish(target, "page");
        notifier.publish(target, "page");
    }
}
