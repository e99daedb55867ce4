use cfg_if::cfg_if;

#[cfg(target_arch = "loongarch64")]
use loongArch64::register::crmd;
#[cfg(target_arch = "riscv64")]
use riscv::register::sstatus;

pub mod spin_mutex;

use spin_mutex::SpinMutex;

pub type SpinLock<T> = SpinMutex<T, Spin>;
pub type SpinNoIrqLock<T> = SpinMutex<T, SpinNoIrq>;

/// Low-level support for mutex(spinlock, sleeplock, etc)
pub trait MutexSupport {
    /// Guard data
    type GuardData;
    /// Called before lock() & try_lock()
    fn before_lock() -> Self::GuardData;
    /// Called when MutexGuard dropping
    fn after_unlock(_: &mut Self::GuardData);
}

/// Spin MutexSupport
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}

cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        /// Clears `sstatus.SIE` and returns its previous value.
        fn local_irq_save() -> bool {
            let sie = sstatus::read().sie();
            unsafe {
                sstatus::clear_sie();
            }
            sie
        }

        fn local_irq_enable() {
            unsafe {
                sstatus::set_sie();
            }
        }
    } else if #[cfg(target_arch = "loongarch64")] {
        /// Clears `crmd.IE` and returns its previous value.
        fn local_irq_save() -> bool {
            let ie = crmd::read().ie();
            crmd::set_ie(false);
            ie
        }

        fn local_irq_enable() {
            crmd::set_ie(true);
        }
    } else {
        // Hosted builds have no interrupts to mask.
        fn local_irq_save() -> bool {
            false
        }

        fn local_irq_enable() {}
    }
}

/// Sie Guard
///
/// Saves the interrupt-enable state of the local hart and disables interrupts,
/// restoring the saved state when dropped.
pub struct SieGuard(bool);

impl SieGuard {
    fn new() -> Self {
        Self(local_irq_save())
    }
}

impl Drop for SieGuard {
    fn drop(&mut self) {
        if self.0 {
            local_irq_enable();
        }
    }
}

/// SpinNoIrq MutexSupport
#[derive(Debug)]
pub struct SpinNoIrq;

impl MutexSupport for SpinNoIrq {
    type GuardData = SieGuard;
    #[inline(always)]
    fn before_lock() -> Self::GuardData {
        SieGuard::new()
    }
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}
