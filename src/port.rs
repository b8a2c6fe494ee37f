//! Traits for the RTOS and BSP services the transport consumes.
//!
//! The transport does not depend on any particular scheduler.  The
//! application provides:
//!
//! - a [`Delay`] for the polling completion strategy and lock retries
//! - a [`CompletionEvent`] for the blocking completion strategy, signalled
//!   from the inbound interrupt
//! - an [`InterruptController`] to install and mask the inbound doorbell
//!   interrupt
//!
//! With the `async` feature, [`AsyncDelay`] and [`AsyncCompletionEvent`] are
//! the equivalents used by [`crate::device::Device::call_async()`].
//!
//! # Possible implementations
//!
//! - FreeRTOS: `vTaskDelay`/busy-wait microsecond delay, a binary semaphore
//!   given from the ISR for the completion event, the GIC driver for the
//!   interrupt controller
//! - Bare metal: a timer-based busy-wait delay, an atomic flag with
//!   `wfi`-based wait for the completion event
//! - Embassy: `Timer::after_micros()` for [`AsyncDelay`], a `Signal` with
//!   `with_timeout()` for [`AsyncCompletionEvent`]

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Delay primitive.
pub trait Delay {
    /// Busy-wait or sleep for at least `us` microseconds.
    fn delay_us(&self, us: u32);
}

impl<T: Delay + ?Sized> Delay for &T {
    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

/// Binary completion event.
///
/// Created by the application before the device instance, destroyed when
/// dropped.  [`Self::signal()`] is called from interrupt context and must not
/// block.
pub trait CompletionEvent {
    /// Wait until signalled, or `timeout_ms` elapses.
    ///
    /// Consumes the signal.  Returns `false` on timeout.
    fn wait(&self, timeout_ms: u32) -> bool;

    /// Set the event, waking any waiter.
    fn signal(&self);
}

/// Completion event for instances that only use polling completion.
///
/// Never signalled; waiting on it times out immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvent;

impl CompletionEvent for NoEvent {
    fn wait(&self, _timeout_ms: u32) -> bool {
        false
    }

    fn signal(&self) {}
}

/// Interrupt controller registration.
pub trait InterruptController {
    /// The error type returned by controller operations.
    ///
    /// This allows implementations to use their own error types.
    type Error: core::fmt::Debug;

    /// Route `vector` to the device's interrupt handler at `priority`.
    ///
    /// The installed handler must call
    /// [`crate::device::Device::handle_interrupt()`] for the device instance.
    fn install(&mut self, vector: u32, priority: u32) -> Result<(), Self::Error>;

    fn unmask(&mut self, vector: u32) -> Result<(), Self::Error>;

    fn mask(&mut self, vector: u32) -> Result<(), Self::Error>;
}

/// Yield delay for async polling loops.
///
/// This trait keeps `vdev-msg` free of any specific async runtime.
///
/// Example:
///
/// ```rust,ignore
/// use embassy_time::Timer;
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay_us(&self, us: u32) {
///         Timer::after_micros(us as u64).await;
///     }
/// }
/// ```
#[cfg(feature = "async")]
pub trait AsyncDelay {
    fn delay_us(&self, us: u32) -> impl Future<Output = ()>;
}

#[cfg(feature = "async")]
pub use futures::AsyncCompletionEvent;

#[cfg(feature = "async")]
mod futures {
    use alloc::boxed::Box;
    use async_trait::async_trait;

    use super::{CompletionEvent, NoEvent};

    /// Completion event that can also be awaited.
    ///
    /// Signalling is shared with [`CompletionEvent`], so the same interrupt
    /// path wakes both synchronous and asynchronous callers.
    #[async_trait(?Send)]
    pub trait AsyncCompletionEvent: CompletionEvent {
        /// Wait until signalled, or `timeout_ms` elapses.
        ///
        /// Consumes the signal.  Returns `false` on timeout.
        async fn wait_async(&self, timeout_ms: u32) -> bool;
    }

    #[async_trait(?Send)]
    impl AsyncCompletionEvent for NoEvent {
        async fn wait_async(&self, _timeout_ms: u32) -> bool {
            false
        }
    }
}
