//! Asynchronous Call Dispatcher, for callers running on an async executor.
//!
//! Behaves exactly as [`Device::call()`] and [`Device::call_pipelined()`],
//! except that polling delays and lock retries are awaited using the
//! supplied [`AsyncDelay`], and the blocking strategy awaits
//! [`AsyncCompletionEvent::wait_async()`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::envelope::CommandType;
use crate::port::{AsyncCompletionEvent, AsyncDelay, Delay};
use crate::regfile::SharedIo;
use crate::{Error, Result};

use super::call::Pipeline;
use super::{Completion, Device, LockPolicy, Reply, Request};

impl<I: SharedIo, E: AsyncCompletionEvent, D: Delay> Device<I, E, D> {
    /// Send one request and await its reply.  See [`Device::call()`].
    pub async fn call_async<A: AsyncDelay>(
        &self,
        delay: &A,
        command_type: CommandType,
        command_subid: u8,
        payload: &[u8],
    ) -> Result<Reply> {
        let request = Request::new(command_type, command_subid, payload);
        let mut replies = [Err(Error::Timeout)];
        self.call_pipelined_async(delay, &[request], &mut replies)
            .await?;
        replies[0]
    }

    /// Send several requests and await their replies.  See
    /// [`Device::call_pipelined()`].
    pub async fn call_pipelined_async<A: AsyncDelay>(
        &self,
        delay: &A,
        requests: &[Request<'_>],
        replies: &mut [Result<Reply>],
    ) -> Result<()> {
        self.check_requests(requests, replies)?;
        let _guard = self.lock_async(delay).await?;
        self.check_ready()?;

        let mut pipeline = Pipeline::new();
        let result = self
            .run_pipeline_async(delay, requests, replies, &mut pipeline)
            .await;
        self.finish(result, requests.len(), replies, &mut pipeline)
    }
}

// Internal functions
impl<I: SharedIo, E: AsyncCompletionEvent, D: Delay> Device<I, E, D> {
    async fn lock_async<A: AsyncDelay>(&self, delay: &A) -> Result<spin::MutexGuard<'_, ()>> {
        let LockPolicy { attempts, retry_us } = self.config.lock;
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            if let Some(guard) = self.call_lock.try_lock() {
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                delay.delay_us(retry_us).await;
            }
        }
        debug!("Device {} call lock busy", self.config.instance_id);
        Err(Error::Busy)
    }

    async fn run_pipeline_async<A: AsyncDelay>(
        &self,
        delay: &A,
        requests: &[Request<'_>],
        replies: &mut [Result<Reply>],
        pipeline: &mut Pipeline,
    ) -> Result<()> {
        loop {
            self.submit_while_room(requests, replies, pipeline)?;
            if pipeline.is_idle() {
                return Ok(());
            }

            let progress = match self.config.completion {
                Completion::Polling {
                    interval_us,
                    max_polls,
                } => {
                    self.poll_until_any_async(delay, pipeline, replies, interval_us, max_polls)
                        .await?
                }
                Completion::Blocking { timeout_ms } => {
                    self.wait_until_any_async(pipeline, replies, timeout_ms)
                        .await?
                }
            };

            if !progress {
                self.abandon_all(pipeline, replies, requests.len())?;
                return Ok(());
            }
        }
    }

    async fn poll_until_any_async<A: AsyncDelay>(
        &self,
        delay: &A,
        pipeline: &mut Pipeline,
        replies: &mut [Result<Reply>],
        interval_us: u32,
        max_polls: u32,
    ) -> Result<bool> {
        for poll in 0..=max_polls {
            if self.collect(pipeline, replies)? > 0 {
                return Ok(true);
            }
            if poll == max_polls {
                break;
            }
            trace!("Device {} async poll {poll}", self.config.instance_id);
            delay.delay_us(interval_us).await;
        }
        Ok(false)
    }

    async fn wait_until_any_async(
        &self,
        pipeline: &mut Pipeline,
        replies: &mut [Result<Reply>],
        timeout_ms: u32,
    ) -> Result<bool> {
        loop {
            if self.collect(pipeline, replies)? > 0 {
                return Ok(true);
            }
            if !self.event.wait_async(timeout_ms).await {
                return Ok(self.collect(pipeline, replies)? > 0);
            }
        }
    }
}
