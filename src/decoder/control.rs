// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of component callbacks onto the control thread.
//!
//! The component invokes its three callbacks from a thread the coordinator
//! does not own. [`CallbackRouter`] turns each invocation into a
//! [`ControlTask`] posted on the [`ControlQueue`]; the control thread pops
//! tasks in posting order, which matches the order the component delivered
//! them. Nothing else runs on the callback thread, so every state
//! observation is totally ordered without locks around coordinator state.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::graphics::GpuFence;
use crate::omx::BufferHeader;
use crate::omx::ComponentCallbacks;
use crate::omx::Event;

/// One unit of work for the control thread.
pub enum ControlTask {
    Event(Event),
    EmptyBufferDone(BufferHeader),
    FillBufferDone(BufferHeader),
    /// Re-check whether the fence guarding a picture buffer has signaled.
    PictureSync { picture_buffer_id: i32, fence: Box<dyn GpuFence> },
}

impl fmt::Debug for ControlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlTask::Event(event) => f.debug_tuple("Event").field(event).finish(),
            ControlTask::EmptyBufferDone(header) => {
                f.debug_tuple("EmptyBufferDone").field(header).finish()
            }
            ControlTask::FillBufferDone(header) => {
                f.debug_tuple("FillBufferDone").field(header).finish()
            }
            ControlTask::PictureSync { picture_buffer_id, .. } => f
                .debug_struct("PictureSync")
                .field("picture_buffer_id", picture_buffer_id)
                .finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlQueueError {
    #[error("failed to create eventfd for the control queue: {0}")]
    EventFd(Errno),
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<ControlTask>,
    delayed: Vec<(Instant, ControlTask)>,
}

/// Task queue owned by the control thread and posted to from any thread.
///
/// Immediate tasks are popped FIFO; delayed tasks join the ready queue once
/// their deadline passes. The queue never refuses work, which lets the
/// destroy handshake keep flowing while the owning session shuts down.
pub struct ControlQueue {
    event: EventFd,
    inner: Mutex<Inner>,
}

impl ControlQueue {
    pub fn new() -> Result<Self, ControlQueueError> {
        // Semaphore semantics, one count per posted task; nonblocking so
        // draining stops cleanly once the counter reaches zero.
        Ok(Self {
            event: EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)
                .map_err(ControlQueueError::EventFd)?,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn post(&self, task: ControlTask) {
        self.inner.lock().unwrap().ready.push_back(task);
        if let Err(e) = self.event.write(1) {
            log::error!("failed to signal the control queue: {}", e);
        }
    }

    pub fn post_delayed(&self, task: ControlTask, delay: Duration) {
        self.inner.lock().unwrap().delayed.push((Instant::now() + delay, task));
    }

    /// Pops the next task whose time has come, if any.
    pub fn pop_ready(&self) -> Option<ControlTask> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].0 <= now {
                let (_, task) = inner.delayed.remove(i);
                inner.ready.push_back(task);
            } else {
                i += 1;
            }
        }
        inner.ready.pop_front()
    }

    /// Sleeps until a task is posted, a delayed task comes due, or `max_wait`
    /// elapses. Returns immediately if a task is already ready.
    pub fn wait(&self, max_wait: Duration) {
        let timeout = {
            let inner = self.inner.lock().unwrap();
            if !inner.ready.is_empty() {
                return;
            }
            match inner.delayed.iter().map(|(due, _)| *due).min() {
                Some(due) => max_wait.min(due.saturating_duration_since(Instant::now())),
                None => max_wait,
            }
        };

        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(self.event.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)) {
            // Drain the counter; the tasks themselves are popped by the
            // caller.
            Ok(n) if n > 0 => {
                let mut buf = [0u8; 8];
                while nix::unistd::read(self.event.as_fd().as_raw_fd(), &mut buf).is_ok() {}
            }
            Ok(_) => (),
            Err(e) => log::error!("control queue poll failed: {}", e),
        }
    }
}

/// The [`ComponentCallbacks`] implementation handed to the component: each
/// callback posts one task and does nothing else.
pub struct CallbackRouter {
    queue: Arc<ControlQueue>,
}

impl CallbackRouter {
    pub fn new(queue: Arc<ControlQueue>) -> Self {
        Self { queue }
    }
}

impl ComponentCallbacks for CallbackRouter {
    fn event(&self, event: Event) {
        self.queue.post(ControlTask::Event(event));
    }

    fn empty_buffer_done(&self, header: BufferHeader) {
        self.queue.post(ControlTask::EmptyBufferDone(header));
    }

    fn fill_buffer_done(&self, header: BufferHeader) {
        self.queue.post(ControlTask::FillBufferDone(header));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omx::Command;
    use crate::omx::OmxState;

    fn state_event(state: OmxState) -> ControlTask {
        ControlTask::Event(Event::CommandComplete(Command::SetState(state)))
    }

    #[test]
    fn tasks_pop_in_posting_order() {
        let queue = ControlQueue::new().unwrap();
        queue.post(state_event(OmxState::Idle));
        queue.post(state_event(OmxState::Executing));

        assert!(matches!(
            queue.pop_ready(),
            Some(ControlTask::Event(Event::CommandComplete(Command::SetState(OmxState::Idle))))
        ));
        assert!(matches!(
            queue.pop_ready(),
            Some(ControlTask::Event(Event::CommandComplete(Command::SetState(
                OmxState::Executing
            ))))
        ));
        assert!(queue.pop_ready().is_none());
    }

    #[test]
    fn delayed_task_not_ready_until_due() {
        let queue = ControlQueue::new().unwrap();
        queue.post_delayed(state_event(OmxState::Idle), Duration::from_millis(20));

        assert!(queue.pop_ready().is_none());

        std::thread::sleep(Duration::from_millis(25));
        assert!(queue.pop_ready().is_some());
        assert!(queue.pop_ready().is_none());
    }

    #[test]
    fn wait_returns_on_post() {
        let queue = Arc::new(ControlQueue::new().unwrap());
        let poster = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            poster.post(state_event(OmxState::Idle));
        });

        let start = Instant::now();
        while queue.pop_ready().is_none() {
            assert!(start.elapsed() < Duration::from_secs(5));
            queue.wait(Duration::from_millis(50));
        }
        handle.join().unwrap();
    }
}
