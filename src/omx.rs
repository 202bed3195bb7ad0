// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types and traits modelling the OpenMAX-IL decoder component consumed by
//! the session coordinator.
//!
//! The actual IL library binding lives outside this crate; implementations
//! of [`Core`] and [`Component`] adapt it to these traits. Buffer headers
//! are plain data here: the per-buffer book-keeping the IL spec routes
//! through the header's `pAppPrivate` pointer is instead kept in
//! coordinator-side tables keyed by [`BufferId`], and the input payload is
//! handed over explicitly on submission.

use std::sync::Arc;

use thiserror::Error;

use crate::shm::MappedRegion;

pub type PortIndex = u32;

/// Identifies one buffer header for the lifetime of its allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

/// Subset of the IL `nFlags` bitfield carried on buffer headers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// The buffer is the last one of the stream.
    pub const EOS: BufferFlags = BufferFlags(1);

    pub fn empty() -> BufferFlags {
        BufferFlags(0)
    }

    pub fn contains(self, flags: BufferFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn insert(&mut self, flags: BufferFlags) {
        self.0 |= flags.0;
    }

    pub fn remove(&mut self, flags: BufferFlags) {
        self.0 &= !flags.0;
    }
}

/// One buffer header as exchanged with the component.
///
/// The `timestamp` field doubles as the carrier for the bitstream-buffer id:
/// it is stamped on input submission and the component copies it onto the
/// header of every output produced from that input. This is the only
/// ordering channel across the component and is a hard contract with it.
#[derive(Clone, Debug)]
pub struct BufferHeader {
    pub id: BufferId,
    pub port: PortIndex,
    pub flags: BufferFlags,
    pub timestamp: i64,
    pub filled_len: usize,
    pub alloc_len: usize,
}

/// States of the component's own lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OmxState {
    Invalid,
    Loaded,
    Idle,
    Executing,
    Pause,
    WaitForResources,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Uncompressed color formats a video port can produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorFormat {
    Yuv420SemiPlanar,
    Yuv420Planar,
}

impl From<ColorFormat> for crate::PixelFormat {
    fn from(format: ColorFormat) -> Self {
        match format {
            ColorFormat::Yuv420SemiPlanar => crate::PixelFormat::Nv12,
            ColorFormat::Yuv420Planar => crate::PixelFormat::I420,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoPortFormat {
    pub frame_width: u32,
    pub frame_height: u32,
    pub color_format: ColorFormat,
}

/// Definition of one component port, as read and written through the
/// component's parameter interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: PortIndex,
    pub direction: PortDirection,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: usize,
    pub video: VideoPortFormat,
}

/// Number and starting index of a component's video ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub count: u32,
    pub start: PortIndex,
}

/// Commands issued to the component. Completion is reported asynchronously
/// through [`Event::CommandComplete`] carrying the same value (with
/// `SetState` carrying the state actually reached).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetState(OmxState),
    PortDisable(PortIndex),
    PortEnable(PortIndex),
    Flush(PortIndex),
}

/// Which aspect of a port's settings the component renegotiated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortSettings {
    Definition,
    OutputCrop,
    Scale,
}

/// Events delivered through [`ComponentCallbacks::event`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    CommandComplete(Command),
    PortSettingsChanged { port: PortIndex, what: PortSettings },
    BufferFlag { port: PortIndex, flags: BufferFlags },
    Error(OmxError),
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum OmxError {
    #[error("undefined component failure")]
    Undefined,
    #[error("no component implements the requested role")]
    ComponentNotFound,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("bad parameter")]
    BadParameter,
    #[error("operation not allowed in the current state")]
    IncorrectStateOperation,
    #[error("invalid state transition requested")]
    IncorrectStateTransition,
    #[error("component entered the invalid state")]
    InvalidState,
    #[error("hardware failure")]
    Hardware,
}

pub type OmxResult<T> = std::result::Result<T, OmxError>;

/// Callbacks a component invokes from its own thread.
///
/// Implementations must not inspect coordinator state; each callback does
/// exactly one thing, posting its arguments to the control thread. This
/// yields a total order of component observations there.
pub trait ComponentCallbacks: Send + Sync {
    fn event(&self, event: Event);
    fn empty_buffer_done(&self, header: BufferHeader);
    fn fill_buffer_done(&self, header: BufferHeader);
}

/// Handle to one component instance.
pub trait Component {
    /// Reports the range of video ports the component exposes.
    fn video_ports(&self) -> OmxResult<PortRange>;

    fn port_definition(&self, port: PortIndex) -> OmxResult<PortDefinition>;

    fn set_port_definition(&self, definition: &PortDefinition) -> OmxResult<()>;

    /// Selects which of its roles the component should assume.
    fn set_role(&self, role: &str) -> OmxResult<()>;

    fn send_command(&self, command: Command) -> OmxResult<()>;

    /// Registers a caller-backed buffer with `port` and returns its header.
    /// For input ports the backing bytes are supplied later, on each
    /// [`Component::empty_this_buffer`] call.
    fn use_buffer(&self, port: PortIndex, size: usize) -> OmxResult<BufferHeader>;

    /// Has the component allocate a buffer of its own on `port`.
    fn allocate_buffer(&self, port: PortIndex, size: usize) -> OmxResult<BufferHeader>;

    /// Releases a buffer. The header must not be referenced afterwards; the
    /// signature consumes it.
    fn free_buffer(&self, port: PortIndex, header: BufferHeader) -> OmxResult<()>;

    /// Submits an input buffer. `payload` carries the mapped bitstream bytes
    /// for the interval until the header returns through
    /// [`ComponentCallbacks::empty_buffer_done`]; it is `None` only for the
    /// zero-length end-of-stream marker.
    fn empty_this_buffer(
        &self,
        header: BufferHeader,
        payload: Option<Arc<dyn MappedRegion>>,
    ) -> OmxResult<()>;

    /// Hands an output buffer to the component to be filled with a decoded
    /// picture, returned through [`ComponentCallbacks::fill_buffer_done`].
    fn fill_this_buffer(&self, header: BufferHeader) -> OmxResult<()>;
}

/// Entry points of the component library.
pub trait Core {
    type Component: Component;

    fn init(&self) -> OmxResult<()>;

    fn deinit(&self) -> OmxResult<()>;

    /// Names of the components implementing `role`, best first.
    fn components_of_role(&self, role: &str) -> OmxResult<Vec<String>>;

    fn get_handle(
        &self,
        name: &str,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> OmxResult<Self::Component>;

    fn free_handle(&self, component: Self::Component) -> OmxResult<()>;
}

/// H.264 profiles as the IL interface names them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AvcProfile {
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_flags() {
        let mut flags = BufferFlags::empty();
        assert!(!flags.contains(BufferFlags::EOS));

        flags.insert(BufferFlags::EOS);
        assert!(flags.contains(BufferFlags::EOS));

        flags.remove(BufferFlags::EOS);
        assert!(!flags.contains(BufferFlags::EOS));
    }
}
