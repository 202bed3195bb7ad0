// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-facing surface of the decode session.
//!
//! The types here cross the boundary between the embedder and the
//! coordinator: bitstream buffers going in, decoded pictures coming out, and
//! the [`Client`] trait through which every asynchronous notification is
//! delivered. All callbacks fire on the control thread.

pub mod accelerator;
pub mod buffers;
pub mod control;
pub mod session;

use std::fmt;

use thiserror::Error;

use crate::shm::SharedMemoryHandle;
use crate::Resolution;
use crate::VideoProfile;

/// Errors surfaced to the client. These are the only kinds visible at the
/// boundary; any component-call failure, invariant violation or dispatch
/// mismatch maps onto one of them and ends the session.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("operation called in an illegal state")]
    IllegalState,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("input buffer could not be read")]
    UnreadableInput,
    #[error("platform failure")]
    PlatformFailure,
}

/// Session configuration.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub profile: VideoProfile,
}

/// One unit of compressed input, identified by a client-chosen id.
pub struct BitstreamBuffer {
    pub id: i32,
    pub memory: Option<Box<dyn SharedMemoryHandle>>,
    pub size: usize,
}

impl BitstreamBuffer {
    pub fn new(id: i32, memory: Box<dyn SharedMemoryHandle>, size: usize) -> Self {
        Self { id, memory: Some(memory), size }
    }

    /// The end-of-stream marker: id `-1`, no backing memory, zero length.
    pub fn end_of_stream() -> Self {
        Self { id: -1, memory: None, size: 0 }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.id == -1 && self.size == 0
    }
}

impl fmt::Debug for BitstreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitstreamBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// A client-owned texture the component decodes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureBuffer {
    pub id: i32,
    pub texture_id: u32,
    pub size: Resolution,
}

/// A decoded frame: which picture buffer holds it and which bitstream buffer
/// produced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub picture_buffer_id: i32,
    pub bitstream_buffer_id: i32,
}

/// Notifications delivered to the embedder, always on the control thread.
/// No callback fires after an error was reported or after the session was
/// destroyed.
pub trait Client {
    /// Asks the client to allocate `requested_num` picture buffers of
    /// `dimensions` and hand them back through
    /// [`DecodeSession::assign_picture_buffers`].
    ///
    /// [`DecodeSession::assign_picture_buffers`]:
    ///     crate::DecodeSession::assign_picture_buffers
    fn provide_picture_buffers(
        &self,
        requested_num: u32,
        format: crate::PixelFormat,
        planes: u32,
        dimensions: Resolution,
        texture_target: u32,
    );

    fn picture_ready(&self, picture: Picture);

    /// The input identified by `bitstream_buffer_id` has been fully consumed
    /// and its memory may be reused.
    fn notify_end_of_bitstream_buffer(&self, bitstream_buffer_id: i32);

    fn notify_flush_done(&self);

    fn notify_reset_done(&self);

    fn notify_initialization_complete(&self, success: bool);

    fn notify_error(&self, error: DecodeError);

    /// The picture buffer will not be written to again and may be released.
    fn dismiss_picture_buffer(&self, picture_buffer_id: i32);
}

/// One profile the decoder advertises.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SupportedProfile {
    pub profile: VideoProfile,
    pub min_resolution: Resolution,
    pub max_resolution: Resolution,
    pub encrypted_only: bool,
}

/// Profiles this decoder accepts. The H.264 alias profiles that merely run
/// with High444 resources are not advertised.
pub fn supported_profiles() -> Vec<SupportedProfile> {
    const PROFILES: [VideoProfile; 8] = [
        VideoProfile::H264Baseline,
        VideoProfile::H264Main,
        VideoProfile::H264Extended,
        VideoProfile::H264High,
        VideoProfile::H264High10,
        VideoProfile::H264High422,
        VideoProfile::H264High444Predictive,
        VideoProfile::Vp8,
    ];

    PROFILES
        .iter()
        .map(|&profile| SupportedProfile {
            profile,
            min_resolution: Resolution::from((16, 16)),
            max_resolution: Resolution::from((1920, 1080)),
            encrypted_only: false,
        })
        .collect()
}
