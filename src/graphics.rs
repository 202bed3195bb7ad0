// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seams to the graphics layer.
//!
//! Decoded pictures land in client textures; before a picture buffer can be
//! handed back to the component the GPU must be done reading it, which is
//! gated by a fence polled from the control thread. All of this is platform
//! plumbing (EGL on ChromeOS) and stays behind these traits.

use crate::Resolution;

/// Texture target the client binds picture buffers to.
pub const TEXTURE_TARGET_2D: u32 = 0x0de1;

/// A fence inserted into the GPU command stream at creation time.
pub trait GpuFence: Send {
    /// True once every command issued before the fence has completed.
    /// Must not block.
    fn is_signaled(&self) -> bool;
}

/// Opaque handle to an external GPU image bound to a picture-buffer texture.
/// Dropping the handle releases the image.
pub trait ExternalImage {}

pub trait GraphicsContext {
    /// Makes the context current on the calling thread.
    fn make_current(&self) -> anyhow::Result<()>;

    /// Creates a fence in the current command stream.
    fn create_fence(&self) -> anyhow::Result<Box<dyn GpuFence>>;

    /// Translates a client texture into an external image the component can
    /// decode into.
    fn import_texture(
        &self,
        texture_id: u32,
        size: Resolution,
    ) -> anyhow::Result<Box<dyn ExternalImage>>;
}
