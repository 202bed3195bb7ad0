// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seams to the shared-memory transport carrying compressed input.
//!
//! Bitstream buffers arrive as handles to client-owned shared memory. The
//! coordinator imports a handle when it submits the buffer and keeps the
//! mapping alive until the component returns the corresponding input header.

use std::sync::Arc;

/// Read-only view of an imported shared-memory region.
pub trait MappedRegion: Send + Sync {
    fn as_bytes(&self) -> &[u8];
}

/// Handle to client-provided shared memory.
pub trait SharedMemoryHandle: Send {
    /// Maps `size` bytes of the region.
    fn map(&self, size: usize) -> anyhow::Result<Arc<dyn MappedRegion>>;
}
