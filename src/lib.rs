// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session coordinator for OpenMAX-IL video decode components.
//!
//! This crate drives one hardware decode session: the client submits
//! compressed bitstream buffers and recycles decoded picture buffers, while
//! the underlying component consumes inputs, emits outputs and reports
//! lifecycle changes asynchronously from its own callback thread. The
//! coordinator serializes those callbacks onto a single control thread,
//! keeps strict accounting of both buffer populations, and sequences the
//! initialize/flush/reset/destroy handshakes against the component.
//!
//! The component itself, the GPU context and the shared-memory transport are
//! consumed through the traits in [`omx`], [`graphics`] and [`shm`]; this
//! crate contains no hardware bindings.

pub mod decoder;
pub mod graphics;
pub mod omx;
pub mod shm;

pub use decoder::session::DecodeSession;
pub use decoder::supported_profiles;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Pixel formats a decoded picture can be presented in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// One Y and one interleaved UV plane, 4:2:0 sampling, 8 bits per sample.
    Nv12,
    /// Y, U and V planes, 4:2:0 sampling, 8 bits per sample.
    I420,
}

/// Codec profiles a decode session can be configured with.
///
/// The scalable and multiview H.264 profiles have no IL equivalent; sessions
/// configured with them run with High444 component resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoProfile {
    H264Baseline,
    H264Main,
    H264Extended,
    H264High,
    H264High10,
    H264High422,
    H264High444Predictive,
    H264ScalableBaseline,
    H264ScalableHigh,
    H264StereoHigh,
    H264MultiviewHigh,
    Vp8,
}
