// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accounting for the two buffer populations of a decode session.
//!
//! The input side tracks component-registered headers cycling between a free
//! list and the component, plus the side-channel data owned for each
//! in-flight submission. The output side tracks the fake buffers used to
//! prime the component before port renegotiation and the real pictures
//! provided by the client. Both sides keep the per-header state the IL
//! interface would stash behind the header's private pointer in tables keyed
//! by [`BufferId`], so a returning header is classified by lookup instead of
//! by pointer chasing.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::decoder::PictureBuffer;
use crate::graphics::ExternalImage;
use crate::omx::BufferHeader;
use crate::omx::BufferId;
use crate::shm::MappedRegion;

#[derive(Debug, Error)]
pub enum BookkeepingError {
    #[error("input buffer returned with none outstanding")]
    InputCountUnderflow,
    #[error("output buffer returned with none outstanding")]
    OutputCountUnderflow,
    #[error("output buffer {0:?} is not bound to any picture")]
    UnknownOutputHeader(BufferId),
    #[error("picture {0} is not registered")]
    UnknownPicture(i32),
    #[error("picture {0} is already registered")]
    DuplicatePicture(i32),
    #[error("picture {0} is already at the component")]
    HeaderNotResident(i32),
    #[error("picture {0} already holds a header")]
    HeaderAlreadyResident(i32),
}

/// Side-channel for one in-flight input buffer: the imported memory that owns
/// the submitted bytes and the client's id for them. Owned by the coordinator
/// from submission until the header returns.
pub struct InputContext {
    _mapping: Arc<dyn MappedRegion>,
    bitstream_id: i32,
}

impl InputContext {
    pub fn new(mapping: Arc<dyn MappedRegion>, bitstream_id: i32) -> Self {
        Self { _mapping: mapping, bitstream_id }
    }

    pub fn bitstream_id(&self) -> i32 {
        self.bitstream_id
    }
}

/// The input-side population: `free.len() + at_component == capacity` holds
/// between control-thread tasks.
#[derive(Default)]
pub struct InputBufferPool {
    free: VecDeque<BufferHeader>,
    at_component: usize,
    contexts: BTreeMap<BufferId, InputContext>,
    capacity: usize,
}

impl InputBufferPool {
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Adds a newly registered header to the free list.
    pub fn push_free(&mut self, header: BufferHeader) {
        self.free.push_back(header);
    }

    /// Draws the next free header, FIFO.
    pub fn take_free(&mut self) -> Option<BufferHeader> {
        self.free.pop_front()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn at_component(&self) -> usize {
        self.at_component
    }

    /// Records a submission. `context` is `None` only for the end-of-stream
    /// marker, which carries no client bytes.
    pub fn submitted(&mut self, header_id: BufferId, context: Option<InputContext>) {
        self.at_component += 1;
        if let Some(context) = context {
            self.contexts.insert(header_id, context);
        }
    }

    /// Takes back a returned header, releasing its side-channel entry if it
    /// had one.
    pub fn returned(
        &mut self,
        header: BufferHeader,
    ) -> Result<Option<InputContext>, BookkeepingError> {
        if self.at_component == 0 {
            return Err(BookkeepingError::InputCountUnderflow);
        }
        self.at_component -= 1;
        let context = self.contexts.remove(&header.id);
        self.free.push_back(header);
        Ok(context)
    }

    pub fn is_balanced(&self) -> bool {
        self.free.len() + self.at_component == self.capacity
    }
}

struct OutputPicture {
    picture_buffer: PictureBuffer,
    /// The bound component header; `None` while the component holds it.
    header: Option<BufferHeader>,
    _image: Box<dyn ExternalImage>,
}

/// The output-side population: the pre-renegotiation fake buffers and the
/// client-provided real pictures, with the reverse header-to-picture table
/// used to classify returning buffers.
#[derive(Default)]
pub struct OutputRegistry {
    fakes: BTreeMap<BufferId, BufferHeader>,
    pictures: BTreeMap<i32, OutputPicture>,
    header_to_picture: BTreeMap<BufferId, i32>,
    at_component: usize,
}

impl OutputRegistry {
    pub fn add_fake(&mut self, header: BufferHeader) {
        self.fakes.insert(header.id, header);
    }

    pub fn is_fake(&self, id: BufferId) -> bool {
        self.fakes.contains_key(&id)
    }

    pub fn fake_count(&self) -> usize {
        self.fakes.len()
    }

    /// Snapshot of the fake headers, for submission.
    pub fn fake_headers(&self) -> Vec<BufferHeader> {
        self.fakes.values().cloned().collect()
    }

    /// Removes a fake buffer for good. Retired fakes are never re-enqueued.
    pub fn retire_fake(&mut self, id: BufferId) -> Option<BufferHeader> {
        self.fakes.remove(&id)
    }

    pub fn drain_fakes(&mut self) -> Vec<BufferHeader> {
        std::mem::take(&mut self.fakes).into_values().collect()
    }

    pub fn register_picture(
        &mut self,
        picture_buffer: PictureBuffer,
        image: Box<dyn ExternalImage>,
    ) -> Result<(), BookkeepingError> {
        let id = picture_buffer.id;
        if self.pictures.contains_key(&id) {
            return Err(BookkeepingError::DuplicatePicture(id));
        }
        self.pictures.insert(id, OutputPicture { picture_buffer, header: None, _image: image });
        Ok(())
    }

    pub fn picture_count(&self) -> usize {
        self.pictures.len()
    }

    pub fn picture_ids(&self) -> Vec<i32> {
        self.pictures.keys().copied().collect()
    }

    /// Binds a freshly registered component header to `picture_id`.
    pub fn bind_header(
        &mut self,
        picture_id: i32,
        header: BufferHeader,
    ) -> Result<(), BookkeepingError> {
        let picture = self
            .pictures
            .get_mut(&picture_id)
            .ok_or(BookkeepingError::UnknownPicture(picture_id))?;
        if picture.header.is_some() {
            return Err(BookkeepingError::HeaderAlreadyResident(picture_id));
        }
        self.header_to_picture.insert(header.id, picture_id);
        picture.header = Some(header);
        Ok(())
    }

    /// Takes the resident header of `picture_id` for submission.
    pub fn take_header(&mut self, picture_id: i32) -> Result<BufferHeader, BookkeepingError> {
        let picture = self
            .pictures
            .get_mut(&picture_id)
            .ok_or(BookkeepingError::UnknownPicture(picture_id))?;
        picture.header.take().ok_or(BookkeepingError::HeaderNotResident(picture_id))
    }

    /// Stores a returned header back into its picture slot and reports which
    /// picture it belongs to.
    pub fn restore_header(&mut self, header: BufferHeader) -> Result<i32, BookkeepingError> {
        let picture_id = *self
            .header_to_picture
            .get(&header.id)
            .ok_or(BookkeepingError::UnknownOutputHeader(header.id))?;
        let picture = self
            .pictures
            .get_mut(&picture_id)
            .ok_or(BookkeepingError::UnknownPicture(picture_id))?;
        if picture.header.is_some() {
            return Err(BookkeepingError::HeaderAlreadyResident(picture_id));
        }
        picture.header = Some(header);
        Ok(picture_id)
    }

    pub fn submitted(&mut self) {
        self.at_component += 1;
        debug_assert!(self.at_component <= self.fakes.len() + self.pictures.len());
    }

    pub fn returned(&mut self) -> Result<(), BookkeepingError> {
        if self.at_component == 0 {
            return Err(BookkeepingError::OutputCountUnderflow);
        }
        self.at_component -= 1;
        Ok(())
    }

    pub fn at_component(&self) -> usize {
        self.at_component
    }

    /// Empties the picture table for the teardown sweep, handing back each
    /// picture id and its resident header (if the component returned it).
    /// The external images are released here.
    pub fn drain_pictures(&mut self) -> Vec<(i32, Option<BufferHeader>)> {
        self.header_to_picture.clear();
        std::mem::take(&mut self.pictures)
            .into_values()
            .map(|picture| (picture.picture_buffer.id, picture.header))
            .collect()
    }
}
