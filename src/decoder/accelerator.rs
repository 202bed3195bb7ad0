// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode-session state machine.
//!
//! [`OmxVideoDecoder`] owns the cross-product of the mirrored component
//! state, the in-flight transition and the buffer populations. Every public
//! operation and every serialized component event mutates it from the
//! control thread only; the component's callback thread never touches it.
//!
//! The asynchronous handshakes all flow through the same dispatch: a command
//! is sent, the component confirms it through an event, and the
//! `(transition, reached state)` pair selects the continuation. Anything the
//! table does not name is a protocol violation and ends the session.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::decoder::buffers::InputBufferPool;
use crate::decoder::buffers::InputContext;
use crate::decoder::buffers::OutputRegistry;
use crate::decoder::control::CallbackRouter;
use crate::decoder::control::ControlQueue;
use crate::decoder::control::ControlTask;
use crate::decoder::BitstreamBuffer;
use crate::decoder::Client;
use crate::decoder::Config;
use crate::decoder::DecodeError;
use crate::decoder::Picture;
use crate::decoder::PictureBuffer;
use crate::graphics::GpuFence;
use crate::graphics::GraphicsContext;
use crate::graphics::TEXTURE_TARGET_2D;
use crate::omx::AvcProfile;
use crate::omx::BufferFlags;
use crate::omx::BufferHeader;
use crate::omx::Command;
use crate::omx::Component;
use crate::omx::ComponentCallbacks;
use crate::omx::Core;
use crate::omx::Event;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::omx::OmxState;
use crate::omx::PortDirection;
use crate::omx::PortIndex;
use crate::omx::PortSettings;
use crate::PixelFormat;
use crate::Resolution;
use crate::VideoProfile;

/// Number of picture buffers requested from the client, and of fake output
/// buffers used before the client provides any.
pub const NUM_PICTURE_BUFFERS: usize = 8;

/// Cadence for re-checking an unsignaled picture fence. 5 ms allows a little
/// decode-ahead without starving the control queue.
const SYNC_POLL_DELAY: Duration = Duration::from_millis(5);

/// Coordinator-side mirror of the component lifecycle, advanced only on
/// confirmed state-reached events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentState {
    /// No component handle acquired yet.
    Unloaded,
    Loaded,
    Idle,
    Executing,
    Paused,
    Invalid,
    /// The handle was released; the component is unreachable.
    Terminated,
}

/// Intent in flight across the component boundary. Exactly one is active at
/// a time; `None` means the session is quiescent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    Initializing,
    Flushing,
    Resetting,
    Destroying,
    Erroring,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    H264(AvcProfile),
    Vp8,
}

/// Outcome of [`OmxVideoDecoder::begin_destroy`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DestroyDisposition {
    /// Nothing left to drain; the coordinator can be dropped now.
    Finished,
    /// The asynchronous handshake is running; keep the coordinator parked
    /// until the component handle clears.
    Pending,
}

/// Maps an H.264 codec profile to the IL profile the component is driven
/// with. Profiles above High444 have no IL equivalent; components size them
/// like High profile, so they run as High444.
fn map_h264_profile(profile: VideoProfile) -> Option<AvcProfile> {
    match profile {
        VideoProfile::H264Baseline => Some(AvcProfile::Baseline),
        VideoProfile::H264Main => Some(AvcProfile::Main),
        VideoProfile::H264Extended => Some(AvcProfile::Extended),
        VideoProfile::H264High => Some(AvcProfile::High),
        VideoProfile::H264High10 => Some(AvcProfile::High10),
        VideoProfile::H264High422 => Some(AvcProfile::High422),
        VideoProfile::H264High444Predictive => Some(AvcProfile::High444),
        VideoProfile::H264ScalableBaseline
        | VideoProfile::H264ScalableHigh
        | VideoProfile::H264StereoHigh
        | VideoProfile::H264MultiviewHigh => Some(AvcProfile::High444),
        VideoProfile::Vp8 => None,
    }
}

fn role_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264(_) => "video_decoder.avc",
        Codec::Vp8 => "video_decoder.vpx",
    }
}

struct PortConfig {
    input_port: PortIndex,
    output_port: PortIndex,
    input_buffer_count: usize,
    input_buffer_size: usize,
}

pub struct OmxVideoDecoder<G, R>
where
    G: GraphicsContext,
    R: Core,
{
    queue: Arc<ControlQueue>,
    graphics: G,
    core: R,
    component: Option<R::Component>,
    client: Option<Rc<dyn Client>>,
    /// Whether initialize() got far enough that errors must be reported.
    init_begun: bool,
    component_state: ComponentState,
    transition: Transition,
    codec: Option<Codec>,
    input_port: PortIndex,
    output_port: PortIndex,
    input_buffer_count: usize,
    input_buffer_size: usize,
    inputs: InputBufferPool,
    outputs: OutputRegistry,
    queued_bitstream_buffers: VecDeque<BitstreamBuffer>,
    queued_picture_ids: VecDeque<i32>,
    last_requested_picture_size: Resolution,
}

impl<G, R> OmxVideoDecoder<G, R>
where
    G: GraphicsContext,
    R: Core,
{
    pub(crate) fn new(graphics: G, core: R, queue: Arc<ControlQueue>) -> Result<Self, DecodeError> {
        if let Err(e) = core.init() {
            log::error!("failed to initialize the component core: {}", e);
            return Err(DecodeError::PlatformFailure);
        }
        Ok(Self {
            queue,
            graphics,
            core,
            component: None,
            client: None,
            init_begun: false,
            component_state: ComponentState::Unloaded,
            transition: Transition::None,
            codec: None,
            input_port: 0,
            output_port: 0,
            input_buffer_count: 0,
            input_buffer_size: 0,
            inputs: InputBufferPool::default(),
            outputs: OutputRegistry::default(),
            queued_bitstream_buffers: VecDeque::new(),
            queued_picture_ids: VecDeque::new(),
            last_requested_picture_size: Resolution::default(),
        })
    }

    pub(crate) fn initialize(&mut self, config: Config, client: Rc<dyn Client>) -> bool {
        let codec = match config.profile {
            VideoProfile::Vp8 => Codec::Vp8,
            profile => match map_h264_profile(profile) {
                Some(avc) => Codec::H264(avc),
                None => {
                    log::error!("unsupported profile: {:?}", profile);
                    self.stop_on_error(DecodeError::InvalidArgument);
                    return false;
                }
            },
        };
        self.codec = Some(codec);

        // The context must be current for external-image binding later on.
        if let Err(e) = self.graphics.make_current() {
            log::error!("failed to make the GPU context current: {:#}", e);
            self.stop_on_error(DecodeError::PlatformFailure);
            return false;
        }

        self.client = Some(client);

        // Does its own stop_on_error dances.
        if !self.create_component() {
            return false;
        }

        debug_assert_eq!(self.transition, Transition::None);
        self.transition = Transition::Initializing;
        self.begin_transition(OmxState::Idle);

        // Buffers must be registered while the Loaded-to-Idle transition is
        // pending.
        if !self.allocate_input_buffers() {
            return false;
        }
        if !self.allocate_fake_output_buffers() {
            return false;
        }

        self.init_begun = true;
        true
    }

    fn create_component(&mut self) -> bool {
        let role = match self.codec {
            Some(codec) => role_name(codec),
            None => {
                log::error!("no codec configured");
                self.stop_on_error(DecodeError::PlatformFailure);
                return false;
            }
        };
        let callbacks: Arc<dyn ComponentCallbacks> =
            Arc::new(CallbackRouter::new(Arc::clone(&self.queue)));

        let names = match self.core.components_of_role(role) {
            Ok(names) => names,
            Err(e) => {
                log::error!("unsupported role {}: {}", role, e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return false;
            }
        };
        let name = match names.first() {
            Some(name) => name.clone(),
            None => {
                log::error!("no components for role {}", role);
                self.stop_on_error(DecodeError::PlatformFailure);
                return false;
            }
        };

        match self.core.get_handle(&name, callbacks) {
            Ok(component) => self.component = Some(component),
            Err(e) => {
                log::error!("failed to get a handle on {}: {}", name, e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return false;
            }
        }
        self.component_state = ComponentState::Loaded;

        let config = match self.component.as_ref() {
            Some(component) => Self::configure_ports(component, role),
            None => Err(OmxError::IncorrectStateOperation),
        };
        match config {
            Ok(config) => {
                self.input_port = config.input_port;
                self.output_port = config.output_port;
                self.input_buffer_count = config.input_buffer_count;
                self.input_buffer_size = config.input_buffer_size;
                self.inputs.set_capacity(config.input_buffer_count);
                true
            }
            Err(e) => {
                log::error!("component port setup failed: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                false
            }
        }
    }

    fn configure_ports(component: &R::Component, role: &str) -> OmxResult<PortConfig> {
        let ports = component.video_ports()?;
        if ports.count != 2 {
            return Err(OmxError::BadParameter);
        }
        let input_port = ports.start;
        let output_port = input_port + 1;

        // Components can implement several roles; pin the one we resolved.
        component.set_role(role)?;

        let input = component.port_definition(input_port)?;
        if input.direction != PortDirection::Input {
            return Err(OmxError::BadParameter);
        }

        let mut output = component.port_definition(output_port)?;
        if output.direction != PortDirection::Output {
            return Err(OmxError::BadParameter);
        }
        if output.buffer_count_min as usize > NUM_PICTURE_BUFFERS {
            return Err(OmxError::InsufficientResources);
        }
        output.buffer_count_actual = NUM_PICTURE_BUFFERS as u32;
        // Seed impossible dimensions so the component raises a port-settings
        // change once the stream's real size is known.
        output.video.frame_width = u32::MAX;
        output.video.frame_height = u32::MAX;
        component.set_port_definition(&output)?;

        Ok(PortConfig {
            input_port,
            output_port,
            input_buffer_count: input.buffer_count_actual as usize,
            input_buffer_size: input.buffer_size,
        })
    }

    fn allocate_input_buffers(&mut self) -> bool {
        let headers = {
            let count = self.input_buffer_count;
            let size = self.input_buffer_size;
            let port = self.input_port;
            self.component_handle().and_then(|component| {
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(component.use_buffer(port, size)?);
                }
                Ok(headers)
            })
        };
        match headers {
            Ok(headers) => {
                for header in headers {
                    self.inputs.push_free(header);
                }
                true
            }
            Err(e) => {
                log::error!("failed to register input buffers: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                false
            }
        }
    }

    fn allocate_fake_output_buffers(&mut self) -> bool {
        let headers = {
            let port = self.output_port;
            self.component_handle().and_then(|component| {
                let mut headers = Vec::with_capacity(NUM_PICTURE_BUFFERS);
                for _ in 0..NUM_PICTURE_BUFFERS {
                    headers.push(component.allocate_buffer(port, 0)?);
                }
                Ok(headers)
            })
        };
        match headers {
            Ok(headers) => {
                for mut header in headers {
                    header.timestamp = -1;
                    self.outputs.add_fake(header);
                }
                true
            }
            Err(e) => {
                log::error!("failed to allocate fake output buffers: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                false
            }
        }
    }

    pub(crate) fn decode(&mut self, bitstream_buffer: BitstreamBuffer) {
        if self.transition == Transition::Resetting
            || self.transition == Transition::Initializing
            || !self.queued_bitstream_buffers.is_empty()
            || self.inputs.free_len() == 0
        {
            self.queued_bitstream_buffers.push_back(bitstream_buffer);
            return;
        }

        let state_ok = matches!(self.transition, Transition::None | Transition::Flushing)
            && matches!(self.component_state, ComponentState::Idle | ComponentState::Executing);
        if !state_ok {
            log::error!(
                "Decode() during invalid transition {:?} or state {:?}",
                self.transition,
                self.component_state
            );
            self.stop_on_error(DecodeError::IllegalState);
            return;
        }

        let mut header = match self.inputs.take_free() {
            Some(header) => header,
            None => return,
        };

        if bitstream_buffer.is_end_of_stream() {
            // An empty buffer with the EOS flag; its -2 timestamp can never
            // collide with a bitstream id.
            header.filled_len = 0;
            header.alloc_len = 0;
            header.flags.insert(BufferFlags::EOS);
            header.timestamp = -2;
            let header_id = header.id;
            match self.component_handle().and_then(|c| c.empty_this_buffer(header, None)) {
                Ok(()) => self.inputs.submitted(header_id, None),
                Err(e) => {
                    log::error!("EmptyThisBuffer() failed: {}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                }
            }
            return;
        }

        let memory = match bitstream_buffer.memory {
            Some(memory) => memory,
            None => {
                log::error!("bitstream buffer {} carries no memory handle", bitstream_buffer.id);
                self.stop_on_error(DecodeError::UnreadableInput);
                return;
            }
        };
        let mapping = match memory.map(bitstream_buffer.size) {
            Ok(mapping) => mapping,
            Err(e) => {
                log::error!("failed to map bitstream buffer {}: {:#}", bitstream_buffer.id, e);
                self.stop_on_error(DecodeError::UnreadableInput);
                return;
            }
        };

        header.filled_len = bitstream_buffer.size;
        header.alloc_len = bitstream_buffer.size;
        header.flags.remove(BufferFlags::EOS);
        // The timestamp smuggles the bitstream id across the component; see
        // the BufferHeader contract.
        header.timestamp = bitstream_buffer.id as i64;

        let header_id = header.id;
        let context = InputContext::new(Arc::clone(&mapping), bitstream_buffer.id);
        match self.component_handle().and_then(|c| c.empty_this_buffer(header, Some(mapping))) {
            Ok(()) => self.inputs.submitted(header_id, Some(context)),
            Err(e) => {
                log::error!("EmptyThisBuffer() failed: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
            }
        }
    }

    pub(crate) fn assign_picture_buffers(&mut self, buffers: Vec<PictureBuffer>) {
        // FillThisBuffer would fail during these transitions, and erroring
        // out of the destroy path would skip the FreeBuffer sweep.
        if matches!(
            self.transition,
            Transition::Resetting | Transition::Destroying | Transition::Erroring
        ) {
            return;
        }

        if !self.can_fill_buffer() {
            log::error!("AssignPictureBuffers() while unable to fill buffers");
            self.stop_on_error(DecodeError::IllegalState);
            return;
        }
        if buffers.len() != NUM_PICTURE_BUFFERS {
            log::error!("got {} picture buffers, requested {}", buffers.len(), NUM_PICTURE_BUFFERS);
            self.stop_on_error(DecodeError::InvalidArgument);
            return;
        }
        if self.outputs.at_component() != 0
            || self.outputs.fake_count() != 0
            || self.outputs.picture_count() != 0
        {
            log::error!("picture buffers assigned while output buffers are still registered");
            self.stop_on_error(DecodeError::PlatformFailure);
            return;
        }

        if self.graphics.make_current().is_err() {
            return;
        }

        for buffer in buffers {
            let image =
                match self.graphics.import_texture(buffer.texture_id, self.last_requested_picture_size)
                {
                    Ok(image) => image,
                    Err(e) => {
                        log::error!("failed to import texture {}: {:#}", buffer.texture_id, e);
                        self.stop_on_error(DecodeError::PlatformFailure);
                        return;
                    }
                };
            if let Err(e) = self.outputs.register_picture(buffer, image) {
                log::error!("{}", e);
                self.stop_on_error(DecodeError::InvalidArgument);
                return;
            }
        }

        // These do their own stop_on_error dances.
        if !self.allocate_output_buffers() {
            return;
        }
        self.send_command_checked(Command::PortEnable(self.output_port));
    }

    fn allocate_output_buffers(&mut self) -> bool {
        for picture_id in self.outputs.picture_ids() {
            let header = match self.component_handle().and_then(|c| c.use_buffer(self.output_port, 0))
            {
                Ok(header) => header,
                Err(e) => {
                    log::error!("failed to register an output buffer: {}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                    return false;
                }
            };
            if let Err(e) = self.outputs.bind_header(picture_id, header) {
                log::error!("{}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return false;
            }
        }
        true
    }

    pub(crate) fn reuse_picture_buffer(&mut self, picture_buffer_id: i32) {
        let fence = match self.graphics.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                log::error!("failed to create a picture sync fence: {:#}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return;
            }
        };
        self.check_picture_status(picture_buffer_id, fence);
    }

    fn check_picture_status(&mut self, picture_buffer_id: i32, fence: Box<dyn GpuFence>) {
        // The GPU may still be reading the texture; poll rather than block
        // the control thread.
        if !fence.is_signaled() {
            self.queue
                .post_delayed(ControlTask::PictureSync { picture_buffer_id, fence }, SYNC_POLL_DELAY);
            return;
        }
        self.queue_picture_buffer(picture_buffer_id);
    }

    fn queue_picture_buffer(&mut self, picture_buffer_id: i32) {
        // No FillThisBuffer while the ports flush.
        if self.transition == Transition::Resetting {
            self.queued_picture_ids.push_back(picture_buffer_id);
            return;
        }

        // Destroy may have started while the fence was pending; the teardown
        // sweep covers every registered picture regardless.
        if !self.can_fill_buffer() {
            return;
        }

        let header = match self.outputs.take_header(picture_buffer_id) {
            Ok(header) => header,
            Err(e) => {
                log::error!("{}", e);
                self.stop_on_error(DecodeError::InvalidArgument);
                return;
            }
        };
        match self.component_handle().and_then(|c| c.fill_this_buffer(header)) {
            Ok(()) => self.outputs.submitted(),
            Err(e) => {
                log::error!("FillThisBuffer() failed: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        if self.transition != Transition::None || self.component_state != ComponentState::Executing
        {
            log::error!(
                "Flush() during transition {:?} in state {:?}",
                self.transition,
                self.component_state
            );
            self.stop_on_error(DecodeError::IllegalState);
            return;
        }
        self.transition = Transition::Flushing;
        self.decode(BitstreamBuffer::end_of_stream());
    }

    fn on_reached_eos_in_flushing(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Executing);
        self.transition = Transition::None;
        if let Some(client) = self.client.clone() {
            client.notify_flush_done();
        }
    }

    pub(crate) fn reset(&mut self) {
        if self.transition != Transition::None || self.component_state != ComponentState::Executing
        {
            log::error!(
                "Reset() during transition {:?} in state {:?}",
                self.transition,
                self.component_state
            );
            self.stop_on_error(DecodeError::IllegalState);
            return;
        }
        self.transition = Transition::Resetting;
        self.begin_transition(OmxState::Pause);
    }

    /// Starts the destroy handshake. The caller owns the coordinator and
    /// must keep it alive (and keep pumping the queue) until
    /// [`OmxVideoDecoder::component_released`] reports true when `Pending`
    /// is returned.
    pub(crate) fn begin_destroy(&mut self) -> DestroyDisposition {
        // No client callback fires once Destroy has been called.
        self.client = None;

        match self.transition {
            Transition::Destroying => return DestroyDisposition::Pending,
            Transition::Erroring => {
                // The error path is already driving the component to Invalid
                // and will release the handle when it gets there.
                return if self.component.is_none() {
                    DestroyDisposition::Finished
                } else {
                    DestroyDisposition::Pending
                };
            }
            _ => (),
        }

        match self.component_state {
            ComponentState::Unloaded => {
                if let Err(e) = self.core.deinit() {
                    log::error!("component core deinit failed: {}", e);
                }
                DestroyDisposition::Finished
            }
            ComponentState::Terminated => DestroyDisposition::Finished,
            ComponentState::Loaded | ComponentState::Invalid => {
                // Free anything registered during a not-yet-confirmed
                // Loaded-to-Idle transition, then release the handle.
                self.free_component_buffers();
                self.shutdown_component();
                DestroyDisposition::Finished
            }
            ComponentState::Idle | ComponentState::Executing | ComponentState::Paused => {
                self.transition = Transition::Destroying;
                self.begin_transition(OmxState::Idle);
                DestroyDisposition::Pending
            }
        }
    }

    pub(crate) fn component_released(&self) -> bool {
        self.component.is_none()
    }

    fn begin_transition(&mut self, state: OmxState) {
        if state != OmxState::Invalid {
            debug_assert_ne!(self.transition, Transition::None);
        }
        if self.transition == Transition::Erroring {
            return;
        }
        self.send_command_checked(Command::SetState(state));
    }

    fn send_command_checked(&mut self, command: Command) -> bool {
        match self.component_handle().and_then(|c| c.send_command(command)) {
            Ok(()) => true,
            Err(e) => {
                log::error!("SendCommand({:?}) failed: {}", command, e);
                self.stop_on_error(DecodeError::PlatformFailure);
                false
            }
        }
    }

    fn component_handle(&self) -> OmxResult<&R::Component> {
        self.component.as_ref().ok_or(OmxError::IncorrectStateOperation)
    }

    fn can_fill_buffer(&self) -> bool {
        !matches!(
            self.transition,
            Transition::Destroying | Transition::Erroring | Transition::Resetting
        ) && matches!(
            self.component_state,
            ComponentState::Idle | ComponentState::Executing | ComponentState::Paused
        )
    }

    pub(crate) fn stop_on_error(&mut self, error: DecodeError) {
        if self.transition == Transition::Erroring {
            return;
        }

        if self.init_begun {
            if let Some(client) = self.client.clone() {
                client.notify_error(error);
            }
        }
        self.client = None;

        if matches!(
            self.component_state,
            ComponentState::Unloaded | ComponentState::Invalid | ComponentState::Terminated
        ) {
            return;
        }

        self.transition = Transition::Erroring;
        if let Err(e) = self
            .component_handle()
            .and_then(|c| c.send_command(Command::SetState(OmxState::Invalid)))
        {
            // The component is unreachable; finish inline so the session
            // cannot wedge waiting for an Invalid that will never arrive.
            log::error!("SendCommand(StateSet(Invalid)) failed: {}", e);
            self.free_component_buffers();
            self.shutdown_component();
        }
    }

    /// Runs one serialized task from the control queue.
    pub(crate) fn handle_task(&mut self, task: ControlTask) {
        match task {
            ControlTask::Event(event) => self.handle_event(event),
            ControlTask::EmptyBufferDone(header) => self.empty_buffer_done(header),
            ControlTask::FillBufferDone(header) => self.fill_buffer_done(header),
            ControlTask::PictureSync { picture_buffer_id, fence } => {
                self.check_picture_status(picture_buffer_id, fence)
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::CommandComplete(Command::SetState(state)) => self.dispatch_state_reached(state),
            Event::CommandComplete(Command::PortDisable(port)) => {
                if port != self.output_port {
                    self.protocol_violation("port-disable completion on a non-output port");
                    return;
                }
                self.on_output_port_disabled();
            }
            Event::CommandComplete(Command::PortEnable(port)) => {
                if port != self.output_port {
                    self.protocol_violation("port-enable completion on a non-output port");
                    return;
                }
                self.on_output_port_enabled();
            }
            Event::CommandComplete(Command::Flush(port)) => {
                if matches!(self.transition, Transition::Destroying | Transition::Erroring) {
                    return;
                }
                if self.transition != Transition::Resetting {
                    self.protocol_violation("port flush completed outside of a reset");
                    return;
                }
                if port == self.input_port {
                    self.input_port_flush_done();
                } else if port == self.output_port {
                    self.output_port_flush_done();
                } else {
                    self.protocol_violation("flush completion on an unknown port");
                }
            }
            Event::Error(e) => {
                if !matches!(self.transition, Transition::Destroying | Transition::Erroring) {
                    log::error!("component reported an error: {}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                }
            }
            Event::PortSettingsChanged { port, what } => self.on_port_settings_changed(port, what),
            Event::BufferFlag { port, .. } => {
                if port != self.output_port {
                    self.protocol_violation("buffer flag on a non-output port");
                    return;
                }
                // Destroy() may have interrupted the flush.
                if self.transition == Transition::Destroying {
                    return;
                }
                if self.transition != Transition::Flushing {
                    self.protocol_violation("end-of-stream flag outside of a flush");
                }
                // Nothing else to do; the EOS picture delivery signals the
                // client.
            }
        }
    }

    fn on_port_settings_changed(&mut self, port: PortIndex, what: PortSettings) {
        match what {
            PortSettings::Definition if port == self.output_port => {
                if self.outputs.picture_count() != 0 {
                    // Renegotiation of an already-assigned output set would
                    // be a mid-stream resize, which is unsupported.
                    log::error!("port settings changed with picture buffers assigned");
                    self.stop_on_error(DecodeError::PlatformFailure);
                    return;
                }
                // Output resize path: picture provisioning starts once the
                // port has drained and confirmed disabled.
                self.send_command_checked(Command::PortDisable(self.output_port));
            }
            PortSettings::OutputCrop | PortSettings::Scale if port == self.output_port => {
                // Crop and sample-aspect changes are not propagated.
                log::debug!("ignoring port settings change: {:?}", what);
            }
            _ => self.protocol_violation("unexpected port settings change"),
        }
    }

    fn on_output_port_disabled(&mut self) {
        let definition = {
            let port = self.output_port;
            self.component_handle().and_then(|c| c.port_definition(port))
        };
        let definition = match definition {
            Ok(definition) => definition,
            Err(e) => {
                log::error!("failed to re-read the output port definition: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return;
            }
        };
        if definition.buffer_count_min as usize > NUM_PICTURE_BUFFERS {
            log::error!(
                "component requires {} output buffers, only {} are provisioned",
                definition.buffer_count_min,
                NUM_PICTURE_BUFFERS
            );
            self.stop_on_error(DecodeError::PlatformFailure);
            return;
        }

        let dimensions =
            Resolution::from((definition.video.frame_width, definition.video.frame_height));
        self.last_requested_picture_size = dimensions;

        // AssignPictureBuffers() binds the textures and re-enables the port.
        if let Some(client) = self.client.clone() {
            client.provide_picture_buffers(
                NUM_PICTURE_BUFFERS as u32,
                PixelFormat::from(definition.video.color_format),
                1,
                dimensions,
                TEXTURE_TARGET_2D,
            );
        }
    }

    fn on_output_port_enabled(&mut self) {
        if self.transition == Transition::Resetting {
            // Re-issue once the reset completes.
            for picture_id in self.outputs.picture_ids() {
                self.queued_picture_ids.push_back(picture_id);
            }
            return;
        }

        if !self.can_fill_buffer() {
            self.stop_on_error(DecodeError::IllegalState);
            return;
        }

        for picture_id in self.outputs.picture_ids() {
            let mut header = match self.outputs.take_header(picture_id) {
                Ok(header) => header,
                Err(e) => {
                    log::error!("{}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                    return;
                }
            };
            header.flags.remove(BufferFlags::EOS);
            header.port = self.output_port;
            match self.component_handle().and_then(|c| c.fill_this_buffer(header)) {
                Ok(()) => self.outputs.submitted(),
                Err(e) => {
                    log::error!("FillThisBuffer() failed: {}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                    return;
                }
            }
        }
    }

    fn empty_buffer_done(&mut self, header: BufferHeader) {
        let eos = header.flags.contains(BufferFlags::EOS);
        let context = match self.inputs.returned(header) {
            Ok(context) => context,
            Err(e) => {
                log::error!("{}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return;
            }
        };

        // The end-of-stream marker carries no client bytes and returns
        // without notification.
        if eos {
            return;
        }

        let context = match context {
            Some(context) => context,
            None => {
                log::error!("input buffer returned without side-channel data");
                self.stop_on_error(DecodeError::PlatformFailure);
                return;
            }
        };
        if let Some(client) = self.client.clone() {
            client.notify_end_of_bitstream_buffer(context.bitstream_id());
        }

        self.decode_queued_bitstream_buffers();
    }

    fn fill_buffer_done(&mut self, header: BufferHeader) {
        // Book-keeping happens unconditionally so the counts and header
        // residency stay exact even when the transition suppresses the
        // client-visible work below.
        if let Err(e) = self.outputs.returned() {
            log::error!("{}", e);
            self.stop_on_error(DecodeError::PlatformFailure);
            return;
        }

        let eos = header.flags.contains(BufferFlags::EOS);
        let timestamp = header.timestamp;

        if self.outputs.is_fake(header.id) {
            // A returning fake buffer is retired for good; the first decoded
            // data dismisses them all through the dimension change.
            if matches!(self.transition, Transition::Destroying | Transition::Erroring) {
                return;
            }
            let canonical = match self.outputs.retire_fake(header.id) {
                Some(canonical) => canonical,
                None => return,
            };
            let freed = {
                let port = self.output_port;
                self.component_handle().and_then(|c| c.free_buffer(port, canonical))
            };
            if let Err(e) = freed {
                log::error!("FreeBuffer(fake output) failed: {}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
            }
            return;
        }

        let mut header = header;
        header.flags.remove(BufferFlags::EOS);
        let picture_id = match self.outputs.restore_header(header) {
            Ok(picture_id) => picture_id,
            Err(e) => {
                log::error!("{}", e);
                self.stop_on_error(DecodeError::PlatformFailure);
                return;
            }
        };

        if matches!(self.transition, Transition::Destroying | Transition::Erroring) {
            return;
        }
        debug_assert_eq!(self.outputs.fake_count(), 0);

        // The EOS picture signals flush completion; recycle the buffer that
        // carried it.
        if eos {
            self.on_reached_eos_in_flushing();
            self.reuse_picture_buffer(picture_id);
            return;
        }

        // Pictures drained by the reset are withheld from the client and
        // re-issued afterwards.
        if self.transition == Transition::Resetting {
            self.queued_picture_ids.push_back(picture_id);
            return;
        }

        let picture =
            Picture { picture_buffer_id: picture_id, bitstream_buffer_id: timestamp as i32 };
        if let Some(client) = self.client.clone() {
            client.picture_ready(picture);
        }
    }

    fn decode_queued_bitstream_buffers(&mut self) {
        let buffers: Vec<BitstreamBuffer> = self.queued_bitstream_buffers.drain(..).collect();
        if matches!(self.transition, Transition::Destroying | Transition::Erroring) {
            return;
        }
        for buffer in buffers {
            self.decode(buffer);
        }
    }

    fn dispatch_state_reached(&mut self, reached: OmxState) {
        match (self.transition, reached) {
            (Transition::Initializing, OmxState::Idle) => self.on_reached_idle_in_initializing(),
            (Transition::Initializing, OmxState::Executing) => {
                self.on_reached_executing_in_initializing()
            }
            (Transition::Resetting, OmxState::Pause) => self.on_reached_pause_in_resetting(),
            (Transition::Resetting, OmxState::Executing) => self.on_reached_executing_in_resetting(),
            // Destroy() can interrupt a Flush() or Reset() whose state
            // command is still in flight; the destroy transition is already
            // queued behind it at the component.
            (Transition::Destroying, OmxState::Pause | OmxState::Executing) => (),
            (Transition::Destroying, OmxState::Idle) => self.on_reached_idle_in_destroying(),
            (Transition::Destroying, OmxState::Loaded) => self.on_reached_loaded_in_destroying(),
            (Transition::Erroring, OmxState::Invalid) => self.on_reached_invalid_in_erroring(),
            (transition, reached) => {
                log::error!("unexpected state {:?} reached in {:?}", reached, transition);
                self.stop_on_error(DecodeError::PlatformFailure);
            }
        }
    }

    fn on_reached_idle_in_initializing(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Loaded);
        self.component_state = ComponentState::Idle;
        self.begin_transition(OmxState::Executing);
    }

    fn on_reached_executing_in_initializing(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Idle);
        self.component_state = ComponentState::Executing;
        self.transition = Transition::None;

        // Prime the component with the fake buffers to get decode going; the
        // first decoded data dismisses them through a dimension mismatch.
        for header in self.outputs.fake_headers() {
            let filled = self.component_handle().and_then(|c| c.fill_this_buffer(header));
            match filled {
                Ok(()) => self.outputs.submitted(),
                Err(e) => {
                    log::error!("FillThisBuffer() failed: {}", e);
                    self.stop_on_error(DecodeError::PlatformFailure);
                    return;
                }
            }
        }

        if let Some(client) = self.client.clone() {
            client.notify_initialization_complete(true);
        }
    }

    fn on_reached_pause_in_resetting(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Executing);
        self.component_state = ComponentState::Paused;
        // Input port first; outputs produced from cancelled inputs must not
        // surface. The output port follows once the input flush confirms.
        self.send_command_checked(Command::Flush(self.input_port));
    }

    fn input_port_flush_done(&mut self) {
        if self.inputs.at_component() != 0 {
            log::error!(
                "input flush completed with {} buffers at the component",
                self.inputs.at_component()
            );
            self.stop_on_error(DecodeError::PlatformFailure);
            return;
        }
        self.send_command_checked(Command::Flush(self.output_port));
    }

    fn output_port_flush_done(&mut self) {
        if self.outputs.at_component() != 0 {
            log::error!(
                "output flush completed with {} buffers at the component",
                self.outputs.at_component()
            );
            self.stop_on_error(DecodeError::PlatformFailure);
            return;
        }
        self.begin_transition(OmxState::Executing);
    }

    fn on_reached_executing_in_resetting(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Paused);
        self.component_state = ComponentState::Executing;
        self.transition = Transition::None;
        if self.client.is_none() {
            return;
        }

        // Drain the work held back during the reset, in arrival order.
        self.decode_queued_bitstream_buffers();
        let deferred: Vec<i32> = self.queued_picture_ids.drain(..).collect();
        for picture_id in deferred {
            self.reuse_picture_buffer(picture_id);
        }

        if let Some(client) = self.client.clone() {
            client.notify_reset_done();
        }
    }

    fn on_reached_idle_in_destroying(&mut self) {
        debug_assert!(matches!(
            self.component_state,
            ComponentState::Idle | ComponentState::Executing | ComponentState::Paused
        ));
        self.component_state = ComponentState::Idle;

        // The component returns every held buffer on the way to Idle, so the
        // populations are whole again by the time this event is dispatched.
        self.begin_transition(OmxState::Loaded);
        self.free_component_buffers();
    }

    fn on_reached_loaded_in_destroying(&mut self) {
        debug_assert_eq!(self.component_state, ComponentState::Idle);
        self.component_state = ComponentState::Loaded;
        self.transition = Transition::None;
        self.shutdown_component();
    }

    fn on_reached_invalid_in_erroring(&mut self) {
        self.component_state = ComponentState::Invalid;
        self.free_component_buffers();
        self.shutdown_component();
    }

    fn shutdown_component(&mut self) {
        if let Some(component) = self.component.take() {
            if let Err(e) = self.core.free_handle(component) {
                log::error!("FreeHandle() failed: {}", e);
            }
        }
        self.component_state = ComponentState::Terminated;
        if let Err(e) = self.core.deinit() {
            log::error!("component core deinit failed: {}", e);
        }
    }

    /// Releases every registered buffer. Failures are logged only: the
    /// teardown must run to completion even against a misbehaving component.
    fn free_component_buffers(&mut self) {
        while let Some(header) = self.inputs.take_free() {
            let freed = {
                let port = self.input_port;
                self.component_handle().and_then(|c| c.free_buffer(port, header))
            };
            if let Err(e) = freed {
                log::error!("FreeBuffer(input) failed: {}", e);
            }
        }

        let client = self.client.clone();
        for (picture_id, header) in self.outputs.drain_pictures() {
            match header {
                Some(header) => {
                    let freed = {
                        let port = self.output_port;
                        self.component_handle().and_then(|c| c.free_buffer(port, header))
                    };
                    if let Err(e) = freed {
                        log::error!("FreeBuffer(output) failed: {}", e);
                    }
                }
                None => {
                    log::error!("picture {} still held by the component", picture_id);
                }
            }
            if let Some(client) = &client {
                client.dismiss_picture_buffer(picture_id);
            }
        }

        for header in self.outputs.drain_fakes() {
            let freed = {
                let port = self.output_port;
                self.component_handle().and_then(|c| c.free_buffer(port, header))
            };
            if let Err(e) = freed {
                log::error!("FreeBuffer(fake output) failed: {}", e);
            }
        }

        // Reset-deferred ids were dismissed with their pictures above.
        self.queued_picture_ids.clear();
    }

    fn protocol_violation(&mut self, what: &str) {
        log::error!("protocol violation: {}", what);
        self.stop_on_error(DecodeError::PlatformFailure);
    }

    #[cfg(test)]
    pub(crate) fn transition(&self) -> Transition {
        self.transition
    }

    #[cfg(test)]
    pub(crate) fn codec(&self) -> Option<Codec> {
        self.codec
    }

    #[cfg(test)]
    pub(crate) fn input_buffers_balanced(&self) -> bool {
        self.inputs.is_balanced()
    }

    #[cfg(test)]
    pub(crate) fn input_buffers_at_component(&self) -> usize {
        self.inputs.at_component()
    }
}
