// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership and pumping of one decode session.
//!
//! [`DecodeSession`] is what the embedder holds: it owns the coordinator and
//! the control queue, forwards client operations, and runs serialized tasks
//! on the control thread. It is also the teardown engine. Destroying the
//! component is an asynchronous Executing → Idle → Loaded → release-handle
//! handshake, but clients get a fire-and-forget `destroy()`: the session
//! takes the coordinator out of the client's reach, keeps dispatching
//! component events to it, and drops it exactly once when the handle clears.
//! Each state-reached notification advances the handshake, so no polling
//! task is needed. If the session itself is dropped mid-handshake, the
//! remaining events are drained synchronously with a bounded wait per tick
//! so the component is never dangled, even during process shutdown.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::decoder::accelerator::DestroyDisposition;
use crate::decoder::accelerator::OmxVideoDecoder;
use crate::decoder::control::ControlQueue;
use crate::decoder::BitstreamBuffer;
use crate::decoder::Client;
use crate::decoder::Config;
use crate::decoder::DecodeError;
use crate::decoder::PictureBuffer;
use crate::graphics::GraphicsContext;
use crate::omx::Core;

/// Bound on each wait while draining a pending teardown on drop.
const TEARDOWN_WAIT: Duration = Duration::from_millis(5);

pub struct DecodeSession<G, R>
where
    G: GraphicsContext,
    R: Core,
{
    queue: Arc<ControlQueue>,
    /// The coordinator; `None` once teardown has completed.
    decoder: Option<Box<OmxVideoDecoder<G, R>>>,
    /// Set by `destroy()`; every client entry point is refused afterwards.
    destroyed: bool,
}

impl<G, R> DecodeSession<G, R>
where
    G: GraphicsContext,
    R: Core,
{
    pub fn new(graphics: G, core: R) -> Result<Self, DecodeError> {
        let queue = Arc::new(ControlQueue::new().map_err(|e| {
            log::error!("failed to create the control queue: {}", e);
            DecodeError::PlatformFailure
        })?);
        let decoder = OmxVideoDecoder::new(graphics, core, Arc::clone(&queue))?;
        Ok(Self { queue, decoder: Some(Box::new(decoder)), destroyed: false })
    }

    fn active_decoder(&mut self) -> Option<&mut OmxVideoDecoder<G, R>> {
        if self.destroyed {
            None
        } else {
            self.decoder.as_deref_mut()
        }
    }

    /// Starts the session for `config.profile`. Completion is asynchronous:
    /// the client's `notify_initialization_complete` fires once the
    /// component reaches its running state.
    pub fn initialize(&mut self, config: Config, client: Rc<dyn Client>) -> bool {
        match self.active_decoder() {
            Some(decoder) => decoder.initialize(config, client),
            None => false,
        }
    }

    /// Submits one bitstream buffer. Buffers that cannot be dispatched
    /// immediately are queued and drained FIFO.
    pub fn decode(&mut self, bitstream_buffer: BitstreamBuffer) {
        if let Some(decoder) = self.active_decoder() {
            decoder.decode(bitstream_buffer);
        }
    }

    /// Provides the picture buffers requested through
    /// `provide_picture_buffers`.
    pub fn assign_picture_buffers(&mut self, buffers: Vec<PictureBuffer>) {
        if let Some(decoder) = self.active_decoder() {
            decoder.assign_picture_buffers(buffers);
        }
    }

    /// Returns a delivered picture to the decoder once the GPU is done
    /// reading it.
    pub fn reuse_picture_buffer(&mut self, picture_buffer_id: i32) {
        if let Some(decoder) = self.active_decoder() {
            decoder.reuse_picture_buffer(picture_buffer_id);
        }
    }

    /// Drains the stream; `notify_flush_done` fires when the end-of-stream
    /// marker has made it through the component.
    pub fn flush(&mut self) {
        if let Some(decoder) = self.active_decoder() {
            decoder.flush();
        }
    }

    /// Abandons in-flight work; `notify_reset_done` fires when the ports
    /// have drained and decoding can resume.
    pub fn reset(&mut self) {
        if let Some(decoder) = self.active_decoder() {
            decoder.reset();
        }
    }

    /// Shuts the session down. Fire-and-forget: no client callback fires
    /// after this returns, and the asynchronous component handshake keeps
    /// running on the control queue until the handle is released.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let finished = match self.decoder.as_deref_mut() {
            Some(decoder) => decoder.begin_destroy() == DestroyDisposition::Finished,
            None => true,
        };
        if finished {
            self.decoder = None;
        }
    }

    /// Runs every task whose time has come. Call from the control thread
    /// whenever [`DecodeSession::wait_for_work`] returns.
    pub fn run_pending(&mut self) {
        while let Some(task) = self.queue.pop_ready() {
            if let Some(decoder) = self.decoder.as_deref_mut() {
                decoder.handle_task(task);
            }
            // Tasks arriving after the coordinator's death fall through as
            // no-ops.
            self.reap();
        }
    }

    /// Sleeps until work is posted, a deferred task comes due, or `max_wait`
    /// elapses.
    pub fn wait_for_work(&self, max_wait: Duration) {
        self.queue.wait(max_wait);
    }

    /// True once a destroyed session has finished the component handshake.
    pub fn is_torn_down(&self) -> bool {
        self.decoder.is_none()
    }

    fn reap(&mut self) {
        if !self.destroyed {
            return;
        }
        if let Some(decoder) = &self.decoder {
            if decoder.component_released() {
                self.decoder = None;
            }
        }
    }
}

impl<G, R> Drop for DecodeSession<G, R>
where
    G: GraphicsContext,
    R: Core,
{
    fn drop(&mut self) {
        if !self.destroyed {
            self.destroy();
        }
        // Drain a still-pending handshake; the component contract promises
        // prompt completions, so each tick is a short bounded wait.
        while self.decoder.is_some() {
            self.queue.wait(TEARDOWN_WAIT);
            self.run_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::decoder::accelerator::Codec;
    use crate::decoder::accelerator::Transition;
    use crate::decoder::accelerator::NUM_PICTURE_BUFFERS;
    use crate::decoder::supported_profiles;
    use crate::decoder::Picture;
    use crate::graphics::ExternalImage;
    use crate::graphics::GpuFence;
    use crate::omx::AvcProfile;
    use crate::omx::BufferFlags;
    use crate::omx::BufferHeader;
    use crate::omx::BufferId;
    use crate::omx::ColorFormat;
    use crate::omx::Command;
    use crate::omx::Component;
    use crate::omx::ComponentCallbacks;
    use crate::omx::Event;
    use crate::omx::OmxError;
    use crate::omx::OmxResult;
    use crate::omx::OmxState;
    use crate::omx::PortDefinition;
    use crate::omx::PortDirection;
    use crate::omx::PortIndex;
    use crate::omx::PortRange;
    use crate::omx::VideoPortFormat;
    use crate::shm::MappedRegion;
    use crate::shm::SharedMemoryHandle;
    use crate::PixelFormat;
    use crate::Resolution;
    use crate::VideoProfile;

    const INPUT_PORT: PortIndex = 0;
    const OUTPUT_PORT: PortIndex = 1;
    const INPUT_BUFFER_COUNT: u32 = 2;

    // ---- collaborator fakes -------------------------------------------

    struct FakeFence {
        remaining: Cell<u32>,
    }

    impl GpuFence for FakeFence {
        fn is_signaled(&self) -> bool {
            let remaining = self.remaining.get();
            if remaining == 0 {
                true
            } else {
                self.remaining.set(remaining - 1);
                false
            }
        }
    }

    struct FakeImage;
    impl ExternalImage for FakeImage {}

    struct FakeGraphics {
        /// How many times each fence reports unsignaled before signaling.
        fence_delay_polls: u32,
    }

    impl GraphicsContext for FakeGraphics {
        fn make_current(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn create_fence(&self) -> anyhow::Result<Box<dyn GpuFence>> {
            Ok(Box::new(FakeFence { remaining: Cell::new(self.fence_delay_polls) }))
        }

        fn import_texture(
            &self,
            _texture_id: u32,
            _size: Resolution,
        ) -> anyhow::Result<Box<dyn ExternalImage>> {
            Ok(Box::new(FakeImage))
        }
    }

    struct FakeMapping(Vec<u8>);
    impl MappedRegion for FakeMapping {
        fn as_bytes(&self) -> &[u8] {
            &self.0
        }
    }

    struct FakeSharedMemory {
        len: usize,
    }

    impl SharedMemoryHandle for FakeSharedMemory {
        fn map(&self, size: usize) -> anyhow::Result<Arc<dyn MappedRegion>> {
            anyhow::ensure!(size <= self.len, "mapping beyond the region");
            Ok(Arc::new(FakeMapping(vec![0; size])))
        }
    }

    // ---- scripted component -------------------------------------------

    /// Everything the fake component did, in order.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Op {
        Emptied(BufferId),
        Filled(BufferId),
        Freed(BufferId),
    }

    struct ComponentInner {
        callbacks: Option<Arc<dyn ComponentCallbacks>>,
        state: OmxState,
        next_buffer_id: u32,
        role: Option<String>,
        definitions: [PortDefinition; 2],
        held_inputs: VecDeque<(BufferHeader, Option<Arc<dyn MappedRegion>>)>,
        held_outputs: VecDeque<BufferHeader>,
        ops: Vec<Op>,
        fail_empty_this_buffer: bool,
    }

    impl ComponentInner {
        fn new() -> Self {
            Self {
                callbacks: None,
                state: OmxState::Loaded,
                next_buffer_id: 0,
                role: None,
                definitions: [
                    PortDefinition {
                        index: INPUT_PORT,
                        direction: PortDirection::Input,
                        buffer_count_actual: INPUT_BUFFER_COUNT,
                        buffer_count_min: 1,
                        buffer_size: 4096,
                        video: VideoPortFormat {
                            frame_width: 0,
                            frame_height: 0,
                            color_format: ColorFormat::Yuv420SemiPlanar,
                        },
                    },
                    PortDefinition {
                        index: OUTPUT_PORT,
                        direction: PortDirection::Output,
                        buffer_count_actual: 4,
                        buffer_count_min: 4,
                        buffer_size: 0,
                        video: VideoPortFormat {
                            frame_width: 0,
                            frame_height: 0,
                            color_format: ColorFormat::Yuv420SemiPlanar,
                        },
                    },
                ],
                held_inputs: VecDeque::new(),
                held_outputs: VecDeque::new(),
                ops: Vec::new(),
                fail_empty_this_buffer: false,
            }
        }

        fn callbacks(&self) -> Arc<dyn ComponentCallbacks> {
            Arc::clone(self.callbacks.as_ref().expect("component has no callbacks"))
        }

        fn return_inputs(&mut self) {
            let callbacks = self.callbacks();
            while let Some((header, _payload)) = self.held_inputs.pop_front() {
                self.ops.push(Op::Emptied(header.id));
                callbacks.empty_buffer_done(header);
            }
        }

        fn return_outputs(&mut self) {
            let callbacks = self.callbacks();
            while let Some(header) = self.held_outputs.pop_front() {
                callbacks.fill_buffer_done(header);
            }
        }
    }

    #[derive(Clone)]
    struct FakeComponent {
        inner: Arc<Mutex<ComponentInner>>,
    }

    impl FakeComponent {
        fn new() -> Self {
            Self { inner: Arc::new(Mutex::new(ComponentInner::new())) }
        }

        fn set_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>) {
            self.inner.lock().unwrap().callbacks = Some(callbacks);
        }

        /// Consumes the oldest held input and returns its header.
        fn complete_next_input(&self) {
            let mut inner = self.inner.lock().unwrap();
            let callbacks = inner.callbacks();
            let (header, _payload) =
                inner.held_inputs.pop_front().expect("no input held by the component");
            inner.ops.push(Op::Emptied(header.id));
            callbacks.empty_buffer_done(header);
        }

        /// Fills the oldest held output with a frame produced from the input
        /// whose timestamp was `timestamp`.
        fn produce_frame(&self, timestamp: i64) {
            let mut inner = self.inner.lock().unwrap();
            let callbacks = inner.callbacks();
            let mut header =
                inner.held_outputs.pop_front().expect("no output held by the component");
            header.timestamp = timestamp;
            callbacks.fill_buffer_done(header);
        }

        /// Delivers the end-of-stream marker on the oldest held output.
        fn produce_eos(&self) {
            let mut inner = self.inner.lock().unwrap();
            let callbacks = inner.callbacks();
            let mut header =
                inner.held_outputs.pop_front().expect("no output held by the component");
            header.flags.insert(BufferFlags::EOS);
            header.timestamp = -2;
            callbacks
                .event(Event::BufferFlag { port: OUTPUT_PORT, flags: BufferFlags::EOS });
            callbacks.fill_buffer_done(header);
        }

        /// The stream's real dimensions became known.
        fn change_output_resolution(&self, width: u32, height: u32) {
            let mut inner = self.inner.lock().unwrap();
            inner.definitions[OUTPUT_PORT as usize].video.frame_width = width;
            inner.definitions[OUTPUT_PORT as usize].video.frame_height = height;
            let callbacks = inner.callbacks();
            callbacks.event(Event::PortSettingsChanged {
                port: OUTPUT_PORT,
                what: crate::omx::PortSettings::Definition,
            });
        }

        fn set_fail_empty_this_buffer(&self, fail: bool) {
            self.inner.lock().unwrap().fail_empty_this_buffer = fail;
        }

        fn held_input_count(&self) -> usize {
            self.inner.lock().unwrap().held_inputs.len()
        }

        fn held_output_count(&self) -> usize {
            self.inner.lock().unwrap().held_outputs.len()
        }

        fn last_held_input(&self) -> BufferHeader {
            self.inner.lock().unwrap().held_inputs.back().expect("no input held").0.clone()
        }

        fn role(&self) -> Option<String> {
            self.inner.lock().unwrap().role.clone()
        }

        fn state(&self) -> OmxState {
            self.inner.lock().unwrap().state
        }

        fn ops(&self) -> Vec<Op> {
            self.inner.lock().unwrap().ops.clone()
        }

        fn freed_ids(&self) -> Vec<BufferId> {
            self.inner
                .lock()
                .unwrap()
                .ops
                .iter()
                .filter_map(|op| match op {
                    Op::Freed(id) => Some(*id),
                    _ => None,
                })
                .collect()
        }
    }

    impl Component for FakeComponent {
        fn video_ports(&self) -> OmxResult<PortRange> {
            Ok(PortRange { count: 2, start: INPUT_PORT })
        }

        fn port_definition(&self, port: PortIndex) -> OmxResult<PortDefinition> {
            self.inner
                .lock()
                .unwrap()
                .definitions
                .get(port as usize)
                .copied()
                .ok_or(OmxError::BadParameter)
        }

        fn set_port_definition(&self, definition: &PortDefinition) -> OmxResult<()> {
            let mut inner = self.inner.lock().unwrap();
            match inner.definitions.get_mut(definition.index as usize) {
                Some(slot) => {
                    *slot = *definition;
                    Ok(())
                }
                None => Err(OmxError::BadParameter),
            }
        }

        fn set_role(&self, role: &str) -> OmxResult<()> {
            self.inner.lock().unwrap().role = Some(role.to_owned());
            Ok(())
        }

        fn send_command(&self, command: Command) -> OmxResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let callbacks = inner.callbacks();
            match command {
                Command::SetState(target) => {
                    // Buffers go back to their suppliers on the way out of
                    // the running states.
                    if matches!(target, OmxState::Idle | OmxState::Invalid) {
                        inner.return_inputs();
                        inner.return_outputs();
                    }
                    inner.state = target;
                    callbacks.event(Event::CommandComplete(Command::SetState(target)));
                }
                Command::PortDisable(port) => {
                    if port == OUTPUT_PORT {
                        inner.return_outputs();
                    }
                    callbacks.event(Event::CommandComplete(command));
                }
                Command::PortEnable(_) => {
                    callbacks.event(Event::CommandComplete(command));
                }
                Command::Flush(port) => {
                    if port == INPUT_PORT {
                        inner.return_inputs();
                    } else {
                        inner.return_outputs();
                    }
                    callbacks.event(Event::CommandComplete(command));
                }
            }
            Ok(())
        }

        fn use_buffer(&self, port: PortIndex, size: usize) -> OmxResult<BufferHeader> {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_buffer_id;
            inner.next_buffer_id += 1;
            Ok(BufferHeader {
                id: BufferId(id),
                port,
                flags: BufferFlags::empty(),
                timestamp: 0,
                filled_len: 0,
                alloc_len: size,
            })
        }

        fn allocate_buffer(&self, port: PortIndex, size: usize) -> OmxResult<BufferHeader> {
            self.use_buffer(port, size)
        }

        fn free_buffer(&self, _port: PortIndex, header: BufferHeader) -> OmxResult<()> {
            self.inner.lock().unwrap().ops.push(Op::Freed(header.id));
            Ok(())
        }

        fn empty_this_buffer(
            &self,
            header: BufferHeader,
            payload: Option<Arc<dyn MappedRegion>>,
        ) -> OmxResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_empty_this_buffer {
                return Err(OmxError::Undefined);
            }
            inner.held_inputs.push_back((header, payload));
            Ok(())
        }

        fn fill_this_buffer(&self, header: BufferHeader) -> OmxResult<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push(Op::Filled(header.id));
            inner.held_outputs.push_back(header);
            Ok(())
        }
    }

    struct CoreInner {
        component: FakeComponent,
        handle_freed: bool,
        deinit_count: u32,
        role_queries: Vec<String>,
    }

    #[derive(Clone)]
    struct FakeCore {
        inner: Arc<Mutex<CoreInner>>,
    }

    impl FakeCore {
        fn new(component: FakeComponent) -> Self {
            Self {
                inner: Arc::new(Mutex::new(CoreInner {
                    component,
                    handle_freed: false,
                    deinit_count: 0,
                    role_queries: Vec::new(),
                })),
            }
        }

        fn handle_freed(&self) -> bool {
            self.inner.lock().unwrap().handle_freed
        }

        fn deinit_count(&self) -> u32 {
            self.inner.lock().unwrap().deinit_count
        }

        fn role_queries(&self) -> Vec<String> {
            self.inner.lock().unwrap().role_queries.clone()
        }
    }

    impl Core for FakeCore {
        type Component = FakeComponent;

        fn init(&self) -> OmxResult<()> {
            Ok(())
        }

        fn deinit(&self) -> OmxResult<()> {
            self.inner.lock().unwrap().deinit_count += 1;
            Ok(())
        }

        fn components_of_role(&self, role: &str) -> OmxResult<Vec<String>> {
            self.inner.lock().unwrap().role_queries.push(role.to_owned());
            Ok(vec!["omx.fake.video_decoder".to_owned()])
        }

        fn get_handle(
            &self,
            _name: &str,
            callbacks: Arc<dyn ComponentCallbacks>,
        ) -> OmxResult<Self::Component> {
            let component = self.inner.lock().unwrap().component.clone();
            component.set_callbacks(callbacks);
            Ok(component)
        }

        fn free_handle(&self, _component: Self::Component) -> OmxResult<()> {
            self.inner.lock().unwrap().handle_freed = true;
            Ok(())
        }
    }

    // ---- recording client ---------------------------------------------

    #[derive(Clone, Debug, PartialEq)]
    enum ClientEvent {
        ProvidePictureBuffers { count: u32, format: PixelFormat, dimensions: Resolution },
        PictureReady(Picture),
        EndOfBitstream(i32),
        FlushDone,
        ResetDone,
        InitializationComplete(bool),
        Error(DecodeError),
        DismissPictureBuffer(i32),
    }

    #[derive(Default)]
    struct TestClient {
        events: RefCell<Vec<ClientEvent>>,
    }

    impl TestClient {
        fn events(&self) -> Vec<ClientEvent> {
            self.events.borrow().clone()
        }

        fn count(&self, wanted: &ClientEvent) -> usize {
            self.events.borrow().iter().filter(|event| *event == wanted).count()
        }

        fn end_of_bitstream_ids(&self) -> Vec<i32> {
            self.events
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    ClientEvent::EndOfBitstream(id) => Some(*id),
                    _ => None,
                })
                .collect()
        }

        fn ready_bitstream_ids(&self) -> Vec<i32> {
            self.events
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    ClientEvent::PictureReady(picture) => Some(picture.bitstream_buffer_id),
                    _ => None,
                })
                .collect()
        }

        fn errors(&self) -> Vec<DecodeError> {
            self.events
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    ClientEvent::Error(error) => Some(*error),
                    _ => None,
                })
                .collect()
        }
    }

    impl Client for TestClient {
        fn provide_picture_buffers(
            &self,
            requested_num: u32,
            format: PixelFormat,
            _planes: u32,
            dimensions: Resolution,
            _texture_target: u32,
        ) {
            self.events.borrow_mut().push(ClientEvent::ProvidePictureBuffers {
                count: requested_num,
                format,
                dimensions,
            });
        }

        fn picture_ready(&self, picture: Picture) {
            self.events.borrow_mut().push(ClientEvent::PictureReady(picture));
        }

        fn notify_end_of_bitstream_buffer(&self, bitstream_buffer_id: i32) {
            self.events.borrow_mut().push(ClientEvent::EndOfBitstream(bitstream_buffer_id));
        }

        fn notify_flush_done(&self) {
            self.events.borrow_mut().push(ClientEvent::FlushDone);
        }

        fn notify_reset_done(&self) {
            self.events.borrow_mut().push(ClientEvent::ResetDone);
        }

        fn notify_initialization_complete(&self, success: bool) {
            self.events.borrow_mut().push(ClientEvent::InitializationComplete(success));
        }

        fn notify_error(&self, error: DecodeError) {
            self.events.borrow_mut().push(ClientEvent::Error(error));
        }

        fn dismiss_picture_buffer(&self, picture_buffer_id: i32) {
            self.events.borrow_mut().push(ClientEvent::DismissPictureBuffer(picture_buffer_id));
        }
    }

    // ---- harness ------------------------------------------------------

    struct Harness {
        session: DecodeSession<FakeGraphics, FakeCore>,
        component: FakeComponent,
        core: FakeCore,
        client: Rc<TestClient>,
    }

    fn harness() -> Harness {
        harness_with(FakeGraphics { fence_delay_polls: 0 })
    }

    fn harness_with(graphics: FakeGraphics) -> Harness {
        let component = FakeComponent::new();
        let core = FakeCore::new(component.clone());
        let session = DecodeSession::new(graphics, core.clone()).unwrap();
        let client = Rc::new(TestClient::default());
        Harness { session, component, core, client }
    }

    impl Harness {
        fn initialize(&mut self, profile: VideoProfile) -> bool {
            let client = Rc::clone(&self.client) as Rc<dyn Client>;
            let ok = self.session.initialize(Config { profile }, client);
            self.session.run_pending();
            ok
        }

        fn decode(&mut self, id: i32) {
            let memory = Box::new(FakeSharedMemory { len: 64 });
            self.session.decode(BitstreamBuffer::new(id, memory, 64));
            self.session.run_pending();
        }

        fn assign_pictures(&mut self) {
            let buffers: Vec<PictureBuffer> = (0..NUM_PICTURE_BUFFERS as i32)
                .map(|id| PictureBuffer {
                    id,
                    texture_id: 100 + id as u32,
                    size: Resolution::from((320, 240)),
                })
                .collect();
            self.session.assign_picture_buffers(buffers);
            self.session.run_pending();
        }

        /// Initialize, feed one input, renegotiate the output port and
        /// assign real pictures: the state every mid-stream scenario starts
        /// from.
        fn reach_steady_state(&mut self) {
            assert!(self.initialize(VideoProfile::H264Baseline));
            self.decode(10);
            self.component.complete_next_input();
            self.session.run_pending();
            self.component.change_output_resolution(320, 240);
            self.session.run_pending();
            self.assign_pictures();
            assert_eq!(self.component.held_output_count(), NUM_PICTURE_BUFFERS);
            assert!(self.client.errors().is_empty());
        }
    }

    // ---- scenarios ----------------------------------------------------

    #[test]
    fn happy_path_h264_baseline() {
        let mut h = harness();
        assert!(h.initialize(VideoProfile::H264Baseline));
        assert_eq!(h.client.count(&ClientEvent::InitializationComplete(true)), 1);
        assert_eq!(h.component.role().as_deref(), Some("video_decoder.avc"));
        // The fake outputs prime the component as soon as it executes.
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS);

        // Two input slots: the third submission queues client-side.
        h.decode(10);
        h.decode(11);
        h.decode(12);
        assert_eq!(h.component.held_input_count(), 2);

        h.component.complete_next_input();
        h.session.run_pending();
        assert_eq!(h.client.end_of_bitstream_ids(), vec![10]);
        // The freed slot pulled the queued submission in.
        assert_eq!(h.component.held_input_count(), 2);

        h.component.change_output_resolution(320, 240);
        h.session.run_pending();
        assert_eq!(
            h.client.count(&ClientEvent::ProvidePictureBuffers {
                count: NUM_PICTURE_BUFFERS as u32,
                format: PixelFormat::Nv12,
                dimensions: Resolution::from((320, 240)),
            }),
            1
        );

        h.assign_pictures();
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS);

        h.component.complete_next_input();
        h.component.complete_next_input();
        h.session.run_pending();
        assert_eq!(h.client.end_of_bitstream_ids(), vec![10, 11, 12]);

        for id in [10, 11, 12] {
            h.component.produce_frame(id as i64);
        }
        h.session.run_pending();
        // Outputs carry the bitstream id of the input that produced them.
        assert_eq!(h.client.ready_bitstream_ids(), vec![10, 11, 12]);

        // Flush: the end-of-stream marker flows through the component.
        h.session.flush();
        h.session.run_pending();
        let eos = h.component.last_held_input();
        assert!(eos.flags.contains(BufferFlags::EOS));
        assert_eq!(eos.timestamp, -2);
        assert_eq!(eos.filled_len, 0);

        h.component.complete_next_input();
        h.component.produce_eos();
        h.session.run_pending();
        assert_eq!(h.client.count(&ClientEvent::FlushDone), 1);
        // The marker's return is not an end-of-bitstream notification.
        assert_eq!(h.client.end_of_bitstream_ids(), vec![10, 11, 12]);
        assert!(h.client.errors().is_empty());

        let decoder = h.session.decoder.as_ref().unwrap();
        assert_eq!(decoder.transition(), Transition::None);
        assert!(decoder.input_buffers_balanced());
        assert_eq!(decoder.input_buffers_at_component(), 0);
    }

    #[test]
    fn reset_mid_stream() {
        let mut h = harness();
        h.reach_steady_state();

        h.decode(20);
        h.decode(21);
        assert_eq!(h.component.held_input_count(), 2);

        h.session.reset();
        h.session.run_pending();

        assert_eq!(h.client.count(&ClientEvent::ResetDone), 1);
        // The inputs were consumed, but no pictures surfaced for them.
        assert!(h.client.end_of_bitstream_ids().contains(&20));
        assert!(h.client.end_of_bitstream_ids().contains(&21));
        assert!(!h.client.ready_bitstream_ids().contains(&20));
        assert!(!h.client.ready_bitstream_ids().contains(&21));
        // Every picture drained by the reset went back to the component.
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS);
        assert!(h.session.decoder.as_ref().unwrap().input_buffers_balanced());

        // Decoding resumes.
        h.decode(30);
        h.component.complete_next_input();
        h.component.produce_frame(30);
        h.session.run_pending();
        assert!(h.client.ready_bitstream_ids().contains(&30));
        assert!(h.client.errors().is_empty());
    }

    #[test]
    fn reset_reissues_pictures_in_order() {
        let mut h = harness();
        h.reach_steady_state();

        let fills_before = h
            .component
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::Filled(id) => Some(*id),
                _ => None,
            })
            .collect::<Vec<_>>();
        let real_fills = &fills_before[fills_before.len() - NUM_PICTURE_BUFFERS..];

        h.session.reset();
        h.session.run_pending();
        assert_eq!(h.client.count(&ClientEvent::ResetDone), 1);

        let fills_after = h
            .component
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::Filled(id) => Some(*id),
                _ => None,
            })
            .collect::<Vec<_>>();
        // Deferred pictures were re-issued in the order they came back.
        assert_eq!(&fills_after[fills_after.len() - NUM_PICTURE_BUFFERS..], real_fills);
    }

    #[test]
    fn destroy_during_flush() {
        let mut h = harness();
        h.reach_steady_state();

        h.session.flush();
        h.session.run_pending();
        assert_eq!(h.component.held_input_count(), 1);

        let events_before = h.client.events().len();
        h.session.destroy();
        h.session.run_pending();

        assert!(h.session.is_torn_down());
        assert!(h.core.handle_freed());
        assert_eq!(h.core.deinit_count(), 1);
        assert_eq!(h.component.held_input_count(), 0);
        assert_eq!(h.component.held_output_count(), 0);
        // No client callback fired after destroy() returned.
        assert_eq!(h.client.events().len(), events_before);

        // Every registered buffer was freed exactly once: 2 inputs, 8 fakes
        // (retired during renegotiation) and 8 real outputs.
        let freed = h.component.freed_ids();
        assert_eq!(freed.len(), 2 + 2 * NUM_PICTURE_BUFFERS);
        let mut unique = freed.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), freed.len());
    }

    #[test]
    fn destroy_overrides_reset() {
        let mut h = harness();
        h.reach_steady_state();

        h.decode(20);
        h.session.reset();
        // The Pause confirmation is still queued when Destroy() lands; it
        // must be swallowed as a stale arrival.
        h.session.destroy();
        h.session.run_pending();

        assert!(h.session.is_torn_down());
        assert!(h.core.handle_freed());
        assert_eq!(h.client.count(&ClientEvent::ResetDone), 0);
    }

    #[test]
    fn unsupported_profile_maps_to_high444() {
        let mut h = harness();
        assert!(h.initialize(VideoProfile::H264StereoHigh));
        assert_eq!(h.client.count(&ClientEvent::InitializationComplete(true)), 1);
        assert_eq!(h.component.role().as_deref(), Some("video_decoder.avc"));
        assert_eq!(
            h.session.decoder.as_ref().unwrap().codec(),
            Some(Codec::H264(AvcProfile::High444))
        );
        // The alias is accepted but never advertised.
        assert!(!supported_profiles()
            .iter()
            .any(|p| p.profile == VideoProfile::H264StereoHigh));
    }

    #[test]
    fn vp8_selects_the_vpx_role() {
        let mut h = harness();
        assert!(h.initialize(VideoProfile::Vp8));
        assert_eq!(h.core.role_queries(), vec!["video_decoder.vpx".to_owned()]);
        assert_eq!(h.component.role().as_deref(), Some("video_decoder.vpx"));
        assert_eq!(h.session.decoder.as_ref().unwrap().codec(), Some(Codec::Vp8));
    }

    #[test]
    fn component_failure_on_empty_this_buffer() {
        let mut h = harness();
        h.reach_steady_state();

        h.component.set_fail_empty_this_buffer(true);
        h.decode(40);

        assert_eq!(h.client.errors(), vec![DecodeError::PlatformFailure]);
        assert!(h.core.handle_freed());

        // Everything after the error is a no-op.
        let events_after_error = h.client.events().len();
        h.session.flush();
        h.session.reset();
        h.decode(41);
        h.session.run_pending();
        assert_eq!(h.client.events().len(), events_after_error);

        // Destroy still completes cleanly.
        h.session.destroy();
        h.session.run_pending();
        assert!(h.session.is_torn_down());
    }

    #[test]
    fn fakes_retire_before_real_pictures() {
        let mut h = harness();
        assert!(h.initialize(VideoProfile::H264Baseline));

        h.decode(10);
        h.component.complete_next_input();
        h.session.run_pending();
        h.component.change_output_resolution(640, 360);
        h.session.run_pending();
        assert_eq!(
            h.client.count(&ClientEvent::ProvidePictureBuffers {
                count: NUM_PICTURE_BUFFERS as u32,
                format: PixelFormat::Nv12,
                dimensions: Resolution::from((640, 360)),
            }),
            1
        );
        h.assign_pictures();

        // The fake buffers (allocated right after the 2 input slots) were
        // all freed before the first real output buffer was handed over.
        let ops = h.component.ops();
        let fake_free_positions: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::Freed(_) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(fake_free_positions.len(), NUM_PICTURE_BUFFERS);
        let first_real_fill = ops
            .iter()
            .position(|op| match op {
                Op::Filled(id) => id.0 >= (INPUT_BUFFER_COUNT + NUM_PICTURE_BUFFERS as u32),
                _ => false,
            })
            .expect("no real output was submitted");
        assert!(fake_free_positions.iter().all(|&i| i < first_real_fill));
    }

    #[test]
    fn resize_with_pictures_assigned_is_a_platform_failure() {
        let mut h = harness();
        h.reach_steady_state();

        h.component.change_output_resolution(1280, 720);
        h.session.run_pending();
        assert_eq!(h.client.errors(), vec![DecodeError::PlatformFailure]);
    }

    #[test]
    fn picture_reuse_waits_for_the_fence() {
        let mut h = harness_with(FakeGraphics { fence_delay_polls: 1 });
        h.reach_steady_state();

        h.component.produce_frame(10);
        h.session.run_pending();
        let picture = match h.client.events().pop() {
            Some(ClientEvent::PictureReady(picture)) => picture,
            other => panic!("expected a picture, got {:?}", other),
        };
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS - 1);

        h.session.reuse_picture_buffer(picture.picture_buffer_id);
        h.session.run_pending();
        // The fence has not signaled; the buffer is not back yet.
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS - 1);

        std::thread::sleep(Duration::from_millis(10));
        h.session.run_pending();
        assert_eq!(h.component.held_output_count(), NUM_PICTURE_BUFFERS);
    }

    #[test]
    fn reusing_an_unknown_picture_is_an_invalid_argument() {
        let mut h = harness();
        h.reach_steady_state();

        h.session.reuse_picture_buffer(999);
        h.session.run_pending();
        assert_eq!(h.client.errors(), vec![DecodeError::InvalidArgument]);
    }

    #[test]
    fn dropping_the_session_drains_the_teardown() {
        let mut h = harness();
        h.reach_steady_state();

        drop(h.session);
        assert!(h.core.handle_freed());
        assert_eq!(h.core.deinit_count(), 1);
        assert_eq!(h.component.state(), OmxState::Loaded);
        assert_eq!(h.component.held_input_count(), 0);
        assert_eq!(h.component.held_output_count(), 0);
    }

    #[test]
    fn destroy_without_initialize() {
        let mut h = harness();
        h.session.destroy();
        assert!(h.session.is_torn_down());
        assert!(!h.core.handle_freed());
        // The core was initialized in new(), so it is still deinitialized.
        assert_eq!(h.core.deinit_count(), 1);
    }

    #[test]
    fn client_calls_after_destroy_are_refused() {
        let mut h = harness();
        h.reach_steady_state();

        h.session.destroy();
        h.session.run_pending();
        assert!(h.session.is_torn_down());

        // None of these may panic or reach the component.
        let ops_before = h.component.ops().len();
        h.decode(50);
        h.session.flush();
        h.session.reset();
        h.session.destroy();
        h.session.run_pending();
        assert_eq!(h.component.ops().len(), ops_before);
    }
}
