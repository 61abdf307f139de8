//! Virtual frames: the bounded ring of in-flight submissions.
//!
//! Each frame owns one graphics and one compute command pool and buffer,
//! a `rendered` semaphore for presentation, two fences, and one sync
//! object (availability semaphore + acquired image) per window attachment.
//! A frame's resources are reused only after its fences signal; acquiring
//! a frame therefore waits on whatever it submitted last time around.

use std::sync::Arc;

use anyhow::Result;
use ash::vk::{self, Handle};
use bitflags::bitflags;

use crate::{
    backing::Attach,
    deps::{Inject, InjectKind, Injection},
    graph::{self, PassType},
    renderer::Renderer,
    types::RecreateFlags,
    vulkan::{swapchain, DeviceShared, Fence, Semaphore},
    RenderError, RenderResult,
};

bitflags! {
    /// Which queues a frame has actually submitted on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Submitted: u32 {
        const GRAPHICS = 0x1;
        const COMPUTE  = 0x2;
    }
}

/// Per-window synchronization of one frame.
pub(crate) struct FrameSync {
    /// Attachment index of the window.
    pub(crate) attach: usize,
    pub(crate) available: Semaphore,
    /// Acquired swapchain image, if any this frame.
    pub(crate) image: Option<u32>,
}

pub(crate) struct FrameQueue {
    device: Arc<DeviceShared>,
    pub(crate) pool: vk::CommandPool,
    pub(crate) cmd: vk::CommandBuffer,
    pub(crate) done: Fence,
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        // Command buffers are freed with their pool.
        unsafe {
            self.device.raw.destroy_command_pool(self.pool, None);
        }
    }
}

pub struct Frame {
    device: Arc<DeviceShared>,
    index: u32,

    pub(crate) submitted: Submitted,

    /// Maps attachment index to an index into `syncs`.
    pub(crate) refs: Vec<Option<usize>>,
    pub(crate) syncs: Vec<FrameSync>,

    /// Signaled by the graphics submission, waited on by presentation.
    pub(crate) rendered: Semaphore,
    pub(crate) graphics: FrameQueue,
    pub(crate) compute: FrameQueue,

    /// Dependency semaphores this frame waits on or signals; released
    /// once its fences have been waited on again.
    pub(crate) retained: Vec<Arc<Semaphore>>,
}

fn create_queue(device: &Arc<DeviceShared>, family_index: u32) -> Result<FrameQueue> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family_index)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { device.raw.create_command_pool(&pool_info, None)? };

    let allocate_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = match unsafe { device.raw.allocate_command_buffers(&allocate_info) } {
        Ok(buffers) => buffers[0],
        Err(result) => {
            unsafe { device.raw.destroy_command_pool(pool, None) };
            return Err(result.into());
        }
    };

    let done = match Fence::new(device.clone()) {
        Ok(done) => done,
        Err(result) => {
            unsafe { device.raw.destroy_command_pool(pool, None) };
            return Err(result.into());
        }
    };

    Ok(FrameQueue {
        device: device.clone(),
        pool,
        cmd,
        done,
    })
}

impl Frame {
    pub(crate) fn new(device: Arc<DeviceShared>, index: u32) -> Result<Self> {
        let rendered = Semaphore::new(device.clone())?;
        let graphics = create_queue(&device, device.graphics.family_index)?;
        let compute = create_queue(&device, device.compute.family_index)?;

        Ok(Self {
            device,
            index,
            submitted: Submitted::empty(),
            refs: Vec::new(),
            syncs: Vec::new(),
            rendered,
            graphics,
            compute,
            retained: Vec::new(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Swapchain image this frame acquired for a window attachment.
    pub(crate) fn swapchain_index(&self, attach: usize) -> Option<u32> {
        let sync = (*self.refs.get(attach)?)?;
        self.syncs.get(sync)?.image
    }

    /// Waits until the frame's previous submissions are done; with `reset`
    /// also resets fences, command pools and per-frame scratch so the
    /// frame can be recorded again. A lost device surfaces as its own
    /// non-recoverable kind.
    pub(crate) fn sync(&mut self, reset: bool) -> RenderResult<()> {
        let mut fences = Vec::with_capacity(2);
        if self.submitted.contains(Submitted::GRAPHICS) {
            fences.push(self.graphics.done.raw);
        }
        if self.submitted.contains(Submitted::COMPUTE) {
            fences.push(self.compute.done.raw);
        }

        if !fences.is_empty() {
            unsafe {
                self.device
                    .raw
                    .wait_for_fences(&fences, true, u64::MAX)
                    .map_err(RenderError::from_vk)?;
            }

            if reset {
                unsafe {
                    self.device
                        .raw
                        .reset_fences(&fences)
                        .map_err(RenderError::from_vk)?;
                }
                // Cannot wait on them again.
                self.submitted = Submitted::empty();
            }
        }

        if reset {
            unsafe {
                self.device.raw.reset_command_pool(
                    self.graphics.pool,
                    vk::CommandPoolResetFlags::empty(),
                )?;
                self.device.raw.reset_command_pool(
                    self.compute.pool,
                    vk::CommandPoolResetFlags::empty(),
                )?;
            }
            self.retained.clear();
        }

        Ok(())
    }

    /// Grows or shrinks the sync objects to one per window attachment.
    fn resize_syncs(&mut self, count: usize) -> RenderResult<()> {
        self.syncs.truncate(count);
        while self.syncs.len() < count {
            self.syncs.push(FrameSync {
                attach: usize::MAX,
                available: Semaphore::new(self.device.clone())?,
                image: None,
            });
        }
        Ok(())
    }
}

impl Renderer {
    /// Blocks until every frame's submissions have completed, then purges
    /// resources whose lifetime was bound to them.
    pub(crate) fn stall_all_frames(&mut self) {
        for frame in &mut self.frames {
            if let Err(error) = frame.sync(false) {
                log::error!("Synchronization of virtual frame failed: {}", error);
            }
        }

        if !self.stale.is_empty() {
            self.stale.purge(&self.device);
        }
    }

    /// Acquires the next virtual frame, blocking until it is available.
    /// Implicitly submits the previously acquired frame first.
    pub fn acquire(&mut self) -> RenderResult<&Frame> {
        if self.acquired.is_some() {
            self.submit(&[])?;
        }

        let index = self.next_frame;
        self.frames[index].sync(true)?;

        // One sync object per window attachment, then acquire images.
        let window_count = self.backing.window_count();
        self.frames[index].resize_syncs(window_count)?;

        let frame = &mut self.frames[index];
        frame.refs.clear();
        frame.refs.resize(self.backing.len(), None);

        // Without render passes there is nothing to present and acquiring
        // images would synchronize for no reason.
        let acquire_swap = self.graph.num_render > 0;
        let mut all_flags = RecreateFlags::empty();

        let mut sync_index = 0;
        for index_attach in 0..self.backing.len() {
            let Some(Attach::Window(window)) = self.backing.get_mut(index_attach) else {
                continue;
            };

            // Flags stashed by the previous frame's presentation.
            let mut flags = std::mem::take(&mut window.pending);

            let sync = &mut frame.syncs[sync_index];
            sync.attach = index_attach;
            frame.refs[index_attach] = Some(sync_index);
            sync_index += 1;

            if acquire_swap {
                let (image, acquire_flags) = window
                    .window
                    .acquire(sync.available.raw)
                    .map_err(RenderError::from_vk)?;
                sync.image = image;
                flags |= acquire_flags;
            } else {
                sync.image = None;
            }

            all_flags |= flags;
        }

        // Swapchain-dependent resources went stale: stall everything and
        // rebuild exactly what the flags call for.
        if all_flags.contains(RecreateFlags::RECREATE) {
            self.stall_all_frames();

            // Only a resize recreates referenceable attachments, which
            // descriptor sets may point at.
            if all_flags.contains(RecreateFlags::RESIZE) {
                self.pool.reset(&mut self.pool_subs);
            }

            self.backing.rebuild(&self.device, all_flags);
            self.graph.rebuild(
                &self.device,
                &self.backing,
                &self.cache,
                all_flags,
                &mut self.stale,
            )?;

            self.stale.purge(&self.device);

            for (_, attach) in self.backing.iter() {
                if let Attach::Window(window) = attach {
                    window.window.purge_stale();
                }
            }
        }

        // Make sure everything is built; no-ops when nothing changed.
        self.backing.build(&self.device)?;
        self.graph
            .build(&self.device, &self.backing, &self.cache, &mut self.stale)?;

        self.recording = true;
        self.acquired = Some(index);
        Ok(&self.frames[index])
    }

    /// Records all passes of one queue partition into `cmd`.
    ///
    /// Frame-level injections wrap the partition: waits are caught before
    /// its first pass, signals prepared after its last.
    #[allow(clippy::too_many_arguments)]
    fn record_passes(
        &self,
        frame_index: usize,
        positions: std::ops::Range<usize>,
        cmd: vk::CommandBuffer,
        injection: &mut Injection,
        frame_injects: &[Inject],
    ) -> RenderResult<()> {
        let device = &self.device;
        let frame = &self.frames[frame_index];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.raw.begin_command_buffer(cmd, &begin_info)?;
        }

        for position in positions.clone() {
            let pass_index = self.graph.order[position];
            let pass = &self.graph.arena[pass_index];

            // Wait commands first: frame-wide ones at the partition start,
            // pass-held ones at their pass.
            if position == positions.start {
                for inject in frame_injects {
                    if inject.kind == InjectKind::Wait {
                        inject.dep.catch(inject, injection);
                    }
                }
            }
            for inject in &pass.injects {
                if inject.kind == InjectKind::Wait {
                    inject.dep.catch(inject, injection);
                }
            }

            // Inter-pass barriers derived from the graph analysis, flushed
            // in one call before the pass's own commands.
            for consume_index in 0..pass.consumes.len() {
                let attach = pass.consumes[consume_index].index;
                graph::push_consume_barrier(
                    &self.graph,
                    &self.backing,
                    pass_index,
                    consume_index,
                    frame.swapchain_index(attach),
                    injection,
                );
            }
            injection.flush(device, cmd);

            let mut recordable = true;

            if pass.ty == PassType::Render {
                let derived = pass.render.as_ref().unwrap();

                let swapchain_image = derived
                    .backing
                    .and_then(|attach| frame.swapchain_index(attach));
                let framebuffer = pass.framebuffer(swapchain_image);

                // An unbuilt pass (zero extent, minimized window) is
                // transiently skipped, not an error.
                if derived.vk_pass.is_null() || framebuffer.is_null() {
                    recordable = false;
                } else {
                    let begin_info = vk::RenderPassBeginInfo::default()
                        .render_pass(derived.vk_pass)
                        .framebuffer(framebuffer)
                        .clear_values(&derived.clears)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: pass.render_area(),
                        });

                    unsafe {
                        device.raw.cmd_begin_render_pass(
                            cmd,
                            &begin_info,
                            vk::SubpassContents::INLINE,
                        );
                    }
                }
            }

            if recordable {
                let mut recorders = self.recorders.lock();
                for recorder in recorders.iter_mut() {
                    if recorder.pass == pass_index {
                        recorder.record(pass.order, cmd);
                    }
                }
            }

            if pass.ty == PassType::Render && recordable {
                unsafe {
                    device.raw.cmd_end_render_pass(cmd);
                }
            }

            // Signal commands last, whether or not the pass recorded.
            for inject in &pass.injects {
                if inject.kind == InjectKind::Signal {
                    inject.dep.prepare(inject, injection);
                }
            }
            if position + 1 == positions.end {
                for inject in frame_injects {
                    if inject.kind == InjectKind::Signal {
                        inject.dep.prepare(inject, injection);
                    }
                }
            }
        }

        unsafe {
            device.raw.end_command_buffer(cmd)?;
        }

        Ok(())
    }

    /// Submits the acquired frame: records and submits the graphics
    /// partition, presents all presentable windows in one batch, then
    /// records and submits the async-compute partition.
    ///
    /// Submission failure cannot be recovered from; the frame is finalized
    /// with abort semantics and subsequent acquires still succeed. A lost
    /// device surfaces as [`RenderError::DeviceLost`], any other failed
    /// queue submission as [`RenderError::QueueSubmitFailed`].
    pub fn submit(&mut self, injects: &[Inject]) -> RenderResult<()> {
        let Some(frame_index) = self.acquired.take() else {
            return Err(RenderError::GraphInvalid("no virtual frame was acquired"));
        };
        self.recording = false;

        let num_graphics = self.graph.num_render;
        let num_compute = self.graph.order.len() - num_graphics;
        let mut failure: Option<RenderError> = None;

        // Graphics partition.
        if num_graphics > 0 {
            let mut injection = Injection::new(self.device.graphics.family_index);
            let cmd = self.frames[frame_index].graphics.cmd;

            match self.record_passes(frame_index, 0..num_graphics, cmd, &mut injection, injects) {
                Ok(()) => {
                    // Wait on every acquired swapchain image; they are only
                    // ever written as color attachments.
                    let mut windows = Vec::new();
                    let mut image_indices = Vec::new();

                    for sync in &self.frames[frame_index].syncs {
                        let Some(image) = sync.image else { continue };
                        if let Some(Attach::Window(window)) = self.backing.get(sync.attach) {
                            injection.wait_semaphores.push(sync.available.raw);
                            injection
                                .wait_stages
                                .push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
                            windows.push(window.window.clone());
                            image_indices.push(image);
                        }
                    }

                    let mut signals = injection.signal_semaphores.clone();
                    if !windows.is_empty() {
                        signals.push(self.frames[frame_index].rendered.raw);
                    }

                    let submit = self.device.graphics.submit(
                        &[cmd],
                        &injection.wait_semaphores,
                        &injection.wait_stages,
                        &signals,
                        self.frames[frame_index].graphics.done.raw,
                    );

                    match submit {
                        Ok(()) => {
                            self.frames[frame_index].submitted |= Submitted::GRAPHICS;

                            // One batched present; resulting flags are
                            // stashed on the window attachments so the next
                            // acquire rebuilds before acquiring.
                            if !windows.is_empty() {
                                let rendered = self.frames[frame_index].rendered.raw;
                                let flags = swapchain::present_windows(
                                    &self.device.graphics,
                                    &[rendered],
                                    &windows,
                                    &image_indices,
                                );

                                let mut presented = 0;
                                for sync_index in 0..self.frames[frame_index].syncs.len() {
                                    let (attach, image) = {
                                        let sync = &self.frames[frame_index].syncs[sync_index];
                                        (sync.attach, sync.image)
                                    };
                                    if image.is_none() {
                                        continue;
                                    }
                                    if let Some(Attach::Window(window)) =
                                        self.backing.get_mut(attach)
                                    {
                                        window.pending |= flags[presented];
                                    }
                                    presented += 1;
                                }
                            }
                        }
                        Err(result) => {
                            log::error!("Could not submit to the graphics queue: {}", result);
                            failure = Some(RenderError::from_submit(result));
                        }
                    }
                }
                Err(error) => {
                    log::error!("Could not record the graphics partition: {}", error);
                    failure = Some(error);
                }
            }

            self.frames[frame_index].retained.append(&mut injection.retained);
        }

        // Async-compute partition.
        if num_compute > 0 && failure.is_none() {
            let mut injection = Injection::new(self.device.compute.family_index);
            let cmd = self.frames[frame_index].compute.cmd;

            match self.record_passes(
                frame_index,
                num_graphics..num_graphics + num_compute,
                cmd,
                &mut injection,
                injects,
            ) {
                Ok(()) => {
                    let submit = self.device.compute.submit(
                        &[cmd],
                        &injection.wait_semaphores,
                        &injection.wait_stages,
                        &injection.signal_semaphores,
                        self.frames[frame_index].compute.done.raw,
                    );

                    match submit {
                        Ok(()) => self.frames[frame_index].submitted |= Submitted::COMPUTE,
                        Err(result) => {
                            log::error!("Could not submit to the compute queue: {}", result);
                            failure = Some(RenderError::from_submit(result));
                        }
                    }
                }
                Err(error) => {
                    log::error!("Could not record the compute partition: {}", error);
                    failure = Some(error);
                }
            }

            self.frames[frame_index].retained.append(&mut injection.retained);
        }

        // Finalize every dependency touched this frame, then drop the
        // processed injection commands.
        let mut deps: Vec<Arc<crate::deps::Dependency>> = Vec::new();
        let mut remember = |inject: &Inject| {
            if !deps.iter().any(|dep| Arc::ptr_eq(dep, &inject.dep)) {
                deps.push(inject.dep.clone());
            }
        };
        for inject in injects {
            remember(inject);
        }
        for pass in &mut self.graph.arena {
            for inject in &pass.injects {
                remember(inject);
            }
            pass.injects.clear();
        }
        for dep in deps {
            if failure.is_none() {
                dep.finish();
            } else {
                dep.abort();
            }
        }

        self.recorders.lock().clear();

        // Post-submission upkeep: promote this frame's cache inserts and
        // let the pool age its descriptor sets.
        self.cache.flush();
        self.pool.flush(&mut self.pool_subs);

        self.next_frame = (frame_index + 1) % self.frames.len();

        match failure {
            None => Ok(()),
            Some(error) => {
                log::error!("Submission of virtual frame failed.");
                Err(error)
            }
        }
    }
}
