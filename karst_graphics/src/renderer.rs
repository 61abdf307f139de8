//! The renderer: owner of attachments, graph, frames, caches and pool.
//!
//! A renderer is driven by one thread (or behind one exclusive handle):
//! describe attachments, declare passes and their consumptions, then loop
//! `acquire`/`submit`. Everything derived (render passes, framebuffers,
//! pipelines, descriptor sets) is rebuilt on demand when declarations or
//! swapchains change.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

use crate::{
    backing::{Attach, Backing},
    cache::{
        Cache, CacheDescriptor, CacheElem, ComputePipelineDescriptor, GraphicsPipelineDescriptor,
        PipelineLayoutDescriptor, SamplerDescriptor, SetLayoutDescriptor, ShaderModule,
        ShaderStageDescriptor, UpdateData,
    },
    deps::Inject,
    frame::Frame,
    graph::{pass::BlendOpState, Graph, PassId, PassType, RenderState, StaleResources},
    hash::{HashBuilder, HashKey},
    pool::{DescriptorPool, PoolSub},
    types::{AccessMask, AttachmentDescription, ImageAspect, Range, StageMask, ViewType},
    vulkan::{swapchain::Window, DeviceShared},
    RenderError, RenderResult,
};

/// Recording callback bound to one pass for the current frame.
pub(crate) struct RecorderEntry {
    pub(crate) pass: usize,
    pub(crate) callback: Box<dyn FnMut(u32, vk::CommandBuffer) + Send>,
}

impl RecorderEntry {
    pub(crate) fn record(&mut self, order: u32, cmd: vk::CommandBuffer) {
        (self.callback)(order, cmd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechniqueId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetId(usize);

/// Shaders plus their binding layout, resolved through the object cache.
struct Technique {
    shaders: Vec<Arc<ShaderModule>>,
    set_descriptors: Vec<SetLayoutDescriptor>,
    set_layouts: Vec<Arc<CacheElem>>,
    layout: Arc<CacheElem>,
}

/// What a descriptor binding is pointed at.
#[derive(Clone)]
pub enum SetResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    ImageSampler {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: Arc<CacheElem>,
    },
    Sampler(Arc<CacheElem>),
}

#[derive(Clone)]
pub struct SetWrite {
    pub binding: u32,
    pub element: u32,
    pub resource: SetResource,
}

/// A descriptor set: layout + composed key + update blob. The actual
/// Vulkan set is fetched from the pool on demand, so recycling and pool
/// resets are transparent.
struct Set {
    layout: Arc<CacheElem>,
    key: HashKey,
    update: Vec<UpdateData>,
}

/// Vertex input of a graphics pipeline; everything else comes from the
/// pass state and the technique.
#[derive(Clone, Default)]
pub struct PrimitiveState {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

pub struct Renderer {
    pub(crate) device: Arc<DeviceShared>,

    pub(crate) cache: Cache,
    pub(crate) pool: DescriptorPool,
    pub(crate) pool_subs: Vec<PoolSub>,

    pub(crate) backing: Backing,
    pub(crate) graph: Graph,
    pub(crate) stale: StaleResources,

    pub(crate) frames: Vec<Frame>,
    pub(crate) next_frame: usize,
    pub(crate) acquired: Option<usize>,
    pub(crate) recording: bool,

    pub(crate) recorders: Mutex<Vec<RecorderEntry>>,

    techniques: Vec<Technique>,
    sets: Vec<Set>,
}

impl Renderer {
    /// Creates a renderer with `frames` virtual frames (must be > 0,
    /// preferably > 1).
    pub fn new(display_handle: RawDisplayHandle, frames: u32) -> Result<Self> {
        let device = DeviceShared::new(display_handle)?;
        Self::with_device(device, frames)
    }

    pub fn with_device(device: Arc<DeviceShared>, frames: u32) -> Result<Self> {
        anyhow::ensure!(frames > 0, "A renderer needs at least one virtual frame.");

        let cache = Cache::new(device.clone())?;
        let pool = DescriptorPool::new(device.clone(), frames + 1);

        let frames = (0..frames)
            .map(|index| Frame::new(device.clone(), index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device,
            cache,
            pool,
            pool_subs: vec![PoolSub::default()],
            backing: Backing::default(),
            graph: Graph::default(),
            stale: StaleResources::default(),
            frames,
            next_frame: 0,
            acquired: None,
            recording: false,
            recorders: Mutex::new(Vec::new()),
            techniques: Vec::new(),
            sets: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<DeviceShared> {
        &self.device
    }

    fn ensure_not_recording(&self) -> RenderResult<()> {
        if self.recording {
            return Err(RenderError::GraphInvalid(
                "renderer cannot be mutated while recording a frame",
            ));
        }
        Ok(())
    }

    // Attachment handling.

    /// Describes the image attachment at `index`, overwriting any previous
    /// description. Replacing a possibly referenced attachment stalls all
    /// frames first.
    pub fn attach(&mut self, index: usize, description: AttachmentDescription) -> RenderResult<()> {
        self.ensure_not_recording()?;

        if !matches!(self.backing.get(index), None | Some(Attach::Empty)) {
            self.stall_all_frames();
            self.pool.reset(&mut self.pool_subs);
        }

        if let Some(Attach::Window(window)) = self.backing.get(index) {
            window.window.unlock();
        }

        if self.backing.describe(&self.device, index, description) {
            self.graph.invalidate(&mut self.stale);
        }

        Ok(())
    }

    /// Attaches a window at `index`. Fails when the window is already
    /// attached to some renderer attachment.
    pub fn attach_window(&mut self, index: usize, window: Arc<Window>) -> RenderResult<()> {
        self.ensure_not_recording()?;

        if let Some(Attach::Window(existing)) = self.backing.get(index) {
            if Arc::ptr_eq(&existing.window, &window) {
                return Ok(());
            }
        }

        if !window.try_lock() {
            log::warn!(
                "A window can only be attached to one attachment index of \
                 one renderer at a time."
            );
            return Err(RenderError::GraphInvalid("window is already attached"));
        }

        if !matches!(self.backing.get(index), None | Some(Attach::Empty)) {
            self.stall_all_frames();
            if let Some(Attach::Window(existing)) = self.backing.get(index) {
                existing.window.unlock();
            }
            self.backing.detach(&self.device, index);
        }

        self.backing.attach_window(index, window);
        self.graph.invalidate(&mut self.stale);

        Ok(())
    }

    /// Properties of the image attachment at `index`, if described.
    pub fn attachment(&self, index: usize) -> Option<AttachmentDescription> {
        match self.backing.get(index) {
            Some(Attach::Image(image)) => Some(image.description.clone()),
            _ => None,
        }
    }

    /// The window attached at `index`, if any.
    pub fn window(&self, index: usize) -> Option<Arc<Window>> {
        match self.backing.get(index) {
            Some(Attach::Window(window)) => Some(window.window.clone()),
            _ => None,
        }
    }

    /// Detaches whatever occupies `index`. Stalls all frames when anything
    /// is actually destroyed.
    pub fn detach(&mut self, index: usize) {
        if self.ensure_not_recording().is_err() {
            log::warn!("Cannot detach an attachment while recording.");
            return;
        }

        if matches!(self.backing.get(index), None | Some(Attach::Empty)) {
            return;
        }

        self.stall_all_frames();
        self.pool.reset(&mut self.pool_subs);

        if let Some(Attach::Window(window)) = self.backing.get(index) {
            window.window.unlock();
        }
        self.backing.detach(&self.device, index);
        self.graph.invalidate(&mut self.stale);
    }

    // Pass handling.

    /// Adds a pass after all its parents in submission order.
    pub fn add_pass(&mut self, ty: PassType, parents: &[PassId]) -> RenderResult<PassId> {
        self.ensure_not_recording()?;
        let id = self.graph.add_pass(ty, parents)?;
        self.graph.invalidate(&mut self.stale);
        Ok(id)
    }

    /// Number of target passes (passes no other pass depends on).
    pub fn num_targets(&self) -> usize {
        self.graph.num_targets()
    }

    pub fn target(&self, index: usize) -> Option<PassId> {
        self.graph.target(index)
    }

    /// Consumes an attachment: whole resource, all aspects.
    pub fn pass_consume(
        &mut self,
        pass: PassId,
        index: usize,
        mask: AccessMask,
        stage: StageMask,
    ) -> RenderResult<()> {
        self.pass_consume_inner(pass, index, mask, stage, None, None)
    }

    /// Consumes a range (area) of an attachment.
    pub fn pass_consume_range(
        &mut self,
        pass: PassId,
        index: usize,
        mask: AccessMask,
        stage: StageMask,
        range: Range,
    ) -> RenderResult<()> {
        self.pass_consume_inner(pass, index, mask, stage, Some(range), None)
    }

    /// Consumes an attachment with a specific view.
    pub fn pass_consume_view(
        &mut self,
        pass: PassId,
        index: usize,
        mask: AccessMask,
        stage: StageMask,
        range: Range,
        view_type: ViewType,
    ) -> RenderResult<()> {
        self.pass_consume_inner(pass, index, mask, stage, Some(range), Some(view_type))
    }

    fn pass_consume_inner(
        &mut self,
        pass: PassId,
        index: usize,
        mask: AccessMask,
        stage: StageMask,
        range: Option<Range>,
        view_type: Option<ViewType>,
    ) -> RenderResult<()> {
        self.ensure_not_recording()?;
        let pass = self
            .graph
            .pass_mut(pass)
            .ok_or(RenderError::GraphInvalid("pass does not exist"))?;

        pass.consume(index, mask, stage, range, view_type);
        self.graph.invalidate(&mut self.stale);
        Ok(())
    }

    /// Releases any consumption of an attachment.
    pub fn pass_release(&mut self, pass: PassId, index: usize) {
        if self.ensure_not_recording().is_err() {
            log::warn!("Cannot edit consumptions while recording.");
            return;
        }
        if let Some(pass) = self.graph.pass_mut(pass) {
            pass.release(index);
            self.graph.invalidate(&mut self.stale);
        }
    }

    pub fn pass_clear(
        &mut self,
        pass: PassId,
        index: usize,
        aspect: ImageAspect,
        value: vk::ClearValue,
    ) {
        if self.ensure_not_recording().is_err() {
            log::warn!("Cannot edit consumptions while recording.");
            return;
        }
        if let Some(pass) = self.graph.pass_mut(pass) {
            pass.set_clear(index, aspect, value);
            self.graph.invalidate(&mut self.stale);
        }
    }

    pub fn pass_blend(
        &mut self,
        pass: PassId,
        index: usize,
        color: BlendOpState,
        alpha: BlendOpState,
    ) {
        if self.ensure_not_recording().is_err() {
            log::warn!("Cannot edit consumptions while recording.");
            return;
        }
        if let Some(pass) = self.graph.pass_mut(pass) {
            pass.set_blend(index, color, alpha);
            self.graph.invalidate(&mut self.stale);
        }
    }

    pub fn pass_resolve(&mut self, pass: PassId, index: usize, resolve: usize) {
        if self.ensure_not_recording().is_err() {
            log::warn!("Cannot edit consumptions while recording.");
            return;
        }
        if let Some(pass) = self.graph.pass_mut(pass) {
            if pass.set_resolve(index, resolve) {
                self.graph.invalidate(&mut self.stale);
            }
        }
    }

    /// Sets the fixed-function state of a render pass.
    pub fn pass_set_state(&mut self, pass: PassId, state: RenderState) {
        if let Some(pass) = self.graph.pass_mut(pass) {
            let (new_blends, _) = pass.set_state(state);
            // New blend operations reshape derived per-attachment state.
            if new_blends {
                self.graph.invalidate(&mut self.stale);
            }
        }
    }

    pub fn pass_state(&self, pass: PassId) -> Option<RenderState> {
        self.graph.pass(pass).and_then(|pass| pass.state())
    }

    pub fn pass_parents(&self, pass: PassId) -> Vec<PassId> {
        self.graph
            .pass(pass)
            .map(|pass| pass.parents().iter().map(|&index| PassId(index)).collect())
            .unwrap_or_default()
    }

    /// Appends a dependency command processed around this pass at the next
    /// submission.
    pub fn pass_inject(&mut self, pass: PassId, inject: Inject) {
        if let Some(pass) = self.graph.pass_mut(pass) {
            pass.injects.push(inject);
        }
    }

    /// Registers a recording callback for one pass, fired during the next
    /// submission with the pass's submission order and command buffer.
    pub fn record_pass(
        &mut self,
        pass: PassId,
        callback: impl FnMut(u32, vk::CommandBuffer) + Send + 'static,
    ) {
        self.recorders.lock().push(RecorderEntry {
            pass: pass.0,
            callback: Box::new(callback),
        });
    }

    // Technique & set handling.

    /// Adds a technique: shader modules plus the explicit binding layout
    /// of every descriptor set they use. Set layouts and the pipeline
    /// layout resolve through the object cache.
    pub fn add_technique(
        &mut self,
        shaders: &[Arc<ShaderModule>],
        sets: Vec<SetLayoutDescriptor>,
        push_constants: &[vk::PushConstantRange],
    ) -> RenderResult<TechniqueId> {
        if shaders.is_empty() {
            return Err(RenderError::GraphInvalid("a technique needs shaders"));
        }

        let set_layouts = sets
            .iter()
            .map(|descriptor| self.cache.get(&CacheDescriptor::SetLayout(descriptor)))
            .collect::<RenderResult<Vec<_>>>()?;

        let layout_descriptor = PipelineLayoutDescriptor {
            set_layouts: set_layouts.clone(),
            push_constants: push_constants.to_vec(),
        };
        let layout = self
            .cache
            .get(&CacheDescriptor::PipelineLayout(&layout_descriptor))?;

        let id = TechniqueId(self.techniques.len());
        self.techniques.push(Technique {
            shaders: shaders.to_vec(),
            set_descriptors: sets,
            set_layouts,
            layout,
        });

        Ok(id)
    }

    pub fn technique_layout(&self, technique: TechniqueId) -> Option<vk::PipelineLayout> {
        self.techniques
            .get(technique.0)
            .map(|technique| technique.layout.pipeline_layout())
    }

    /// Resolves a sampler through the object cache.
    pub fn sampler(&self, descriptor: &SamplerDescriptor) -> RenderResult<Arc<CacheElem>> {
        self.cache.get(&CacheDescriptor::Sampler(descriptor))
    }

    /// Creates a descriptor set of one of a technique's set layouts,
    /// pointing its bindings at the given resources.
    pub fn add_set(
        &mut self,
        technique: TechniqueId,
        set_index: usize,
        writes: &[SetWrite],
    ) -> RenderResult<SetId> {
        let technique = self
            .techniques
            .get(technique.0)
            .ok_or(RenderError::GraphInvalid("technique does not exist"))?;
        let descriptor = technique
            .set_descriptors
            .get(set_index)
            .ok_or(RenderError::GraphInvalid("set index out of range"))?;
        let layout = technique.set_layouts[set_index].clone();

        let (key, update) = compose_set(&layout, descriptor, writes);

        let id = SetId(self.sets.len());
        self.sets.push(Set {
            layout,
            key,
            update,
        });

        Ok(id)
    }

    /// The Vulkan descriptor set of a [`SetId`], allocated or reused from
    /// the pool. Valid for the current frame.
    pub fn set_descriptor(&mut self, set: SetId) -> RenderResult<vk::DescriptorSet> {
        let set = self
            .sets
            .get(set.0)
            .ok_or(RenderError::GraphInvalid("set does not exist"))?;
        let elem = self
            .pool
            .get(&mut self.pool_subs[0], &set.layout, &set.key, &set.update)?;
        Ok(elem.set())
    }

    /// Flags every descriptor set built from `set`'s key for reuse.
    pub fn recycle_set(&mut self, set: SetId) {
        let Some(set) = self.sets.get(set.0) else {
            return;
        };
        let key = set.key.clone();
        self.stall_all_frames();
        self.pool.recycle(&mut self.pool_subs, &key);
    }

    // Pipelines.

    fn graphics_pipeline_descriptor(
        &self,
        technique: TechniqueId,
        pass: PassId,
        primitive: &PrimitiveState,
    ) -> RenderResult<GraphicsPipelineDescriptor> {
        let technique = self
            .techniques
            .get(technique.0)
            .ok_or(RenderError::GraphInvalid("technique does not exist"))?;
        let pass = self
            .graph
            .pass(pass)
            .ok_or(RenderError::GraphInvalid("pass does not exist"))?;

        let derived = pass
            .render
            .as_ref()
            .filter(|derived| derived.pass_elem.is_some())
            .ok_or(RenderError::GraphInvalid(
                "pass is not a built render pass",
            ))?;

        let state = derived.state;

        let depth_stencil = Some(crate::cache::DepthStencilState {
            depth_test: state.depth.test,
            depth_write: state.depth.write,
            depth_compare: state.depth.compare,
            depth_bounds_test: state.depth.bounds.is_some(),
            stencil_test: state.stencil.test,
            front: state.stencil.front,
            back: state.stencil.back,
            min_depth_bounds: state.depth.bounds.map_or(0.0, |bounds| bounds[0]),
            max_depth_bounds: state.depth.bounds.map_or(1.0, |bounds| bounds[1]),
        });

        Ok(GraphicsPipelineDescriptor {
            stages: technique
                .shaders
                .iter()
                .map(|module| ShaderStageDescriptor {
                    module: module.clone(),
                    specialization: None,
                })
                .collect(),
            vertex_bindings: primitive.bindings.clone(),
            vertex_attributes: primitive.attributes.clone(),
            topology: state.raster.topology,
            primitive_restart: false,
            patch_control_points: None,
            samples: derived.samples,
            rasterization: crate::cache::RasterizationState {
                polygon_mode: state.raster.polygon_mode,
                cull_mode: state.raster.cull_mode,
                front_face: state.raster.front_face,
                depth_clamp: false,
                rasterizer_discard: false,
                line_width: 1.0,
            },
            depth_stencil,
            blend: Some(crate::cache::ColorBlendState {
                attachments: derived.blends.clone(),
                constants: state.blend.constants,
            }),
            layout: technique.layout.clone(),
            render_pass: derived.pass_elem.clone().unwrap(),
            subpass: 0,
        })
    }

    /// Resolves the graphics pipeline for a technique on a pass. Identical
    /// structural state always yields the same pipeline handle.
    pub fn graphics_pipeline(
        &self,
        technique: TechniqueId,
        pass: PassId,
        primitive: &PrimitiveState,
    ) -> RenderResult<vk::Pipeline> {
        let descriptor = self.graphics_pipeline_descriptor(technique, pass, primitive)?;
        let elem = self
            .cache
            .get(&CacheDescriptor::GraphicsPipeline(&descriptor))?;
        Ok(elem.pipeline())
    }

    /// Builds the pipeline into the immutable cache ahead of time. Must
    /// not run concurrently with pipeline lookups.
    pub fn warmup_graphics_pipeline(
        &self,
        technique: TechniqueId,
        pass: PassId,
        primitive: &PrimitiveState,
    ) -> RenderResult<()> {
        let descriptor = self.graphics_pipeline_descriptor(technique, pass, primitive)?;
        self.cache
            .warmup(&CacheDescriptor::GraphicsPipeline(&descriptor))
    }

    /// Resolves the compute pipeline for a technique whose first shader is
    /// a compute module.
    pub fn compute_pipeline(&self, technique: TechniqueId) -> RenderResult<vk::Pipeline> {
        let technique = self
            .techniques
            .get(technique.0)
            .ok_or(RenderError::GraphInvalid("technique does not exist"))?;
        let module = technique
            .shaders
            .iter()
            .find(|module| module.stage == vk::ShaderStageFlags::COMPUTE)
            .ok_or(RenderError::GraphInvalid("technique has no compute shader"))?;

        let descriptor = ComputePipelineDescriptor {
            stage: ShaderStageDescriptor {
                module: module.clone(),
                specialization: None,
            },
            layout: technique.layout.clone(),
        };
        let elem = self
            .cache
            .get(&CacheDescriptor::ComputePipeline(&descriptor))?;
        Ok(elem.pipeline())
    }

    /// Serializes the pipeline cache into its persistable blob.
    pub fn store_pipeline_cache(&self) -> RenderResult<Vec<u8>> {
        self.cache.store()
    }

    /// Validates and merges a blob produced by [`Self::store_pipeline_cache`]
    /// on a compatible device. An incompatible blob is skipped, not fatal.
    pub fn load_pipeline_cache(&self, blob: &[u8]) -> RenderResult<()> {
        self.cache.load(blob)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Force a final submission and block until all rendering is done.
        if self.acquired.is_some() {
            if let Err(error) = self.submit(&[]) {
                log::error!("Final submission on destruction failed: {}", error);
            }
        }
        self.stall_all_frames();
        self.device.wait_idle();

        self.graph.destruct(&mut self.stale);
        self.stale.purge(&self.device);

        for index in 0..self.backing.len() {
            if let Some(Attach::Window(window)) = self.backing.get(index) {
                window.window.unlock();
            }
        }
        self.backing.clear(&self.device);

        self.pool.clear(&mut self.pool_subs);
        // The cache destroys its objects on drop.
    }
}

/// Composes a set's lookup key and update blob from its layout and writes.
///
/// The key leads with the set-layout element id (the recycle prefix),
/// followed by every binding's identity. The update blob holds one slot
/// per descriptor, in binding declaration order, matching the layout's
/// update template.
fn compose_set(
    layout: &Arc<CacheElem>,
    descriptor: &SetLayoutDescriptor,
    writes: &[SetWrite],
) -> (HashKey, Vec<UpdateData>) {
    let mut builder = HashBuilder::new();
    builder.push_handle(layout.id());

    let total: usize = descriptor
        .bindings
        .iter()
        .map(|binding| binding.count as usize)
        .sum();
    let mut update = vec![UpdateData::default(); total];

    let mut offset = 0usize;
    for binding in &descriptor.bindings {
        for element in 0..binding.count {
            let write = writes
                .iter()
                .find(|write| write.binding == binding.binding && write.element == element);

            builder.push_u32(binding.binding);
            builder.push_u32(element);

            match write.map(|write| &write.resource) {
                Some(SetResource::Buffer {
                    buffer,
                    offset: buffer_offset,
                    range,
                }) => {
                    builder.push_u8(1);
                    builder.push_u64(buffer_u64(*buffer));
                    builder.push_u64(*buffer_offset);
                    builder.push_u64(*range);

                    update[offset + element as usize] = UpdateData {
                        buffer: vk::DescriptorBufferInfo::default()
                            .buffer(*buffer)
                            .offset(*buffer_offset)
                            .range(*range),
                    };
                }
                Some(SetResource::Image { view, layout }) => {
                    builder.push_u8(2);
                    builder.push_u64(view_u64(*view));
                    builder.push_i32(layout.as_raw());

                    update[offset + element as usize] = UpdateData {
                        image: vk::DescriptorImageInfo::default()
                            .image_view(*view)
                            .image_layout(*layout),
                    };
                }
                Some(SetResource::ImageSampler {
                    view,
                    layout,
                    sampler,
                }) => {
                    builder.push_u8(3);
                    builder.push_u64(view_u64(*view));
                    builder.push_i32(layout.as_raw());
                    builder.push_handle(sampler.id());

                    update[offset + element as usize] = UpdateData {
                        image: vk::DescriptorImageInfo::default()
                            .image_view(*view)
                            .image_layout(*layout)
                            .sampler(sampler.sampler()),
                    };
                }
                Some(SetResource::Sampler(sampler)) => {
                    builder.push_u8(4);
                    builder.push_handle(sampler.id());

                    update[offset + element as usize] = UpdateData {
                        image: vk::DescriptorImageInfo::default().sampler(sampler.sampler()),
                    };
                }
                None => {
                    builder.push_u8(0);
                }
            }
        }
        offset += binding.count as usize;
    }

    (builder.finish(), update)
}

fn buffer_u64(buffer: vk::Buffer) -> u64 {
    use ash::vk::Handle;
    buffer.as_raw()
}

fn view_u64(view: vk::ImageView) -> u64 {
    use ash::vk::Handle;
    view.as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::RECYCLE_KEY_LEN;

    // Set keys must lead with the layout id so recycled sets can be found
    // by layout alone; this pins the composition order.
    #[test]
    fn set_key_layout_prefix_is_stable() {
        let mut builder = HashBuilder::new();
        builder.push_handle(0x1234_5678_9abc_def0);
        builder.push_u32(0);
        let key = builder.finish();

        assert_eq!(
            key.prefix(RECYCLE_KEY_LEN).bytes(),
            &0x1234_5678_9abc_def0u64.to_le_bytes()
        );
    }
}
