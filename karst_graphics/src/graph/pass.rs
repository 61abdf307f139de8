//! Render and async-compute passes.
//!
//! A pass declares how it consumes attachments; everything Vulkan-facing
//! (attachment descriptions, the render pass object, image views and
//! framebuffers) is derived from those declarations. Derived state is built
//! in two steps: `warmup` resolves the cached `vk::RenderPass`, `build`
//! additionally creates views and framebuffers. A rebuild destroys exactly
//! the subset invalidated by the given recreate flags.

use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::{
    backing::{Attach, Backing},
    cache::{Cache, CacheElem, CacheDescriptor, RenderPassDescriptor, SubpassDescriptor},
    deps::{vk_image_layout, Inject},
    types::{
        format_aspect, format_has_depth, format_has_depth_or_stencil, format_has_stencil,
        AccessMask, ImageAspect, Range, RecreateFlags, StageMask, ViewType,
    },
    vulkan::DeviceShared,
    RenderError, RenderResult,
};

use super::StaleResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    Render,
    ComputeAsync,
}

/// Blend operation of one channel pair; `op == None` disables blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendOpState {
    pub src_factor: vk::BlendFactor,
    pub dst_factor: vk::BlendFactor,
    pub op: Option<vk::BlendOp>,
}

impl Default for BlendOpState {
    fn default() -> Self {
        Self {
            src_factor: vk::BlendFactor::ONE,
            dst_factor: vk::BlendFactor::ZERO,
            op: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlendState {
    pub color: BlendOpState,
    pub alpha: BlendOpState,
    pub constants: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: vk::CompareOp,
    pub bounds: Option<[f32; 2]>,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: vk::CompareOp::LESS,
            bounds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StencilState {
    pub test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

fn stencil_op_state_eq(a: &vk::StencilOpState, b: &vk::StencilOpState) -> bool {
    a.fail_op == b.fail_op
        && a.pass_op == b.pass_op
        && a.depth_fail_op == b.depth_fail_op
        && a.compare_op == b.compare_op
        && a.compare_mask == b.compare_mask
        && a.write_mask == b.write_mask
        && a.reference == b.reference
}

impl PartialEq for StencilState {
    fn eq(&self, other: &Self) -> bool {
        self.test == other.test
            && stencil_op_state_eq(&self.front, &other.front)
            && stencil_op_state_eq(&self.back, &other.back)
    }
}

impl Eq for StencilState {}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderState {
    pub raster: RasterState,
    pub blend: BlendState,
    pub depth: DepthState,
    pub stencil: StencilState,
}

/// One declared use of an attachment by a pass.
pub(crate) struct Consume {
    pub(crate) index: usize,
    pub(crate) mask: AccessMask,
    pub(crate) stage: StageMask,
    pub(crate) range: Range,
    pub(crate) view_type: Option<ViewType>,

    pub(crate) cleared: ImageAspect,
    pub(crate) clear: vk::ClearValue,
    pub(crate) blend: Option<(BlendOpState, BlendOpState)>,
    pub(crate) resolve: Option<usize>,

    // Filled in by graph analysis.
    pub(crate) out_initial: vk::ImageLayout,
    pub(crate) out_final: vk::ImageLayout,
    pub(crate) out_prev: Option<(usize, usize)>,
}

impl Consume {
    fn new(index: usize, mask: AccessMask, stage: StageMask) -> Self {
        Self {
            index,
            mask,
            stage,
            range: Range::whole(),
            view_type: None,
            cleared: ImageAspect::empty(),
            clear: vk::ClearValue::default(),
            blend: None,
            resolve: None,
            out_initial: vk::ImageLayout::UNDEFINED,
            out_final: vk::ImageLayout::UNDEFINED,
            out_prev: None,
        }
    }
}

/// View slot of one filtered consumption; `view` stays null for the
/// swapchain slot, which gets a per-image view at framebuffer time.
struct ViewElem {
    consume: usize,
    view: vk::ImageView,
}

/// One framebuffer plus its swapchain view, if any.
struct FrameElem {
    view: vk::ImageView,
    buffer: vk::Framebuffer,
}

/// Derived Vulkan state of a render pass.
pub(crate) struct RenderDerived {
    /// Bumped whenever derived state changes shape; pipelines referencing
    /// this pass compare it to know when to rebuild.
    pub(crate) generation: u32,

    /// Window attachment index used as back-buffer.
    pub(crate) backing: Option<usize>,

    fb_width: u32,
    fb_height: u32,
    fb_layers: u32,

    pub(crate) pass_elem: Option<Arc<CacheElem>>,
    pub(crate) vk_pass: vk::RenderPass,

    pub(crate) clears: Vec<vk::ClearValue>,
    pub(crate) blends: Vec<vk::PipelineColorBlendAttachmentState>,
    views: Vec<ViewElem>,
    frames: Vec<FrameElem>,

    pub(crate) state: RenderState,
    pub(crate) samples: vk::SampleCountFlags,
}

impl RenderDerived {
    fn new() -> Self {
        Self {
            generation: 0,
            backing: None,
            fb_width: 0,
            fb_height: 0,
            fb_layers: 0,
            pass_elem: None,
            vk_pass: vk::RenderPass::null(),
            clears: Vec::new(),
            blends: Vec::new(),
            views: Vec::new(),
            frames: Vec::new(),
            state: RenderState::default(),
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            log::warn!(
                "Pass build generation overflowed; \
                 stale pipelines may not be invalidated."
            );
        }
    }
}

pub struct Pass {
    pub(crate) ty: PassType,
    pub(crate) level: u32,
    /// Position in the linear submission order.
    pub(crate) order: u32,
    pub(crate) childs: u32,
    pub(crate) parents: Vec<usize>,

    pub(crate) consumes: Vec<Consume>,
    /// Pending dependency commands, drained every submission.
    pub(crate) injects: Vec<Inject>,

    pub(crate) render: Option<RenderDerived>,
}

impl Pass {
    pub(crate) fn new(ty: PassType, parents: Vec<usize>, level: u32) -> Self {
        Self {
            ty,
            level,
            order: 0,
            childs: 0,
            parents,
            consumes: Vec::new(),
            injects: Vec::new(),
            render: match ty {
                PassType::Render => Some(RenderDerived::new()),
                PassType::ComputeAsync => None,
            },
        }
    }

    pub fn pass_type(&self) -> PassType {
        self.ty
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn parents(&self) -> &[usize] {
        &self.parents
    }

    pub(crate) fn generation(&self) -> u32 {
        self.render.as_ref().map_or(0, |derived| derived.generation)
    }

    /// Inserts or replaces a consumption. A replacement preserves the
    /// previously set clear, blend and resolve values.
    pub(crate) fn consume(
        &mut self,
        index: usize,
        mask: AccessMask,
        stage: StageMask,
        range: Option<Range>,
        view_type: Option<ViewType>,
    ) {
        // Images cannot be mapped; host access is meaningless here.
        let mask = mask & !(AccessMask::HOST_READ | AccessMask::HOST_WRITE);

        let mut consume = Consume::new(index, mask, stage);
        if let Some(range) = range {
            consume.range = range;
        }
        consume.view_type = view_type;

        if let Some(existing) = self
            .consumes
            .iter_mut()
            .rev()
            .find(|existing| existing.index == index)
        {
            consume.cleared = existing.cleared;
            consume.clear = existing.clear;
            consume.blend = existing.blend;
            consume.resolve = existing.resolve;
            *existing = consume;
        } else {
            self.consumes.push(consume);
        }
    }

    /// Sets the clear value of a consumed attachment. Clearing only depth
    /// or only stencil preserves the other half of the existing value.
    pub(crate) fn set_clear(&mut self, index: usize, aspect: ImageAspect, value: vk::ClearValue) {
        if let Some(consume) = self
            .consumes
            .iter_mut()
            .rev()
            .find(|consume| consume.index == index)
        {
            let mut value = value;
            unsafe {
                if aspect == ImageAspect::DEPTH {
                    value.depth_stencil.stencil = consume.clear.depth_stencil.stencil;
                } else if aspect == ImageAspect::STENCIL {
                    value.depth_stencil.depth = consume.clear.depth_stencil.depth;
                }
            }
            consume.cleared = aspect;
            consume.clear = value;
        }
    }

    pub(crate) fn set_blend(&mut self, index: usize, color: BlendOpState, alpha: BlendOpState) {
        if let Some(consume) = self
            .consumes
            .iter_mut()
            .rev()
            .find(|consume| consume.index == index)
        {
            consume.blend = Some((color, alpha));
        }
    }

    /// Points a consumed attachment at another consumed attachment to
    /// resolve into. No-op when `resolve` is not consumed by this pass.
    pub(crate) fn set_resolve(&mut self, index: usize, resolve: usize) -> bool {
        if !self.consumes.iter().any(|consume| consume.index == resolve) {
            return false;
        }
        if let Some(consume) = self
            .consumes
            .iter_mut()
            .rev()
            .find(|consume| consume.index == index)
        {
            consume.resolve = Some(resolve);
            return true;
        }
        false
    }

    /// Removes a consumption, unhooking any resolve pointing at it.
    pub(crate) fn release(&mut self, index: usize) {
        for consume in &mut self.consumes {
            if consume.resolve == Some(index) {
                consume.resolve = None;
            }
        }
        self.consumes.retain(|consume| consume.index != index);
    }

    /// Returns whether anything changed shape (requiring a graph
    /// invalidation for new blend state, a generation bump otherwise).
    pub(crate) fn set_state(&mut self, state: RenderState) -> (bool, bool) {
        let Some(derived) = self.render.as_mut() else {
            return (false, false);
        };

        let new_blends = derived.state.blend != state.blend;
        let changed = derived.state != state;
        derived.state = state;

        if changed && !new_blends {
            derived.bump_generation();
        }
        (new_blends, changed)
    }

    pub(crate) fn state(&self) -> Option<RenderState> {
        self.render.as_ref().map(|derived| derived.state)
    }

    fn is_warmed(&self) -> bool {
        self.render
            .as_ref()
            .is_some_and(|derived| !derived.vk_pass.is_null())
    }

    fn is_built(&self) -> bool {
        self.render
            .as_ref()
            .is_some_and(|derived| !derived.frames.is_empty())
    }

    /// Filters consumptions into framebuffer view slots and picks the
    /// backing window. Logs and drops anything that cannot be an
    /// attachment of this pass.
    fn filter_attachments(&mut self, backing: &Backing) {
        let derived = self.render.as_mut().unwrap();
        if !derived.views.is_empty() {
            return;
        }

        let mut depth_stencil: Option<usize> = None;

        for (i, consume) in self.consumes.iter().enumerate() {
            let Some(attach) = backing.get(consume.index) else {
                log::warn!(
                    "Consumption of attachment at index {} ignored, \
                     attachment not described.",
                    consume.index
                );
                continue;
            };

            if !consume.mask.as_attachment() {
                continue;
            }

            match attach {
                Attach::Empty => {
                    log::warn!(
                        "Consumption of attachment at index {} ignored, \
                         attachment not described.",
                        consume.index
                    );
                    continue;
                }

                Attach::Window(_) => {
                    let color_write = consume.range.aspect.contains(ImageAspect::COLOR)
                        && consume.mask.intersects(
                            AccessMask::ATTACHMENT_READ
                                | AccessMask::ATTACHMENT_WRITE
                                | AccessMask::ATTACHMENT_RESOLVE,
                        );

                    if !color_write {
                        log::warn!(
                            "Consumption of attachment at index {} ignored, \
                             a pass can only read/write to a window attachment.",
                            consume.index
                        );
                        continue;
                    }

                    if derived.backing.is_none() {
                        derived.backing = Some(consume.index);
                    } else if derived.backing != Some(consume.index) {
                        log::warn!(
                            "Consumption of attachment at index {} ignored, a single \
                             pass can only read/write to a single window attachment \
                             at a time.",
                            consume.index
                        );
                        continue;
                    }
                }

                Attach::Image(image) => {
                    let format = image.description.format;
                    if format_has_depth_or_stencil(format)
                        && consume
                            .range
                            .aspect
                            .intersects(ImageAspect::DEPTH | ImageAspect::STENCIL)
                        && consume
                            .mask
                            .intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE)
                    {
                        if depth_stencil.is_none() {
                            depth_stencil = Some(consume.index);
                        } else if depth_stencil != Some(consume.index) {
                            log::warn!(
                                "A single pass can only read/write to a single \
                                 depth/stencil attachment at a time."
                            );
                        }
                    }
                }
            }

            derived.views.push(ViewElem {
                consume: i,
                view: vk::ImageView::null(),
            });
        }
    }

    /// Index into the filtered attachment list for an attachment index.
    fn find_filtered(&self, index: Option<usize>) -> Option<u32> {
        let derived = self.render.as_ref().unwrap();
        let index = index?;
        derived
            .views
            .iter()
            .position(|view| self.consumes[view.consume].index == index)
            .map(|position| position as u32)
    }

    /// Resolves the cached Vulkan render pass from the consumption set.
    pub(crate) fn warmup(&mut self, backing: &Backing, cache: &Cache) -> RenderResult<()> {
        debug_assert_eq!(self.ty, PassType::Render);

        if self.is_warmed() {
            return Ok(());
        }

        self.filter_attachments(backing);

        // Clear & blend values are refreshed on every warmup so state
        // edits do not force a full reconstruction.
        let state_blend;
        {
            let derived = self.render.as_mut().unwrap();
            derived.clears.clear();
            derived.blends.clear();
            derived.samples = vk::SampleCountFlags::TYPE_1;
            state_blend = (derived.state.blend.color, derived.state.blend.alpha);
        }

        let derived = self.render.as_ref().unwrap();
        let views: Vec<usize> = derived.views.iter().map(|view| view.consume).collect();

        let mut attachments = Vec::with_capacity(views.len());
        let mut inputs = Vec::new();
        let mut colors = Vec::new();
        let mut resolves = Vec::new();
        let mut depth_stencil: Option<vk::AttachmentReference> = None;
        let mut clears = Vec::with_capacity(views.len());
        let mut blends = Vec::new();
        let mut samples = vk::SampleCountFlags::TYPE_1;

        let unused = vk::AttachmentReference {
            attachment: vk::ATTACHMENT_UNUSED,
            layout: vk::ImageLayout::UNDEFINED,
        };

        for (slot, &consume_index) in views.iter().enumerate() {
            let consume = &self.consumes[consume_index];
            let attach = backing.get(consume.index).unwrap();
            let mut is_color = false;

            match attach {
                Attach::Window(window) => {
                    if consume
                        .mask
                        .intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE)
                    {
                        resolves.push(unused);
                        colors.push(vk::AttachmentReference {
                            attachment: slot as u32,
                            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        });
                        is_color = true;
                    }

                    let clear = consume.cleared.contains(ImageAspect::COLOR);
                    let load = consume.out_initial != vk::ImageLayout::UNDEFINED;

                    attachments.push(
                        vk::AttachmentDescription::default()
                            .format(window.window.format())
                            .samples(vk::SampleCountFlags::TYPE_1)
                            .load_op(if clear {
                                vk::AttachmentLoadOp::CLEAR
                            } else if load {
                                vk::AttachmentLoadOp::LOAD
                            } else {
                                vk::AttachmentLoadOp::DONT_CARE
                            })
                            .store_op(if consume.mask.contains(AccessMask::DISCARD) {
                                vk::AttachmentStoreOp::DONT_CARE
                            } else {
                                vk::AttachmentStoreOp::STORE
                            })
                            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                            .initial_layout(consume.out_initial)
                            .final_layout(consume.out_final),
                    );
                }

                Attach::Image(image) => {
                    let format = image.description.format;
                    let whole_aspect = format_aspect(format);
                    let aspect_match = consume.range.aspect.intersects(whole_aspect);

                    let depth_clear = if format_has_depth_or_stencil(format) {
                        format_has_depth(format) && consume.cleared.contains(ImageAspect::DEPTH)
                    } else {
                        consume.cleared.contains(ImageAspect::COLOR)
                    };
                    let depth_load = (format_has_depth(format) || !format_has_stencil(format))
                        && consume.out_initial != vk::ImageLayout::UNDEFINED;

                    let stencil_clear = format_has_stencil(format)
                        && consume.cleared.contains(ImageAspect::STENCIL);
                    let stencil_load = format_has_stencil(format)
                        && consume.out_initial != vk::ImageLayout::UNDEFINED;

                    let reference = vk::AttachmentReference {
                        attachment: slot as u32,
                        layout: vk_image_layout(consume.mask, format),
                    };
                    let resolve_reference = match self.find_filtered(consume.resolve) {
                        Some(attachment) => vk::AttachmentReference {
                            attachment,
                            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        },
                        None => unused,
                    };

                    if consume.mask.contains(AccessMask::ATTACHMENT_INPUT) {
                        inputs.push(if aspect_match { reference } else { unused });
                    }

                    if consume
                        .mask
                        .intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE)
                    {
                        if !format_has_depth_or_stencil(format) {
                            resolves.push(if aspect_match { resolve_reference } else { unused });
                            colors.push(if aspect_match { reference } else { unused });
                            is_color = true;
                        } else if aspect_match {
                            depth_stencil = Some(reference);
                        }
                    }

                    attachments.push(
                        vk::AttachmentDescription::default()
                            .format(format)
                            .samples(image.description.samples)
                            .load_op(if depth_clear {
                                vk::AttachmentLoadOp::CLEAR
                            } else if depth_load {
                                vk::AttachmentLoadOp::LOAD
                            } else {
                                vk::AttachmentLoadOp::DONT_CARE
                            })
                            .store_op(if consume.mask.contains(AccessMask::DISCARD) {
                                vk::AttachmentStoreOp::DONT_CARE
                            } else {
                                vk::AttachmentStoreOp::STORE
                            })
                            .stencil_load_op(if stencil_clear {
                                vk::AttachmentLoadOp::CLEAR
                            } else if stencil_load {
                                vk::AttachmentLoadOp::LOAD
                            } else {
                                vk::AttachmentLoadOp::DONT_CARE
                            })
                            .stencil_store_op(if consume.mask.contains(AccessMask::DISCARD) {
                                vk::AttachmentStoreOp::DONT_CARE
                            } else {
                                vk::AttachmentStoreOp::STORE
                            })
                            .initial_layout(consume.out_initial)
                            .final_layout(consume.out_final),
                    );

                    if image.description.samples.as_raw() > samples.as_raw() {
                        samples = image.description.samples;
                    }
                }

                Attach::Empty => unreachable!("filtered out"),
            }

            clears.push(consume.clear);

            if is_color {
                let (color, alpha) = match consume.blend {
                    Some((color, alpha)) => (color, alpha),
                    None => state_blend,
                };

                let mut blend_state = vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .src_color_blend_factor(vk::BlendFactor::ONE)
                    .dst_color_blend_factor(vk::BlendFactor::ZERO)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(vk::ColorComponentFlags::RGBA);

                if let Some(op) = color.op {
                    blend_state = blend_state
                        .blend_enable(true)
                        .src_color_blend_factor(color.src_factor)
                        .dst_color_blend_factor(color.dst_factor)
                        .color_blend_op(op);
                }
                if let Some(op) = alpha.op {
                    blend_state = blend_state
                        .blend_enable(true)
                        .src_alpha_blend_factor(alpha.src_factor)
                        .dst_alpha_blend_factor(alpha.dst_factor)
                        .alpha_blend_op(op);
                }

                blends.push(blend_state);
            }
        }

        let descriptor = RenderPassDescriptor {
            attachments,
            subpasses: vec![SubpassDescriptor {
                inputs,
                colors,
                resolves,
                depth_stencil,
                preserves: Vec::new(),
            }],
            dependencies: Vec::new(),
        };

        let elem = cache.get(&CacheDescriptor::RenderPass(&descriptor))?;

        let derived = self.render.as_mut().unwrap();
        derived.clears = clears;
        derived.blends = blends;
        derived.samples = samples;
        derived.vk_pass = elem.render_pass();
        derived.pass_elem = Some(elem);

        Ok(())
    }

    fn validate_dims(&mut self, width: u32, height: u32, layers: u32) -> bool {
        let derived = self.render.as_mut().unwrap();

        if width == 0 || height == 0 || layers == 0 {
            // Not an error if e.g. minimized.
            log::debug!(
                "Encountered framebuffer dimensions ({}x{}x{}) of zero \
                 during pass building, pass skipped.",
                width,
                height,
                layers
            );
            return false;
        }

        if (derived.fb_width != 0 && width != derived.fb_width)
            || (derived.fb_height != 0 && height != derived.fb_height)
            || (derived.fb_layers != 0 && layers != derived.fb_layers)
        {
            log::warn!(
                "Encountered mismatching framebuffer dimensions \
                 ({}x{}x{}) ({}x{}x{}) during pass building, pass skipped.",
                derived.fb_width,
                derived.fb_height,
                derived.fb_layers,
                width,
                height,
                layers
            );
            return false;
        }

        derived.fb_width = width;
        derived.fb_height = height;
        derived.fb_layers = layers;
        true
    }

    /// Builds image views and framebuffers; one framebuffer per swapchain
    /// image when backed by a window, a single one otherwise. A pass with
    /// zero-extent dimensions reports [`RenderError::Skip`]; the graph
    /// drops it for the frame.
    pub(crate) fn build(
        &mut self,
        device: &Arc<DeviceShared>,
        backing: &Backing,
        cache: &Cache,
        stale: &mut StaleResources,
    ) -> RenderResult<()> {
        debug_assert_eq!(self.ty, PassType::Render);

        if self.is_built() {
            return Ok(());
        }

        self.warmup(backing, cache)?;

        let view_slots: Vec<usize> = {
            let derived = self.render.as_ref().unwrap();
            derived.views.iter().map(|view| view.consume).collect()
        };

        let mut views = vec![vk::ImageView::null(); view_slots.len()];
        let mut backing_slot: Option<(usize, usize)> = None; // (slot, attachment index)

        for (slot, &consume_index) in view_slots.iter().enumerate() {
            let (attach_index, range, view_type_override) = {
                let consume = &self.consumes[consume_index];
                (consume.index, consume.range, consume.view_type)
            };

            match backing.get(attach_index).unwrap() {
                Attach::Window(window) => {
                    let extent = window.window.extent();
                    if !self.validate_dims(extent.width, extent.height, 1) {
                        self.destruct_partial(RecreateFlags::RECREATE, stale);
                        return Err(RenderError::Skip("unusable framebuffer dimensions"));
                    }
                    backing_slot = Some((slot, attach_index));
                }

                Attach::Image(image) => {
                    let layers = if range.num_layers == 0 {
                        image.description.layers - range.layer
                    } else {
                        range.num_layers
                    };

                    let (width, height) = (image.width, image.height);
                    let format = image.description.format;
                    let image_raw = image.raw();
                    let image_type = image.description.image_type;

                    if !self.validate_dims(width, height, layers) {
                        self.destruct_partial(RecreateFlags::RECREATE, stale);
                        return Err(RenderError::Skip("unusable framebuffer dimensions"));
                    }

                    let aspect = range.aspect & format_aspect(format);

                    let view_type = view_type_override.map(ViewType::to_vk).unwrap_or(
                        match image_type {
                            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
                            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
                            _ => vk::ImageViewType::TYPE_2D,
                        },
                    );

                    let create_info = vk::ImageViewCreateInfo::default()
                        .image(image_raw)
                        .view_type(view_type)
                        .format(format)
                        .subresource_range(
                            vk::ImageSubresourceRange::default()
                                .aspect_mask(aspect.to_vk())
                                .base_mip_level(range.mipmap)
                                .level_count(if range.num_mipmaps == 0 {
                                    vk::REMAINING_MIP_LEVELS
                                } else {
                                    range.num_mipmaps
                                })
                                .base_array_layer(range.layer)
                                .layer_count(if range.num_layers == 0 {
                                    vk::REMAINING_ARRAY_LAYERS
                                } else {
                                    range.num_layers
                                }),
                        );

                    let view = unsafe { device.raw.create_image_view(&create_info, None)? };
                    views[slot] = view;
                    self.render.as_mut().unwrap().views[slot].view = view;
                }

                Attach::Empty => unreachable!("filtered out"),
            }
        }

        // One framebuffer per swapchain image, or just a single one.
        let (frame_count, window) = match backing_slot {
            Some((_, index)) => match backing.get(index) {
                Some(Attach::Window(window)) => {
                    (window.window.image_count(), Some(window.window.clone()))
                }
                _ => (1, None),
            },
            None => (1, None),
        };

        let derived_pass = self.render.as_ref().unwrap().vk_pass;
        let (fb_width, fb_height, fb_layers) = {
            let derived = self.render.as_ref().unwrap();
            (derived.fb_width, derived.fb_height, derived.fb_layers)
        };

        for i in 0..frame_count.max(1) {
            let mut elem = FrameElem {
                view: vk::ImageView::null(),
                buffer: vk::Framebuffer::null(),
            };

            if let (Some((slot, _)), Some(window)) = (backing_slot, &window) {
                let images = window.images();
                let Some(&image) = images.get(i) else {
                    continue;
                };

                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(window.format())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                elem.view = unsafe { device.raw.create_image_view(&create_info, None)? };
                views[slot] = elem.view;
            }

            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(derived_pass)
                .attachments(&views)
                .width(fb_width.max(1))
                .height(fb_height.max(1))
                .layers(fb_layers.max(1));

            match unsafe { device.raw.create_framebuffer(&create_info, None) } {
                Ok(buffer) => elem.buffer = buffer,
                Err(result) => {
                    unsafe {
                        device.raw.destroy_image_view(elem.view, None);
                    }
                    self.destruct_partial(RecreateFlags::RECREATE, stale);
                    log::error!("Could not build framebuffers for a pass: {}", result);
                    return Err(RenderError::from_vk(result));
                }
            }

            self.render.as_mut().unwrap().frames.push(elem);
        }

        Ok(())
    }

    /// Framebuffer to render into, given the frame's swapchain image index
    /// for the backing window. Null when the pass is unbuilt or the image
    /// does not exist.
    pub(crate) fn framebuffer(&self, swapchain_image: Option<u32>) -> vk::Framebuffer {
        let Some(derived) = self.render.as_ref() else {
            return vk::Framebuffer::null();
        };

        if derived.frames.len() == 1 {
            return derived.frames[0].buffer;
        }

        match swapchain_image {
            Some(image) if (image as usize) < derived.frames.len() => {
                derived.frames[image as usize].buffer
            }
            _ => vk::Framebuffer::null(),
        }
    }

    pub(crate) fn render_area(&self) -> vk::Extent2D {
        let derived = self.render.as_ref().unwrap();
        vk::Extent2D {
            width: derived.fb_width,
            height: derived.fb_height,
        }
    }

    /// Destroys the subset of derived state the recreate flags invalidate.
    /// Framebuffers and views go onto the stale queue; they may still be
    /// referenced by in-flight frames.
    pub(crate) fn destruct_partial(&mut self, flags: RecreateFlags, stale: &mut StaleResources) {
        let Some(derived) = self.render.as_mut() else {
            return;
        };

        if flags.contains(RecreateFlags::RECREATE) {
            for frame in derived.frames.drain(..) {
                stale.push_framebuffer(frame.buffer);
                stale.push_view(frame.view);
            }

            // The filtered view list survives: on a swapchain recreate the
            // consumptions have not changed, only the images have.
            for view in &mut derived.views {
                if !view.view.is_null() {
                    stale.push_view(view.view);
                    view.view = vk::ImageView::null();
                }
            }

            derived.fb_width = 0;
            derived.fb_height = 0;
            derived.fb_layers = 0;
        }

        if flags.contains(RecreateFlags::REFORMAT) {
            derived.pass_elem = None;
            derived.vk_pass = vk::RenderPass::null();
            derived.bump_generation();
        }
    }

    /// Re-derives whatever was previously derived, after a partial destruct.
    pub(crate) fn rebuild(
        &mut self,
        device: &Arc<DeviceShared>,
        backing: &Backing,
        cache: &Cache,
        flags: RecreateFlags,
        stale: &mut StaleResources,
    ) -> RenderResult<()> {
        let warmed = self.is_warmed();
        let built = self.is_built();

        self.destruct_partial(flags, stale);

        if built {
            self.build(device, backing, cache, stale)
        } else if warmed {
            self.warmup(backing, cache)
        } else {
            Ok(())
        }
    }

    /// Full teardown of derived state; the consumption declarations stay.
    pub(crate) fn destruct(&mut self, stale: &mut StaleResources) {
        self.destruct_partial(RecreateFlags::ALL, stale);

        if let Some(derived) = self.render.as_mut() {
            derived.backing = None;
            derived.views.clear();
            derived.clears.clear();
            derived.blends.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconsume_replaces_but_preserves_clear_blend_resolve() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        pass.consume(
            0,
            AccessMask::ATTACHMENT_WRITE,
            StageMask::FRAGMENT,
            None,
            None,
        );
        pass.consume(1, AccessMask::ATTACHMENT_READ, StageMask::FRAGMENT, None, None);
        pass.set_clear(
            0,
            ImageAspect::COLOR,
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [1.0, 0.5, 0.25, 1.0],
                },
            },
        );
        let blend = BlendOpState {
            src_factor: vk::BlendFactor::SRC_ALPHA,
            dst_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            op: Some(vk::BlendOp::ADD),
        };
        pass.set_blend(0, blend, BlendOpState::default());
        assert!(pass.set_resolve(0, 1));

        pass.consume(
            0,
            AccessMask::ATTACHMENT_WRITE | AccessMask::ATTACHMENT_READ,
            StageMask::FRAGMENT,
            None,
            None,
        );

        assert_eq!(pass.consumes.len(), 2);
        let consume = pass
            .consumes
            .iter()
            .find(|consume| consume.index == 0)
            .unwrap();
        assert!(consume.mask.contains(AccessMask::ATTACHMENT_READ));
        assert_eq!(consume.cleared, ImageAspect::COLOR);
        assert_eq!(unsafe { consume.clear.color.float32 }, [1.0, 0.5, 0.25, 1.0]);
        assert_eq!(consume.blend, Some((blend, BlendOpState::default())));
        assert_eq!(consume.resolve, Some(1));
    }

    #[test]
    fn host_access_is_stripped() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        pass.consume(
            0,
            AccessMask::ATTACHMENT_WRITE | AccessMask::HOST_READ | AccessMask::HOST_WRITE,
            StageMask::FRAGMENT,
            None,
            None,
        );
        assert_eq!(pass.consumes[0].mask, AccessMask::ATTACHMENT_WRITE);
    }

    #[test]
    fn release_unhooks_resolve() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        pass.consume(0, AccessMask::ATTACHMENT_WRITE, StageMask::FRAGMENT, None, None);
        pass.consume(1, AccessMask::ATTACHMENT_RESOLVE, StageMask::FRAGMENT, None, None);
        assert!(pass.set_resolve(0, 1));

        pass.release(1);
        assert_eq!(pass.consumes.len(), 1);
        assert_eq!(pass.consumes[0].resolve, None);
    }

    #[test]
    fn resolve_requires_consumed_target() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        pass.consume(0, AccessMask::ATTACHMENT_WRITE, StageMask::FRAGMENT, None, None);
        assert!(!pass.set_resolve(0, 5));
        assert_eq!(pass.consumes[0].resolve, None);
    }

    #[test]
    fn partial_clear_preserves_other_half() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        pass.consume(0, AccessMask::ATTACHMENT_WRITE, StageMask::FRAGMENT, None, None);

        pass.set_clear(
            0,
            ImageAspect::DEPTH | ImageAspect::STENCIL,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 42,
                },
            },
        );
        pass.set_clear(
            0,
            ImageAspect::DEPTH,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.5,
                    stencil: 0,
                },
            },
        );

        let clear = unsafe { pass.consumes[0].clear.depth_stencil };
        assert_eq!(clear.depth, 0.5);
        assert_eq!(clear.stencil, 42);
    }

    #[test]
    fn state_change_reports_blend_and_generation() {
        let mut pass = Pass::new(PassType::Render, Vec::new(), 0);
        let generation = pass.generation();

        // Raster-only change bumps the generation, blends untouched.
        let mut state = RenderState::default();
        state.raster.cull_mode = vk::CullModeFlags::NONE;
        let (new_blends, changed) = pass.set_state(state);
        assert!(!new_blends);
        assert!(changed);
        assert_ne!(pass.generation(), generation);

        // Blend change reports so the graph can invalidate instead.
        let generation = pass.generation();
        state.blend.color.op = Some(vk::BlendOp::ADD);
        let (new_blends, changed) = pass.set_state(state);
        assert!(new_blends);
        assert!(changed);
        assert_eq!(pass.generation(), generation);

        // No-op change reports nothing.
        let (new_blends, changed) = pass.set_state(state);
        assert!(!new_blends);
        assert!(!changed);
    }
}
