//! Content-addressed cache of Vulkan state objects.
//!
//! Three tables live in one cache: `simple` for non-pipeline objects (set
//! layouts, pipeline layouts, samplers, render passes), `immutable` for
//! pipelines promoted at a flush, and `mutable` for pipelines inserted
//! during a frame. Lookups hit `immutable` without taking its write lock;
//! `flush` merges `mutable` into it between frames, after which every
//! promoted entry stays put until `clear`.
//!
//! Keys are normalized byte blobs (see [`crate::hash`]); referenced cache
//! elements and shader modules contribute their stable numeric id instead
//! of their raw handle, so structurally identical descriptors collapse to
//! one entry regardless of pointer identity.

use std::{
    collections::HashMap,
    ffi::CString,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ash::vk::{self, Handle};
use parking_lot::{Mutex, RwLock};

use crate::{
    hash::{murmur3_64, HashBuilder, HashKey, MurmurBuildHasher},
    vulkan::DeviceShared,
    RenderError, RenderResult,
};

// 'Randomized' magic number (generated by human imagination).
const BLOB_MAGIC: u32 = 0xff60_af14;
const BLOB_HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 4 + 4 + 4 + vk::UUID_SIZE;

// Key type tags, one per supported descriptor.
const TAG_SET_LAYOUT: u32 = 1;
const TAG_PIPELINE_LAYOUT: u32 = 2;
const TAG_SAMPLER: u32 = 3;
const TAG_RENDER_PASS: u32 = 4;
const TAG_GRAPHICS_PIPELINE: u32 = 5;
const TAG_COMPUTE_PIPELINE: u32 = 6;

static NEXT_ELEM_ID: AtomicU64 = AtomicU64::new(1);

fn next_elem_id() -> u64 {
    NEXT_ELEM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-descriptor update-data slot written by set updates; the template
/// stride of every set layout's update template.
#[repr(C)]
#[derive(Clone, Copy)]
pub union UpdateData {
    pub buffer: vk::DescriptorBufferInfo,
    pub image: vk::DescriptorImageInfo,
    pub texel_buffer: vk::BufferView,
}

impl Default for UpdateData {
    fn default() -> Self {
        Self {
            buffer: vk::DescriptorBufferInfo::default(),
        }
    }
}

pub(crate) const TEMPLATE_STRIDE: usize = std::mem::size_of::<UpdateData>();

/// One cached Vulkan object. Shared by lookups, destroyed by the cache.
pub struct CacheElem {
    id: u64,
    object: CacheObject,
}

pub enum CacheObject {
    SetLayout {
        layout: vk::DescriptorSetLayout,
        /// Whole-set update template; null when the layout has no
        /// template-updatable bindings.
        template: vk::DescriptorUpdateTemplate,
    },
    PipelineLayout(vk::PipelineLayout),
    Sampler(vk::Sampler),
    RenderPass(vk::RenderPass),
    Pipeline {
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
    },
}

impl CacheElem {
    /// Stable id; what keys embed instead of the raw handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        match self.object {
            CacheObject::SetLayout { layout, .. } => layout,
            _ => vk::DescriptorSetLayout::null(),
        }
    }

    pub fn update_template(&self) -> vk::DescriptorUpdateTemplate {
        match self.object {
            CacheObject::SetLayout { template, .. } => template,
            _ => vk::DescriptorUpdateTemplate::null(),
        }
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        match self.object {
            CacheObject::PipelineLayout(layout) => layout,
            _ => vk::PipelineLayout::null(),
        }
    }

    pub fn sampler(&self) -> vk::Sampler {
        match self.object {
            CacheObject::Sampler(sampler) => sampler,
            _ => vk::Sampler::null(),
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        match self.object {
            CacheObject::RenderPass(pass) => pass,
            _ => vk::RenderPass::null(),
        }
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        match self.object {
            CacheObject::Pipeline { pipeline, .. } => pipeline,
            _ => vk::Pipeline::null(),
        }
    }

    pub fn pipeline_bind_point(&self) -> vk::PipelineBindPoint {
        match self.object {
            CacheObject::Pipeline { bind_point, .. } => bind_point,
            _ => vk::PipelineBindPoint::GRAPHICS,
        }
    }
}

/// Set-layout element with null handles, for exercising the descriptor
/// pool's bookkeeping without a device.
#[cfg(test)]
pub(crate) fn test_set_layout_elem() -> Arc<CacheElem> {
    Arc::new(CacheElem {
        id: next_elem_id(),
        object: CacheObject::SetLayout {
            layout: vk::DescriptorSetLayout::null(),
            template: vk::DescriptorUpdateTemplate::null(),
        },
    })
}

/// SPIR-V consumed opaquely into a module; carries a stable id for cache
/// keys referencing it.
pub struct ShaderModule {
    id: u64,
    pub(crate) raw: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    device: Arc<DeviceShared>,
}

impl ShaderModule {
    pub fn new(
        device: Arc<DeviceShared>,
        stage: vk::ShaderStageFlags,
        spirv: &[u32],
    ) -> RenderResult<Arc<Self>> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let raw = unsafe { device.raw.create_shader_module(&create_info, None)? };

        Ok(Arc::new(Self {
            id: next_elem_id(),
            raw,
            stage,
            device,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_shader_module(self.raw, None);
        }
    }
}

/// One binding of a set layout descriptor.
#[derive(Clone)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub immutable_samplers: Vec<Arc<CacheElem>>,
}

#[derive(Clone, Default)]
pub struct SetLayoutDescriptor {
    pub bindings: Vec<SetLayoutBinding>,
}

#[derive(Clone, Default)]
pub struct PipelineLayoutDescriptor {
    pub set_layouts: Vec<Arc<CacheElem>>,
    pub push_constants: Vec<vk::PushConstantRange>,
}

#[derive(Clone)]
pub struct SamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub reduction_mode: vk::SamplerReductionMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            reduction_mode: vk::SamplerReductionMode::WEIGHTED_AVERAGE,
            mip_lod_bias: 0.0,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            compare_enable: false,
            compare_op: vk::CompareOp::ALWAYS,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct SubpassDescriptor {
    pub inputs: Vec<vk::AttachmentReference>,
    pub colors: Vec<vk::AttachmentReference>,
    pub resolves: Vec<vk::AttachmentReference>,
    pub depth_stencil: Option<vk::AttachmentReference>,
    pub preserves: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct RenderPassDescriptor {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDescriptor>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Clone, Default)]
pub struct SpecializationDescriptor {
    pub map_entries: Vec<vk::SpecializationMapEntry>,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct ShaderStageDescriptor {
    pub module: Arc<ShaderModule>,
    pub specialization: Option<SpecializationDescriptor>,
}

#[derive(Clone)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub depth_bounds_test: bool,
    pub stencil_test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
            depth_bounds_test: false,
            stencil_test: false,
            front: vk::StencilOpState::default(),
            back: vk::StencilOpState::default(),
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
        }
    }
}

#[derive(Clone)]
pub struct RasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_clamp: bool,
    pub rasterizer_discard: bool,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_clamp: false,
            rasterizer_discard: false,
            line_width: 1.0,
        }
    }
}

#[derive(Clone, Default)]
pub struct ColorBlendState {
    pub attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub constants: [f32; 4],
}

#[derive(Clone)]
pub struct GraphicsPipelineDescriptor {
    pub stages: Vec<ShaderStageDescriptor>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub patch_control_points: Option<u32>,
    pub samples: vk::SampleCountFlags,
    pub rasterization: RasterizationState,
    pub depth_stencil: Option<DepthStencilState>,
    pub blend: Option<ColorBlendState>,
    pub layout: Arc<CacheElem>,
    pub render_pass: Arc<CacheElem>,
    pub subpass: u32,
}

#[derive(Clone)]
pub struct ComputePipelineDescriptor {
    pub stage: ShaderStageDescriptor,
    pub layout: Arc<CacheElem>,
}

/// Any creation descriptor the cache understands.
pub enum CacheDescriptor<'a> {
    SetLayout(&'a SetLayoutDescriptor),
    PipelineLayout(&'a PipelineLayoutDescriptor),
    Sampler(&'a SamplerDescriptor),
    RenderPass(&'a RenderPassDescriptor),
    GraphicsPipeline(&'a GraphicsPipelineDescriptor),
    ComputePipeline(&'a ComputePipelineDescriptor),
}

impl CacheDescriptor<'_> {
    fn is_pipeline(&self) -> bool {
        matches!(
            self,
            CacheDescriptor::GraphicsPipeline(_) | CacheDescriptor::ComputePipeline(_)
        )
    }
}

type Table = HashMap<HashKey, Arc<CacheElem>, MurmurBuildHasher>;

/// The cache itself. See the module docs for the table/locking scheme.
pub struct Cache {
    device: Arc<DeviceShared>,
    vk_cache: vk::PipelineCache,

    simple: Mutex<Table>,
    immutable: RwLock<Table>,
    mutable: Mutex<Table>,

    /// Serializes pipeline creation so concurrent misses of the same key
    /// build the object once; never held while `mutable` is locked... the
    /// other way around.
    create_lock: Mutex<()>,
}

impl Cache {
    pub fn new(device: Arc<DeviceShared>) -> RenderResult<Self> {
        let create_info = vk::PipelineCacheCreateInfo::default();
        let vk_cache = unsafe { device.raw.create_pipeline_cache(&create_info, None)? };

        Ok(Self {
            device,
            vk_cache,
            simple: Mutex::new(Table::default()),
            immutable: RwLock::new(Table::default()),
            mutable: Mutex::new(Table::default()),
            create_lock: Mutex::new(()),
        })
    }

    /// Resolves a descriptor to its cached element, creating it on a miss.
    pub fn get(&self, descriptor: &CacheDescriptor) -> RenderResult<Arc<CacheElem>> {
        if descriptor.is_pipeline() {
            self.get_pipeline(descriptor)
        } else {
            self.get_simple(descriptor)
        }
    }

    fn get_simple(&self, descriptor: &CacheDescriptor) -> RenderResult<Arc<CacheElem>> {
        let key = build_key(descriptor);

        let mut simple = self.simple.lock();
        if let Some(elem) = simple.get(&key) {
            return Ok(elem.clone());
        }

        let elem = Arc::new(CacheElem {
            id: next_elem_id(),
            object: self.create_object(descriptor)?,
        });
        simple.insert(key, elem.clone());

        Ok(elem)
    }

    fn get_pipeline(&self, descriptor: &CacheDescriptor) -> RenderResult<Arc<CacheElem>> {
        let key = build_key(descriptor);

        // Promoted pipelines first; by far the most likely hit after the
        // first frame, and never written outside a flush.
        if let Some(elem) = self.immutable.read().get(&key) {
            return Ok(elem.clone());
        }

        if let Some(elem) = self.mutable.lock().get(&key) {
            return Ok(elem.clone());
        }

        // We may be racing another thread to build the same pipeline:
        // serialize creation and re-check before actually creating. The
        // Vulkan call runs outside the mutable lock so concurrent lookups
        // of other keys never stall on driver compilation.
        let _create_guard = self.create_lock.lock();

        if let Some(elem) = self.mutable.lock().get(&key) {
            return Ok(elem.clone());
        }

        let elem = Arc::new(CacheElem {
            id: next_elem_id(),
            object: self.create_object(descriptor)?,
        });
        self.mutable.lock().insert(key, elem.clone());

        Ok(elem)
    }

    /// Pre-populates the immutable table, e.g. from a loaded blob's key
    /// set. Must not run concurrently with pipeline lookups; reuses the
    /// mutable table's lock as the immutable writer lock.
    pub fn warmup(&self, descriptor: &CacheDescriptor) -> RenderResult<()> {
        debug_assert!(descriptor.is_pipeline());
        let key = build_key(descriptor);

        {
            let _lookup_guard = self.mutable.lock();
            if self.immutable.read().contains_key(&key) {
                return Ok(());
            }
        }

        let elem = Arc::new(CacheElem {
            id: next_elem_id(),
            object: self.create_object(descriptor)?,
        });

        let _lookup_guard = self.mutable.lock();
        let mut immutable = self.immutable.write();
        if immutable.contains_key(&key) {
            // Lost the race to a concurrent warmup of the same key.
            drop(immutable);
            self.destroy_object(&elem);
        } else {
            immutable.insert(key, elem);
        }

        Ok(())
    }

    /// Promotes every mutable entry. Called once per frame after submission;
    /// the renderer guarantees no lookups run concurrently.
    pub fn flush(&self) {
        let mut mutable = self.mutable.lock();
        if mutable.is_empty() {
            return;
        }

        let mut immutable = self.immutable.write();
        for (key, elem) in mutable.drain() {
            immutable.insert(key, elem);
        }
    }

    fn create_object(&self, descriptor: &CacheDescriptor) -> RenderResult<CacheObject> {
        match descriptor {
            CacheDescriptor::SetLayout(desc) => self.create_set_layout(desc),
            CacheDescriptor::PipelineLayout(desc) => self.create_pipeline_layout(desc),
            CacheDescriptor::Sampler(desc) => self.create_sampler(desc),
            CacheDescriptor::RenderPass(desc) => self.create_render_pass(desc),
            CacheDescriptor::GraphicsPipeline(desc) => self.create_graphics_pipeline(desc),
            CacheDescriptor::ComputePipeline(desc) => self.create_compute_pipeline(desc),
        }
        .map_err(|result| {
            log::error!("Could not create cached Vulkan object: {}", result);
            RenderError::CacheCreate(result)
        })
    }

    fn create_set_layout(&self, desc: &SetLayoutDescriptor) -> Result<CacheObject, vk::Result> {
        let immutable_samplers: Vec<Vec<vk::Sampler>> = desc
            .bindings
            .iter()
            .map(|binding| {
                binding
                    .immutable_samplers
                    .iter()
                    .map(|elem| elem.sampler())
                    .collect()
            })
            .collect();

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .zip(&immutable_samplers)
            .map(|(binding, samplers)| {
                let mut vk_binding = vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages);
                if !samplers.is_empty() {
                    vk_binding = vk_binding.immutable_samplers(samplers);
                }
                vk_binding
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe {
            self.device
                .raw
                .create_descriptor_set_layout(&create_info, None)?
        };

        // Build the whole-set update template inline: one entry per
        // binding, laid out back to back in update-data slots. Empty
        // bindings and immutable-sampler-only bindings have no data.
        let mut entries = Vec::with_capacity(desc.bindings.len());
        let mut offset = 0usize;
        for binding in &desc.bindings {
            if binding.count == 0
                || (!binding.immutable_samplers.is_empty()
                    && binding.descriptor_type == vk::DescriptorType::SAMPLER)
            {
                continue;
            }

            entries.push(
                vk::DescriptorUpdateTemplateEntry::default()
                    .dst_binding(binding.binding)
                    .dst_array_element(0)
                    .descriptor_count(binding.count)
                    .descriptor_type(binding.descriptor_type)
                    .offset(offset)
                    .stride(TEMPLATE_STRIDE),
            );
            offset += TEMPLATE_STRIDE * binding.count as usize;
        }

        let template = if entries.is_empty() {
            vk::DescriptorUpdateTemplate::null()
        } else {
            let template_info = vk::DescriptorUpdateTemplateCreateInfo::default()
                .descriptor_update_entries(&entries)
                .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
                .descriptor_set_layout(layout);

            match unsafe {
                self.device
                    .raw
                    .create_descriptor_update_template(&template_info, None)
            } {
                Ok(template) => template,
                Err(result) => {
                    unsafe {
                        self.device.raw.destroy_descriptor_set_layout(layout, None);
                    }
                    return Err(result);
                }
            }
        };

        Ok(CacheObject::SetLayout { layout, template })
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor,
    ) -> Result<CacheObject, vk::Result> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = desc
            .set_layouts
            .iter()
            .map(|elem| elem.set_layout())
            .collect();

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&desc.push_constants);

        let layout = unsafe { self.device.raw.create_pipeline_layout(&create_info, None)? };
        Ok(CacheObject::PipelineLayout(layout))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<CacheObject, vk::Result> {
        // Samplers count against a device-wide allocation limit.
        if !self.device.claim_sampler_slot() {
            return Err(vk::Result::ERROR_TOO_MANY_OBJECTS);
        }

        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.anisotropy_enable)
            .max_anisotropy(desc.max_anisotropy)
            .compare_enable(desc.compare_enable)
            .compare_op(desc.compare_op)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates);

        let mut reduction_info = vk::SamplerReductionModeCreateInfo::default();
        if desc.reduction_mode != vk::SamplerReductionMode::WEIGHTED_AVERAGE {
            reduction_info = reduction_info.reduction_mode(desc.reduction_mode);
            create_info = create_info.push_next(&mut reduction_info);
        }

        match unsafe { self.device.raw.create_sampler(&create_info, None) } {
            Ok(sampler) => Ok(CacheObject::Sampler(sampler)),
            Err(result) => {
                self.device.release_sampler_slot();
                Err(result)
            }
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> Result<CacheObject, vk::Result> {
        let subpasses: Vec<vk::SubpassDescription> = desc
            .subpasses
            .iter()
            .map(|subpass| {
                let mut vk_subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&subpass.inputs)
                    .color_attachments(&subpass.colors)
                    .preserve_attachments(&subpass.preserves);
                if !subpass.resolves.is_empty() {
                    vk_subpass = vk_subpass.resolve_attachments(&subpass.resolves);
                }
                if let Some(depth_stencil) = &subpass.depth_stencil {
                    vk_subpass = vk_subpass.depth_stencil_attachment(depth_stencil);
                }
                vk_subpass
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&desc.attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);

        let pass = unsafe { self.device.raw.create_render_pass(&create_info, None)? };
        Ok(CacheObject::RenderPass(pass))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> Result<CacheObject, vk::Result> {
        let entry_point = CString::new("main").unwrap();

        let spec_infos: Vec<Option<vk::SpecializationInfo>> = desc
            .stages
            .iter()
            .map(|stage| {
                stage.specialization.as_ref().map(|spec| {
                    vk::SpecializationInfo::default()
                        .map_entries(&spec.map_entries)
                        .data(&spec.data)
                })
            })
            .collect();

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&spec_infos)
            .map(|(stage, spec)| {
                let mut vk_stage = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.module.stage)
                    .module(stage.module.raw)
                    .name(&entry_point);
                if let Some(spec) = spec {
                    vk_stage = vk_stage.specialization_info(spec);
                }
                vk_stage
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(desc.primitive_restart);

        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(desc.patch_control_points.unwrap_or(0));

        // Viewport and scissor are always dynamic; only the counts matter.
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(desc.rasterization.depth_clamp)
            .rasterizer_discard_enable(desc.rasterization.rasterizer_discard)
            .polygon_mode(desc.rasterization.polygon_mode)
            .cull_mode(desc.rasterization.cull_mode)
            .front_face(desc.rasterization.front_face)
            .line_width(desc.rasterization.line_width);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples)
            .min_sample_shading(1.0);

        let depth_stencil = desc.depth_stencil.as_ref().map(|state| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(state.depth_test)
                .depth_write_enable(state.depth_write)
                .depth_compare_op(state.depth_compare)
                .depth_bounds_test_enable(state.depth_bounds_test)
                .stencil_test_enable(state.stencil_test)
                .front(state.front)
                .back(state.back)
                .min_depth_bounds(state.min_depth_bounds)
                .max_depth_bounds(state.max_depth_bounds)
        });

        let blend = desc.blend.as_ref().map(|state| {
            vk::PipelineColorBlendStateCreateInfo::default()
                .attachments(&state.attachments)
                .blend_constants(state.constants)
        });

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .dynamic_state(&dynamic)
            .layout(desc.layout.pipeline_layout())
            .render_pass(desc.render_pass.render_pass())
            .subpass(desc.subpass);

        if desc.patch_control_points.is_some() {
            create_info = create_info.tessellation_state(&tessellation);
        }
        if let Some(depth_stencil) = &depth_stencil {
            create_info = create_info.depth_stencil_state(depth_stencil);
        }
        if let Some(blend) = &blend {
            create_info = create_info.color_blend_state(blend);
        }

        let pipeline = unsafe {
            self.device
                .raw
                .create_graphics_pipelines(
                    self.vk_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, result)| result)?[0]
        };

        Ok(CacheObject::Pipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> Result<CacheObject, vk::Result> {
        let entry_point = CString::new("main").unwrap();

        let spec_info = desc.stage.specialization.as_ref().map(|spec| {
            vk::SpecializationInfo::default()
                .map_entries(&spec.map_entries)
                .data(&spec.data)
        });

        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(desc.stage.module.raw)
            .name(&entry_point);
        if let Some(spec) = &spec_info {
            stage = stage.specialization_info(spec);
        }

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(desc.layout.pipeline_layout());

        let pipeline = unsafe {
            self.device
                .raw
                .create_compute_pipelines(
                    self.vk_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, result)| result)?[0]
        };

        Ok(CacheObject::Pipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    fn destroy_object(&self, elem: &CacheElem) {
        unsafe {
            match elem.object {
                CacheObject::SetLayout { layout, template } => {
                    if !template.is_null() {
                        self.device
                            .raw
                            .destroy_descriptor_update_template(template, None);
                    }
                    self.device.raw.destroy_descriptor_set_layout(layout, None);
                }
                CacheObject::PipelineLayout(layout) => {
                    self.device.raw.destroy_pipeline_layout(layout, None);
                }
                CacheObject::Sampler(sampler) => {
                    self.device.raw.destroy_sampler(sampler, None);
                    self.device.release_sampler_slot();
                }
                CacheObject::RenderPass(pass) => {
                    self.device.raw.destroy_render_pass(pass, None);
                }
                CacheObject::Pipeline { pipeline, .. } => {
                    self.device.raw.destroy_pipeline(pipeline, None);
                }
            }
        }
    }

    /// Destroys everything, including the Vulkan pipeline cache. The caller
    /// must have synchronized all GPU work referencing cached objects.
    pub fn clear(&self) {
        for table in [
            std::mem::take(&mut *self.mutable.lock()),
            std::mem::take(&mut *self.immutable.write()),
            std::mem::take(&mut *self.simple.lock()),
        ] {
            for elem in table.values() {
                self.destroy_object(elem);
            }
        }
    }

    /// Serializes the Vulkan pipeline cache into the persistable blob.
    pub fn store(&self) -> RenderResult<Vec<u8>> {
        let props = &self.device.physical_device.properties;

        let mut builder = HashBuilder::new();
        builder.push_u32(BLOB_MAGIC);
        let size_at = builder.push_zeroed(4);
        let hash_at = builder.push_zeroed(8);
        builder.push_u32(props.vendor_id);
        builder.push_u32(props.device_id);
        builder.push_u32(props.driver_version);
        builder.push_u32(std::mem::size_of::<usize>() as u32);
        builder.push_bytes(&props.pipeline_cache_uuid);

        let data = unsafe { self.device.raw.get_pipeline_cache_data(self.vk_cache)? };
        builder.push_bytes(&data);

        // Size first, then hash over the blob with the hash field zeroed.
        let total = builder.len() as u32;
        builder.patch(size_at, &total.to_le_bytes());
        let hash = murmur3_64(builder.as_bytes(), 0);
        builder.patch(hash_at, &hash.to_le_bytes());

        let blob = builder.finish();
        log::info!("Written pipeline cache blob ({} bytes).", blob.len());

        Ok(blob.bytes().to_vec())
    }

    /// Validates a blob produced by [`Self::store`] and merges its data
    /// into the live pipeline cache. Any mismatch is `Incompatible`.
    pub fn load(&self, blob: &[u8]) -> RenderResult<()> {
        let props = &self.device.physical_device.properties;
        let payload = validate_blob(
            blob,
            props.vendor_id,
            props.device_id,
            props.driver_version,
            &props.pipeline_cache_uuid,
        )
        .map_err(|reason| {
            log::error!("Could not load pipeline cache; {}.", reason);
            RenderError::Incompatible
        })?;

        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(payload);
        let loaded = unsafe { self.device.raw.create_pipeline_cache(&create_info, None)? };

        let merged = unsafe {
            self.device
                .raw
                .merge_pipeline_caches(self.vk_cache, &[loaded])
        };
        unsafe {
            self.device.raw.destroy_pipeline_cache(loaded, None);
        }
        merged?;

        log::info!("Successfully loaded pipeline cache blob ({} bytes).", blob.len());
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.clear();
        unsafe {
            self.device.raw.destroy_pipeline_cache(self.vk_cache, None);
        }
    }
}

/// Checks every header field of a pipeline-cache blob and returns the
/// opaque Vulkan payload on success.
fn validate_blob<'a>(
    blob: &'a [u8],
    vendor_id: u32,
    device_id: u32,
    driver_version: u32,
    uuid: &[u8; vk::UUID_SIZE],
) -> Result<&'a [u8], &'static str> {
    if blob.len() < BLOB_HEADER_SIZE {
        return Err("header is incomplete");
    }

    let u32_at = |at: usize| u32::from_le_bytes(blob[at..at + 4].try_into().unwrap());

    if u32_at(0) != BLOB_MAGIC {
        return Err("magic number mismatch");
    }
    if u32_at(4) as usize != blob.len() {
        return Err("size mismatch");
    }

    let stored_hash = u64::from_le_bytes(blob[8..16].try_into().unwrap());

    // Hash with the hash field zeroed, exactly as it was stored.
    let mut copy = blob.to_vec();
    copy[8..16].fill(0);
    if stored_hash != murmur3_64(&copy, 0) {
        return Err("hash mismatch");
    }

    if u32_at(16) != vendor_id || u32_at(20) != device_id || u32_at(24) != driver_version {
        return Err("data is for a different device or driver");
    }
    if u32_at(28) != std::mem::size_of::<usize>() as u32 {
        return Err("pointer size ABI mismatch");
    }
    if &blob[32..32 + vk::UUID_SIZE] != uuid {
        return Err("pipeline cache UUID mismatch");
    }

    Ok(&blob[BLOB_HEADER_SIZE..])
}

/// Builds the normalized lookup key for a descriptor.
///
/// Fields are pushed linearly in declaration order of the matching
/// `Vk*CreateInfo`. Flags that do not affect the created object, entry
/// point names and unrecognized extension chains are not part of a key;
/// referenced objects contribute their stable id.
pub(crate) fn build_key(descriptor: &CacheDescriptor) -> HashKey {
    let mut b = HashBuilder::new();

    match descriptor {
        CacheDescriptor::SetLayout(desc) => {
            b.push_u32(TAG_SET_LAYOUT);
            b.push_len(desc.bindings.len());
            for binding in &desc.bindings {
                b.push_u32(binding.binding);
                b.push_i32(binding.descriptor_type.as_raw());
                b.push_u32(binding.count);
                b.push_u32(binding.stages.as_raw());
                b.push_bool(binding.count > 0 && !binding.immutable_samplers.is_empty());
                for sampler in &binding.immutable_samplers {
                    b.push_handle(sampler.id());
                }
            }
        }

        CacheDescriptor::PipelineLayout(desc) => {
            b.push_u32(TAG_PIPELINE_LAYOUT);
            b.push_len(desc.set_layouts.len());
            for layout in &desc.set_layouts {
                b.push_handle(layout.id());
            }
            b.push_len(desc.push_constants.len());
            for range in &desc.push_constants {
                b.push_u32(range.stage_flags.as_raw());
                b.push_u32(range.offset);
                b.push_u32(range.size);
            }
        }

        CacheDescriptor::Sampler(desc) => {
            b.push_u32(TAG_SAMPLER);
            b.push_bool(desc.reduction_mode != vk::SamplerReductionMode::WEIGHTED_AVERAGE);
            if desc.reduction_mode != vk::SamplerReductionMode::WEIGHTED_AVERAGE {
                b.push_i32(desc.reduction_mode.as_raw());
            }
            b.push_i32(desc.mag_filter.as_raw());
            b.push_i32(desc.min_filter.as_raw());
            b.push_i32(desc.mipmap_mode.as_raw());
            b.push_i32(desc.address_mode_u.as_raw());
            b.push_i32(desc.address_mode_v.as_raw());
            b.push_i32(desc.address_mode_w.as_raw());
            b.push_f32(desc.mip_lod_bias);
            b.push_bool(desc.anisotropy_enable);
            b.push_f32(desc.max_anisotropy);
            b.push_bool(desc.compare_enable);
            b.push_i32(desc.compare_op.as_raw());
            b.push_f32(desc.min_lod);
            b.push_f32(desc.max_lod);
            b.push_i32(desc.border_color.as_raw());
            b.push_bool(desc.unnormalized_coordinates);
        }

        CacheDescriptor::RenderPass(desc) => {
            b.push_u32(TAG_RENDER_PASS);
            b.push_len(desc.attachments.len());
            for at in &desc.attachments {
                b.push_i32(at.format.as_raw());
                b.push_u32(at.samples.as_raw());
                b.push_i32(at.load_op.as_raw());
                b.push_i32(at.store_op.as_raw());
                b.push_i32(at.stencil_load_op.as_raw());
                b.push_i32(at.stencil_store_op.as_raw());
                b.push_i32(at.initial_layout.as_raw());
                b.push_i32(at.final_layout.as_raw());
            }
            b.push_len(desc.subpasses.len());
            for subpass in &desc.subpasses {
                push_references(&mut b, &subpass.inputs);
                push_references(&mut b, &subpass.colors);
                b.push_bool(!subpass.resolves.is_empty());
                if !subpass.resolves.is_empty() {
                    push_references(&mut b, &subpass.resolves);
                }
                b.push_bool(subpass.depth_stencil.is_some());
                if let Some(depth_stencil) = &subpass.depth_stencil {
                    b.push_u32(depth_stencil.attachment);
                    b.push_i32(depth_stencil.layout.as_raw());
                }
                b.push_len(subpass.preserves.len());
                for preserve in &subpass.preserves {
                    b.push_u32(*preserve);
                }
            }
            b.push_len(desc.dependencies.len());
            for dep in &desc.dependencies {
                b.push_u32(dep.src_subpass);
                b.push_u32(dep.dst_subpass);
                b.push_u32(dep.src_stage_mask.as_raw());
                b.push_u32(dep.dst_stage_mask.as_raw());
                b.push_u32(dep.src_access_mask.as_raw());
                b.push_u32(dep.dst_access_mask.as_raw());
                b.push_u32(dep.dependency_flags.as_raw());
            }
        }

        CacheDescriptor::GraphicsPipeline(desc) => {
            b.push_u32(TAG_GRAPHICS_PIPELINE);
            b.push_len(desc.stages.len());
            for stage in &desc.stages {
                b.push_u32(stage.module.stage.as_raw());
                b.push_handle(stage.module.id());
                push_specialization(&mut b, stage.specialization.as_ref());
            }

            b.push_len(desc.vertex_bindings.len());
            for binding in &desc.vertex_bindings {
                b.push_u32(binding.binding);
                b.push_u32(binding.stride);
                b.push_i32(binding.input_rate.as_raw());
            }
            b.push_len(desc.vertex_attributes.len());
            for attribute in &desc.vertex_attributes {
                b.push_u32(attribute.location);
                b.push_u32(attribute.binding);
                b.push_i32(attribute.format.as_raw());
                b.push_u32(attribute.offset);
            }

            b.push_i32(desc.topology.as_raw());
            b.push_bool(desc.primitive_restart);

            b.push_bool(desc.patch_control_points.is_some());
            if let Some(points) = desc.patch_control_points {
                b.push_u32(points);
            }

            b.push_bool(desc.rasterization.depth_clamp);
            b.push_bool(desc.rasterization.rasterizer_discard);
            b.push_i32(desc.rasterization.polygon_mode.as_raw());
            b.push_u32(desc.rasterization.cull_mode.as_raw());
            b.push_i32(desc.rasterization.front_face.as_raw());
            b.push_f32(desc.rasterization.line_width);

            b.push_u32(desc.samples.as_raw());

            b.push_bool(desc.depth_stencil.is_some());
            if let Some(state) = &desc.depth_stencil {
                b.push_bool(state.depth_test);
                b.push_bool(state.depth_write);
                b.push_i32(state.depth_compare.as_raw());
                b.push_bool(state.depth_bounds_test);
                b.push_bool(state.stencil_test);
                push_stencil_op(&mut b, &state.front);
                push_stencil_op(&mut b, &state.back);
                b.push_f32(state.min_depth_bounds);
                b.push_f32(state.max_depth_bounds);
            }

            b.push_bool(desc.blend.is_some());
            if let Some(state) = &desc.blend {
                b.push_len(state.attachments.len());
                for at in &state.attachments {
                    b.push_u32(at.blend_enable);
                    b.push_i32(at.src_color_blend_factor.as_raw());
                    b.push_i32(at.dst_color_blend_factor.as_raw());
                    b.push_i32(at.color_blend_op.as_raw());
                    b.push_i32(at.src_alpha_blend_factor.as_raw());
                    b.push_i32(at.dst_alpha_blend_factor.as_raw());
                    b.push_i32(at.alpha_blend_op.as_raw());
                    b.push_u32(at.color_write_mask.as_raw());
                }
                for constant in state.constants {
                    b.push_f32(constant);
                }
            }

            b.push_handle(desc.layout.id());
            b.push_handle(desc.render_pass.id());
            b.push_u32(desc.subpass);
        }

        CacheDescriptor::ComputePipeline(desc) => {
            b.push_u32(TAG_COMPUTE_PIPELINE);
            b.push_handle(desc.stage.module.id());
            push_specialization(&mut b, desc.stage.specialization.as_ref());
            b.push_handle(desc.layout.id());
        }
    }

    b.finish()
}

fn push_references(b: &mut HashBuilder, refs: &[vk::AttachmentReference]) {
    b.push_len(refs.len());
    for reference in refs {
        b.push_u32(reference.attachment);
        b.push_i32(reference.layout.as_raw());
    }
}

fn push_stencil_op(b: &mut HashBuilder, state: &vk::StencilOpState) {
    b.push_i32(state.fail_op.as_raw());
    b.push_i32(state.pass_op.as_raw());
    b.push_i32(state.depth_fail_op.as_raw());
    b.push_i32(state.compare_op.as_raw());
    b.push_u32(state.compare_mask);
    b.push_u32(state.write_mask);
    b.push_u32(state.reference);
}

fn push_specialization(b: &mut HashBuilder, spec: Option<&SpecializationDescriptor>) {
    b.push_bool(spec.is_some());
    if let Some(spec) = spec {
        b.push_len(spec.map_entries.len());
        for entry in &spec.map_entries {
            b.push_u32(entry.constant_id);
            b.push_u32(entry.offset);
            b.push_u64(entry.size as u64);
        }
        b.push_len(spec.data.len());
        b.push_bytes(&spec.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_keys_are_structural() {
        let a = SamplerDescriptor::default();
        let b = SamplerDescriptor::default();
        assert_eq!(
            build_key(&CacheDescriptor::Sampler(&a)),
            build_key(&CacheDescriptor::Sampler(&b))
        );

        let c = SamplerDescriptor {
            mag_filter: vk::Filter::NEAREST,
            ..SamplerDescriptor::default()
        };
        assert_ne!(
            build_key(&CacheDescriptor::Sampler(&a)),
            build_key(&CacheDescriptor::Sampler(&c))
        );
    }

    #[test]
    fn default_reduction_mode_is_not_encoded() {
        // Matches the blob stability rule: only a recognized extension
        // (non-default reduction mode) contributes bytes.
        let plain = SamplerDescriptor::default();
        let reduced = SamplerDescriptor {
            reduction_mode: vk::SamplerReductionMode::MIN,
            ..SamplerDescriptor::default()
        };
        let key_plain = build_key(&CacheDescriptor::Sampler(&plain));
        let key_reduced = build_key(&CacheDescriptor::Sampler(&reduced));
        assert_eq!(key_reduced.len(), key_plain.len() + 4);
    }

    #[test]
    fn render_pass_keys_cover_references() {
        let base = RenderPassDescriptor {
            attachments: vec![vk::AttachmentDescription::default()
                .format(vk::Format::B8G8R8A8_UNORM)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)],
            subpasses: vec![SubpassDescriptor {
                colors: vec![vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };

        let mut reordered = base.clone();
        reordered.subpasses[0].colors[0].layout = vk::ImageLayout::GENERAL;

        assert_ne!(
            build_key(&CacheDescriptor::RenderPass(&base)),
            build_key(&CacheDescriptor::RenderPass(&reordered))
        );
    }

    #[test]
    fn blob_round_trip_validates() {
        let uuid = [7u8; vk::UUID_SIZE];
        let payload = b"opaque driver data";

        let mut builder = HashBuilder::new();
        builder.push_u32(BLOB_MAGIC);
        let size_at = builder.push_zeroed(4);
        let hash_at = builder.push_zeroed(8);
        builder.push_u32(0x10de);
        builder.push_u32(0x2204);
        builder.push_u32(12345);
        builder.push_u32(std::mem::size_of::<usize>() as u32);
        builder.push_bytes(&uuid);
        builder.push_bytes(payload);

        let total = builder.len() as u32;
        builder.patch(size_at, &total.to_le_bytes());
        let hash = murmur3_64(builder.as_bytes(), 0);
        builder.patch(hash_at, &hash.to_le_bytes());
        let blob = builder.finish();

        let parsed = validate_blob(blob.bytes(), 0x10de, 0x2204, 12345, &uuid).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn blob_rejects_corruption() {
        let uuid = [7u8; vk::UUID_SIZE];

        let make = || {
            let mut builder = HashBuilder::new();
            builder.push_u32(BLOB_MAGIC);
            let size_at = builder.push_zeroed(4);
            let hash_at = builder.push_zeroed(8);
            builder.push_u32(1);
            builder.push_u32(2);
            builder.push_u32(3);
            builder.push_u32(std::mem::size_of::<usize>() as u32);
            builder.push_bytes(&uuid);
            builder.push_bytes(b"data");
            let total = builder.len() as u32;
            builder.patch(size_at, &total.to_le_bytes());
            let hash = murmur3_64(builder.as_bytes(), 0);
            builder.patch(hash_at, &hash.to_le_bytes());
            builder.finish().bytes().to_vec()
        };

        // Pristine blob passes.
        assert!(validate_blob(&make(), 1, 2, 3, &uuid).is_ok());

        // Flipped payload byte fails the hash.
        let mut corrupt = make();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        assert_eq!(
            validate_blob(&corrupt, 1, 2, 3, &uuid),
            Err("hash mismatch")
        );

        // Wrong device rejects.
        assert_eq!(
            validate_blob(&make(), 1, 9, 3, &uuid),
            Err("data is for a different device or driver")
        );

        // Wrong UUID rejects.
        let other_uuid = [8u8; vk::UUID_SIZE];
        assert_eq!(
            validate_blob(&make(), 1, 2, 3, &other_uuid),
            Err("pipeline cache UUID mismatch")
        );

        // Truncation rejects.
        assert_eq!(
            validate_blob(&make()[..20], 1, 2, 3, &uuid),
            Err("header is incomplete")
        );
        assert_eq!(
            validate_blob(&make()[..50], 1, 2, 3, &uuid),
            Err("size mismatch")
        );
    }
}
