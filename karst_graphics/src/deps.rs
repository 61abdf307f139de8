//! Dependency objects: user-visible synchronization tokens.
//!
//! A [`Dependency`] stores pending signal records. A signal command appended
//! while recording one pass is matched against wait commands of later passes
//! (possibly on another queue); a matched pair turns into the minimal
//! synchronization primitive: a pipeline barrier within a queue, a semaphore
//! across queues. A signal pairs with exactly one wait, a wait consumes
//! every matching signal. Unmatched waits are not an error, the barrier is
//! simply omitted.
//!
//! All barriers and semaphore operations of one pass are buffered in an
//! [`Injection`] and flushed in a single `vkCmdPipelineBarrier` before the
//! pass's own commands.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::{
    types::{
        format_has_depth, format_has_depth_or_stencil, format_has_stencil, AccessMask, Range,
        StageMask,
    },
    vulkan::{DeviceShared, Semaphore},
};

/// The resource a dependency command refers to. `None` inside an injection
/// means "any resource of the dependency".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    Buffer(vk::Buffer),
    Image(vk::Image),
    /// A renderer attachment by index.
    Attachment(usize),
}

/// A dependency injection command, passed to pass or frame submission.
#[derive(Clone)]
pub struct Inject {
    pub(crate) dep: Arc<Dependency>,
    pub(crate) kind: InjectKind,
    pub(crate) resource: Option<ResourceRef>,
    pub(crate) range: Range,
    pub(crate) mask: AccessMask,
    pub(crate) stage: StageMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InjectKind {
    Signal,
    Wait,
}

impl Inject {
    pub fn signal(dep: &Arc<Dependency>, mask: AccessMask, stage: StageMask) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Signal,
            resource: None,
            range: Range::whole(),
            mask,
            stage,
        }
    }

    pub fn signal_ref(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        resource: ResourceRef,
    ) -> Self {
        Self {
            resource: Some(resource),
            ..Self::signal(dep, mask, stage)
        }
    }

    pub fn signal_area(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        range: Range,
    ) -> Self {
        Self {
            range,
            ..Self::signal(dep, mask, stage)
        }
    }

    pub fn signal_ref_area(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        resource: ResourceRef,
        range: Range,
    ) -> Self {
        Self {
            resource: Some(resource),
            range,
            ..Self::signal(dep, mask, stage)
        }
    }

    pub fn wait(dep: &Arc<Dependency>, mask: AccessMask, stage: StageMask) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Wait,
            resource: None,
            range: Range::whole(),
            mask,
            stage,
        }
    }

    pub fn wait_ref(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        resource: ResourceRef,
    ) -> Self {
        Self {
            resource: Some(resource),
            ..Self::wait(dep, mask, stage)
        }
    }

    pub fn wait_area(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        range: Range,
    ) -> Self {
        Self {
            range,
            ..Self::wait(dep, mask, stage)
        }
    }

    pub fn wait_ref_area(
        dep: &Arc<Dependency>,
        mask: AccessMask,
        stage: StageMask,
        resource: ResourceRef,
        range: Range,
    ) -> Self {
        Self {
            resource: Some(resource),
            range,
            ..Self::wait(dep, mask, stage)
        }
    }
}

/// A signal not yet consumed by a wait.
pub(crate) struct SignalRecord {
    pub(crate) resource: Option<ResourceRef>,
    pub(crate) range: Range,
    pub(crate) mask: AccessMask,
    pub(crate) stage: StageMask,
    /// Queue family the signaling pass recorded on.
    pub(crate) queue_family: u32,
    /// Created when the signal must be visible on another queue; signaled
    /// by the producing submission, consumed by the matching wait.
    pub(crate) semaphore: Option<Arc<Semaphore>>,
    /// Still tied to an unsubmitted frame; discarded on abort.
    pub(crate) provisional: bool,
}

/// Whether a wait command consumes a given signal record.
pub(crate) fn wait_matches_signal(
    record: &SignalRecord,
    resource: Option<ResourceRef>,
    range: &Range,
    mask: AccessMask,
) -> bool {
    // A wait with no reference matches any resource.
    if let (Some(waited), Some(signaled)) = (resource, record.resource) {
        if waited != signaled {
            return false;
        }
    }

    if !record.range.overlaps(range) {
        return false;
    }

    // Empty wait mask takes whatever access the signal advertised; both
    // sides must agree on the async modifiers either way.
    if record.mask.modifiers() != mask.modifiers() {
        return false;
    }
    let mask_bits = mask & !(AccessMask::COMPUTE_ASYNC | AccessMask::TRANSFER_ASYNC);
    let record_bits = record.mask & !(AccessMask::COMPUTE_ASYNC | AccessMask::TRANSFER_ASYNC);
    mask_bits.is_empty() || record_bits.intersects(mask_bits)
}

/// Same-queue pairing: one memory barrier covering both execution order
/// and visibility, from the signal's scope into the wait's. A wait without
/// an access mask takes whatever scope the signal advertised.
pub(crate) fn push_matched_barrier(
    record: &SignalRecord,
    wait_mask: AccessMask,
    wait_stage: StageMask,
    injection: &mut Injection,
) {
    let src_stage = vk_pipeline_stage(record.mask, record.stage, vk::Format::UNDEFINED);
    let dst_stage = if wait_stage.is_empty() && wait_mask.is_empty() {
        vk::PipelineStageFlags::ALL_COMMANDS
    } else {
        vk_pipeline_stage(wait_mask, wait_stage, vk::Format::UNDEFINED)
    };

    let dst_mask = if wait_mask.is_empty() {
        record.mask
    } else {
        wait_mask
    };

    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk_access_flags(record.mask, vk::Format::UNDEFINED))
        .dst_access_mask(vk_access_flags(dst_mask, vk::Format::UNDEFINED));

    injection.push_memory_barrier(src_stage, dst_stage, barrier);
}

/// Synchronization token; lives independently of any renderer and is shared
/// by every producer and consumer holding an injection for it.
pub struct Dependency {
    device: Arc<DeviceShared>,
    signals: Mutex<Vec<SignalRecord>>,
}

impl Dependency {
    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Arc::new(Self {
            device,
            signals: Mutex::new(Vec::new()),
        })
    }

    /// Drains signal records matching a wait command, emitting barriers or
    /// semaphore waits into the injection. Called when a pass submission
    /// begins.
    pub(crate) fn catch(&self, inject: &Inject, injection: &mut Injection) {
        debug_assert_eq!(inject.kind, InjectKind::Wait);

        let mut signals = self.signals.lock();
        let mut matched = Vec::new();
        signals.retain(|record| {
            if wait_matches_signal(record, inject.resource, &inject.range, inject.mask) {
                matched.push(SignalRecord {
                    resource: record.resource,
                    range: record.range,
                    mask: record.mask,
                    stage: record.stage,
                    queue_family: record.queue_family,
                    semaphore: record.semaphore.clone(),
                    provisional: record.provisional,
                });
                false
            } else {
                true
            }
        });
        drop(signals);

        for record in matched {
            if record.queue_family == injection.queue_family {
                push_matched_barrier(&record, inject.mask, inject.stage, injection);
            } else if let Some(semaphore) = record.semaphore {
                // Cross-queue: the producing submission signals, we wait.
                let dst_stage = if inject.stage.is_empty() {
                    vk::PipelineStageFlags::ALL_COMMANDS
                } else {
                    vk_pipeline_stage(inject.mask, inject.stage, vk::Format::UNDEFINED)
                };
                injection.push_wait_semaphore(semaphore, dst_stage);
            } else {
                log::warn!(
                    "Dependency signal crossed queue families without a semaphore; \
                     synchronization omitted."
                );
            }
        }
    }

    /// Records a signal command. Called when a pass submission finishes;
    /// appends a semaphore to the injection's signal list when the signal
    /// must reach another queue.
    pub(crate) fn prepare(&self, inject: &Inject, injection: &mut Injection) {
        debug_assert_eq!(inject.kind, InjectKind::Signal);

        // The async modifiers say which queue the consuming operation runs
        // on; everything else is consumed where it was produced.
        let graphics_family = self.device.graphics.family_index;
        let compute_family = self.device.compute.family_index;

        let consumer_family = if inject.mask.contains(AccessMask::COMPUTE_ASYNC) {
            compute_family
        } else {
            graphics_family
        };

        let semaphore = if consumer_family != injection.queue_family {
            match Semaphore::new(self.device.clone()) {
                Ok(semaphore) => {
                    let semaphore = Arc::new(semaphore);
                    injection.push_signal_semaphore(semaphore.clone());
                    Some(semaphore)
                }
                Err(result) => {
                    log::error!("Could not create dependency semaphore: {}", result);
                    None
                }
            }
        } else {
            None
        };

        self.signals.lock().push(SignalRecord {
            resource: inject.resource,
            range: inject.range,
            mask: inject.mask,
            stage: inject.stage,
            queue_family: injection.queue_family,
            semaphore,
            provisional: true,
        });
    }

    /// Promotes provisional records after a successful submission.
    pub(crate) fn finish(&self) {
        for record in self.signals.lock().iter_mut() {
            record.provisional = false;
        }
    }

    /// Discards provisional records after a failed submission.
    pub(crate) fn abort(&self) {
        self.signals.lock().retain(|record| !record.provisional);
    }

    /// Resources named by pending signals must stay alive until waited on.
    pub fn has_pending_signals(&self) -> bool {
        !self.signals.lock().is_empty()
    }
}

impl Drop for Dependency {
    fn drop(&mut self) {
        // Destroying a dependency that still pairs unfinished GPU work
        // would leave those operations unsynchronized.
        if !self.signals.get_mut().is_empty() {
            log::error!(
                "Dependency object destroyed while signal commands are still pending."
            );
        }
    }
}

/// Buffered synchronization output of one queue submission: barriers to
/// flush before each pass plus the semaphores the submission waits on and
/// signals.
pub(crate) struct Injection {
    pub(crate) queue_family: u32,

    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    memory_barriers: Vec<vk::MemoryBarrier<'static>>,
    image_barriers: Vec<vk::ImageMemoryBarrier<'static>>,

    pub(crate) wait_semaphores: Vec<vk::Semaphore>,
    pub(crate) wait_stages: Vec<vk::PipelineStageFlags>,
    pub(crate) signal_semaphores: Vec<vk::Semaphore>,

    /// Keeps cross-queue semaphores alive until the frame retires.
    pub(crate) retained: Vec<Arc<Semaphore>>,
}

impl Injection {
    pub(crate) fn new(queue_family: u32) -> Self {
        Self {
            queue_family,
            src_stages: vk::PipelineStageFlags::empty(),
            dst_stages: vk::PipelineStageFlags::empty(),
            memory_barriers: Vec::new(),
            image_barriers: Vec::new(),
            wait_semaphores: Vec::new(),
            wait_stages: Vec::new(),
            signal_semaphores: Vec::new(),
            retained: Vec::new(),
        }
    }

    /// Execution-only dependency: just widens the flushed stage masks.
    pub(crate) fn push_execution_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.src_stages |= src_stage;
        self.dst_stages |= dst_stage;
    }

    pub(crate) fn push_memory_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::MemoryBarrier<'static>,
    ) {
        self.src_stages |= src_stage;
        self.dst_stages |= dst_stage;
        self.memory_barriers.push(barrier);
    }

    pub(crate) fn push_image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier<'static>,
    ) {
        self.src_stages |= src_stage;
        self.dst_stages |= dst_stage;
        self.image_barriers.push(barrier);
    }

    pub(crate) fn push_wait_semaphore(
        &mut self,
        semaphore: Arc<Semaphore>,
        stage: vk::PipelineStageFlags,
    ) {
        self.wait_semaphores.push(semaphore.raw);
        self.wait_stages.push(stage);
        self.retained.push(semaphore);
    }

    pub(crate) fn push_signal_semaphore(&mut self, semaphore: Arc<Semaphore>) {
        self.signal_semaphores.push(semaphore.raw);
        self.retained.push(semaphore);
    }

    pub(crate) fn has_barriers(&self) -> bool {
        !self.memory_barriers.is_empty()
            || !self.image_barriers.is_empty()
            || !self.src_stages.is_empty()
            || !self.dst_stages.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn barrier_counts(&self) -> (usize, usize) {
        (self.memory_barriers.len(), self.image_barriers.len())
    }

    #[cfg(test)]
    pub(crate) fn stages(&self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        (self.src_stages, self.dst_stages)
    }

    #[cfg(test)]
    pub(crate) fn memory_barriers(&self) -> &[vk::MemoryBarrier<'static>] {
        &self.memory_barriers
    }

    /// Emits all buffered barriers in one call and resets the buffers.
    pub(crate) fn flush(&mut self, device: &DeviceShared, cmd: vk::CommandBuffer) {
        if !self.has_barriers() {
            return;
        }

        let src = if self.src_stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stages
        };
        let dst = if self.dst_stages.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stages
        };

        unsafe {
            device.raw.cmd_pipeline_barrier(
                cmd,
                src,
                dst,
                vk::DependencyFlags::empty(),
                &self.memory_barriers,
                &[],
                &self.image_barriers,
            );
        }

        self.src_stages = vk::PipelineStageFlags::empty();
        self.dst_stages = vk::PipelineStageFlags::empty();
        self.memory_barriers.clear();
        self.image_barriers.clear();
    }
}

/// Expands an access mask to Vulkan access flags. Depth/stencil attachment
/// bits are only produced when the format has those aspects; host bits are
/// kept here and stripped by consumption insertion (images cannot be
/// mapped).
pub(crate) fn vk_access_flags(mask: AccessMask, format: vk::Format) -> vk::AccessFlags {
    let depth_stencil = format_has_depth_or_stencil(format);
    let mut flags = vk::AccessFlags::empty();

    if mask.contains(AccessMask::VERTEX_READ) {
        flags |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if mask.contains(AccessMask::INDEX_READ) {
        flags |= vk::AccessFlags::INDEX_READ;
    }
    if mask.contains(AccessMask::UNIFORM_READ) {
        flags |= vk::AccessFlags::UNIFORM_READ;
    }
    if mask.contains(AccessMask::INDIRECT_READ) {
        flags |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if mask.contains(AccessMask::SAMPLED_READ) || mask.contains(AccessMask::STORAGE_READ) {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if mask.contains(AccessMask::STORAGE_WRITE) {
        flags |= vk::AccessFlags::SHADER_WRITE;
    }
    if mask.contains(AccessMask::ATTACHMENT_INPUT) {
        flags |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
    }
    if mask.contains(AccessMask::ATTACHMENT_READ) {
        flags |= if depth_stencil {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_READ
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_WRITE) {
        flags |= if depth_stencil {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_RESOLVE) {
        flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if mask.contains(AccessMask::TRANSFER_READ) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if mask.contains(AccessMask::TRANSFER_WRITE) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if mask.contains(AccessMask::HOST_READ) {
        flags |= vk::AccessFlags::HOST_READ;
    }
    if mask.contains(AccessMask::HOST_WRITE) {
        flags |= vk::AccessFlags::HOST_WRITE;
    }

    flags
}

fn shader_stages(stages: StageMask) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    if stages.contains(StageMask::VERTEX) {
        flags |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stages.contains(StageMask::TESS_CONTROL) {
        flags |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER;
    }
    if stages.contains(StageMask::TESS_EVALUATION) {
        flags |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
    }
    if stages.contains(StageMask::GEOMETRY) {
        flags |= vk::PipelineStageFlags::GEOMETRY_SHADER;
    }
    if stages.contains(StageMask::FRAGMENT) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(StageMask::COMPUTE) {
        flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if flags.is_empty() {
        flags = vk::PipelineStageFlags::ALL_COMMANDS;
    }
    flags
}

/// Expands an access mask plus shader stages to the pipeline stages the
/// access can happen in, per the supported-pipeline-stages rules of each
/// access flag.
pub(crate) fn vk_pipeline_stage(
    mask: AccessMask,
    stages: StageMask,
    format: vk::Format,
) -> vk::PipelineStageFlags {
    let depth_stencil = format_has_depth_or_stencil(format);
    let mut flags = vk::PipelineStageFlags::empty();

    if mask.intersects(AccessMask::VERTEX_READ | AccessMask::INDEX_READ) {
        flags |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if mask.contains(AccessMask::INDIRECT_READ) {
        flags |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if mask.intersects(
        AccessMask::UNIFORM_READ
            | AccessMask::SAMPLED_READ
            | AccessMask::STORAGE_READ
            | AccessMask::STORAGE_WRITE,
    ) {
        flags |= shader_stages(stages);
    }
    if mask.contains(AccessMask::ATTACHMENT_INPUT) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if mask.intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE) {
        flags |= if depth_stencil {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        } else {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_RESOLVE) {
        flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if mask.intersects(AccessMask::TRANSFER_READ | AccessMask::TRANSFER_WRITE) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if mask.intersects(AccessMask::HOST_READ | AccessMask::HOST_WRITE) {
        flags |= vk::PipelineStageFlags::HOST;
    }

    if flags.is_empty() {
        flags = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    flags
}

/// The image layout an access mask wants an attachment in.
pub(crate) fn vk_image_layout(mask: AccessMask, format: vk::Format) -> vk::ImageLayout {
    let depth_stencil = format_has_depth(format) || format_has_stencil(format);

    if mask.intersects(AccessMask::STORAGE_READ | AccessMask::STORAGE_WRITE) {
        return vk::ImageLayout::GENERAL;
    }
    if mask.contains(AccessMask::ATTACHMENT_WRITE) {
        return if depth_stencil {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_READ) {
        return if depth_stencil {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_RESOLVE) {
        return vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }
    if mask.intersects(AccessMask::ATTACHMENT_INPUT | AccessMask::SAMPLED_READ) {
        return if depth_stencil {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
    }
    if mask.contains(AccessMask::TRANSFER_READ) {
        return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    }
    if mask.contains(AccessMask::TRANSFER_WRITE) {
        return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }

    vk::ImageLayout::UNDEFINED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        resource: Option<ResourceRef>,
        range: Range,
        mask: AccessMask,
        family: u32,
    ) -> SignalRecord {
        SignalRecord {
            resource,
            range,
            mask,
            stage: StageMask::COMPUTE,
            queue_family: family,
            semaphore: None,
            provisional: true,
        }
    }

    #[test]
    fn wait_matches_same_resource_and_access() {
        let buffer = ResourceRef::Buffer(vk::Buffer::null());
        let signal = record(
            Some(buffer),
            Range::whole(),
            AccessMask::STORAGE_WRITE,
            0,
        );

        assert!(wait_matches_signal(
            &signal,
            Some(buffer),
            &Range::whole(),
            AccessMask::STORAGE_WRITE | AccessMask::STORAGE_READ,
        ));
    }

    #[test]
    fn null_wait_reference_matches_any_resource() {
        let signal = record(
            Some(ResourceRef::Attachment(3)),
            Range::whole(),
            AccessMask::ATTACHMENT_WRITE,
            0,
        );
        assert!(wait_matches_signal(
            &signal,
            None,
            &Range::whole(),
            AccessMask::empty(),
        ));
    }

    #[test]
    fn differing_resources_do_not_match() {
        let signal = record(
            Some(ResourceRef::Attachment(1)),
            Range::whole(),
            AccessMask::ATTACHMENT_WRITE,
            0,
        );
        assert!(!wait_matches_signal(
            &signal,
            Some(ResourceRef::Attachment(2)),
            &Range::whole(),
            AccessMask::empty(),
        ));
    }

    #[test]
    fn disjoint_ranges_do_not_match() {
        let signal = record(
            None,
            Range {
                mipmap: 0,
                num_mipmaps: 1,
                ..Range::whole()
            },
            AccessMask::TRANSFER_WRITE,
            0,
        );
        assert!(!wait_matches_signal(
            &signal,
            None,
            &Range {
                mipmap: 1,
                num_mipmaps: 1,
                ..Range::whole()
            },
            AccessMask::empty(),
        ));
    }

    #[test]
    fn async_modifiers_must_agree() {
        let signal = record(
            None,
            Range::whole(),
            AccessMask::STORAGE_WRITE | AccessMask::COMPUTE_ASYNC,
            1,
        );
        assert!(!wait_matches_signal(
            &signal,
            None,
            &Range::whole(),
            AccessMask::STORAGE_WRITE,
        ));
        assert!(wait_matches_signal(
            &signal,
            None,
            &Range::whole(),
            AccessMask::STORAGE_WRITE | AccessMask::COMPUTE_ASYNC,
        ));
    }

    #[test]
    fn non_intersecting_access_does_not_match() {
        let signal = record(None, Range::whole(), AccessMask::TRANSFER_WRITE, 0);
        assert!(!wait_matches_signal(
            &signal,
            None,
            &Range::whole(),
            AccessMask::VERTEX_READ,
        ));
    }

    #[test]
    fn storage_write_to_vertex_read_expansion() {
        // The canonical compute-produces, vertex-consumes hand-off.
        assert_eq!(
            vk_access_flags(AccessMask::STORAGE_WRITE, vk::Format::UNDEFINED),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            vk_access_flags(AccessMask::VERTEX_READ, vk::Format::UNDEFINED),
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ
        );
        assert_eq!(
            vk_pipeline_stage(
                AccessMask::STORAGE_WRITE,
                StageMask::COMPUTE,
                vk::Format::UNDEFINED
            ),
            vk::PipelineStageFlags::COMPUTE_SHADER
        );
        assert_eq!(
            vk_pipeline_stage(
                AccessMask::VERTEX_READ,
                StageMask::VERTEX,
                vk::Format::UNDEFINED
            ),
            vk::PipelineStageFlags::VERTEX_INPUT
        );
    }

    #[test]
    fn depth_stencil_expansion_depends_on_format() {
        assert_eq!(
            vk_access_flags(AccessMask::ATTACHMENT_WRITE, vk::Format::D32_SFLOAT),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
        assert_eq!(
            vk_access_flags(AccessMask::ATTACHMENT_WRITE, vk::Format::B8G8R8A8_UNORM),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            vk_image_layout(AccessMask::ATTACHMENT_WRITE, vk::Format::D32_SFLOAT),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            vk_image_layout(AccessMask::ATTACHMENT_WRITE, vk::Format::B8G8R8A8_UNORM),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn discard_only_access_has_undefined_layout() {
        assert_eq!(
            vk_image_layout(AccessMask::DISCARD, vk::Format::B8G8R8A8_UNORM),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn matched_pair_emits_one_memory_barrier() {
        // A compute storage write handed to a vertex read: exactly one
        // memory barrier with the expected scopes.
        let signal = record(
            Some(ResourceRef::Buffer(vk::Buffer::null())),
            Range::whole(),
            AccessMask::STORAGE_WRITE,
            0,
        );
        let mut injection = Injection::new(0);

        push_matched_barrier(
            &signal,
            AccessMask::VERTEX_READ,
            StageMask::VERTEX,
            &mut injection,
        );

        assert_eq!(injection.barrier_counts(), (1, 0));
        let barrier = &injection.memory_barriers()[0];
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
        let (src, dst) = injection.stages();
        assert_eq!(src, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(dst, vk::PipelineStageFlags::VERTEX_INPUT);
    }

    #[test]
    fn maskless_wait_inherits_the_signal_scope() {
        let signal = record(None, Range::whole(), AccessMask::TRANSFER_WRITE, 0);
        let mut injection = Injection::new(0);

        push_matched_barrier(&signal, AccessMask::empty(), StageMask::empty(), &mut injection);

        let barrier = &injection.memory_barriers()[0];
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        let (_, dst) = injection.stages();
        assert_eq!(dst, vk::PipelineStageFlags::ALL_COMMANDS);
    }

    #[test]
    fn injection_buffers_and_merges_stages() {
        let mut injection = Injection::new(0);
        injection.push_execution_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::VERTEX_INPUT,
        );
        injection.push_memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::MemoryBarrier::default(),
        );

        let (mem, img) = injection.barrier_counts();
        assert_eq!((mem, img), (1, 0));
        let (src, dst) = injection.stages();
        assert_eq!(
            src,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            dst,
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }
}
