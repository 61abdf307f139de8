//! The render graph: a DAG of passes over the attachment backing.
//!
//! Passes are stored in an arena and addressed by [`PassId`]; parents must
//! exist at construction, so the graph is acyclic by construction and each
//! pass's `level` (1 + max parent level) is known at insertion. Submission
//! order is the level-sorted pass list, stable within a level, with all
//! render passes ahead of all async-compute passes; the render prefix goes
//! to the graphics queue, the rest to the compute queue.
//!
//! Building the graph analyzes consumptions in submission order to derive
//! image layouts and predecessor links, then warms and builds every render
//! pass. Any declaration change invalidates all derived state.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::{
    backing::{Attach, Backing},
    cache::Cache,
    deps::{vk_access_flags, vk_image_layout, vk_pipeline_stage, Injection},
    types::{format_aspect, RecreateFlags},
    vulkan::DeviceShared,
    RenderError, RenderResult,
};

pub mod pass;

pub use pass::{
    BlendOpState, BlendState, DepthState, Pass, PassType, RasterState, RenderState, StencilState,
};

use pass::Consume;

/// Stable handle to a pass of one renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) usize);

/// Vulkan handles replaced during a rebuild; still potentially referenced
/// by in-flight frames, destroyed after the next full synchronization.
#[derive(Default)]
pub(crate) struct StaleResources {
    framebuffers: Vec<vk::Framebuffer>,
    views: Vec<vk::ImageView>,
}

impl StaleResources {
    pub(crate) fn push_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        if !framebuffer.is_null() {
            self.framebuffers.push(framebuffer);
        }
    }

    pub(crate) fn push_view(&mut self, view: vk::ImageView) {
        if !view.is_null() {
            self.views.push(view);
        }
    }

    /// Destroys everything queued. All frames must have been synchronized.
    pub(crate) fn purge(&mut self, device: &DeviceShared) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.raw.destroy_framebuffer(framebuffer, None);
            }
            for view in self.views.drain(..) {
                device.raw.destroy_image_view(view, None);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.framebuffers.is_empty() && self.views.is_empty()
    }
}

/// Format and kind of an attachment, as the analysis needs it.
#[derive(Clone, Copy)]
pub(crate) struct AttachInfo {
    pub(crate) format: vk::Format,
    pub(crate) window: bool,
}

#[derive(Default)]
pub struct Graph {
    pub(crate) arena: Vec<Pass>,
    /// Level-sorted linear submission order (arena indices).
    pub(crate) order: Vec<usize>,
    /// Count of passes submitted to the graphics queue; the prefix of
    /// `order`.
    pub(crate) num_render: usize,
    targets: Vec<usize>,

    built: bool,
}

impl Graph {
    pub(crate) fn pass(&self, id: PassId) -> Option<&Pass> {
        self.arena.get(id.0)
    }

    pub(crate) fn pass_mut(&mut self, id: PassId) -> Option<&mut Pass> {
        self.arena.get_mut(id.0)
    }

    pub(crate) fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn target(&self, index: usize) -> Option<PassId> {
        self.targets.get(index).copied().map(PassId)
    }

    pub(crate) fn is_built(&self) -> bool {
        self.built
    }

    /// Adds a pass after all its parents in submission order.
    pub(crate) fn add_pass(&mut self, ty: PassType, parents: &[PassId]) -> RenderResult<PassId> {
        let mut level = 0;
        for parent in parents {
            let Some(parent_pass) = self.arena.get(parent.0) else {
                return Err(RenderError::GraphInvalid("parent pass does not exist"));
            };

            // Queues only synchronize through dependency objects, so the
            // DAG cannot mix the two submission partitions.
            if (ty == PassType::ComputeAsync) != (parent_pass.ty == PassType::ComputeAsync) {
                return Err(RenderError::GraphInvalid(
                    "async compute passes cannot be ordered against render passes",
                ));
            }

            level = level.max(parent_pass.level + 1);
        }

        let id = self.arena.len();
        self.arena
            .push(Pass::new(ty, parents.iter().map(|parent| parent.0).collect(), level));

        for parent in parents {
            self.arena[parent.0].childs += 1;
        }

        // The new pass is a target; its parents no longer are.
        let arena = &self.arena;
        self.targets.retain(|&target| arena[target].childs == 0);
        self.targets.push(id);

        self.sort();
        Ok(PassId(id))
    }

    /// Rebuilds the linear submission order: render passes first, then
    /// async-compute, each level-sorted with insertion order preserved
    /// within a level.
    fn sort(&mut self) {
        self.order = (0..self.arena.len())
            .filter(|&index| self.arena[index].ty != PassType::ComputeAsync)
            .collect();
        self.order.sort_by_key(|&index| self.arena[index].level);
        self.num_render = self.order.len();

        let mut compute: Vec<usize> = (0..self.arena.len())
            .filter(|&index| self.arena[index].ty == PassType::ComputeAsync)
            .collect();
        compute.sort_by_key(|&index| self.arena[index].level);
        self.order.extend(compute);

        for (position, &index) in self.order.iter().enumerate() {
            self.arena[index].order = position as u32;
        }
    }

    /// Drops all derived state; called on any declaration change.
    pub(crate) fn invalidate(&mut self, stale: &mut StaleResources) {
        if !self.built {
            return;
        }
        for pass in &mut self.arena {
            pass.destruct(stale);
        }
        self.built = false;
    }

    /// Derives per-consumption layouts and predecessor links by walking
    /// the submission order. Predecessors never cross the queue partition
    /// boundary; cross-queue ordering is dependency-object business.
    fn analyze(&mut self, info: &dyn Fn(usize) -> Option<AttachInfo>) {
        // (pass arena index, consume index) of the last consumption.
        let mut last: HashMap<usize, (usize, usize)> = HashMap::new();
        // Last window consumptions get a present layout at partition end.
        let mut window_last: HashMap<usize, (usize, usize)> = HashMap::new();

        for partition in [
            &self.order[..self.num_render],
            &self.order[self.num_render..],
        ] {
            last.clear();

            for &pass_index in partition {
                for consume_index in 0..self.arena[pass_index].consumes.len() {
                    let attach_index = self.arena[pass_index].consumes[consume_index].index;
                    let Some(info) = info(attach_index) else {
                        continue;
                    };

                    let consume = &mut self.arena[pass_index].consumes[consume_index];
                    let layout = vk_image_layout(consume.mask, info.format);

                    consume.out_prev = last.insert(attach_index, (pass_index, consume_index));
                    consume.out_initial = if consume.out_prev.is_none() {
                        // First use this frame; prior contents are not
                        // carried over, the first pass loads nothing.
                        vk::ImageLayout::UNDEFINED
                    } else {
                        layout
                    };
                    consume.out_final = layout;

                    if info.window {
                        window_last.insert(attach_index, (pass_index, consume_index));
                    }
                }
            }
        }

        for (_, (pass_index, consume_index)) in window_last {
            let consume = &mut self.arena[pass_index].consumes[consume_index];
            consume.out_final = vk::ImageLayout::PRESENT_SRC_KHR;
        }
    }

    /// Analyzes and builds all render passes. Passes that are already
    /// built are left alone, so a transiently skipped pass (zero extent)
    /// gets another chance every acquire.
    pub(crate) fn build(
        &mut self,
        device: &Arc<DeviceShared>,
        backing: &Backing,
        cache: &Cache,
        stale: &mut StaleResources,
    ) -> RenderResult<()> {
        if !self.built {
            self.analyze(&|index| match backing.get(index) {
                Some(Attach::Image(image)) => Some(AttachInfo {
                    format: image.description.format,
                    window: false,
                }),
                Some(Attach::Window(window)) => Some(AttachInfo {
                    format: window.window.format(),
                    window: true,
                }),
                _ => None,
            });
        }

        for index in 0..self.arena.len() {
            if self.arena[index].ty == PassType::Render {
                match self.arena[index].build(device, backing, cache, stale) {
                    // Transient (e.g. a minimized window); the pass records
                    // nothing this frame, details were logged at detection.
                    Err(RenderError::Skip(_)) => {}
                    other => other?,
                }
            }
        }

        self.built = true;
        Ok(())
    }

    /// Re-derives swapchain-dependent state per the recreate flags. The
    /// filtered attachment lists and the analysis are kept; a reformat
    /// additionally invalidates the Vulkan render passes.
    pub(crate) fn rebuild(
        &mut self,
        device: &Arc<DeviceShared>,
        backing: &Backing,
        cache: &Cache,
        flags: RecreateFlags,
        stale: &mut StaleResources,
    ) -> RenderResult<()> {
        if !flags.contains(RecreateFlags::RECREATE) || !self.built {
            return Ok(());
        }

        for index in 0..self.arena.len() {
            if self.arena[index].ty == PassType::Render {
                match self.arena[index].rebuild(device, backing, cache, flags, stale) {
                    Err(RenderError::Skip(_)) => {}
                    other => other?,
                }
            }
        }

        Ok(())
    }

    /// Tears down everything derived.
    pub(crate) fn destruct(&mut self, stale: &mut StaleResources) {
        for pass in &mut self.arena {
            pass.destruct(stale);
        }
        self.built = false;
    }
}

/// Emits the barrier a consumption needs against its predecessor into the
/// injection buffer.
///
/// Without a prior write and without a layout transition this is an
/// execution barrier; otherwise a full image memory barrier whose
/// subresource range is the union of both consumptions' ranges.
pub(crate) fn push_consume_barrier(
    graph: &Graph,
    backing: &Backing,
    pass_index: usize,
    consume_index: usize,
    swapchain_image: Option<u32>,
    injection: &mut Injection,
) {
    let consume: &Consume = &graph.arena[pass_index].consumes[consume_index];
    let Some((prev_pass, prev_consume)) = consume.out_prev else {
        return;
    };
    let prev: &Consume = &graph.arena[prev_pass].consumes[prev_consume];

    let attach = match backing.get(consume.index) {
        Some(attach) => attach,
        None => return,
    };

    // Windows use an empty format, yielding color (non-depth/stencil)
    // access flags and stages, which is what a swapchain image wants.
    let format = match attach {
        Attach::Image(image) => image.description.format,
        _ => vk::Format::UNDEFINED,
    };

    let src_stage = vk_pipeline_stage(prev.mask, prev.stage, format);
    let dst_stage = vk_pipeline_stage(consume.mask, consume.stage, format);

    let transition = prev.out_final != consume.out_initial;
    if !prev.mask.writes() && !transition {
        injection.push_execution_barrier(src_stage, dst_stage);
        return;
    }

    let image = match attach {
        Attach::Image(image) => image.raw(),
        Attach::Window(window) => {
            // Silently ignore a non-existent swapchain image.
            let Some(image) = swapchain_image.and_then(|index| window.window.image(index)) else {
                return;
            };
            image
        }
        Attach::Empty => return,
    };

    let aspect = (prev.range.aspect | consume.range.aspect) & format_aspect(format);
    let aspect = if aspect.is_empty() {
        format_aspect(format)
    } else {
        aspect
    };

    let base_mip = prev.range.mipmap.min(consume.range.mipmap);
    let base_layer = prev.range.layer.min(consume.range.layer);

    // Assume overlap and merge the two ranges.
    let level_count = if prev.range.num_mipmaps == 0 || consume.range.num_mipmaps == 0 {
        vk::REMAINING_MIP_LEVELS
    } else {
        (prev.range.num_mipmaps + (prev.range.mipmap - base_mip))
            .max(consume.range.num_mipmaps + (consume.range.mipmap - base_mip))
    };
    let layer_count = if prev.range.num_layers == 0 || consume.range.num_layers == 0 {
        vk::REMAINING_ARRAY_LAYERS
    } else {
        (prev.range.num_layers + (prev.range.layer - base_layer))
            .max(consume.range.num_layers + (consume.range.layer - base_layer))
    };

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk_access_flags(prev.mask, format))
        .dst_access_mask(vk_access_flags(consume.mask, format))
        .old_layout(prev.out_final)
        .new_layout(consume.out_initial)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect.to_vk(),
            base_mip_level: base_mip,
            level_count,
            base_array_layer: base_layer,
            layer_count,
        });

    injection.push_image_barrier(src_stage, dst_stage, barrier);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMask, StageMask};

    fn graph_with(passes: &[(PassType, &[usize])]) -> (Graph, Vec<PassId>) {
        let mut graph = Graph::default();
        let mut ids = Vec::new();
        for (ty, parents) in passes {
            let parents: Vec<PassId> = parents.iter().map(|&index| ids[index]).collect();
            ids.push(graph.add_pass(*ty, &parents).unwrap());
        }
        (graph, ids)
    }

    #[test]
    fn levels_are_one_past_the_deepest_parent() {
        let (graph, ids) = graph_with(&[
            (PassType::Render, &[]),
            (PassType::Render, &[0]),
            (PassType::Render, &[0, 1]),
            (PassType::Render, &[0]),
        ]);

        assert_eq!(graph.pass(ids[0]).unwrap().level(), 0);
        assert_eq!(graph.pass(ids[1]).unwrap().level(), 1);
        assert_eq!(graph.pass(ids[2]).unwrap().level(), 2);
        assert_eq!(graph.pass(ids[3]).unwrap().level(), 1);
    }

    #[test]
    fn order_is_level_sorted_and_stable() {
        let (graph, _) = graph_with(&[
            (PassType::Render, &[]),     // level 0
            (PassType::Render, &[0]),    // level 1
            (PassType::Render, &[]),     // level 0, added later
            (PassType::Render, &[2]),    // level 1, added later
        ]);

        // Within a level, insertion order is preserved.
        assert_eq!(graph.order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn compute_async_is_partitioned_after_render() {
        let (graph, _) = graph_with(&[
            (PassType::ComputeAsync, &[]),
            (PassType::Render, &[]),
            (PassType::ComputeAsync, &[0]),
            (PassType::Render, &[1]),
        ]);

        assert_eq!(graph.num_render, 2);
        assert_eq!(graph.order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn mixing_partitions_in_the_dag_is_rejected() {
        let mut graph = Graph::default();
        let render = graph.add_pass(PassType::Render, &[]).unwrap();
        let result = graph.add_pass(PassType::ComputeAsync, &[render]);
        assert!(matches!(result, Err(RenderError::GraphInvalid(_))));
    }

    #[test]
    fn missing_parent_is_rejected() {
        let mut graph = Graph::default();
        let result = graph.add_pass(PassType::Render, &[PassId(7)]);
        assert!(matches!(result, Err(RenderError::GraphInvalid(_))));
    }

    #[test]
    fn targets_track_childless_passes() {
        let mut graph = Graph::default();
        let a = graph.add_pass(PassType::Render, &[]).unwrap();
        let b = graph.add_pass(PassType::Render, &[]).unwrap();
        assert_eq!(graph.num_targets(), 2);

        let c = graph.add_pass(PassType::Render, &[a, b]).unwrap();
        assert_eq!(graph.num_targets(), 1);
        assert_eq!(graph.target(0), Some(c));
    }

    fn consume(graph: &mut Graph, id: PassId, index: usize, mask: AccessMask) {
        graph
            .pass_mut(id)
            .unwrap()
            .consume(index, mask, StageMask::FRAGMENT, None, None);
    }

    #[test]
    fn analysis_links_predecessors_and_layouts() {
        let (mut graph, ids) = graph_with(&[
            (PassType::Render, &[]),
            (PassType::Render, &[0]),
        ]);
        consume(&mut graph, ids[0], 0, AccessMask::ATTACHMENT_WRITE);
        consume(&mut graph, ids[1], 0, AccessMask::SAMPLED_READ);

        graph.analyze(&|index| {
            (index == 0).then_some(AttachInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                window: false,
            })
        });

        let first = &graph.arena[ids[0].0].consumes[0];
        assert_eq!(first.out_prev, None);
        assert_eq!(first.out_initial, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.out_final, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let second = &graph.arena[ids[1].0].consumes[0];
        assert_eq!(second.out_prev, Some((ids[0].0, 0)));
        assert_eq!(second.out_initial, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(second.out_final, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn last_window_consumption_presents() {
        let (mut graph, ids) = graph_with(&[
            (PassType::Render, &[]),
            (PassType::Render, &[0]),
        ]);
        consume(&mut graph, ids[0], 0, AccessMask::ATTACHMENT_WRITE);
        consume(&mut graph, ids[1], 0, AccessMask::ATTACHMENT_WRITE);

        graph.analyze(&|_| {
            Some(AttachInfo {
                format: vk::Format::B8G8R8A8_UNORM,
                window: true,
            })
        });

        let first = &graph.arena[ids[0].0].consumes[0];
        let second = &graph.arena[ids[1].0].consumes[0];
        assert_eq!(first.out_final, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(second.out_final, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn predecessors_do_not_cross_the_queue_boundary() {
        let (mut graph, ids) = graph_with(&[
            (PassType::Render, &[]),
            (PassType::ComputeAsync, &[]),
        ]);
        consume(&mut graph, ids[0], 0, AccessMask::ATTACHMENT_WRITE);
        consume(
            &mut graph,
            ids[1],
            0,
            AccessMask::STORAGE_READ | AccessMask::COMPUTE_ASYNC,
        );

        graph.analyze(&|_| {
            Some(AttachInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                window: false,
            })
        });

        // The compute consumption is first in its own partition.
        let compute = &graph.arena[ids[1].0].consumes[0];
        assert_eq!(compute.out_prev, None);
    }
}
