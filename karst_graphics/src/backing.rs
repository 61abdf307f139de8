//! Renderer-owned attachment backing.
//!
//! Attachments live in a sparse vector indexed by the user; a slot is
//! empty, an image described by an [`AttachmentDescription`], or a window.
//! Image attachments are built lazily before recording; sizes may be
//! relative to another attachment (windows included), so a window resize
//! rebuilds every size-dependent image.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::{
    types::{format_aspect, AttachmentDescription, AttachmentSize, RecreateFlags},
    vulkan::{swapchain::Window, DeviceShared},
    RenderError, RenderResult,
};

pub(crate) struct BackingImage {
    raw: vk::Image,
    allocation: Option<Allocation>,
}

pub(crate) struct ImageAttach {
    pub(crate) description: AttachmentDescription,

    // Resolved dimensions, zero until built.
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,

    image: Option<BackingImage>,
}

impl ImageAttach {
    pub(crate) fn raw(&self) -> vk::Image {
        self.image
            .as_ref()
            .map_or(vk::Image::null(), |image| image.raw)
    }

    fn is_built(&self) -> bool {
        self.image.is_some()
    }
}

pub(crate) struct WindowAttach {
    pub(crate) window: Arc<Window>,
    /// Recreate flags reported by the last present, consumed by the next
    /// acquire.
    pub(crate) pending: RecreateFlags,
}

pub(crate) enum Attach {
    Empty,
    Image(ImageAttach),
    Window(WindowAttach),
}

#[derive(Default)]
pub(crate) struct Backing {
    attachs: Vec<Attach>,
}

impl Backing {
    pub(crate) fn get(&self, index: usize) -> Option<&Attach> {
        self.attachs.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Attach> {
        self.attachs.get_mut(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.attachs.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Attach)> {
        self.attachs.iter().enumerate()
    }

    pub(crate) fn window_count(&self) -> usize {
        self.attachs
            .iter()
            .filter(|attach| matches!(attach, Attach::Window(_)))
            .count()
    }

    fn slot(&mut self, index: usize) -> &mut Attach {
        if index >= self.attachs.len() {
            self.attachs.resize_with(index + 1, || Attach::Empty);
        }
        &mut self.attachs[index]
    }

    /// Describes an image attachment. Returns whether an existing, possibly
    /// referenced attachment was replaced (the caller must have stalled).
    pub(crate) fn describe(
        &mut self,
        device: &Arc<DeviceShared>,
        index: usize,
        description: AttachmentDescription,
    ) -> bool {
        let slot = self.slot(index);

        let replaced = match slot {
            Attach::Image(existing) => {
                if existing.description == description {
                    return false;
                }
                if let Some(image) = existing.image.take() {
                    destroy_image(device, image);
                }
                true
            }
            Attach::Window(_) => true,
            Attach::Empty => false,
        };

        *slot = Attach::Image(ImageAttach {
            description,
            width: 0,
            height: 0,
            depth: 0,
            image: None,
        });

        replaced
    }

    pub(crate) fn attach_window(&mut self, index: usize, window: Arc<Window>) -> bool {
        let slot = self.slot(index);
        let replaced = !matches!(slot, Attach::Empty);

        *slot = Attach::Window(WindowAttach {
            window,
            pending: RecreateFlags::empty(),
        });

        replaced
    }

    /// Empties a slot; returns the detached state for the caller to unwind.
    pub(crate) fn detach(&mut self, device: &Arc<DeviceShared>, index: usize) -> Option<Attach> {
        if index >= self.attachs.len() {
            return None;
        }

        let attach = std::mem::replace(&mut self.attachs[index], Attach::Empty);
        match attach {
            Attach::Image(mut image) => {
                if let Some(built) = image.image.take() {
                    destroy_image(device, built);
                }
                Some(Attach::Image(image))
            }
            Attach::Empty => None,
            other => Some(other),
        }
    }

    /// The size an attachment resolves to right now.
    fn resolve_size(&self, description: &AttachmentDescription) -> (u32, u32, u32) {
        match description.size {
            AttachmentSize::Absolute {
                width,
                height,
                depth,
            } => (width, height, depth),

            AttachmentSize::Relative { reference, x, y, z } => match self.attachs.get(reference) {
                Some(Attach::Window(window)) => {
                    let extent = window.window.extent();
                    (
                        scale(extent.width, x),
                        scale(extent.height, y),
                        scale(1, z),
                    )
                }
                Some(Attach::Image(image)) => (
                    scale(image.width, x),
                    scale(image.height, y),
                    scale(image.depth, z),
                ),
                _ => (0, 0, 0),
            },
        }
    }

    /// Builds every described-but-unbuilt image attachment. No-op when
    /// everything is already built.
    pub(crate) fn build(&mut self, device: &Arc<DeviceShared>) -> RenderResult<()> {
        for index in 0..self.attachs.len() {
            let Attach::Image(image) = &self.attachs[index] else {
                continue;
            };
            if image.is_built() {
                continue;
            }

            let (width, height, depth) = self.resolve_size(&image.description);
            if width == 0 || height == 0 || depth == 0 {
                // Possibly a minimized reference window; built next frame.
                log::debug!(
                    "Attachment at index {} resolves to zero size, not built.",
                    index
                );
                continue;
            }

            let description = image.description.clone();
            let built = create_image(device, &description, width, height, depth)?;

            if let Attach::Image(image) = &mut self.attachs[index] {
                image.width = width;
                image.height = height;
                image.depth = depth;
                image.image = Some(built);
            }
        }

        Ok(())
    }

    /// Destroys whatever the recreate flags invalidate so the next build
    /// recreates it: a resize un-builds every relatively sized attachment.
    pub(crate) fn rebuild(&mut self, device: &Arc<DeviceShared>, flags: RecreateFlags) {
        if !flags.contains(RecreateFlags::RESIZE) {
            return;
        }

        for attach in &mut self.attachs {
            let Attach::Image(image) = attach else {
                continue;
            };
            if matches!(image.description.size, AttachmentSize::Relative { .. }) {
                if let Some(built) = image.image.take() {
                    destroy_image(device, built);
                }
                image.width = 0;
                image.height = 0;
                image.depth = 0;
            }
        }
    }

    /// Destroys all built images; descriptions stay.
    pub(crate) fn clear(&mut self, device: &Arc<DeviceShared>) {
        for attach in &mut self.attachs {
            if let Attach::Image(image) = attach {
                if let Some(built) = image.image.take() {
                    destroy_image(device, built);
                }
                image.width = 0;
                image.height = 0;
                image.depth = 0;
            }
        }
    }
}

fn scale(base: u32, factor: f32) -> u32 {
    ((base as f32 * factor) as u32).max(1)
}

fn create_image(
    device: &Arc<DeviceShared>,
    description: &AttachmentDescription,
    width: u32,
    height: u32,
    depth: u32,
) -> RenderResult<BackingImage> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(description.image_type)
        .format(description.format)
        .extent(vk::Extent3D {
            width,
            height,
            depth,
        })
        .mip_levels(description.mip_levels)
        .array_layers(description.layers)
        .samples(description.samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(description.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let raw = unsafe { device.raw.create_image(&create_info, None)? };
    let requirements = unsafe { device.raw.get_image_memory_requirements(raw) };

    let allocation = device
        .allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name: "attachment",
            requirements,
            location: description.memory,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|error| {
            log::error!("Could not allocate attachment memory: {}", error);
            unsafe {
                device.raw.destroy_image(raw, None);
            }
            RenderError::OutOfMemory
        })?;

    unsafe {
        device
            .raw
            .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
    }

    // The aspect is only sanity-checked here; views are made per pass.
    debug_assert!(!format_aspect(description.format).is_empty());

    Ok(BackingImage {
        raw,
        allocation: Some(allocation),
    })
}

fn destroy_image(device: &Arc<DeviceShared>, mut image: BackingImage) {
    unsafe {
        device.raw.destroy_image(image.raw, None);
    }
    if let Some(allocation) = image.allocation.take() {
        if let Err(error) = device.allocator.lock().free(allocation) {
            log::error!("Could not free attachment memory: {}", error);
        }
    }
}
