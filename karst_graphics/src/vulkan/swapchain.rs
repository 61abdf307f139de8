//! Window surfaces and their swapchains.
//!
//! A [`Window`] is the presentable attachment backing: it owns the surface,
//! the swapchain and its images, and reports per-operation
//! [`RecreateFlags`] so the renderer can rebuild derived resources. Retired
//! swapchains are kept on a stale list until the renderer has synchronized
//! all in-flight frames and calls [`Window::purge_stale`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use ash::{
    khr,
    vk::{self, Handle},
};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::types::RecreateFlags;

use super::{DeviceShared, Queue};

pub(crate) struct Surface {
    pub(crate) raw_ash: khr::surface::Instance,
    pub(crate) raw_vulkan: vk::SurfaceKHR,
}

impl Surface {
    fn new(
        device: &DeviceShared,
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
    ) -> Result<Self> {
        let raw_ash =
            khr::surface::Instance::new(&device.instance.entry, &device.instance.raw);
        let raw_vulkan = unsafe {
            ash_window::create_surface(
                &device.instance.entry,
                &device.instance.raw,
                display_handle,
                window_handle,
                None,
            )?
        };

        Ok(Self {
            raw_ash,
            raw_vulkan,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.raw_ash.destroy_surface(self.raw_vulkan, None);
        }
    }
}

struct SwapchainState {
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,

    /// Set by a suboptimal/out-of-date present; the next acquire recreates.
    recreate_pending: bool,

    /// Retired swapchain handles, possibly still read by in-flight frames.
    stale: Vec<vk::SwapchainKHR>,
}

/// A presentable window attachment backing.
///
/// Thread-safe; the attach lock makes sure a window is consumed by at most
/// one renderer attachment at a time.
pub struct Window {
    device: Arc<DeviceShared>,
    surface: Surface,
    swapchain_fns: khr::swapchain::Device,
    attached: AtomicBool,
    state: Mutex<SwapchainState>,
}

impl Window {
    pub fn new(
        device: Arc<DeviceShared>,
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
    ) -> Result<Arc<Self>> {
        let surface = Surface::new(&device, window_handle, display_handle)?;

        let supported = unsafe {
            surface.raw_ash.get_physical_device_surface_support(
                device.physical_device.raw,
                device.graphics.family_index,
                surface.raw_vulkan,
            )?
        };
        if !supported {
            return Err(anyhow::anyhow!(
                "Graphics queue family cannot present to this surface!"
            ));
        }

        let swapchain_fns = khr::swapchain::Device::new(&device.instance.raw, &device.raw);
        let state = Self::create_swapchain(&device, &surface, &swapchain_fns, vk::SwapchainKHR::null())?;

        Ok(Arc::new(Self {
            device,
            surface,
            swapchain_fns,
            attached: AtomicBool::new(false),
            state: Mutex::new(state),
        }))
    }

    fn create_swapchain(
        device: &DeviceShared,
        surface: &Surface,
        swapchain_fns: &khr::swapchain::Device,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainState, vk::Result> {
        let format = {
            let formats = unsafe {
                surface
                    .raw_ash
                    .get_physical_device_surface_formats(
                        device.physical_device.raw,
                        surface.raw_vulkan,
                    )?
            };

            *formats
                .iter()
                .find(|format| {
                    format.format == vk::Format::B8G8R8A8_UNORM
                        && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(&formats[0])
        };

        let capabilities = unsafe {
            surface.raw_ash.get_physical_device_surface_capabilities(
                device.physical_device.raw,
                surface.raw_vulkan,
            )?
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            capabilities.max_image_extent
        };

        let image_count = if capabilities.max_image_count == 0 {
            capabilities.min_image_count + 1
        } else {
            capabilities
                .max_image_count
                .min(capabilities.min_image_count + 1)
        };

        log::debug!("Swapchain extent: {} X {}", extent.width, extent.height);

        // A minimized window reports a zero extent; no legal swapchain can
        // be made for it, passes will skip until it is restored.
        if extent.width == 0 || extent.height == 0 {
            return Ok(SwapchainState {
                raw: old_swapchain,
                images: Vec::new(),
                format,
                extent,
                recreate_pending: true,
                stale: Vec::new(),
            });
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_vulkan)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .old_swapchain(old_swapchain);

        let raw = unsafe { swapchain_fns.create_swapchain(&create_info, None)? };
        let images = unsafe { swapchain_fns.get_swapchain_images(raw)? };

        Ok(SwapchainState {
            raw,
            images,
            format,
            extent,
            recreate_pending: false,
            stale: Vec::new(),
        })
    }

    /// Recreates the swapchain in place and reports what changed.
    fn recreate(&self, state: &mut SwapchainState) -> Result<RecreateFlags, vk::Result> {
        log::debug!("Recreating swapchain...");

        let old_format = state.format.format;
        let old_extent = state.extent;
        let old_raw = state.raw;

        let mut new_state =
            Self::create_swapchain(&self.device, &self.surface, &self.swapchain_fns, old_raw)?;

        let mut flags = RecreateFlags::RECREATE;
        if new_state.extent != old_extent {
            flags |= RecreateFlags::RESIZE;
        }
        if new_state.format.format != old_format {
            flags |= RecreateFlags::REFORMAT;
        }

        // The old swapchain was only retired if a new one was made.
        if new_state.raw != old_raw {
            new_state.stale = std::mem::take(&mut state.stale);
            new_state.stale.push(old_raw);
        } else {
            new_state.stale = std::mem::take(&mut state.stale);
        }

        *state = new_state;

        log::debug!("Done recreating swapchain.");
        Ok(flags)
    }

    /// Acquires the next image, recreating the swapchain beforehand when a
    /// previous operation flagged it. Returns no index when the window is
    /// currently unpresentable (e.g. minimized).
    pub(crate) fn acquire(
        &self,
        available: vk::Semaphore,
    ) -> Result<(Option<u32>, RecreateFlags), vk::Result> {
        let mut state = self.state.lock();
        let mut flags = RecreateFlags::empty();

        if state.recreate_pending {
            flags |= self.recreate(&mut state)?;
        }

        if state.images.is_empty() {
            return Ok((None, flags));
        }

        for _ in 0..2 {
            let acquired = unsafe {
                self.swapchain_fns.acquire_next_image(
                    state.raw,
                    u64::MAX,
                    available,
                    vk::Fence::null(),
                )
            };

            match acquired {
                Ok((index, false)) => return Ok((Some(index), flags)),
                Ok((index, true)) => {
                    // Suboptimal still acquired the image; present will
                    // flag the actual recreate.
                    state.recreate_pending = true;
                    return Ok((Some(index), flags | RecreateFlags::RECREATE));
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    flags |= self.recreate(&mut state)?;
                    if state.images.is_empty() {
                        return Ok((None, flags));
                    }
                }
                Err(result) => return Err(result),
            }
        }

        log::warn!("Swapchain image acquisition kept returning out-of-date.");
        Ok((None, flags))
    }

    /// Destroys retired swapchains. Only call after all frames that might
    /// still reference their images have been synchronized.
    pub(crate) fn purge_stale(&self) {
        let mut state = self.state.lock();
        for stale in state.stale.drain(..) {
            unsafe {
                self.swapchain_fns.destroy_swapchain(stale, None);
            }
        }
    }

    /// Claims the window for one renderer attachment.
    pub(crate) fn try_lock(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub(crate) fn format(&self) -> vk::Format {
        self.state.lock().format.format
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.state.lock().extent
    }

    pub(crate) fn images(&self) -> Vec<vk::Image> {
        self.state.lock().images.clone()
    }

    pub(crate) fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub(crate) fn image(&self, index: u32) -> Option<vk::Image> {
        self.state.lock().images.get(index as usize).copied()
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        unsafe {
            for stale in state.stale.drain(..) {
                self.swapchain_fns.destroy_swapchain(stale, None);
            }
            if !state.raw.is_null() {
                self.swapchain_fns.destroy_swapchain(state.raw, None);
            }
        }
    }
}

/// Presents a batch of windows in one call, as synchronized as possible.
/// Returns the per-window recreate flags observed by presentation.
pub(crate) fn present_windows(
    queue: &Queue,
    wait_semaphores: &[vk::Semaphore],
    windows: &[Arc<Window>],
    image_indices: &[u32],
) -> Vec<RecreateFlags> {
    debug_assert_eq!(windows.len(), image_indices.len());
    if windows.is_empty() {
        return Vec::new();
    }

    // Hold every window's state lock for the duration of the present so no
    // concurrent recreate swaps a handle out from under us.
    let states: Vec<_> = windows.iter().map(|window| window.state.lock()).collect();
    let swapchains: Vec<vk::SwapchainKHR> = states.iter().map(|state| state.raw).collect();

    let mut results = vec![vk::Result::SUCCESS; windows.len()];
    let present_info = vk::PresentInfoKHR::default()
        .wait_semaphores(wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(image_indices)
        .results(&mut results);

    let per_window = {
        let _guard = queue.lock.lock();
        unsafe { windows[0].swapchain_fns.queue_present(queue.raw, &present_info) }
    };

    drop(states);

    // The aggregate error is already reflected in the per-window results.
    if let Err(result) = per_window {
        if result != vk::Result::ERROR_OUT_OF_DATE_KHR {
            log::error!("vkQueuePresentKHR failed: {}", result);
        }
    }

    results
        .into_iter()
        .zip(windows)
        .map(|(result, window)| match result {
            vk::Result::SUCCESS => RecreateFlags::empty(),
            vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => {
                window.state.lock().recreate_pending = true;
                RecreateFlags::RECREATE | RecreateFlags::RESIZE
            }
            other => {
                log::error!("Window presentation failed: {}", other);
                RecreateFlags::empty()
            }
        })
        .collect()
}
