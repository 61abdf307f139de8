//! Instance, device and queue plumbing.
//!
//! One [`DeviceShared`] backs a renderer and everything it owns. Queues are
//! wrapped with their own submit lock so presentation and submission from
//! different renderers on the same device serialize correctly.

use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::atomic::{AtomicU32, Ordering},
    sync::Arc,
};

use anyhow::Result;
use ash::{ext::debug_utils, vk};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

pub mod swapchain;

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new(display_handle: RawDisplayHandle) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("karst").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_2);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        extension_names.push(debug_utils::NAME.as_ptr());

        let layer_strings = vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()];
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }

    fn get_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|phys_device| PhysicalDevice::new_from_vulkan_handle(&self.raw, phys_device))
            .collect::<Result<_>>()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

#[derive(Debug, Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    queue_families: Vec<QueueFamily>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(instance: &ash::Instance, raw: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("unknown")
                .to_owned()
        };
        let device_type = properties.device_type;

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, prop)| QueueFamily::new(index as _, prop))
            .collect();

        Ok(Self {
            raw,
            name,
            device_type,
            properties,
            queue_families,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    fn new(index: u32, properties: vk::QueueFamilyProperties) -> Self {
        Self { index, properties }
    }

    fn supports_graphics(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
    }

    fn supports_compute(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE)
    }
}

/// Prefers the first discrete GPU, falls back to whatever enumerates first.
fn select_physical_device(devices: &[PhysicalDevice]) -> Result<PhysicalDevice> {
    let device = devices
        .iter()
        .find(|device| device.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| devices.first())
        .ok_or_else(|| anyhow::anyhow!("No Vulkan physical device found!"))?;

    Ok(device.clone())
}

/// Selects a graphics family and a compute family, preferring a dedicated
/// compute family for asynchronous compute submission.
fn select_queue_families(device: &PhysicalDevice) -> Result<(QueueFamily, QueueFamily)> {
    let graphics = device
        .queue_families
        .iter()
        .find(|family| family.supports_graphics())
        .ok_or_else(|| anyhow::anyhow!("No graphics queue family found!"))?;

    let compute = device
        .queue_families
        .iter()
        .find(|family| family.supports_compute() && family.index != graphics.index)
        .or_else(|| {
            device
                .queue_families
                .iter()
                .find(|family| family.supports_compute())
        })
        .ok_or_else(|| anyhow::anyhow!("No compute queue family found!"))?;

    Ok((*graphics, *compute))
}

/// Logical device and everything shared by a renderer's descendants.
///
/// Should be used/passed around behind an `Arc`; members are internally
/// mutable as required.
pub struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,

    pub(crate) graphics: Queue,
    pub(crate) compute: Queue,

    // Vulkan bounds the number of live sampler allocations device-wide; the
    // lock makes two racing allocations both observe the final slot.
    sampler_lock: Mutex<()>,
    sampler_count: AtomicU32,
    max_samplers: u32,

    pub(crate) physical_device: PhysicalDevice,
    pub(crate) instance: Instance,
}

impl DeviceShared {
    pub fn new(display_handle: RawDisplayHandle) -> Result<Arc<Self>> {
        let instance = Instance::new(display_handle)?;
        let physical_devices = instance.get_physical_devices()?;
        let physical_device = select_physical_device(&physical_devices)?;
        let (graphics_family, compute_family) = select_queue_families(&physical_device)?;

        log::info!("Physical device name: {}", physical_device.name);

        let raw = Self::new_ash_device(&instance, &physical_device, graphics_family, compute_family)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;

        let graphics = Queue::new_from_vulkan_handle(
            raw.clone(),
            unsafe { raw.get_device_queue(graphics_family.index, 0) },
            graphics_family.index,
        );
        let compute = Queue::new_from_vulkan_handle(
            raw.clone(),
            unsafe { raw.get_device_queue(compute_family.index, 0) },
            compute_family.index,
        );

        let max_samplers = physical_device.properties.limits.max_sampler_allocation_count;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            raw,
            graphics,
            compute,
            sampler_lock: Mutex::new(()),
            sampler_count: AtomicU32::new(0),
            max_samplers,
            physical_device,
            instance,
        }))
    }

    fn new_ash_device(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        graphics_family: QueueFamily,
        compute_family: QueueFamily,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];

        let queue_create_infos = {
            let mut indices = vec![graphics_family.index, compute_family.index];
            indices.sort();
            indices.dedup();

            indices
                .iter()
                .map(|index| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(*index)
                        .queue_priorities(&queue_priorities)
                })
                .collect::<Vec<_>>()
        };

        let device_extension_strs = ["VK_KHR_swapchain"];
        let device_extension_strs = device_extension_strs
            .iter()
            .map(|str| CString::new(*str))
            .collect::<Result<Vec<_>, _>>()?;
        let device_extension_strs = device_extension_strs
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<_>>();

        let mut device_features2 = vk::PhysicalDeviceFeatures2::default();
        unsafe {
            instance
                .raw
                .get_physical_device_features2(physical_device.raw, &mut device_features2);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extension_strs)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)?
        };

        Ok(device)
    }

    /// Claims one slot of the device-wide sampler allocation limit.
    /// Returns false once the limit is reached; the claim must be released
    /// with [`Self::release_sampler_slot`] when the sampler is destroyed.
    pub(crate) fn claim_sampler_slot(&self) -> bool {
        let _guard = self.sampler_lock.lock();

        if self.sampler_count.load(Ordering::Relaxed) >= self.max_samplers {
            log::error!(
                "Cannot allocate sampler because physical device limit of {} \
                 sampler allocations has been reached.",
                self.max_samplers
            );
            return false;
        }

        self.sampler_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn release_sampler_slot(&self) {
        self.sampler_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn wait_idle(&self) {
        unsafe {
            if let Err(result) = self.raw.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed: {}", result);
            }
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::trace!("Logical device dropped");
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

/// A device queue plus the lock serializing submission on it.
pub(crate) struct Queue {
    /// Handy for queue submission.
    ash_device: ash::Device,
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
    pub(crate) lock: Mutex<()>,
}

impl Queue {
    fn new_from_vulkan_handle(ash_device: ash::Device, raw: vk::Queue, family_index: u32) -> Self {
        Self {
            ash_device,
            raw,
            family_index,
            lock: Mutex::new(()),
        }
    }

    /// Locks the queue and submits, signaling `fence` on completion.
    pub(crate) fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        debug_assert_eq!(wait_semaphores.len(), wait_stages.len());

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);

        let _guard = self.lock.lock();
        unsafe {
            self.ash_device
                .queue_submit(self.raw, std::slice::from_ref(&submit_info), fence)
        }
    }

    pub(crate) fn wait_idle(&self) {
        let _guard = self.lock.lock();
        unsafe {
            if let Err(result) = self.ash_device.queue_wait_idle(self.raw) {
                log::error!("vkQueueWaitIdle failed: {}", result);
            }
        }
    }
}

/// Binary semaphore owned by a frame or window sync object.
pub(crate) struct Semaphore {
    device: Arc<DeviceShared>,
    pub(crate) raw: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Result<Self, vk::Result> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe { device.raw.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, raw })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_semaphore(self.raw, None);
        }
    }
}

/// Unsignaled fence for host synchronization.
pub(crate) struct Fence {
    device: Arc<DeviceShared>,
    pub(crate) raw: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Result<Self, vk::Result> {
        let fence_info = vk::FenceCreateInfo::default();
        let raw = unsafe { device.raw.create_fence(&fence_info, None)? };

        Ok(Self { device, raw })
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_fence(self.raw, None);
        }
    }
}
