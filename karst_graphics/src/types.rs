//! Plain data types shared across the renderer surface.

use ash::vk;
use bitflags::bitflags;
use gpu_allocator::MemoryLocation;

bitflags! {
    /// How a pass or dependency accesses a resource.
    ///
    /// `COMPUTE_ASYNC` and `TRANSFER_ASYNC` are modifiers, meaningless
    /// without other flags. `DISCARD` marks contents that need not survive
    /// the access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessMask: u32 {
        const VERTEX_READ        = 0x000001;
        const INDEX_READ         = 0x000002;
        const UNIFORM_READ       = 0x000004;
        const INDIRECT_READ      = 0x000008;
        const SAMPLED_READ       = 0x000010;
        const STORAGE_READ       = 0x000020;
        const STORAGE_WRITE      = 0x000040;
        const ATTACHMENT_INPUT   = 0x000080;
        const ATTACHMENT_READ    = 0x000100;
        const ATTACHMENT_WRITE   = 0x000200;
        const ATTACHMENT_RESOLVE = 0x000400;
        const TRANSFER_READ      = 0x000800;
        const TRANSFER_WRITE     = 0x001000;
        const HOST_READ          = 0x002000;
        const HOST_WRITE         = 0x004000;

        // Modifiers.
        const COMPUTE_ASYNC  = 0x008000;
        const TRANSFER_ASYNC = 0x010000;
        const DISCARD        = 0x020000;
    }
}

impl AccessMask {
    /// Any flag that makes the access a write.
    pub fn writes(self) -> bool {
        self.intersects(
            Self::STORAGE_WRITE
                | Self::ATTACHMENT_WRITE
                | Self::ATTACHMENT_RESOLVE
                | Self::TRANSFER_WRITE
                | Self::HOST_WRITE,
        )
    }

    /// Flags that reference an attachment of a render pass.
    pub fn as_attachment(self) -> bool {
        self.intersects(
            Self::ATTACHMENT_INPUT
                | Self::ATTACHMENT_READ
                | Self::ATTACHMENT_WRITE
                | Self::ATTACHMENT_RESOLVE,
        )
    }

    /// The async-modifier bits, which must agree between a signal and a
    /// wait for them to match.
    pub fn modifiers(self) -> AccessMask {
        self & (Self::COMPUTE_ASYNC | Self::TRANSFER_ASYNC)
    }
}

bitflags! {
    /// Shader stages that have access to a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StageMask: u32 {
        const VERTEX          = 0x01;
        const TESS_CONTROL    = 0x02;
        const TESS_EVALUATION = 0x04;
        const GEOMETRY        = 0x08;
        const FRAGMENT        = 0x10;
        const COMPUTE         = 0x20;
    }
}

bitflags! {
    /// Aspects of an image addressed by a range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageAspect: u32 {
        const COLOR   = 0x1;
        const DEPTH   = 0x2;
        const STENCIL = 0x4;
    }
}

impl ImageAspect {
    pub fn to_vk(self) -> vk::ImageAspectFlags {
        let mut flags = vk::ImageAspectFlags::empty();
        if self.contains(Self::COLOR) {
            flags |= vk::ImageAspectFlags::COLOR;
        }
        if self.contains(Self::DEPTH) {
            flags |= vk::ImageAspectFlags::DEPTH;
        }
        if self.contains(Self::STENCIL) {
            flags |= vk::ImageAspectFlags::STENCIL;
        }
        flags
    }
}

bitflags! {
    /// What changed when swapchain-dependent resources go stale.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecreateFlags: u32 {
        /// Resources were recreated and derived objects must be rebuilt.
        const RECREATE = 0x1;
        /// Dimensions changed.
        const RESIZE   = 0x2;
        /// The image format changed.
        const REFORMAT = 0x4;
    }
}

impl RecreateFlags {
    pub const ALL: RecreateFlags = RecreateFlags::all();
}

/// A mip/layer window into an image. Zero counts select everything from the
/// base offset onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub aspect: ImageAspect,
    pub mipmap: u32,
    pub num_mipmaps: u32,
    pub layer: u32,
    pub num_layers: u32,
}

impl Range {
    /// The whole resource, all aspects.
    pub fn whole() -> Self {
        Self {
            aspect: ImageAspect::COLOR | ImageAspect::DEPTH | ImageAspect::STENCIL,
            mipmap: 0,
            num_mipmaps: 0,
            layer: 0,
            num_layers: 0,
        }
    }

    pub fn is_whole(&self) -> bool {
        self.mipmap == 0 && self.num_mipmaps == 0 && self.layer == 0 && self.num_layers == 0
    }

    /// Whether two ranges can touch the same subresource. Zero counts are
    /// unbounded windows.
    pub fn overlaps(&self, other: &Range) -> bool {
        let axis = |base_a: u32, n_a: u32, base_b: u32, n_b: u32| {
            let end_a = if n_a == 0 { u32::MAX } else { base_a + n_a };
            let end_b = if n_b == 0 { u32::MAX } else { base_b + n_b };
            base_a < end_b && base_b < end_a
        };
        axis(self.mipmap, self.num_mipmaps, other.mipmap, other.num_mipmaps)
            && axis(self.layer, self.num_layers, other.layer, other.num_layers)
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::whole()
    }
}

/// Interpreted dimensionality of an image view override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    D1,
    D1Array,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

impl ViewType {
    pub fn to_vk(self) -> vk::ImageViewType {
        match self {
            Self::D1 => vk::ImageViewType::TYPE_1D,
            Self::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
            Self::D2 => vk::ImageViewType::TYPE_2D,
            Self::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
            Self::Cube => vk::ImageViewType::CUBE,
            Self::CubeArray => vk::ImageViewType::CUBE_ARRAY,
            Self::D3 => vk::ImageViewType::TYPE_3D,
        }
    }
}

/// Size of an image attachment: absolute texels, or scale factors of
/// another attachment's size (windows included).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttachmentSize {
    Absolute { width: u32, height: u32, depth: u32 },
    Relative { reference: usize, x: f32, y: f32, z: f32 },
}

/// Description of an image attachment of a renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentDescription {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub layers: u32,
    pub mip_levels: u32,
    pub memory: MemoryLocation,
    pub size: AttachmentSize,
}

impl AttachmentDescription {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            samples: vk::SampleCountFlags::TYPE_1,
            layers: 1,
            mip_levels: 1,
            memory: MemoryLocation::GpuOnly,
            size: AttachmentSize::Absolute {
                width,
                height,
                depth: 1,
            },
        }
    }
}

pub fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
    )
}

pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn format_has_depth_or_stencil(format: vk::Format) -> bool {
    format_has_depth(format) || format_has_stencil(format)
}

/// The aspects a format actually carries.
pub fn format_aspect(format: vk::Format) -> ImageAspect {
    if format_has_depth_or_stencil(format) {
        let mut aspect = ImageAspect::empty();
        if format_has_depth(format) {
            aspect |= ImageAspect::DEPTH;
        }
        if format_has_stencil(format) {
            aspect |= ImageAspect::STENCIL;
        }
        aspect
    } else {
        ImageAspect::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_range_overlaps_everything() {
        let whole = Range::whole();
        let narrow = Range {
            aspect: ImageAspect::COLOR,
            mipmap: 3,
            num_mipmaps: 1,
            layer: 7,
            num_layers: 2,
        };
        assert!(whole.overlaps(&narrow));
        assert!(narrow.overlaps(&whole));
    }

    #[test]
    fn disjoint_mip_windows_do_not_overlap() {
        let a = Range {
            mipmap: 0,
            num_mipmaps: 2,
            ..Range::whole()
        };
        let b = Range {
            mipmap: 2,
            num_mipmaps: 2,
            ..Range::whole()
        };
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn disjoint_layer_windows_do_not_overlap() {
        let a = Range {
            layer: 0,
            num_layers: 4,
            ..Range::whole()
        };
        let b = Range {
            layer: 4,
            num_layers: 0,
            ..Range::whole()
        };
        assert!(!a.overlaps(&b));
        let c = Range {
            layer: 3,
            num_layers: 0,
            ..Range::whole()
        };
        assert!(a.overlaps(&c));
    }

    #[test]
    fn write_detection() {
        assert!(AccessMask::ATTACHMENT_WRITE.writes());
        assert!((AccessMask::STORAGE_WRITE | AccessMask::COMPUTE_ASYNC).writes());
        assert!(!AccessMask::SAMPLED_READ.writes());
        assert!(!AccessMask::ATTACHMENT_INPUT.writes());
    }

    #[test]
    fn depth_stencil_format_aspects() {
        assert_eq!(
            format_aspect(vk::Format::D32_SFLOAT_S8_UINT),
            ImageAspect::DEPTH | ImageAspect::STENCIL
        );
        assert_eq!(format_aspect(vk::Format::D32_SFLOAT), ImageAspect::DEPTH);
        assert_eq!(format_aspect(vk::Format::S8_UINT), ImageAspect::STENCIL);
        assert_eq!(
            format_aspect(vk::Format::R8G8B8A8_UNORM),
            ImageAspect::COLOR
        );
    }
}
