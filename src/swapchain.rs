//! Swapchain creation and presentation.
//!
//! The caller supplies the surface (window integration is a caller
//! capability); the framegraph picks the first acceptable
//! format/present-mode/composite combination from the ordered preference
//! lists and falls back to defaults on mismatch: FIFO, the first supported
//! surface format, opaque composite.

use crate::device::QueueKind;
use crate::error::{Error, Result};
use crate::framegraph::FrameGraph;
use crate::resource::{ImageDesc, ImageId, OwnedSwapchainId, SwapchainId, SwapchainSlot};
use ash::vk;
use std::ffi::CStr;
use tracing::{info, trace};

/// Window-system integration supplied by the caller. The framegraph never
/// creates surfaces itself; it only invokes this capability. Plain function
/// pointers keep ownership trivial.
#[derive(Copy, Clone)]
pub struct SurfaceProvider {
    /// Instance extensions the surface needs; the caller enables these
    /// before creating the instance it hands to [`crate::DeviceInfo`].
    pub required_instance_extensions: fn() -> Vec<&'static CStr>,
    pub create_surface: fn(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>,
}

#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    /// Acceptable `(format, color space)` pairs in preference order.
    pub formats: Vec<(vk::Format, vk::ColorSpaceKHR)>,
    /// Acceptable present modes in preference order.
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub required_usage: vk::ImageUsageFlags,
    /// Kept only where the surface supports it.
    pub optional_usage: vk::ImageUsageFlags,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        SwapchainDesc {
            surface: vk::SurfaceKHR::null(),
            width: 0,
            height: 0,
            image_count: 2,
            formats: vec![
                (vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                (vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            required_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            optional_usage: vk::ImageUsageFlags::empty(),
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }
}

fn choose_surface_format(
    preferences: &[(vk::Format, vk::ColorSpaceKHR)],
    supported: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    preferences
        .iter()
        .find_map(|&(format, color_space)| {
            supported
                .iter()
                .find(|s| s.format == format && s.color_space == color_space)
                .copied()
        })
        .or_else(|| supported.first().copied())
}

fn choose_present_mode(
    preferences: &[vk::PresentModeKHR],
    supported: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    preferences
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        // FIFO support is mandatory in Vulkan
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(desc: &SwapchainDesc, caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: desc
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: desc
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

impl FrameGraph {
    /// Invokes the caller's surface capability against the wrapped instance.
    pub fn create_surface(&self, provider: &SurfaceProvider) -> Result<vk::SurfaceKHR> {
        (provider.create_surface)(&self.device().entry, &self.device().instance)
    }

    /// Creates (or recreates, when `old` is given) a swapchain for a
    /// caller-provided surface.
    pub fn create_swapchain(
        &self,
        name: &str,
        desc: &SwapchainDesc,
        old: Option<OwnedSwapchainId>,
    ) -> Result<OwnedSwapchainId> {
        let device = self.device();
        let resources = self.resources();

        let (caps, supported_formats, supported_modes) = unsafe {
            let caps = device
                .vk_khr_surface
                .get_physical_device_surface_capabilities(device.physical_device, desc.surface)
                .map_err(|e| Error::device("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e))?;
            let formats = device
                .vk_khr_surface
                .get_physical_device_surface_formats(device.physical_device, desc.surface)
                .map_err(|e| Error::device("vkGetPhysicalDeviceSurfaceFormatsKHR", e))?;
            let modes = device
                .vk_khr_surface
                .get_physical_device_surface_present_modes(device.physical_device, desc.surface)
                .map_err(|e| Error::device("vkGetPhysicalDeviceSurfacePresentModesKHR", e))?;
            (caps, formats, modes)
        };

        let format =
            choose_surface_format(&desc.formats, &supported_formats).ok_or_else(|| {
                Error::Configuration {
                    name: name.to_string(),
                    reason: "surface reports no formats".to_string(),
                }
            })?;
        let present_mode = choose_present_mode(&desc.present_modes, &supported_modes);
        let extent = choose_extent(desc, &caps);

        if !caps.supported_usage_flags.contains(desc.required_usage) {
            return Err(Error::Configuration {
                name: name.to_string(),
                reason: format!(
                    "surface does not support required usage {:?}",
                    desc.required_usage
                ),
            });
        }
        let usage = desc.required_usage | (desc.optional_usage & caps.supported_usage_flags);

        let composite_alpha = if caps.supported_composite_alpha.contains(desc.composite_alpha) {
            desc.composite_alpha
        } else {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        };
        let pre_transform = if caps.supported_transforms.contains(desc.pre_transform) {
            desc.pre_transform
        } else {
            caps.current_transform
        };

        let mut image_count = desc.image_count.max(caps.min_image_count);
        if caps.max_image_count != 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let old_handle = old
            .as_ref()
            .map(|id| resources.swapchain_acquire_info(id.get()).map(|(h, _)| h))
            .transpose()?
            .unwrap_or(vk::SwapchainKHR::null());

        let create_info = vk::SwapchainCreateInfoKHR {
            surface: desc.surface,
            min_image_count: image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old_handle,
            ..Default::default()
        };
        let handle = unsafe {
            device
                .vk_khr_swapchain
                .create_swapchain(&create_info, None)
                .map_err(|e| Error::device("vkCreateSwapchainKHR", e))?
        };
        let vk_images = unsafe {
            device
                .vk_khr_swapchain
                .get_swapchain_images(handle)
                .map_err(|e| Error::device("vkGetSwapchainImagesKHR", e))?
        };

        if let Some(old) = old {
            resources.release_swapchain(old);
        }

        let image_desc = ImageDesc {
            format: format.format,
            width: extent.width,
            height: extent.height,
            usage,
            ..Default::default()
        };
        let images: Vec<ImageId> = vk_images
            .iter()
            .enumerate()
            .map(|(i, &img)| {
                resources.register_swapchain_image(&format!("{name}.image{i}"), img, &image_desc)
            })
            .collect();

        let (acquire_semaphore, present_semaphore) = unsafe {
            let create = vk::SemaphoreCreateInfo::default();
            (
                device
                    .device
                    .create_semaphore(&create, None)
                    .map_err(|e| Error::device("vkCreateSemaphore", e))?,
                device
                    .device
                    .create_semaphore(&create, None)
                    .map_err(|e| Error::device("vkCreateSemaphore", e))?,
            )
        };

        info!(
            name,
            format = ?format.format,
            ?present_mode,
            width = extent.width,
            height = extent.height,
            images = images.len(),
            "created swapchain"
        );

        Ok(resources.insert_swapchain_slot(SwapchainSlot {
            handle,
            surface: desc.surface,
            images,
            format,
            extent,
            present_mode,
            acquire_semaphore,
            present_semaphore,
            current_image: 0,
            acquire_pending: false,
            ref_count: 1,
            name: name.to_string(),
        }))
    }

    /// Acquires the next swapchain image. The batch that writes it waits on
    /// the acquire semaphore automatically when a `Present` task names this
    /// swapchain.
    pub fn acquire_next_image(&self, id: SwapchainId, timeout_ns: u64) -> Result<(ImageId, u32)> {
        let (handle, acquire_semaphore) = self.resources().swapchain_acquire_info(id)?;
        let (index, suboptimal) = unsafe {
            self.device()
                .vk_khr_swapchain
                .acquire_next_image(handle, timeout_ns, acquire_semaphore, vk::Fence::null())
                .map_err(|e| Error::device("vkAcquireNextImageKHR", e))?
        };
        if suboptimal {
            trace!(?id, "swapchain is suboptimal");
        }
        let image = self.resources().set_swapchain_current(id, index)?;
        Ok((image, index))
    }

    /// Presents the image last written by a `Present` task, waiting on the
    /// semaphore the presenting batch signalled.
    pub fn present(&self, id: SwapchainId) -> Result<()> {
        let (handle, image_index, wait_semaphore) = self.resources().swapchain_present_info(id)?;
        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait_semaphore,
            swapchain_count: 1,
            p_swapchains: &handle,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let queue = self.device().queue(QueueKind::Graphics);
        let _guard = queue.submit_lock.lock();
        unsafe {
            self.device()
                .vk_khr_swapchain
                .queue_present(queue.handle, &present_info)
                .map_err(|e| Error::device("vkQueuePresentKHR", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_preference_order_is_honoured() {
        let supported = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(
            &[
                (vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            &supported,
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn unsupported_preferences_fall_back_to_defaults() {
        let supported = [vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = choose_surface_format(
            &[(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            &supported,
        )
        .unwrap();
        // first supported format wins when nothing acceptable matches
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);

        let mode = choose_present_mode(
            &[vk::PresentModeKHR::MAILBOX],
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
        );
        assert_eq!(mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_clamps_when_surface_leaves_it_open() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        };
        let desc = SwapchainDesc {
            width: 8192,
            height: 16,
            ..Default::default()
        };
        let extent = choose_extent(&desc, &caps);
        assert_eq!(extent.width, 2048);
        assert_eq!(extent.height, 64);
    }
}
