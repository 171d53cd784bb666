use std::{
    collections::HashMap,
    ffi::CStr,
    sync::{Mutex, PoisonError},
};

use ash::{ext, khr, vk, Device, Entry, Instance};
use tracing::info;

use crate::{error::Check, vulkan::passes, vulkan::RenderPasses, Config, Error, Result};

/// Vulkan objects shared by everything else: device, queues, surface, render passes, samplers
///
/// Takes ownership of the instance and surface it's constructed from and destroys them last.
pub struct Context {
    pub entry: Entry,
    pub instance: Instance,
    pub physical: vk::PhysicalDevice,
    pub device: Device,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub graphics: Queue,
    /// Distinct from `graphics` when the device has a dedicated compute family
    pub compute: Queue,
    pub surface: Option<Surface>,
    pub swapchain_fn: khr::swapchain::Device,
    /// Format of presented images; fixed for the context's lifetime since render passes depend on it
    pub surface_format: vk::SurfaceFormatKHR,
    pub pipeline_cache: vk::PipelineCache,
    pub render_passes: RenderPasses,
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
    debug_utils: Option<ext::debug_utils::Device>,
}

#[derive(Debug, Copy, Clone)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
}

pub struct Surface {
    pub loader: khr::surface::Instance,
    pub handle: vk::SurfaceKHR,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SamplerKey {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl SamplerKey {
    pub const LINEAR_CLAMP: Self = Self {
        filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };
    pub const NEAREST_CLAMP: Self = Self {
        filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };
}

impl Context {
    /// Select a device and create the shared objects
    ///
    /// `instance` must outlive nothing but this `Context`. If `surface` is supplied, the instance
    /// must have been created with the surface extensions it requires, and the selected device will
    /// be able to present to it. With `config.validation`, the instance must have enabled
    /// `VK_EXT_debug_utils`.
    pub unsafe fn new(
        entry: Entry,
        instance: Instance,
        surface: Option<vk::SurfaceKHR>,
        config: &Config,
    ) -> Result<Self> {
        let surface = surface.map(|handle| Surface {
            loader: khr::surface::Instance::new(&entry, &instance),
            handle,
        });
        let selected = match select_device(&instance, surface.as_ref()) {
            Ok(x) => x,
            Err(e) => {
                abandon(&instance, surface.as_ref());
                return Err(e);
            }
        };
        let Selected {
            physical,
            graphics_family,
            compute_family,
        } = selected;

        let props = instance.get_physical_device_properties(physical);
        info!(
            name = ?props.device_name_as_c_str().unwrap_or(c"unknown"),
            graphics_family,
            compute_family,
            "selected device"
        );

        let priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)];
        if compute_family != graphics_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(compute_family)
                    .queue_priorities(&priorities),
            );
        }
        let mut extensions = Vec::new();
        if surface.is_some() {
            extensions.push(khr::swapchain::NAME.as_ptr());
        }
        let device = match instance
            .create_device(
                physical,
                &vk::DeviceCreateInfo::default()
                    .queue_create_infos(&queue_infos)
                    .enabled_extension_names(&extensions),
                None,
            )
            .check("device")
        {
            Ok(x) => x,
            Err(e) => {
                abandon(&instance, surface.as_ref());
                return Err(e);
            }
        };

        let surface_format = match surface {
            Some(ref surface) => surface
                .loader
                .get_physical_device_surface_formats(physical, surface.handle)
                .map(|formats| choose_surface_format(&formats))
                .unwrap_or(DEFAULT_SURFACE_FORMAT),
            None => DEFAULT_SURFACE_FORMAT,
        };

        let mut ctx = Self {
            swapchain_fn: khr::swapchain::Device::new(&instance, &device),
            debug_utils: config
                .validation
                .then(|| ext::debug_utils::Device::new(&instance, &device)),
            memory_properties: instance.get_physical_device_memory_properties(physical),
            graphics: Queue {
                family: graphics_family,
                handle: device.get_device_queue(graphics_family, 0),
            },
            compute: Queue {
                family: compute_family,
                handle: device.get_device_queue(compute_family, 0),
            },
            entry,
            instance,
            physical,
            device,
            surface,
            surface_format,
            pipeline_cache: vk::PipelineCache::null(),
            render_passes: RenderPasses::default(),
            samplers: Mutex::new(HashMap::new()),
        };
        // From here on, an early return destroys whatever was created through `Drop`.
        ctx.pipeline_cache = ctx
            .device
            .create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)
            .check("pipeline cache")?;
        ctx.render_passes.background = passes::background(&ctx.device)?;
        ctx.render_passes.geometry = passes::geometry(&ctx.device)?;
        ctx.render_passes.composition = passes::composition(&ctx.device)?;
        ctx.render_passes.post = passes::post(&ctx.device, surface_format.format)?;
        ctx.set_name(ctx.render_passes.background, c"background");
        ctx.set_name(ctx.render_passes.geometry, c"geometry");
        ctx.set_name(ctx.render_passes.composition, c"composition");
        ctx.set_name(ctx.render_passes.post, c"post");
        Ok(ctx)
    }

    /// Whether precompute and rendering happen on different queue families
    pub fn split_queues(&self) -> bool {
        self.graphics.family != self.compute.family
    }

    /// Get or create a sampler
    pub fn sampler(&self, key: SamplerKey) -> Result<vk::Sampler> {
        let mut samplers = self.samplers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&sampler) = samplers.get(&key) {
            return Ok(sampler);
        }
        let sampler = unsafe {
            self.device
                .create_sampler(
                    &vk::SamplerCreateInfo {
                        min_filter: key.filter,
                        mag_filter: key.filter,
                        mipmap_mode: key.mipmap_mode,
                        address_mode_u: key.address_mode,
                        address_mode_v: key.address_mode,
                        address_mode_w: key.address_mode,
                        max_lod: vk::LOD_CLAMP_NONE,
                        ..Default::default()
                    },
                    None,
                )
                .check("sampler")?
        };
        samplers.insert(key, sampler);
        Ok(sampler)
    }

    /// Attach a debug name to `object`, if validation is enabled
    pub fn set_name<T: vk::Handle>(&self, object: T, name: &CStr) {
        let Some(ref debug_utils) = self.debug_utils else {
            return;
        };
        unsafe {
            // Names are a debugging aid; failing to set one isn't worth failing over.
            let _ = debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default()
                    .object_handle(object)
                    .object_name(name),
            );
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle().check("device idle") }
    }

    /// Whether `format` can be filtered linearly when sampled or blitted from optimal tiling
    pub fn supports_linear_filter(&self, format: vk::Format) -> bool {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, sampler) in self
                .samplers
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
            {
                self.device.destroy_sampler(sampler, None);
            }
            self.render_passes.destroy(&self.device);
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_device(None);
            if let Some(ref surface) = self.surface {
                surface.loader.destroy_surface(surface.handle, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Clean up after a failure that occurred before a `Context` existed to do it
unsafe fn abandon(instance: &Instance, surface: Option<&Surface>) {
    if let Some(surface) = surface {
        surface.loader.destroy_surface(surface.handle, None);
    }
    instance.destroy_instance(None);
}

const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Prefer an sRGB format, since post processing writes linear values
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return DEFAULT_SURFACE_FORMAT;
    }
    formats
        .iter()
        .copied()
        .find(|f| {
            matches!(
                f.format,
                vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
            ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .unwrap_or(DEFAULT_SURFACE_FORMAT)
}

struct Selected {
    physical: vk::PhysicalDevice,
    graphics_family: u32,
    compute_family: u32,
}

unsafe fn select_device(instance: &Instance, surface: Option<&Surface>) -> Result<Selected> {
    let mut best: Option<(bool, Selected)> = None;
    for physical in instance
        .enumerate_physical_devices()
        .check("physical device enumeration")?
    {
        let families = instance.get_physical_device_queue_family_properties(physical);
        let graphics_family = families.iter().enumerate().position(|(i, info)| {
            info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surface.map_or(true, |s| {
                    s.loader
                        .get_physical_device_surface_support(physical, i as u32, s.handle)
                        .unwrap_or(false)
                })
        });
        let Some(graphics_family) = graphics_family else {
            continue;
        };
        let flags = families.iter().map(|x| x.queue_flags).collect::<Vec<_>>();
        let compute_family = dedicated_compute(&flags).unwrap_or(graphics_family as u32);
        let discrete = instance.get_physical_device_properties(physical).device_type
            == vk::PhysicalDeviceType::DISCRETE_GPU;
        if best.as_ref().map_or(true, |&(d, _)| discrete && !d) {
            best = Some((
                discrete,
                Selected {
                    physical,
                    graphics_family: graphics_family as u32,
                    compute_family,
                },
            ));
        }
    }
    best.map(|(_, x)| x).ok_or(Error::NoSuitableDevice)
}

/// A family supporting compute but not graphics, which can run the precompute without contending
/// with rendering
fn dedicated_compute(families: &[vk::QueueFlags]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_preference() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), srgb);
        assert_eq!(choose_surface_format(&[unorm]), unorm);
        assert_eq!(
            choose_surface_format(&[vk::SurfaceFormatKHR::default()]),
            DEFAULT_SURFACE_FORMAT
        );
    }

    #[test]
    fn compute_family_selection() {
        use vk::QueueFlags as F;
        assert_eq!(
            dedicated_compute(&[F::GRAPHICS | F::COMPUTE, F::TRANSFER, F::COMPUTE | F::TRANSFER]),
            Some(2)
        );
        assert_eq!(dedicated_compute(&[F::GRAPHICS | F::COMPUTE, F::TRANSFER]), None);
    }
}
