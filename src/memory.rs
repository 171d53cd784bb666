//! Owned GPU memory-backed resources
//!
//! Each type holds the `Context` alive and releases its Vulkan objects on drop, views before
//! images and objects before their memory. Construction is incremental: a partially built value
//! holds null handles, which Vulkan permits destroying, so an early return cleans up after itself.

use std::{ffi::CStr, ptr::NonNull, sync::Arc};

use ash::vk;

use crate::{error::Check, Context, Error, Result};

pub fn find_memory_type(
    device_props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for i in 0..device_props.memory_type_count {
        if type_bits & (1 << i) != 0
            && device_props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }
    None
}

unsafe fn allocate(
    ctx: &Context,
    reqs: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    what: &'static str,
) -> Result<vk::DeviceMemory> {
    let ty = find_memory_type(&ctx.memory_properties, reqs.memory_type_bits, flags)
        .ok_or(Error::NoMemoryType { what })?;
    ctx.device
        .allocate_memory(
            &vk::MemoryAllocateInfo {
                allocation_size: reqs.size,
                memory_type_index: ty,
                ..Default::default()
            },
            None,
        )
        .check(what)
}

/// A device-local image with a view covering every mip level
pub struct Image {
    ctx: Arc<Context>,
    pub handle: vk::Image,
    pub view: vk::ImageView,
    memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub aspect: vk::ImageAspectFlags,
}

impl Drop for Image {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Image {
    pub unsafe fn new(
        ctx: &Arc<Context>,
        info: &vk::ImageCreateInfo,
        aspect: vk::ImageAspectFlags,
        name: &'static CStr,
    ) -> Result<Self> {
        let what = name.to_str().unwrap_or("image");
        let device = &ctx.device;
        let mut image = Self {
            ctx: ctx.clone(),
            handle: vk::Image::null(),
            view: vk::ImageView::null(),
            memory: vk::DeviceMemory::null(),
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            aspect,
        };
        image.handle = device.create_image(info, None).check(what)?;
        let reqs = device.get_image_memory_requirements(image.handle);
        image.memory = allocate(ctx, reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL, what)?;
        device
            .bind_image_memory(image.handle, image.memory, 0)
            .check(what)?;
        image.view = create_view(ctx, &image, 0, info.mip_levels, what)?;
        ctx.set_name(image.handle, name);
        ctx.set_name(image.view, name);
        Ok(image)
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

unsafe fn create_view(
    ctx: &Context,
    image: &Image,
    base_mip_level: u32,
    level_count: u32,
    what: &'static str,
) -> Result<vk::ImageView> {
    ctx.device
        .create_image_view(
            &vk::ImageViewCreateInfo {
                image: image.handle,
                view_type: if image.extent.depth > 1 {
                    vk::ImageViewType::TYPE_3D
                } else {
                    vk::ImageViewType::TYPE_2D
                },
                format: image.format,
                components: vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                },
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: image.aspect,
                    base_mip_level,
                    level_count,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            },
            None,
        )
        .check(what)
}

/// An additional view of part of an `Image`'s mip chain
///
/// Must be dropped before the image it views; owners declare it ahead of the image.
pub struct ImageView {
    ctx: Arc<Context>,
    pub handle: vk::ImageView,
}

impl ImageView {
    pub unsafe fn base_level(ctx: &Arc<Context>, image: &Image) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            handle: create_view(ctx, image, 0, 1, "base level view")?,
        })
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_image_view(self.handle, None);
        }
    }
}

/// A buffer with dedicated memory, optionally persistently mapped
pub struct Buffer {
    ctx: Arc<Context>,
    pub handle: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

// The mapping is only written through `&self` methods that copy bytes in.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            if self.mapped.is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.handle, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Buffer {
    /// Host-visible, coherent buffer that stays mapped for its whole lifetime
    pub unsafe fn host_visible(
        ctx: &Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &'static CStr,
    ) -> Result<Self> {
        let mut buffer = Self::new(
            ctx,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            name,
        )?;
        let ptr = ctx
            .device
            .map_memory(buffer.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .check("buffer mapping")?;
        buffer.mapped = NonNull::new(ptr.cast());
        Ok(buffer)
    }

    unsafe fn new(
        ctx: &Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        name: &'static CStr,
    ) -> Result<Self> {
        let what = name.to_str().unwrap_or("buffer");
        let device = &ctx.device;
        let mut buffer = Self {
            ctx: ctx.clone(),
            handle: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size,
            mapped: None,
        };
        buffer.handle = device
            .create_buffer(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                None,
            )
            .check(what)?;
        let reqs = device.get_buffer_memory_requirements(buffer.handle);
        buffer.memory = allocate(ctx, reqs, flags, what)?;
        device
            .bind_buffer_memory(buffer.handle, buffer.memory, 0)
            .check(what)?;
        ctx.set_name(buffer.handle, name);
        Ok(buffer)
    }

    /// Copy `data` into a mapped buffer at `offset`
    ///
    /// # Panics
    /// If the buffer wasn't created with [`Buffer::host_visible`], or the range extends past its
    /// end. Both are caller bugs, not runtime conditions.
    ///
    /// # Safety
    /// The range must not be concurrently read by the GPU in a way that requires a consistent
    /// snapshot.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        let base = self.mapped.expect("buffer is not host visible");
        assert!(offset + data.len() <= self.size as usize, "write out of bounds");
        std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset), data.len());
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_selection() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        // Type 1 excluded by the resource's requirements
        assert_eq!(find_memory_type(&props, 0b101, host), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b010, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
