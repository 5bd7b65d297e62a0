//! Textures and buffers with tracked access state.
//!
//! Both resource kinds are shared through `Arc` so a texture can be attached
//! to several cached render passes at once. Each resource records the access
//! state it was last transitioned into; only the [`barrier`](crate::barrier)
//! module and render pass end ever change it.
//!
//! Native handles are released through the
//! [`DeferredDeletionQueue`](crate::deferred::DeferredDeletionQueue), never
//! synchronously, since in-flight frames may still reference them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ash::vk;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::deferred::DeferredDeletionQueue;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::types::{BufferDesc, NativeBuffer, NativeTexture, TextureDesc, aspect_mask};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Access state of a texture, mapping 1:1 onto an image layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

impl ResourceState {
    /// Image layout for this state.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::General => vk::ImageLayout::GENERAL,
            ResourceState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ResourceState::DepthStencilAttachment => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            ResourceState::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ResourceState::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Whether shaders may sample or read the texture in this state.
    pub fn is_shader_readable(self) -> bool {
        matches!(
            self,
            ResourceState::ShaderReadOnly
                | ResourceState::DepthStencilReadOnly
                | ResourceState::General
        )
    }
}

/// Access state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Undefined,
    TransferSrc,
    TransferDst,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
    ShaderRead,
    ShaderWrite,
    IndirectArgument,
    HostRead,
}

/// Intended use of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex buffer - stores vertex data
    Vertex,
    /// Index buffer - stores index data
    Index,
    /// Uniform buffer - stores shader uniform data
    Uniform,
    /// Storage buffer - general-purpose GPU storage
    Storage,
    /// Indirect draw/dispatch arguments
    Indirect,
    /// Staging buffer - CPU-writable for data upload
    Staging,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Indirect => {
                vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Whether the buffer lives in host-visible memory.
    pub fn host_visible(self) -> bool {
        match self {
            // Written from the CPU every frame or once at load.
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Uniform => true,
            BufferUsage::Staging => true,
            BufferUsage::Storage | BufferUsage::Indirect => false,
        }
    }

    /// State the buffer is expected to be in while the GPU consumes it.
    pub fn steady_state(self) -> BufferState {
        match self {
            BufferUsage::Vertex => BufferState::VertexBuffer,
            BufferUsage::Index => BufferState::IndexBuffer,
            BufferUsage::Uniform => BufferState::UniformBuffer,
            BufferUsage::Storage => BufferState::ShaderRead,
            BufferUsage::Indirect => BufferState::IndirectArgument,
            BufferUsage::Staging => BufferState::TransferSrc,
        }
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Indirect => "indirect",
            BufferUsage::Staging => "staging",
        }
    }

    /// Creation parameters for a buffer of this usage.
    pub fn desc(self, name: impl Into<String>, size: u64) -> BufferDesc {
        BufferDesc {
            name: name.into(),
            size,
            usage: self.to_vk_usage(),
            host_visible: self.host_visible(),
        }
    }
}

/// A 2D texture or render target.
///
/// The native image can be replaced by [`Texture::resize`]; every
/// replacement bumps [`Texture::generation`], which render passes built
/// against the old image use to detect that they are stale.
pub struct Texture {
    id: u64,
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    desc: RwLock<TextureDesc>,
    native: RwLock<NativeTexture>,
    state: Mutex<ResourceState>,
    generation: AtomicU64,
    destroyed: AtomicBool,
    /// Swapchain images belong to the presentation engine.
    owned: bool,
}

impl Texture {
    pub(crate) fn create(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        desc: TextureDesc,
    ) -> RhiResult<Arc<Self>> {
        let native = device.create_texture(&desc)?;
        debug!(
            "Created texture '{}' {}x{} {:?}",
            desc.name, desc.extent.width, desc.extent.height, desc.format
        );
        Ok(Arc::new(Self {
            id: next_resource_id(),
            device,
            deletion,
            desc: RwLock::new(desc),
            native: RwLock::new(native),
            state: Mutex::new(ResourceState::Undefined),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            owned: true,
        }))
    }

    /// Wraps a swapchain image. The texture never destroys the image.
    pub(crate) fn from_swapchain(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        native: NativeTexture,
        extent: vk::Extent2D,
        format: vk::Format,
        index: usize,
    ) -> Arc<Self> {
        let desc = TextureDesc {
            name: format!("swapchain[{}]", index),
            extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        };
        Arc::new(Self {
            id: next_resource_id(),
            device,
            deletion,
            desc: RwLock::new(desc),
            native: RwLock::new(native),
            state: Mutex::new(ResourceState::Undefined),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            owned: false,
        })
    }

    /// Process-unique identity, stable across resizes.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.desc.read().name.clone()
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc.read().clone()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.read().extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.read().format
    }

    pub fn samples(&self) -> u32 {
        self.desc.read().samples
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.format())
    }

    /// Current native image.
    pub fn handle(&self) -> vk::Image {
        self.native.read().image
    }

    /// Current default image view.
    pub fn view(&self) -> vk::ImageView {
        self.native.read().view
    }

    /// Access state the texture was last transitioned into.
    pub fn current_state(&self) -> ResourceState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        *self.state.lock() = state;
    }

    /// Number of times the native image has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_swapchain_image(&self) -> bool {
        !self.owned
    }

    /// Replaces the native image with one of `extent`. The old image is
    /// released once in-flight frames are done with it; the contents and the
    /// tracked state start over as undefined.
    ///
    /// # Errors
    ///
    /// Fails for swapchain images and destroyed textures, or if the native
    /// image cannot be created.
    pub fn resize(&self, extent: vk::Extent2D) -> RhiResult<()> {
        if !self.owned || self.is_destroyed() {
            return Err(RhiError::InvalidHandle(format!(
                "texture '{}' cannot be resized",
                self.name()
            )));
        }

        let mut desc = self.desc.write();
        let mut resized = desc.clone();
        resized.extent = extent;
        let replacement = self.device.create_texture(&resized)?;

        let old = std::mem::replace(&mut *self.native.write(), replacement);
        *desc = resized;
        self.release_native(old);

        self.set_state(ResourceState::Undefined);
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!(
            "Resized texture '{}' to {}x{}",
            desc.name, extent.width, extent.height
        );
        Ok(())
    }

    /// Destroys the native image. Render passes referencing the texture
    /// become invalid. Calling it twice is harmless.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owned {
            let native = *self.native.read();
            self.release_native(native);
        }
    }

    fn release_native(&self, native: NativeTexture) {
        let device = Arc::clone(&self.device);
        self.deletion.defer(move || device.destroy_texture(native));
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.current_state())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A GPU buffer.
pub struct Buffer {
    id: u64,
    device: Arc<dyn GpuDevice>,
    deletion: Arc<DeferredDeletionQueue>,
    desc: BufferDesc,
    native: NativeBuffer,
    state: Mutex<BufferState>,
}

impl Buffer {
    pub(crate) fn create(
        device: Arc<dyn GpuDevice>,
        deletion: Arc<DeferredDeletionQueue>,
        desc: BufferDesc,
    ) -> RhiResult<Arc<Self>> {
        let native = device.create_buffer(&desc)?;
        debug!("Created buffer '{}' ({} bytes)", desc.name, desc.size);
        Ok(Arc::new(Self {
            id: next_resource_id(),
            device,
            deletion,
            desc,
            native,
            state: Mutex::new(BufferState::Undefined),
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.native.buffer
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.native.size
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }

    pub fn is_host_visible(&self) -> bool {
        self.desc.host_visible
    }

    /// Copies `data` into the buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is not host-visible or the write is out of bounds.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if !self.desc.host_visible {
            return Err(RhiError::InvalidHandle(format!(
                "buffer '{}' is not host-visible",
                self.desc.name
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.native.size) {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} overflows buffer '{}' ({} bytes)",
                data.len(),
                offset,
                self.desc.name,
                self.native.size
            )));
        }
        self.device.write_buffer(self.native.buffer, offset, data)
    }

    /// Access state the buffer was last transitioned into.
    pub fn current_state(&self) -> BufferState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: BufferState) {
        *self.state.lock() = state;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let buffer = self.native.buffer;
        self.deletion.defer(move || device.destroy_buffer(buffer));
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("name", &self.desc.name)
            .field("size", &self.native.size)
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn setup() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>, Arc<DeferredDeletionQueue>) {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, device, Arc::new(DeferredDeletionQueue::new()))
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_new_texture_is_undefined() {
        let (_, device, deletion) = setup();
        let desc = TextureDesc::render_target("color", extent(64, 64), vk::Format::R8G8B8A8_UNORM, 1);
        let texture = Texture::create(device, deletion, desc).unwrap();
        assert_eq!(texture.current_state(), ResourceState::Undefined);
        assert_eq!(texture.generation(), 0);
        assert!(!texture.is_destroyed());
    }

    #[test]
    fn test_resize_bumps_generation_and_defers_release() {
        let (headless, device, deletion) = setup();
        let desc = TextureDesc::render_target("depth", extent(64, 64), vk::Format::D32_SFLOAT, 1);
        let texture = Texture::create(device, Arc::clone(&deletion), desc).unwrap();
        let old_image = texture.handle();
        texture.set_state(ResourceState::DepthStencilAttachment);

        texture.resize(extent(128, 96)).unwrap();
        assert_eq!(texture.generation(), 1);
        assert_eq!(texture.extent().width, 128);
        assert_ne!(texture.handle(), old_image);
        assert_eq!(texture.current_state(), ResourceState::Undefined);

        assert_eq!(headless.stats().textures_destroyed, 0);
        deletion.flush();
        assert_eq!(headless.stats().textures_destroyed, 1);
    }

    #[test]
    fn test_swapchain_texture_is_not_destroyed() {
        let (headless, device, deletion) = setup();
        let native = headless.swapchain_info().images[0];
        let texture = Texture::from_swapchain(
            device,
            Arc::clone(&deletion),
            native,
            extent(800, 600),
            vk::Format::B8G8R8A8_SRGB,
            0,
        );
        assert!(texture.is_swapchain_image());
        assert!(texture.resize(extent(1, 1)).is_err());

        texture.destroy();
        assert!(texture.is_destroyed());
        assert_eq!(deletion.flush(), 0);
    }

    #[test]
    fn test_shader_readable_states() {
        assert!(ResourceState::ShaderReadOnly.is_shader_readable());
        assert!(ResourceState::DepthStencilReadOnly.is_shader_readable());
        assert!(!ResourceState::ColorAttachment.is_shader_readable());
        assert!(!ResourceState::Undefined.is_shader_readable());
    }

    #[test]
    fn test_buffer_write_bounds() {
        let (_, device, deletion) = setup();
        let buffer =
            Buffer::create(device, deletion, BufferUsage::Uniform.desc("camera", 64)).unwrap();
        assert!(buffer.write(0, &[0u8; 64]).is_ok());
        assert!(buffer.write(32, &[0u8; 64]).is_err());
        assert!(matches!(
            buffer.write(u64::MAX - 2, &[0u8; 8]),
            Err(RhiError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_device_local_buffer_rejects_host_write() {
        let (_, device, deletion) = setup();
        let buffer =
            Buffer::create(device, deletion, BufferUsage::Storage.desc("particles", 256)).unwrap();
        assert!(matches!(buffer.write(0, &[1, 2, 3]), Err(RhiError::InvalidHandle(_))));
    }

    #[test]
    fn test_dropped_buffer_is_released_through_queue() {
        let (headless, device, deletion) = setup();
        let buffer =
            Buffer::create(device, Arc::clone(&deletion), BufferUsage::Vertex.desc("vb", 16)).unwrap();
        drop(buffer);
        assert_eq!(headless.stats().buffers_destroyed, 0);
        deletion.flush();
        assert_eq!(headless.stats().buffers_destroyed, 1);
    }
}
