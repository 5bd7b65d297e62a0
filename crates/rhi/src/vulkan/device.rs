//! [`GpuDevice`] over a real Vulkan device.
//!
//! One `VulkanDevice` owns the instance, the window surface, the logical
//! device, the gpu-allocator heap and the swapchain. Queue access is
//! serialized through a single lock since graphics, compute and copy may
//! resolve to the same `VkQueue`.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use ember_core::RhiConfig;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, warn};

use crate::binding::BindingShape;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PushConstantRange};
use crate::render_pass::RenderPassLayout;
use crate::state::sampler::SamplerStateDesc;
use crate::types::{
    AcquireOutcome, BufferDesc, DescriptorPoolDesc, DescriptorWrite, DescriptorWriteData,
    DeviceCapabilities, NativeBuffer, NativeTexture, PipelineBarrier, PresentOutcome, QueueType,
    RenderPassBegin, SemaphoreKind, SubmitInfo, SwapchainInfo, TextureDesc, aspect_mask,
};

use super::convert;
use super::instance::Instance;
use super::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices, select_physical_device};
use super::swapchain::{Swapchain, SwapchainTarget};

const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// Vulkan implementation of [`GpuDevice`].
pub struct VulkanDevice {
    caps: DeviceCapabilities,
    physical: PhysicalDeviceInfo,
    vsync: bool,
    /// Indexed by [`QueueType::index`].
    queues: [vk::Queue; 3],
    present_queue: vk::Queue,
    queue_lock: Mutex<()>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Mutex<Option<Swapchain>>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    image_allocations: Mutex<HashMap<vk::Image, Allocation>>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    device: ash::Device,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    instance: Instance,
}

impl VulkanDevice {
    /// Brings up Vulkan on `window` with a swapchain of `config.width` x `config.height`.
    pub fn new<W>(window: &W, config: &RhiConfig) -> RhiResult<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?
            .as_raw();

        let instance = Instance::new(config.validation, Some(display))?;
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display,
                window_handle,
                None,
            )?
        };
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        match Self::with_surface(instance, surface, surface_loader, config) {
            Ok(device) => Ok(Arc::new(device)),
            Err((surface_loader, e)) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn with_surface(
        instance: Instance,
        surface: vk::SurfaceKHR,
        surface_loader: ash::khr::surface::Instance,
        config: &RhiConfig,
    ) -> Result<Self, (ash::khr::surface::Instance, RhiError)> {
        let physical = match select_physical_device(instance.handle(), surface, &surface_loader) {
            Ok(physical) => physical,
            Err(e) => return Err((surface_loader, e)),
        };
        let device = match create_logical_device(&instance, &physical) {
            Ok(device) => device,
            Err(e) => return Err((surface_loader, e)),
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err((surface_loader, e.into()));
            }
        };
        debug!("GPU memory allocator initialized");

        let families = physical.queue_families;
        let queue = |family: Option<u32>| {
            family.map_or(vk::Queue::null(), |f| unsafe { device.get_device_queue(f, 0) })
        };
        let queues = [
            queue(families.graphics_family),
            queue(families.compute_family),
            queue(families.transfer_family),
        ];
        let present_queue = queue(families.present_family);

        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), &device);
        let target = SwapchainTarget {
            device: &device,
            physical_device: physical.device,
            surface,
            surface_loader: &surface_loader,
            queue_families: families,
            vsync: config.vsync,
        };
        let extent = vk::Extent2D {
            width: config.width,
            height: config.height,
        };
        let swapchain =
            match Swapchain::new(swapchain_loader.clone(), &target, extent, vk::SwapchainKHR::null())
            {
                Ok(swapchain) => swapchain,
                Err(e) => {
                    drop(allocator);
                    unsafe { device.destroy_device(None) };
                    return Err((surface_loader, e));
                }
            };

        let caps = physical.capabilities();
        info!(
            "Vulkan device ready: '{}', timeline semaphores: {}, timestamp period {} ns",
            caps.device_name, caps.timeline_semaphores, caps.timestamp_period
        );

        Ok(Self {
            caps,
            physical,
            vsync: config.vsync,
            queues,
            present_queue,
            queue_lock: Mutex::new(()),
            swapchain_loader,
            swapchain: Mutex::new(Some(swapchain)),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            image_allocations: Mutex::new(HashMap::new()),
            buffer_allocations: Mutex::new(HashMap::new()),
            device,
            surface,
            surface_loader,
            instance,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.physical.queue_families
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.instance.has_validation()
    }

    fn queue(&self, queue: QueueType) -> vk::Queue {
        self.queues[queue.index()]
    }

    fn swapchain_target(&self) -> SwapchainTarget<'_> {
        SwapchainTarget {
            device: &self.device,
            physical_device: self.physical.device,
            surface: self.surface,
            surface_loader: &self.surface_loader,
            queue_families: self.physical.queue_families,
            vsync: self.vsync,
        }
    }

    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        Ok(self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free_memory(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    fn shader_stage<'a>(
        module: &'a crate::shader::ShaderModule,
    ) -> vk::PipelineShaderStageCreateInfo<'a> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(module.stage().to_vk_stage())
            .module(module.handle())
            .name(module.entry_point())
    }
}

fn create_logical_device(
    instance: &Instance,
    physical: &PhysicalDeviceInfo,
) -> RhiResult<ash::Device> {
    let unique_families = physical.queue_families.unique_families();
    let priorities = [1.0f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let mut supported = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut supported);
    unsafe {
        instance
            .handle()
            .get_physical_device_features2(physical.device, &mut features2)
    };

    let mut enabled = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(supported.timeline_semaphore == vk::TRUE)
        .descriptor_indexing(supported.descriptor_indexing == vk::TRUE)
        .runtime_descriptor_array(supported.runtime_descriptor_array == vk::TRUE)
        .descriptor_binding_partially_bound(supported.descriptor_binding_partially_bound == vk::TRUE)
        .descriptor_binding_variable_descriptor_count(
            supported.descriptor_binding_variable_descriptor_count == vk::TRUE,
        )
        .shader_sampled_image_array_non_uniform_indexing(
            supported.shader_sampled_image_array_non_uniform_indexing == vk::TRUE,
        );

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
        .fill_mode_non_solid(physical.features.fill_mode_non_solid == vk::TRUE)
        .sample_rate_shading(physical.features.sample_rate_shading == vk::TRUE)
        .depth_bounds(physical.features.depth_bounds == vk::TRUE)
        .depth_clamp(physical.features.depth_clamp == vk::TRUE)
        .multi_draw_indirect(physical.features.multi_draw_indirect == vk::TRUE);

    let extension_names: Vec<*const std::ffi::c_char> =
        DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features)
        .push_next(&mut enabled);

    let device = unsafe {
        instance
            .handle()
            .create_device(physical.device, &create_info, None)?
    };
    debug!(
        "Logical device created with {} queue family(ies): {:?}",
        queue_infos.len(),
        unique_families
    );
    Ok(device)
}

fn map_wait_error(e: vk::Result, what: &str) -> RhiError {
    match e {
        vk::Result::TIMEOUT => RhiError::Timeout(what.to_string()),
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
        other => other.into(),
    }
}

fn map_submit_error(e: vk::Result) -> RhiError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
        other => other.into(),
    }
}

impl GpuDevice for VulkanDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.map_err(|e| map_wait_error(e, "fence"))
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> RhiResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout_ns) }
            .map_err(|e| map_wait_error(e, "fence"))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        Ok(unsafe { self.device.reset_fences(fences)? })
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> RhiResult<vk::Semaphore> {
        let semaphore = match kind {
            SemaphoreKind::Binary => unsafe {
                self.device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            },
            SemaphoreKind::Timeline { initial_value } => {
                if !self.caps.timeline_semaphores {
                    return Err(RhiError::InvalidHandle(
                        "Timeline semaphores are not supported by this device".to_string(),
                    ));
                }
                let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
                unsafe { self.device.create_semaphore(&info, None)? }
            }
        };
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> RhiResult<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> RhiResult<()> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        Ok(unsafe { self.device.signal_semaphore(&info)? })
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> RhiResult<()> {
        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&info, timeout_ns) }
            .map_err(|e| map_wait_error(e, "timeline semaphore"))
    }

    fn create_command_pool(&self, queue: QueueType) -> RhiResult<vk::CommandPool> {
        let family = self
            .physical
            .queue_families
            .family(queue)
            .ok_or_else(|| RhiError::InvalidHandle(format!("No queue family for {:?}", queue)))?;
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&info)? }
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("No command buffer allocated".to_string()))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        Ok(unsafe { self.device.begin_command_buffer(cmd, &info)? })
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        Ok(unsafe { self.device.end_command_buffer(cmd)? })
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        Ok(unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?
        })
    }

    fn cmd_pipeline_barrier(&self, cmd: vk::CommandBuffer, barrier: &PipelineBarrier) {
        let images: Vec<_> = barrier.images.iter().map(convert::image_barrier).collect();
        let buffers: Vec<_> = barrier.buffers.iter().map(convert::buffer_barrier).collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &buffers,
                &images,
            )
        };
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        let clear_values: Vec<vk::ClearValue> =
            begin.clear_values.iter().map(|c| c.to_vk()).collect();
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.area)
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_next_subpass(cmd, vk::SubpassContents::INLINE) };
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        };
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cmd, layout, stages, offset, data) };
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, offset, index_type)
        };
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_draw_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indirect(cmd, buffer, offset, draw_count, stride)
        };
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(cmd, buffer, offset, draw_count, stride)
        };
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent2D,
    ) {
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
    }

    fn cmd_reset_query_pool(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        unsafe { self.device.cmd_reset_query_pool(cmd, pool, first, count) };
    }

    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe { self.device.cmd_write_timestamp(cmd, stage, pool, query) };
    }

    fn queue_submit(&self, queue: QueueType, submit: &SubmitInfo<'_>) -> RhiResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submit.waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.waits.iter().map(|w| w.stage).collect();
        let wait_values: Vec<u64> = submit.waits.iter().map(|w| w.value).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            submit.signals.iter().map(|s| s.semaphore).collect();
        let signal_values: Vec<u64> = submit.signals.iter().map(|s| s.value).collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let mut info = vk::SubmitInfo::default()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);
        if self.caps.timeline_semaphores {
            info = info.push_next(&mut timeline_info);
        }

        let _guard = self.queue_lock.lock();
        unsafe {
            self.device
                .queue_submit(self.queue(queue), &[info], submit.fence)
        }
        .map_err(map_submit_error)
    }

    fn queue_wait_idle(&self, queue: QueueType) -> RhiResult<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.queue_wait_idle(self.queue(queue)) }.map_err(map_submit_error)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }.map_err(map_submit_error)
    }

    fn create_sampler(&self, desc: &SamplerStateDesc) -> RhiResult<vk::Sampler> {
        let anisotropy_limit = (self.physical.features.sampler_anisotropy == vk::TRUE)
            .then_some(self.physical.properties.limits.max_sampler_anisotropy);
        let info = convert::sampler_info(desc, anisotropy_limit);
        Ok(unsafe { self.device.create_sampler(&info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RhiError::ShaderError("Empty SPIR-V module".to_string()));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| RhiError::ShaderError(format!("Failed to create shader module: {:?}", e)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> RhiResult<vk::PipelineLayout> {
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|range| {
                vk::PushConstantRange::default()
                    .stage_flags(range.stages)
                    .offset(range.offset)
                    .size(range.size)
            })
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&ranges);
        Ok(unsafe { self.device.create_pipeline_layout(&info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        let mut stages = vec![Self::shader_stage(&desc.vertex_shader)];
        if let Some(fragment) = &desc.fragment_shader {
            stages.push(Self::shader_stage(fragment));
        }

        let vertex_bindings = desc.vertex_input.binding_descriptions();
        let vertex_attributes = desc.vertex_input.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology.to_vk())
            .primitive_restart_enable(false);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = convert::rasterization_info(desc.rasterization.desc());
        let multisample = convert::multisample_info(desc.rasterization.desc());
        let depth_stencil = convert::depth_stencil_info(desc.depth_stencil.desc());

        let blend_desc = desc.blend.desc();
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
            blend_desc.attachments.iter().map(|a| a.to_vk()).collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments)
            .blend_constants(blend_desc.constants);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(desc.render_pass.handle())
            .subpass(desc.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| RhiError::PipelineError(format!("Graphics pipeline: {:?}", e)))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::PipelineError("No graphics pipeline created".to_string()))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(Self::shader_stage(&desc.shader))
            .layout(layout);
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| RhiError::PipelineError(format!("Compute pipeline: {:?}", e)))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::PipelineError("No compute pipeline created".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> RhiResult<vk::RenderPass> {
        let attachments = convert::attachment_descriptions(layout);
        let references = convert::subpass_references(layout);
        let subpasses: Vec<vk::SubpassDescription> =
            references.iter().map(convert::subpass_description).collect();
        let dependencies: Vec<vk::SubpassDependency> = layout
            .dependencies
            .iter()
            .map(convert::subpass_dependency)
            .collect();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| RhiError::RenderPassError(format!("vkCreateRenderPass: {:?}", e)))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        shapes: &[BindingShape],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let (bindings, flags) = convert::descriptor_set_layout_bindings(shapes);
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&flags);
        let mut info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if shapes.iter().any(|shape| shape.bindless) {
            info = info.push_next(&mut flags_info);
        }
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> RhiResult<vk::DescriptorPool> {
        let sizes: Vec<vk::DescriptorPoolSize> = desc
            .sizes
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let flags = if desc.free_individual_sets {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(desc.max_sets)
            .pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let counts = [variable_count.unwrap_or(0)];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let mut info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        if variable_count.is_some() {
            info = info.push_next(&mut variable_info);
        }

        match unsafe { self.device.allocate_descriptor_sets(&info) } {
            Ok(sets) => sets
                .into_iter()
                .next()
                .ok_or_else(|| RhiError::InvalidHandle("No descriptor set allocated".to_string())),
            Err(e) if convert::is_pool_exhaustion(e) => Err(RhiError::DescriptorPoolExhausted(
                format!("{:?}", pool),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> RhiResult<()> {
        Ok(unsafe { self.device.free_descriptor_sets(pool, &[set])? })
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        Ok(unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        })
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        enum Payload {
            Buffers(Vec<vk::DescriptorBufferInfo>),
            Images(Vec<vk::DescriptorImageInfo>),
        }

        let payloads: Vec<(&DescriptorWrite, Payload)> = writes
            .iter()
            .filter_map(|write| match &write.data {
                DescriptorWriteData::Buffers(ranges) => Some((
                    write,
                    Payload::Buffers(
                        ranges
                            .iter()
                            .map(|r| {
                                vk::DescriptorBufferInfo::default()
                                    .buffer(r.buffer)
                                    .offset(r.offset)
                                    .range(r.range)
                            })
                            .collect(),
                    ),
                )),
                DescriptorWriteData::Images(images) => Some((
                    write,
                    Payload::Images(
                        images
                            .iter()
                            .map(|i| {
                                vk::DescriptorImageInfo::default()
                                    .sampler(i.sampler)
                                    .image_view(i.view)
                                    .image_layout(i.layout)
                            })
                            .collect(),
                    ),
                )),
                DescriptorWriteData::AccelerationStructures(_) => {
                    warn!(
                        "Skipping acceleration structure write at binding {}: not supported",
                        write.binding
                    );
                    None
                }
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = payloads
            .iter()
            .map(|(write, payload)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match payload {
                    Payload::Buffers(infos) => base.buffer_info(infos),
                    Payload::Images(infos) => base.image_info(infos),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<NativeTexture> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.sample_flags())
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation =
            match self.allocate_memory(&desc.name, requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(e);
                }
            };

        let view_type = if desc.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(desc.format))
                    .level_count(desc.mip_levels)
                    .layer_count(desc.array_layers),
            );

        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| self.device.create_image_view(&view_info, None))
        };
        match view {
            Ok(view) => {
                self.image_allocations.lock().insert(image, allocation);
                debug!(
                    "Created texture '{}' ({}x{}, {:?})",
                    desc.name, desc.extent.width, desc.extent.height, desc.format
                );
                Ok(NativeTexture { image, view })
            }
            Err(e) => {
                self.free_memory(allocation);
                unsafe { self.device.destroy_image(image, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_texture(&self, texture: NativeTexture) {
        unsafe { self.device.destroy_image_view(texture.view, None) };
        if let Some(allocation) = self.image_allocations.lock().remove(&texture.image) {
            self.free_memory(allocation);
        }
        unsafe { self.device.destroy_image(texture.image, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<NativeBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = match self.allocate_memory(&desc.name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_memory(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        self.buffer_allocations.lock().insert(buffer, allocation);
        debug!("Created buffer '{}' ({} bytes, {:?})", desc.name, desc.size, location);
        Ok(NativeBuffer {
            buffer,
            size: desc.size,
        })
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("Unknown buffer {:?}", buffer)))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::InvalidHandle("Buffer memory is not mapped".to_string()))?;

        let start = offset as usize;
        let end = start + data.len();
        let mapped_len = mapped.len();
        let target = mapped.get_mut(start..end).ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "Write of {} bytes at offset {} exceeds mapped size {}",
                data.len(),
                offset,
                mapped_len
            ))
        })?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if let Some(allocation) = self.buffer_allocations.lock().remove(&buffer) {
            self.free_memory(allocation);
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_timestamp_query_pool(&self, count: u32) -> RhiResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        Ok(unsafe { self.device.create_query_pool(&info, None)? })
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> RhiResult<bool> {
        match unsafe {
            self.device
                .get_query_pool_results(pool, first, out, vk::QueryResultFlags::TYPE_64)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::NOT_READY) => Ok(false),
            Err(e) => Err(map_submit_error(e)),
        }
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        match self.swapchain.lock().as_ref() {
            Some(swapchain) => swapchain.info(),
            None => SwapchainInfo {
                extent: vk::Extent2D::default(),
                format: vk::Format::UNDEFINED,
                images: Vec::new(),
            },
        }
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> RhiResult<AcquireOutcome> {
        match self.swapchain.lock().as_ref() {
            Some(swapchain) => swapchain.acquire(signal),
            None => Ok(AcquireOutcome::OutOfDate),
        }
    }

    fn queue_present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        let swapchain = self.swapchain.lock();
        let Some(swapchain) = swapchain.as_ref() else {
            return Ok(PresentOutcome::OutOfDate);
        };
        let _guard = self.queue_lock.lock();
        swapchain.present(self.present_queue, image_index, wait)
    }

    fn recreate_swapchain(&self, extent: vk::Extent2D) -> RhiResult<SwapchainInfo> {
        let mut slot = self.swapchain.lock();
        let target = self.swapchain_target();
        let rebuilt = match slot.take() {
            Some(old) => old.recreate(&target, extent)?,
            None => Swapchain::new(
                self.swapchain_loader.clone(),
                &target,
                extent,
                vk::SwapchainKHR::null(),
            )?,
        };
        let info = rebuilt.info();
        info!(
            "Swapchain rebuilt at {}x{} ({} images)",
            info.extent.width,
            info.extent.height,
            info.images.len()
        );
        *slot = Some(rebuilt);
        Ok(info)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
        }

        if let Some(swapchain) = self.swapchain.get_mut().take() {
            swapchain.destroy(&self.device);
        }

        let leaked_images: Vec<_> = self.image_allocations.get_mut().drain().collect();
        let leaked_buffers: Vec<_> = self.buffer_allocations.get_mut().drain().collect();
        if !leaked_images.is_empty() || !leaked_buffers.is_empty() {
            warn!(
                "{} image(s) and {} buffer(s) still alive at device teardown",
                leaked_images.len(),
                leaked_buffers.len()
            );
        }
        for (image, allocation) in leaked_images {
            self.free_memory(allocation);
            unsafe { self.device.destroy_image(image, None) };
        }
        for (buffer, allocation) in leaked_buffers {
            self.free_memory(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
        }

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        info!("Vulkan device destroyed");
    }
}

// SAFETY: all mutable state sits behind locks; queue access is serialized
// through `queue_lock`.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_extension_enabled() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanDevice>();
    }

    #[test]
    fn test_wait_errors_are_classified() {
        assert!(matches!(
            map_wait_error(vk::Result::TIMEOUT, "fence"),
            RhiError::Timeout(_)
        ));
        assert!(matches!(
            map_wait_error(vk::Result::ERROR_DEVICE_LOST, "fence"),
            RhiError::DeviceLost
        ));
        assert!(matches!(
            map_submit_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::VulkanError(_)
        ));
    }
}
