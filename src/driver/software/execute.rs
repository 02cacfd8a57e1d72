//! Command execution for the simulated device group.
//!
//! Devices named by a submission run each command in lockstep: a command
//! is executed by every active device, in ascending device order, before
//! the next command starts. Every memory access resolves the instance the
//! device reaches through the resource's binding and checks the peer
//! feature whenever that instance belongs to another device.

use super::{Bound, FaultInjection, LogicalDevice, PeerFeatureTable};
use crate::driver::{
    Barrier, BufferHandle, BufferImageCopy, Command, CommandBuffer, Format, ImageHandle,
    ImageLayout, MemoryBinding, MemoryHandle, PipelineDesc, Rect,
};
use crate::error::DriverError;
use crate::group::{DeviceMask, PeerFeatures};
use crate::raster;
use crate::scene::{ColorUniform, Vertex};
use log::trace;
use std::collections::HashMap;

const TEXEL: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    CopyRead,
    CopyWrite,
    GenericRead,
    GenericWrite,
}

impl AccessKind {
    fn feature(self) -> PeerFeatures {
        match self {
            Self::CopyRead => PeerFeatures::COPY_SRC,
            Self::CopyWrite => PeerFeatures::COPY_DST,
            Self::GenericRead => PeerFeatures::GENERIC_SRC,
            Self::GenericWrite => PeerFeatures::GENERIC_DST,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActivePass {
    target: ImageHandle,
    /// `None` when the device is outside the pass device mask.
    area: Option<Rect>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceState {
    pipeline: Option<PipelineDesc>,
    vertex: Option<BufferHandle>,
    index: Option<BufferHandle>,
    uniform: Option<BufferHandle>,
    storage: Option<BufferHandle>,
    pass: Option<ActivePass>,
}

/// Placement of an image in memory as seen by the executor.
struct ImageView {
    bound: Bound,
    width: u32,
    height: u32,
    device_count: u32,
}

impl ImageView {
    fn full(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn texel_offset(&self, x: i32, y: i32) -> u64 {
        self.bound.offset + (y as u64 * self.width as u64 + x as u64) * TEXEL
    }

    fn instance_at(&self, device: u32, x: i32, y: i32) -> Result<u32, DriverError> {
        match &self.bound.routing {
            MemoryBinding::Local => Ok(device),
            MemoryBinding::DeviceIndices(indices) => Ok(indices[device as usize]),
            MemoryBinding::SplitInstance(rects) => {
                let n = self.device_count as usize;
                let row = &rects[device as usize * n..(device as usize + 1) * n];
                row.iter()
                    .position(|r| r.contains(x as i64, y as i64))
                    .map(|m| m as u32)
                    .ok_or_else(|| {
                        DriverError::InvalidCommand(format!(
                            "device {} reaches pixel ({}, {}) through no split-instance rect",
                            device, x, y
                        ))
                    })
            }
        }
    }
}

pub(super) struct Executor<'a> {
    dev: &'a mut LogicalDevice,
    peers: &'a PeerFeatureTable,
    faults: FaultInjection,
    states: Vec<DeviceState>,
}

impl<'a> Executor<'a> {
    pub fn new(
        dev: &'a mut LogicalDevice,
        peers: &'a PeerFeatureTable,
        faults: FaultInjection,
    ) -> Self {
        let states = vec![DeviceState::default(); dev.device_count as usize];
        Self {
            dev,
            peers,
            faults,
            states,
        }
    }

    pub fn run(&mut self, commands: &CommandBuffer, submit_mask: DeviceMask) -> Result<(), DriverError> {
        let mut mask = submit_mask;
        for (i, command) in commands.commands().iter().enumerate() {
            if let Command::SetDeviceMask(next) = command {
                if next.is_empty() || (*next & submit_mask) != *next {
                    return Err(DriverError::InvalidCommand(format!(
                        "device mask {} is not within submission mask {}",
                        next, submit_mask
                    )));
                }
                mask = *next;
                continue;
            }
            for device in mask.indices() {
                self.execute(device, command).inspect_err(|err| {
                    trace!("Command {} failed on device {}: {}", i, device, err);
                })?;
            }
        }
        if let Some(device) = submit_mask
            .indices()
            .find(|&d| self.states[d as usize].pass.is_some())
        {
            return Err(DriverError::InvalidCommand(format!(
                "render pass still open on device {} at end of submission",
                device
            )));
        }
        Ok(())
    }

    fn execute(&mut self, device: u32, command: &Command) -> Result<(), DriverError> {
        match command {
            Command::SetDeviceMask(_) => Ok(()),
            Command::PipelineBarrier(barrier) => self.barrier(device, barrier),
            Command::CopyBuffer { src, dst, region } => {
                self.no_pass(device, "buffer copy")?;
                let data = self.read_buffer(device, *src, region.src_offset, region.size, AccessKind::CopyRead)?;
                self.write_buffer(device, *dst, region.dst_offset, &data, AccessKind::CopyWrite)
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                region,
            } => {
                self.no_pass(device, "image copy")?;
                self.expect_layout(*src, device, *src_layout, ImageLayout::TransferSrc)?;
                self.expect_layout(*dst, device, *dst_layout, ImageLayout::TransferDst)?;
                let texels = self.read_texels(device, *src, region.region, AccessKind::CopyRead)?;
                self.write_texels(
                    device,
                    *dst,
                    region.region,
                    &texels,
                    AccessKind::CopyWrite,
                    self.faults.misroute_peer_writes,
                )
            }
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                region,
            } => {
                self.no_pass(device, "image to buffer copy")?;
                self.expect_layout(*src, device, *src_layout, ImageLayout::TransferSrc)?;
                self.copy_image_to_buffer(device, *src, *dst, region)
            }
            Command::BindPipeline(pipeline) => {
                self.states[device as usize].pipeline = Some(*pipeline);
                Ok(())
            }
            Command::BindVertexBuffer(buffer) => {
                self.states[device as usize].vertex = Some(*buffer);
                Ok(())
            }
            Command::BindIndexBuffer(buffer) => {
                self.states[device as usize].index = Some(*buffer);
                Ok(())
            }
            Command::BindUniformBuffer(buffer) => {
                self.states[device as usize].uniform = Some(*buffer);
                Ok(())
            }
            Command::BindStorageBuffer(buffer) => {
                self.states[device as usize].storage = Some(*buffer);
                Ok(())
            }
            Command::BeginRenderPass {
                target,
                clear_color,
                device_mask,
                device_render_areas,
            } => self.begin_render_pass(device, *target, *clear_color, *device_mask, device_render_areas),
            Command::DrawIndexed { index_count } => self.draw_indexed(device, *index_count),
            Command::EndRenderPass => {
                if self.states[device as usize].pass.take().is_none() {
                    return Err(DriverError::InvalidCommand(
                        "end of render pass without a matching begin".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn no_pass(&self, device: u32, what: &str) -> Result<(), DriverError> {
        if self.states[device as usize].pass.is_some() {
            return Err(DriverError::InvalidCommand(format!(
                "{} inside a render pass on device {}",
                what, device
            )));
        }
        Ok(())
    }

    fn layout(&self, image: ImageHandle, device: u32) -> ImageLayout {
        self.dev
            .layouts
            .get(&(image, device))
            .copied()
            .unwrap_or_default()
    }

    /// The recorded layout must name `required` and the image must be in it.
    fn expect_layout(
        &self,
        image: ImageHandle,
        device: u32,
        recorded: ImageLayout,
        required: ImageLayout,
    ) -> Result<(), DriverError> {
        if recorded != required {
            return Err(DriverError::InvalidCommand(format!(
                "image#{} recorded in {:?}, copy needs {:?}",
                image.0, recorded, required
            )));
        }
        let found = self.layout(image, device);
        if found != required {
            return Err(DriverError::LayoutMismatch {
                device,
                expected: required,
                found,
            });
        }
        Ok(())
    }

    fn barrier(&mut self, device: u32, barrier: &Barrier) -> Result<(), DriverError> {
        let Barrier::Image {
            image,
            old_layout,
            new_layout,
            ..
        } = *barrier
        else {
            return Ok(());
        };
        self.image_view(image)?;
        let found = self.layout(image, device);
        if old_layout != ImageLayout::Undefined && old_layout != found {
            return Err(DriverError::LayoutMismatch {
                device,
                expected: old_layout,
                found,
            });
        }
        self.dev.layouts.insert((image, device), new_layout);
        Ok(())
    }

    fn buffer_bound(&self, buffer: BufferHandle) -> Result<(Bound, u64), DriverError> {
        let object = self
            .dev
            .buffers
            .get(&buffer)
            .ok_or_else(|| DriverError::InvalidHandle(format!("buffer#{}", buffer.0)))?;
        let bound = object.bound.clone().ok_or_else(|| {
            DriverError::InvalidCommand(format!("buffer#{} has no memory bound", buffer.0))
        })?;
        Ok((bound, object.desc.size))
    }

    fn image_view(&self, image: ImageHandle) -> Result<ImageView, DriverError> {
        let object = self
            .dev
            .images
            .get(&image)
            .ok_or_else(|| DriverError::InvalidHandle(format!("image#{}", image.0)))?;
        let bound = object.bound.clone().ok_or_else(|| {
            DriverError::InvalidCommand(format!("image#{} has no memory bound", image.0))
        })?;
        Ok(ImageView {
            bound,
            width: object.desc.extent.width,
            height: object.desc.extent.height,
            device_count: self.dev.device_count,
        })
    }

    /// Storage key of `instance` for `device`, after the peer feature check.
    fn access(
        &self,
        memory: MemoryHandle,
        device: u32,
        instance: u32,
        kind: AccessKind,
    ) -> Result<u32, DriverError> {
        let mem = self.dev.memory(memory)?;
        let key = mem.resolve(device, instance)?;
        if mem.is_remote(device, instance) {
            let features = self.peers.get(mem.heap_index, device, instance);
            if !features.supports(kind.feature()) {
                return Err(DriverError::PeerAccessDenied {
                    device,
                    instance,
                    heap: mem.heap_index,
                    feature: PeerFeatures::name(kind.feature()),
                });
            }
        }
        Ok(key)
    }

    fn buffer_instance(bound: &Bound, device: u32) -> Result<u32, DriverError> {
        match &bound.routing {
            MemoryBinding::Local => Ok(device),
            MemoryBinding::DeviceIndices(indices) => Ok(indices[device as usize]),
            MemoryBinding::SplitInstance(_) => Err(DriverError::InvalidCommand(
                "buffer bound with split-instance rects".into(),
            )),
        }
    }

    fn check_buffer_range(buffer: BufferHandle, size: u64, offset: u64, len: u64) -> Result<(), DriverError> {
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(DriverError::InvalidCommand(format!(
                "range {}+{} outside buffer#{} of {} bytes",
                offset, len, buffer.0, size
            )));
        }
        Ok(())
    }

    fn read_buffer(
        &self,
        device: u32,
        buffer: BufferHandle,
        offset: u64,
        len: u64,
        kind: AccessKind,
    ) -> Result<Vec<u8>, DriverError> {
        let (bound, size) = self.buffer_bound(buffer)?;
        Self::check_buffer_range(buffer, size, offset, len)?;
        let instance = Self::buffer_instance(&bound, device)?;
        let key = self.access(bound.memory, device, instance, kind)?;
        Ok(self
            .dev
            .memory(bound.memory)?
            .read(key, bound.offset + offset, len)?
            .to_vec())
    }

    fn write_buffer(
        &mut self,
        device: u32,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
        kind: AccessKind,
    ) -> Result<(), DriverError> {
        let (bound, size) = self.buffer_bound(buffer)?;
        Self::check_buffer_range(buffer, size, offset, data.len() as u64)?;
        let instance = Self::buffer_instance(&bound, device)?;
        let key = self.access(bound.memory, device, instance, kind)?;
        self.dev
            .memory_mut(bound.memory)?
            .write(key, bound.offset + offset, data)
    }

    fn check_region(image: ImageHandle, view: &ImageView, region: Rect) -> Result<(), DriverError> {
        if region.is_empty() || region.intersection(&view.full()) != Some(region) {
            return Err(DriverError::InvalidCommand(format!(
                "region {:?} outside image#{} ({}x{})",
                region, image.0, view.width, view.height
            )));
        }
        Ok(())
    }

    /// Reads `region` texel by texel, row-major.
    fn read_texels(
        &self,
        device: u32,
        image: ImageHandle,
        region: Rect,
        kind: AccessKind,
    ) -> Result<Vec<[u8; 4]>, DriverError> {
        let view = self.image_view(image)?;
        Self::check_region(image, &view, region)?;
        let mem = self.dev.memory(view.bound.memory)?;
        let mut keys: HashMap<u32, u32> = HashMap::new();
        let mut texels = Vec::with_capacity(region.area() as usize);
        for y in region.y..region.bottom() as i32 {
            for x in region.x..region.right() as i32 {
                let instance = view.instance_at(device, x, y)?;
                let key = match keys.get(&instance) {
                    Some(key) => *key,
                    None => {
                        let key = self.access(view.bound.memory, device, instance, kind)?;
                        keys.insert(instance, key);
                        key
                    }
                };
                let bytes = mem.read(key, view.texel_offset(x, y), TEXEL)?;
                texels.push([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        Ok(texels)
    }

    /// Writes `texels` (row-major over `region`).
    ///
    /// With `misroute` set, a texel headed for another device's instance is
    /// written to the executing device's own instance.
    fn write_texels(
        &mut self,
        device: u32,
        image: ImageHandle,
        region: Rect,
        texels: &[[u8; 4]],
        kind: AccessKind,
        misroute: bool,
    ) -> Result<(), DriverError> {
        let view = self.image_view(image)?;
        Self::check_region(image, &view, region)?;
        let mut keys: HashMap<u32, u32> = HashMap::new();
        let mut writes = Vec::with_capacity(texels.len());
        let mut i = 0;
        for y in region.y..region.bottom() as i32 {
            for x in region.x..region.right() as i32 {
                let instance = view.instance_at(device, x, y)?;
                let key = match keys.get(&instance) {
                    Some(key) => *key,
                    None => {
                        let mut key = self.access(view.bound.memory, device, instance, kind)?;
                        let mem = self.dev.memory(view.bound.memory)?;
                        if misroute && mem.is_remote(device, instance) {
                            key = mem.resolve(device, device)?;
                        }
                        keys.insert(instance, key);
                        key
                    }
                };
                writes.push((key, view.texel_offset(x, y), texels[i]));
                i += 1;
            }
        }
        let mem = self.dev.memory_mut(view.bound.memory)?;
        for (key, offset, texel) in writes {
            mem.write(key, offset, &texel)?;
        }
        Ok(())
    }

    /// Writes one texel per plotted pixel through the render target binding.
    fn write_pixels(
        &mut self,
        device: u32,
        image: ImageHandle,
        pixels: &[(i32, i32)],
        texel: [u8; 4],
    ) -> Result<(), DriverError> {
        let view = self.image_view(image)?;
        let mut keys: HashMap<u32, u32> = HashMap::new();
        let mut writes = Vec::with_capacity(pixels.len());
        for &(x, y) in pixels {
            let instance = view.instance_at(device, x, y)?;
            let key = match keys.get(&instance) {
                Some(key) => *key,
                None => {
                    let key =
                        self.access(view.bound.memory, device, instance, AccessKind::GenericWrite)?;
                    keys.insert(instance, key);
                    key
                }
            };
            writes.push((key, view.texel_offset(x, y)));
        }
        let mem = self.dev.memory_mut(view.bound.memory)?;
        for (key, offset) in writes {
            mem.write(key, offset, &texel)?;
        }
        Ok(())
    }

    fn copy_image_to_buffer(
        &mut self,
        device: u32,
        src: ImageHandle,
        dst: BufferHandle,
        copy: &BufferImageCopy,
    ) -> Result<(), DriverError> {
        let region = copy.region;
        let row_length = if copy.row_length == 0 {
            region.width
        } else {
            copy.row_length
        };
        if row_length < region.width {
            return Err(DriverError::InvalidCommand(format!(
                "row length {} shorter than region width {}",
                row_length, region.width
            )));
        }
        let texels = self.read_texels(device, src, region, AccessKind::CopyRead)?;
        let row_bytes = row_length as u64 * TEXEL;
        for (row, chunk) in texels.chunks(region.width as usize).enumerate() {
            let bytes: Vec<u8> = chunk.iter().flatten().copied().collect();
            let offset = copy.buffer_offset + row as u64 * row_bytes;
            self.write_buffer(device, dst, offset, &bytes, AccessKind::CopyWrite)?;
        }
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        device: u32,
        target: ImageHandle,
        clear_color: [f32; 4],
        pass_mask: DeviceMask,
        areas: &[Rect],
    ) -> Result<(), DriverError> {
        if self.states[device as usize].pass.is_some() {
            return Err(DriverError::InvalidCommand(
                "render pass begun inside another".into(),
            ));
        }
        if areas.len() != self.dev.device_count as usize {
            return Err(DriverError::InvalidCommand(format!(
                "{} render areas for {} devices",
                areas.len(),
                self.dev.device_count
            )));
        }
        let view = self.image_view(target)?;
        if !pass_mask.includes(device) {
            self.states[device as usize].pass = Some(ActivePass { target, area: None });
            return Ok(());
        }

        let found = self.layout(target, device);
        if found != ImageLayout::ColorAttachment {
            return Err(DriverError::LayoutMismatch {
                device,
                expected: ImageLayout::ColorAttachment,
                found,
            });
        }
        let area = areas[device as usize]
            .intersection(&view.full())
            .unwrap_or(Rect::ZERO);
        self.states[device as usize].pass = Some(ActivePass {
            target,
            area: Some(area),
        });

        let mut pixels = Vec::with_capacity(area.area() as usize);
        for y in area.y..area.bottom() as i32 {
            for x in area.x..area.right() as i32 {
                pixels.push((x, y));
            }
        }
        self.write_pixels(device, target, &pixels, Format::Rgba8Unorm.encode(clear_color))
    }

    fn bound_buffer(slot: Option<BufferHandle>, what: &str) -> Result<BufferHandle, DriverError> {
        slot.ok_or_else(|| DriverError::InvalidCommand(format!("draw without a bound {} buffer", what)))
    }

    fn draw_indexed(&mut self, device: u32, index_count: u32) -> Result<(), DriverError> {
        let state = self.states[device as usize];
        let Some(pass) = state.pass else {
            return Err(DriverError::InvalidCommand("draw outside a render pass".into()));
        };
        let Some(area) = pass.area else {
            return Ok(());
        };
        let pipeline = state
            .pipeline
            .ok_or_else(|| DriverError::InvalidCommand("draw without a bound pipeline".into()))?;

        let index_buffer = Self::bound_buffer(state.index, "index")?;
        let index_bytes = self.read_buffer(
            device,
            index_buffer,
            0,
            index_count as u64 * 4,
            AccessKind::GenericRead,
        )?;
        let indices: Vec<u32> = index_bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<u32>)
            .collect();

        let vertex_buffer = Self::bound_buffer(state.vertex, "vertex")?;
        let vertex_count = indices.iter().max().map_or(0, |&i| i as u64 + 1);
        let stride = std::mem::size_of::<Vertex>() as u64;
        let vertex_bytes = self.read_buffer(
            device,
            vertex_buffer,
            0,
            vertex_count * stride,
            AccessKind::GenericRead,
        )?;
        let vertices: Vec<Vertex> = vertex_bytes
            .chunks_exact(stride as usize)
            .map(bytemuck::pod_read_unaligned::<Vertex>)
            .collect();

        let uniform_buffer = Self::bound_buffer(state.uniform, "uniform")?;
        let uniform_bytes = self.read_buffer(
            device,
            uniform_buffer,
            0,
            std::mem::size_of::<ColorUniform>() as u64,
            AccessKind::GenericRead,
        )?;
        let color: ColorUniform = bytemuck::pod_read_unaligned(&uniform_bytes);

        let segments = if pipeline.tessellated {
            let storage_buffer = Self::bound_buffer(state.storage, "storage")?;
            let level_bytes =
                self.read_buffer(device, storage_buffer, 0, 4, AccessKind::GenericRead)?;
            Some(raster::tess_segments(bytemuck::pod_read_unaligned::<f32>(
                &level_bytes,
            )))
        } else {
            None
        };

        let view = self.image_view(pass.target)?;
        let extent = crate::driver::Extent::new(view.width, view.height);
        let mut pixels = Vec::new();
        let mut plot = |x: i32, y: i32| pixels.push((x, y));
        for tri in indices.chunks_exact(3) {
            let patch = [
                vertices[tri[0] as usize].position,
                vertices[tri[1] as usize].position,
                vertices[tri[2] as usize].position,
            ];
            match segments {
                Some(segments) => {
                    for triangle in raster::tessellate_sphere_patch(patch, segments) {
                        raster::draw_triangle(triangle, pipeline.polygon_mode, extent, area, &mut plot);
                    }
                }
                None => raster::draw_triangle(patch, pipeline.polygon_mode, extent, area, &mut plot),
            }
        }
        trace!("Device {} draw covered {} pixels", device, pixels.len());
        self.write_pixels(
            device,
            pass.target,
            &pixels,
            Format::Rgba8Unorm.encode(color.color),
        )
    }
}
