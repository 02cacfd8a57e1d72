//! Command buffer recording.
//!
//! Commands are recorded as plain data and handed to the driver on submit.
//! Each physical device named by the submission mask executes the whole
//! list; `SetDeviceMask` narrows which of those devices run the following
//! commands.

use super::{BufferHandle, ImageHandle, Rect};
use crate::group::DeviceMask;

/// Memory access kinds used in barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Access(pub u32);

impl Access {
    pub const NONE: Self = Self(0);
    pub const HOST_WRITE: Self = Self(1 << 0);
    pub const HOST_READ: Self = Self(1 << 1);
    pub const TRANSFER_READ: Self = Self(1 << 2);
    pub const TRANSFER_WRITE: Self = Self(1 << 3);
    pub const VERTEX_ATTRIBUTE_READ: Self = Self(1 << 4);
    pub const INDEX_READ: Self = Self(1 << 5);
    pub const UNIFORM_READ: Self = Self(1 << 6);
    pub const SHADER_READ: Self = Self(1 << 7);
    pub const COLOR_ATTACHMENT_WRITE: Self = Self(1 << 8);
}

impl std::ops::BitOr for Access {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Image layouts tracked by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    ColorAttachment,
    TransferSrc,
    TransferDst,
}

/// Pipeline barrier variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Memory {
        src: Access,
        dst: Access,
    },
    Buffer {
        buffer: BufferHandle,
        src: Access,
        dst: Access,
    },
    Image {
        image: ImageHandle,
        src: Access,
        dst: Access,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    },
}

/// Buffer-to-buffer copy region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Image-to-image copy region; source and destination use the same rect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopy {
    pub region: Rect,
}

/// Image-to-buffer copy; rows are tightly packed at `row_length` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub row_length: u32,
    pub region: Rect,
}

/// Rasterizer polygon mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Fixed graphics pipeline built by the test.
///
/// The vertex stage passes `vec4` positions through, the fragment stage
/// writes the colour held by the uniform buffer. When `tessellated` is set
/// each index triple is a patch tessellated at the level read from the
/// storage buffer and projected onto the unit sphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineDesc {
    pub tessellated: bool,
    pub polygon_mode: PolygonMode,
}

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDeviceMask(DeviceMask),
    PipelineBarrier(Barrier),
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        region: BufferCopy,
    },
    CopyImage {
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        region: ImageCopy,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: BufferHandle,
        region: BufferImageCopy,
    },
    BindPipeline(PipelineDesc),
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    BindUniformBuffer(BufferHandle),
    BindStorageBuffer(BufferHandle),
    BeginRenderPass {
        target: ImageHandle,
        clear_color: [f32; 4],
        /// Devices that take part in the pass.
        device_mask: DeviceMask,
        /// Render area per device index; empty rects for idle devices.
        device_render_areas: Vec<Rect>,
    },
    DrawIndexed {
        index_count: u32,
    },
    EndRenderPass,
}

/// An ordered list of commands, recorded once and submitted once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set_device_mask(&mut self, mask: DeviceMask) -> &mut Self {
        self.push(Command::SetDeviceMask(mask))
    }

    pub fn barrier(&mut self, barrier: Barrier) -> &mut Self {
        self.push(Command::PipelineBarrier(barrier))
    }

    pub fn image_barrier(
        &mut self,
        image: ImageHandle,
        (src, old_layout): (Access, ImageLayout),
        (dst, new_layout): (Access, ImageLayout),
    ) -> &mut Self {
        self.barrier(Barrier::Image {
            image,
            src,
            dst,
            old_layout,
            new_layout,
        })
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) -> &mut Self {
        self.push(Command::CopyBuffer {
            src,
            dst,
            region: BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_keeps_order() {
        let mut cmd = CommandBuffer::new();
        assert!(cmd.is_empty());

        cmd.set_device_mask(DeviceMask::single(1))
            .copy_buffer(BufferHandle(1), BufferHandle(2), 64)
            .push(Command::DrawIndexed { index_count: 3 });

        assert_eq!(cmd.commands().len(), 3);
        assert_eq!(cmd.commands()[0], Command::SetDeviceMask(DeviceMask::single(1)));
        assert!(matches!(
            cmd.commands()[1],
            Command::CopyBuffer {
                region: BufferCopy { size: 64, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_image_barrier_fields() {
        let mut cmd = CommandBuffer::new();
        cmd.image_barrier(
            ImageHandle(7),
            (Access::COLOR_ATTACHMENT_WRITE, ImageLayout::ColorAttachment),
            (Access::TRANSFER_READ, ImageLayout::TransferSrc),
        );
        match cmd.commands()[0] {
            Command::PipelineBarrier(Barrier::Image {
                image,
                old_layout,
                new_layout,
                ..
            }) => {
                assert_eq!(image, ImageHandle(7));
                assert_eq!(old_layout, ImageLayout::ColorAttachment);
                assert_eq!(new_layout, ImageLayout::TransferSrc);
            }
            ref other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_default_layout_is_undefined() {
        assert_eq!(ImageLayout::default(), ImageLayout::Undefined);
    }
}
