//! Cross-device transfer protocol.
//!
//! Pixels rendered on `second` reach `first` through shared memory: a peer
//! view of the render target is bound with swapped device indices, so a
//! copy executed on `second` into the peer view lands in `first`'s
//! instance. Every step is submitted alone and fence-waited before the next
//! one starts; no semaphores are used between devices.

use crate::driver::{
    Access, Barrier, BufferHandle, BufferImageCopy, Command, CommandBuffer, ImageCopy, ImageDesc,
    ImageHandle, ImageLayout, MemoryBinding, MemoryHandle, Rect, ResourceHandle,
};
use crate::error::DriverError;
use crate::group::DeviceMask;
use crate::partition::DevicePair;
use crate::traits::DeviceGroupDriver;
use log::debug;
use std::time::Duration;

/// A copy from the rendered image into its peer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferJob {
    pub source: ImageHandle,
    pub peer: ImageHandle,
    pub region: Rect,
    /// Device whose command buffer performs the copy.
    pub device: u32,
}

/// Host-visible buffer the result is copied into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackTarget {
    pub buffer: BufferHandle,
    pub memory: MemoryHandle,
    pub size: u64,
}

/// Submits `commands` on `mask` and blocks on the fence.
pub fn submit_and_wait(
    driver: &mut dyn DeviceGroupDriver,
    commands: &CommandBuffer,
    mask: DeviceMask,
    timeout: Duration,
) -> Result<(), DriverError> {
    let fence = driver.submit(commands, mask)?;
    driver.wait_for_fence(fence, timeout)
}

/// Creates the peer view of the render target.
///
/// The view aliases `memory` and routes each device of the pair to its
/// partner's instance; other devices keep their own.
pub fn create_peer_handle(
    driver: &mut dyn DeviceGroupDriver,
    desc: &ImageDesc,
    memory: MemoryHandle,
    pair: DevicePair,
    device_count: u32,
) -> Result<ImageHandle, DriverError> {
    let image = driver.create_image(desc)?;
    driver.bind_memory(
        ResourceHandle::Image(image),
        memory,
        0,
        &MemoryBinding::DeviceIndices(pair.swapped_indices(device_count)),
    )?;
    Ok(image)
}

/// Appends the attachment to transfer-source transition of the rendered image.
pub fn record_source_transition(commands: &mut CommandBuffer, image: ImageHandle) {
    commands.image_barrier(
        image,
        (Access::COLOR_ATTACHMENT_WRITE, ImageLayout::ColorAttachment),
        (Access::TRANSFER_READ, ImageLayout::TransferSrc),
    );
}

/// Copies `job.region` into the peer view on `job.device` alone.
pub fn copy_to_peer(
    driver: &mut dyn DeviceGroupDriver,
    job: &TransferJob,
    timeout: Duration,
) -> Result<(), DriverError> {
    let mut commands = CommandBuffer::new();
    commands
        .image_barrier(
            job.peer,
            (Access::NONE, ImageLayout::Undefined),
            (Access::TRANSFER_WRITE, ImageLayout::TransferDst),
        )
        .push(Command::CopyImage {
            src: job.source,
            src_layout: ImageLayout::TransferSrc,
            dst: job.peer,
            dst_layout: ImageLayout::TransferDst,
            region: ImageCopy { region: job.region },
        })
        .image_barrier(
            job.peer,
            (Access::TRANSFER_WRITE, ImageLayout::TransferDst),
            (Access::TRANSFER_READ, ImageLayout::TransferSrc),
        );
    debug!(
        "Peer copy of {:?} on device {}",
        job.region, job.device
    );
    submit_and_wait(driver, &commands, DeviceMask::single(job.device), timeout)
}

/// Copies the whole `view` into the readback buffer on `device`, then
/// invalidates the mapping and returns the bytes.
pub fn read_back(
    driver: &mut dyn DeviceGroupDriver,
    view: ImageHandle,
    area: Rect,
    target: &ReadbackTarget,
    device: u32,
    timeout: Duration,
) -> Result<Vec<u8>, DriverError> {
    let mut commands = CommandBuffer::new();
    commands
        .image_barrier(
            view,
            (Access::NONE, ImageLayout::Undefined),
            (Access::TRANSFER_READ, ImageLayout::TransferSrc),
        )
        .push(Command::CopyImageToBuffer {
            src: view,
            src_layout: ImageLayout::TransferSrc,
            dst: target.buffer,
            region: BufferImageCopy {
                buffer_offset: 0,
                row_length: area.width,
                region: area,
            },
        })
        .barrier(Barrier::Buffer {
            buffer: target.buffer,
            src: Access::TRANSFER_WRITE,
            dst: Access::HOST_READ,
        });
    submit_and_wait(driver, &commands, DeviceMask::single(device), timeout)?;

    driver.invalidate_mapped(target.memory, 0, target.size)?;
    driver.read_mapped(target.memory, 0, target.size)
}
