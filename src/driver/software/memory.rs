//! Memory objects of the simulated device group.
//!
//! A multi-instance allocation keeps one byte vector per device in its
//! mask. Anything else keeps a single instance that every device sees.
//! Non-coherent host-visible memory also keeps a host shadow that only
//! flush and invalidate move data through.

use crate::driver::{MemoryHandle, MemoryPropertyFlags, ResourceHandle};
use crate::error::DriverError;
use crate::group::DeviceMask;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;

/// Instance key used by single-instance allocations.
const SHARED: u32 = 0;

pub(super) struct MemoryObject {
    pub handle: MemoryHandle,
    pub size: u64,
    pub type_index: u32,
    pub heap_index: u32,
    pub flags: MemoryPropertyFlags,
    pub device_mask: DeviceMask,
    pub multi_instance: bool,
    pub dedicated: Option<ResourceHandle>,
    /// Resources currently bound to this allocation.
    pub bound: usize,
    instances: BTreeMap<u32, Vec<u8>>,
    host: Option<Vec<u8>>,
}

fn garbage(size: u64, seed: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; size as usize];
    StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
    bytes
}

pub(super) struct MemoryLayout {
    pub size: u64,
    pub type_index: u32,
    pub heap_index: u32,
    pub flags: MemoryPropertyFlags,
    pub device_mask: DeviceMask,
    pub heap_multi_instance: bool,
    pub dedicated: Option<ResourceHandle>,
}

impl MemoryObject {
    /// Creates the allocation with every instance filled with seeded noise.
    pub fn new(handle: MemoryHandle, layout: MemoryLayout, seed: u64) -> Self {
        let multi_instance = layout.heap_multi_instance;
        let base = seed ^ handle.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let mut instances = BTreeMap::new();
        if multi_instance {
            for device in layout.device_mask.indices() {
                instances.insert(device, garbage(layout.size, base.wrapping_add(device as u64 + 1)));
            }
        } else {
            instances.insert(SHARED, garbage(layout.size, base));
        }

        let host = (layout.flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
            && !layout.flags.contains(MemoryPropertyFlags::HOST_COHERENT))
        .then(|| garbage(layout.size, !base));

        Self {
            handle,
            size: layout.size,
            type_index: layout.type_index,
            heap_index: layout.heap_index,
            flags: layout.flags,
            device_mask: layout.device_mask,
            multi_instance,
            dedicated: layout.dedicated,
            bound: 0,
            instances,
            host,
        }
    }

    /// True if `device` reaching `instance` crosses to another device's memory.
    pub fn is_remote(&self, device: u32, instance: u32) -> bool {
        self.multi_instance && device != instance
    }

    /// Storage key for `instance` as reached by `device`.
    pub fn resolve(&self, device: u32, instance: u32) -> Result<u32, DriverError> {
        if !self.multi_instance {
            return Ok(SHARED);
        }
        if self.instances.contains_key(&instance) {
            Ok(instance)
        } else {
            Err(DriverError::MissingInstance {
                device,
                instance,
                memory: self.handle.0,
            })
        }
    }

    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, DriverError> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(DriverError::InvalidParameter(format!(
                "range {}+{} outside memory #{} of {} bytes",
                offset, len, self.handle.0, self.size
            ))),
        }
    }

    pub fn read(&self, key: u32, offset: u64, len: u64) -> Result<&[u8], DriverError> {
        let range = self.range(offset, len)?;
        let bytes = self.instance(key)?;
        Ok(&bytes[range])
    }

    pub fn write(&mut self, key: u32, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        let range = self.range(offset, data.len() as u64)?;
        let bytes = self.instance_mut(key)?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn instance(&self, key: u32) -> Result<&Vec<u8>, DriverError> {
        self.instances
            .get(&key)
            .ok_or_else(|| DriverError::InvalidHandle(format!("instance {} of memory #{}", key, self.handle.0)))
    }

    fn instance_mut(&mut self, key: u32) -> Result<&mut Vec<u8>, DriverError> {
        let handle = self.handle.0;
        self.instances
            .get_mut(&key)
            .ok_or_else(|| DriverError::InvalidHandle(format!("instance {} of memory #{}", key, handle)))
    }

    fn check_mappable(&self) -> Result<(), DriverError> {
        if !self.flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(DriverError::MapFailed {
                memory: self.handle.0,
                reason: "memory type is not host visible",
            });
        }
        if self.multi_instance && self.instances.len() > 1 {
            return Err(DriverError::MapFailed {
                memory: self.handle.0,
                reason: "allocation has more than one instance",
            });
        }
        Ok(())
    }

    fn mapped_key(&self) -> Result<u32, DriverError> {
        self.instances
            .keys()
            .next()
            .copied()
            .ok_or_else(|| DriverError::InvalidHandle(format!("memory #{}", self.handle.0)))
    }

    pub fn host_write(&mut self, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        self.check_mappable()?;
        let range = self.range(offset, data.len() as u64)?;
        match self.host.as_mut() {
            Some(host) => host[range].copy_from_slice(data),
            None => {
                let key = self.mapped_key()?;
                self.instance_mut(key)?[range].copy_from_slice(data);
            }
        }
        Ok(())
    }

    pub fn host_read(&self, offset: u64, len: u64) -> Result<Vec<u8>, DriverError> {
        self.check_mappable()?;
        let range = self.range(offset, len)?;
        match self.host.as_ref() {
            Some(host) => Ok(host[range].to_vec()),
            None => Ok(self.instance(self.mapped_key()?)?[range].to_vec()),
        }
    }

    /// Host shadow to device instance.
    pub fn flush(&mut self, offset: u64, len: u64) -> Result<(), DriverError> {
        self.check_mappable()?;
        let range = self.range(offset, len)?;
        let key = self.mapped_key()?;
        if let Some(host) = self.host.take() {
            let result = self
                .instance_mut(key)
                .map(|bytes| bytes[range.clone()].copy_from_slice(&host[range]));
            self.host = Some(host);
            result?;
        }
        Ok(())
    }

    /// Device instance to host shadow.
    pub fn invalidate(&mut self, offset: u64, len: u64) -> Result<(), DriverError> {
        self.check_mappable()?;
        let range = self.range(offset, len)?;
        let key = self.mapped_key()?;
        let device_bytes = self.instance(key)?[range.clone()].to_vec();
        if let Some(host) = self.host.as_mut() {
            host[range].copy_from_slice(&device_bytes);
        }
        Ok(())
    }
}
