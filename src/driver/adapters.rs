//! Real adapter probing.
//!
//! wgpu has no device-group API, so physical adapters can be listed but
//! not driven. Hardware adapters reporting the same PCI vendor and device
//! id on the same backend are reported together as candidates for a
//! linked group.

use wgpu::{Backend, Backends, DeviceType, Instance, InstanceDescriptor};

/// One enumerated adapter, reduced to what group matching needs.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Index in the enumerated list.
    pub index: usize,
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub backend: Backend,
    pub device_type: DeviceType,
}

impl AdapterInfo {
    fn from_wgpu(index: usize, info: wgpu::AdapterInfo) -> Self {
        Self {
            index,
            name: info.name,
            vendor_id: info.vendor,
            device_id: info.device,
            backend: info.backend,
            device_type: info.device_type,
        }
    }

    /// Software and virtual adapters never join a device group.
    pub fn is_hardware(&self) -> bool {
        !matches!(self.device_type, DeviceType::Cpu | DeviceType::VirtualGpu)
    }

    fn group_key(&self) -> (u32, u32, Backend) {
        (self.vendor_id, self.device_id, self.backend)
    }
}

impl std::fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({:04x}:{:04x}, {:?}, {:?})",
            self.index, self.name, self.vendor_id, self.device_id, self.backend, self.device_type
        )
    }
}

/// Identical hardware adapters that could form one device group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateGroup {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub backend: Backend,
    /// Indices into the enumerated adapter list.
    pub adapters: Vec<usize>,
}

impl CandidateGroup {
    /// More than one adapter, so peer transfers are possible.
    pub fn is_multi_device(&self) -> bool {
        self.adapters.len() > 1
    }
}

impl std::fmt::Display for CandidateGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} x{} ({:?}): adapters {:?}",
            self.name,
            self.adapters.len(),
            self.backend,
            self.adapters
        )
    }
}

/// Lists every adapter wgpu can see. The list may be empty.
pub fn enumerate_adapters() -> Vec<AdapterInfo> {
    let instance = Instance::new(&InstanceDescriptor::default());
    instance
        .enumerate_adapters(Backends::all())
        .into_iter()
        .enumerate()
        .map(|(index, adapter)| AdapterInfo::from_wgpu(index, adapter.get_info()))
        .collect()
}

/// Groups hardware adapters by vendor, device and backend, keeping
/// enumeration order.
pub fn candidate_groups(adapters: &[AdapterInfo]) -> Vec<CandidateGroup> {
    let mut groups: Vec<CandidateGroup> = Vec::new();
    for adapter in adapters.iter().filter(|a| a.is_hardware()) {
        let key = adapter.group_key();
        match groups
            .iter_mut()
            .find(|g| (g.vendor_id, g.device_id, g.backend) == key)
        {
            Some(group) => group.adapters.push(adapter.index),
            None => groups.push(CandidateGroup {
                name: adapter.name.clone(),
                vendor_id: adapter.vendor_id,
                device_id: adapter.device_id,
                backend: adapter.backend,
                adapters: vec![adapter.index],
            }),
        }
    }
    groups
}
