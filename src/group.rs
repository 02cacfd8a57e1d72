//! Device group discovery and peer-access queries.
//!
//! A [`DeviceGroup`] is selected once per test case from platform
//! enumeration and stays immutable afterwards. Peer memory features are
//! queried lazily and cached in a [`PeerAccessMatrix`].

use crate::driver::{DeviceExtensions, Format};
use crate::error::VerifierError;
use crate::modes::TestMode;
use crate::traits::DeviceGroupDriver;
use log::{debug, info};
use std::collections::HashMap;

/// Largest group a device mask can describe.
pub const MAX_DEVICE_GROUP_SIZE: usize = 32;

/// Bit set over device indices within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DeviceMask(pub u32);

impl DeviceMask {
    pub const EMPTY: Self = Self(0);

    /// Mask naming a single device; empty past the last representable index.
    pub const fn single(index: u32) -> Self {
        match 1u32.checked_shl(index) {
            Some(bit) => Self(bit),
            None => Self::EMPTY,
        }
    }

    /// Mask naming every device of a group with `count` devices.
    pub const fn all(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    /// Mask naming both devices of a pair (one bit when they coincide).
    pub const fn pair(first: u32, second: u32) -> Self {
        Self(Self::single(first).0 | Self::single(second).0)
    }

    pub const fn includes(&self, index: u32) -> bool {
        index < 32 && (self.0 & (1 << index)) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// True if the mask only names devices in `[0, count)`.
    pub const fn within(&self, count: u32) -> bool {
        (self.0 & !Self::all(count).0) == 0
    }

    /// Device indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..32).filter(move |&i| self.includes(i))
    }
}

impl std::ops::BitOr for DeviceMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for DeviceMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indices: Vec<String> = self.indices().map(|i| i.to_string()).collect();
        write!(f, "{{{}}}", indices.join(","))
    }
}

/// Ways one device may access memory resident on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PeerFeatures(pub u32);

impl PeerFeatures {
    pub const NONE: Self = Self(0);
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const GENERIC_SRC: Self = Self(1 << 2);
    pub const GENERIC_DST: Self = Self(1 << 3);
    pub const ALL: Self = Self(0xF);

    pub const fn supports(&self, feature: Self) -> bool {
        (self.0 & feature.0) == feature.0
    }

    pub const fn without(self, feature: Self) -> Self {
        Self(self.0 & !feature.0)
    }

    pub fn name(feature: Self) -> &'static str {
        match feature {
            Self::COPY_SRC => "COPY_SRC",
            Self::COPY_DST => "COPY_DST",
            Self::GENERIC_SRC => "GENERIC_SRC",
            Self::GENERIC_DST => "GENERIC_DST",
            _ => "MULTIPLE",
        }
    }
}

impl std::ops::BitOr for PeerFeatures {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Handle of one physical device as enumerated by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalDeviceHandle(pub u32);

/// Which group, and which device inside it, a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupSelector {
    /// Index into the enumerated device groups.
    pub group_index: usize,
    /// Primary device within the group, used for memory and feature queries.
    pub device_index: usize,
}

/// The set of physical devices presented as one logical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    index: usize,
    devices: Vec<PhysicalDeviceHandle>,
    subset_allocation: bool,
}

impl DeviceGroup {
    /// Enumerates device groups and selects the one named by `selector`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConfiguration` if the platform cannot create device
    /// groups or the selector is out of range.
    pub fn discover(
        driver: &dyn DeviceGroupDriver,
        selector: GroupSelector,
    ) -> Result<Self, VerifierError> {
        if !driver.capabilities().device_group_creation {
            return Err(VerifierError::unsupported(
                "device group creation not supported by the platform",
            ));
        }

        let groups = driver.enumerate_device_groups();
        let Some(properties) = groups.get(selector.group_index) else {
            return Err(VerifierError::unsupported(format!(
                "device group {} not found ({} available)",
                selector.group_index,
                groups.len()
            )));
        };
        if properties.physical_devices.is_empty() {
            return Err(VerifierError::unsupported(format!(
                "device group {} has no physical devices",
                selector.group_index
            )));
        }
        if properties.physical_devices.len() > MAX_DEVICE_GROUP_SIZE {
            return Err(VerifierError::unsupported(format!(
                "device group {} has {} devices, at most {} are supported",
                selector.group_index,
                properties.physical_devices.len(),
                MAX_DEVICE_GROUP_SIZE
            )));
        }

        debug!(
            "Discovered device group {} with {} devices (subset allocation: {})",
            selector.group_index,
            properties.physical_devices.len(),
            properties.subset_allocation
        );

        Ok(Self {
            index: selector.group_index,
            devices: properties.physical_devices.clone(),
            subset_allocation: properties.subset_allocation,
        })
    }

    /// Index of this group in platform enumeration.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn devices(&self) -> &[PhysicalDeviceHandle] {
        &self.devices
    }

    /// Physical device at a group-local index.
    pub fn device(&self, index: u32) -> Option<PhysicalDeviceHandle> {
        self.devices.get(index as usize).copied()
    }

    /// Each device must back its own share of a logical allocation.
    pub fn subset_allocation(&self) -> bool {
        self.subset_allocation
    }

    /// Mask naming every device of the group.
    pub fn full_mask(&self) -> DeviceMask {
        DeviceMask::all(self.device_count())
    }

    /// Checks every capability the test mode needs, then creates the
    /// logical device with the matching extension list.
    ///
    /// Nothing is submitted here; every failure is `UnsupportedConfiguration`.
    pub fn open(
        &self,
        driver: &mut dyn DeviceGroupDriver,
        selector: GroupSelector,
        mode: TestMode,
    ) -> Result<PhysicalDeviceHandle, VerifierError> {
        let caps = driver.capabilities();
        if !caps.extensions.device_group {
            return Err(VerifierError::unsupported(
                "missing extension: device group",
            ));
        }

        let mut extensions = DeviceExtensions {
            device_group: true,
            ..DeviceExtensions::default()
        };

        if mode.dedicated() {
            if !caps.extensions.dedicated_allocation {
                return Err(VerifierError::unsupported(
                    "missing extension: dedicated allocation",
                ));
            }
            extensions.dedicated_allocation = true;
        }

        if mode.peer_fetch() && self.device_count() < 2 {
            return Err(VerifierError::unsupported(
                "peer fetch needs more than one physical device",
            ));
        }

        if !mode.afr() || self.device_count() > 1 {
            if !caps.extensions.bind_memory2 {
                return Err(VerifierError::unsupported("missing extension: bind memory 2"));
            }
            extensions.bind_memory2 = true;
        }

        let Some(primary) = self.device(selector.device_index as u32) else {
            return Err(VerifierError::unsupported(format!(
                "device {} not found in group {}",
                selector.device_index, self.index
            )));
        };

        let features = driver.physical_device_features(primary);
        if mode.tessellation() && !features.tessellation_shader {
            return Err(VerifierError::unsupported("tessellation is not supported"));
        }
        if mode.line_fill() && !features.fill_mode_non_solid {
            return Err(VerifierError::unsupported("line polygon mode is not supported"));
        }

        if mode.sfr() && !driver.supports_split_instance_bind(primary, Format::Rgba8Unorm) {
            return Err(VerifierError::unsupported("format not supported for SFR"));
        }

        driver.create_device(self.index, primary, extensions)?;
        let primary_name = driver
            .physical_device_info(primary)
            .map_or_else(|| format!("device {}", primary.0), |info| info.name);
        info!(
            "Opened device group {} ({} devices) on {}, primary {}",
            self.index,
            self.device_count(),
            driver.name(),
            primary_name
        );
        Ok(primary)
    }
}

/// Cache of peer memory features keyed by `(heap, src, dst)`.
#[derive(Debug, Default)]
pub struct PeerAccessMatrix {
    entries: HashMap<(u32, u32, u32), PeerFeatures>,
}

impl PeerAccessMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Features device `src` has on memory of type `memory_type_index`
    /// resident on device `dst`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConfiguration` if the group has fewer than two
    /// devices or the memory type does not exist.
    pub fn query_peer_features(
        &mut self,
        driver: &dyn DeviceGroupDriver,
        group: &DeviceGroup,
        memory_type_index: u32,
        src: u32,
        dst: u32,
    ) -> Result<PeerFeatures, VerifierError> {
        if group.device_count() < 2 {
            return Err(VerifierError::unsupported(
                "peer access needs at least two physical devices",
            ));
        }
        let Some(dst_device) = group.device(dst) else {
            return Err(VerifierError::unsupported(format!(
                "device {} not in group",
                dst
            )));
        };
        let props = driver.memory_properties(dst_device);
        let Some(memory_type) = props.types.get(memory_type_index as usize) else {
            return Err(VerifierError::unsupported(format!(
                "memory type {} not reported by device {}",
                memory_type_index, dst
            )));
        };
        let heap = memory_type.heap_index;

        if let Some(features) = self.entries.get(&(heap, src, dst)) {
            return Ok(*features);
        }
        let features = driver.peer_memory_features(heap, src, dst)?;
        debug!(
            "Peer features heap {} device {} -> {}: {:#x}",
            heap, src, dst, features.0
        );
        self.entries.insert((heap, src, dst), features);
        Ok(features)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PeerFeatureTable, SoftwareDriver, SoftwareGroup, SoftwarePlatform};

    fn driver_with(groups: Vec<SoftwareGroup>) -> SoftwareDriver {
        SoftwareDriver::new(SoftwarePlatform {
            groups,
            ..SoftwarePlatform::default()
        })
    }

    #[test]
    fn test_device_mask_basics() {
        let mask = DeviceMask::pair(0, 2);
        assert!(mask.includes(0));
        assert!(!mask.includes(1));
        assert!(mask.includes(2));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(mask.to_string(), "{0,2}");
        assert_eq!(DeviceMask::pair(1, 1), DeviceMask::single(1));
    }

    #[test]
    fn test_device_mask_out_of_range_index_is_empty() {
        assert_eq!(DeviceMask::single(31), DeviceMask(1 << 31));
        assert_eq!(DeviceMask::single(32), DeviceMask::EMPTY);
        assert_eq!(DeviceMask::pair(0, 40), DeviceMask::single(0));
        assert!(!DeviceMask::single(31).includes(32));
    }

    #[test]
    fn test_discover_rejects_oversized_group() {
        let driver = driver_with(vec![SoftwareGroup::new(33, true)]);
        let err = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("at most 32"));

        let driver = driver_with(vec![SoftwareGroup::new(32, true)]);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        assert_eq!(group.full_mask(), DeviceMask(u32::MAX));
    }

    #[test]
    fn test_device_mask_all_and_within() {
        assert_eq!(DeviceMask::all(1), DeviceMask(0b1));
        assert_eq!(DeviceMask::all(3), DeviceMask(0b111));
        assert_eq!(DeviceMask::all(32), DeviceMask(u32::MAX));
        assert!(DeviceMask::pair(0, 1).within(2));
        assert!(!DeviceMask::single(2).within(2));
    }

    #[test]
    fn test_peer_features_support() {
        let features = PeerFeatures::ALL.without(PeerFeatures::GENERIC_SRC);
        assert!(features.supports(PeerFeatures::COPY_SRC));
        assert!(!features.supports(PeerFeatures::GENERIC_SRC));
        assert_eq!(PeerFeatures::name(PeerFeatures::GENERIC_SRC), "GENERIC_SRC");
    }

    #[test]
    fn test_discover_selects_group() {
        let driver = driver_with(vec![
            SoftwareGroup::new(1, true),
            SoftwareGroup::new(3, false),
        ]);
        let group = DeviceGroup::discover(
            &driver,
            GroupSelector {
                group_index: 1,
                device_index: 0,
            },
        )
        .unwrap();
        assert_eq!(group.index(), 1);
        assert_eq!(group.device_count(), 3);
        assert!(!group.subset_allocation());
        assert_eq!(group.full_mask(), DeviceMask(0b111));
        // Handles are numbered across groups.
        assert_eq!(group.device(0), Some(PhysicalDeviceHandle(1)));
    }

    #[test]
    fn test_discover_out_of_range_is_unsupported() {
        let driver = driver_with(vec![SoftwareGroup::new(2, true)]);
        let err = DeviceGroup::discover(
            &driver,
            GroupSelector {
                group_index: 4,
                device_index: 0,
            },
        )
        .unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_discover_without_capability_is_unsupported() {
        let mut platform = SoftwarePlatform::default();
        platform.capabilities.device_group_creation = false;
        let driver = SoftwareDriver::new(platform);
        let err = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap_err();
        assert!(matches!(err, VerifierError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_open_rejects_peer_fetch_on_single_device() {
        let mut driver = driver_with(vec![SoftwareGroup::new(1, true)]);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        let err = group
            .open(
                &mut driver,
                GroupSelector::default(),
                TestMode::AFR | TestMode::DEDICATED | TestMode::PEER_FETCH,
            )
            .unwrap_err();
        assert!(err.to_string().contains("peer fetch"));
    }

    #[test]
    fn test_open_requires_tessellation_feature() {
        let mut platform = SoftwarePlatform::default();
        platform.features.tessellation_shader = false;
        let mut driver = SoftwareDriver::new(platform);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        let err = group
            .open(
                &mut driver,
                GroupSelector::default(),
                TestMode::SFR | TestMode::TESSELLATION,
            )
            .unwrap_err();
        assert!(err.to_string().contains("tessellation"));
    }

    #[test]
    fn test_open_afr_single_device_skips_bind_memory2() {
        let mut platform = SoftwarePlatform {
            groups: vec![SoftwareGroup::new(1, true)],
            ..SoftwarePlatform::default()
        };
        platform.capabilities.extensions.bind_memory2 = false;
        let mut driver = SoftwareDriver::new(platform);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        assert!(group
            .open(&mut driver, GroupSelector::default(), TestMode::AFR)
            .is_ok());

        let err = group
            .open(&mut driver, GroupSelector::default(), TestMode::SFR)
            .unwrap_err();
        assert!(err.to_string().contains("bind memory 2"));
    }

    #[test]
    fn test_open_rejects_bad_primary_device() {
        let mut driver = driver_with(vec![SoftwareGroup::new(2, true)]);
        let selector = GroupSelector {
            group_index: 0,
            device_index: 5,
        };
        let group = DeviceGroup::discover(&driver, selector).unwrap();
        let err = group.open(&mut driver, selector, TestMode::SFR).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_peer_query_requires_two_devices() {
        let driver = driver_with(vec![SoftwareGroup::new(1, true)]);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        let mut matrix = PeerAccessMatrix::new();
        let err = matrix
            .query_peer_features(&driver, &group, 0, 0, 0)
            .unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_peer_query_is_cached() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            peer_features: PeerFeatureTable::uniform(PeerFeatures::COPY_DST),
            ..SoftwarePlatform::default()
        });
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        group
            .open(&mut driver, GroupSelector::default(), TestMode::SFR)
            .unwrap();
        let mut matrix = PeerAccessMatrix::new();
        let features = matrix
            .query_peer_features(&driver, &group, 0, 0, 1)
            .unwrap();
        assert_eq!(features, PeerFeatures::COPY_DST);
        assert_eq!(matrix.len(), 1);

        matrix.query_peer_features(&driver, &group, 0, 0, 1).unwrap();
        assert_eq!(matrix.len(), 1);
        matrix.query_peer_features(&driver, &group, 0, 1, 0).unwrap();
        assert_eq!(matrix.len(), 2);
    }
}
