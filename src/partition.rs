//! Render partitioning across a pair of devices.
//!
//! Each iteration works on a pair `(first, second)` taken round-robin from
//! the group. SFR splits the frame into vertical halves, left on `first`
//! and right on `second`; AFR gives the whole frame to `second`.

use crate::driver::{Extent, Rect};
use crate::group::DeviceMask;
use crate::modes::TestMode;

/// Working pair of devices for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePair {
    /// Device that reads the result back.
    pub first: u32,
    /// Device that produces the pixels copied across.
    pub second: u32,
}

impl DevicePair {
    /// Pair starting at `first`; `second` wraps around the group.
    pub fn new(first: u32, device_count: u32) -> Self {
        Self {
            first,
            second: (first + 1) % device_count,
        }
    }

    /// Mask naming both devices.
    pub fn mask(&self) -> DeviceMask {
        DeviceMask::pair(self.first, self.second)
    }

    /// Both devices are the same physical device.
    pub fn is_single(&self) -> bool {
        self.first == self.second
    }

    /// Instance index each device uses when bound to its partner's memory.
    ///
    /// Devices outside the pair keep their own instance.
    pub fn swapped_indices(&self, device_count: u32) -> Vec<u32> {
        let mut indices: Vec<u32> = (0..device_count).collect();
        indices[self.first as usize] = self.second;
        indices[self.second as usize] = self.first;
        indices
    }
}

/// Every pair of one frame loop, `first` running over the whole group.
pub fn device_pairs(device_count: u32) -> impl Iterator<Item = DevicePair> {
    (0..device_count).map(move |first| DevicePair::new(first, device_count))
}

/// How a frame is divided between the devices of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SplitFrame,
    AlternateFrame,
}

impl Strategy {
    pub fn from_mode(mode: TestMode) -> Self {
        if mode.afr() {
            Self::AlternateFrame
        } else {
            Self::SplitFrame
        }
    }
}

/// A rectangle of the render target owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRegion {
    pub rect: Rect,
    pub device: u32,
}

fn left_half(extent: Extent) -> Rect {
    Rect::new(0, 0, extent.width / 2, extent.height)
}

/// The remainder column of an odd width lands here.
fn right_half(extent: Extent) -> Rect {
    let split = extent.width / 2;
    Rect::new(split as i32, 0, extent.width - split, extent.height)
}

/// Narrowest render target SFR can split into two non-empty halves.
pub const MIN_SPLIT_WIDTH: u32 = 2;

/// Partition of the render target for one pair.
///
/// With two or more devices SFR needs a width of at least
/// [`MIN_SPLIT_WIDTH`]; narrower targets leave the left half empty, which
/// [`check_tiling`] rejects.
pub fn regions(
    strategy: Strategy,
    pair: DevicePair,
    device_count: u32,
    extent: Extent,
) -> Vec<PartitionRegion> {
    match strategy {
        Strategy::SplitFrame if device_count == 1 => vec![PartitionRegion {
            rect: Rect::full(extent),
            device: pair.first,
        }],
        Strategy::SplitFrame => vec![
            PartitionRegion {
                rect: left_half(extent),
                device: pair.first,
            },
            PartitionRegion {
                rect: right_half(extent),
                device: pair.second,
            },
        ],
        Strategy::AlternateFrame => vec![PartitionRegion {
            rect: Rect::full(extent),
            device: pair.second,
        }],
    }
}

/// Devices that execute the draw.
pub fn draw_mask(strategy: Strategy, pair: DevicePair) -> DeviceMask {
    match strategy {
        Strategy::SplitFrame => pair.mask(),
        Strategy::AlternateFrame => DeviceMask::single(pair.second),
    }
}

/// Render area per device index for the render pass.
///
/// SFR gives each device of the pair its own half and empty areas to the
/// rest. AFR renders the whole target wherever the pass runs.
pub fn render_areas(
    strategy: Strategy,
    pair: DevicePair,
    device_count: u32,
    extent: Extent,
) -> Vec<Rect> {
    match strategy {
        Strategy::SplitFrame => {
            let mut areas = vec![Rect::ZERO; device_count as usize];
            for region in regions(strategy, pair, device_count, extent) {
                areas[region.device as usize] = region.rect;
            }
            areas
        }
        Strategy::AlternateFrame => vec![Rect::full(extent); device_count as usize],
    }
}

/// Split-instance binding table for the SFR render target.
///
/// `rects[d * n + m]` is the part of the image device `d` reaches through
/// instance `m`. Both devices of the pair see the left half in `first`'s
/// instance and the right half in `second`'s instance.
pub fn split_instance_rects(pair: DevicePair, device_count: u32, extent: Extent) -> Vec<Rect> {
    let n = device_count as usize;
    let mut rects = vec![Rect::ZERO; n * n];
    if device_count == 1 {
        rects[0] = Rect::full(extent);
        return rects;
    }
    let (first, second) = (pair.first as usize, pair.second as usize);
    rects[first * n + first] = left_half(extent);
    rects[first * n + second] = right_half(extent);
    rects[second * n + first] = left_half(extent);
    rects[second * n + second] = right_half(extent);
    rects
}

/// Region `second` copies into `first`'s instance before readback.
///
/// SFR copies only the right half, the left half already lives in
/// `first`'s instance. `None` when the pair is a single device.
pub fn peer_copy_region(strategy: Strategy, pair: DevicePair, extent: Extent) -> Option<Rect> {
    if pair.is_single() {
        return None;
    }
    Some(match strategy {
        Strategy::SplitFrame => right_half(extent),
        Strategy::AlternateFrame => Rect::full(extent),
    })
}

/// Checks that `regions` exactly tile `extent`: every region inside the
/// target, no two overlapping, areas summing to the target area.
pub fn check_tiling(regions: &[PartitionRegion], extent: Extent) -> Result<(), String> {
    let target = Rect::full(extent);
    let mut covered = 0u64;
    for (i, region) in regions.iter().enumerate() {
        if region.rect.is_empty() {
            return Err(format!("region {} is empty", i));
        }
        if region.rect.intersection(&target) != Some(region.rect) {
            return Err(format!("region {} {:?} leaves the target", i, region.rect));
        }
        for (j, other) in regions.iter().enumerate().skip(i + 1) {
            if region.rect.intersection(&other.rect).is_some() {
                return Err(format!("regions {} and {} overlap", i, j));
            }
        }
        covered += region.rect.area();
    }
    if covered != target.area() {
        return Err(format!(
            "regions cover {} of {} pixels",
            covered,
            target.area()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Strategy;
    use proptest::prelude::*;

    const EXTENT: Extent = Extent::new(256, 256);

    #[test]
    fn test_pairs_round_robin() {
        let pairs: Vec<_> = device_pairs(3).collect();
        assert_eq!(
            pairs,
            vec![
                DevicePair { first: 0, second: 1 },
                DevicePair { first: 1, second: 2 },
                DevicePair { first: 2, second: 0 },
            ]
        );
        let single: Vec<_> = device_pairs(1).collect();
        assert_eq!(single, vec![DevicePair { first: 0, second: 0 }]);
        assert!(single[0].is_single());
    }

    #[test]
    fn test_swapped_indices() {
        let pair = DevicePair::new(1, 3);
        assert_eq!(pair.swapped_indices(3), vec![0, 2, 1]);
        let wrap = DevicePair::new(2, 3);
        assert_eq!(wrap.swapped_indices(3), vec![2, 1, 0]);
    }

    #[test]
    fn test_sfr_single_device_covers_target() {
        let pair = DevicePair::new(0, 1);
        let regions = regions(Strategy::SplitFrame, pair, 1, EXTENT);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::full(EXTENT));
        assert_eq!(regions[0].device, 0);
    }

    #[test]
    fn test_sfr_two_devices_split_at_midpoint() {
        let pair = DevicePair::new(0, 2);
        let regions = regions(Strategy::SplitFrame, pair, 2, EXTENT);
        assert_eq!(regions[0].rect, Rect::new(0, 0, 128, 256));
        assert_eq!(regions[0].device, 0);
        assert_eq!(regions[1].rect, Rect::new(128, 0, 128, 256));
        assert_eq!(regions[1].device, 1);
    }

    #[test]
    fn test_sfr_odd_width_remainder_on_right() {
        let extent = Extent::new(255, 10);
        let pair = DevicePair::new(1, 2);
        let regions = regions(Strategy::SplitFrame, pair, 2, extent);
        assert_eq!(regions[0].rect.width, 127);
        assert_eq!(regions[0].device, 1);
        assert_eq!(regions[1].rect, Rect::new(127, 0, 128, 10));
        assert_eq!(regions[1].device, 0);
        assert!(check_tiling(&regions, extent).is_ok());
    }

    #[test]
    fn test_afr_whole_frame_on_second() {
        let pair = DevicePair::new(1, 2);
        let regions = regions(Strategy::AlternateFrame, pair, 2, EXTENT);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].device, 0);
        assert_eq!(draw_mask(Strategy::AlternateFrame, pair), DeviceMask::single(0));
        assert_eq!(draw_mask(Strategy::SplitFrame, pair), DeviceMask(0b11));
    }

    #[test]
    fn test_render_areas() {
        let pair = DevicePair::new(1, 3);
        let areas = render_areas(Strategy::SplitFrame, pair, 3, EXTENT);
        assert_eq!(areas[0], Rect::ZERO);
        assert_eq!(areas[1], Rect::new(0, 0, 128, 256));
        assert_eq!(areas[2], Rect::new(128, 0, 128, 256));

        let afr = render_areas(Strategy::AlternateFrame, pair, 3, EXTENT);
        assert!(afr.iter().all(|r| *r == Rect::full(EXTENT)));
    }

    #[test]
    fn test_split_instance_rects_table() {
        let pair = DevicePair::new(1, 2);
        let rects = split_instance_rects(pair, 2, EXTENT);
        let left = Rect::new(0, 0, 128, 256);
        let right = Rect::new(128, 0, 128, 256);
        // Device 1 (first): left in own instance, right in instance 0.
        assert_eq!(rects[3], left);
        assert_eq!(rects[2], right);
        // Device 0 (second): left in instance 1, right in own instance.
        assert_eq!(rects[1], left);
        assert_eq!(rects[0], right);

        let single = split_instance_rects(DevicePair::new(0, 1), 1, EXTENT);
        assert_eq!(single, vec![Rect::full(EXTENT)]);
    }

    #[test]
    fn test_peer_copy_region() {
        assert_eq!(
            peer_copy_region(Strategy::SplitFrame, DevicePair::new(0, 1), EXTENT),
            None
        );
        assert_eq!(
            peer_copy_region(Strategy::SplitFrame, DevicePair::new(1, 2), EXTENT),
            Some(Rect::new(128, 0, 128, 256))
        );
        assert_eq!(
            peer_copy_region(Strategy::AlternateFrame, DevicePair::new(3, 4), EXTENT),
            Some(Rect::full(EXTENT))
        );
    }

    #[test]
    fn test_check_tiling_rejects_overlap_and_gaps() {
        let overlapping = [
            PartitionRegion {
                rect: Rect::new(0, 0, 129, 256),
                device: 0,
            },
            PartitionRegion {
                rect: Rect::new(128, 0, 128, 256),
                device: 1,
            },
        ];
        assert!(check_tiling(&overlapping, EXTENT).is_err());

        let gap = [PartitionRegion {
            rect: Rect::new(0, 0, 128, 256),
            device: 0,
        }];
        assert!(check_tiling(&gap, EXTENT).is_err());
    }

    #[test]
    fn test_narrow_target_does_not_tile() {
        let extent = Extent::new(1, 16);
        let regions = regions(Strategy::SplitFrame, DevicePair::new(0, 2), 2, extent);
        assert!(regions[0].rect.is_empty());
        assert_eq!(check_tiling(&regions, extent), Err("region 0 is empty".to_string()));
    }

    proptest! {
        #[test]
        fn sfr_regions_tile_the_target(
            width in 1u32..2048,
            height in 1u32..512,
            device_count in 1u32..8,
            first_seed in 0u32..8,
        ) {
            let first = first_seed % device_count;
            let pair = DevicePair::new(first, device_count);
            let extent = Extent::new(width, height);
            let regions = regions(Strategy::SplitFrame, pair, device_count, extent);
            if device_count == 1 {
                prop_assert_eq!(regions.len(), 1);
                prop_assert_eq!(regions[0].rect, Rect::full(extent));
            } else if width >= MIN_SPLIT_WIDTH {
                prop_assert_eq!(regions.len(), 2);
                prop_assert_eq!(regions[0].rect.width, width / 2);
                prop_assert_eq!(regions[1].rect.width, width - width / 2);
                prop_assert!(check_tiling(&regions, extent).is_ok());
            }
        }

        #[test]
        fn masks_stay_within_group(
            device_count in 1u32..32,
            first_seed in 0u32..32,
            afr in any::<bool>(),
        ) {
            let first = first_seed % device_count;
            let pair = DevicePair::new(first, device_count);
            let strategy = if afr { Strategy::AlternateFrame } else { Strategy::SplitFrame };
            for mask in [draw_mask(strategy, pair), pair.mask(), DeviceMask::single(pair.first)] {
                prop_assert!(!mask.is_empty());
                prop_assert!(mask.within(device_count));
            }
            let areas = render_areas(strategy, pair, device_count, EXTENT);
            prop_assert_eq!(areas.len(), device_count as usize);
        }
    }
}
