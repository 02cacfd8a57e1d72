//! Test mode definitions for device-group verification.
//!
//! This module contains the `TestMode` bit set and the table of named test
//! cases. Every case runs through the same iteration function; the mode
//! bits alone decide partitioning, memory placement and the scene.

/// Mode bits selecting one combination of the verification axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TestMode(pub u32);

impl TestMode {
    /// Split frame rendering.
    pub const SFR: Self = Self(1 << 0);
    /// Alternate frame rendering.
    pub const AFR: Self = Self(1 << 1);
    /// Render target in host memory.
    pub const HOST_MEMORY: Self = Self(1 << 2);
    /// Dedicated allocation per resource.
    pub const DEDICATED: Self = Self(1 << 3);
    /// Vertex, index, uniform and storage data fetched from the peer's instance.
    pub const PEER_FETCH: Self = Self(1 << 4);
    /// Tessellated sphere instead of a triangle.
    pub const TESSELLATION: Self = Self(1 << 5);
    /// Polygon edges drawn as line segments.
    pub const LINE_FILL: Self = Self(1 << 6);

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn sfr(&self) -> bool {
        self.contains(Self::SFR)
    }

    pub const fn afr(&self) -> bool {
        self.contains(Self::AFR)
    }

    pub const fn host_memory(&self) -> bool {
        self.contains(Self::HOST_MEMORY)
    }

    pub const fn dedicated(&self) -> bool {
        self.contains(Self::DEDICATED)
    }

    pub const fn peer_fetch(&self) -> bool {
        self.contains(Self::PEER_FETCH)
    }

    pub const fn tessellation(&self) -> bool {
        self.contains(Self::TESSELLATION)
    }

    pub const fn line_fill(&self) -> bool {
        self.contains(Self::LINE_FILL)
    }
}

impl std::ops::BitOr for TestMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One named entry of the case table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestCase {
    pub name: &'static str,
    pub description: &'static str,
    pub mode: TestMode,
}

const fn case(name: &'static str, description: &'static str, mode: u32) -> TestCase {
    TestCase {
        name,
        description,
        mode: TestMode(mode),
    }
}

const SFR: u32 = TestMode::SFR.0;
const AFR: u32 = TestMode::AFR.0;
const SYS: u32 = TestMode::HOST_MEMORY.0;
const DEDICATED: u32 = TestMode::DEDICATED.0;
const PEER: u32 = TestMode::PEER_FETCH.0;
const TESS: u32 = TestMode::TESSELLATION.0;
const LINE: u32 = TestMode::LINE_FILL.0;

const CASES: [TestCase; 12] = [
    case("sfr", "Split frame rendering", SFR),
    case(
        "sfr_sys",
        "Split frame rendering with the render target in host memory",
        SFR | SYS,
    ),
    case(
        "sfr_dedicated",
        "Split frame rendering with dedicated allocations",
        SFR | DEDICATED,
    ),
    case(
        "sfr_dedicated_peer",
        "Split frame rendering with dedicated allocations and peer fetch",
        SFR | DEDICATED | PEER,
    ),
    case("afr", "Alternate frame rendering", AFR),
    case(
        "afr_sys",
        "Alternate frame rendering with the render target in host memory",
        AFR | SYS,
    ),
    case(
        "afr_dedicated",
        "Alternate frame rendering with dedicated allocations",
        AFR | DEDICATED,
    ),
    case(
        "afr_dedicated_peer",
        "Alternate frame rendering with dedicated allocations and peer fetch",
        AFR | DEDICATED | PEER,
    ),
    case(
        "sfr_tessellated",
        "Split frame rendering of a tessellated sphere",
        SFR | TESS | DEDICATED | PEER,
    ),
    case(
        "sfr_tessellated_linefill",
        "Split frame rendering of a tessellated sphere as line segments",
        SFR | TESS | LINE | DEDICATED | PEER,
    ),
    case(
        "afr_tessellated",
        "Alternate frame rendering of a tessellated sphere",
        AFR | TESS | DEDICATED | PEER,
    ),
    case(
        "afr_tessellated_linefill",
        "Alternate frame rendering of a tessellated sphere as line segments",
        AFR | TESS | LINE | DEDICATED | PEER,
    ),
];

/// Returns every test case in table order.
pub fn all_cases() -> &'static [TestCase] {
    &CASES
}

/// The case named exactly `filter`, otherwise every case whose name
/// contains it; all cases when `filter` is `None`.
pub fn select_cases(filter: Option<&str>) -> Vec<TestCase> {
    if let Some(case) = filter.and_then(find_case) {
        return vec![case];
    }
    CASES
        .iter()
        .filter(|case| filter.map_or(true, |f| case.name.contains(f)))
        .copied()
        .collect()
}

/// Looks a case up by exact name.
pub fn find_case(name: &str) -> Option<TestCase> {
    CASES.iter().find(|case| case.name == name).copied()
}
