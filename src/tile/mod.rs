use std::fmt;

/// Identifies the tiling scheme a key belongs to. Profiles describe how the
/// globe is carved into level-zero tiles; the actual projection math lives
/// with the data layers, not here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(pub u32);

impl ProfileId {
    pub const GLOBAL_GEODETIC: ProfileId = ProfileId(0);
    pub const SPHERICAL_MERCATOR: ProfileId = ProfileId(1);
}

/// One of the four children of a quadtree tile.
///
/// The numbering is fixed: 0=SW, 1=SE, 2=NW, 3=NE, with `y` growing
/// northward. Every component that derives child coordinates relies on
/// this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Quadrant {
    SouthWest = 0,
    SouthEast = 1,
    NorthWest = 2,
    NorthEast = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::SouthWest,
        Quadrant::SouthEast,
        Quadrant::NorthWest,
        Quadrant::NorthEast,
    ];

    pub fn from_index(index: u8) -> Option<Quadrant> {
        match index {
            0 => Some(Quadrant::SouthWest),
            1 => Some(Quadrant::SouthEast),
            2 => Some(Quadrant::NorthWest),
            3 => Some(Quadrant::NorthEast),
            _ => None,
        }
    }

    fn offsets(self) -> (u32, u32) {
        match self {
            Quadrant::SouthWest => (0, 0),
            Quadrant::SouthEast => (1, 0),
            Quadrant::NorthWest => (0, 1),
            Quadrant::NorthEast => (1, 1),
        }
    }
}

/// Universal identity for a terrain tile: quadtree level, column, row, and
/// tiling profile. Keys are plain values; they hash and compare on all four
/// fields and serve as the map key for every cache and queue in the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub profile: ProfileId,
}

impl TileKey {
    pub fn new(level: u32, x: u32, y: u32, profile: ProfileId) -> Self {
        Self {
            level,
            x,
            y,
            profile,
        }
    }

    /// The unique ancestor one level up. Level-zero keys have no parent.
    pub fn parent(&self) -> Option<TileKey> {
        if self.level == 0 {
            return None;
        }
        Some(TileKey {
            level: self.level - 1,
            x: self.x / 2,
            y: self.y / 2,
            profile: self.profile,
        })
    }

    /// The child key one level down in the given quadrant.
    pub fn child(&self, quadrant: Quadrant) -> TileKey {
        let (dx, dy) = quadrant.offsets();
        TileKey {
            level: self.level + 1,
            x: self.x * 2 + dx,
            y: self.y * 2 + dy,
            profile: self.profile,
        }
    }

    /// All four children, in quadrant order.
    pub fn children(&self) -> [TileKey; 4] {
        [
            self.child(Quadrant::SouthWest),
            self.child(Quadrant::SouthEast),
            self.child(Quadrant::NorthWest),
            self.child(Quadrant::NorthEast),
        ]
    }

    /// Which quadrant of its parent this key occupies. Level-zero keys
    /// are not a quadrant of anything.
    pub fn quadrant(&self) -> Option<Quadrant> {
        if self.level == 0 {
            return None;
        }
        Quadrant::from_index(((self.y & 1) << 1 | (self.x & 1)) as u8)
    }

    /// Whether `other` lies in the subtree rooted at this key.
    pub fn contains(&self, other: &TileKey) -> bool {
        if self.profile != other.profile || other.level < self.level {
            return false;
        }
        let shift = other.level - self.level;
        other.x >> shift == self.x && other.y >> shift == self.y
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{} {},{}", self.level, self.x, self.y)
    }
}
