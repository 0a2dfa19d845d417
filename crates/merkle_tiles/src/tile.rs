// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Tiles are the unit of distribution of a tiled transparency log: a tile at
//! level `L` and index `N` holds up to 256 hashes of tree level `8*L`,
//! starting at entry `N*256`. A tile whose subtree is still growing is
//! *partial* and has width `W < 256`.
//!
//! [`TilePlan`] computes, for a set of stored hash indexes, the tiles that
//! must be fetched to produce those hashes *and* authenticate every fetched
//! tile against the tree's root hash, following the tile authentication
//! scheme of <https://research.swtch.com/tlog#authenticating_tiles>.

use crate::tlog::{
    node_hash, split_stored_hash_index, stored_hash_index, tree_hash_indexes, Hash, TlogError,
    HASH_SIZE,
};
use std::collections::HashMap;
use std::fmt;

/// The fixed tile height: each full tile covers a subtree of 2^8 hashes.
pub const TILE_HEIGHT: u8 = 8;

/// Number of hashes in a full tile.
pub const FULL_WIDTH: u32 = 1 << TILE_HEIGHT;

// Tile indexes are encoded three decimal digits at a time so no directory
// holds more than 1000 each of xNNN, NNN, and NNN.p children.
const PATH_BASE: u64 = 1000;

/// Encodes a tile coordinate path: `tile/8/<level>/<index>[.p/<width>]`,
/// where `<index>` is the base-1000 digits of the tile index, `%03d` each,
/// all but the last prefixed with `x`. The `<level>` string is `"0"` for
/// leaf tiles, `"data"` for entry tiles, and the decimal level otherwise.
pub fn tile_path(level: &str, index: u64, width: u32) -> String {
    let mut n = index;
    let mut encoded = format!("{:03}", n % PATH_BASE);
    while n >= PATH_BASE {
        n /= PATH_BASE;
        encoded = format!("x{:03}/{}", n % PATH_BASE, encoded);
    }
    let partial = if width == FULL_WIDTH {
        String::new()
    } else {
        format!(".p/{width}")
    };
    format!("tile/{TILE_HEIGHT}/{level}/{encoded}{partial}")
}

/// Coordinates of one hash tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    level: u8,
    index: u64,
    width: u32,
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl Tile {
    /// Returns a new tile with the given coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not in `1..=256` or `level` is out of range.
    pub fn new(level: u8, index: u64, width: u32) -> Self {
        assert!(
            level < 64 && (1..=FULL_WIDTH).contains(&width),
            "invalid tile"
        );
        Self {
            level,
            index,
            width,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// The tile's coordinate path.
    pub fn path(&self) -> String {
        tile_path(&self.level.to_string(), self.index, self.width)
    }

    /// Returns the least-width tile storing the given stored hash index.
    pub fn from_index(stored: u64) -> Self {
        Self::from_index_with_range(stored).0
    }

    // Returns the tile storing `stored` along with the byte range of the
    // tile data whose subtree hash reconstructs that stored hash.
    fn from_index_with_range(stored: u64) -> (Self, usize, usize) {
        let (mut level, mut n) = split_stored_hash_index(stored);
        let tile_level = level / TILE_HEIGHT;
        level -= tile_level * TILE_HEIGHT; // level within the tile
        let tile_index = n << level >> TILE_HEIGHT;
        n -= tile_index << TILE_HEIGHT >> level; // entry within the tile, at `level`
        let width = u32::try_from((n + 1) << level).expect("tile width fits in u32");
        let start = usize::try_from(n << level).expect("tile offset fits in usize") * HASH_SIZE;
        let end = usize::try_from((n + 1) << level).expect("tile offset fits in usize") * HASH_SIZE;
        (Self::new(tile_level, tile_index, width), start, end)
    }

    /// Returns the tile's `k`'th tile parent in a tree with `tree_size`
    /// records, with width clamped to the tree's right edge, or `None` if
    /// the tree has no such tile.
    pub fn parent(&self, k: u8, tree_size: u64) -> Option<Self> {
        let mut t = *self;
        t.level += k;
        let shift = u32::from(k) * u32::from(TILE_HEIGHT);
        t.index = if shift >= 64 { 0 } else { t.index >> shift };
        t.width = FULL_WIDTH;
        let level_shift = u32::from(t.level) * u32::from(TILE_HEIGHT);
        let level_size = if level_shift >= 64 {
            0
        } else {
            tree_size >> level_shift
        };
        if (t.index << TILE_HEIGHT) + u64::from(t.width) >= level_size {
            if (t.index << TILE_HEIGHT) >= level_size {
                return None;
            }
            t.width = u32::try_from(level_size - (t.index << TILE_HEIGHT))
                .expect("clamped width fits in u32");
        }
        Some(t)
    }

    /// Extracts the hash with the given stored hash index from this tile's
    /// data.
    ///
    /// # Errors
    ///
    /// Returns an error if the index does not belong to this tile or the
    /// data is too short.
    pub fn hash_at_index(&self, data: &[u8], stored: u64) -> Result<Hash, TlogError> {
        if data.len() < self.width as usize * HASH_SIZE {
            return Err(TlogError::InvalidTile);
        }
        let (t, start, end) = Self::from_index_with_range(stored);
        if self.level != t.level || self.index != t.index || self.width < t.width {
            return Err(TlogError::InvalidTile);
        }
        Ok(Self::subtree_hash(&data[start..end]))
    }

    /// Computes the subtree hash of the `2^k` hashes in `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty.
    pub fn subtree_hash(data: &[u8]) -> Hash {
        assert!(!data.is_empty(), "bad math in tile subtree hash");
        if data.len() == HASH_SIZE {
            return Hash(data.try_into().expect("length checked above"));
        }
        let mid = data.len() / 2;
        node_hash(
            Self::subtree_hash(&data[..mid]),
            Self::subtree_hash(&data[mid..]),
        )
    }
}

/// A fetch-and-authenticate plan for a set of stored hash indexes against a
/// tree of known size and root hash.
///
/// Planning and verification are split so the caller can fetch the planned
/// tiles however it likes (typically concurrently over the network) before
/// handing the data back to [`TilePlan::verify_and_read`]. Any hash that
/// comes out of the plan is proven to be in the tree: the tiles on the
/// tree-hash path are checked against the root, and every other tile is
/// checked against its parent.
pub struct TilePlan {
    tree_size: u64,
    tiles: Vec<Tile>,
    tile_order: HashMap<Tile, usize>,
    // Indexes whose hashes reconstruct the root, and the tile holding each.
    root_path: Vec<u64>,
    root_path_tile: Vec<usize>,
    // Tiles planned for the root path come first; the rest need parent
    // authentication.
    root_tile_count: usize,
}

impl TilePlan {
    /// Plans the tiles needed to produce the hashes at `indexes` in a tree
    /// with `tree_size` records.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree is empty or any index is outside it.
    pub fn new(tree_size: u64, indexes: &[u64]) -> Result<Self, TlogError> {
        if tree_size == 0 {
            return Err(TlogError::InvalidInput("empty tree has no tiles".into()));
        }

        let mut tile_order: HashMap<Tile, usize> = HashMap::new();
        let mut tiles = Vec::new();

        // Plan the tiles needed to recompute the root hash. If the root
        // matches, those tiles are authenticated.
        let root_path = tree_hash_indexes(tree_size);
        let mut root_path_tile = vec![0; root_path.len()];
        for (i, &x) in root_path.iter().enumerate() {
            let tile = Tile::from_index(x)
                .parent(0, tree_size)
                .ok_or(TlogError::BadMath)?;
            if let Some(&j) = tile_order.get(&tile) {
                root_path_tile[i] = j;
            } else {
                root_path_tile[i] = tiles.len();
                tile_order.insert(tile, tiles.len());
                tiles.push(tile);
            }
        }
        let root_tile_count = tiles.len();

        // Plan the tiles holding the requested indexes, plus any parents
        // needed to authenticate them. Parents are planned before children.
        for &x in indexes {
            if x >= stored_hash_index(0, tree_size) {
                return Err(TlogError::IndexesNotInTree);
            }
            let tile = Tile::from_index(x);

            // Walk up until we hit a tile already planned; that one is (or
            // will be) authenticated.
            let mut k = 0;
            loop {
                let p = tile.parent(k, tree_size).ok_or(TlogError::BadMath)?;
                if tile_order.contains_key(&p) {
                    break;
                }
                k += 1;
            }

            // Walk back down recording children after their parents.
            for k in (0..k).rev() {
                let p = tile.parent(k, tree_size).ok_or(TlogError::BadMath)?;
                if p.width != FULL_WIDTH {
                    // Only full tiles have parents; partial tiles are always
                    // on the root path and were planned above.
                    return Err(TlogError::BadMath);
                }
                tile_order.insert(p, tiles.len());
                tiles.push(p);
            }
        }

        Ok(Self {
            tree_size,
            tiles,
            tile_order,
            root_path,
            root_path_tile,
            root_tile_count,
        })
    }

    /// The tiles to fetch, in plan order. `verify_and_read` expects one data
    /// buffer per tile, in this same order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Authenticates the fetched tile `data` against `root_hash` and returns
    /// the hashes for `indexes` (which must be the same indexes the plan was
    /// built for).
    ///
    /// # Errors
    ///
    /// Returns [`TlogError::InconsistentTile`] if any tile fails
    /// authentication, and other errors for malformed data.
    pub fn verify_and_read(
        &self,
        root_hash: &Hash,
        data: &[Vec<u8>],
        indexes: &[u64],
    ) -> Result<Vec<Hash>, TlogError> {
        if data.len() != self.tiles.len() {
            return Err(TlogError::BadMath);
        }
        for (tile, d) in self.tiles.iter().zip(data) {
            if d.len() != tile.width as usize * HASH_SIZE {
                return Err(TlogError::InvalidTile);
            }
        }

        // Recompute the root from the planned root-path tiles.
        let last = self.root_path.len() - 1;
        let mut th = self.tiles[self.root_path_tile[last]]
            .hash_at_index(&data[self.root_path_tile[last]], self.root_path[last])?;
        for i in (0..last).rev() {
            let h = self.tiles[self.root_path_tile[i]]
                .hash_at_index(&data[self.root_path_tile[i]], self.root_path[i])?;
            th = node_hash(h, th);
        }
        if th != *root_hash {
            return Err(TlogError::InconsistentTile);
        }

        // Authenticate the remaining tiles against their parents; parents
        // were planned (and therefore authenticated) first.
        for (i, tile) in self.tiles.iter().enumerate().skip(self.root_tile_count) {
            let p = tile.parent(1, self.tree_size).ok_or(TlogError::BadMath)?;
            let Some(&j) = self.tile_order.get(&p) else {
                return Err(TlogError::BadMath);
            };
            let h = p.hash_at_index(
                &data[j],
                stored_hash_index(p.level * TILE_HEIGHT, tile.index),
            )?;
            if h != Tile::subtree_hash(&data[i]) {
                return Err(TlogError::InconsistentTile);
            }
        }

        // All tiles are now authenticated; pull out the requested hashes.
        indexes
            .iter()
            .map(|&x| {
                let tile = Tile::from_index(x)
                    .parent(0, self.tree_size)
                    .ok_or(TlogError::BadMath)?;
                let j = *self.tile_order.get(&tile).ok_or(TlogError::BadMath)?;
                self.tiles[j].hash_at_index(&data[j], x)
            })
            .collect()
    }
}
