//! Region identifiers and hints.
//!
//! A region id is a 64-bit hash of the region name with the top bits
//! reserved for flags: bit 63 marks the epoch region, bit 62 marks time
//! spent inside MPI, bit 61 marks execution outside any marked region.
//! The hash itself occupies the low 32 bits so that flag bits never
//! collide with hash bits.

use std::fmt;

/// Epoch flag: the distinguished region marking one outer iteration.
pub const REGION_ID_EPOCH: u64 = 1 << 63;
/// MPI flag: time inside the message-passing library.
pub const REGION_ID_MPI: u64 = 1 << 62;
/// Unmarked flag: execution outside any application-marked region.
pub const REGION_ID_UNMARKED: u64 = 1 << 61;
/// The null region.
pub const REGION_ID_INVALID: u64 = 0;

const HASH_MASK: u64 = 0xFFFF_FFFF;

/// Hashes a region name into an id (FNV-1a, truncated to the hash bits).
pub fn region_id(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hash = hash & HASH_MASK;
    // Guard against a name hashing to the null region.
    if hash == 0 { 1 } else { hash }
}

/// Strips flag bits, leaving the name hash.
pub fn region_hash(id: u64) -> u64 {
    id & HASH_MASK
}

/// True when the id carries the epoch flag.
pub fn is_epoch(id: u64) -> bool {
    id & REGION_ID_EPOCH != 0
}

/// True when the id carries the MPI flag.
pub fn is_mpi(id: u64) -> bool {
    id & REGION_ID_MPI != 0
}

/// The application's scheduling hint for a region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegionHint {
    /// No hint provided.
    #[default]
    Unknown,
    /// Compute bound.
    Compute,
    /// Memory-bandwidth bound.
    Memory,
    /// Network bound.
    Network,
    /// File or storage I/O bound.
    Io,
    /// Serial execution.
    Serial,
    /// Fully parallel execution.
    Parallel,
    /// Excluded from accounting.
    Ignore,
}

impl RegionHint {
    /// A stable numeric encoding, used when a hint travels in a sample.
    pub fn to_index(self) -> u64 {
        match self {
            RegionHint::Unknown => 0,
            RegionHint::Compute => 1,
            RegionHint::Memory => 2,
            RegionHint::Network => 3,
            RegionHint::Io => 4,
            RegionHint::Serial => 5,
            RegionHint::Parallel => 6,
            RegionHint::Ignore => 7,
        }
    }

    /// Decodes [`RegionHint::to_index`], defaulting to `Unknown`.
    pub fn from_index(index: u64) -> RegionHint {
        match index {
            1 => RegionHint::Compute,
            2 => RegionHint::Memory,
            3 => RegionHint::Network,
            4 => RegionHint::Io,
            5 => RegionHint::Serial,
            6 => RegionHint::Parallel,
            7 => RegionHint::Ignore,
            _ => RegionHint::Unknown,
        }
    }
}

impl fmt::Display for RegionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionHint::Unknown => "unknown",
            RegionHint::Compute => "compute",
            RegionHint::Memory => "memory",
            RegionHint::Network => "network",
            RegionHint::Io => "io",
            RegionHint::Serial => "serial",
            RegionHint::Parallel => "parallel",
            RegionHint::Ignore => "ignore",
        };
        f.write_str(name)
    }
}
