//! Data lifetime hints and the lifetime-matching score used by the allocator.

use serde::{Deserialize, Serialize};

/// Expected durability of data written to a zone.
///
/// The ordering is meaningful: a larger hint means the data is expected to
/// live longer. The allocator prefers placing a file into a zone whose hint
/// is slightly above the file's own.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Lifetime {
    /// No hint was ever supplied for this zone.
    #[default]
    NotSet = 0,
    /// Explicitly hinted as having no particular lifetime.
    None = 1,
    /// Short-lived data (write-ahead log flavor).
    Short = 2,
    /// Medium-lived data.
    Medium = 3,
    /// Long-lived data.
    Long = 4,
    /// Data expected to survive the longest.
    Extreme = 5,
}

impl Lifetime {
    /// Decodes a raw tag as stored in a zone's atomic lifetime cell.
    pub fn from_raw(raw: u8) -> Lifetime {
        match raw {
            1 => Lifetime::None,
            2 => Lifetime::Short,
            3 => Lifetime::Medium,
            4 => Lifetime::Long,
            5 => Lifetime::Extreme,
            _ => Lifetime::NotSet,
        }
    }

    /// Encodes the hint for atomic storage.
    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// Score meaning "do not place the file in this zone".
pub const LIFETIME_DIFF_NOT_GOOD: u32 = 100;

/// Score for an exact hint match; acceptable, but a fresh zone is preferred
/// when one can be opened without finishing another.
pub const LIFETIME_DIFF_COULD_BE_WORSE: u32 = 50;

/// Scores how well a file with hint `file` fits a zone currently holding data
/// with hint `zone`. Lower is better.
///
/// Unhinted files only ever match unhinted zones. A zone whose data outlives
/// the file is good (the gap is the score); an exact match is tolerable; a
/// zone whose data dies sooner than the file's is rejected.
pub fn lifetime_diff(zone: Lifetime, file: Lifetime) -> u32 {
    if file == Lifetime::NotSet || file == Lifetime::None {
        if zone == file {
            return 0;
        }
        return LIFETIME_DIFF_NOT_GOOD;
    }

    if zone > file {
        return zone.as_raw() as u32 - file.as_raw() as u32;
    }
    if zone == file {
        return LIFETIME_DIFF_COULD_BE_WORSE;
    }

    LIFETIME_DIFF_NOT_GOOD
}
