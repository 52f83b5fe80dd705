use derive_more::{Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifies a tensor or one of its tiles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tag(pub u64);

/// The next free tag.
///
/// Every constructor takes the current value and hands back the advanced one, so a run threads a
/// single `NextTag` linearly through all of its constructions. Since it is a plain value, a failed
/// construction leaves the caller's copy untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NextTag(u64);

impl NextTag {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Reserves `count` consecutive tags. Returns the first one and the advanced allocator,
    /// or `None` if the tag space is exhausted.
    #[inline]
    pub fn reserve(self, count: usize) -> Option<(Tag, NextTag)> {
        let count = u64::try_from(count).ok()?;
        let next = self.0.checked_add(count)?;
        Some((Tag(self.0), NextTag(next)))
    }
}

impl Tag {
    /// The tag `offset` places after this one.
    #[inline]
    pub fn offset(self, offset: usize) -> Option<Tag> {
        let offset = u64::try_from(offset).ok()?;
        self.0.checked_add(offset).map(Tag)
    }
}
