use std::fmt::{self, Display};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub};

use serde::Serialize;

use crate::subsys::SubsysId;

/// Maximum number of controllers a single engine can register.
pub const SUBSYS_COUNT_MAX: usize = 16;

/// A set of controller slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubsysMask(u32);

impl SubsysMask {
    pub const EMPTY: SubsysMask = SubsysMask(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn single(ssid: SubsysId) -> Self {
        debug_assert!(ssid < SUBSYS_COUNT_MAX);
        Self(1 << ssid)
    }

    /// Every slot below `count`.
    pub fn first(count: usize) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    pub fn contains(self, ssid: SubsysId) -> bool {
        ssid < 32 && self.0 & (1 << ssid) != 0
    }

    pub fn insert(&mut self, ssid: SubsysId) {
        self.0 |= 1 << ssid;
    }

    pub fn remove(&mut self, ssid: SubsysId) {
        self.0 &= !(1 << ssid);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: SubsysMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_subset(self, other: SubsysMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Slots in ascending order, which is also the order hooks are invoked in.
    pub fn iter(self) -> SubsysMaskIter {
        SubsysMaskIter(self.0)
    }
}

pub struct SubsysMaskIter(u32);

impl Iterator for SubsysMaskIter {
    type Item = SubsysId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let ssid = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(ssid)
    }
}

impl FromIterator<SubsysId> for SubsysMask {
    fn from_iter<I: IntoIterator<Item = SubsysId>>(iter: I) -> Self {
        let mut mask = SubsysMask::EMPTY;
        for ssid in iter {
            mask.insert(ssid);
        }
        mask
    }
}

impl BitOr for SubsysMask {
    type Output = SubsysMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        SubsysMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for SubsysMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SubsysMask {
    type Output = SubsysMask;

    fn bitand(self, rhs: Self) -> Self::Output {
        SubsysMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for SubsysMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Sub for SubsysMask {
    type Output = SubsysMask;

    fn sub(self, rhs: Self) -> Self::Output {
        SubsysMask(self.0 & !rhs.0)
    }
}

impl Not for SubsysMask {
    type Output = SubsysMask;

    fn not(self) -> Self::Output {
        SubsysMask(!self.0)
    }
}

impl Display for SubsysMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
