use super::{CpuCount, CpuIndex, MAX_CPUS};

const WORD_BITS: u32 = u64::BITS;
const WORDS: usize = MAX_CPUS / WORD_BITS as usize;

/// A set of CPUs.
///
/// This is a plain value type so it can be built and combined inside interrupt handlers without
/// touching the heap. Unlike a growable bitmap it is limited to [MAX_CPUS] entries.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuMask {
    map: [u64; WORDS],
}

impl CpuMask {
    /// Returns a mask with no CPUs set.
    pub const fn new() -> Self {
        Self { map: [0; WORDS] }
    }

    /// Returns a mask containing only `cpu`.
    ///
    /// # Panics
    ///
    /// This fn will panic if `cpu` is not below [MAX_CPUS]
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn from_cpu(cpu: CpuIndex) -> Self {
        let mut m = Self::new();
        m.set(cpu);
        m
    }

    /// Sets the bit for the specified CPU
    ///
    /// # Panics
    ///
    /// This fn will panic if `cpu` is not below [MAX_CPUS]
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(&mut self, cpu: CpuIndex) {
        let (index, offset) = Self::locate(cpu);
        self.map[index] |= 1 << offset;
    }

    /// Clears the bit for the specified CPU. CPUs outside of the mask range are ignored.
    pub fn clear(&mut self, cpu: CpuIndex) {
        if (cpu as usize) < MAX_CPUS {
            let (index, offset) = Self::locate(cpu);
            self.map[index] &= !(1 << offset);
        }
    }

    /// Returns whether `cpu` is set.
    pub fn get(&self, cpu: CpuIndex) -> bool {
        if (cpu as usize) < MAX_CPUS {
            let (index, offset) = Self::locate(cpu);
            self.map[index] & (1 << offset) != 0
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.iter().all(|w| *w == 0)
    }

    /// Returns the number of CPUs which are set.
    /// This will return None if no CPUs are set
    pub fn count(&self) -> Option<CpuCount> {
        let count: u32 = self.map.iter().map(|w| w.count_ones()).sum();
        CpuCount::new(count)
    }

    /// Returns `true` if at least one CPU is set in both `self` and `other`.
    pub fn intersects(&self, other: &Self) -> bool {
        self.map.iter().zip(other.map.iter()).any(|(a, b)| a & b != 0)
    }

    /// Returns `true` if every CPU in `self` is also set in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.map.iter().zip(other.map.iter()).all(|(a, b)| a & !b == 0)
    }

    /// Iterates over the set CPUs in ascending order.
    pub const fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter { map: self, next: 0 }
    }

    #[cfg_attr(debug_assertions, track_caller)]
    fn locate(cpu: CpuIndex) -> (usize, u32) {
        assert!(
            (cpu as usize) < MAX_CPUS,
            "CPU {cpu} is outside of the supported range (max {MAX_CPUS})"
        );
        ((cpu / WORD_BITS) as usize, cpu % WORD_BITS)
    }
}

impl core::ops::BitAnd for CpuMask {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self::Output {
        self &= rhs;
        self
    }
}

impl core::ops::BitAndAssign for CpuMask {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.map.iter_mut().zip(rhs.map) {
            *a &= b;
        }
    }
}

impl core::ops::BitOr for CpuMask {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self::Output {
        self |= rhs;
        self
    }
}

impl core::ops::BitOrAssign for CpuMask {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.map.iter_mut().zip(rhs.map) {
            *a |= b;
        }
    }
}

impl FromIterator<CpuIndex> for CpuMask {
    fn from_iter<T: IntoIterator<Item = CpuIndex>>(iter: T) -> Self {
        let mut m = Self::new();
        for cpu in iter {
            m.set(cpu);
        }
        m
    }
}

impl<'a> IntoIterator for &'a CpuMask {
    type Item = CpuIndex;
    type IntoIter = CpuMaskIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub struct CpuMaskIter<'a> {
    map: &'a CpuMask,
    // first CPU index which has not been checked yet
    next: u32,
}

impl<'a> Iterator for CpuMaskIter<'a> {
    type Item = CpuIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let mut index = (self.next / WORD_BITS) as usize;
        let offset = self.next % WORD_BITS;

        // check the partially consumed word first
        if offset > 0 && index < WORDS {
            let u = self.map.map[index] & !((1u64 << offset) - 1);
            if u != 0 {
                let found = index as u32 * WORD_BITS + u.trailing_zeros();
                self.next = found + 1;
                return Some(found);
            }
            index += 1;
        }

        for (i, w) in self.map.map.iter().enumerate().skip(index) {
            if *w != 0 {
                let found = i as u32 * WORD_BITS + w.trailing_zeros();
                self.next = found + 1;
                return Some(found);
            }
        }
        self.next = MAX_CPUS as u32;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn iter_crosses_word_boundaries() {
        let m: CpuMask = [0, 1, 63, 64, 130, 255].into_iter().collect();
        assert_eq!(m.iter().collect::<Vec<_>>(), [0, 1, 63, 64, 130, 255]);
        assert_eq!(m.count().map(|c| c.get()), Some(6));
    }

    #[test]
    fn empty_mask() {
        let m = CpuMask::new();
        assert!(m.is_empty());
        assert_eq!(m.count(), None);
        assert_eq!(m.iter().next(), None);
    }

    #[test]
    fn set_ops() {
        let a: CpuMask = [0, 1, 2].into_iter().collect();
        let b: CpuMask = [2, 3].into_iter().collect();
        assert_eq!((a & b).iter().collect::<Vec<_>>(), [2]);
        assert_eq!((a | b).iter().collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert!(a.intersects(&b));
        assert!(!a.is_subset(&b));
        assert!(CpuMask::from_cpu(2).is_subset(&a));

        let mut c = a;
        c.clear(1);
        c.clear(1000); // out of range is ignored
        assert!(!c.get(1));
        assert!(!c.get(1000));
        assert_eq!(c.iter().collect::<Vec<_>>(), [0, 2]);
    }

    #[test]
    #[should_panic]
    fn set_out_of_range() {
        CpuMask::new().set(MAX_CPUS as u32);
    }
}
