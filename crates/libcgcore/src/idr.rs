use fixedbitset::FixedBitSet;

/// Small integer id allocator mapping ids to optional entries.
///
/// An id can be reserved before its entry is published (`alloc` with `None`)
/// and the entry can be cleared while the id stays reserved. Ids are handed
/// out lowest-free-first starting at the allocation floor.
#[derive(Debug)]
pub(crate) struct Idr<T> {
    used: FixedBitSet,
    entries: Vec<Option<T>>,
}

impl<T: Clone> Idr<T> {
    pub fn new() -> Self {
        Self {
            used: FixedBitSet::with_capacity(64),
            entries: Vec::new(),
        }
    }

    /// Reserves the lowest free id `>= start`.
    pub fn alloc(&mut self, start: u32, entry: Option<T>) -> Option<u32> {
        let start = start as usize;
        let id = match (start..self.used.len()).find(|&i| !self.used.contains(i)) {
            Some(id) => id,
            None => {
                let id = self.used.len().max(start);
                if id >= i32::MAX as usize {
                    return None;
                }
                self.used.grow((id + 1).next_power_of_two());
                id
            }
        };
        if self.entries.len() <= id {
            if self.entries.try_reserve(id + 1 - self.entries.len()).is_err() {
                return None;
            }
            self.entries.resize(id + 1, None);
        }
        self.used.insert(id);
        self.entries[id] = entry;
        Some(id as u32)
    }

    /// Publishes or clears the entry of a reserved id.
    pub fn replace(&mut self, id: u32, entry: Option<T>) {
        let id = id as usize;
        assert!(self.used.contains(id), "idr replace on a free id {id}");
        self.entries[id] = entry;
    }

    pub fn remove(&mut self, id: u32) {
        let id = id as usize;
        if id < self.used.len() {
            self.used.set(id, false);
            self.entries[id] = None;
        }
    }

    pub fn find(&self, id: u32) -> Option<T> {
        self.entries.get(id as usize).cloned().flatten()
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.used.contains(id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_from_floor() {
        let mut idr: Idr<&str> = Idr::new();
        assert_eq!(idr.alloc(2, Some("a")), Some(2));
        assert_eq!(idr.alloc(2, None), Some(3));
        assert_eq!(idr.find(2), Some("a"));
        assert_eq!(idr.find(3), None);
        assert!(idr.is_allocated(3));
        idr.replace(3, Some("b"));
        assert_eq!(idr.find(3), Some("b"));
    }

    #[test]
    fn test_reuse_lowest() {
        let mut idr: Idr<u8> = Idr::new();
        for _ in 0..5 {
            idr.alloc(1, Some(0));
        }
        idr.remove(2);
        idr.remove(4);
        assert_eq!(idr.alloc(1, None), Some(2));
        assert_eq!(idr.alloc(1, None), Some(4));
        assert_eq!(idr.alloc(1, None), Some(6));
    }

    #[test]
    fn test_grow_past_capacity() {
        let mut idr: Idr<u32> = Idr::new();
        for i in 0..200 {
            assert_eq!(idr.alloc(0, Some(i)), Some(i));
        }
        assert_eq!(idr.find(150), Some(150));
    }
}
