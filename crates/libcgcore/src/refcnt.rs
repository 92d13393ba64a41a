use std::sync::atomic::{AtomicU64, Ordering};

const DEAD: u64 = 1 << 63;
const NO_REF: u64 = 1 << 62;
const COUNT_MASK: u64 = NO_REF - 1;

/// Reference count with a "dying" mark sharing the same atomic word.
///
/// Once [`RefCnt::kill`] has run, `tryget_live` fails for every caller while
/// plain `get`/`tryget` keep working until the count drops to zero. Immortal
/// counters never reach zero and ignore every operation.
#[derive(Debug)]
pub(crate) struct RefCnt {
    state: AtomicU64,
}

impl RefCnt {
    /// A live counter holding the base reference.
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(1),
        }
    }

    pub fn new_immortal() -> Self {
        Self {
            state: AtomicU64::new(NO_REF | 1),
        }
    }

    pub fn is_immortal(&self) -> bool {
        self.state.load(Ordering::Acquire) & NO_REF != 0
    }

    pub fn get(&self) {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        assert!(
            prev & NO_REF != 0 || prev & COUNT_MASK != 0,
            "reference taken on a released object"
        );
    }

    pub fn tryget(&self) -> bool {
        self.tryget_if(|state| state & COUNT_MASK != 0)
    }

    pub fn tryget_live(&self) -> bool {
        self.tryget_if(|state| state & DEAD == 0 && state & COUNT_MASK != 0)
    }

    fn tryget_if(&self, pred: impl Fn(u64) -> bool) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & NO_REF != 0 {
                return pred(cur);
            }
            if !pred(cur) {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drops one reference. Returns true when this was the last one.
    #[must_use]
    pub fn put(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & NO_REF != 0 {
                return false;
            }
            assert!(cur & COUNT_MASK != 0, "reference count underflow");
            match self.state.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur & COUNT_MASK == 1,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Marks the counter dying and drops the base reference.
    #[must_use]
    pub fn kill(&self) -> bool {
        let prev = self.state.fetch_or(DEAD, Ordering::AcqRel);
        assert!(prev & DEAD == 0, "reference killed twice");
        if prev & NO_REF != 0 {
            return false;
        }
        self.put()
    }

    pub fn is_dying(&self) -> bool {
        self.state.load(Ordering::Acquire) & DEAD != 0
    }

    pub fn count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }
}

impl Default for RefCnt {
    fn default() -> Self {
        Self::new()
    }
}
