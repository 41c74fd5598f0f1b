use crate::error::Error;
use crate::unwind_rule::UnwindRule;

/// A prime, so that addresses with common alignment spread over all slots.
const SLOT_COUNT: usize = 509;

/// A direct-mapped cache from lookup address to compact unwind rule. Each address maps
/// to exactly one slot; a newer entry simply replaces the older one.
pub struct RuleCache<R: UnwindRule> {
    slots: Box<[Option<CacheEntry<R>>]>,
    stats: CacheStats,
}

#[derive(Clone, Copy, Debug)]
struct CacheEntry<R> {
    address: u64,
    modules_generation: u16,
    rule: R,
}

/// The outcome of a cache probe.
pub enum CacheResult {
    /// The cached rule was executed, with this result.
    Hit(Result<Option<u64>, Error>),
    /// No rule for the address. Pass the handle to [`RuleCache::insert`] once the rule is
    /// known.
    Miss(CacheHandle),
}

/// Identifies the slot to fill after a miss.
pub struct CacheHandle {
    slot: usize,
    address: u64,
    modules_generation: u16,
}

fn slot_for(address: u64) -> usize {
    (address % SLOT_COUNT as u64) as usize
}

impl<R: UnwindRule> RuleCache<R> {
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT].into_boxed_slice(),
            stats: CacheStats::default(),
        }
    }

    /// Execute the cached rule for `address` if there is one that was stored under the
    /// current module generation.
    pub fn try_unwind<F>(
        &mut self,
        address: u64,
        modules_generation: u16,
        is_first_frame: bool,
        regs: &mut R::UnwindRegs,
        read_stack: &mut F,
    ) -> CacheResult
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let slot = slot_for(address);
        match self.slots[slot] {
            Some(entry)
                if entry.address == address && entry.modules_generation == modules_generation =>
            {
                self.stats.hit_count += 1;
                return CacheResult::Hit(entry.rule.exec(is_first_frame, regs, read_stack));
            }
            Some(_) => self.stats.miss_wrong_address_count += 1,
            None => self.stats.miss_empty_slot_count += 1,
        }
        CacheResult::Miss(CacheHandle {
            slot,
            address,
            modules_generation,
        })
    }

    pub fn insert(&mut self, handle: CacheHandle, rule: R) {
        self.slots[handle.slot] = Some(CacheEntry {
            address: handle.address,
            modules_generation: handle.modules_generation,
            rule,
        });
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl<R: UnwindRule> Default for RuleCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the rule cache.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    /// Misses on a slot that was never filled.
    pub miss_empty_slot_count: u64,
    /// Misses on a slot holding another address, or a rule from an older module list.
    pub miss_wrong_address_count: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hits(&self) -> u64 {
        self.hit_count
    }

    pub fn misses(&self) -> u64 {
        self.miss_empty_slot_count + self.miss_wrong_address_count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::x86_64::{UnwindRegsX86_64, UnwindRuleX86_64};

    #[test]
    fn hit_after_insert() {
        let stack = [0, 0x100200, 0, 0];
        let mut read_stack = |addr| stack.get((addr / 8) as usize).copied().ok_or(());
        let mut cache = RuleCache::<UnwindRuleX86_64>::new();
        let mut regs = UnwindRegsX86_64::new(0x100100, 0x8, 0);

        let handle = match cache.try_unwind(0x100100, 0, true, &mut regs, &mut read_stack) {
            CacheResult::Miss(handle) => handle,
            CacheResult::Hit(_) => panic!("empty cache should miss"),
        };
        cache.insert(handle, UnwindRuleX86_64::OffsetSp { sp_offset_by_8: 1 });

        match cache.try_unwind(0x100100, 0, true, &mut regs, &mut read_stack) {
            CacheResult::Hit(res) => assert_eq!(res, Ok(Some(0x100200))),
            CacheResult::Miss(_) => panic!("expected a hit"),
        }
        // A newer module generation invalidates the entry.
        assert!(matches!(
            cache.try_unwind(0x100100, 1, true, &mut regs, &mut read_stack),
            CacheResult::Miss(_)
        ));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hit_count: 1,
                miss_empty_slot_count: 1,
                miss_wrong_address_count: 1,
            }
        );
        assert_eq!(cache.stats().total(), 3);
    }

    #[test]
    fn colliding_addresses_replace_each_other() {
        let mut read_stack = |_| Err(());
        let mut cache = RuleCache::<UnwindRuleX86_64>::new();
        let mut regs = UnwindRegsX86_64::new(0x100100, 0x8, 0);
        let a = 0x2000;
        let b = a + SLOT_COUNT as u64;

        for address in [a, b] {
            match cache.try_unwind(address, 0, false, &mut regs, &mut read_stack) {
                CacheResult::Miss(handle) => cache.insert(handle, UnwindRuleX86_64::UseFramePointer),
                CacheResult::Hit(_) => panic!("{address:#x} should miss"),
            }
        }
        assert!(matches!(
            cache.try_unwind(a, 0, false, &mut regs, &mut read_stack),
            CacheResult::Miss(_)
        ));
        assert_eq!(cache.stats().misses(), 3);
        assert_eq!(cache.stats().hits(), 0);
    }
}
