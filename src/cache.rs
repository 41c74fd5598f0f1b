use crate::rule_cache::RuleCache;
use crate::unwind_rule::UnwindRule;

pub use crate::rule_cache::CacheStats;

/// Mutable state reused across [`Unwinder`](crate::Unwinder) calls: compact rules by
/// address, and gimli's scratch space for evaluating CFI. One cache serves one
/// unwinder at a time.
pub struct Cache<R: UnwindRule> {
    pub(crate) gimli_unwind_context: Box<gimli::UnwindContext<usize>>,
    pub(crate) rule_cache: RuleCache<R>,
}

impl<R: UnwindRule> Cache<R> {
    pub fn new() -> Self {
        Self {
            gimli_unwind_context: Box::new(gimli::UnwindContext::new()),
            rule_cache: RuleCache::new(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.rule_cache.stats()
    }
}

impl<R: UnwindRule> Default for Cache<R> {
    fn default() -> Self {
        Self::new()
    }
}
