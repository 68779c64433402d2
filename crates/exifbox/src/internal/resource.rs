use wasmtime::ResourceLimiter;

/// Caps linear-memory growth at the module's initial size plus a budget.
pub struct MemoryLimiter {
    budget: usize,
    initial: Option<usize>,
    max_table_elements_hard: usize,
    current: usize,
}

impl MemoryLimiter {
    pub fn new(budget: usize) -> Self {
        // The resource table stores host-side handles. Keep this bounded to avoid
        // untrusted guests growing host memory without limit.
        const TABLE_ELEMENT_BUDGET_BYTES: usize = 64;
        const MIN_TABLE_ELEMENTS: usize = 1024;
        let max_table_elements_hard =
            core::cmp::max(budget / TABLE_ELEMENT_BUDGET_BYTES, MIN_TABLE_ELEMENTS);

        Self {
            budget,
            initial: None,
            max_table_elements_hard,
            current: 0,
        }
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    fn max_memory(&self) -> usize {
        self.initial
            .map_or(usize::MAX, |initial| initial.saturating_add(self.budget))
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if current == 0 && self.initial.is_none() {
            // Instantiation: the declared minimum is always granted.
            self.initial = Some(desired);
        } else if desired > self.max_memory() {
            return Ok(false);
        }
        self.current = desired;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_table_elements_hard {
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_bounded_above_initial_memory() {
        let mut limiter = MemoryLimiter::new(1024);
        assert!(limiter.memory_growing(0, 65536, None).expect("memory grow"));
        assert!(
            limiter
                .memory_growing(65536, 65536 + 1024, None)
                .expect("memory grow")
        );
        assert!(
            !limiter
                .memory_growing(65536 + 1024, 65536 + 1025, None)
                .expect("memory grow")
        );
        assert_eq!(limiter.current(), 65536 + 1024);
    }

    #[test]
    fn table_limit_is_enforced() {
        let mut limiter = MemoryLimiter::new(64 * 1024);
        assert!(
            !limiter
                .table_growing(0, usize::MAX, None)
                .expect("table grow")
        );
    }
}
