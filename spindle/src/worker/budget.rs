/// Where a worker stands against its request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    Running,
    /// `max` reached: stop taking new work once the queue is empty.
    Draining,
    /// `max + grace` reached: stop reading immediately.
    Exhausted,
}

/// `max_request` / `max_request_grace` bookkeeping for one worker incarnation.
///
/// A budget with `max == 0` never runs out.
#[derive(Debug, Clone)]
pub struct RequestBudget {
    max: u64,
    grace: u64,
    served: u64,
    draining: bool,
}

impl RequestBudget {
    pub fn new(max: u64, grace: u64) -> Self {
        Self {
            max,
            grace,
            served: 0,
            draining: false,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Force draining, as on reload. The grace window still applies.
    pub fn begin_drain(&mut self) {
        if !self.draining {
            self.draining = true;
            self.max = self.served;
        }
    }

    pub fn state(&self) -> BudgetState {
        if !self.draining && (self.max == 0 || self.served < self.max) {
            BudgetState::Running
        } else if self.served >= self.max + self.grace {
            BudgetState::Exhausted
        } else {
            BudgetState::Draining
        }
    }

    /// Count one served request.
    pub fn on_request(&mut self) -> BudgetState {
        self.served += 1;
        if self.max != 0 && self.served >= self.max {
            self.draining = true;
        }
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_then_grace_then_exhausted() {
        let mut budget = RequestBudget::new(100, 50);
        for _ in 0..99 {
            assert_eq!(budget.on_request(), BudgetState::Running);
        }
        assert_eq!(budget.on_request(), BudgetState::Draining);
        for _ in 0..49 {
            assert_eq!(budget.on_request(), BudgetState::Draining);
        }
        assert_eq!(budget.on_request(), BudgetState::Exhausted);
        assert_eq!(budget.served(), 150);
    }

    #[test]
    fn test_unlimited_never_drains() {
        let mut budget = RequestBudget::unlimited();
        for _ in 0..10_000 {
            assert_eq!(budget.on_request(), BudgetState::Running);
        }
    }

    #[test]
    fn test_forced_drain_keeps_grace() {
        let mut budget = RequestBudget::new(0, 2);
        budget.on_request();
        budget.begin_drain();
        assert_eq!(budget.state(), BudgetState::Draining);
        assert_eq!(budget.on_request(), BudgetState::Draining);
        assert_eq!(budget.on_request(), BudgetState::Exhausted);
    }

    #[test]
    fn test_forced_drain_without_grace_is_exhausted() {
        let mut budget = RequestBudget::new(10, 0);
        budget.begin_drain();
        assert_eq!(budget.state(), BudgetState::Exhausted);
    }
}
