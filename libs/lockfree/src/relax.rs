use core::hint;

/// Bounded relax for CAS retry loops.
///
/// A failed CAS means another thread made progress, so the right
/// response is a short burst of `pause` hints, doubling while the
/// contention lasts. The burst is capped by a small budget; once
/// [`Relax::is_spent`] trips, a caller with a scheduler behind it should
/// stop burning the core and yield instead — that is the runtime's
/// spin-then-yield policy for waits that may outlast a cache miss (see
/// the multi-signal's strict raise).
#[derive(Debug, Default)]
pub struct Relax {
    rounds: u32,
}

// === impl Relax ===

impl Relax {
    /// Doubling rounds before the budget is considered spent.
    const BUDGET: u32 = 6;

    pub const fn new() -> Self {
        Self { rounds: 0 }
    }

    /// Issues `2^min(rounds, budget)` spin-loop hints and advances the
    /// round counter.
    #[inline]
    pub fn pause(&mut self) {
        let burst = 1_u32 << self.rounds.min(Self::BUDGET);
        for _ in 0..burst {
            hint::spin_loop();
        }
        self.rounds = self.rounds.saturating_add(1);
    }

    /// Whether the spin budget is used up; the caller should yield, park,
    /// or re-check its exit condition rather than keep spinning.
    #[inline]
    pub fn is_spent(&self) -> bool {
        self.rounds > Self::BUDGET
    }

    /// Starts a fresh budget, e.g. after a yield.
    #[inline]
    pub fn reset(&mut self) {
        self.rounds = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_trips_and_resets() {
        let mut relax = Relax::new();
        assert!(!relax.is_spent());
        while !relax.is_spent() {
            relax.pause();
        }
        relax.reset();
        assert!(!relax.is_spent());
    }
}
