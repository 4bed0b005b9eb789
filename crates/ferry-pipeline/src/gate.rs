use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot trigger: [`ErrorGate::try_fire`] returns `true` to exactly one
/// caller, however many race for it.
#[derive(Debug, Default)]
pub(crate) struct ErrorGate {
    fired: AtomicBool,
}

impl ErrorGate {
    pub(crate) fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
