use std::num::NonZeroU32;

/// Default number of processed arrivals between snapshots.
pub const DEFAULT_CADENCE: NonZeroU32 = match NonZeroU32::new(30) {
    Some(n) => n,
    None => unreachable!(),
};

/// Counts processed arrivals for one stream and fires every `threshold` calls.
#[derive(Clone, Debug)]
pub struct CadenceCounter {
    count: u32,
    threshold: NonZeroU32,
}

impl CadenceCounter {
    pub fn new(threshold: NonZeroU32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Register one processed arrival. Returns `true` when this arrival reaches
    /// the threshold, in which case the counter is back at zero.
    pub fn record_arrival(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold.get() {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> NonZeroU32 {
        self.threshold
    }
}

impl Default for CadenceCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CADENCE)
    }
}
