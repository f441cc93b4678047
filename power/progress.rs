/// Most progress notifications a serial run emits.
pub const MAX_PROGRESS_UPDATES: usize = 50;

/// Observer for reporting incremental progress through the replicates of a run.
pub trait ProgressObserver {
    fn on_start(&mut self, total_replicates: usize) {
        let _ = total_replicates;
    }
    /// `fraction` is the share of the whole run completed since the previous call.
    fn on_advance(&mut self, fraction: f64) {
        let _ = fraction;
    }
    fn on_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Adapts a closure receiving incremental fractions.
pub struct FnProgress<F: FnMut(f64)>(pub F);

impl<F: FnMut(f64)> ProgressObserver for FnProgress<F> {
    fn on_advance(&mut self, fraction: f64) {
        (self.0)(fraction)
    }
}

/// Replicate counts after which a serial run reports progress: every replicate when
/// `nsim` is small, otherwise fifty roughly even points ending at `nsim`.
pub fn checkpoints(nsim: usize) -> Vec<usize> {
    let steps = nsim.min(MAX_PROGRESS_UPDATES);
    (1..=steps).map(|k| k * nsim / steps).collect()
}
