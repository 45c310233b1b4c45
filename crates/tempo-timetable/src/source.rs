use tempo_core::time::{actual_timeperiod, to_datetime};
use tempo_core::{Clock, Qualifier};
use tempo_store::Result;

/// Reports the data-range markers covering a time window.
///
/// Continuous and recomputing pipelines stamp these markers onto their
/// units of work. Markers are opaque ascending cursors; a window whose data
/// has grown yields a larger `end_id`.
pub trait DataSource: Send + Sync {
    /// `(start_id, end_id)` for `[start_timeperiod, end_timeperiod)` in `source`.
    fn range_bounds(
        &self,
        source: Option<&str>,
        start_timeperiod: &str,
        end_timeperiod: &str,
    ) -> Result<(String, String)>;
}

/// Wall-clock markers: the window start and the latest instant observed
/// inside the window, both rendered in real-time form.
///
/// Suits sources that accumulate continuously; while the window is open
/// `end_id` advances with the clock and freezes once the window closes.
#[derive(Debug, Clone)]
pub struct ClockSource {
    clock: Clock,
}

impl ClockSource {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }
}

impl DataSource for ClockSource {
    fn range_bounds(
        &self,
        _source: Option<&str>,
        start_timeperiod: &str,
        end_timeperiod: &str,
    ) -> Result<(String, String)> {
        let start = to_datetime(start_timeperiod)?;
        let end = to_datetime(end_timeperiod)?;
        let observed = self.clock.now().min(end);
        Ok((
            actual_timeperiod(Qualifier::RealTime, start),
            actual_timeperiod(Qualifier::RealTime, observed.max(start)),
        ))
    }
}
