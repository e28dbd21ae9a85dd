//! TSC rate estimation from in-band counter reads.
//!
//! Some delayed-event backends report time in TSC cycles rather than
//! nanoseconds. For those, the rate is derived from the data itself: every
//! raw datapoint carries `BICyc` and `BIMonotonic`, a TSC read and a
//! monotonic-clock read taken back to back with interrupts disabled before
//! the CPU enters idle. Two such pairs far enough apart give cycles per
//! microsecond. Until the rate is known, datapoints are held in a queue and
//! released together once it is.

use crate::datapoint::{self as dp, Datapoint};
use crate::error::{Error, Result};
use crate::human;

/// Default amount of time to spend collecting datapoints for the rate
/// calculation, in nanoseconds. Longer generally means better accuracy.
pub const DEFAULT_CAL_TIME_NS: i64 = 10_000_000_000;

/// TSC rate estimator and cycles → nanoseconds converter.
#[derive(Debug)]
pub struct TscEstimator {
    /// Whether the backend reports time in TSC cycles at all. When false,
    /// [`TscEstimator::feed`] is a pass-through.
    enabled: bool,
    cal_time_ns: i64,
    mhz: Option<f64>,
    /// TSC / monotonic values from the first usable datapoint.
    first: Option<(i64, i64)>,
    queue: Vec<Datapoint>,
}

impl TscEstimator {
    pub fn new(enabled: bool, cal_time_ns: i64) -> Self {
        Self {
            enabled,
            cal_time_ns,
            mhz: None,
            first: None,
            queue: Vec::new(),
        }
    }

    /// The estimated TSC rate in MHz, once known.
    pub fn mhz(&self) -> Option<f64> {
        self.mhz
    }

    /// Feed a raw datapoint.
    ///
    /// Returns the datapoint unchanged when no estimation is needed or the
    /// rate is already known. Otherwise the datapoint is queued (and used
    /// for the rate calculation unless an SMI/NMI may have straddled the
    /// paired counter reads) and `None` is returned; the queue is released
    /// by [`TscEstimator::drain`] once the rate is known.
    pub fn feed(&mut self, datapoint: Datapoint) -> Result<Option<Datapoint>> {
        if !self.enabled || self.mhz.is_some() {
            return Ok(Some(datapoint));
        }

        self.calculate(&datapoint)?;
        self.queue.push(datapoint);
        Ok(None)
    }

    fn calculate(&mut self, datapoint: &Datapoint) -> Result<()> {
        if datapoint.int(dp::SMI_CNT).unwrap_or(0) != 0
            || datapoint.int(dp::NMI_CNT).unwrap_or(0) != 0
        {
            log::debug!(
                "NMI/SMI detected, won't use the datapoint for TSC rate calculations:\n{}",
                datapoint.dump()
            );
            return Ok(());
        }

        let tsc = datapoint.int(dp::BI_CYC).unwrap_or(0);
        let ts = datapoint.int(dp::BI_MONOTONIC).unwrap_or(0);

        let Some((tsc1, ts1)) = self.first else {
            self.first = Some((tsc, ts));
            log::info!(
                "Calculating TSC rate for {}",
                human::duration_ns(self.cal_time_ns)
            );
            return Ok(());
        };

        if ts - ts1 < self.cal_time_ns {
            return Ok(());
        }

        if ts == ts1 {
            log::debug!(
                "monotonic time did not change, won't use the datapoint for TSC rate \
                 calculations:\n{}",
                datapoint.dump()
            );
            return Ok(());
        }

        let mhz = ((tsc - tsc1) as f64 * 1000.0) / (ts - ts1) as f64;
        if mhz <= 0.0 || !mhz.is_finite() {
            return Err(Error::TscEstimation { mhz });
        }

        log::info!("TSC rate is {mhz:.6} MHz");
        self.mhz = Some(mhz);
        Ok(())
    }

    /// Release the held datapoints once the rate is known.
    pub fn drain(&mut self) -> Vec<Datapoint> {
        if self.mhz.is_some() {
            std::mem::take(&mut self.queue)
        } else {
            Vec::new()
        }
    }

    /// Convert TSC cycles to nanoseconds. `None` until the rate is known.
    pub fn cyc_to_ns(&self, cyc: i64) -> Option<i64> {
        self.mhz.map(|mhz| ((cyc as f64 * 1000.0) / mhz) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::Value;

    fn rawdp(bicyc: i64, bimono: i64, smi: i64, nmi: i64) -> Datapoint {
        let mut datapoint = Datapoint::new();
        datapoint.set(dp::BI_CYC, Value::Int(bicyc));
        datapoint.set(dp::BI_MONOTONIC, Value::Int(bimono));
        datapoint.set(dp::SMI_CNT, Value::Int(smi));
        datapoint.set(dp::NMI_CNT, Value::Int(nmi));
        datapoint
    }

    #[test]
    fn test_disabled_backend_passes_through() {
        let mut tsc = TscEstimator::new(false, DEFAULT_CAL_TIME_NS);
        let out = tsc.feed(rawdp(0, 0, 0, 0)).unwrap();
        assert!(out.is_some());
        assert_eq!(tsc.mhz(), None);
        assert!(tsc.drain().is_empty());
    }

    #[test]
    fn test_hold_window_and_rate() {
        let mut tsc = TscEstimator::new(true, DEFAULT_CAL_TIME_NS);

        // First datapoint records the baseline pair.
        assert!(tsc.feed(rawdp(1_000_000, 0, 0, 0)).unwrap().is_none());

        // Datapoints inside the 10s window are queued without a rate.
        for i in 1..=500 {
            let out = tsc.feed(rawdp(i * 25_000_000, i * 10_000_000, 0, 0)).unwrap();
            assert!(out.is_none());
        }
        assert_eq!(tsc.mhz(), None);
        assert!(tsc.drain().is_empty());

        // A datapoint past the window resolves the rate.
        assert!(
            tsc.feed(rawdp(25_000_000_000, 10_005_000_000, 0, 0))
                .unwrap()
                .is_none()
        );
        let mhz = tsc.mhz().unwrap();
        let expected = (25_000_000_000f64 - 1_000_000.0) * 1000.0 / 10_005_000_000.0;
        assert!((mhz - expected).abs() < 1e-9, "mhz {mhz} vs {expected}");

        // Everything queued so far is released together.
        assert_eq!(tsc.drain().len(), 502);
        assert!(tsc.drain().is_empty());

        // Later datapoints pass straight through.
        assert!(tsc.feed(rawdp(0, 0, 0, 0)).unwrap().is_some());
    }

    #[test]
    fn test_smi_nmi_samples_are_queued_but_not_used() {
        let mut tsc = TscEstimator::new(true, 1_000);

        // SMI in the very first datapoint: no baseline is recorded.
        assert!(tsc.feed(rawdp(1_000, 0, 1, 0)).unwrap().is_none());
        // Clean baseline.
        assert!(tsc.feed(rawdp(2_000, 100, 0, 0)).unwrap().is_none());
        // NMI straddles the window end: skipped for estimation.
        assert!(tsc.feed(rawdp(9_000_000, 2_000_000, 0, 1)).unwrap().is_none());
        assert_eq!(tsc.mhz(), None);

        // Clean datapoint past the window resolves the rate.
        assert!(tsc.feed(rawdp(10_000_000, 2_100_100, 0, 0)).unwrap().is_none());
        assert!(tsc.mhz().is_some());
        // All four datapoints were held, including the SMI/NMI ones.
        assert_eq!(tsc.drain().len(), 4);
    }

    #[test]
    fn test_negative_rate_is_an_error() {
        let mut tsc = TscEstimator::new(true, 1_000);
        tsc.feed(rawdp(10_000_000, 0, 0, 0)).unwrap();
        let err = tsc.feed(rawdp(1_000, 2_000, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::TscEstimation { .. }));
    }

    #[test]
    fn test_cyc_to_ns_round_trip() {
        let mut tsc = TscEstimator::new(true, 1_000);
        tsc.feed(rawdp(0, 0, 0, 0)).unwrap();
        // 2.5 GHz: 2500 cycles per microsecond.
        tsc.feed(rawdp(2_500_000, 1_000_000, 0, 0)).unwrap();
        let mhz = tsc.mhz().unwrap();
        assert!((mhz - 2500.0).abs() < 1e-9);

        let ns_to_cyc = |ns: i64| ((ns as f64 * mhz) / 1000.0) as i64;
        for ns in [1_000i64, 12_345, 1_000_000, 987_654_321] {
            let back = tsc.cyc_to_ns(ns_to_cyc(ns)).unwrap();
            assert!((back - ns).abs() <= 1, "{ns} ns round-tripped to {back}");
        }
    }
}
