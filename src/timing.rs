//! Client/server clock estimation.
//!
//! A two-dimensional Kalman filter tracks the offset between the local and
//! the server clock together with its drift, fed by round-trip time-sync
//! samples. Once two samples have been absorbed the filter projects
//! timestamps in both directions with microsecond-level accuracy.
//!
//! Each `client/time` / `server/time` exchange yields a measured offset and
//! a path-delay bound; the delay bounds the measurement variance, and an
//! adaptive forgetting factor reinflates the covariance when a residual
//! jump suggests the remote clock stepped.

use crate::protocol::messages::ServerTime;

/// Default process noise standard deviation, microseconds of offset noise
/// per microsecond of elapsed time.
pub const DEFAULT_PROCESS_STD: f64 = 0.1;

/// Default covariance inflation factor applied (squared) when a residual
/// exceeds the adaptive-forgetting cutoff.
pub const DEFAULT_FORGET_FACTOR: f64 = 2.0;

/// Sample count after which the filter switches from settling to the
/// adaptive-forgetting regime.
const SETTLED_COUNT: u32 = 100;

/// Fraction of the measured path delay a residual must exceed to trigger
/// covariance inflation.
const FORGET_CUTOFF: f64 = 0.75;

/// One measurement derived from a time-sync round trip.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RttSample {
    /// Estimated clock offset in microseconds.
    pub offset: f64,
    /// Estimated one-way path delay in microseconds; bounds the
    /// measurement error.
    pub delay: f64,
}

impl RttSample {
    /// Derives offset and delay from a `server/time` reply received at
    /// local time `now_rx_us`.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn from_reply(reply: &ServerTime, now_rx_us: i64) -> Self {
        let outbound = (reply.server_received - reply.client_transmitted) as f64;
        let inbound = (reply.server_transmitted - now_rx_us) as f64;
        let round_trip = (now_rx_us - reply.client_transmitted) as f64;
        let server_hold = (reply.server_transmitted - reply.server_received) as f64;
        Self {
            offset: (outbound + inbound) / 2.0,
            delay: (round_trip - server_hold) / 2.0,
        }
    }
}

/// Two-dimensional Kalman estimator of clock offset and drift.
#[derive(Clone, Debug)]
pub struct TimeFilter {
    offset: f64,
    drift: f64,
    last_update_us: i64,
    count: u32,
    p_oo: f64,
    p_od: f64,
    p_dd: f64,
    /// Process noise variance, `process_std²`.
    q: f64,
    /// Covariance inflation, `forget_factor²`.
    forget: f64,
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeFilter {
    /// A filter with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tuning(DEFAULT_PROCESS_STD, DEFAULT_FORGET_FACTOR)
    }

    /// A filter with explicit process noise and forgetting factor.
    #[must_use]
    pub fn with_tuning(process_std: f64, forget_factor: f64) -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            last_update_us: 0,
            count: 0,
            p_oo: 0.0,
            p_od: 0.0,
            p_dd: 0.0,
            q: process_std * process_std,
            forget: forget_factor * forget_factor,
        }
    }

    /// Absorbs one measurement taken at local time `t_us`.
    ///
    /// `measurement` is the sampled clock offset, `max_error` the path
    /// delay bounding its accuracy. A repeated timestamp is a retransmit
    /// and is ignored.
    pub fn update(&mut self, measurement: f64, max_error: f64, t_us: i64) {
        if self.count > 0 && t_us == self.last_update_us {
            return;
        }

        #[expect(clippy::cast_precision_loss)]
        let dt = (t_us - self.last_update_us) as f64;
        let r = max_error * max_error;

        match self.count {
            0 => {
                self.offset = measurement;
                self.p_oo = r;
                self.drift = 0.0;
                self.count = 1;
            }
            1 => {
                self.drift = (measurement - self.offset) / dt;
                self.offset = measurement;
                self.p_dd = (self.p_oo + r) / dt;
                self.p_oo = r;
                self.count = 2;
            }
            _ => {
                // Predict.
                let offset_pred = self.offset + self.drift * dt;
                let mut p_oo = self.p_oo + 2.0 * self.p_od * dt + self.p_dd * dt * dt + self.q * dt;
                let mut p_od = self.p_od + self.p_dd * dt;
                let mut p_dd = self.p_dd;

                let residual = measurement - offset_pred;
                if self.count < SETTLED_COUNT {
                    self.count += 1;
                } else if residual.abs() > max_error * FORGET_CUTOFF {
                    // A settled filter that suddenly disagrees with the
                    // measurement has likely seen a clock step; inflate the
                    // covariance to reacquire lock.
                    p_oo *= self.forget;
                    p_od *= self.forget;
                    p_dd *= self.forget;
                }

                // Correct.
                let u = 1.0 / (p_oo + r);
                let k_o = p_oo * u;
                let k_d = p_od * u;
                self.offset = offset_pred + k_o * residual;
                self.drift += k_d * residual;
                self.p_oo = p_oo - k_o * p_oo;
                self.p_od = p_od - k_d * p_oo;
                self.p_dd = p_dd - k_d * p_od;
            }
        }

        self.last_update_us = t_us;
    }

    /// Returns the filter to its initial, unsynchronized state. Tuning is
    /// preserved.
    pub fn reset(&mut self) {
        self.offset = 0.0;
        self.drift = 0.0;
        self.last_update_us = 0;
        self.count = 0;
        self.p_oo = 0.0;
        self.p_od = 0.0;
        self.p_dd = 0.0;
    }

    /// Whether enough samples have been absorbed to project time.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.count >= 2 && self.p_oo.is_finite()
    }

    /// One-sigma offset uncertainty, rounded to microseconds.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn error_us(&self) -> i64 {
        self.p_oo.sqrt().round() as i64
    }

    /// Current offset estimate in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> f64 {
        self.offset
    }

    /// Current drift estimate, offset microseconds per elapsed microsecond.
    #[must_use]
    pub fn drift(&self) -> f64 {
        self.drift
    }

    /// Number of absorbed samples.
    #[must_use]
    pub fn sample_count(&self) -> u32 {
        self.count
    }

    /// Projects a local timestamp onto the server clock.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn server_from_client(&self, client_us: i64) -> i64 {
        let elapsed = (client_us - self.last_update_us) as f64;
        client_us + (self.offset + self.drift * elapsed).round() as i64
    }

    /// Projects a server timestamp onto the local clock.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn client_from_server(&self, server_us: i64) -> i64 {
        let numerator = server_us as f64 - self.offset + self.drift * self.last_update_us as f64;
        (numerator / (1.0 + self.drift)).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() <= eps, "{a} !~ {b}");
    }

    #[test]
    fn bootstrap_locks_after_two_samples() {
        let mut filter = TimeFilter::new();
        assert!(!filter.is_synchronized());

        filter.update(100.0, 10.0, 0);
        assert!(!filter.is_synchronized());
        assert_close(filter.offset_us(), 100.0, 1e-9);

        filter.update(120.0, 10.0, 1_000_000);
        assert!(filter.is_synchronized());
        assert_close(filter.offset_us(), 120.0, 1e-9);
        assert_close(filter.drift(), 20e-6, 1e-12);

        filter.update(140.0, 10.0, 2_000_000);
        filter.update(160.0, 10.0, 3_000_000);
        assert!(filter.is_synchronized());
        assert!(filter.error_us() > 0);
        assert!(filter.error_us() <= 10);
        // Prediction tracks the linear ramp, so residuals stay small.
        assert_close(filter.offset_us(), 160.0, 0.5);
    }

    #[test]
    fn covariance_stays_positive_semidefinite() {
        let mut filter = TimeFilter::new();
        let measurements = [
            (100.0, 10.0),
            (118.0, 12.0),
            (143.0, 9.0),
            (155.0, 30.0),
            (181.0, 11.0),
            (199.0, 10.0),
            (225.0, 14.0),
        ];
        for (i, (m, e)) in measurements.iter().enumerate() {
            filter.update(*m, *e, i as i64 * 1_000_000);
        }
        assert!(filter.p_oo >= 0.0);
        assert!(filter.p_dd >= 0.0);
        assert!(filter.p_oo * filter.p_dd - filter.p_od * filter.p_od >= -1e-6);
    }

    #[test]
    fn repeated_timestamp_is_ignored() {
        let mut filter = TimeFilter::new();
        filter.update(100.0, 10.0, 0);
        filter.update(120.0, 10.0, 1_000_000);
        let before = filter.clone();
        filter.update(999.0, 1.0, 1_000_000);
        assert_close(filter.offset_us(), before.offset_us(), 1e-12);
        assert_close(filter.drift(), before.drift(), 1e-12);
    }

    #[test]
    fn projection_matches_known_state() {
        let mut filter = TimeFilter::new();
        // First sample pins offset with zero drift at the sample time.
        filter.update(1_000_000.0, 10.0, 5_000_000);
        assert_eq!(filter.server_from_client(10_000_000), 11_000_000);
        assert_eq!(filter.client_from_server(11_000_000), 10_000_000);
    }

    #[test]
    fn projections_are_inverse_with_small_drift() {
        let mut filter = TimeFilter::new();
        filter.update(1_000_000.0, 10.0, 0);
        filter.update(1_000_000.0, 10.0, 1_000_000);
        for &client_us in &[0i64, 123_456, 10_000_000, 987_654_321] {
            let roundtrip = filter.client_from_server(filter.server_from_client(client_us));
            assert!((roundtrip - client_us).abs() <= 1, "{roundtrip} vs {client_us}");
        }
    }

    #[test]
    fn reset_returns_to_unsynchronized() {
        let mut filter = TimeFilter::new();
        filter.update(100.0, 10.0, 0);
        filter.update(120.0, 10.0, 1_000_000);
        assert!(filter.is_synchronized());
        filter.reset();
        assert!(!filter.is_synchronized());
        assert_eq!(filter.sample_count(), 0);
    }

    #[test]
    fn rtt_sample_derivation() {
        // Client sends at 1000, server receives at its 2100, replies at its
        // 2200, client receives at 1400: offset 950, delay 150.
        let reply = ServerTime {
            client_transmitted: 1_000,
            server_received: 2_100,
            server_transmitted: 2_200,
        };
        let sample = RttSample::from_reply(&reply, 1_400);
        assert_close(sample.offset, 950.0, 1e-9);
        assert_close(sample.delay, 150.0, 1e-9);
    }
}
