//! Connection quality monitoring
//!
//! Each connected peer gets its own sampling task. A task reads the
//! transport's cumulative counters on a fixed interval, turns the difference
//! between two readings into latency / loss / jitter / throughput, classifies
//! the result and runs it through a dwell filter so the user-facing level does
//! not flap on a single noisy sample.
//!
//! Classification takes the worst of the per-dimension levels, so making any
//! one metric better can never make the level worse.

use crate::config::QualityConfig;
use crate::identity::ParticipantId;
use crate::transport::PeerTransport;
use crate::types::{ConnectionQualityMetrics, QualityLevel, TransportStats};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Floor applied to the sampling period
const MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bounds (exclusive) of one quality band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandLimits {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Packet loss in percent
    pub packet_loss_pct: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
}

/// Classification thresholds
///
/// A metric below the `excellent` bound is excellent, below `good` is good,
/// below `fair` is fair, anything else is poor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Excellent band
    pub excellent: BandLimits,
    /// Good band
    pub good: BandLimits,
    /// Fair band
    pub fair: BandLimits,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent: BandLimits {
                latency_ms: 100.0,
                packet_loss_pct: 0.5,
                jitter_ms: 20.0,
            },
            good: BandLimits {
                latency_ms: 200.0,
                packet_loss_pct: 2.0,
                jitter_ms: 40.0,
            },
            fair: BandLimits {
                latency_ms: 400.0,
                packet_loss_pct: 5.0,
                jitter_ms: 80.0,
            },
        }
    }
}

/// One interval's worth of derived metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Packet loss over the interval, percent
    pub packet_loss_pct: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Throughput over the interval, kilobytes per second
    pub bandwidth_kbytes_per_sec: f64,
}

impl QualitySample {
    /// Whether this sample is at least as good as `other` in every classified metric
    pub fn dominates(&self, other: &QualitySample) -> bool {
        self.latency_ms <= other.latency_ms
            && self.packet_loss_pct <= other.packet_loss_pct
            && self.jitter_ms <= other.jitter_ms
    }

    /// Whether this sample dominates `other` and is strictly better in some metric
    pub fn improves_on(&self, other: &QualitySample) -> bool {
        self.dominates(other)
            && (self.latency_ms < other.latency_ms
                || self.packet_loss_pct < other.packet_loss_pct
                || self.jitter_ms < other.jitter_ms)
    }
}

fn band(value: f64, excellent: f64, good: f64, fair: f64) -> QualityLevel {
    if !value.is_finite() {
        return QualityLevel::Poor;
    }
    if value < excellent {
        QualityLevel::Excellent
    } else if value < good {
        QualityLevel::Good
    } else if value < fair {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Classify a sample
///
/// Pure and monotonic: lowering any metric never lowers the result.
pub fn classify(sample: &QualitySample, thresholds: &QualityThresholds) -> QualityLevel {
    let t = thresholds;
    let latency = band(
        sample.latency_ms,
        t.excellent.latency_ms,
        t.good.latency_ms,
        t.fair.latency_ms,
    );
    let loss = band(
        sample.packet_loss_pct,
        t.excellent.packet_loss_pct,
        t.good.packet_loss_pct,
        t.fair.packet_loss_pct,
    );
    let jitter = band(
        sample.jitter_ms,
        t.excellent.jitter_ms,
        t.good.jitter_ms,
        t.fair.jitter_ms,
    );
    latency.min(loss).min(jitter)
}

/// RFC 3550 style running jitter estimate over RTT samples
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    previous_rtt: Option<f64>,
    jitter: f64,
}

impl JitterEstimator {
    /// Feed one RTT reading and return the updated estimate
    pub fn update(&mut self, rtt_ms: f64) -> f64 {
        if let Some(prev) = self.previous_rtt {
            let d = (rtt_ms - prev).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.previous_rtt = Some(rtt_ms);
        self.jitter
    }
}

/// Derive a sample from two counter readings `elapsed` apart
///
/// Returns `None` when the interval is empty or no RTT is available.
pub fn compute_sample(
    previous: &TransportStats,
    current: &TransportStats,
    elapsed: Duration,
    jitter: &mut JitterEstimator,
) -> Option<QualitySample> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    let latency_ms = current.round_trip_time_ms?;

    let bytes = current
        .bytes_sent
        .saturating_sub(previous.bytes_sent)
        .saturating_add(current.bytes_received.saturating_sub(previous.bytes_received));
    let received = current
        .packets_received
        .saturating_sub(previous.packets_received);
    let lost = current.packets_lost.saturating_sub(previous.packets_lost);
    let total = received + lost;
    let packet_loss_pct = if total == 0 {
        0.0
    } else {
        lost as f64 / total as f64 * 100.0
    };

    let estimated = jitter.update(latency_ms);
    let jitter_ms = current.jitter_ms.unwrap_or(estimated);

    Some(QualitySample {
        latency_ms,
        packet_loss_pct,
        jitter_ms,
        bandwidth_kbytes_per_sec: bytes as f64 / 1000.0 / secs,
    })
}

/// Dwell filter over raw classifications
///
/// The first sample after `unknown` is shown immediately. After that the
/// level moves only when `upgrade_dwell` consecutive samples classify above
/// it, or `downgrade_dwell` consecutive samples classify below it. A sample
/// that improves on its predecessor never counts towards a downgrade.
#[derive(Debug, Clone)]
pub struct QualitySmoother {
    level: QualityLevel,
    upgrade_dwell: u32,
    downgrade_dwell: u32,
    streak: Option<Streak>,
    previous: Option<QualitySample>,
}

#[derive(Debug, Clone, Copy)]
struct Streak {
    upward: bool,
    count: u32,
    // Most conservative level seen during the streak
    target: QualityLevel,
}

impl QualitySmoother {
    /// Create a smoother starting at `unknown`
    pub fn new(upgrade_dwell: u32, downgrade_dwell: u32) -> Self {
        Self {
            level: QualityLevel::Unknown,
            upgrade_dwell: upgrade_dwell.max(1),
            downgrade_dwell: downgrade_dwell.max(1),
            streak: None,
            previous: None,
        }
    }

    /// Current smoothed level
    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// Forget history and return to `unknown`
    pub fn reset(&mut self) {
        self.level = QualityLevel::Unknown;
        self.streak = None;
        self.previous = None;
    }

    /// Feed one sample with its raw classification
    pub fn observe(&mut self, sample: &QualitySample, raw: QualityLevel) -> QualityLevel {
        let improved = self.previous.is_some_and(|p| sample.improves_on(&p));
        self.previous = Some(*sample);

        if !self.level.is_known() {
            self.level = raw;
            self.streak = None;
            return self.level;
        }
        if raw == self.level {
            self.streak = None;
            return self.level;
        }

        let upward = raw > self.level;
        if !upward && improved {
            return self.level;
        }

        let streak = match self.streak {
            Some(s) if s.upward == upward => Streak {
                upward,
                count: s.count + 1,
                target: if upward { s.target.min(raw) } else { s.target.max(raw) },
            },
            _ => Streak {
                upward,
                count: 1,
                target: raw,
            },
        };

        let dwell = if upward {
            self.upgrade_dwell
        } else {
            self.downgrade_dwell
        };
        if streak.count >= dwell {
            self.level = streak.target;
            self.streak = None;
        } else {
            self.streak = Some(streak);
        }
        self.level
    }
}

/// Per-peer sampling state
#[derive(Debug, Clone)]
pub struct PeerSampler {
    thresholds: QualityThresholds,
    smoother: QualitySmoother,
    jitter: JitterEstimator,
    baseline: Option<(TransportStats, Instant)>,
}

impl PeerSampler {
    /// Create a sampler from quality settings
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            smoother: QualitySmoother::new(config.upgrade_dwell, config.downgrade_dwell),
            jitter: JitterEstimator::default(),
            baseline: None,
        }
    }

    /// Ingest one stats reading taken at `now`
    ///
    /// Returns metrics to publish: a classified sample, or an `unknown`
    /// report when stats became unavailable. The first reading only
    /// establishes the baseline.
    pub fn ingest(
        &mut self,
        stats: Option<TransportStats>,
        now: Instant,
    ) -> Option<ConnectionQualityMetrics> {
        let Some(stats) = stats else {
            let was_known = self.smoother.level().is_known();
            self.baseline = None;
            self.jitter = JitterEstimator::default();
            self.smoother.reset();
            return was_known.then(ConnectionQualityMetrics::unknown);
        };

        let previous = self.baseline.replace((stats, now));
        let (prev_stats, prev_at) = previous?;
        let sample = compute_sample(
            &prev_stats,
            &stats,
            now.saturating_duration_since(prev_at),
            &mut self.jitter,
        )?;
        let raw = classify(&sample, &self.thresholds);
        let level = self.smoother.observe(&sample, raw);

        Some(ConnectionQualityMetrics {
            latency_ms: sample.latency_ms,
            packet_loss_pct: sample.packet_loss_pct,
            jitter_ms: sample.jitter_ms,
            bandwidth_kbytes_per_sec: sample.bandwidth_kbytes_per_sec,
            quality_level: level,
            sampled_at: Utc::now(),
        })
    }
}

/// Metrics published by the monitor
#[derive(Debug, Clone)]
pub struct QualityUpdate {
    /// Remote participant
    pub peer_id: ParticipantId,
    /// New metrics
    pub metrics: ConnectionQualityMetrics,
}

struct SamplingTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodic quality sampling for every connected peer
pub struct ConnectionQualityMonitor {
    config: QualityConfig,
    tasks: Mutex<HashMap<ParticipantId, SamplingTask>>,
    latest: Arc<Mutex<HashMap<ParticipantId, ConnectionQualityMetrics>>>,
    updates: mpsc::UnboundedSender<QualityUpdate>,
}

impl ConnectionQualityMonitor {
    /// Create a monitor and the receiver its updates are published on
    pub fn new(config: QualityConfig) -> (Self, mpsc::UnboundedReceiver<QualityUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                tasks: Mutex::new(HashMap::new()),
                latest: Arc::new(Mutex::new(HashMap::new())),
                updates,
            },
            rx,
        )
    }

    /// Start sampling `peer_id`, replacing any previous task for it
    pub fn start_peer(&self, peer_id: ParticipantId, transport: Arc<dyn PeerTransport>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sample_loop(
            peer_id.clone(),
            transport,
            self.config.clone(),
            self.latest.clone(),
            self.updates.clone(),
            shutdown_rx,
        ));

        let previous = self
            .tasks
            .lock()
            .insert(peer_id.clone(), SamplingTask { shutdown, task });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            previous.task.abort();
        }
        tracing::debug!(peer_id = %peer_id, interval_ms = self.config.sampling_interval.as_millis() as u64, "Quality sampling started");
    }

    /// Stop sampling `peer_id` and report it as `unknown`
    ///
    /// Returns whether a task was running.
    pub fn stop_peer(&self, peer_id: &ParticipantId) -> bool {
        let Some(sampling) = self.tasks.lock().remove(peer_id) else {
            return false;
        };
        let _ = sampling.shutdown.send(true);
        sampling.task.abort();
        self.latest.lock().remove(peer_id);
        let _ = self.updates.send(QualityUpdate {
            peer_id: peer_id.clone(),
            metrics: ConnectionQualityMetrics::unknown(),
        });
        tracing::debug!(peer_id = %peer_id, "Quality sampling stopped");
        true
    }

    /// Cancel every sampling task and wait for them to finish
    pub async fn stop(&self) {
        let drained: Vec<(ParticipantId, SamplingTask)> = self.tasks.lock().drain().collect();
        for (_, sampling) in &drained {
            let _ = sampling.shutdown.send(true);
        }
        for (peer_id, sampling) in drained {
            if let Err(e) = sampling.task.await {
                if !e.is_cancelled() {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Sampling task failed");
                }
            }
        }
        self.latest.lock().clear();
    }

    /// Number of live sampling tasks
    pub fn active_timers(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| !t.task.is_finished())
            .count()
    }

    /// Last metrics published for `peer_id`
    pub fn latest(&self, peer_id: &ParticipantId) -> Option<ConnectionQualityMetrics> {
        self.latest.lock().get(peer_id).cloned()
    }
}

impl Drop for ConnectionQualityMonitor {
    fn drop(&mut self) {
        for (_, sampling) in self.tasks.lock().drain() {
            let _ = sampling.shutdown.send(true);
            sampling.task.abort();
        }
    }
}

async fn sample_loop(
    peer_id: ParticipantId,
    transport: Arc<dyn PeerTransport>,
    config: QualityConfig,
    latest: Arc<Mutex<HashMap<ParticipantId, ConnectionQualityMetrics>>>,
    updates: mpsc::UnboundedSender<QualityUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    // `interval` panics on a zero period
    let period = config.sampling_interval.max(MIN_SAMPLING_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sampler = PeerSampler::new(&config);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let stats = tokio::select! {
            _ = shutdown.changed() => break,
            stats = transport.get_stats() => stats,
        };
        if *shutdown.borrow() {
            break;
        }

        if let Some(metrics) = sampler.ingest(stats, Instant::now()) {
            tracing::trace!(
                peer_id = %peer_id,
                latency_ms = metrics.latency_ms,
                loss_pct = metrics.packet_loss_pct,
                level = %metrics.quality_level,
                "Quality sample"
            );
            latest.lock().insert(peer_id.clone(), metrics.clone());
            if updates
                .send(QualityUpdate {
                    peer_id: peer_id.clone(),
                    metrics,
                })
                .is_err()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(latency: f64, loss: f64, jitter: f64) -> QualitySample {
        QualitySample {
            latency_ms: latency,
            packet_loss_pct: loss,
            jitter_ms: jitter,
            bandwidth_kbytes_per_sec: 100.0,
        }
    }

    #[test]
    fn test_classify_bands() {
        let t = QualityThresholds::default();
        assert_eq!(classify(&sample(40.0, 0.0, 5.0), &t), QualityLevel::Excellent);
        assert_eq!(classify(&sample(150.0, 0.0, 5.0), &t), QualityLevel::Good);
        assert_eq!(classify(&sample(40.0, 3.0, 5.0), &t), QualityLevel::Fair);
        assert_eq!(classify(&sample(40.0, 0.0, 200.0), &t), QualityLevel::Poor);
        assert_eq!(classify(&sample(f64::NAN, 0.0, 5.0), &t), QualityLevel::Poor);
    }

    #[test]
    fn test_compute_sample_deltas() {
        let prev = TransportStats {
            bytes_sent: 1_000,
            bytes_received: 1_000,
            packets_received: 100,
            packets_lost: 0,
            round_trip_time_ms: Some(50.0),
            jitter_ms: None,
        };
        let cur = TransportStats {
            bytes_sent: 101_000,
            bytes_received: 101_000,
            packets_received: 190,
            packets_lost: 10,
            round_trip_time_ms: Some(50.0),
            jitter_ms: Some(12.0),
        };
        let mut jitter = JitterEstimator::default();
        let s = compute_sample(&prev, &cur, Duration::from_secs(2), &mut jitter).unwrap();
        assert!((s.bandwidth_kbytes_per_sec - 100.0).abs() < f64::EPSILON);
        assert!((s.packet_loss_pct - 10.0).abs() < 1e-9);
        assert!((s.jitter_ms - 12.0).abs() < f64::EPSILON);
        assert!((s.latency_ms - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_sample_without_rtt_is_unavailable() {
        let stats = TransportStats::default();
        let mut jitter = JitterEstimator::default();
        assert!(compute_sample(&stats, &stats, Duration::from_secs(1), &mut jitter).is_none());
    }

    #[test]
    fn test_jitter_estimate_from_rtt_variation() {
        let mut jitter = JitterEstimator::default();
        assert_eq!(jitter.update(100.0), 0.0);
        let j = jitter.update(132.0);
        assert!((j - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_smoother_first_sample_immediate() {
        let mut s = QualitySmoother::new(2, 2);
        assert_eq!(s.observe(&sample(300.0, 0.0, 0.0), QualityLevel::Fair), QualityLevel::Fair);
    }

    #[test]
    fn test_smoother_requires_dwell_to_downgrade() {
        let mut s = QualitySmoother::new(2, 2);
        s.observe(&sample(40.0, 0.0, 5.0), QualityLevel::Excellent);
        assert_eq!(
            s.observe(&sample(500.0, 0.0, 5.0), QualityLevel::Poor),
            QualityLevel::Excellent
        );
        // Recovery interrupts the streak
        assert_eq!(
            s.observe(&sample(40.0, 0.0, 5.0), QualityLevel::Excellent),
            QualityLevel::Excellent
        );
        s.observe(&sample(500.0, 0.0, 5.0), QualityLevel::Poor);
        assert_eq!(
            s.observe(&sample(600.0, 0.0, 5.0), QualityLevel::Poor),
            QualityLevel::Poor
        );
    }

    #[test]
    fn test_smoother_sustained_degradation_commits() {
        let mut s = QualitySmoother::new(2, 2);
        s.observe(&sample(40.0, 0.0, 5.0), QualityLevel::Excellent);
        s.observe(&sample(500.0, 10.0, 5.0), QualityLevel::Poor);
        assert_eq!(
            s.observe(&sample(500.0, 10.0, 5.0), QualityLevel::Poor),
            QualityLevel::Poor
        );
    }

    #[test]
    fn test_smoother_improving_sample_holds_level() {
        let mut s = QualitySmoother::new(2, 2);
        s.observe(&sample(40.0, 0.0, 5.0), QualityLevel::Excellent);
        s.observe(&sample(500.0, 0.0, 5.0), QualityLevel::Poor);
        assert_eq!(
            s.observe(&sample(450.0, 0.0, 5.0), QualityLevel::Poor),
            QualityLevel::Excellent
        );
    }

    #[test]
    fn test_smoother_upgrade_commits_conservative_level() {
        let mut s = QualitySmoother::new(2, 2);
        s.observe(&sample(500.0, 0.0, 5.0), QualityLevel::Poor);
        s.observe(&sample(40.0, 0.0, 5.0), QualityLevel::Excellent);
        assert_eq!(
            s.observe(&sample(150.0, 0.0, 5.0), QualityLevel::Good),
            QualityLevel::Good
        );
    }

    #[test]
    fn test_sampler_reports_unknown_when_stats_vanish() {
        let mut sampler = PeerSampler::new(&QualityConfig::default());
        let t0 = Instant::now();
        let stats = TransportStats {
            round_trip_time_ms: Some(30.0),
            jitter_ms: Some(2.0),
            ..Default::default()
        };
        assert!(sampler.ingest(Some(stats), t0).is_none());
        let m = sampler
            .ingest(Some(stats), t0 + Duration::from_secs(2))
            .unwrap();
        assert_eq!(m.quality_level, QualityLevel::Excellent);

        let m = sampler.ingest(None, t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(m.quality_level, QualityLevel::Unknown);
        assert!(sampler.ingest(None, t0 + Duration::from_secs(6)).is_none());
    }

    fn arb_sample() -> impl Strategy<Value = QualitySample> {
        (0.0f64..1000.0, 0.0f64..50.0, 0.0f64..300.0).prop_map(|(l, p, j)| sample(l, p, j))
    }

    proptest! {
        #[test]
        fn prop_classify_monotonic(s in arb_sample(), dl in 0.0f64..1.0, dp in 0.0f64..1.0, dj in 0.0f64..1.0) {
            let t = QualityThresholds::default();
            let better = sample(s.latency_ms * dl, s.packet_loss_pct * dp, s.jitter_ms * dj);
            prop_assert!(classify(&better, &t) >= classify(&s, &t));
        }

        #[test]
        fn prop_smoothed_level_never_drops_while_improving(
            start in arb_sample(),
            factors in proptest::collection::vec((0.5f64..=1.0, 0.5f64..=1.0, 0.5f64..=1.0), 1..30),
        ) {
            let t = QualityThresholds::default();
            let mut smoother = QualitySmoother::new(2, 2);
            let mut current = start;
            let mut level = smoother.observe(&current, classify(&current, &t));
            for (fl, fp, fj) in factors {
                current = sample(current.latency_ms * fl, current.packet_loss_pct * fp, current.jitter_ms * fj);
                let next = smoother.observe(&current, classify(&current, &t));
                prop_assert!(next >= level);
                level = next;
            }
        }
    }
}
