//! Network quality monitoring and closed-loop adaptation
//!
//! A per-session background task samples transport statistics on a fixed
//! interval while the session is connected, folds them into a single
//! 0-100 health score, and lets the adaptation engine derive the next
//! [`OptimizationSettings`]. Settings are immutable values replaced
//! wholesale on each tick, so consumers never observe a partial update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::transport::{PeerTransport, TransportStats};

/// Media quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
}

/// Path preference fed back to the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPreference {
    Direct,
    Relay,
    Auto,
}

/// Derived transport and media settings
///
/// A single shared instance per session, published through a `watch`
/// channel and mutated only by the adaptation engine or an explicit
/// user override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSettings {
    pub video_quality: QualityPreset,
    pub audio_quality: QualityPreset,
    pub adaptive_bitrate: bool,
    pub relay_preference: RelayPreference,
    pub connection_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            video_quality: QualityPreset::High,
            audio_quality: QualityPreset::High,
            adaptive_bitrate: true,
            relay_preference: RelayPreference::Auto,
            connection_timeout_ms: 10_000,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
        }
    }
}

/// One monitoring tick's view of the connection
#[derive(Debug, Clone)]
pub struct QualitySample {
    pub timestamp: Instant,
    pub latency_ms: f64,
    pub bandwidth_bps: u64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub score: f64,
}

impl QualitySample {
    /// Build a sample from raw transport statistics
    pub fn from_stats(stats: &TransportStats) -> Self {
        let latency_ms = stats.rtt_ms;
        let score = compute_score(
            latency_ms,
            stats.bandwidth_bps,
            stats.packet_loss_pct,
            stats.jitter_ms,
        );
        Self {
            timestamp: Instant::now(),
            latency_ms,
            bandwidth_bps: stats.bandwidth_bps,
            packet_loss_pct: stats.packet_loss_pct,
            jitter_ms: stats.jitter_ms,
            score,
        }
    }
}

/// Fold raw metrics into a 0-100 health score
///
/// Starts at 100 and applies: a latency penalty above 50 ms (capped at
/// 50 points), a bandwidth bonus above 1 Mbps (capped at 20) or penalty
/// below 500 kbps, a loss penalty above 1 %, and a jitter penalty above
/// 30 ms. The result is clamped to [0, 100] for any input.
pub fn compute_score(
    latency_ms: f64,
    bandwidth_bps: u64,
    packet_loss_pct: f64,
    jitter_ms: f64,
) -> f64 {
    let mut score = 100.0;
    let bandwidth = bandwidth_bps as f64;

    if latency_ms > 50.0 {
        score -= ((latency_ms - 50.0) / 3.0).min(50.0);
    }

    if bandwidth > 1_000_000.0 {
        score += ((bandwidth - 1_000_000.0) / 100_000.0).min(20.0);
    } else if bandwidth < 500_000.0 {
        score -= (500_000.0 - bandwidth) / 10_000.0;
    }

    if packet_loss_pct > 1.0 {
        score -= packet_loss_pct * 10.0;
    }

    if jitter_ms > 30.0 {
        score -= (jitter_ms - 30.0) / 2.0;
    }

    score.clamp(0.0, 100.0)
}

/// Latency above this forces the relay preference regardless of score
const FORCE_RELAY_LATENCY_MS: f64 = 200.0;

/// Packet loss above this forces the relay preference regardless of score
const FORCE_RELAY_LOSS_PCT: f64 = 5.0;

/// Derives settings from quality samples
///
/// Fields the user has explicitly overridden are pinned and exempt from
/// automatic derivation until the override is lifted.
pub struct AdaptationEngine {
    settings: OptimizationSettings,
    settings_tx: watch::Sender<OptimizationSettings>,
    auto_video: bool,
    auto_relay: bool,
}

impl AdaptationEngine {
    /// Create an engine publishing to a fresh settings channel
    pub fn new(initial: OptimizationSettings) -> (Self, watch::Receiver<OptimizationSettings>) {
        let (settings_tx, settings_rx) = watch::channel(initial.clone());
        (
            Self {
                settings: initial,
                settings_tx,
                auto_video: true,
                auto_relay: true,
            },
            settings_rx,
        )
    }

    /// Current settings value
    pub fn settings(&self) -> OptimizationSettings {
        self.settings.clone()
    }

    /// Pin the video quality, or pass `None` to return it to automatic
    pub fn override_video_quality(&mut self, preset: Option<QualityPreset>) {
        match preset {
            Some(preset) => {
                self.auto_video = false;
                self.settings.video_quality = preset;
            }
            None => self.auto_video = true,
        }
        self.publish();
    }

    /// Pin the relay preference, or pass `None` to return it to automatic
    pub fn override_relay_preference(&mut self, preference: Option<RelayPreference>) {
        match preference {
            Some(preference) => {
                self.auto_relay = false;
                self.settings.relay_preference = preference;
            }
            None => self.auto_relay = true,
        }
        self.publish();
    }

    /// Fold one sample into the settings and publish the result atomically
    pub fn apply_sample(&mut self, sample: &QualitySample) {
        let mut next = self.settings.clone();

        if self.auto_video {
            next.video_quality = if sample.score > 80.0 {
                QualityPreset::High
            } else if sample.score > 50.0 {
                QualityPreset::Medium
            } else {
                QualityPreset::Low
            };
        }

        if self.auto_relay {
            // severe latency or loss overrides the score bands
            next.relay_preference = if sample.latency_ms > FORCE_RELAY_LATENCY_MS
                || sample.packet_loss_pct > FORCE_RELAY_LOSS_PCT
            {
                RelayPreference::Relay
            } else {
                RelayPreference::Direct
            };
        }

        // hysteresis: widen the timeout under latency pressure, tighten
        // it slowly when the path is fast
        if sample.latency_ms > 100.0 {
            next.connection_timeout_ms = (next.connection_timeout_ms + 2000).min(30_000);
        } else if sample.latency_ms < 50.0 {
            next.connection_timeout_ms = next.connection_timeout_ms.saturating_sub(1000).max(5000);
        }

        if next != self.settings {
            debug!(
                "settings updated: video={:?} relay={:?} timeout={}ms (score {:.1})",
                next.video_quality, next.relay_preference, next.connection_timeout_ms, sample.score
            );
        }

        self.settings = next;
        self.publish();
    }

    fn publish(&self) {
        self.settings_tx.send_replace(self.settings.clone());
    }
}

/// Handle to a running quality monitor task
///
/// Aborting (or dropping) the handle cancels the task; the session
/// controller stops the monitor whenever the session leaves `Connected`.
pub struct MonitorHandle {
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the periodic quality monitor for a connected transport
///
/// Every `interval`, reads transport statistics, publishes the sample,
/// and lets the engine derive new settings.
pub fn spawn_monitor(
    transport: Arc<PeerTransport>,
    engine: Arc<Mutex<AdaptationEngine>>,
    sample_tx: watch::Sender<Option<QualitySample>>,
    interval: Duration,
) -> MonitorHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !transport.is_connected() {
                break;
            }

            let stats = transport.stats();
            let sample = QualitySample::from_stats(&stats);
            trace!(
                "quality sample: score={:.1} rtt={:.1}ms loss={:.2}% jitter={:.1}ms bw={}bps",
                sample.score,
                sample.latency_ms,
                sample.packet_loss_pct,
                sample.jitter_ms,
                sample.bandwidth_bps
            );

            engine.lock().apply_sample(&sample);
            sample_tx.send_replace(Some(sample));
        }
    });

    MonitorHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_perfect_conditions() {
        // low latency, high bandwidth, no loss, no jitter
        let score = compute_score(20.0, 3_000_000, 0.0, 5.0);
        assert_eq!(score, 100.0, "bonus is clamped at the ceiling");
    }

    #[test]
    fn test_score_clamped_to_range() {
        let worst = compute_score(10_000.0, 0, 100.0, 10_000.0);
        assert_eq!(worst, 0.0);

        let best = compute_score(0.0, u64::MAX, 0.0, 0.0);
        assert_eq!(best, 100.0);

        // zero-ish edge inputs stay in range
        for (latency, bw, loss, jitter) in [
            (0.0, 0u64, 0.0, 0.0),
            (50.0, 500_000, 1.0, 30.0),
            (51.0, 499_999, 1.1, 30.1),
            (1e9, 1, 99.9, 1e9),
        ] {
            let score = compute_score(latency, bw, loss, jitter);
            assert!((0.0..=100.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn test_score_latency_penalty() {
        let fast = compute_score(40.0, 750_000, 0.0, 0.0);
        let slow = compute_score(170.0, 750_000, 0.0, 0.0);
        assert_eq!(fast, 100.0);
        assert_eq!(slow, 60.0); // (170-50)/3 = 40 points
    }

    #[test]
    fn test_score_low_bandwidth_penalty() {
        let score = compute_score(40.0, 300_000, 0.0, 0.0);
        assert_eq!(score, 80.0); // (500k-300k)/10k = 20 points
    }

    fn sample(score_inputs: (f64, u64, f64, f64)) -> QualitySample {
        let (latency_ms, bandwidth_bps, packet_loss_pct, jitter_ms) = score_inputs;
        QualitySample {
            timestamp: Instant::now(),
            latency_ms,
            bandwidth_bps,
            packet_loss_pct,
            jitter_ms,
            score: compute_score(latency_ms, bandwidth_bps, packet_loss_pct, jitter_ms),
        }
    }

    #[test]
    fn test_adaptation_score_bands() {
        let (mut engine, rx) = AdaptationEngine::new(OptimizationSettings::default());

        engine.apply_sample(&sample((20.0, 2_000_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().video_quality, QualityPreset::High);
        assert_eq!(rx.borrow().relay_preference, RelayPreference::Direct);

        engine.apply_sample(&sample((140.0, 800_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().video_quality, QualityPreset::Medium);

        engine.apply_sample(&sample((170.0, 200_000, 2.0, 60.0)));
        assert_eq!(rx.borrow().video_quality, QualityPreset::Low);
    }

    #[test]
    fn test_adaptation_forces_relay_on_bad_path() {
        let (mut engine, rx) = AdaptationEngine::new(OptimizationSettings::default());

        // high score but extreme latency still forces the relay
        engine.apply_sample(&sample((250.0, 5_000_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().relay_preference, RelayPreference::Relay);

        engine.apply_sample(&sample((20.0, 5_000_000, 6.0, 0.0)));
        assert_eq!(rx.borrow().relay_preference, RelayPreference::Relay);
    }

    #[test]
    fn test_timeout_hysteresis() {
        let (mut engine, rx) = AdaptationEngine::new(OptimizationSettings::default());

        // climb under latency pressure, capped at 30s
        for _ in 0..20 {
            engine.apply_sample(&sample((150.0, 1_000_000, 0.0, 0.0)));
        }
        assert_eq!(rx.borrow().connection_timeout_ms, 30_000);

        // descend on a fast path, floored at 5s
        for _ in 0..40 {
            engine.apply_sample(&sample((20.0, 1_000_000, 0.0, 0.0)));
        }
        assert_eq!(rx.borrow().connection_timeout_ms, 5000);

        // borderline latency moves neither way
        let before = rx.borrow().connection_timeout_ms;
        engine.apply_sample(&sample((75.0, 1_000_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().connection_timeout_ms, before);
    }

    #[test]
    fn test_override_pins_field() {
        let (mut engine, rx) = AdaptationEngine::new(OptimizationSettings::default());

        engine.override_video_quality(Some(QualityPreset::Low));
        engine.apply_sample(&sample((10.0, 5_000_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().video_quality, QualityPreset::Low);

        engine.override_video_quality(None);
        engine.apply_sample(&sample((10.0, 5_000_000, 0.0, 0.0)));
        assert_eq!(rx.borrow().video_quality, QualityPreset::High);
    }

    #[test]
    fn test_settings_published_as_whole_values() {
        let (mut engine, rx) = AdaptationEngine::new(OptimizationSettings::default());
        let before = rx.borrow().clone();

        engine.apply_sample(&sample((170.0, 200_000, 2.0, 60.0)));
        let after = rx.borrow().clone();

        // the watch channel only ever yields complete values
        assert_ne!(before, after);
        assert_eq!(after, engine.settings());
    }
}
