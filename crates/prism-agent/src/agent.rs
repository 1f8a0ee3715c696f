//! The supervised agent loop.
//!
//! Heartbeats go out at a fixed interval plus random jitter so a fleet of
//! resources booted together does not report in lockstep. Update checks run
//! on their own jittered timer inside the same loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prism_core::{IdleSignal, ResourceId, ScoringProfile};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::idle::IdleAccumulator;
use crate::sampler::ActivitySampler;
use crate::sink::HeartbeatSink;
use crate::state::{SequenceState, SequenceStore};
use crate::update::Updater;

/// Missed heartbeat intervals after which the machine is assumed to have
/// been suspended or hibernated.
const RESUME_GAP_INTERVALS: u32 = 3;

/// Timing and scoring settings for [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Resource reported on.
    pub resource_id: ResourceId,
    /// Heartbeat interval.
    pub interval: Duration,
    /// Fraction of the interval used as jitter.
    pub jitter_fraction: f64,
    /// Update check interval.
    pub update_interval: Duration,
    /// Local scoring profile.
    pub scoring: ScoringProfile,
    /// Score below which a sample counts as idle.
    pub idle_score_threshold: f64,
}

/// Idle detection agent.
pub struct Agent {
    settings: AgentSettings,
    sampler: Box<dyn ActivitySampler>,
    sink: Arc<dyn HeartbeatSink>,
    updater: Option<Arc<dyn Updater>>,
    sequence: SequenceState,
    store: SequenceStore,
    idle: IdleAccumulator,
    last_tick: Option<DateTime<Utc>>,
}

impl Agent {
    /// Prepare an agent for the current boot.
    ///
    /// The idle accumulator always starts empty, so the first heartbeat after
    /// a start or resume reports the resource as active.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence checkpoint cannot be prepared.
    pub async fn start(
        settings: AgentSettings,
        boot_id: u64,
        sampler: Box<dyn ActivitySampler>,
        sink: Arc<dyn HeartbeatSink>,
        store: SequenceStore,
    ) -> Result<Self> {
        let (sequence, fresh_boot) = store.resume(boot_id).await?;
        info!(
            resource_id = %settings.resource_id,
            boot_id,
            next_seq = sequence.next_seq,
            fresh_boot,
            "Agent starting"
        );
        let idle = IdleAccumulator::new(settings.idle_score_threshold);
        Ok(Self {
            settings,
            sampler,
            sink,
            updater: None,
            sequence,
            store,
            idle,
            last_tick: None,
        })
    }

    /// Enable periodic self-update checks.
    #[must_use]
    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Sample, score and send one heartbeat.
    ///
    /// The sequence number advances even when delivery fails; the daemon
    /// only requires it to increase.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling or delivery fails.
    pub async fn tick(&mut self) -> Result<IdleSignal> {
        self.tick_at(Utc::now()).await
    }

    async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<IdleSignal> {
        // A resume from hibernation keeps the boot id, so a long wall-clock
        // gap is the only sign that the local history is stale.
        if let Some(last) = self.last_tick {
            let gap = (now - last).to_std().unwrap_or_default();
            if gap > self.settings.interval * RESUME_GAP_INTERVALS {
                info!(gap_secs = gap.as_secs(), "Resuming after a gap, clearing idle history");
                self.idle.reset();
                self.sampler.reset();
            }
        }
        self.last_tick = Some(now);

        let metrics = self.sampler.sample().await?;
        let idle_score = self.settings.scoring.score(&metrics);
        let idle_for_secs = self.idle.observe(idle_score, now);

        let signal = IdleSignal {
            resource_id: self.settings.resource_id,
            seq: self.sequence.next_seq,
            boot_id: self.sequence.boot_id,
            sent_at: now,
            metrics,
            idle_score,
            idle_for_secs,
        };
        self.sequence.next_seq += 1;
        if let Err(e) = self.store.save(&self.sequence).await {
            warn!(error = %e, "Failed to checkpoint heartbeat sequence");
        }

        let reply = self.sink.send(&signal).await?;
        if reply.accepted {
            debug!(seq = signal.seq, score = idle_score, idle_for_secs, "Heartbeat accepted");
        } else {
            warn!(seq = signal.seq, reason = ?reply.reason, "Heartbeat ignored by daemon");
        }
        Ok(signal)
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            jitter = self.settings.jitter_fraction,
            "Starting heartbeat loop"
        );

        // Spread the first heartbeat across one jitter window.
        let mut next_heartbeat = Instant::now() + self.jitter();
        let mut next_update = Instant::now() + self.settings.update_interval + self.jitter();

        loop {
            tokio::select! {
                () = sleep_until(next_heartbeat) => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, transient = e.is_transient(), "Heartbeat failed");
                    }
                    next_heartbeat = Instant::now() + self.settings.interval + self.jitter();
                }
                () = sleep_until(next_update), if self.updater.is_some() => {
                    if let Some(updater) = self.updater.clone() {
                        check_update(updater.as_ref()).await;
                    }
                    next_update = Instant::now() + self.settings.update_interval + self.jitter();
                }
                _ = shutdown.recv() => {
                    info!("Shutting down agent");
                    break;
                }
            }
        }

        if let Err(e) = self.store.save(&self.sequence).await {
            warn!(error = %e, "Failed to checkpoint heartbeat sequence");
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.settings.interval.mul_f64(self.settings.jitter_fraction.clamp(0.0, 1.0));
        if max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..=max)
    }
}

async fn check_update(updater: &dyn Updater) {
    match updater.check().await {
        Ok(Some(staged)) => {
            info!(release = staged.release, version = %staged.version, "Update staged for install");
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Update check failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::sink::HeartbeatReply;
    use async_trait::async_trait;
    use prism_core::{ActivityMetrics, ProjectId};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Scripted(VecDeque<ActivityMetrics>);

    #[async_trait]
    impl ActivitySampler for Scripted {
        async fn sample(&mut self) -> Result<ActivityMetrics> {
            self.0
                .pop_front()
                .ok_or_else(|| AgentError::Sampling("script exhausted".into()))
        }
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<IdleSignal>>,
        fail: bool,
    }

    #[async_trait]
    impl HeartbeatSink for Recording {
        async fn send(&self, signal: &IdleSignal) -> Result<HeartbeatReply> {
            self.sent.lock().unwrap().push(signal.clone());
            if self.fail {
                return Err(AgentError::Rejected {
                    status: 503,
                    body: String::new(),
                });
            }
            Ok(HeartbeatReply {
                accepted: true,
                reason: None,
                idle_for_secs: signal.idle_for_secs,
            })
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            resource_id: ResourceId::generate(&ProjectId::generate(), "ws"),
            interval: Duration::from_secs(60),
            jitter_fraction: 0.1,
            update_interval: Duration::from_secs(3600),
            scoring: ScoringProfile::default(),
            idle_score_threshold: 0.1,
        }
    }

    fn busy() -> ActivityMetrics {
        ActivityMetrics {
            cpu_percent: 90.0,
            memory_pressure_percent: 50.0,
            disk_io_kbps: 5000.0,
            network_io_kbps: 5000.0,
            gpu_percent: None,
            interactive_session: true,
        }
    }

    async fn agent(dir: &TempDir, boot_id: u64, samples: Vec<ActivityMetrics>, sink: Arc<Recording>) -> Agent {
        Agent::start(
            settings(),
            boot_id,
            Box::new(Scripted(samples.into())),
            sink,
            SequenceStore::new(dir.path()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn sequence_increases_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording::default());

        let mut first = agent(&dir, 1, vec![busy(), busy()], sink.clone()).await;
        first.tick().await.unwrap();
        first.tick().await.unwrap();

        let mut restarted = agent(&dir, 1, vec![busy()], sink.clone()).await;
        restarted.tick().await.unwrap();

        let seqs: Vec<u64> = sink.sent.lock().unwrap().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn new_boot_reports_active_from_seq_zero() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording::default());

        let mut before = agent(&dir, 1, vec![ActivityMetrics::quiet(), ActivityMetrics::quiet()], sink.clone()).await;
        before.tick().await.unwrap();
        before.tick().await.unwrap();

        let mut after = agent(&dir, 2, vec![ActivityMetrics::quiet()], sink.clone()).await;
        let signal = after.tick().await.unwrap();
        assert_eq!(signal.seq, 0);
        assert_eq!(signal.boot_id, 2);
        assert_eq!(signal.idle_for_secs, 0);
    }

    #[tokio::test]
    async fn failed_delivery_still_advances_sequence() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let mut agent = agent(&dir, 1, vec![busy(), busy()], sink.clone()).await;

        assert!(agent.tick().await.is_err());
        assert!(agent.tick().await.is_err());
        let seqs: Vec<u64> = sink.sent.lock().unwrap().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn busy_samples_score_high() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording::default());
        let mut agent = agent(&dir, 1, vec![busy()], sink).await;
        let signal = agent.tick().await.unwrap();
        assert!(signal.idle_score > 0.5);
        assert_eq!(signal.idle_for_secs, 0);
    }

    #[tokio::test]
    async fn wall_clock_gap_clears_idle_history() {
        use chrono::TimeZone;

        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording::default());
        let mut agent = agent(&dir, 1, vec![ActivityMetrics::quiet(); 4], sink).await;
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        agent.tick_at(t0).await.unwrap();
        let before = agent.tick_at(t0 + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(before.idle_for_secs, 60);

        // Hibernated for two hours under the same boot id.
        let resumed = t0 + chrono::Duration::hours(2);
        let after = agent.tick_at(resumed).await.unwrap();
        assert_eq!(after.boot_id, 1);
        assert_eq!(after.idle_for_secs, 0);

        let next = agent.tick_at(resumed + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(next.idle_for_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Recording::default());
        let agent = agent(&dir, 1, vec![busy(); 10], sink.clone()).await;

        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(agent.run(rx));
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        let sent = sink.sent.lock().unwrap().len();
        assert!((1..=3).contains(&sent), "sent {sent} heartbeats");
    }
}
