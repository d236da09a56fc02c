//! Background checkers and the supervisor that switches them on and off.
//!
//! | Daemon          | Runs while                                          |
//! |-----------------|-----------------------------------------------------|
//! | control-state   | ≥1 listener registered, and leader (if clustered)   |
//! | timeover        | leader (if clustered)                               |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobsched_core::MonitorConfig;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterGate, ClusterRole};
use crate::daemon::{spawn_daemon, DaemonHandle, DaemonTask};
use crate::error::Result;
use crate::listener::ControlListeners;
use crate::mutator::StateMutator;
use crate::query::{Expectation, SchedulePatch, ScheduleQuery};
use crate::repository::Repository;
use crate::types::{CheckState, ControlState, Schedule, ScheduleState};

/// Re-delivers control requests that were persisted but may never have
/// reached a listener.
pub struct ControlStateDaemon {
    repo: Arc<dyn Repository>,
    mutator: Arc<StateMutator>,
}

impl ControlStateDaemon {
    pub fn new(repo: Arc<dyn Repository>, mutator: Arc<StateMutator>) -> Self {
        Self { repo, mutator }
    }

    /// One pass. Returns how many instances were delivered successfully.
    pub fn scan(&self) -> Result<usize> {
        let query = ScheduleQuery::new()
            .in_states(&[ScheduleState::Run, ScheduleState::Pause])
            .in_control_states(&ControlState::PENDING);
        let pending = self.repo.find_schedules(&query)?;

        let mut delivered = 0;
        for schedule in &pending {
            match self.mutator.redeliver(schedule) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    schedule_id = %schedule.id,
                    control_state = %schedule.control_state,
                    "control re-delivery failed: {e}"
                ),
            }
        }
        if !pending.is_empty() {
            debug!(pending = pending.len(), delivered, "control-state pass");
        }
        Ok(delivered)
    }
}

impl DaemonTask for ControlStateDaemon {
    fn name(&self) -> &'static str {
        "control-state"
    }

    fn run_once(&mut self) -> Result<()> {
        self.scan().map(|_| ())
    }
}

/// Emitted once per instance when it is still unfinished past
/// `time + max_delay_time`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoverEvent {
    pub schedule_id: String,
    pub master_id: String,
    pub state: ScheduleState,
    pub time: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Flags overdue instances with `check_state = timeover`. Never touches `state`.
pub struct TimeoverDaemon {
    repo: Arc<dyn Repository>,
    /// `try_send` only; a full channel drops the event but keeps the log line.
    events: Option<mpsc::Sender<TimeoverEvent>>,
}

impl TimeoverDaemon {
    pub fn new(repo: Arc<dyn Repository>, events: Option<mpsc::Sender<TimeoverEvent>>) -> Self {
        Self { repo, events }
    }

    /// One pass at `now`. Returns the events raised by this pass.
    pub fn scan(&self, now: DateTime<Utc>) -> Result<Vec<TimeoverEvent>> {
        let query = ScheduleQuery::new()
            .check_state_not(CheckState::Timeover)
            .with_max_delay()
            .not_in_states(&ScheduleState::FINISHED)
            .before(now);

        let mut raised = Vec::new();
        for s in self.repo.find_schedules(&query)? {
            if !is_overdue(&s, now) {
                continue;
            }
            let expect = Expectation::version(s.row_version).check_state(s.check_state);
            let patch = SchedulePatch {
                check_state: Some(CheckState::Timeover),
                ..SchedulePatch::default()
            };
            // A concurrent writer wins; the next pass sees the fresh row.
            if !self.repo.update_schedule(&s.id, &expect, &patch)? {
                continue;
            }

            let event = TimeoverEvent {
                schedule_id: s.id,
                master_id: s.master_id,
                state: s.state,
                time: s.time,
                detected_at: now,
            };
            warn!(
                schedule_id = %event.schedule_id,
                master_id = %event.master_id,
                state = %event.state,
                max_delay_ms = s.max_delay_time,
                "schedule exceeded max delay"
            );
            if let Some(tx) = &self.events {
                if tx.try_send(event.clone()).is_err() {
                    warn!(
                        schedule_id = %event.schedule_id,
                        "timeover channel full or closed, event dropped"
                    );
                }
            }
            raised.push(event);
        }
        Ok(raised)
    }
}

/// `time + max_delay_time < now`. A deadline past the representable range
/// is never reached.
fn is_overdue(s: &Schedule, now: DateTime<Utc>) -> bool {
    TimeDelta::try_milliseconds(s.max_delay_time)
        .and_then(|delay| s.time.checked_add_signed(delay))
        .is_some_and(|deadline| deadline < now)
}

impl DaemonTask for TimeoverDaemon {
    fn name(&self) -> &'static str {
        "timeover"
    }

    fn run_once(&mut self) -> Result<()> {
        self.scan(Utc::now()).map(|_| ())
    }
}

/// Which daemons are currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStatus {
    pub control_state: bool,
    pub timeover: bool,
}

/// Owns both daemons and resumes or suspends them as listeners come and go
/// and as cluster leadership moves.
pub struct Monitor {
    status: watch::Receiver<MonitorStatus>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl Monitor {
    /// Spawn the enabled daemons (suspended) and their supervisor.
    ///
    /// Without a `gate` the process behaves as a permanent leader.
    pub fn spawn(
        config: &MonitorConfig,
        repo: Arc<dyn Repository>,
        mutator: Arc<StateMutator>,
        listeners: &ControlListeners,
        gate: Option<&ClusterGate>,
        events: Option<mpsc::Sender<TimeoverEvent>>,
    ) -> Self {
        let control = config.control_state_check_enabled.then(|| {
            spawn_daemon(
                ControlStateDaemon::new(repo.clone(), mutator),
                Duration::from_millis(config.control_state_check_interval_ms.max(1)),
            )
        });
        let timeover = config.timeover_check_enabled.then(|| {
            spawn_daemon(
                TimeoverDaemon::new(repo, events),
                Duration::from_millis(config.timeover_check_interval_ms.max(1)),
            )
        });

        let mut count = listeners.subscribe();
        let (standalone, standalone_rx) = watch::channel(ClusterRole::Leader);
        let mut role = match gate {
            Some(gate) => gate.subscribe(),
            None => standalone_rx,
        };
        let (status_tx, status) = watch::channel(MonitorStatus::default());
        let (shutdown, mut stop) = watch::channel(false);

        let supervisor = tokio::spawn(async move {
            // Held so a standalone role channel never reports closure.
            let _standalone = standalone;
            loop {
                let leader = *role.borrow_and_update() == ClusterRole::Leader;
                let listening = *count.borrow_and_update() > 0;
                let next = MonitorStatus {
                    control_state: control.is_some() && leader && listening,
                    timeover: timeover.is_some() && leader,
                };
                apply(control.as_ref(), next.control_state);
                apply(timeover.as_ref(), next.timeover);
                status_tx.send_if_modified(|current| {
                    let changed = *current != next;
                    *current = next;
                    changed
                });

                tokio::select! {
                    res = role.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    res = count.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            for handle in [control, timeover].into_iter().flatten() {
                handle.stop().await;
            }
            info!("monitor stopped");
        });

        Self {
            status,
            shutdown,
            supervisor,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        *self.status.borrow()
    }

    /// Watch activation changes.
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    /// Stop the supervisor and both daemons.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.supervisor.await {
            warn!("monitor supervisor panicked: {e}");
        }
    }
}

fn apply(handle: Option<&DaemonHandle>, active: bool) {
    match handle {
        Some(h) if active => h.resume(),
        Some(h) => h.suspend(),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::listener::tests::Recording;
    use crate::memory::MemoryRepository;
    use crate::types::{Schedule, ScheduleMaster};

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, h, m, 0).unwrap()
    }

    fn insert(
        repo: &MemoryRepository,
        id: &str,
        state: ScheduleState,
        max_delay_ms: i64,
    ) -> Schedule {
        let master = ScheduleMaster::new("m", "once").with_max_delay(max_delay_ms);
        let mut s = Schedule::from_master(&master, t(9, 0));
        s.id = id.into();
        s.state = state;
        repo.insert_schedule(&s).unwrap();
        s
    }

    #[test]
    fn timeover_fires_once_per_instance() {
        let repo = Arc::new(MemoryRepository::new());
        insert(&repo, "0001", ScheduleState::Run, 10 * 60 * 1000);
        insert(&repo, "0002", ScheduleState::End, 10 * 60 * 1000);
        insert(&repo, "0003", ScheduleState::Initial, 0);
        let (tx, mut rx) = mpsc::channel(8);
        let daemon = TimeoverDaemon::new(repo.clone(), Some(tx));

        // Exactly at the deadline is not yet over.
        assert!(daemon.scan(t(9, 10)).unwrap().is_empty());

        let events = daemon.scan(t(9, 11)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].schedule_id, "0001");
        assert_eq!(events[0].state, ScheduleState::Run);
        assert_eq!(rx.try_recv().unwrap().master_id, "m");

        assert!(daemon.scan(t(9, 30)).unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        let s = repo.find_schedule("0001").unwrap().unwrap();
        assert_eq!(s.check_state, CheckState::Timeover);
        assert_eq!(s.state, ScheduleState::Run);
    }

    #[test]
    fn unrepresentable_deadline_is_never_overdue() {
        let repo = Arc::new(MemoryRepository::new());
        insert(&repo, "0001", ScheduleState::Run, i64::MAX);
        insert(&repo, "0002", ScheduleState::Run, 60_000);
        let daemon = TimeoverDaemon::new(repo.clone(), None);

        let events = daemon.scan(t(23, 0)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].schedule_id, "0002");
        let s = repo.find_schedule("0001").unwrap().unwrap();
        assert_eq!(s.check_state, CheckState::Initial);
    }

    #[tokio::test(start_paused = true)]
    async fn timeover_daemon_keeps_running_past_huge_delays() {
        let repo = Arc::new(MemoryRepository::new());
        insert(&repo, "0001", ScheduleState::Run, i64::MAX);
        let handle = spawn_daemon(TimeoverDaemon::new(repo.clone(), None), Duration::from_secs(1));
        handle.resume();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.is_active());
        handle.stop().await;
    }

    #[test]
    fn control_daemon_redelivers_and_survives_failures() {
        let repo = Arc::new(MemoryRepository::new());
        let listeners = Arc::new(ControlListeners::new());
        let mutator = Arc::new(StateMutator::new(repo.clone(), listeners.clone()));
        insert(&repo, "0001", ScheduleState::Run, 0);
        insert(&repo, "0002", ScheduleState::Run, 0);
        insert(&repo, "0003", ScheduleState::Run, 0);
        mutator.change_control_state("0001", ControlState::Pause).unwrap();
        mutator.change_control_state("0002", ControlState::Abort).unwrap();

        let rec = Recording::named("rec");
        listeners.register(rec.clone()).unwrap();
        let daemon = ControlStateDaemon::new(repo.clone(), mutator.clone());
        assert_eq!(daemon.scan().unwrap(), 2);
        assert_eq!(
            rec.calls(),
            vec![
                ("0001".to_string(), ControlState::Pause),
                ("0002".to_string(), ControlState::Abort),
            ]
        );

        listeners.register(Recording::failing("broken")).unwrap();
        assert_eq!(daemon.scan().unwrap(), 0);
        for id in ["0001", "0002"] {
            let s = repo.find_schedule(id).unwrap().unwrap();
            assert_eq!(s.control_state, ControlState::Failed);
        }
        // Failed requests are no longer pending.
        assert_eq!(daemon.scan().unwrap(), 0);
    }

    async fn wait_for(rx: &mut watch::Receiver<MonitorStatus>, want: MonitorStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("status not reached")
            .expect("monitor gone");
    }

    #[tokio::test]
    async fn activation_follows_listeners_and_leadership() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let listeners = Arc::new(ControlListeners::new());
        let mutator = Arc::new(StateMutator::new(repo.clone(), listeners.clone()));
        let gate = ClusterGate::new();

        let monitor = Monitor::spawn(
            &MonitorConfig::default(),
            repo,
            mutator,
            &listeners,
            Some(&gate),
            None,
        );
        let mut status = monitor.subscribe();
        wait_for(&mut status, MonitorStatus::default()).await;

        gate.on_become_leader();
        wait_for(&mut status, MonitorStatus { control_state: false, timeover: true }).await;

        listeners.register(Recording::named("rec")).unwrap();
        wait_for(&mut status, MonitorStatus { control_state: true, timeover: true }).await;

        gate.on_become_follower();
        wait_for(&mut status, MonitorStatus::default()).await;

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_daemons_never_start() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let listeners = Arc::new(ControlListeners::new());
        let mutator = Arc::new(StateMutator::new(repo.clone(), listeners.clone()));
        listeners.register(Recording::named("rec")).unwrap();
        let config = MonitorConfig {
            timeover_check_enabled: false,
            ..MonitorConfig::default()
        };

        let monitor = Monitor::spawn(&config, repo, mutator, &listeners, None, None);
        let mut status = monitor.subscribe();
        wait_for(&mut status, MonitorStatus { control_state: true, timeover: false }).await;
        monitor.shutdown().await;
    }
}
