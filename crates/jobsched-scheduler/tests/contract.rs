//! Behaviour every repository adapter must share. Each scenario runs once
//! against `MemoryRepository` and once against an in-memory SQLite database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use jobsched_scheduler::monitor::TimeoverDaemon;
use jobsched_scheduler::{
    ControlState, CounterIdGenerator, Expectation, MakerRegistry, MemoryRepository, Repository,
    Schedule, ScheduleControlListener, ScheduleManager, ScheduleMaster, SchedulePatch,
    ScheduleQuery, ScheduleState, SqliteRepository,
};

fn memory_repo() -> Arc<dyn Repository> {
    Arc::new(MemoryRepository::new())
}

fn sqlite_repo() -> Arc<dyn Repository> {
    Arc::new(SqliteRepository::open_in_memory().unwrap())
}

fn manager(repo: Arc<dyn Repository>) -> ScheduleManager {
    ScheduleManager::new(
        repo,
        Arc::new(CounterIdGenerator::new()),
        MakerRegistry::with_builtins(),
    )
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 5, 11).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn late(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 0, 0).unwrap().and_utc()
}

fn executable(m: &ScheduleManager, date: NaiveDate) -> Vec<String> {
    m.find_executable_schedules(late(date), &[], None)
        .unwrap()
        .into_iter()
        .map(|s| s.master_id)
        .collect()
}

fn instance_of(m: &ScheduleManager, master_id: &str) -> Schedule {
    let mut all = m.find_schedules_by_master(master_id).unwrap();
    assert_eq!(all.len(), 1, "expected one instance of {master_id}");
    all.remove(0)
}

fn end(m: &ScheduleManager, master_id: &str) {
    let id = instance_of(m, master_id).id;
    assert!(m.change_state(&id, ScheduleState::End).unwrap());
}

fn set_state(m: &ScheduleManager, master_id: &str, state: ScheduleState) {
    let id = instance_of(m, master_id).id;
    assert!(m.change_state(&id, state).unwrap());
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, ControlState)>>,
}

impl ScheduleControlListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_control_state_changed(
        &self,
        schedule_id: &str,
        control_state: ControlState,
    ) -> Result<(), String> {
        self.calls
            .lock()
            .unwrap()
            .push((schedule_id.to_string(), control_state));
        Ok(())
    }
}

// --- scenarios ---------------------------------------------------------------

fn dependent_waits_for_predecessor(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    m.register_master(&ScheduleMaster::new("b", "once").depends_on("a", false))
        .unwrap();
    m.generate(day()).unwrap();

    assert_eq!(executable(&m, day()), ["a"]);
    end(&m, "a");
    assert_eq!(executable(&m, day()), ["b"]);
}

fn ignore_error_lets_failures_through(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    m.register_master(&ScheduleMaster::new("lenient", "once").depends_on("a", true))
        .unwrap();
    m.register_master(&ScheduleMaster::new("strict", "once").depends_on("a", false))
        .unwrap();
    m.generate(day()).unwrap();

    set_state(&m, "a", ScheduleState::Run);
    assert!(executable(&m, day()).is_empty(), "running work blocks everyone");

    set_state(&m, "a", ScheduleState::Failed);
    assert_eq!(executable(&m, day()), ["lenient"]);

    set_state(&m, "a", ScheduleState::Abort);
    assert_eq!(executable(&m, day()), ["lenient"]);

    set_state(&m, "a", ScheduleState::Disable);
    assert_eq!(executable(&m, day()), ["lenient", "strict"]);
}

fn eligibility_flips_with_one_blocker(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    m.register_master(&ScheduleMaster::new("b", "once")).unwrap();
    m.register_master(
        &ScheduleMaster::new("c", "once")
            .depends_on("a", false)
            .depends_on("b", false),
    )
    .unwrap();
    m.generate(day()).unwrap();
    end(&m, "a");
    end(&m, "b");
    let c = instance_of(&m, "c");
    assert!(m.is_eligible(&c).unwrap());

    set_state(&m, "b", ScheduleState::Entry);
    assert!(!m.is_eligible(&c).unwrap());
}

fn canonical_duplicate_decides(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    let a = ScheduleMaster::new("a", "once");
    let b = ScheduleMaster::new("b", "once").depends_on("a", false);
    let nine = day().and_time(hm(9, 0)).and_utc();

    let mut canonical = Schedule::from_master(&a, nine);
    canonical.id = "0010".into();
    canonical.state = ScheduleState::End;
    let mut stale = canonical.clone();
    stale.id = "0011".into();
    stale.state = ScheduleState::Run;
    repo.insert_schedule(&canonical).unwrap();
    repo.insert_schedule(&stale).unwrap();

    let mut dependent = Schedule::from_master(&b, nine + Duration::hours(1));
    dependent.id = "0020".into();
    dependent.depends = b.depends.clone();
    repo.insert_schedule(&dependent).unwrap();
    assert!(m.is_eligible(&dependent).unwrap());

    // Swap roles: the smaller id is now the unfinished one.
    m.change_state("0010", ScheduleState::Run).unwrap();
    m.change_state("0011", ScheduleState::End).unwrap();
    assert!(!m.is_eligible(&dependent).unwrap());
}

fn stale_version_never_writes(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    let id = m.generate(day()).unwrap().remove(0).id;

    let patch = SchedulePatch {
        state: Some(ScheduleState::Entry),
        ..SchedulePatch::default()
    };
    assert!(!repo.update_schedule(&id, &Expectation::version(7), &patch).unwrap());
    let s = repo.find_schedule(&id).unwrap().unwrap();
    assert_eq!((s.state, s.row_version), (ScheduleState::Initial, 0));

    assert!(repo.update_schedule(&id, &Expectation::version(0), &patch).unwrap());
    let s = repo.find_schedule(&id).unwrap().unwrap();
    assert_eq!((s.state, s.row_version), (ScheduleState::Entry, 1));

    // Field expectation mismatch also refuses the write.
    let expect = Expectation::version(1).state(ScheduleState::Run);
    assert!(!repo.update_schedule(&id, &expect, &patch).unwrap());
}

fn pause_is_guarded_and_notified_once(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    let recorder = Arc::new(Recorder::default());
    m.add_control_listener(recorder.clone()).unwrap();
    m.register_master(&ScheduleMaster::new("x", "once")).unwrap();
    let id = m.generate(day()).unwrap().remove(0).id;

    assert!(!m.change_control_state(&id, ControlState::Pause).unwrap());
    assert_eq!(m.find_schedule(&id).unwrap().row_version, 0);

    m.change_state(&id, ScheduleState::Run).unwrap();
    assert!(m.change_control_state(&id, ControlState::Pause).unwrap());
    assert!(!m.change_control_state(&id, ControlState::Pause).unwrap());
    assert_eq!(m.find_schedule(&id).unwrap().control_state, ControlState::Pause);
    assert_eq!(
        *recorder.calls.lock().unwrap(),
        vec![(id.clone(), ControlState::Pause)]
    );
}

fn timeover_is_flagged_once(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(
        &ScheduleMaster::new("slow", "once")
            .starting_at(hm(6, 0))
            .with_max_delay(30 * 60 * 1000),
    )
    .unwrap();
    m.register_master(&ScheduleMaster::new("relaxed", "once").starting_at(hm(6, 0)))
        .unwrap();
    m.generate(day()).unwrap();

    let daemon = TimeoverDaemon::new(repo, None);
    let now = day().and_time(hm(7, 0)).and_utc();
    let first = daemon.scan(now).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].master_id, "slow");
    assert_eq!(first[0].state, ScheduleState::Initial);
    assert!(daemon.scan(now).unwrap().is_empty());
    assert_eq!(instance_of(&m, "slow").state, ScheduleState::Initial);
}

fn depends_on_group_waits_for_every_member(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("e1", "once").in_group("etl").starting_at(hm(8, 0)))
        .unwrap();
    m.register_master(&ScheduleMaster::new("e2", "once").in_group("etl").starting_at(hm(9, 0)))
        .unwrap();
    m.register_master(
        &ScheduleMaster::new("x", "once")
            .starting_at(hm(12, 0))
            .depends_on_group("etl", false),
    )
    .unwrap();
    m.generate(day()).unwrap();

    end(&m, "e1");
    set_state(&m, "e2", ScheduleState::Failed);
    assert!(!executable(&m, day()).contains(&"x".to_string()));
    set_state(&m, "e2", ScheduleState::End);
    assert_eq!(executable(&m, day()), ["x"]);
}

fn depends_in_group_is_scoped_to_the_batch(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("extract", "once").in_group("etl"))
        .unwrap();
    m.register_master(
        &ScheduleMaster::new("load", "once")
            .in_group("etl")
            .starting_at(hm(1, 0))
            .depends_on("extract", false),
    )
    .unwrap();
    let next = day().succ_opt().unwrap();
    m.generate(day()).unwrap();
    let second = m.generate(next).unwrap();

    let load = second.iter().find(|s| s.master_id == "load").unwrap();
    assert!(load.depends.is_empty());
    assert_eq!(load.depends_in_group.len(), 1);
    assert!(!m.is_eligible(load).unwrap());

    // Yesterday's extract is still pending; only today's sibling matters.
    let extract = second.iter().find(|s| s.master_id == "extract").unwrap();
    m.change_state(&extract.id, ScheduleState::End).unwrap();
    assert!(m.is_eligible(load).unwrap());
}

fn group_on_group_uses_earliest_member(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(&ScheduleMaster::new("e1", "once").in_group("etl").starting_at(hm(8, 0)))
        .unwrap();
    m.register_master(&ScheduleMaster::new("e2", "once").in_group("etl").starting_at(hm(9, 0)))
        .unwrap();
    for (id, start) in [("r1", hm(10, 0)), ("r2", hm(10, 30))] {
        m.register_master(
            &ScheduleMaster::new(id, "once")
                .in_group("reports")
                .starting_at(start)
                .group_depends_on("reports", "etl", false),
        )
        .unwrap();
    }
    m.generate(day()).unwrap();

    assert_eq!(executable(&m, day()), ["e1", "e2"]);
    end(&m, "e1");
    assert_eq!(executable(&m, day()), ["e2"]);
    end(&m, "e2");
    assert_eq!(executable(&m, day()), ["r1", "r2"]);

    // A stale duplicate of e2 with a larger id does not block...
    let e2 = instance_of(&m, "e2");
    let mut stale = e2.clone();
    stale.id = format!("{}9", e2.id);
    stale.state = ScheduleState::Run;
    repo.insert_schedule(&stale).unwrap();
    assert_eq!(executable(&m, day()), ["r1", "r2"]);

    // ...but one with a smaller id is the canonical slot holder and does.
    let mut earlier = e2.clone();
    earlier.id = "0".into();
    earlier.state = ScheduleState::Run;
    repo.insert_schedule(&earlier).unwrap();
    assert!(executable(&m, day()).is_empty());
}

fn group_on_group_ignores_later_cycles(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("e1", "once").in_group("etl").starting_at(hm(8, 0)))
        .unwrap();
    for (id, start) in [("r0", hm(7, 0)), ("r1", hm(10, 0))] {
        m.register_master(
            &ScheduleMaster::new(id, "once")
                .in_group("reports")
                .starting_at(start)
                .group_depends_on("reports", "etl", false),
        )
        .unwrap();
    }
    m.generate(day()).unwrap();

    // The reports group starts at 07:00, before any etl member.
    assert_eq!(executable(&m, day()), ["r0", "e1", "r1"]);
}

fn removal_retracts_every_index(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(&ScheduleMaster::new("a", "once").in_group("etl"))
        .unwrap();
    m.register_master(&ScheduleMaster::new("b", "once").in_group("etl"))
        .unwrap();
    let made = m.generate(day()).unwrap();
    let gid = made[0].group_id_map["etl"].clone();

    assert_eq!(m.remove_schedules_by_master("a").unwrap(), 1);
    let members = m.find_schedules_by_group(&gid).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].master_id, "b");
    assert_eq!(repo.find_schedules_by_master_group("etl").unwrap().len(), 1);

    assert!(m.remove_schedule(&members[0].id).unwrap());
    assert!(!m.remove_schedule(&members[0].id).unwrap());
    assert!(m.find_schedules_by_group(&gid).unwrap().is_empty());
    assert_eq!(repo.count_schedules_by_date(day()).unwrap(), 0);
}

fn range_queries_follow_natural_order(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(
        &ScheduleMaster::new("tick", "repeat")
            .starting_at(hm(9, 0))
            .repeating(15 * 60 * 1000, hm(10, 0)),
    )
    .unwrap();
    m.register_master(&ScheduleMaster::new("noon", "once").starting_at(hm(12, 0)))
        .unwrap();
    m.generate(day()).unwrap();

    let upto = Utc.with_ymd_and_hms(2026, 5, 11, 9, 30, 0).unwrap();
    let found = repo.find_schedules(&ScheduleQuery::new().up_to(upto)).unwrap();
    assert_eq!(found.len(), 3);
    assert!(found.windows(2).all(|w| w[0].time < w[1].time));

    let all = m.find_schedules_by_date(day()).unwrap();
    assert_eq!(all.len(), 6);
    assert_eq!(all.last().unwrap().master_id, "noon");
    assert_eq!(
        m.find_schedules_by_state(&[ScheduleState::Initial]).unwrap().len(),
        6
    );
}

fn generate_if_absent_is_idempotent(repo: Arc<dyn Repository>) {
    let m = manager(repo);
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    assert!(m.generate_if_absent(day()).unwrap().is_some());
    assert!(m.generate_if_absent(day()).unwrap().is_none());
    assert_eq!(m.find_schedules_by_date(day()).unwrap().len(), 1);
}

fn concurrent_writers_race_on_one_version(repo: Arc<dyn Repository>) {
    let m = manager(repo.clone());
    m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
    let id = m.generate(day()).unwrap().remove(0).id;
    const WRITERS: usize = 8;

    // Raw conditional writes all expecting version 0.
    let barrier = Barrier::new(WRITERS);
    let wins: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|n| {
                let (repo, id, barrier) = (&repo, &id, &barrier);
                scope.spawn(move || {
                    let patch = SchedulePatch {
                        output: Some(Some(format!("writer-{n}"))),
                        ..SchedulePatch::default()
                    };
                    barrier.wait();
                    repo.update_schedule(id, &Expectation::version(0), &patch).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
    });
    assert_eq!(wins, 1);
    assert_eq!(repo.find_schedule(&id).unwrap().unwrap().row_version, 1);

    // The same race through the mutator: one caller moves initial -> entry.
    let barrier = Barrier::new(WRITERS);
    let wins: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let (m, id, barrier) = (&m, &id, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    m.compare_and_set_state(id, ScheduleState::Initial, ScheduleState::Entry)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
    });
    assert_eq!(wins, 1);
    let s = repo.find_schedule(&id).unwrap().unwrap();
    assert_eq!((s.state, s.row_version), (ScheduleState::Entry, 2));
}

fn readers_see_whole_instances_only(repo: Arc<dyn Repository>) {
    const ROUNDS: usize = 200;
    let master = ScheduleMaster::new("m", "once").in_group("mg");
    let at = day().and_time(hm(6, 0)).and_utc();
    let make = |n: usize| {
        let mut s = Schedule::from_master(&master, at);
        s.id = format!("{n:016}");
        s.group_id_map.insert("mg".into(), "G1".into());
        s.master_group_ids = vec!["mg".into()];
        s
    };
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for n in 0..ROUNDS {
                repo.insert_schedule(&make(n)).unwrap();
                if n > 0 {
                    assert!(repo.remove_schedule(&format!("{:016}", n - 1)).unwrap());
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..3 {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let views = [
                        repo.find_schedules_by_group("G1").unwrap(),
                        repo.find_schedules_by_master_group("mg").unwrap(),
                        repo.find_schedules_by_master("m").unwrap(),
                        repo.find_schedules_by_date(day()).unwrap(),
                    ];
                    for view in views {
                        assert!(view.len() <= 2, "saw {} instances", view.len());
                        for s in view {
                            assert_eq!(s.group_id_map.get("mg").map(String::as_str), Some("G1"));
                            assert_eq!(s.master_group_ids, ["mg"]);
                            assert_eq!(s.time, at);
                        }
                    }
                    assert!(repo.count_schedules_by_date(day()).unwrap() <= 2);
                }
            });
        }
        writer.join().unwrap();
    });

    let left = repo.find_schedules_by_group("G1").unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, format!("{:016}", ROUNDS - 1));
}

fn initial_time_reads_back_filled(repo: Arc<dyn Repository>) {
    let at = day().and_time(hm(7, 30)).and_utc();
    let mut s = Schedule::from_master(&ScheduleMaster::new("a", "once"), at);
    s.id = "0000000000000001".into();
    s.initial_time = None;
    repo.insert_schedule(&s).unwrap();

    let stored = repo.find_schedule(&s.id).unwrap().unwrap();
    assert_eq!(stored.initial_time, Some(at));
    s.initial_time = Some(at);
    assert_eq!(stored, s);
}

macro_rules! contract {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[test]
                fn $name() {
                    super::$name(super::memory_repo());
                }
            )*
        }

        mod sqlite {
            $(
                #[test]
                fn $name() {
                    super::$name(super::sqlite_repo());
                }
            )*
        }
    };
}

contract!(
    dependent_waits_for_predecessor,
    ignore_error_lets_failures_through,
    eligibility_flips_with_one_blocker,
    canonical_duplicate_decides,
    stale_version_never_writes,
    pause_is_guarded_and_notified_once,
    timeover_is_flagged_once,
    depends_on_group_waits_for_every_member,
    depends_in_group_is_scoped_to_the_batch,
    group_on_group_uses_earliest_member,
    group_on_group_ignores_later_cycles,
    removal_retracts_every_index,
    range_queries_follow_natural_order,
    generate_if_absent_is_idempotent,
    concurrent_writers_race_on_one_version,
    readers_see_whole_instances_only,
    initial_time_reads_back_filled,
);

#[test]
fn sqlite_file_and_sequence_survive_restart() {
    use jobsched_scheduler::FileSequence;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobsched.db");
    let seq = dir.path().join("sequence");

    let open = || {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::new(rusqlite::Connection::open(&db).unwrap()).unwrap());
        ScheduleManager::new(
            repo,
            Arc::new(FileSequence::open(&seq).unwrap()),
            MakerRegistry::with_builtins(),
        )
    };

    let first_id = {
        let m = open();
        m.register_master(&ScheduleMaster::new("a", "once")).unwrap();
        m.generate_if_absent(day()).unwrap().unwrap()[0].id.clone()
    };

    let m = open();
    assert!(m.generate_if_absent(day()).unwrap().is_none());
    let next = m.generate(day().succ_opt().unwrap()).unwrap();
    assert!(next[0].id > first_id);
    assert_eq!(m.list_masters().unwrap().len(), 1);
}
