use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use jobsched_core::{GeneratorConfig, MonitorConfig};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::cluster::ClusterGate;
use crate::error::{Result, SchedulerError};
use crate::generator::ScheduleGenerator;
use crate::listener::{ControlListeners, ScheduleControlListener};
use crate::maker::MakerRegistry;
use crate::monitor::{Monitor, TimeoverEvent};
use crate::mutator::StateMutator;
use crate::query::ScheduleQuery;
use crate::repository::Repository;
use crate::resolver::DependencyResolver;
use crate::sequence::IdGenerator;
use crate::types::{CheckState, ControlState, Schedule, ScheduleMaster, ScheduleState};

/// Entry point for executors and operators: registration, generation,
/// eligibility queries and state changes over one repository.
pub struct ScheduleManager {
    repo: Arc<dyn Repository>,
    generator: ScheduleGenerator,
    resolver: DependencyResolver,
    mutator: Arc<StateMutator>,
    listeners: Arc<ControlListeners>,
}

impl ScheduleManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        ids: Arc<dyn IdGenerator>,
        makers: MakerRegistry,
    ) -> Self {
        let listeners = Arc::new(ControlListeners::new());
        Self {
            generator: ScheduleGenerator::new(repo.clone(), ids, makers),
            resolver: DependencyResolver::new(repo.clone()),
            mutator: Arc::new(StateMutator::new(repo.clone(), listeners.clone())),
            listeners,
            repo,
        }
    }

    /// Build with makers taken from the `[generator]` configuration.
    pub fn from_config(
        repo: Arc<dyn Repository>,
        ids: Arc<dyn IdGenerator>,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        Ok(Self::new(repo, ids, MakerRegistry::from_config(config)?))
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    // --- masters -----------------------------------------------------------

    #[instrument(skip(self, master), fields(master_id = %master.id))]
    pub fn register_master(&self, master: &ScheduleMaster) -> Result<()> {
        self.repo.insert_master(master)?;
        info!(schedule_type = %master.schedule_type, "master registered");
        Ok(())
    }

    pub fn find_master(&self, id: &str) -> Result<ScheduleMaster> {
        self.repo
            .find_master(id)?
            .ok_or_else(|| SchedulerError::MasterNotFound { id: id.to_string() })
    }

    pub fn list_masters(&self) -> Result<Vec<ScheduleMaster>> {
        self.repo.list_masters()
    }

    /// Remove a master. Its existing instances are left in place.
    #[instrument(skip(self))]
    pub fn remove_master(&self, id: &str) -> Result<bool> {
        self.repo.remove_master(id)
    }

    // --- generation --------------------------------------------------------

    /// Generate `date`'s instances from every registered master.
    #[instrument(skip(self))]
    pub fn generate(&self, date: NaiveDate) -> Result<Vec<Schedule>> {
        let masters = self.repo.list_masters()?;
        self.generator.generate(date, &masters)
    }

    /// Generate from an explicit master list (registered or not).
    pub fn generate_from(
        &self,
        date: NaiveDate,
        masters: &[ScheduleMaster],
    ) -> Result<Vec<Schedule>> {
        self.generator.generate(date, masters)
    }

    /// Generate `date`'s instances unless some already exist. `None` when skipped.
    #[instrument(skip(self))]
    pub fn generate_if_absent(&self, date: NaiveDate) -> Result<Option<Vec<Schedule>>> {
        self.generator.generate_if_absent(date)
    }

    // --- queries -----------------------------------------------------------

    pub fn find_schedule(&self, id: &str) -> Result<Schedule> {
        self.repo
            .find_schedule(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    pub fn find_schedules(&self, query: &ScheduleQuery) -> Result<Vec<Schedule>> {
        self.repo.find_schedules(query)
    }

    pub fn find_schedules_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>> {
        self.repo.find_schedules_by_date(date)
    }

    pub fn find_schedules_by_master(&self, master_id: &str) -> Result<Vec<Schedule>> {
        self.repo.find_schedules_by_master(master_id)
    }

    pub fn find_schedules_by_group(&self, group_id: &str) -> Result<Vec<Schedule>> {
        self.repo.find_schedules_by_group(group_id)
    }

    pub fn find_schedules_by_state(&self, states: &[ScheduleState]) -> Result<Vec<Schedule>> {
        self.repo.find_schedules_by_state(states)
    }

    pub fn is_eligible(&self, schedule: &Schedule) -> Result<bool> {
        self.resolver.is_eligible(schedule)
    }

    pub fn find_executable_schedules(
        &self,
        now: DateTime<Utc>,
        executor_types: &[String],
        executor_key: Option<&str>,
    ) -> Result<Vec<Schedule>> {
        self.resolver
            .find_executable_schedules(now, executor_types, executor_key)
    }

    // --- state changes -----------------------------------------------------

    #[instrument(skip(self))]
    pub fn change_state(&self, id: &str, state: ScheduleState) -> Result<bool> {
        self.mutator.change_state(id, state)
    }

    pub fn change_state_code(&self, id: &str, code: &str) -> Result<bool> {
        self.mutator.change_state_code(id, code)
    }

    #[instrument(skip(self))]
    pub fn compare_and_set_state(
        &self,
        id: &str,
        expected: ScheduleState,
        state: ScheduleState,
    ) -> Result<bool> {
        self.mutator.compare_and_set_state(id, expected, state)
    }

    pub fn change_control_state(&self, id: &str, target: ControlState) -> Result<bool> {
        self.mutator.change_control_state(id, target)
    }

    pub fn change_check_state(
        &self,
        id: &str,
        expected: CheckState,
        state: CheckState,
    ) -> Result<bool> {
        self.mutator.change_check_state(id, expected, state)
    }

    pub fn set_output(&self, id: &str, output: Option<String>) -> Result<bool> {
        self.mutator.set_output(id, output)
    }

    pub fn set_executor_key(&self, id: &str, executor_key: Option<String>) -> Result<bool> {
        self.mutator.set_executor_key(id, executor_key)
    }

    pub fn set_retry_end_time(
        &self,
        id: &str,
        retry_end_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.mutator.set_retry_end_time(id, retry_end_time)
    }

    pub fn set_max_delay_time(&self, id: &str, max_delay_time: i64) -> Result<bool> {
        self.mutator.set_max_delay_time(id, max_delay_time)
    }

    // --- removal -----------------------------------------------------------

    #[instrument(skip(self))]
    pub fn remove_schedule(&self, id: &str) -> Result<bool> {
        self.repo.remove_schedule(id)
    }

    #[instrument(skip(self))]
    pub fn remove_schedules_by_master(&self, master_id: &str) -> Result<usize> {
        self.repo.remove_schedules_by_master(master_id)
    }

    #[instrument(skip(self))]
    pub fn remove_schedules_by_date(&self, date: NaiveDate) -> Result<usize> {
        self.repo.remove_schedules_by_date(date)
    }

    pub fn remove_schedules(&self, query: &ScheduleQuery) -> Result<usize> {
        self.repo.remove_schedules(query)
    }

    // --- listeners and monitoring ------------------------------------------

    pub fn add_control_listener(&self, listener: Arc<dyn ScheduleControlListener>) -> Result<()> {
        self.listeners.register(listener)
    }

    pub fn remove_control_listener(&self, name: &str) -> Result<bool> {
        self.listeners.unregister(name)
    }

    /// Start the control-state and timeover daemons under a supervisor.
    pub fn spawn_monitor(
        &self,
        config: &MonitorConfig,
        gate: Option<&ClusterGate>,
        events: Option<mpsc::Sender<TimeoverEvent>>,
    ) -> Monitor {
        Monitor::spawn(
            config,
            self.repo.clone(),
            self.mutator.clone(),
            &self.listeners,
            gate,
            events,
        )
    }
}
