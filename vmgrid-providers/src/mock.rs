use crate::{
    inventory, BackendAdapter, BackendError, BackendStatus, CreateSpec, InstanceObservation,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// How mock instances behave once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehavior {
    /// Reports `running` after the configured number of describe calls.
    Running,
    /// Reports `booting` forever.
    StuckBooting,
    /// Reports `failed` on the first describe.
    Fails,
}

/// Deterministic in-memory backend.
///
/// Every `describe` advances the instance by one poll, which makes boot and
/// teardown lengths independent of wall-clock time.
pub struct MockBackend {
    name: String,
    ssh_user: Option<String>,
    boot_polls: u32,
    terminate_polls: u32,
    boot: BootBehavior,
    assign_ip: bool,
    fixed_ip: Option<String>,
    create_delay: Option<Duration>,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_seq: u32,
    instances: HashMap<String, MockInstance>,
    create_failures: VecDeque<BackendError>,
    describe_failures: VecDeque<BackendError>,
    terminate_failures: VecDeque<BackendError>,
    create_calls: usize,
    describe_calls: usize,
    terminate_calls: usize,
}

struct MockInstance {
    name: String,
    ip: String,
    polls: u32,
    terminating: bool,
    polls_since_terminate: u32,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssh_user: Some("ubuntu".to_string()),
            boot_polls: 2,
            terminate_polls: 1,
            boot: BootBehavior::Running,
            assign_ip: true,
            fixed_ip: None,
            create_delay: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Describe calls needed before the instance reports `running` (minimum 1).
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls.max(1);
        self
    }

    /// Describe calls after terminate before the instance disappears.
    pub fn with_terminate_polls(mut self, polls: u32) -> Self {
        self.terminate_polls = polls.max(1);
        self
    }

    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.fixed_ip = Some(ip.into());
        self
    }

    pub fn never_assign_ip(mut self) -> Self {
        self.assign_ip = false;
        self
    }

    pub fn with_ssh_user(mut self, user: Option<&str>) -> Self {
        self.ssh_user = user.map(|u| u.to_string());
        self
    }

    pub fn with_boot_behavior(mut self, boot: BootBehavior) -> Self {
        self.boot = boot;
        self
    }

    /// Delays every create call, for exercising caller timeouts.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn fail_next_create(&self, err: BackendError) {
        self.state.lock().create_failures.push_back(err);
    }

    pub fn fail_next_describe(&self, err: BackendError) {
        self.state.lock().describe_failures.push_back(err);
    }

    pub fn fail_next_terminate(&self, err: BackendError) {
        self.state.lock().terminate_failures.push_back(err);
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.lock().terminate_calls
    }

    /// Instances that still exist on the mock backend.
    pub fn live_instances(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Simulates the instance being deleted out-of-band.
    pub fn forget(&self, backend_instance_id: &str) {
        self.state.lock().instances.remove(backend_instance_id);
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, BackendError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.create_calls += 1;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let id = format!("{}-{:04}", self.name, seq);
        let ip = self
            .fixed_ip
            .clone()
            .unwrap_or_else(|| format!("10.0.{}.{}", seq / 250, seq % 250 + 1));
        state.instances.insert(
            id.clone(),
            MockInstance {
                name: spec.name.clone(),
                ip,
                polls: 0,
                terminating: false,
                polls_since_terminate: 0,
            },
        );
        tracing::debug!(backend = %self.name, backend_instance_id = %id, "mock instance created");
        Ok(id)
    }

    async fn describe(&self, backend_instance_id: &str) -> Result<InstanceObservation, BackendError> {
        let mut state = self.state.lock();
        state.describe_calls += 1;
        if let Some(err) = state.describe_failures.pop_front() {
            return Err(err);
        }

        let Some(instance) = state.instances.get_mut(backend_instance_id) else {
            return Ok(InstanceObservation::not_found());
        };

        if instance.terminating {
            instance.polls_since_terminate += 1;
            if instance.polls_since_terminate >= self.terminate_polls {
                state.instances.remove(backend_instance_id);
                return Ok(InstanceObservation::not_found());
            }
            return Ok(InstanceObservation::new(BackendStatus::Running, None));
        }

        instance.polls += 1;
        let observation = match self.boot {
            BootBehavior::Fails => InstanceObservation::new(BackendStatus::Failed, None),
            BootBehavior::StuckBooting => InstanceObservation::new(BackendStatus::Booting, None),
            BootBehavior::Running if instance.polls >= self.boot_polls => {
                let ip = self.assign_ip.then(|| instance.ip.clone());
                InstanceObservation::new(BackendStatus::Running, ip)
            }
            BootBehavior::Running => InstanceObservation::new(BackendStatus::Booting, None),
        };
        Ok(observation)
    }

    async fn terminate(&self, backend_instance_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.terminate_calls += 1;
        if let Some(err) = state.terminate_failures.pop_front() {
            return Err(err);
        }
        if let Some(instance) = state.instances.get_mut(backend_instance_id) {
            instance.terminating = true;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<inventory::DiscoveredInstance>, BackendError> {
        let state = self.state.lock();
        let mut found: Vec<_> = state
            .instances
            .iter()
            .map(|(id, inst)| inventory::DiscoveredInstance {
                backend_instance_id: id.clone(),
                name: inst.name.clone(),
                status: if inst.terminating { "terminating" } else { "running" }.to_string(),
                ip_address: self.assign_ip.then(|| inst.ip.clone()),
                created_at: None,
            })
            .collect();
        found.sort_by(|a, b| a.backend_instance_id.cmp(&b.backend_instance_id));
        Ok(found)
    }

    fn default_ssh_user(&self) -> Option<&str> {
        self.ssh_user.as_deref()
    }
}
