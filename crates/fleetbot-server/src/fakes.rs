//! In-process stand-ins for the compute and chat collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use fleetbot_contracts::{HealthStatus, InstanceState, Region, TaskRuntimeParameters, TAG_NAME};

use crate::cloud::{CloudError, InstanceApi, RemoteInstance, RemoteTask, RunTaskRequest, TaskApi};
use crate::instances::MessageSink;
use crate::messenger::{Messenger, MessengerError};

pub fn fixture_regions() -> Vec<Region> {
    vec![
        Region {
            id: "eu-central-1".to_string(),
            city: "frankfurt".to_string(),
            label: "Frankfurt, Germany".to_string(),
        },
        Region {
            id: "us-east-1".to_string(),
            city: "virginia".to_string(),
            label: "N. Virginia, USA".to_string(),
        },
    ]
}

pub fn runtime_params(cluster: &str) -> TaskRuntimeParameters {
    TaskRuntimeParameters {
        cluster_id: cluster.to_string(),
        task_template_id: format!("{cluster}-template"),
        subnet_id: "subnet-1".to_string(),
        security_group_id: "sg-1".to_string(),
    }
}

#[derive(Default)]
pub struct FakeTasks {
    pub tasks: Mutex<Vec<RemoteTask>>,
    pub runs: Mutex<Vec<RunTaskRequest>>,
    pub stopped: Mutex<Vec<String>>,
    health_script: Mutex<VecDeque<HealthStatus>>,
    next_id: AtomicUsize,
}

impl FakeTasks {
    /// Each describe call consumes one status; the last one sticks.
    pub fn script_health(&self, statuses: &[HealthStatus]) {
        *self.health_script.lock().unwrap() = statuses.iter().copied().collect();
    }

    pub fn hold_health(&self, status: HealthStatus) {
        self.health_script.lock().unwrap().clear();
        for task in self.tasks.lock().unwrap().iter_mut() {
            task.health = status;
        }
    }
}

#[async_trait]
impl TaskApi for FakeTasks {
    async fn run_task(&self, request: RunTaskRequest) -> Result<RemoteTask, CloudError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = RemoteTask {
            task_id: format!("task-{n}"),
            cluster_id: request.cluster_id.clone(),
            last_status: "PROVISIONING".to_string(),
            health: HealthStatus::Unknown,
            tags: request.tags.clone(),
            public_ip: None,
            started_at: Some("2026-02-14T00:00:00Z".to_string()),
        };
        self.tasks.lock().unwrap().push(task.clone());
        self.runs.lock().unwrap().push(request);
        Ok(task)
    }

    async fn list_tasks(&self, cluster_id: &str) -> Result<Vec<RemoteTask>, CloudError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn describe_task(
        &self,
        cluster_id: &str,
        task_id: &str,
    ) -> Result<Option<RemoteTask>, CloudError> {
        let next = self.health_script.lock().unwrap().pop_front();
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks
            .iter_mut()
            .find(|t| t.cluster_id == cluster_id && t.task_id == task_id)
        else {
            return Ok(None);
        };
        if let Some(status) = next {
            task.health = status;
        }
        if task.health == HealthStatus::Healthy {
            task.last_status = "RUNNING".to_string();
            task.public_ip = Some("203.0.113.10".to_string());
        }
        Ok(Some(task.clone()))
    }

    async fn stop_task(&self, cluster_id: &str, task_id: &str, _reason: &str) -> Result<(), CloudError> {
        self.tasks
            .lock()
            .unwrap()
            .retain(|t| !(t.cluster_id == cluster_id && t.task_id == task_id));
        self.stopped.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

/// Instances move one step toward their target state on every describe call
/// unless frozen.
#[derive(Default)]
pub struct FakeInstances {
    pub instances: Mutex<Vec<RemoteInstance>>,
    pub calls: Mutex<Vec<String>>,
    pub frozen: AtomicBool,
}

impl FakeInstances {
    pub fn with(instances: &[(&str, &str, InstanceState)]) -> Self {
        let fake = Self::default();
        *fake.instances.lock().unwrap() = instances
            .iter()
            .map(|(id, name, state)| RemoteInstance {
                instance_id: id.to_string(),
                state: *state,
                tags: [(TAG_NAME.to_string(), name.to_string())].into_iter().collect(),
                public_ip: None,
            })
            .collect();
        fake
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn transition(&self, instance_id: &str, call: &str, state: InstanceState) -> Result<(), CloudError> {
        self.calls.lock().unwrap().push(format!("{call}:{instance_id}"));
        let mut instances = self.instances.lock().unwrap();
        match instances.iter_mut().find(|i| i.instance_id == instance_id) {
            Some(instance) => {
                instance.state = state;
                Ok(())
            }
            None => Err(CloudError::Api {
                status: 404,
                body: format!("no instance {instance_id}"),
            }),
        }
    }
}

#[async_trait]
impl InstanceApi for FakeInstances {
    async fn describe_instances(&self) -> Result<Vec<RemoteInstance>, CloudError> {
        let mut instances = self.instances.lock().unwrap();
        if !self.frozen.load(Ordering::SeqCst) {
            for instance in instances.iter_mut() {
                instance.state = match instance.state {
                    InstanceState::Pending => InstanceState::Running,
                    InstanceState::Stopping => InstanceState::Stopped,
                    other => other,
                };
                instance.public_ip = (instance.state == InstanceState::Running)
                    .then(|| "198.51.100.7".to_string());
            }
        }
        Ok(instances.clone())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.transition(instance_id, "start", InstanceState::Pending)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.transition(instance_id, "stop", InstanceState::Stopping)
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.transition(instance_id, "reboot", InstanceState::Running)
    }
}

#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingMessenger {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), MessengerError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub notes: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingSink {
    pub fn templates(&self) -> Vec<String> {
        self.notes.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn notify(&self, template: &str, params: &[String]) {
        self.notes
            .lock()
            .unwrap()
            .push((template.to_string(), params.to_vec()));
    }
}
