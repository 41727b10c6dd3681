//! Test data builders for creating process records
//!
//! Defaults describe a transient, never-run job named `test_job` in queue
//! `default` owned by `default`.

use chrono::{DateTime, Utc};
use jobqueue_domain::{Occurrence, ProcessEntity, ProcessStatus, Resilience};

/// Builder for creating test ProcessEntity records
pub struct ProcessEntityBuilder {
    entity: ProcessEntity,
}

impl ProcessEntityBuilder {
    pub fn new() -> Self {
        Self {
            entity: ProcessEntity::new(
                1,
                "default",
                "default",
                "test_job",
                Occurrence::immediate(),
                Resilience::default(),
            ),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.entity.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.entity.name = name.to_string();
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.entity.queue_owner = owner.to_string();
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.entity.queue_name = queue.to_string();
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.entity.user = Some(user.to_string());
        self
    }

    pub fn with_status(mut self, status: ProcessStatus) -> Self {
        self.entity.status = status;
        self
    }

    pub fn with_occurrence(mut self, occurrence: Occurrence) -> Self {
        self.entity.occurrence = occurrence;
        self
    }

    pub fn with_resilience(mut self, resilience: Resilience) -> Self {
        self.entity.resilience = resilience;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.entity.attempt = attempt;
        self
    }

    pub fn with_run_count(mut self, run_count: u32) -> Self {
        self.entity.run_count = run_count;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.entity.created_at = created_at;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.entity.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.entity.started_at = Some(started_at);
        self
    }

    pub fn with_current_section(mut self, section: usize) -> Self {
        self.entity.current_section = section;
        self
    }

    pub fn with_parameter(mut self, name: &str, value: serde_json::Value) -> Self {
        self.entity.parameters.insert(name.to_string(), value);
        self
    }

    pub fn with_work_key(mut self, key: &str) -> Self {
        self.entity.work_key = Some(key.to_string());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.entity.persistent = true;
        self
    }

    pub fn keep_completed(mut self) -> Self {
        self.entity.keep_completed = true;
        self
    }

    pub fn build(self) -> ProcessEntity {
        self.entity
    }
}

impl Default for ProcessEntityBuilder {
    fn default() -> Self {
        Self::new()
    }
}
