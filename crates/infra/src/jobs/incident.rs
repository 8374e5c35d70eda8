use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use flowforge_core::{EngineError, EngineResult, EntityId, EntityKey, EntityType, Revision};

use crate::command::context::CommandContext;

pub const FAILED_JOB_INCIDENT: &str = "failedJob";

/// Open problem requiring operator attention, such as a job out of retries.
#[derive(Debug, Serialize, Deserialize)]
pub struct IncidentEntity {
    #[serde(skip)]
    id: Option<EntityId>,
    #[serde(skip)]
    revision: Revision,
    pub incident_type: String,
    pub job_id: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

flowforge_core::impl_db_entity!(IncidentEntity, EntityType::Incident, references = IncidentEntity::job_key);

impl IncidentEntity {
    fn job_key(&self) -> Vec<EntityKey> {
        vec![EntityKey::new(EntityType::Job, self.job_id.as_str())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentInfo {
    pub id: EntityId,
    pub incident_type: String,
    pub job_id: EntityId,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IncidentInfo {
    fn from_entity(incident: &IncidentEntity) -> EngineResult<Self> {
        Ok(Self {
            id: incident
                .id
                .clone()
                .ok_or_else(|| EngineError::invalid_argument("incident has no id"))?,
            incident_type: incident.incident_type.clone(),
            job_id: EntityId::new(incident.job_id.clone()),
            message: incident.message.clone(),
            created_at: incident.created_at,
        })
    }
}

pub struct IncidentManager<'a> {
    ctx: &'a CommandContext,
}

impl<'a> IncidentManager<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    /// Record that `job_id` ran out of retries.
    pub fn create_failed_job_incident(
        &self,
        job_id: &EntityId,
        message: Option<String>,
    ) -> EngineResult<Rc<RefCell<IncidentEntity>>> {
        let incident = IncidentEntity {
            id: None,
            revision: 0,
            incident_type: FAILED_JOB_INCIDENT.to_string(),
            job_id: job_id.as_str().to_string(),
            message,
            created_at: self.ctx.now(),
        };
        let incident = self.ctx.entity_manager().insert(incident)?;
        info!(job_id = %job_id, "incident created for failed job");
        Ok(incident)
    }

    pub fn find_by_job(&self, job_id: &EntityId) -> EngineResult<Vec<Rc<RefCell<IncidentEntity>>>> {
        self.ctx
            .entity_manager()
            .select_by_field("job_id", job_id.as_str(), |i: &IncidentEntity| {
                i.job_id == job_id.as_str()
            })
    }

    /// Delete the job's open incidents. Returns how many were resolved.
    pub fn resolve_for_job(&self, job_id: &EntityId) -> EngineResult<usize> {
        let incidents = self.find_by_job(job_id)?;
        for incident in &incidents {
            self.ctx.entity_manager().delete(incident)?;
        }
        if !incidents.is_empty() {
            info!(job_id = %job_id, resolved = incidents.len(), "incidents resolved");
        }
        Ok(incidents.len())
    }

    pub fn list(&self) -> EngineResult<Vec<IncidentInfo>> {
        let mut incidents = self
            .ctx
            .entity_manager()
            .select_all::<IncidentEntity>()?
            .iter()
            .map(|i| IncidentInfo::from_entity(&i.borrow()))
            .collect::<EngineResult<Vec<_>>>()?;
        incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(incidents)
    }
}
