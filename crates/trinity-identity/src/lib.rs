#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-identity** – Identity & Ownership (§4.1).
//!
//! Owns agent naming, ownership, sharing, and the `can_access` check every
//! other component consults before acting on an agent on behalf of an
//! external (non-agent) caller.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use trinity_store_core::{RecordStore, StoreError};
use trinity_types::{
    Agent, AccessScope, LifecycleState, PermissionEdge, Principal, PrincipalId, PrincipalRole,
    ResourceLimits, RuntimeKind, TemplateRef, TrinityError, AgentName, SharedFolderConfig,
};

/// Identity & Ownership service.
pub struct IdentityService {
    store: Arc<dyn RecordStore>,
}

impl IdentityService {
    /// Construct a service over the given record store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Create a new agent record.
    ///
    /// On success, auto-grants bidirectional permission edges between the
    /// new agent and every currently-running agent owned by the same
    /// principal (the "same-owner default mesh").
    #[instrument(skip(self), fields(name = %name, owner = %owner))]
    pub async fn create(
        &self,
        name: AgentName,
        owner: PrincipalId,
        template_ref: TemplateRef,
        resource_limits: ResourceLimits,
        runtime_kind: RuntimeKind,
    ) -> Result<Agent, TrinityError> {
        if self
            .store
            .get_agent(&name)
            .await
            .map_err(store_err)?
            .is_some()
        {
            return Err(TrinityError::NameConflict(name.to_string()));
        }

        let agent = Agent {
            name: name.clone(),
            template_ref,
            owner: owner.clone(),
            sharing: vec![],
            resource_limits,
            runtime_kind,
            model: String::new(),
            autonomy: false,
            full_capabilities: false,
            state: LifecycleState::Created,
            system_protected: false,
            shared_folders: SharedFolderConfig::default(),
            container_id: None,
            port: None,
            created_at: Utc::now(),
            last_started_at: None,
        };

        self.store
            .insert_agent(agent.clone())
            .await
            .map_err(store_err)?;

        self.grant_same_owner_mesh(&agent).await?;

        Ok(agent)
    }

    async fn grant_same_owner_mesh(&self, agent: &Agent) -> Result<(), TrinityError> {
        let siblings = self
            .store
            .list_agents(Some(&agent.owner))
            .await
            .map_err(store_err)?;
        for sibling in siblings {
            if sibling.name == agent.name || sibling.state != LifecycleState::Running {
                continue;
            }
            let now = Utc::now();
            self.store
                .set_edge(PermissionEdge {
                    source_agent: agent.name.clone(),
                    target_agent: sibling.name.clone(),
                    granted_by: agent.owner.clone(),
                    granted_at: now,
                })
                .await
                .map_err(store_err)?;
            self.store
                .set_edge(PermissionEdge {
                    source_agent: sibling.name.clone(),
                    target_agent: agent.name.clone(),
                    granted_by: agent.owner.clone(),
                    granted_at: now,
                })
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Resolve an agent by name.
    pub async fn resolve(&self, name: &AgentName) -> Result<Agent, TrinityError> {
        self.store
            .get_agent(name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| TrinityError::NotFound(name.to_string()))
    }

    /// Whether `principal` may act on `name` at the given `scope`.
    #[instrument(skip(self))]
    pub async fn can_access(
        &self,
        principal: &Principal,
        name: &AgentName,
        scope: AccessScope,
    ) -> Result<bool, TrinityError> {
        if principal.is_system() {
            return Ok(true);
        }
        let agent = self.resolve(name).await?;

        if principal.role == PrincipalRole::Admin {
            return Ok(true);
        }
        let is_owner = agent.owner == principal.id;
        let is_sharee = agent.sharing.contains(&principal.id);

        Ok(match scope {
            AccessScope::Delete | AccessScope::Write => is_owner || is_sharee,
            AccessScope::Read => is_owner || is_sharee,
        })
    }

    /// Grant `principal` read/write access via the sharing set.
    pub async fn share(&self, name: &AgentName, principal: PrincipalId) -> Result<(), TrinityError> {
        let mut agent = self.resolve(name).await?;
        if !agent.sharing.contains(&principal) {
            agent.sharing.push(principal);
        }
        self.store.put_agent(agent).await.map_err(store_err)
    }

    /// Revoke a previously shared principal's access.
    pub async fn unshare(&self, name: &AgentName, principal: &PrincipalId) -> Result<(), TrinityError> {
        let mut agent = self.resolve(name).await?;
        agent.sharing.retain(|p| p != principal);
        self.store.put_agent(agent).await.map_err(store_err)
    }

    /// Delete an agent record, cascading to permission edges and schedules.
    ///
    /// Forbidden for agents flagged `system_protected` regardless of caller.
    #[instrument(skip(self))]
    pub async fn delete(&self, principal: &Principal, name: &AgentName) -> Result<(), TrinityError> {
        let agent = self.resolve(name).await?;
        if agent.system_protected {
            return Err(TrinityError::NotAuthorized(format!(
                "{name} is system-protected"
            )));
        }
        let allowed = principal.is_system()
            || principal.role == PrincipalRole::Admin
            || agent.owner == principal.id;
        if !allowed {
            return Err(TrinityError::NotAuthorized(name.to_string()));
        }
        self.store.delete_agent_cascade(name).await.map_err(store_err)
    }
}

fn store_err(e: StoreError) -> TrinityError {
    match e {
        StoreError::NotFound(m) => TrinityError::NotFound(m),
        StoreError::Conflict(m) => TrinityError::NameConflict(m),
        StoreError::Backend(m) => TrinityError::Internal(m),
    }
}
