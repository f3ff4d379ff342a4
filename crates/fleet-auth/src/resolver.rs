//! Group / deployment assignment resolution

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::verifier::AuthError;

/// Stable identifiers for the group and deployment an agent asked to join.
/// Empty strings mean "not assigned".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAssignment {
    pub group_id: String,
    pub deployment_id: String,
}

/// Maps group/deployment names to identifiers, creating records that do not
/// exist yet.
#[async_trait]
pub trait AssignmentResolver: Send + Sync {
    async fn resolve(
        &self,
        group_name: &str,
        deployment_name: &str,
    ) -> Result<ResolvedAssignment, AuthError>;
}

#[derive(Debug, Clone)]
struct GroupRecord {
    id: String,
    deployment_id: String,
}

#[derive(Debug, Default)]
struct ResolverState {
    /// deployment name -> id
    deployments: HashMap<String, String>,
    /// group name -> record
    groups: HashMap<String, GroupRecord>,
    /// deployment id -> linked group ids
    deployment_groups: HashMap<String, BTreeSet<String>>,
}

/// Process-local resolver with create-if-absent semantics
#[derive(Debug, Default)]
pub struct InMemoryAssignmentResolver {
    state: Mutex<ResolverState>,
}

impl InMemoryAssignmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group ids currently linked to a deployment
    pub fn groups_of_deployment(&self, deployment_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .deployment_groups
            .get(deployment_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deployment a group currently belongs to, if any
    pub fn deployment_of_group(&self, group_name: &str) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .groups
            .get(group_name)
            .map(|group| group.deployment_id.clone())
            .filter(|id| !id.is_empty())
    }
}

#[async_trait]
impl AssignmentResolver for InMemoryAssignmentResolver {
    async fn resolve(
        &self,
        group_name: &str,
        deployment_name: &str,
    ) -> Result<ResolvedAssignment, AuthError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let mut resolved = ResolvedAssignment::default();

        // Deployment first, so a new group can be created inside it
        if !deployment_name.is_empty() {
            let id = state
                .deployments
                .entry(deployment_name.to_string())
                .or_insert_with(|| {
                    info!(deployment = %deployment_name, "Creating deployment");
                    Uuid::new_v4().to_string()
                });
            resolved.deployment_id = id.clone();
        }

        if !group_name.is_empty() {
            let group = state
                .groups
                .entry(group_name.to_string())
                .or_insert_with(|| {
                    info!(group = %group_name, "Creating agent group");
                    GroupRecord {
                        id: Uuid::new_v4().to_string(),
                        deployment_id: resolved.deployment_id.clone(),
                    }
                });

            if !resolved.deployment_id.is_empty() && group.deployment_id != resolved.deployment_id
            {
                debug!(
                    group = %group_name,
                    from = %group.deployment_id,
                    to = %resolved.deployment_id,
                    "Moving agent group to new deployment"
                );
                if let Some(linked) = state.deployment_groups.get_mut(&group.deployment_id) {
                    linked.remove(&group.id);
                    if linked.is_empty() {
                        state.deployment_groups.remove(&group.deployment_id);
                    }
                }
                group.deployment_id = resolved.deployment_id.clone();
            }
            resolved.group_id = group.id.clone();

            if !resolved.deployment_id.is_empty() {
                state
                    .deployment_groups
                    .entry(resolved.deployment_id.clone())
                    .or_default()
                    .insert(resolved.group_id.clone());
            }
        }

        Ok(resolved)
    }
}
