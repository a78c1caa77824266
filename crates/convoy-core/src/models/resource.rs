use serde::{Deserialize, Serialize};

use crate::models::error::{DispatchError, DispatchErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Repository,
    RepositoryDistributor,
    RepositoryImporter,
    Consumer,
    ConsumerBinding,
    ContentUnit,
    Schedule,
    User,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Repository => "repository",
            ResourceType::RepositoryDistributor => "repository_distributor",
            ResourceType::RepositoryImporter => "repository_importer",
            ResourceType::Consumer => "consumer",
            ResourceType::ConsumerBinding => "consumer_binding",
            ResourceType::ContentUnit => "content_unit",
            ResourceType::Schedule => "schedule",
            ResourceType::User => "user",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Outcome of weighing a proposed operation against work already in flight.
///
/// The variant order carries the dominance used when reducing across
/// resources: `Reject` > `Postpone` > `Accept`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Postpone,
    Reject,
}

/// One resource a call request touches and the operation it performs on it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub operation: Operation,
}

/// The full set of resources a call request touches.
///
/// A request may claim a given (type, id) pair at most once.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceFootprint {
    claims: Vec<ResourceClaim>,
}

impl ResourceFootprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        operation: Operation,
    ) -> Result<(), DispatchError> {
        let resource_id = resource_id.into();
        if self.operation_for(resource_type, &resource_id).is_some() {
            return Err(DispatchError::new(
                DispatchErrorKind::DuplicateResource,
                format!(
                    "call request already claims {} '{resource_id}'",
                    resource_type.as_str()
                ),
            ));
        }
        self.claims.push(ResourceClaim {
            resource_type,
            resource_id,
            operation,
        });
        Ok(())
    }

    pub fn creates(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Result<(), DispatchError> {
        self.claim(resource_type, resource_id, Operation::Create)
    }

    pub fn reads(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Result<(), DispatchError> {
        self.claim(resource_type, resource_id, Operation::Read)
    }

    pub fn updates(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Result<(), DispatchError> {
        self.claim(resource_type, resource_id, Operation::Update)
    }

    pub fn deletes(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Result<(), DispatchError> {
        self.claim(resource_type, resource_id, Operation::Delete)
    }

    pub fn operation_for(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Option<Operation> {
        self.claims
            .iter()
            .find(|claim| claim.resource_type == resource_type && claim.resource_id == resource_id)
            .map(|claim| claim.operation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceClaim> {
        self.claims.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }
}
