//! Known projects used for fuzzy document-to-project matching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project the requesting user can see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

impl KnownProject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Source of the project list embedded in the extraction prompt.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    /// Projects visible to `user_id`.
    async fn projects_for(&self, user_id: Uuid) -> Vec<KnownProject>;
}

/// Fixed list of projects, shared by every user.
#[derive(Debug, Clone, Default)]
pub struct StaticProjectCatalog {
    projects: Vec<KnownProject>,
}

impl StaticProjectCatalog {
    pub fn new(projects: Vec<KnownProject>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ProjectCatalog for StaticProjectCatalog {
    async fn projects_for(&self, _user_id: Uuid) -> Vec<KnownProject> {
        self.projects.clone()
    }
}
