//! Legacy DTOs
//!
//! These mirror the record layout of the older deployment API. Identifiers and
//! vocabularies are plain strings and may not be canonical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyServiceDto {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    pub repo_url: String,
    pub branch: String,
    pub build_type: String,
    pub status: String,
    pub current_build_id: Option<String>,
    pub current_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyBuildDto {
    pub id: String,
    pub service_id: String,
    pub status: String,
    pub commit_sha: String,
    pub image: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDeploymentDto {
    pub id: String,
    pub service_id: String,
    pub build_id: String,
    pub status: String,
    pub version: String,
    pub replicas: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
