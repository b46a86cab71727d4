//! Anti-corruption translator
//!
//! Converts between legacy DTOs and domain entities. Import is tolerant:
//! identifiers that are not canonical UUIDs are replaced with fresh ones, and
//! unrecognized vocabulary maps to a conservative default instead of failing.
//! Export drops domain-only fields that the legacy schema has no column for.

use uuid::Uuid;

use crate::domain::build::{Build, BuildStatus};
use crate::domain::deployment::{Deployment, DeploymentStatus};
use crate::domain::service::{BuildKind, BuildSource, Service, ServiceStatus};
use crate::dto::legacy::{LegacyBuildDto, LegacyDeploymentDto, LegacyServiceDto};

// =============================================================================
// Vocabulary tables
// =============================================================================

const SERVICE_STATUSES: &[(&str, ServiceStatus)] = &[
    ("pending", ServiceStatus::Pending),
    ("building", ServiceStatus::Building),
    ("deploying", ServiceStatus::Deploying),
    ("running", ServiceStatus::Running),
    ("failed", ServiceStatus::Failed),
    ("stopped", ServiceStatus::Stopped),
];
const DEFAULT_SERVICE_STATUS: ServiceStatus = ServiceStatus::Pending;

const BUILD_KINDS: &[(&str, BuildKind)] = &[
    ("auto", BuildKind::Auto),
    ("dockerfile", BuildKind::Dockerfile),
    ("buildpack", BuildKind::Buildpack),
    ("static", BuildKind::Static),
];
const DEFAULT_BUILD_KIND: BuildKind = BuildKind::Auto;

const BUILD_STATUSES: &[(&str, BuildStatus)] = &[
    ("queued", BuildStatus::Queued),
    ("running", BuildStatus::Running),
    ("success", BuildStatus::Succeeded),
    ("failed", BuildStatus::Failed),
    ("cancelled", BuildStatus::Canceled),
];
const DEFAULT_BUILD_STATUS: BuildStatus = BuildStatus::Queued;

const DEPLOYMENT_STATUSES: &[(&str, DeploymentStatus)] = &[
    ("pending", DeploymentStatus::Pending),
    ("deploying", DeploymentStatus::InProgress),
    ("deployed", DeploymentStatus::Succeeded),
    ("failed", DeploymentStatus::Failed),
    ("rolled_back", DeploymentStatus::RolledBack),
];
const DEFAULT_DEPLOYMENT_STATUS: DeploymentStatus = DeploymentStatus::Pending;

fn lookup<T: Copy>(table: &[(&str, T)], legacy: &str, default: T) -> T {
    let legacy = legacy.trim().to_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == legacy)
        .map(|(_, value)| *value)
        .unwrap_or(default)
}

fn reverse<T: Copy + PartialEq>(table: &[(&'static str, T)], value: T) -> &'static str {
    table
        .iter()
        .find(|(_, v)| *v == value)
        .map(|(name, _)| *name)
        // every table covers its whole enum
        .unwrap_or("unknown")
}

// =============================================================================
// Identity and slug helpers
// =============================================================================

/// Parse a canonical UUID, or mint a new one for non-canonical input
pub fn parse_or_generate_id(raw: &str) -> Uuid {
    Uuid::parse_str(raw.trim()).unwrap_or_else(|_| Uuid::new_v4())
}

fn parse_optional_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|s| Uuid::parse_str(s.trim()).ok())
}

/// Deterministic, idempotent slug: trimmed, lowercase, spaces and underscores
/// become hyphens.
pub fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect()
}

// =============================================================================
// Service
// =============================================================================

pub fn service_from_legacy(dto: LegacyServiceDto) -> Service {
    let slug = if dto.slug.trim().is_empty() {
        slugify(&dto.name)
    } else {
        dto.slug
    };

    Service {
        id: parse_or_generate_id(&dto.id),
        project_id: parse_or_generate_id(&dto.project_id),
        name: dto.name,
        slug,
        source: BuildSource {
            repository_url: dto.repo_url,
            branch: dto.branch,
            kind: lookup(BUILD_KINDS, &dto.build_type, DEFAULT_BUILD_KIND),
        },
        status: lookup(SERVICE_STATUSES, &dto.status, DEFAULT_SERVICE_STATUS),
        current_build_id: parse_optional_id(dto.current_build_id.as_deref()),
        current_deployment_id: None,
        current_version: dto.current_version,
        created_at: dto.created_at,
        updated_at: dto.updated_at,
    }
}

pub fn service_to_legacy(service: &Service) -> LegacyServiceDto {
    LegacyServiceDto {
        id: service.id.to_string(),
        project_id: service.project_id.to_string(),
        name: service.name.clone(),
        slug: service.slug.clone(),
        repo_url: service.source.repository_url.clone(),
        branch: service.source.branch.clone(),
        build_type: reverse(BUILD_KINDS, service.source.kind).to_string(),
        status: reverse(SERVICE_STATUSES, service.status).to_string(),
        current_build_id: service.current_build_id.map(|id| id.to_string()),
        current_version: service.current_version.clone(),
        created_at: service.created_at,
        updated_at: service.updated_at,
    }
}

// =============================================================================
// Build
// =============================================================================

pub fn build_from_legacy(dto: LegacyBuildDto) -> Build {
    Build {
        id: parse_or_generate_id(&dto.id),
        service_id: parse_or_generate_id(&dto.service_id),
        status: lookup(BUILD_STATUSES, &dto.status, DEFAULT_BUILD_STATUS),
        commit_sha: dto.commit_sha,
        external_id: None,
        artifact: dto.image,
        error: dto.error_message,
        created_at: dto.created_at,
        started_at: None,
        finished_at: dto.finished_at,
    }
}

pub fn build_to_legacy(build: &Build) -> LegacyBuildDto {
    LegacyBuildDto {
        id: build.id.to_string(),
        service_id: build.service_id.to_string(),
        status: reverse(BUILD_STATUSES, build.status).to_string(),
        commit_sha: build.commit_sha.clone(),
        image: build.artifact.clone(),
        error_message: build.error.clone(),
        created_at: build.created_at,
        finished_at: build.finished_at,
    }
}

// =============================================================================
// Deployment
// =============================================================================

pub fn deployment_from_legacy(dto: LegacyDeploymentDto) -> Deployment {
    Deployment {
        id: parse_or_generate_id(&dto.id),
        service_id: parse_or_generate_id(&dto.service_id),
        build_id: parse_or_generate_id(&dto.build_id),
        status: lookup(DEPLOYMENT_STATUSES, &dto.status, DEFAULT_DEPLOYMENT_STATUS),
        external_id: None,
        revision: None,
        version: dto.version,
        replicas: dto.replicas,
        error: None,
        created_at: dto.created_at,
        finished_at: dto.finished_at,
    }
}

pub fn deployment_to_legacy(deployment: &Deployment) -> LegacyDeploymentDto {
    LegacyDeploymentDto {
        id: deployment.id.to_string(),
        service_id: deployment.service_id.to_string(),
        build_id: deployment.build_id.to_string(),
        status: reverse(DEPLOYMENT_STATUSES, deployment.status).to_string(),
        version: deployment.version.clone(),
        replicas: deployment.replicas,
        created_at: deployment.created_at,
        finished_at: deployment.finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn legacy_service(status: &str, build_type: &str) -> LegacyServiceDto {
        LegacyServiceDto {
            id: Uuid::new_v4().to_string(),
            project_id: Uuid::new_v4().to_string(),
            name: "Billing API".to_string(),
            slug: "billing-api".to_string(),
            repo_url: "https://github.com/acme/billing.git".to_string(),
            branch: "main".to_string(),
            build_type: build_type.to_string(),
            status: status.to_string(),
            current_build_id: Some(Uuid::new_v4().to_string()),
            current_version: Some("v42".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn legacy_build(status: &str) -> LegacyBuildDto {
        LegacyBuildDto {
            id: Uuid::new_v4().to_string(),
            service_id: Uuid::new_v4().to_string(),
            status: status.to_string(),
            commit_sha: "abc123".to_string(),
            image: Some("registry.local/billing:abc123".to_string()),
            error_message: None,
            created_at: Utc::now(),
            finished_at: Some(Utc::now()),
        }
    }

    fn legacy_deployment(status: &str) -> LegacyDeploymentDto {
        LegacyDeploymentDto {
            id: Uuid::new_v4().to_string(),
            service_id: Uuid::new_v4().to_string(),
            build_id: Uuid::new_v4().to_string(),
            status: status.to_string(),
            version: "abc123".to_string(),
            replicas: 3,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn test_service_round_trip_every_vocabulary_value() {
        for (status, _) in SERVICE_STATUSES {
            for (kind, _) in BUILD_KINDS {
                let dto = legacy_service(status, kind);
                assert_eq!(service_to_legacy(&service_from_legacy(dto.clone())), dto);
            }
        }
    }

    #[test]
    fn test_build_round_trip_every_status() {
        for (status, _) in BUILD_STATUSES {
            let dto = legacy_build(status);
            assert_eq!(build_to_legacy(&build_from_legacy(dto.clone())), dto);
        }
    }

    #[test]
    fn test_deployment_round_trip_every_status() {
        for (status, _) in DEPLOYMENT_STATUSES {
            let dto = legacy_deployment(status);
            assert_eq!(deployment_to_legacy(&deployment_from_legacy(dto.clone())), dto);
        }
    }

    #[test]
    fn test_unrecognized_vocabulary_maps_to_default() {
        let service = service_from_legacy(legacy_service("hibernating", "nixpacks"));
        assert_eq!(service.status, ServiceStatus::Pending);
        assert_eq!(service.source.kind, BuildKind::Auto);

        let build = build_from_legacy(legacy_build("exploded"));
        assert_eq!(build.status, BuildStatus::Queued);

        let deployment = deployment_from_legacy(legacy_deployment("???"));
        assert_eq!(deployment.status, DeploymentStatus::Pending);

        // Export of the defaulted value is the canonical default, never an error
        let dto = service_to_legacy(&service);
        assert_eq!(dto.status, "pending");
        assert_eq!(dto.build_type, "auto");
        // Everything else survives
        assert_eq!(dto.name, "Billing API");
        assert_eq!(dto.current_version.as_deref(), Some("v42"));
    }

    #[test]
    fn test_vocabulary_lookup_ignores_case_and_whitespace() {
        let build = build_from_legacy(legacy_build("  SUCCESS "));
        assert_eq!(build.status, BuildStatus::Succeeded);
    }

    #[test]
    fn test_non_canonical_ids_are_replaced() {
        let mut dto = legacy_service("running", "dockerfile");
        dto.id = "svc-1234".to_string();
        dto.current_build_id = Some("build#9".to_string());

        let first = service_from_legacy(dto.clone());
        let second = service_from_legacy(dto);

        assert_ne!(first.id, second.id);
        assert_eq!(first.current_build_id, None);
    }

    #[test]
    fn test_missing_slug_is_generated() {
        let mut dto = legacy_service("running", "dockerfile");
        dto.slug = String::new();
        dto.name = "Billing_Service V2".to_string();

        let service = service_from_legacy(dto);
        assert_eq!(service.slug, "billing-service-v2");
    }

    #[test]
    fn test_slugify_is_idempotent() {
        let inputs = [
            "Billing API",
            "  padded_name  ",
            "already-a-slug",
            "MiXeD_case and spaces",
            "",
        ];
        for input in inputs {
            let once = slugify(input);
            assert_eq!(slugify(&once), once, "input {input:?}");
            assert!(!once.contains(' ') && !once.contains('_'));
        }
    }

    #[test]
    fn test_export_drops_domain_only_fields() {
        let mut build = build_from_legacy(legacy_build("running"));
        build.external_id = Some("ci-77".to_string());
        build.started_at = Some(Utc::now());

        let dto = build_to_legacy(&build);
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("external_id").is_none());
        assert!(json.get("started_at").is_none());
    }
}
