//! Per-resource-type crawl capabilities.
//!
//! Each resource type is a table row naming its GraphQL document (with the
//! path to the connection inside `data`), its REST endpoint template, and
//! the directory bucket it is written into. Strategy selection is a lookup,
//! not a dispatch hierarchy.

use crate::api::queries;
use crate::config::Strategy;

/// Wire protocol chosen for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Graphql,
    Rest,
}

/// GraphQL side of a resource: the document plus where its connection
/// lives in the response data.
pub struct GraphqlSpec {
    pub document: &'static str,
    pub path: &'static [&'static str],
}

/// Capability row for one crawlable resource type.
pub struct ResourceSpec {
    /// Resource type name; also the writer file stem (after naming).
    pub name: &'static str,
    pub graphql: Option<GraphqlSpec>,
    /// REST endpoint template; `{id}` is replaced with the URL-encoded
    /// project path.
    pub rest: Option<&'static str>,
    /// Directory components between the area dir and the file.
    pub bucket_dirs: &'static [&'static str],
}

impl ResourceSpec {
    /// Choose the protocol under the configured strategy.
    ///
    /// GraphQL-capable types enumerate over GraphQL unless the strategy
    /// forces REST; types with no GraphQL equivalent always fall back to
    /// REST, which is what makes `hybrid` hybrid.
    pub fn protocol(&self, strategy: Strategy) -> Option<Protocol> {
        match strategy {
            Strategy::Rest => self
                .rest
                .map(|_| Protocol::Rest)
                .or(self.graphql.as_ref().map(|_| Protocol::Graphql)),
            Strategy::Graphql | Strategy::Hybrid => self
                .graphql
                .as_ref()
                .map(|_| Protocol::Graphql)
                .or(self.rest.map(|_| Protocol::Rest)),
        }
    }

    /// Concrete REST endpoint for a project path already URL-encoded.
    pub fn rest_endpoint(&self, encoded_project: &str) -> Option<String> {
        self.rest.map(|t| t.replace("{id}", encoded_project))
    }
}

/// Step 3: common project resources.
pub const COMMON_RESOURCES: &[ResourceSpec] = &[
    ResourceSpec {
        name: "labels",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_LABELS_QUERY,
            path: &["project", "labels"],
        }),
        rest: Some("/api/v4/projects/{id}/labels"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "issues",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_ISSUES_QUERY,
            path: &["project", "issues"],
        }),
        rest: Some("/api/v4/projects/{id}/issues"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "boards",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_BOARDS_QUERY,
            path: &["project", "boards"],
        }),
        rest: Some("/api/v4/projects/{id}/boards"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "epics",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/epics"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "audit_events",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/audit_events"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "snippets",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_SNIPPETS_QUERY,
            path: &["project", "snippets"],
        }),
        rest: Some("/api/v4/projects/{id}/snippets"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "pipelines",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_PIPELINES_QUERY,
            path: &["project", "pipelines"],
        }),
        rest: Some("/api/v4/projects/{id}/pipelines"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "releases",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_RELEASES_QUERY,
            path: &["project", "releases"],
        }),
        rest: Some("/api/v4/projects/{id}/releases"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "milestones",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_MILESTONES_QUERY,
            path: &["project", "milestones"],
        }),
        rest: Some("/api/v4/projects/{id}/milestones"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "merge_requests",
        graphql: Some(GraphqlSpec {
            document: queries::PROJECT_MERGE_REQUESTS_QUERY,
            path: &["project", "mergeRequests"],
        }),
        rest: Some("/api/v4/projects/{id}/merge_requests"),
        bucket_dirs: &[],
    },
];

/// Step 4: flat repository resources; branch-scoped objects (commits,
/// trees, file contents, job artifacts and logs) are handled directly by
/// the repository step because their endpoints and buckets depend on
/// runtime values.
pub const REPOSITORY_RESOURCES: &[ResourceSpec] = &[
    ResourceSpec {
        name: "branches",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/repository/branches"),
        bucket_dirs: &["repository"],
    },
    ResourceSpec {
        name: "tags",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/repository/tags"),
        bucket_dirs: &["repository"],
    },
    ResourceSpec {
        name: "dependencies",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/dependencies"),
        bucket_dirs: &[],
    },
    ResourceSpec {
        name: "vulnerabilities",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/vulnerabilities"),
        bucket_dirs: &["security"],
    },
    ResourceSpec {
        name: "packages",
        graphql: None,
        rest: Some("/api/v4/projects/{id}/packages"),
        bucket_dirs: &[],
    },
];

/// Percent-encode a project full path for use in REST endpoint templates.
pub fn encode_project_path(full_path: &str) -> String {
    full_path.replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &'static str) -> &'static ResourceSpec {
        COMMON_RESOURCES
            .iter()
            .chain(REPOSITORY_RESOURCES)
            .find(|s| s.name == name)
            .expect("known resource")
    }

    #[test]
    fn hybrid_prefers_graphql_but_falls_back_to_rest() {
        assert_eq!(spec("issues").protocol(Strategy::Hybrid), Some(Protocol::Graphql));
        assert_eq!(
            spec("audit_events").protocol(Strategy::Hybrid),
            Some(Protocol::Rest)
        );
        assert_eq!(
            spec("vulnerabilities").protocol(Strategy::Graphql),
            Some(Protocol::Rest)
        );
    }

    #[test]
    fn rest_strategy_forces_rest() {
        assert_eq!(spec("issues").protocol(Strategy::Rest), Some(Protocol::Rest));
    }

    #[test]
    fn endpoint_templates_substitute_the_encoded_path() {
        assert_eq!(
            spec("issues").rest_endpoint(&encode_project_path("group/app")),
            Some("/api/v4/projects/group%2Fapp/issues".to_string())
        );
    }
}
