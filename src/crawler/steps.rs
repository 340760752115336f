//! The four workflow steps: area discovery, user enumeration, common
//! project resources, and the repository deep-dive.
//!
//! Steps 3 and 4 fan projects out over a semaphore-bounded worker pool.
//! Within a project, failures are scoped to one resource-type stream: the
//! failure is reported and the next stream still runs.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::strategy::{
    COMMON_RESOURCES, Protocol, REPOSITORY_RESOURCES, ResourceSpec, encode_project_path,
};
use super::{Inner, STEP_AREAS, STEP_REPOSITORY, STEP_RESOURCES, STEP_USERS};
use crate::api::{fetch_all_pages, paginate, queries};
use crate::config::Strategy;
use crate::error::Result;
use crate::models::{Area, AreaKind, record_id};
use crate::output::sanitize_component;

/// Read the `/`-joined path out of a group or project record, whichever
/// protocol produced it.
fn full_path_of(record: &Value) -> Option<&str> {
    record
        .get("fullPath")
        .or_else(|| record.get("full_path"))
        .or_else(|| record.get("path_with_namespace"))
        .and_then(Value::as_str)
}

fn area_from_record(kind: AreaKind, record: &Value) -> Option<Area> {
    let full_path = full_path_of(record)?.to_owned();
    let id = record_id(record).unwrap_or_else(|| full_path.clone());
    Some(Area {
        kind,
        full_path,
        id,
    })
}

fn query_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl Inner {
    fn per_page(&self) -> u32 {
        self.config.gitlab.per_page
    }

    fn max_pages(&self) -> u32 {
        self.config.gitlab.max_pages
    }

    async fn graphql_all(
        &self,
        document: &str,
        variables: Map<String, Value>,
        path: &[&str],
    ) -> Result<Vec<Value>> {
        let first = self.per_page();
        paginate(|cursor| {
            let variables = variables.clone();
            async move {
                self.graphql
                    .fetch_connection_page(document, variables, first, cursor, path)
                    .await
            }
        })
        .await
    }

    /// Drain a REST endpoint, surfacing a mid-stream failure as a
    /// recoverable error while keeping the records already fetched.
    async fn rest_all(&self, step: &str, endpoint: &str) -> Vec<Value> {
        let outcome = fetch_all_pages(&self.rest, endpoint, self.per_page(), self.max_pages()).await;
        if let Some(error) = outcome.error {
            self.report_recoverable(step, &format!("{endpoint}: {error}"));
        }
        outcome.records
    }
}

/// Step 1: walk groups (recursing through subgroups with a visited set)
/// and collect every project for the later steps.
pub(super) async fn step_areas(inner: &Arc<Inner>, projects: &mut Vec<Area>) -> Result<()> {
    let use_rest = inner.config.gitlab.strategy == Strategy::Rest;
    let mut queue: VecDeque<Value> = if use_rest {
        inner
            .rest_all(STEP_AREAS, "/api/v4/groups?top_level_only=true")
            .await
            .into()
    } else {
        inner
            .graphql_all(queries::GROUPS_QUERY, Map::new(), &["groups"])
            .await?
            .into()
    };

    let mut visited: BTreeSet<String> = BTreeSet::new();
    while let Some(group) = queue.pop_front() {
        if inner.is_cancelled() {
            break;
        }
        let Some(area) = area_from_record(AreaKind::Group, &group) else {
            debug!("group record without a full path skipped");
            continue;
        };
        if !visited.insert(area.full_path.clone()) {
            continue;
        }
        info!("discovered group {}", area.full_path);
        inner.progress.record_area_discovered();
        let path = inner.writer.resource_path(Some(&area), "groups");
        inner.deliver(STEP_AREAS, "groups", path, vec![group.clone()]).await?;
        inner
            .writer
            .write_area_index(&area, json!({ "kind": "group" }))?;

        let subgroups = if use_rest {
            inner
                .rest_all(
                    STEP_AREAS,
                    &format!("/api/v4/groups/{}/subgroups", query_encode(&area.id)),
                )
                .await
        } else {
            let mut variables = Map::new();
            variables.insert("fullPath".into(), json!(area.full_path));
            inner
                .graphql_all(queries::SUBGROUPS_QUERY, variables, &["group", "subgroups"])
                .await?
        };
        queue.extend(subgroups);

        let group_projects = if use_rest {
            inner
                .rest_all(
                    STEP_AREAS,
                    &format!("/api/v4/groups/{}/projects", query_encode(&area.id)),
                )
                .await
        } else {
            let mut variables = Map::new();
            variables.insert("fullPath".into(), json!(area.full_path));
            inner
                .graphql_all(
                    queries::GROUP_PROJECTS_QUERY,
                    variables,
                    &["group", "projects"],
                )
                .await?
        };
        for project in group_projects {
            let Some(project_area) = area_from_record(AreaKind::Project, &project) else {
                continue;
            };
            if projects.iter().any(|p| p.full_path == project_area.full_path) {
                continue;
            }
            inner.progress.record_area_discovered();
            let path = inner.writer.resource_path(Some(&project_area), "projects");
            inner
                .deliver(STEP_AREAS, "projects", path, vec![project])
                .await?;
            inner
                .writer
                .write_area_index(&project_area, json!({ "kind": "project" }))?;
            projects.push(project_area);
        }
    }

    info!(
        "area discovery finished: {} groups, {} projects",
        visited.len(),
        projects.len()
    );
    inner.save_projects(projects);
    Ok(())
}

/// Step 2: enumerate every user visible to the account.
pub(super) async fn step_users(inner: &Arc<Inner>) -> Result<()> {
    let records = if inner.config.gitlab.strategy == Strategy::Rest {
        inner.rest_all(STEP_USERS, "/api/v4/users").await
    } else {
        inner
            .graphql_all(queries::USERS_QUERY, Map::new(), &["users"])
            .await?
    };
    info!("fetched {} users", records.len());
    let path = inner.writer.resource_path(None, "users");
    inner.deliver(STEP_USERS, "users", path, records).await
}

/// Step 3: common resources for every discovered project, fanned out over
/// the worker pool.
pub(super) async fn step_resources(inner: &Arc<Inner>, projects: &[Area]) -> Result<()> {
    run_project_pool(inner, STEP_RESOURCES, projects, |inner, project| async move {
        crawl_project_common(&inner, &project).await;
    })
    .await
}

/// Step 4: repository objects, CI artifacts, and security findings.
pub(super) async fn step_repository(inner: &Arc<Inner>, projects: &[Area]) -> Result<()> {
    run_project_pool(inner, STEP_REPOSITORY, projects, |inner, project| async move {
        crawl_project_repository(&inner, &project).await;
    })
    .await
}

/// Drain `projects` through a pool of `maxConcurrency` workers.
///
/// Ordering across projects is not guaranteed; a panicking worker is
/// recorded and the pool keeps going.
async fn run_project_pool<F, Fut>(
    inner: &Arc<Inner>,
    step: &'static str,
    projects: &[Area],
    work: F,
) -> Result<()>
where
    F: Fn(Arc<Inner>, Area) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if projects.is_empty() {
        warn!("no projects discovered; nothing to crawl in this step");
        inner.record_warning();
        return Ok(());
    }
    let semaphore = Arc::new(Semaphore::new(inner.config.gitlab.max_concurrency));
    let mut pool = JoinSet::new();
    for project in projects {
        if inner.is_cancelled() {
            break;
        }
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let future = work(Arc::clone(inner), project.clone());
        pool.spawn(async move {
            let _permit = permit;
            future.await;
        });
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            inner.report_recoverable(step, &format!("project worker failed: {e}"));
        }
    }
    Ok(())
}

/// Fetch one resource-type stream for a project under the configured
/// strategy. Errors are reported and the stream yields what it has.
async fn fetch_resource(inner: &Inner, step: &str, project: &Area, spec: &ResourceSpec) -> Vec<Value> {
    let encoded = encode_project_path(&project.full_path);
    match spec.protocol(inner.config.gitlab.strategy) {
        Some(Protocol::Graphql) => {
            let graphql = spec
                .graphql
                .as_ref()
                .expect("protocol() only selects GraphQL when a document exists");
            let mut variables = Map::new();
            variables.insert("fullPath".into(), json!(project.full_path));
            match inner
                .graphql_all(graphql.document, variables, graphql.path)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    inner.report_recoverable(
                        step,
                        &format!("{} for {}: {e}", spec.name, project.full_path),
                    );
                    Vec::new()
                }
            }
        }
        Some(Protocol::Rest) => {
            let Some(endpoint) = spec.rest_endpoint(&encoded) else {
                return Vec::new();
            };
            inner.rest_all(step, &endpoint).await
        }
        None => Vec::new(),
    }
}

async fn crawl_project_common(inner: &Inner, project: &Area) {
    info!("crawling resources for {}", project.full_path);
    for spec in COMMON_RESOURCES {
        if inner.is_cancelled() {
            return;
        }
        let records = fetch_resource(inner, STEP_RESOURCES, project, spec).await;
        let path = if spec.bucket_dirs.is_empty() {
            inner.writer.resource_path(Some(project), spec.name)
        } else {
            inner
                .writer
                .nested_path(Some(project), spec.bucket_dirs, &inner.writer.stem(spec.name))
        };
        if let Err(e) = inner.deliver(STEP_RESOURCES, spec.name, path, records).await {
            // A failing write aborts only this resource-type stream.
            inner.report_recoverable(
                STEP_RESOURCES,
                &format!("{} for {}: {e}", spec.name, project.full_path),
            );
        }
    }
}

async fn crawl_project_repository(inner: &Inner, project: &Area) {
    info!("crawling repository of {}", project.full_path);
    let encoded = encode_project_path(&project.full_path);

    let mut branches = Vec::new();
    for spec in REPOSITORY_RESOURCES {
        if inner.is_cancelled() {
            return;
        }
        let records = fetch_resource(inner, STEP_REPOSITORY, project, spec).await;
        if spec.name == "branches" {
            branches = records.clone();
        }
        let path = inner
            .writer
            .nested_path(Some(project), spec.bucket_dirs, &inner.writer.stem(spec.name));
        if let Err(e) = inner
            .deliver(STEP_REPOSITORY, spec.name, path, records)
            .await
        {
            inner.report_recoverable(
                STEP_REPOSITORY,
                &format!("{} for {}: {e}", spec.name, project.full_path),
            );
        }
    }

    let mut default_branch: Option<String> = None;
    for branch in &branches {
        if inner.is_cancelled() {
            return;
        }
        let Some(name) = branch.get("name").and_then(Value::as_str) else {
            continue;
        };
        if branch.get("default").and_then(Value::as_bool) == Some(true) {
            default_branch = Some(name.to_owned());
        }
        crawl_branch(inner, project, &encoded, name).await;
    }

    if let Some(branch) = default_branch {
        crawl_file_contents(inner, project, &encoded, &branch).await;
    }
    crawl_jobs(inner, project, &encoded).await;
}

/// Commits and tree for one branch, under
/// `repository/branches/<branch>/`.
async fn crawl_branch(inner: &Inner, project: &Area, encoded: &str, branch: &str) {
    let branch_query = query_encode(branch);
    let commits = inner
        .rest_all(
            STEP_REPOSITORY,
            &format!("/api/v4/projects/{encoded}/repository/commits?ref_name={branch_query}"),
        )
        .await;
    let path = inner.writer.nested_path(
        Some(project),
        &["repository", "branches", branch],
        &inner.writer.stem("commits"),
    );
    if let Err(e) = inner.deliver(STEP_REPOSITORY, "commits", path, commits).await {
        inner.report_recoverable(
            STEP_REPOSITORY,
            &format!("commits on {branch} of {}: {e}", project.full_path),
        );
    }

    let tree = inner
        .rest_all(
            STEP_REPOSITORY,
            &format!(
                "/api/v4/projects/{encoded}/repository/tree?ref={branch_query}&recursive=true"
            ),
        )
        .await;
    let path = inner.writer.nested_path(
        Some(project),
        &["repository", "branches", branch],
        &inner.writer.stem("tree"),
    );
    if let Err(e) = inner.deliver(STEP_REPOSITORY, "tree", path, tree).await {
        inner.report_recoverable(
            STEP_REPOSITORY,
            &format!("tree of {branch} of {}: {e}", project.full_path),
        );
    }
}

/// File contents from the default branch, one JSONL file per source file
/// under `repository/files/`.
async fn crawl_file_contents(inner: &Inner, project: &Area, encoded: &str, branch: &str) {
    let branch_query = query_encode(branch);
    let tree = inner
        .rest_all(
            STEP_REPOSITORY,
            &format!(
                "/api/v4/projects/{encoded}/repository/tree?ref={branch_query}&recursive=true"
            ),
        )
        .await;
    for entry in tree {
        if inner.is_cancelled() {
            return;
        }
        if entry.get("type").and_then(Value::as_str) != Some("blob") {
            continue;
        }
        let Some(file_path) = entry.get("path").and_then(Value::as_str) else {
            continue;
        };
        let endpoint = format!(
            "/api/v4/projects/{encoded}/repository/files/{}?ref={branch_query}",
            query_encode(file_path)
        );
        let record = match inner.rest.request_json(Method::GET, &endpoint, None).await {
            Ok(mut record) => {
                if let Some(object) = record.as_object_mut() {
                    object
                        .entry("id")
                        .or_insert_with(|| json!(format!("{}:{branch}:{file_path}", project.id)));
                }
                record
            }
            Err(e) => {
                debug!("file content {file_path} of {} skipped: {e}", project.full_path);
                continue;
            }
        };
        let stem = format!("{}_content", sanitize_component(file_path));
        let path = inner
            .writer
            .nested_path(Some(project), &["repository", "files"], &stem);
        if let Err(e) = inner
            .deliver(STEP_REPOSITORY, "file_content", path, vec![record])
            .await
        {
            inner.report_recoverable(
                STEP_REPOSITORY,
                &format!("content of {file_path} in {}: {e}", project.full_path),
            );
        }
    }
}

/// CI job artifacts descriptors and logs, under `jobs/`.
async fn crawl_jobs(inner: &Inner, project: &Area, encoded: &str) {
    let jobs = inner
        .rest_all(STEP_REPOSITORY, &format!("/api/v4/projects/{encoded}/jobs"))
        .await;
    for job in jobs {
        if inner.is_cancelled() {
            return;
        }
        let Some(job_id) = record_id(&job) else {
            continue;
        };

        let artifacts: Vec<Value> = job
            .get("artifacts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, artifact)| {
                let mut record = json!({
                    "id": format!("job-{job_id}-artifact-{index}"),
                    "jobId": job_id,
                });
                if let (Some(target), Some(source)) = (record.as_object_mut(), artifact.as_object())
                {
                    for (key, value) in source {
                        target.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                record
            })
            .collect();
        let path = inner
            .writer
            .nested_path(Some(project), &["jobs"], &format!("{job_id}_artifacts"));
        if let Err(e) = inner
            .deliver(STEP_REPOSITORY, "jobArtifacts", path, artifacts)
            .await
        {
            inner.report_recoverable(
                STEP_REPOSITORY,
                &format!("artifacts of job {job_id} in {}: {e}", project.full_path),
            );
        }

        let trace_endpoint = format!("/api/v4/projects/{encoded}/jobs/{job_id}/trace");
        match inner.rest.request(Method::GET, &trace_endpoint, None).await {
            Ok(bytes) => {
                let record = json!({
                    "id": format!("job-{job_id}-log"),
                    "jobId": job_id,
                    "log": String::from_utf8_lossy(&bytes),
                });
                let path = inner
                    .writer
                    .nested_path(Some(project), &["jobs"], &format!("{job_id}_logs"));
                if let Err(e) = inner
                    .deliver(STEP_REPOSITORY, "jobLogs", path, vec![record])
                    .await
                {
                    inner.report_recoverable(
                        STEP_REPOSITORY,
                        &format!("log of job {job_id} in {}: {e}", project.full_path),
                    );
                }
            }
            Err(e) => {
                // Jobs without a trace are routine.
                debug!("trace of job {job_id} in {} skipped: {e}", project.full_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{area_from_record, full_path_of, query_encode};
    use crate::models::AreaKind;
    use serde_json::json;

    #[test]
    fn full_path_reads_both_wire_shapes() {
        assert_eq!(full_path_of(&json!({"fullPath": "a/b"})), Some("a/b"));
        assert_eq!(full_path_of(&json!({"full_path": "a/b"})), Some("a/b"));
        assert_eq!(
            full_path_of(&json!({"path_with_namespace": "a/b"})),
            Some("a/b")
        );
        assert_eq!(full_path_of(&json!({"name": "b"})), None);
    }

    #[test]
    fn area_falls_back_to_full_path_as_id() {
        let area = area_from_record(AreaKind::Project, &json!({"fullPath": "g/p"}))
            .expect("area");
        assert_eq!(area.id, "g/p");
        let area = area_from_record(AreaKind::Project, &json!({"fullPath": "g/p", "id": 9}))
            .expect("area");
        assert_eq!(area.id, "9");
    }

    #[test]
    fn query_encoding_escapes_separators() {
        assert_eq!(query_encode("feature/login"), "feature%2Flogin");
        assert_eq!(query_encode("a b"), "a+b");
    }
}
