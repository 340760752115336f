//! End-to-end crawl sessions against a loopback forge.

mod utils;

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};

use glcrawl::commands;
use glcrawl::config::{Config, Strategy};
use glcrawl::output::ResumeState;
use utils::{MockHost, json_response, start_host};

fn test_config(dir: &Path, host: &str) -> Config {
    let mut config = Config::default();
    config.gitlab.host = host.into();
    config.gitlab.access_token = Some("tok".into());
    config.output.root_dir = dir.join("out");
    config.database.path = dir.join("accounts.json");
    config.progress.file = dir.join("progress.yaml");
    config.progress.interval = 50;
    config.resume.state_file = dir.join("resume.yaml");
    config
}

fn connection(field_path: &[&str], nodes: Value) -> Value {
    let mut inner = json!({
        "nodes": nodes,
        "pageInfo": {"hasNextPage": false, "endCursor": null},
    });
    for field in field_path.iter().rev() {
        let mut object = serde_json::Map::new();
        object.insert((*field).to_owned(), inner);
        inner = Value::Object(object);
    }
    json!({ "data": inner })
}

/// GraphQL host with one group, one project, and three users.
fn install_graphql_forge(host: &MockHost) {
    host.set_handler(|req| {
        if !req.is_path("/api/graphql") {
            return json_response(404, &json!({"message": "not found"}));
        }
        let body: Value = serde_json::from_str(&req.body).expect("graphql body");
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("topLevelOnly") {
            json_response(
                200,
                &connection(
                    &["groups"],
                    json!([{"id": "gid://forge/Group/1", "name": "Acme", "fullPath": "acme"}]),
                ),
            )
        } else if query.contains("subgroups(") {
            json_response(200, &connection(&["group", "subgroups"], json!([])))
        } else if query.contains("projects(") {
            json_response(
                200,
                &connection(
                    &["group", "projects"],
                    json!([{"id": "gid://forge/Project/2", "name": "app", "fullPath": "acme/app"}]),
                ),
            )
        } else if query.contains("users(") {
            json_response(
                200,
                &connection(
                    &["users"],
                    json!([{"id": 1, "username": "ada"},
                           {"id": 2, "username": "brin"},
                           {"id": 3, "username": "cleo"}]),
                ),
            )
        } else {
            json_response(200, &json!({"data": {}}))
        }
    });
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line"))
        .collect()
}

#[tokio::test]
async fn areas_and_users_produce_the_hierarchical_tree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = start_host().await.expect("host");
    install_graphql_forge(&host);

    let config = test_config(dir.path(), &host.base_url());
    let result = commands::crawl(config, &["areas".into(), "users".into()], None)
        .await
        .expect("crawl");
    assert!(result.success);
    assert_eq!(result.summary.errors, 0);

    let out = dir.path().join("out");
    let groups = read_lines(&out.join("acme").join("groups.jsonl"));
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["fullPath"], json!("acme"));

    let projects = read_lines(&out.join("acme").join("app").join("projects.jsonl"));
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["name"], json!("app"));

    let users = read_lines(&out.join("users.jsonl"));
    assert_eq!(users.len(), 3);
    assert_eq!(users[0]["username"], json!("ada"));

    // groups + subgroups + projects + users = four GraphQL exchanges.
    assert_eq!(host.hits("/api/graphql"), 4);

    // The progress file parses and the resume file shows both steps done.
    let progress: glcrawl::output::ProgressReport = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join("progress.yaml")).expect("progress file"),
    )
    .expect("progress parses");
    assert_eq!(progress.metadata.completed_steps, vec!["areas", "users"]);
    let resume: ResumeState = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join("resume.yaml")).expect("resume file"),
    )
    .expect("resume parses");
    assert_eq!(resume.completed_steps, vec!["areas", "users"]);

    host.shutdown().await;
}

#[tokio::test]
async fn a_second_run_skips_completed_steps_entirely() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = start_host().await.expect("host");
    install_graphql_forge(&host);

    let steps = vec!["areas".to_string(), "users".to_string()];
    let config = test_config(dir.path(), &host.base_url());
    commands::crawl(config.clone(), &steps, None)
        .await
        .expect("first run");
    let hits_after_first = host.hits("/api/graphql");

    let result = commands::crawl(config, &steps, None)
        .await
        .expect("second run");
    assert!(result.success);

    // No endpoint is re-fetched, and no file grows.
    assert_eq!(host.hits("/api/graphql"), hits_after_first);
    let users = read_lines(&dir.path().join("out").join("users.jsonl"));
    assert_eq!(users.len(), 3);

    host.shutdown().await;
}

#[tokio::test]
async fn sentinel_false_filters_exactly_the_flagged_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = start_host().await.expect("host");
    install_graphql_forge(&host);

    let mut config = test_config(dir.path(), &host.base_url());
    config.callbacks.enabled = true;
    let inline: glcrawl::callback::InlineCallback = Arc::new(|_, record| {
        if record.get("id") == Some(&json!(2)) {
            Ok(None)
        } else {
            Ok(Some(record.clone()))
        }
    });
    let result = commands::crawl(config, &["users".into()], Some(inline))
        .await
        .expect("crawl");
    assert!(result.success);

    let users = read_lines(&dir.path().join("out").join("users.jsonl"));
    assert_eq!(users.len(), 2);
    assert_eq!(users[0]["id"], json!(1));
    assert_eq!(users[1]["id"], json!(3));

    host.shutdown().await;
}

#[tokio::test]
async fn a_failing_resource_stream_does_not_stop_the_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = start_host().await.expect("host");
    host.set_handler(|req| {
        let page: u32 = req
            .query_param("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        if req.is_path("/api/v4/groups") {
            json_response(200, &json!([{"id": 1, "full_path": "acme"}]))
        } else if req.is_path("/api/v4/groups/1/subgroups") {
            json_response(200, &json!([]))
        } else if req.is_path("/api/v4/groups/1/projects") {
            json_response(200, &json!([{"id": 2, "path_with_namespace": "acme/app"}]))
        } else if req.is_path("/api/v4/projects/acme%2Fapp/labels") {
            json_response(200, &json!([{"id": 10, "name": "bug"}]))
        } else if req.is_path("/api/v4/projects/acme%2Fapp/issues") {
            if page == 1 {
                json_response(200, &json!([{"id": 100}, {"id": 101}]))
            } else {
                json_response(500, &json!({"message": "internal error"}))
            }
        } else {
            json_response(200, &json!([]))
        }
    });

    let mut config = test_config(dir.path(), &host.base_url());
    config.gitlab.strategy = Strategy::Rest;
    config.gitlab.per_page = 2;
    let result = commands::crawl(config, &["areas".into(), "resources".into()], None)
        .await
        .expect("crawl");

    // The 500 on issues page 2 is recorded, page 1 survives, and the rest
    // of the resource types still ran.
    assert!(!result.success);
    assert!(result.summary.errors >= 1);
    let project_dir = dir.path().join("out").join("acme").join("app");
    let issues = read_lines(&project_dir.join("issues.jsonl"));
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0]["id"], json!(100));
    let labels = read_lines(&project_dir.join("labels.jsonl"));
    assert_eq!(labels.len(), 1);
    // Empty streams never create files.
    assert!(!project_dir.join("merge_requests.jsonl").exists());
    // Milestones came after the failing issues stream and still ran.
    assert!(host.hits("/api/v4/projects/acme%2Fapp/milestones") > 0);

    host.shutdown().await;
}
