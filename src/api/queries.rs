//! GraphQL documents issued by the crawl steps.
//!
//! Every enumeration takes `$first` and an optional `$cursor` and exposes a
//! connection with `pageInfo { hasNextPage endCursor }` so the cursor loop in
//! [`super::paginate`] can drive it.

pub const GROUPS_QUERY: &str = r"query($first: Int!, $cursor: String) { groups(first: $first, after: $cursor, topLevelOnly: true) { nodes { id name fullPath description visibility createdAt } pageInfo { hasNextPage endCursor } } }";

pub const SUBGROUPS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { group(fullPath: $fullPath) { subgroups(first: $first, after: $cursor) { nodes { id name fullPath description visibility createdAt } pageInfo { hasNextPage endCursor } } } }";

pub const GROUP_PROJECTS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { group(fullPath: $fullPath) { projects(first: $first, after: $cursor) { nodes { id name fullPath description visibility archived createdAt lastActivityAt } pageInfo { hasNextPage endCursor } } } }";

pub const USERS_QUERY: &str = r"query($first: Int!, $cursor: String) { users(first: $first, after: $cursor) { nodes { id username name publicEmail state createdAt } pageInfo { hasNextPage endCursor } } }";

pub const PROJECT_LABELS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { labels(first: $first, after: $cursor) { nodes { id title description color createdAt updatedAt } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_ISSUES_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { issues(first: $first, after: $cursor) { nodes { id iid title description state confidential createdAt updatedAt closedAt labels(first: 20) { nodes { title } } author { id username } } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_BOARDS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { boards(first: $first, after: $cursor) { nodes { id name hideBacklogList hideClosedList } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_SNIPPETS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { snippets(first: $first, after: $cursor) { nodes { id title description visibilityLevel createdAt updatedAt } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_PIPELINES_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { pipelines(first: $first, after: $cursor) { nodes { id iid status ref sha duration createdAt finishedAt } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_RELEASES_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { releases(first: $first, after: $cursor) { nodes { id name tagName description createdAt releasedAt } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_MILESTONES_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { milestones(first: $first, after: $cursor) { nodes { id iid title description state dueDate createdAt updatedAt } pageInfo { hasNextPage endCursor } } } }";

pub const PROJECT_MERGE_REQUESTS_QUERY: &str = r"query($fullPath: ID!, $first: Int!, $cursor: String) { project(fullPath: $fullPath) { mergeRequests(first: $first, after: $cursor) { nodes { id iid title description state sourceBranch targetBranch createdAt updatedAt mergedAt author { id username } } pageInfo { hasNextPage endCursor } } } }";
