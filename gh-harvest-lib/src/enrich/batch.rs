//! Builders for batched GraphQL queries.
//!
//! Each batch member becomes one aliased sub-selection; blob and history
//! queries additionally group members by repository (and by ref) so a
//! repository is looked up once per batch. The alias layout is returned
//! alongside the query text so responses can be fanned back out to the
//! originating items.

use crate::store::FileRecord;
use serde_json::Value;

/// Escape a string for a GraphQL double-quoted literal.
#[must_use]
pub fn escape_graphql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn repo_alias(index: usize) -> String {
    format!("r{index}")
}

/// Group item indices by a key, preserving first-seen order.
fn group_by<'a, K: PartialEq>(
    items: &'a [FileRecord],
    key: impl Fn(&'a FileRecord) -> K,
) -> Vec<(K, Vec<usize>)> {
    let mut groups: Vec<(K, Vec<usize>)> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let k = key(item);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, list)) => list.push(i),
            None => groups.push((k, vec![i])),
        }
    }
    groups
}

/// A blob-content batch query plus, per input item, the (repository
/// alias, file alias) pair its result lives under.
#[derive(Debug)]
pub struct BlobQuery {
    pub query: String,
    pub aliases: Vec<(String, String)>,
}

/// Build a batched blob query: one `repository` alias per distinct
/// (owner, repo), one `object(expression: "ref:path")` alias per item.
#[must_use]
pub fn build_blob_query(items: &[FileRecord]) -> BlobQuery {
    let groups = group_by(items, |f| (&f.owner, &f.repo));
    let mut aliases = vec![(String::new(), String::new()); items.len()];
    let mut parts = Vec::with_capacity(groups.len());

    for (gi, ((owner, repo), members)) in groups.iter().enumerate() {
        let ralias = repo_alias(gi);
        let mut file_parts = Vec::with_capacity(members.len());
        for &i in members {
            let falias = format!("f{i}");
            let expression = escape_graphql(&format!("{}:{}", items[i].git_ref, items[i].path));
            file_parts.push(format!(
                "    {falias}: object(expression: \"{expression}\") {{\n      ... on Blob {{ text byteSize isTruncated }}\n    }}"
            ));
            aliases[i] = (ralias.clone(), falias);
        }
        parts.push(format!(
            "  {ralias}: repository(owner: \"{}\", name: \"{}\") {{\n{}\n  }}",
            escape_graphql(owner),
            escape_graphql(repo),
            file_parts.join("\n")
        ));
    }

    BlobQuery {
        query: format!("query {{\n{}\n}}", parts.join("\n")),
        aliases,
    }
}

/// Build a batched repository-metadata query, one alias per repo key.
#[must_use]
pub fn build_metadata_query(repo_keys: &[(String, String)]) -> String {
    let mut parts = Vec::with_capacity(repo_keys.len());
    const METADATA_FIELDS: &str = "    stargazerCount\n    forkCount\n    watchers { totalCount }\n    primaryLanguage { name }\n    repositoryTopics(first: 20) { nodes { topic { name } } }\n    createdAt\n    updatedAt\n    pushedAt\n    defaultBranchRef { name }\n    licenseInfo { spdxId }\n    description";
    for (i, (owner, repo)) in repo_keys.iter().enumerate() {
        parts.push(format!(
            "  {}: repository(owner: \"{}\", name: \"{}\") {{\n{METADATA_FIELDS}\n  }}",
            repo_alias(i),
            escape_graphql(owner),
            escape_graphql(repo)
        ));
    }
    format!("query {{\n{}\n}}", parts.join("\n"))
}

/// A history batch query plus, per input item, the (repository alias,
/// ref alias, file alias) triple its commit list lives under.
#[derive(Debug)]
pub struct HistoryQuery {
    pub query: String,
    pub aliases: Vec<(String, String, String)>,
}

/// Build a batched history query: grouped by repository, then by ref,
/// with a per-file `history(first: 100, path:)` selection. History costs
/// far more query complexity per item than blobs do, which is why the
/// default batch size is smaller for this pass.
#[must_use]
pub fn build_history_query(items: &[FileRecord]) -> HistoryQuery {
    let repo_groups = group_by(items, |f| (&f.owner, &f.repo));
    let mut aliases = vec![(String::new(), String::new(), String::new()); items.len()];
    let mut parts = Vec::with_capacity(repo_groups.len());

    for (gi, ((owner, repo), members)) in repo_groups.iter().enumerate() {
        let ralias = repo_alias(gi);

        let mut ref_groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for &i in members {
            let r = items[i].git_ref.as_str();
            match ref_groups.iter_mut().find(|(existing, _)| *existing == r) {
                Some((_, list)) => list.push(i),
                None => ref_groups.push((r, vec![i])),
            }
        }

        let mut ref_parts = Vec::with_capacity(ref_groups.len());
        for (ri, (ref_name, files)) in ref_groups.iter().enumerate() {
            let ref_alias = format!("ref{ri}");
            let mut file_parts = Vec::with_capacity(files.len());
            for (fi, &i) in files.iter().enumerate() {
                let falias = format!("f{fi}");
                file_parts.push(format!(
                    "        {falias}: history(first: 100, path: \"{}\") {{\n          nodes {{ oid messageHeadline committedDate author {{ name }} }}\n        }}",
                    escape_graphql(&items[i].path)
                ));
                aliases[i] = (ralias.clone(), ref_alias.clone(), falias);
            }
            ref_parts.push(format!(
                "    {ref_alias}: object(expression: \"{}\") {{\n      ... on Commit {{\n{}\n      }}\n    }}",
                escape_graphql(ref_name),
                file_parts.join("\n")
            ));
        }

        parts.push(format!(
            "  {ralias}: repository(owner: \"{}\", name: \"{}\") {{\n{}\n  }}",
            escape_graphql(owner),
            escape_graphql(repo),
            ref_parts.join("\n")
        ));
    }

    HistoryQuery {
        query: format!("query {{\n{}\n}}", parts.join("\n")),
        aliases,
    }
}

/// Whether a response was rejected for query complexity and should be
/// retried with a smaller batch.
#[must_use]
pub fn is_complexity_error(body: &Value) -> bool {
    if !body.get("data").unwrap_or(&Value::Null).is_null() {
        return false;
    }
    body.get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors.iter().any(|e| {
                e.get("type").and_then(Value::as_str) == Some("MAX_NODE_LIMIT_EXCEEDED")
                    || e.get("message")
                        .and_then(Value::as_str)
                        .is_some_and(|m| m.to_ascii_lowercase().contains("complexity"))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(owner: &str, repo: &str, git_ref: &str, path: &str) -> FileRecord {
        FileRecord {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: git_ref.to_string(),
            path: path.to_string(),
            sha: "s".to_string(),
            size: None,
            url: format!("https://github.com/{owner}/{repo}/blob/{git_ref}/{path}"),
        }
    }

    #[test]
    fn blob_query_groups_by_repo() {
        let items = vec![
            file("a", "b", "main", "x.md"),
            file("c", "d", "main", "y.md"),
            file("a", "b", "main", "z.md"),
        ];
        let bq = build_blob_query(&items);

        // Two repository aliases, three file aliases.
        assert_eq!(bq.query.matches("repository(").count(), 2);
        assert_eq!(bq.query.matches("object(expression:").count(), 3);

        // Items 0 and 2 share a repo alias; file aliases are global.
        assert_eq!(bq.aliases[0], ("r0".to_string(), "f0".to_string()));
        assert_eq!(bq.aliases[1], ("r1".to_string(), "f1".to_string()));
        assert_eq!(bq.aliases[2], ("r0".to_string(), "f2".to_string()));
    }

    #[test]
    fn blob_query_escapes_quotes() {
        let items = vec![file("a", "b", "main", "we\"ird.md")];
        let bq = build_blob_query(&items);
        assert!(bq.query.contains("main:we\\\"ird.md"));
    }

    #[test]
    fn metadata_query_aliases_each_repo() {
        let keys = vec![
            ("a".to_string(), "b".to_string()),
            ("c".to_string(), "d".to_string()),
        ];
        let q = build_metadata_query(&keys);
        assert!(q.contains("r0: repository(owner: \"a\", name: \"b\")"));
        assert!(q.contains("r1: repository(owner: \"c\", name: \"d\")"));
        assert!(q.contains("stargazerCount"));
        assert!(q.contains("licenseInfo { spdxId }"));
    }

    #[test]
    fn history_query_groups_by_repo_then_ref() {
        let items = vec![
            file("a", "b", "main", "x.md"),
            file("a", "b", "dev", "y.md"),
            file("a", "b", "main", "z.md"),
            file("c", "d", "main", "w.md"),
        ];
        let hq = build_history_query(&items);

        assert_eq!(hq.query.matches("repository(").count(), 2);
        // Repo a/b has refs main and dev; c/d has main.
        assert_eq!(hq.query.matches("object(expression:").count(), 3);
        assert_eq!(hq.query.matches("history(first: 100").count(), 4);

        assert_eq!(hq.aliases[0], ("r0".into(), "ref0".into(), "f0".into()));
        assert_eq!(hq.aliases[1], ("r0".into(), "ref1".into(), "f0".into()));
        assert_eq!(hq.aliases[2], ("r0".into(), "ref0".into(), "f1".into()));
        assert_eq!(hq.aliases[3], ("r1".into(), "ref0".into(), "f0".into()));
    }

    #[test]
    fn escape_handles_backslashes_first() {
        assert_eq!(escape_graphql(r#"a\"b"#), r#"a\\\"b"#);
        assert_eq!(escape_graphql("plain"), "plain");
    }

    #[test]
    fn complexity_detection() {
        assert!(is_complexity_error(&json!({
            "data": null,
            "errors": [{"message": "Query has complexity of 51000, which exceeds max complexity of 50000"}]
        })));
        assert!(is_complexity_error(&json!({
            "errors": [{"type": "MAX_NODE_LIMIT_EXCEEDED", "message": "..."}]
        })));
        assert!(!is_complexity_error(&json!({
            "data": {"r0": null},
            "errors": [{"type": "NOT_FOUND"}]
        })));
        assert!(!is_complexity_error(&json!({"data": {"r0": {}}})));
    }
}
