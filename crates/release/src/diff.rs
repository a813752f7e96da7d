//! Structural diffs between the deployed release and the dry-run result.

use std::fmt;

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(String),
    Removed(String),
    Changed(String),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Added(p) => write!(f, "+ {p}"),
            Change::Removed(p) => write!(f, "- {p}"),
            Change::Changed(p) => write!(f, "~ {p}"),
        }
    }
}

/// Paths at which `desired` differs from `current`. Empty iff the two are
/// structurally equal.
pub fn changes(current: &Json, desired: &Json) -> Vec<Change> {
    fn walk(path: &mut String, a: &Json, b: &Json, out: &mut Vec<Change>) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    let len = path.len();
                    push_key(path, k);
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(path, av, bv, out),
                        None => out.push(Change::Removed(path.clone())),
                    }
                    path.truncate(len);
                }
                for k in bo.keys().filter(|k| !ao.contains_key(*k)) {
                    let len = path.len();
                    push_key(path, k);
                    out.push(Change::Added(path.clone()));
                    path.truncate(len);
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for i in 0..aa.len().max(bb.len()) {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    match (aa.get(i), bb.get(i)) {
                        (Some(av), Some(bv)) if av == bv => {}
                        (Some(av), Some(bv)) => walk(path, av, bv, out),
                        (Some(_), None) => out.push(Change::Removed(path.clone())),
                        (None, Some(_)) => out.push(Change::Added(path.clone())),
                        (None, None) => {}
                    }
                    path.truncate(len);
                }
            }
            // Scalars differ or type differs
            (av, bv) => {
                if av != bv {
                    out.push(Change::Changed(if path.is_empty() { ".".to_string() } else { path.clone() }));
                }
            }
        }
    }
    fn push_key(path: &mut String, k: &str) {
        path.push('.');
        path.push_str(k);
    }
    let mut out = Vec::new();
    walk(&mut String::new(), current, desired, &mut out);
    out
}

/// One change per line, for log output.
pub fn render(changes: &[Change]) -> String {
    changes.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reports_adds_updates_removes_by_path() {
        let current = json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3],
            "gone": true
        });
        let desired = json!({
            "a": 2,
            "b": { "x": 1, "y": 2 },
            "c": [1, 9],
        });
        let got = changes(&current, &desired);
        assert_eq!(
            got,
            vec![
                Change::Changed(".a".into()),
                Change::Added(".b.y".into()),
                Change::Changed(".c[1]".into()),
                Change::Removed(".c[2]".into()),
                Change::Removed(".gone".into()),
            ]
        );
        assert_eq!(render(&got[..2]), "~ .a\n+ .b.y");
    }

    #[test]
    fn equal_documents_have_no_changes() {
        let v = json!({ "image": { "tag": "1.0" }, "ports": [80, 443] });
        assert!(changes(&v, &v.clone()).is_empty());
    }

    #[test]
    fn type_changes_are_changes() {
        assert_eq!(changes(&json!({ "port": 80 }), &json!({ "port": "80" })), vec![Change::Changed(".port".into())]);
        assert_eq!(changes(&json!({ "x": {} }), &json!({ "x": [] })), vec![Change::Changed(".x".into())]);
    }
}
