//! `wait --for`: condition parsing and the watch-driven wait.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::StreamExt;
use serde_json::Value;

use neutree_meta::MetaStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// Dotted path whose value must equal `value`, ignoring case.
    JsonPath { path: String, value: String },
    /// A `status.conditions[]` entry of this type with the given status.
    Condition { kind: String, status: String },
    /// The resource must be gone.
    Delete,
}

impl FromStr for WaitCondition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s == "delete" {
            return Ok(WaitCondition::Delete);
        }
        if let Some(rest) = s.strip_prefix("jsonpath=") {
            let Some((path, value)) = rest.rsplit_once('=') else {
                bail!("jsonpath condition needs a value: {s}");
            };
            let path = path
                .trim_start_matches('{')
                .trim_end_matches('}')
                .trim_start_matches('.');
            if path.is_empty() {
                bail!("jsonpath condition needs a path: {s}");
            }
            return Ok(WaitCondition::JsonPath {
                path: path.to_string(),
                value: value.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("condition=") {
            let (kind, status) = rest.split_once('=').unwrap_or((rest, "True"));
            if kind.is_empty() {
                bail!("condition needs a type: {s}");
            }
            return Ok(WaitCondition::Condition {
                kind: kind.to_string(),
                status: status.to_string(),
            });
        }
        bail!("unknown wait condition {s:?}, expected jsonpath=, condition= or delete")
    }
}

/// Follows a dotted path; numeric segments index arrays.
fn lookup<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(obj, |cur, seg| match cur {
        Value::Array(items) => items.get(seg.parse::<usize>().ok()?),
        _ => cur.get(seg),
    })
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl WaitCondition {
    pub fn matches(&self, obj: &Value) -> bool {
        match self {
            WaitCondition::JsonPath { path, value } => {
                lookup(obj, path).is_some_and(|v| as_text(v).eq_ignore_ascii_case(value))
            }
            WaitCondition::Condition { kind, status } => obj
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .is_some_and(|conds| {
                    conds.iter().any(|c| {
                        c.get("type").map(as_text).is_some_and(|t| t.eq_ignore_ascii_case(kind))
                            && c.get("status").map(as_text).is_some_and(|s| s.eq_ignore_ascii_case(status))
                    })
                }),
            WaitCondition::Delete => false,
        }
    }

    /// Whether an absent resource satisfies the condition.
    pub fn match_not_found(&self) -> bool {
        matches!(self, WaitCondition::Delete)
    }

    fn satisfied_by(&self, raw: Option<&[u8]>) -> anyhow::Result<bool> {
        match raw {
            None => Ok(self.match_not_found()),
            Some(bytes) => {
                let obj: Value = serde_json::from_slice(bytes).context("decode resource")?;
                Ok(self.matches(&obj))
            }
        }
    }
}

async fn watch_until<S: MetaStore>(store: &S, key: &str, cond: &WaitCondition) -> anyhow::Result<()> {
    let current = store.get(key).await?;
    if cond.satisfied_by(current.as_ref().map(|v| v.value.as_slice()))? {
        return Ok(());
    }
    let after = current.map(|v| v.revision);
    let mut events = store.watch(key, after).await?;
    while let Some(ev) = events.next().await {
        if ev.key != key {
            continue;
        }
        if cond.satisfied_by(ev.value.as_deref())? {
            return Ok(());
        }
    }
    bail!("watch on {key} ended")
}

/// Waits until the record at `key` satisfies `cond`, driven by the store's
/// watch rather than polling.
pub async fn wait_for<S: MetaStore>(
    store: &S,
    key: &str,
    cond: &WaitCondition,
    timeout: Duration,
) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, watch_until(store, key, cond))
        .await
        .with_context(|| format!("timed out after {timeout:?} waiting for {key}"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutree_meta::MemoryMetaStore;
    use serde_json::json;

    #[test]
    fn test_parse_jsonpath() {
        let cond: WaitCondition = "jsonpath=.status.phase=Running".parse().unwrap();
        assert_eq!(
            cond,
            WaitCondition::JsonPath {
                path: "status.phase".into(),
                value: "Running".into()
            }
        );
        assert!(cond.matches(&json!({"status": {"phase": "Running"}})));
        assert!(cond.matches(&json!({"status": {"phase": "running"}})));
        assert!(!cond.matches(&json!({"status": {"phase": "Pending"}})));
        assert!(!cond.match_not_found());

        let braces: WaitCondition = "jsonpath={.status.phase}=Running".parse().unwrap();
        assert_eq!(braces, cond);
    }

    #[test]
    fn test_parse_delete_and_condition() {
        let del: WaitCondition = "delete".parse().unwrap();
        assert!(del.match_not_found());
        assert!(!del.matches(&json!({})));

        let ready: WaitCondition = "condition=Ready".parse().unwrap();
        let obj = json!({"status": {"conditions": [
            {"type": "Progressing", "status": "True"},
            {"type": "Ready", "status": "True"}
        ]}});
        assert!(ready.matches(&obj));
        let not_ready: WaitCondition = "condition=Ready=False".parse().unwrap();
        assert!(!not_ready.matches(&obj));

        assert!("jsonpath=.status.phase".parse::<WaitCondition>().is_err());
        assert!("phase=Running".parse::<WaitCondition>().is_err());
    }

    #[test]
    fn test_lookup_indexes_arrays() {
        let obj = json!({"spec": {"versions": [{"version": "v1"}, {"version": "v2"}]}});
        let cond: WaitCondition = "jsonpath=.spec.versions.1.version=V2".parse().unwrap();
        assert!(cond.matches(&obj));
        assert!(lookup(&obj, "spec.versions.9.version").is_none());
    }

    #[tokio::test]
    async fn test_wait_for_update_and_delete() {
        let store = MemoryMetaStore::new();
        let key = "/clusters/ws/prod";
        store
            .create(key, serde_json::to_vec(&json!({"status": {"phase": "Pending"}})).unwrap())
            .await
            .unwrap();

        let cond: WaitCondition = "jsonpath=.status.phase=Running".parse().unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let rev = writer.get(key).await.unwrap().unwrap().revision;
            let body = serde_json::to_vec(&json!({"status": {"phase": "Running"}})).unwrap();
            writer.update(key, body, rev).await.unwrap();
        });
        wait_for(&store, key, &cond, Duration::from_secs(5)).await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.delete(key).await.unwrap();
        });
        wait_for(&store, key, &WaitCondition::Delete, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let store = MemoryMetaStore::new();
        let cond: WaitCondition = "jsonpath=.status.phase=Running".parse().unwrap();
        let err = wait_for(&store, "/clusters/ws/none", &cond, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
