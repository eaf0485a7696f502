//! Agent-protocol shim.
//!
//! Newline-delimited JSON over stdio: each request line is
//! `{"op": "...", "params": {...}}`, each response line is
//! `{"ok": true, "result": ...}` or `{"ok": false, "error": {kind, message}}`.
//! Logging goes to stderr so stdout stays protocol-clean.

use std::io::{BufRead, Write};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use exocortex_core::regression::{run_regression, RegressionOptions};
use exocortex_core::{
    CreateGoalInput, CreateMemoryInput, Error, MemorySource, SearchQuery, Store,
    UpdateMemoryInput,
};

#[derive(Debug, Deserialize)]
struct Request {
    op: String,
    #[serde(default)]
    params: serde_json::Value,
}

pub fn run(store: Arc<Store>) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    tracing::info!("agent protocol ready");

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match dispatch(&store, &request) {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(e) => json!({
                    "ok": false,
                    "error": { "kind": e.kind(), "message": e.to_string() }
                }),
            },
            Err(e) => json!({
                "ok": false,
                "error": { "kind": "invalid_input", "message": format!("bad request line: {}", e) }
            }),
        };

        writeln!(out, "{}", response)?;
        out.flush()?;
    }

    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(params.clone())
        .map_err(|e| Error::InvalidInput(format!("bad params: {}", e)))
}

fn dispatch(store: &Store, request: &Request) -> Result<serde_json::Value, Error> {
    match request.op.as_str() {
        "memory.create" => {
            let mut input: CreateMemoryInput = parse_params(&request.params)?;
            input.source = MemorySource::Mcp;
            let result = store.create_memory(input)?;
            Ok(serde_json::to_value(result)?)
        }
        "memory.get" => {
            let id = require_id(&request.params)?;
            let memory = store
                .get_by_id(&id)?
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            Ok(serde_json::to_value(memory)?)
        }
        "memory.update" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct UpdateParams {
                id: String,
                content: Option<String>,
                importance: Option<f64>,
                tags: Option<Vec<String>>,
                metadata: Option<serde_json::Value>,
            }
            let params: UpdateParams = parse_params(&request.params)?;
            let patch = UpdateMemoryInput {
                content: params.content,
                importance: params.importance,
                tags: params.tags,
                metadata: params.metadata,
            };
            let memory = store.update_memory(&params.id, patch)?;
            Ok(serde_json::to_value(memory)?)
        }
        "memory.delete" => {
            let id = require_id(&request.params)?;
            store.delete_memory(&id)?;
            Ok(json!({ "deleted": id }))
        }
        "memory.useful" => {
            let id = require_id(&request.params)?;
            store.mark_useful(&id)?;
            Ok(json!({ "marked": id }))
        }
        "search" => {
            let query: SearchQuery = parse_params(&request.params)?;
            let results = store.search(&query)?;
            Ok(serde_json::to_value(results)?)
        }
        "stats" => Ok(serde_json::to_value(store.stats()?)?),
        "goal.create" => {
            let input: CreateGoalInput = parse_params(&request.params)?;
            Ok(serde_json::to_value(store.create_goal(input)?)?)
        }
        "goal.list" => Ok(serde_json::to_value(store.list_goals(None)?)?),
        "goal.progress" => {
            #[derive(Deserialize)]
            struct ProgressParams {
                goal_id: String,
                content: String,
            }
            let params: ProgressParams = parse_params(&request.params)?;
            let memory = store.log_progress(&params.goal_id, &params.content)?;
            Ok(serde_json::to_value(memory)?)
        }
        "regression.run" => {
            let report = run_regression(store, &RegressionOptions::default())?;
            Ok(serde_json::to_value(report)?)
        }
        op => Err(Error::InvalidInput(format!("unknown op '{}'", op))),
    }
}

fn require_id(params: &serde_json::Value) -> Result<String, Error> {
    params
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::InvalidInput("missing id".to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_dispatch_create_and_get() {
        let store = test_store();
        let create = Request {
            op: "memory.create".to_string(),
            params: json!({ "content": "agent shim fixture", "tags": ["agent"] }),
        };
        let created = dispatch(&store, &create).unwrap();
        let id = created["memory"]["id"].as_str().unwrap().to_string();

        let get = Request {
            op: "memory.get".to_string(),
            params: json!({ "id": id }),
        };
        let fetched = dispatch(&store, &get).unwrap();
        assert_eq!(fetched["content"], "agent shim fixture");
        assert_eq!(fetched["source"], "mcp");
    }

    #[test]
    fn test_dispatch_unknown_op() {
        let store = test_store();
        let request = Request {
            op: "memory.explode".to_string(),
            params: json!({}),
        };
        let err = dispatch(&store, &request).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_dispatch_missing_id() {
        let store = test_store();
        let request = Request {
            op: "memory.get".to_string(),
            params: json!({}),
        };
        assert_eq!(dispatch(&store, &request).unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn test_dispatch_search() {
        let store = test_store();
        dispatch(
            &store,
            &Request {
                op: "memory.create".to_string(),
                params: json!({ "content": "searchable agent memory about kites" }),
            },
        )
        .unwrap();

        let results = dispatch(
            &store,
            &Request {
                op: "search".to_string(),
                params: json!({ "query": "kites" }),
            },
        )
        .unwrap();
        assert_eq!(results.as_array().unwrap().len(), 1);
    }
}
