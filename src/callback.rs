//! User transform pipeline.
//!
//! A transform is user code with unknown correctness, so the pipeline is
//! fail-open: a transform failure preserves the original record. The one
//! intentional signal is the sentinel `false`, which filters the record out.
//! Transforms come from an in-process closure registered at startup or from
//! a subprocess speaking newline-delimited JSON on stdio.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::CallbackConfig;
use crate::models::CallbackContext;

/// In-process transform. `Ok(None)` filters the record, `Ok(Some(v))`
/// replaces it (returning the input unchanged is "no change"), `Err`
/// counts as a transform failure and fails open.
pub type InlineCallback =
    Arc<dyn Fn(&CallbackContext, &Value) -> Result<Option<Value>, String> + Send + Sync>;

struct Subprocess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

enum Transform {
    Inline(InlineCallback),
    Subprocess(Mutex<Subprocess>),
}

/// Per-batch outcome counters reported for logging and progress.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total: usize,
    pub filtered: usize,
    pub errors: usize,
}

/// Applies the configured transform to each record with bounded
/// fault-tolerance.
pub struct CallbackPipeline {
    transform: Option<Transform>,
}

impl CallbackPipeline {
    pub fn disabled() -> Self {
        Self { transform: None }
    }

    pub fn with_inline(callback: InlineCallback) -> Self {
        Self {
            transform: Some(Transform::Inline(callback)),
        }
    }

    /// Build from configuration. An enabled pipeline with no usable
    /// transform self-disables with a warning rather than erroring.
    pub fn from_config(config: &CallbackConfig, inline: Option<InlineCallback>) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        if let Some(callback) = inline {
            return Self::with_inline(callback);
        }
        match &config.module_path {
            Some(path) => match Self::spawn_module(path) {
                Ok(subprocess) => Self {
                    transform: Some(Transform::Subprocess(Mutex::new(subprocess))),
                },
                Err(e) => {
                    warn!(
                        "callback module {} failed to start ({e}); transforms disabled",
                        path.display()
                    );
                    Self::disabled()
                }
            },
            None => {
                warn!("callbacks enabled but no transform supplied; transforms disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transform.is_some()
    }

    fn spawn_module(path: &Path) -> std::io::Result<Subprocess> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("callback child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("callback child has no stdout"))?;
        Ok(Subprocess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Apply the transform to one record.
    ///
    /// Returns the surviving record (possibly replaced) or `None` when the
    /// transform filtered it with the sentinel `false`. The flag reports
    /// whether the transform failed (and the record passed through
    /// unchanged).
    pub async fn process_object(
        &self,
        ctx: &CallbackContext,
        record: Value,
    ) -> (Option<Value>, bool) {
        match &self.transform {
            None => (Some(record), false),
            Some(Transform::Inline(callback)) => match callback(ctx, &record) {
                Ok(Some(replacement)) => (Some(replacement), false),
                Ok(None) => (None, false),
                Err(message) => {
                    error!("inline callback failed for {}: {message}", ctx.resource_type);
                    (Some(record), true)
                }
            },
            Some(Transform::Subprocess(subprocess)) => {
                let mut guard = subprocess.lock().await;
                match Self::exchange(&mut guard, ctx, &record).await {
                    Ok(verdict) => (apply_verdict(verdict, record), false),
                    Err(e) => {
                        error!("callback subprocess failed for {}: {e}", ctx.resource_type);
                        (Some(record), true)
                    }
                }
            }
        }
    }

    /// Apply the transform to a batch, preserving per-record order.
    pub async fn process_objects(
        &self,
        ctx: &CallbackContext,
        records: Vec<Value>,
    ) -> (Vec<Value>, BatchOutcome) {
        let mut outcome = BatchOutcome {
            total: records.len(),
            ..BatchOutcome::default()
        };
        let mut survivors = Vec::with_capacity(records.len());
        for record in records {
            let (kept, errored) = self.process_object(ctx, record).await;
            if errored {
                outcome.errors += 1;
            }
            match kept {
                Some(record) => survivors.push(record),
                None => outcome.filtered += 1,
            }
        }
        if outcome.filtered > 0 || outcome.errors > 0 {
            debug!(
                "callback batch for {}: {} in, {} filtered, {} errors",
                ctx.resource_type, outcome.total, outcome.filtered, outcome.errors
            );
        }
        (survivors, outcome)
    }

    async fn exchange(
        subprocess: &mut Subprocess,
        ctx: &CallbackContext,
        record: &Value,
    ) -> std::io::Result<Value> {
        let request = json!({ "context": ctx, "record": record });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        subprocess.stdin.write_all(line.as_bytes()).await?;
        subprocess.stdin.flush().await?;
        let response = subprocess
            .stdout
            .next_line()
            .await?
            .ok_or_else(|| std::io::Error::other("callback subprocess closed stdout"))?;
        Ok(serde_json::from_str(&response)?)
    }

    /// Terminate a subprocess transform, ignoring one that already exited.
    pub async fn shutdown(&self) {
        if let Some(Transform::Subprocess(subprocess)) = &self.transform {
            let mut guard = subprocess.lock().await;
            let _ = guard.stdin.shutdown().await;
            let _ = guard.child.kill().await;
        }
    }
}

/// Map a subprocess verdict onto the record.
///
/// The sentinel `false` filters. A falsy-but-not-`false` verdict (null,
/// `0`, `""`) means "no change". Anything else replaces the record.
fn apply_verdict(verdict: Value, original: Value) -> Option<Value> {
    match verdict {
        Value::Bool(false) => None,
        Value::Null => Some(original),
        Value::Number(n) if n.as_f64() == Some(0.0) => Some(original),
        Value::String(s) if s.is_empty() => Some(original),
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallbackContext {
        CallbackContext {
            host: "https://gitlab.example.com".into(),
            account_id: "alice".into(),
            resource_type: "issues".into(),
        }
    }

    #[tokio::test]
    async fn disabled_pipeline_passes_records_through() {
        let pipeline = CallbackPipeline::disabled();
        let (records, outcome) = pipeline
            .process_objects(&ctx(), vec![json!({"id": 1}), json!({"id": 2})])
            .await;
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(outcome.filtered, 0);
        assert_eq!(outcome.errors, 0);
    }

    #[tokio::test]
    async fn inline_filter_drops_only_the_flagged_record() {
        let pipeline = CallbackPipeline::with_inline(Arc::new(|_, record| {
            if record.get("id") == Some(&json!(2)) {
                Ok(None)
            } else {
                Ok(Some(record.clone()))
            }
        }));
        let input = vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})];
        let (records, outcome) = pipeline.process_objects(&ctx(), input).await;
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 3})]);
        assert_eq!(outcome.filtered, 1);
    }

    #[tokio::test]
    async fn failing_transform_fails_open() {
        let pipeline =
            CallbackPipeline::with_inline(Arc::new(|_, _| Err("transform exploded".into())));
        let input = vec![json!({"id": 1}), json!({"id": 2})];
        let (records, outcome) = pipeline.process_objects(&ctx(), input.clone()).await;
        assert_eq!(records, input);
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.filtered, 0);
    }

    #[tokio::test]
    async fn replacement_substitutes_the_record() {
        let pipeline = CallbackPipeline::with_inline(Arc::new(|_, record| {
            let mut replaced = record.clone();
            replaced["tagged"] = json!(true);
            Ok(Some(replaced))
        }));
        let (records, _) = pipeline.process_objects(&ctx(), vec![json!({"id": 1})]).await;
        assert_eq!(records, vec![json!({"id": 1, "tagged": true})]);
    }

    #[test]
    fn falsy_verdicts_other_than_false_leave_the_record() {
        let original = json!({"id": 7});
        assert_eq!(apply_verdict(json!(false), original.clone()), None);
        assert_eq!(
            apply_verdict(Value::Null, original.clone()),
            Some(original.clone())
        );
        assert_eq!(apply_verdict(json!(0), original.clone()), Some(original.clone()));
        assert_eq!(apply_verdict(json!(""), original.clone()), Some(original.clone()));
        assert_eq!(
            apply_verdict(json!({"id": 8}), original),
            Some(json!({"id": 8}))
        );
    }

    #[test]
    fn config_without_transform_self_disables() {
        let config = CallbackConfig {
            enabled: true,
            module_path: None,
        };
        let pipeline = CallbackPipeline::from_config(&config, None);
        assert!(!pipeline.is_enabled());
    }
}
