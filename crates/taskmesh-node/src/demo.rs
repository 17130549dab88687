//! Demo tasks registered on every worker node.
//!
//! `pipeline` groups `fetch -> transform -> summarize`; `checksum` is a
//! class-style task instantiated per run; `sleep` reads a runtime property.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use taskmesh_core::CoreError;
use taskmesh_runtime::{BoxError, NodeContext, PropertyDef, TaskContext, TaskDef, TaskExecutable};

struct Checksum;

#[async_trait]
impl TaskExecutable for Checksum {
    async fn exec(&self, ctx: TaskContext) -> Result<Value, BoxError> {
        let text = ctx
            .get("text")
            .and_then(Value::as_str)
            .ok_or("text must be a string")?;
        let sum = text
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        Ok(json!({ "checksum": format!("{sum:08x}") }))
    }
}

fn as_count(value: Value) -> Result<Value, String> {
    match &value {
        Value::Number(n) if n.as_u64().is_some() => Ok(value),
        Value::String(s) => s
            .parse::<u64>()
            .map(Value::from)
            .map_err(|e| format!("not a count: {e}")),
        other => Err(format!("not a count: {other}")),
    }
}

pub async fn register(ctx: &NodeContext) -> Result<(), CoreError> {
    ctx.register(
        TaskDef::new("fetch")
            .describe("Produce a list of numbers")
            .incoming(
                PropertyDef::optional("count")
                    .with_default(json!(10))
                    .with_convert(as_count),
            )
            .outgoing(PropertyDef::required("rows"))
            .group_in("pipeline")
            .exec(|ctx| async move {
                let count = ctx.get("count").and_then(Value::as_u64).unwrap_or(10);
                ctx.total(count);
                let mut rows = Vec::new();
                for i in 1..=count {
                    rows.push(i);
                    ctx.progress(i);
                }
                ctx.log(format!("fetched {count} rows"));
                Ok(json!({ "rows": rows }))
            }),
    )
    .await?;

    ctx.register(
        TaskDef::new("transform")
            .describe("Square every row")
            .depends_on("fetch")
            .incoming(PropertyDef::required("rows"))
            .outgoing(PropertyDef::required("squares"))
            .group_in("pipeline")
            .exec(|ctx| async move {
                let squares: Vec<u64> = ctx
                    .get("rows")
                    .and_then(Value::as_array)
                    .map(|rows| rows.iter().filter_map(Value::as_u64).map(|n| n * n).collect())
                    .unwrap_or_default();
                ctx.count("squared", squares.len() as i64);
                Ok(json!({ "squares": squares }))
            }),
    )
    .await?;

    ctx.register(
        TaskDef::new("summarize")
            .describe("Sum the squares")
            .depends_on("transform")
            .incoming(PropertyDef::required("squares"))
            .outgoing(PropertyDef::required("total"))
            .group_in("pipeline")
            .exec_callback(|ctx, done| {
                let total: u64 = ctx
                    .get("squares")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(Value::as_u64).sum())
                    .unwrap_or(0);
                done.ok(json!({ "total": total }));
            }),
    )
    .await?;

    ctx.register(
        TaskDef::new("checksum")
            .describe("Checksum a text")
            .incoming(PropertyDef::required("text"))
            .outgoing(PropertyDef::required("checksum"))
            .class(|| Checksum),
    )
    .await?;

    ctx.register(
        TaskDef::new("sleep")
            .describe("Wait for a while")
            .runtime(PropertyDef::optional("ms").with_default(json!(100)))
            .exec(|ctx| async move {
                let ms = ctx.runtime().get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }),
    )
    .await?;

    Ok(())
}
