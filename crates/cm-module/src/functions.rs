//! Functions served by the `compute-module` binary.

use cm_core::{BoxError, Context, EngineBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Event {
    pub x: i64,
    pub y: i64,
}

pub fn register(builder: EngineBuilder) -> EngineBuilder {
    builder
        .add("dub", dub)
        .add("hello", hello)
        .add("mult", mult)
        .add_raw("echo_bytes", echo_bytes)
}

pub async fn dub(_ctx: Context, input: i64) -> Result<i64, BoxError> {
    input
        .checked_mul(2)
        .ok_or_else(|| format!("{input} * 2 overflows").into())
}

pub async fn hello(_ctx: Context, name: String) -> Result<String, BoxError> {
    Ok(format!("hello {name}"))
}

pub async fn mult(ctx: Context, event: Event) -> Result<i64, BoxError> {
    tracing::debug!(job_id = ctx.job_id(), x = event.x, y = event.y, "mult");
    event
        .x
        .checked_mul(event.y)
        .ok_or_else(|| format!("{} * {} overflows", event.x, event.y).into())
}

/// Posts the input text back verbatim, without JSON quoting.
pub async fn echo_bytes(_ctx: Context, input: String) -> Result<Vec<u8>, BoxError> {
    Ok(input.into_bytes())
}
