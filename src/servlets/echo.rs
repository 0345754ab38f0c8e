use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json as json;

use crate::context::RequestContext;
use crate::servlet::{Servlet, ServletError};

/// Replies with a JSON description of the request.
#[derive(Default)]
pub struct Echo;

#[async_trait]
impl Servlet for Echo {
    async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
        let headers: json::Map<String, json::Value> = ctx
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), json::Value::from(value)))
            .collect();
        // JSON strings are text, so non-UTF-8 bytes show up as U+FFFD here.
        let parameters: BTreeMap<String, Vec<String>> = ctx
            .parameters()
            .await
            .iter()
            .map(|(name, values)| {
                let values = values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect();
                (String::from_utf8_lossy(name).into_owned(), values)
            })
            .collect();
        let reply = json::json!({
            "request_id": ctx.request_id(),
            "method": ctx.method(),
            "path": ctx.path(),
            "query": ctx.query_string(),
            "headers": headers,
            "parameters": parameters,
        });
        let text = json::to_string_pretty(&reply).map_err(|e| ServletError::Other(Box::new(e)))?;
        ctx.set_header("Content-Type", "application/json");
        ctx.write_str(&text).await?;
        ctx.write(b"\n").await?;
        Ok(200)
    }
}
