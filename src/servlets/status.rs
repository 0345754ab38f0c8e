use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::properties::Properties;
use crate::servlet::{Servlet, ServletError};

/// Plain-text uptime and request count.
pub struct Status {
    started: Instant,
    requests: AtomicU64,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            started: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Servlet for Status {
    async fn init(&mut self, _config: &Properties) -> Result<(), ServletError> {
        self.started = Instant::now();
        Ok(())
    }

    async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let uptime = self.started.elapsed().as_secs();
        ctx.write_str(&format!("uptime: {}s\nrequests: {}\n", uptime, requests))
            .await?;
        Ok(200)
    }

    fn describe(&self) -> String {
        format!("up {}s", self.started.elapsed().as_secs())
    }
}
