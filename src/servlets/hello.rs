use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::properties::Properties;
use crate::servlet::{Servlet, ServletError};

/// Writes a fixed greeting.
pub struct Hello {
    greeting: String,
    invocations: AtomicU64,
}

impl Hello {
    pub fn new() -> Hello {
        Hello {
            greeting: "Hello".to_string(),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Default for Hello {
    fn default() -> Self {
        Hello::new()
    }
}

#[async_trait]
impl Servlet for Hello {
    async fn init(&mut self, config: &Properties) -> Result<(), ServletError> {
        if let Some(greeting) = config.get("greeting") {
            self.greeting = greeting.to_string();
        }
        Ok(())
    }

    async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        ctx.write_str(&self.greeting).await?;
        Ok(200)
    }

    fn describe(&self) -> String {
        format!("{} requests", self.invocations())
    }
}
