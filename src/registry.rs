use std::collections::HashMap;
use std::sync::Arc;

use crate::servlet::Servlet;

/// Maps the first path segment to the servlet serving it.
///
/// Filled once before the accept loop starts and only read while the
/// service runs, so lookups need no locking.
#[derive(Default)]
pub struct ServletRegistry {
    servlets: HashMap<String, Arc<dyn Servlet>>,
}

impl ServletRegistry {
    pub fn new() -> ServletRegistry {
        ServletRegistry::default()
    }

    /// Returns false and leaves the existing entry alone when the prefix
    /// is taken.
    pub fn register(&mut self, prefix: impl Into<String>, servlet: Arc<dyn Servlet>) -> bool {
        match self.servlets.entry(prefix.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(servlet);
                true
            }
        }
    }

    pub fn find(&self, prefix: &str) -> Option<Arc<dyn Servlet>> {
        self.servlets.get(prefix).cloned()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.servlets.contains_key(prefix)
    }

    pub fn remove(&mut self, prefix: &str) -> Option<Arc<dyn Servlet>> {
        self.servlets.remove(prefix)
    }

    /// Remove every entry, sorted by prefix.
    pub fn drain(&mut self) -> Vec<(String, Arc<dyn Servlet>)> {
        let mut entries: Vec<_> = self.servlets.drain().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Every entry, sorted by prefix.
    pub fn entries(&self) -> Vec<(String, Arc<dyn Servlet>)> {
        let mut entries: Vec<_> = self
            .servlets
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.servlets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servlets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::servlet::ServletError;
    use async_trait::async_trait;

    struct Tagged(&'static str);

    #[async_trait]
    impl Servlet for Tagged {
        async fn do_request(&self, _ctx: &mut RequestContext) -> Result<u16, ServletError> {
            Ok(200)
        }

        fn describe(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn second_registration_is_rejected() {
        let mut registry = ServletRegistry::new();
        assert!(registry.register("a", Arc::new(Tagged("first"))));
        assert!(!registry.register("a", Arc::new(Tagged("second"))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("a").unwrap().describe(), "first");
    }

    #[test]
    fn find_remove_drain() {
        let mut registry = ServletRegistry::new();
        registry.register("b", Arc::new(Tagged("b")));
        registry.register("a", Arc::new(Tagged("a")));
        registry.register("c", Arc::new(Tagged("c")));
        assert!(registry.find("x").is_none());
        assert_eq!(registry.remove("c").unwrap().describe(), "c");
        assert!(registry.remove("c").is_none());
        let prefixes: Vec<_> = registry.drain().into_iter().map(|(p, _)| p).collect();
        assert_eq!(prefixes, vec!["a", "b"]);
        assert!(registry.is_empty());
    }
}
