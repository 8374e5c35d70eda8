//! Job handler registry.
//!
//! Handlers are registered once at build time under a pattern:
//!
//! - `email.send`: exact handler type
//! - `email.*`: every type in the `email` category (longest prefix wins)
//! - `*`: fallback for everything else

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::context::CommandContext;

use super::types::JobInvocation;

/// Runs inside the job's command context. An `Err` fails the attempt; its
/// `Display` becomes the job's exception message and its `Debug` rendering
/// the stored stacktrace.
pub type JobHandler = Arc<dyn Fn(&CommandContext, &JobInvocation) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("JobHandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `pattern`, replacing any previous one.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&CommandContext, &JobInvocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn resolve(&self, handler_type: &str) -> Option<&JobHandler> {
        if let Some(handler) = self.handlers.get(handler_type) {
            return Some(handler);
        }

        let mut prefix = handler_type;
        while let Some((head, _)) = prefix.rsplit_once('.') {
            if let Some(handler) = self.handlers.get(&format!("{head}.*")) {
                return Some(handler);
            }
            prefix = head;
        }

        self.handlers.get("*")
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
