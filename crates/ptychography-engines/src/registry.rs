//! Name → engine lookup.

use std::sync::Arc;

use log::debug;

use crate::dm::DifferenceMapEngine;
use crate::engine::ReconstructionEngine;
use crate::epie::EpieEngine;

/// Registered engines, matched case-insensitively by name.
///
/// Later registrations shadow earlier ones with the same name.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn ReconstructionEngine>>,
}

impl EngineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the projection engines that need no external model.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EpieEngine));
        registry.register(Arc::new(DifferenceMapEngine));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn ReconstructionEngine>) {
        debug!("registering engine '{}'", engine.name());
        self.engines.insert(0, engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReconstructionEngine>> {
        self.engines
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Distinct registered names, most recent first.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for engine in &self.engines {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(engine.name())) {
                names.push(engine.name().to_string());
            }
        }
        names
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}
