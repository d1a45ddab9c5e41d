use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::engine::ImportedObject;
use super::progress::ProgressEntry;

/// Stage of a run announced to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPhase {
    Run,
    ObjectType(String),
    Deletions(String),
    PostProcess(String),
    Files,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportPhase::Run => f.write_str("run"),
            ImportPhase::ObjectType(name) => write!(f, "object_type:{name}"),
            ImportPhase::Deletions(name) => write!(f, "deletions:{name}"),
            ImportPhase::PostProcess(name) => write!(f, "post_process:{name}"),
            ImportPhase::Files => f.write_str("files"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    #[default]
    Continue,
    Skip,
}

/// Observer of a running import. Every method has a no-op default.
pub trait ImportHook: Send + Sync {
    /// Returning [`HookDecision::Skip`] skips the phase.
    fn on_phase_start(&self, _phase: &ImportPhase) -> HookDecision {
        HookDecision::Continue
    }

    fn on_object_imported(&self, _object: &ImportedObject) {}

    fn on_phase_finish(&self, _phase: &ImportPhase) {}

    fn on_progress(&self, _entry: &ProgressEntry) {}
}

/// Host-owned cache dropped once a run ends, whatever its outcome.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, touched_types: &BTreeSet<String>);
}

#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn ImportHook>>,
    invalidators: Vec<Arc<dyn CacheInvalidator>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("hooks", &self.hooks.len())
            .field("invalidators", &self.invalidators.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn ImportHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidators.push(invalidator);
        self
    }

    /// Every hook sees the phase start; a single `Skip` wins.
    pub fn phase_start(&self, phase: &ImportPhase) -> HookDecision {
        let mut decision = HookDecision::Continue;
        for hook in &self.hooks {
            if hook.on_phase_start(phase) == HookDecision::Skip {
                decision = HookDecision::Skip;
            }
        }
        decision
    }

    pub fn phase_finish(&self, phase: &ImportPhase) {
        for hook in &self.hooks {
            hook.on_phase_finish(phase);
        }
    }

    pub fn object_imported(&self, object: &ImportedObject) {
        for hook in &self.hooks {
            hook.on_object_imported(object);
        }
    }

    pub fn progress(&self, entry: &ProgressEntry) {
        for hook in &self.hooks {
            hook.on_progress(entry);
        }
    }

    pub fn invalidate_caches(&self, touched_types: &BTreeSet<String>) {
        for invalidator in &self.invalidators {
            invalidator.invalidate(touched_types);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<String>>,
        skip: Option<ImportPhase>,
    }

    impl ImportHook for Recorder {
        fn on_phase_start(&self, phase: &ImportPhase) -> HookDecision {
            self.phases.lock().unwrap().push(phase.to_string());
            if self.skip.as_ref() == Some(phase) {
                HookDecision::Skip
            } else {
                HookDecision::Continue
            }
        }
    }

    #[test]
    fn any_skip_decision_wins() {
        let skipper = Arc::new(Recorder {
            skip: Some(ImportPhase::Files),
            ..Recorder::default()
        });
        let observer = Arc::new(Recorder::default());
        let hooks = Hooks::new()
            .with_hook(skipper.clone())
            .with_hook(observer.clone());

        assert_eq!(hooks.phase_start(&ImportPhase::Run), HookDecision::Continue);
        assert_eq!(hooks.phase_start(&ImportPhase::Files), HookDecision::Skip);
        assert_eq!(observer.phases.lock().unwrap().len(), 2);
    }
}
