//! Per-run registries.

use crate::transform::TransformRegistry;
use crate::validate::RuleRegistry;

/// Transform and rule registries for one compilation run.
///
/// Built once and passed down explicitly; nothing here is process-global,
/// so concurrent runs can register different extensions.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub transforms: TransformRegistry,
    pub rules: RuleRegistry,
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CompileContext {
    /// Registries populated with every built-in transform and rule.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self {
            transforms: TransformRegistry::with_builtins(),
            rules: RuleRegistry::with_builtins(),
        }
    }
}
