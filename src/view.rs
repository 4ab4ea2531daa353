//! View registry and resolution
//!
//! A view is a registered named query. Runtime registrations hold their
//! compiled intent; views discovered in the schema keep their body SQL
//! and compile on first use. Resolution recurses through nested views up
//! to [`MAX_VIEW_DEPTH`], beyond which the query fails with
//! `ViewRecursion`. A view's ORDER BY and LIMIT bind inside its subtree;
//! outer predicates compose with the body via AND semantics, evaluated
//! over the view's output rows.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::intent::CompiledIntent;
use crate::schema::Catalog;

/// Maximum view nesting depth.
pub const MAX_VIEW_DEPTH: usize = 8;

/// Runtime-registered views, keyed case-insensitively.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: HashMap<String, CompiledIntent>,
}

impl ViewRegistry {
    pub fn new() -> ViewRegistry {
        ViewRegistry::default()
    }

    pub fn register(&mut self, name: &str, intent: CompiledIntent) {
        self.views.insert(name.to_ascii_lowercase(), intent);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.views.remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&CompiledIntent> {
        self.views.get(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.views.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Resolve `name` to a view body intent, checking the registry first and
/// the catalog second. `depth` is the current nesting level.
pub fn resolve_view(
    registry: &ViewRegistry,
    catalog: &Catalog,
    name: &str,
    depth: usize,
) -> Result<Option<CompiledIntent>> {
    let found = if let Some(intent) = registry.get(name) {
        Some(intent.clone())
    } else if let Some(def) = catalog.view(name) {
        Some(crate::parser::parse(&def.body_sql)?)
    } else {
        None
    };
    if found.is_some() && depth >= MAX_VIEW_DEPTH {
        return Err(Error::ViewRecursion(name.to_string()));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_case_insensitive_lookup() {
        let mut reg = ViewRegistry::new();
        reg.register("Adults", CompiledIntent::scan("users"));
        assert!(reg.get("adults").is_some());
        assert!(reg.get("ADULTS").is_some());
        assert!(reg.unregister("adults"));
        assert!(reg.get("adults").is_none());
    }

    #[test]
    fn test_depth_limit() {
        let mut reg = ViewRegistry::new();
        reg.register("v", CompiledIntent::scan("t"));
        let catalog = Catalog::default();
        assert!(resolve_view(&reg, &catalog, "v", MAX_VIEW_DEPTH - 1).is_ok());
        assert!(matches!(
            resolve_view(&reg, &catalog, "v", MAX_VIEW_DEPTH),
            Err(Error::ViewRecursion(_))
        ));
    }
}
