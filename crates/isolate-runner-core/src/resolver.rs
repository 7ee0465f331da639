//! Import resolution for guest modules.
//!
//! Two layers live here:
//! - [`ModuleResolver`]: the host-declared specifier table handed to
//!   [`CompiledModule::instantiate`]
//! - The per-isolate link table and its engine hooks, which the engine
//!   consults synchronously for every static import it encounters
//!
//! Only names and sources are stored in the link table, never module
//! handles, so modules can always be freed together with their isolate.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rquickjs::loader::{Loader as JsModuleLoader, Resolver as JsModuleResolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module};
use tracing::{debug, trace};

use crate::CompiledModule;
use isolate_runner_common::RuntimeError;

/// Name prefix for modules declared only to validate syntax.
pub(crate) const PROBE_PREFIX: &str = "probe:";

/// Name prefix for the empty placeholders probe modules import from.
const STUB_PREFIX: &str = "stub:";

/// Maps import specifiers to compiled modules.
///
/// A resolver is consulted for every static import of the module it is
/// instantiated with. A specifier with no entry fails the instantiation with
/// [`RuntimeError::ModuleNotFound`].
#[derive(Clone, Default)]
pub struct ModuleResolver {
    modules: HashMap<String, CompiledModule>,
}

impl ModuleResolver {
    /// Create a resolver from `(specifier, module)` pairs.
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = (S, CompiledModule)>,
        S: Into<String>,
    {
        Self {
            modules: modules
                .into_iter()
                .map(|(specifier, module)| (specifier.into(), module))
                .collect(),
        }
    }

    /// A resolver that rejects every import.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up the module registered for `specifier`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] naming the specifier if it
    /// has no entry.
    pub fn resolve(&self, specifier: &str) -> Result<&CompiledModule, RuntimeError> {
        self.modules
            .get(specifier)
            .ok_or_else(|| RuntimeError::module_not_found(specifier))
    }

    /// Iterate over the registered specifiers.
    pub fn specifiers(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &CompiledModule)> {
        self.modules
            .iter()
            .map(|(specifier, module)| (specifier.as_str(), module))
    }
}

impl std::fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut specifiers: Vec<&str> = self.specifiers().collect();
        specifiers.sort_unstable();

        f.debug_struct("ModuleResolver")
            .field("specifiers", &specifiers)
            .finish()
    }
}

/// Build a resolver from `(specifier, module)` pairs.
///
/// # Example
///
/// ```ignore
/// let resolver = create_resolver([("format", format_module.clone())]);
/// main_module.instantiate(&context, resolver).await?;
/// ```
pub fn create_resolver<I, S>(modules: I) -> ModuleResolver
where
    I: IntoIterator<Item = (S, CompiledModule)>,
    S: Into<String>,
{
    ModuleResolver::new(modules)
}

/// Per-isolate record of compiled sources and instantiation tables.
#[derive(Default)]
pub(crate) struct LinkTable {
    sources: DashMap<String, Arc<str>>,
    imports: DashMap<String, HashMap<String, String>>,
    unresolved: Mutex<Option<String>>,
}

impl LinkTable {
    pub(crate) fn add_source(&self, name: &str, source: Arc<str>) {
        self.sources.insert(name.to_string(), source);
    }

    /// Record the specifier table used when `name` is linked.
    pub(crate) fn register_imports(&self, name: &str, table: HashMap<String, String>) {
        self.imports.insert(name.to_string(), table);
    }

    /// The last specifier the engine failed to resolve, if any.
    pub(crate) fn take_unresolved(&self) -> Option<String> {
        self.unresolved.lock().take()
    }

    fn lookup(&self, base: &str, specifier: &str) -> Option<String> {
        self.imports
            .get(base)
            .and_then(|table| table.get(specifier).cloned())
    }

    fn source(&self, name: &str) -> Option<Arc<str>> {
        self.sources.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn record_unresolved(&self, specifier: &str) {
        *self.unresolved.lock() = Some(specifier.to_string());
    }
}

/// Engine resolver hook backed by the link table.
pub(crate) struct TableResolver {
    links: Arc<LinkTable>,
}

impl TableResolver {
    pub(crate) fn new(links: Arc<LinkTable>) -> Self {
        Self { links }
    }
}

impl JsModuleResolver for TableResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        // Syntax probes link against empty placeholders
        if base.starts_with(PROBE_PREFIX) {
            return Ok(format!("{STUB_PREFIX}{name}"));
        }

        if let Some(target) = self.links.lookup(base, name) {
            trace!(base, specifier = name, target = %target, "Import resolved");
            return Ok(target);
        }

        debug!(base, specifier = name, "Import not in resolver table");
        self.links.record_unresolved(name);

        Err(rquickjs::Error::new_resolving_message(
            base,
            name,
            RuntimeError::module_not_found(name).to_string(),
        ))
    }
}

/// Engine loader hook backed by the link table.
pub(crate) struct TableLoader {
    links: Arc<LinkTable>,
}

impl TableLoader {
    pub(crate) fn new(links: Arc<LinkTable>) -> Self {
        Self { links }
    }
}

impl JsModuleLoader for TableLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        if name.starts_with(STUB_PREFIX) {
            return Module::declare(ctx.clone(), name, "");
        }

        let Some(source) = self.links.source(name) else {
            return Err(rquickjs::Error::new_loading_message(
                name,
                "module was not compiled in this isolate",
            ));
        };

        trace!(module = name, "Loading module source");
        Module::declare(ctx.clone(), name, source.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;
    use isolate_runner_common::IsolateConfig;

    #[test]
    fn test_link_table_lookup() {
        let links = LinkTable::default();
        links.register_imports(
            "module-main",
            HashMap::from([("format".to_string(), "module-format".to_string())]),
        );

        assert_eq!(
            links.lookup("module-main", "format").as_deref(),
            Some("module-format")
        );
        assert!(links.lookup("module-main", "nope").is_none());
        assert!(links.lookup("module-other", "format").is_none());
    }

    #[test]
    fn test_link_table_unresolved_is_taken_once() {
        let links = LinkTable::default();
        links.record_unresolved("nope");

        assert_eq!(links.take_unresolved().as_deref(), Some("nope"));
        assert!(links.take_unresolved().is_none());
    }

    #[test]
    fn test_link_table_sources() {
        let links = LinkTable::default();
        links.add_source("module-a", Arc::from("export const a = 1;"));

        assert_eq!(
            links.source("module-a").as_deref(),
            Some("export const a = 1;")
        );
        assert!(links.source("module-b").is_none());
    }

    #[test]
    fn test_empty_resolver_rejects() {
        let resolver = ModuleResolver::empty();

        assert!(resolver.is_empty());
        let err = resolver.resolve("format").unwrap_err();
        assert_eq!(err.to_string(), "module not found: format");
    }

    #[tokio::test]
    async fn test_create_resolver_lookup() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let format = isolate
            .compile_module("export const format = (s) => s;")
            .await
            .unwrap();

        let resolver = create_resolver([("format", format.clone())]);

        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.resolve("format").unwrap().name(), format.name());
        assert!(resolver.resolve("./format").unwrap_err().is_not_found());
        assert_eq!(resolver.specifiers().collect::<Vec<_>>(), vec!["format"]);
    }

    #[tokio::test]
    async fn test_resolver_debug_lists_specifiers() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let module = isolate.compile_module("export {};").await.unwrap();

        let resolver = create_resolver([("b", module.clone()), ("a", module)]);
        let debug_str = format!("{resolver:?}");

        assert!(debug_str.contains(r#"["a", "b"]"#));
    }
}
