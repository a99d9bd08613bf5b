//! Symbol scopes for the script layer above the loop.
//!
//! A stack of nested scopes, module-qualified name lookup, and an explicit
//! archive: popped scopes are not discarded but moved into the archive,
//! where an interactive debugger can still resolve names from frames that
//! have already returned. The archive lives exactly as long as the stack
//! that owns it; an optional bound drops the oldest archived scopes first.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::reporter;

pub const GLOBAL_MODULE: &str = "GLOBAL";

/// Where an identifier is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScope {
    Global,
    Module,
    Function,
}

#[derive(Debug)]
pub struct Id {
    name: String,
    scope: IdScope,
    is_export: bool,
    offset: usize,
}

impl Id {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> IdScope {
        self.scope
    }

    pub fn is_export(&self) -> bool {
        self.is_export
    }

    /// Slot index within the owning function scope; zero for globals.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Qualifies `name` with `module` unless it is already qualified or lives
/// in the global module.
pub fn make_full_name(module: &str, name: &str) -> String {
    if module.is_empty() || module == GLOBAL_MODULE || name.contains("::") {
        name.to_string()
    } else {
        format!("{module}::{name}")
    }
}

pub fn extract_module_name(full_name: &str) -> &str {
    full_name
        .rsplit_once("::")
        .map(|(module, _)| module)
        .unwrap_or(GLOBAL_MODULE)
}

pub type ScopeHandle = Rc<RefCell<Scope>>;

#[derive(Default)]
pub struct Scope {
    scope_id: Option<String>,
    local: HashMap<String, Rc<Id>>,
    inits: Vec<Rc<Id>>,
}

impl Scope {
    pub fn new(scope_id: Option<String>) -> Self {
        Self {
            scope_id,
            ..Self::default()
        }
    }

    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<Id>> {
        self.local.get(name).cloned()
    }

    pub fn insert(&mut self, name: &str, id: Rc<Id>) {
        self.local.insert(name.to_string(), id);
    }

    pub fn remove(&mut self, name: &str) -> Option<Rc<Id>> {
        self.local.remove(name)
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn add_init(&mut self, id: Rc<Id>) {
        self.inits.push(id);
    }

    /// Returns the identifiers still needing initialization, emptying the
    /// list.
    pub fn get_inits(&mut self) -> Vec<Rc<Id>> {
        std::mem::take(&mut self.inits)
    }
}

pub struct ScopeStack {
    scopes: Vec<ScopeHandle>,
    archive: Vec<ScopeHandle>,
    archive_limit: Option<usize>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            archive: Vec::new(),
            archive_limit: None,
        }
    }

    /// Caps the archive; the oldest archived scopes are dropped first once
    /// the cap is exceeded. `None` keeps every popped scope.
    pub fn set_archive_limit(&mut self, limit: Option<usize>) {
        self.archive_limit = limit;
        self.trim_archive();
    }

    fn trim_archive(&mut self) {
        if let Some(limit) = self.archive_limit {
            while self.archive.len() > limit {
                self.archive.remove(0);
            }
        }
    }

    pub fn push_scope(&mut self, scope_id: Option<String>) -> ScopeHandle {
        let scope = Rc::new(RefCell::new(Scope::new(scope_id)));
        self.scopes.push(scope.clone());
        scope
    }

    /// Re-enters a scope popped earlier, e.g. when resuming a partially
    /// compiled function body.
    pub fn push_existing_scope(&mut self, scope: ScopeHandle) {
        self.scopes.push(scope);
    }

    /// Pops the innermost scope into the archive and returns it. Popping an
    /// empty stack is a fatal internal error.
    pub fn pop_scope(&mut self) -> ScopeHandle {
        let Some(top) = self.scopes.pop() else {
            reporter::internal_error("scope underflow");
        };

        self.archive.push(top.clone());
        self.trim_archive();
        top
    }

    pub fn current_scope(&self) -> Option<ScopeHandle> {
        self.scopes.last().cloned()
    }

    pub fn global_scope(&self) -> Option<ScopeHandle> {
        self.scopes.first().cloned()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn archive_len(&self) -> usize {
        self.archive.len()
    }

    /// Archived scopes, oldest first, for debugger name resolution.
    pub fn archived(&self) -> &[ScopeHandle] {
        &self.archive
    }

    /// Resolves `name` against the active scopes, innermost first, then the
    /// global module unless `no_global` forbids it. An identifier found in
    /// another module must be exported when `check_export` is set; a miss
    /// there is reported as an error but still resolves.
    pub fn lookup_id(
        &self,
        name: &str,
        module: &str,
        no_global: bool,
        same_module_only: bool,
        check_export: bool,
    ) -> Option<Rc<Id>> {
        let full_name = make_full_name(module, name);
        let id_module = extract_module_name(&full_name);
        let need_export = check_export && id_module != GLOBAL_MODULE && id_module != module;

        for scope in self.scopes.iter().rev() {
            if let Some(id) = scope.borrow().lookup(&full_name) {
                if need_export && !id.is_export() {
                    reporter::error(&format!("identifier is not exported: {full_name}"));
                }
                return Some(id);
            }
        }

        if !no_global && (module == GLOBAL_MODULE || !same_module_only) {
            let global_name = make_full_name(GLOBAL_MODULE, name);
            if let Some(global) = self.global_scope() {
                if let Some(id) = global.borrow().lookup(&global_name) {
                    return Some(id);
                }
            }
        }

        None
    }

    /// Creates an identifier and installs it in the scope its visibility
    /// calls for. Installing a local with no scope on the stack is a fatal
    /// internal error.
    pub fn install_id(
        &mut self,
        name: &str,
        module: &str,
        is_global: bool,
        is_export: bool,
    ) -> Rc<Id> {
        if self.scopes.is_empty() && !is_global {
            reporter::internal_error("local identifier in global scope");
        }

        let scope = if is_export || module.is_empty() || (is_global && module == GLOBAL_MODULE) {
            IdScope::Global
        } else if is_global {
            IdScope::Module
        } else {
            IdScope::Function
        };

        let full_name = make_full_name(module, name);

        let offset = if scope == IdScope::Function {
            self.scopes.last().map(|s| s.borrow().len()).unwrap_or(0)
        } else {
            0
        };

        let id = Rc::new(Id {
            name: full_name.clone(),
            scope,
            is_export,
            offset,
        });

        let target = if scope == IdScope::Function {
            self.scopes.last().cloned()
        } else {
            self.global_scope()
        };

        if let Some(target) = target {
            target.borrow_mut().insert(&full_name, id.clone());
        }

        id
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_names_qualify_with_module() {
        assert_eq!(make_full_name("HTTP", "pending"), "HTTP::pending");
        assert_eq!(make_full_name(GLOBAL_MODULE, "pending"), "pending");
        assert_eq!(make_full_name("HTTP", "DNS::pending"), "DNS::pending");
        assert_eq!(extract_module_name("HTTP::pending"), "HTTP");
        assert_eq!(extract_module_name("pending"), GLOBAL_MODULE);
    }

    #[test]
    fn install_and_lookup_through_nested_scopes() {
        let mut stack = ScopeStack::new();
        stack.push_scope(None);
        let global = stack.install_id("net_timeout", GLOBAL_MODULE, true, false);
        assert_eq!(global.scope(), IdScope::Global);

        stack.push_scope(Some("handler".to_string()));
        let local = stack.install_id("i", "HTTP", false, false);
        assert_eq!(local.scope(), IdScope::Function);

        let found = stack.lookup_id("i", "HTTP", false, false, true).unwrap();
        assert_eq!(found.name(), "HTTP::i");

        // The global module is the fallback.
        let found = stack.lookup_id("net_timeout", "HTTP", false, false, true).unwrap();
        assert_eq!(found.name(), "net_timeout");
    }

    #[test]
    fn local_offsets_count_up_within_a_scope() {
        let mut stack = ScopeStack::new();
        stack.push_scope(None);
        stack.push_scope(Some("f".to_string()));
        let a = stack.install_id("a", "M", false, false);
        let b = stack.install_id("b", "M", false, false);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 1);
    }

    #[test]
    fn cross_module_access_requires_export() {
        let mut stack = ScopeStack::new();
        stack.push_scope(None);
        stack.install_id("secret", "DNS", true, false);

        let errors_before = reporter::errors();
        let found = stack.lookup_id("DNS::secret", "HTTP", false, false, true);
        assert!(found.is_some());
        assert_eq!(reporter::errors(), errors_before + 1);
    }

    #[test]
    fn popped_scopes_land_in_the_archive() {
        let mut stack = ScopeStack::new();
        stack.push_scope(None);
        let inner = stack.push_scope(Some("f".to_string()));
        stack.install_id("x", "M", false, false);

        let popped = stack.pop_scope();
        assert!(Rc::ptr_eq(&popped, &inner));
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.archive_len(), 1);

        // Names in archived scopes stay resolvable for the debugger.
        let archived = &stack.archived()[0];
        assert!(archived.borrow().lookup("M::x").is_some());
    }

    #[test]
    fn bounded_archive_drops_oldest_first() {
        let mut stack = ScopeStack::new();
        stack.set_archive_limit(Some(2));
        stack.push_scope(None);
        for i in 0..4 {
            stack.push_scope(Some(format!("f{i}")));
            stack.pop_scope();
        }
        assert_eq!(stack.archive_len(), 2);
        assert_eq!(stack.archived()[0].borrow().scope_id(), Some("f2"));
        assert_eq!(stack.archived()[1].borrow().scope_id(), Some("f3"));
    }

    #[test]
    fn push_existing_scope_reenters_popped_frame() {
        let mut stack = ScopeStack::new();
        stack.push_scope(None);
        stack.push_scope(Some("f".to_string()));
        stack.install_id("x", "M", false, false);
        let frame = stack.pop_scope();

        stack.push_existing_scope(frame);
        assert!(stack.lookup_id("x", "M", true, false, true).is_some());
    }

    #[test]
    #[should_panic(expected = "scope underflow")]
    fn popping_an_empty_stack_is_fatal() {
        let mut stack = ScopeStack::new();
        stack.pop_scope();
    }

    #[test]
    #[should_panic(expected = "local identifier in global scope")]
    fn installing_a_local_with_no_scope_is_fatal() {
        let mut stack = ScopeStack::new();
        stack.install_id("x", "M", false, false);
    }

    #[test]
    fn get_inits_drains_the_list() {
        let mut stack = ScopeStack::new();
        let scope = stack.push_scope(None);
        let id = stack.install_id("x", GLOBAL_MODULE, true, false);
        scope.borrow_mut().add_init(id);

        assert_eq!(scope.borrow_mut().get_inits().len(), 1);
        assert!(scope.borrow_mut().get_inits().is_empty());
    }
}
