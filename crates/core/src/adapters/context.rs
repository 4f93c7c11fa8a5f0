//! Adapter activation state and per-forward context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use candle_core::Tensor;

/// Ordered, de-duplicated list of adapter names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveAdapters(Vec<String>);

impl ActiveAdapters {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !list.contains(&name) {
                list.push(name);
            }
        }
        Self(list)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.0.retain(|n| n != name);
    }
}

impl From<&str> for ActiveAdapters {
    fn from(name: &str) -> Self {
        Self::new([name])
    }
}

impl From<&[&str]> for ActiveAdapters {
    fn from(names: &[&str]) -> Self {
        Self::new(names.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for ActiveAdapters {
    fn from(names: [&str; N]) -> Self {
        Self::new(names)
    }
}

impl From<Vec<String>> for ActiveAdapters {
    fn from(names: Vec<String>) -> Self {
        Self::new(names)
    }
}

thread_local! {
    static SCOPES: RefCell<Vec<Option<ActiveAdapters>>> = const { RefCell::new(Vec::new()) };
}

/// Scoped activation override.
///
/// While the guard is alive, every forward pass on this thread uses its
/// adapter list instead of the host's persistent active set. Guards nest;
/// the innermost wins. Dropping a guard restores the enclosing state, also
/// on early return and unwinding.
///
/// ```ignore
/// {
///     let _setup = AdapterSetup::new(["a", "b"]);
///     model.forward(&input_ids)?; // uses a, b
/// }
/// model.forward(&input_ids)?; // persistent active set again
/// ```
#[must_use = "the override ends when the guard is dropped"]
pub struct AdapterSetup {
    depth: usize,
    // bound to the creating thread's stack
    _not_send: PhantomData<*const ()>,
}

impl AdapterSetup {
    pub fn new(adapters: impl Into<ActiveAdapters>) -> Self {
        Self::push(Some(adapters.into()))
    }

    /// Scope in which no adapter is active.
    pub fn none() -> Self {
        Self::push(None)
    }

    fn push(entry: Option<ActiveAdapters>) -> Self {
        let depth = SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let depth = scopes.len();
            scopes.push(entry);
            depth
        });
        Self {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Innermost override on this thread.
    ///
    /// `None` means no scope is open; `Some(None)` means a scope explicitly
    /// deactivated all adapters.
    pub fn current() -> Option<Option<ActiveAdapters>> {
        SCOPES.with(|scopes| scopes.borrow().last().cloned())
    }

    /// Number of open scopes on this thread.
    pub fn depth() -> usize {
        SCOPES.with(|scopes| scopes.borrow().len())
    }
}

impl Drop for AdapterSetup {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            debug_assert!(
                std::thread::panicking() || scopes.len() == self.depth + 1,
                "AdapterSetup guards must be dropped innermost first"
            );
            scopes.truncate(self.depth);
        });
    }
}

/// Resolved adapter state for a single forward pass.
///
/// Built by the adapter manager from the scoped override (if any) or the
/// persistent active set. Only names attached to the host appear here.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    active: Vec<String>,
    prefix_states: HashMap<String, Tensor>,
    batch_size: usize,
}

impl ForwardContext {
    pub(crate) fn new(
        active: Vec<String>,
        prefix_states: HashMap<String, Tensor>,
        batch_size: usize,
    ) -> Self {
        Self {
            active,
            prefix_states,
            batch_size,
        }
    }

    /// Context with no active adapters (base model only).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn has_adapters(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn prefix_states(&self, name: &str) -> Option<&Tensor> {
        self.prefix_states.get(name)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
