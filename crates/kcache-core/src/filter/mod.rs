// ── Object filters ──
//
// Pure predicates over an object's identity and labels. Filter views
// compare filters for equality to skip refilters that change nothing,
// so every variant here is comparable.

mod selector;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};

use crate::nsname::NsName;
use crate::object::Object;

/// Shared predicate used by [`Filter::func`].
///
/// Two function filters are equal only when they share the same closure.
#[derive(Clone)]
pub struct FilterFn(Arc<dyn Fn(&Object) -> bool + Send + Sync>);

impl FilterFn {
    fn call(&self, obj: &Object) -> bool {
        (self.0)(obj)
    }
}

impl PartialEq for FilterFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FilterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterFn(..)")
    }
}

/// Composable object predicate.
#[derive(Debug, Clone, Default)]
pub enum Filter {
    /// Accepts everything.
    #[default]
    Null,
    /// Accepts nothing. Built by [`Filter::all`].
    RejectAll,
    /// Every key/value pair must be present in the object's labels.
    Labels(BTreeMap<String, String>),
    /// Compared in normalized form, however it was built.
    Selector(LabelSelector),
    /// Allow-list of ids; empty components are wildcards.
    NsName(BTreeSet<NsName>),
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Func(FilterFn),
}

impl Filter {
    pub fn null() -> Self {
        Self::Null
    }

    /// Rejects every object.
    ///
    /// The name is historical: it is the "all filtered out" sentinel,
    /// not "accept all". Use [`Filter::null`] to accept everything.
    pub fn all() -> Self {
        Self::RejectAll
    }

    pub fn labels<K, V>(target: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Labels(
            target
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn label_selector(selector: LabelSelector) -> Self {
        Self::Selector(selector.normalized())
    }

    pub fn nsname(ids: impl IntoIterator<Item = NsName>) -> Self {
        Self::NsName(ids.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Accepts when every child accepts. Empty accepts everything.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    /// Accepts when any child accepts. Empty accepts nothing.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Object) -> bool + Send + Sync + 'static,
    {
        Self::Func(FilterFn(Arc::new(f)))
    }

    pub fn accept(&self, obj: &Object) -> bool {
        match self {
            Self::Null => true,
            Self::RejectAll => false,
            Self::Labels(target) => target
                .iter()
                .all(|(k, v)| obj.labels().get(k) == Some(v)),
            Self::Selector(selector) => selector.matches(obj.labels()),
            Self::NsName(ids) => nsname_accepts(ids, obj),
            Self::Not(inner) => !inner.accept(obj),
            Self::And(children) => children.iter().all(|f| f.accept(obj)),
            Self::Or(children) => children.iter().any(|f| f.accept(obj)),
            Self::Func(f) => f.call(obj),
        }
    }
}

fn nsname_accepts(ids: &BTreeSet<NsName>, obj: &Object) -> bool {
    let key = obj.key();
    if ids.contains(&key) {
        return true;
    }
    ids.iter().filter(|id| id.is_partial()).any(|id| {
        (id.namespace.is_empty() || id.namespace == key.namespace)
            && (id.name.is_empty() || id.name == key.name)
    })
}

/// Children compared as a multiset: `and(a, b) == and(b, a)`.
fn same_members(a: &[Filter], b: &[Filter]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    for fa in a {
        let found = b
            .iter()
            .enumerate()
            .position(|(i, fb)| !used.get(i).copied().unwrap_or(true) && fa == fb);
        match found.and_then(|i| used.get_mut(i)) {
            Some(slot) => *slot = true,
            None => return false,
        }
    }
    true
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::RejectAll, Self::RejectAll) => true,
            (Self::Labels(a), Self::Labels(b)) => a == b,
            (Self::Selector(a), Self::Selector(b)) => {
                a == b || a.clone().normalized() == b.clone().normalized()
            }
            (Self::NsName(a), Self::NsName(b)) => a == b,
            (Self::Not(a), Self::Not(b)) => a == b,
            (Self::And(a), Self::And(b)) | (Self::Or(a), Self::Or(b)) => same_members(a, b),
            (Self::Func(a), Self::Func(b)) => a == b,
            _ => false,
        }
    }
}
