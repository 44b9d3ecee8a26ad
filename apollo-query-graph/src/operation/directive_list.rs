use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::ops::Deref;
use std::sync::Arc;

use apollo_compiler::Node;
use apollo_compiler::executable;

/// The directives applied to a selection. Two lists are equal when they hold the same
/// applications in the same order.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirectiveList {
    inner: Arc<executable::DirectiveList>,
}

impl DirectiveList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn iter(&self) -> impl ExactSizeIterator<Item = &Node<executable::Directive>> {
        self.inner.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.iter().len() == 0
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.inner.iter().any(|directive| directive.name == name)
    }
}

impl Deref for DirectiveList {
    type Target = executable::DirectiveList;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Hash for DirectiveList {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.len().hash(state);
        for directive in self.inner.iter() {
            directive.hash(state);
        }
    }
}

impl PartialEq for DirectiveList {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.len() == other.inner.len()
                && self
                    .inner
                    .iter()
                    .zip(other.inner.iter())
                    .all(|(left, right)| left == right))
    }
}

impl Eq for DirectiveList {}

impl From<&executable::DirectiveList> for DirectiveList {
    fn from(directives: &executable::DirectiveList) -> Self {
        Self {
            inner: Arc::new(directives.clone()),
        }
    }
}

impl FromIterator<Node<executable::Directive>> for DirectiveList {
    fn from_iter<T: IntoIterator<Item = Node<executable::Directive>>>(iter: T) -> Self {
        Self {
            inner: Arc::new(executable::DirectiveList::from_iter(iter)),
        }
    }
}

impl Display for DirectiveList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.inner.serialize().no_indent().fmt(f)
    }
}
