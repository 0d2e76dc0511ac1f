//! Marks: logical categories for grouping CPU time

use serde::{Deserialize, Serialize};
use std::fmt;

use super::RootSelector;

/// Opaque logical category assigned to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mark(u16);

impl Mark {
    /// Sentinel for uncategorized methods.
    pub const DEFAULT: Mark = Mark(0);

    pub const fn new(id: u16) -> Self {
        Mark(id)
    }

    pub const fn id(self) -> u16 {
        self.0
    }

    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl Default for Mark {
    fn default() -> Self {
        Mark::DEFAULT
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() { write!(f, "mark:default") } else { write!(f, "mark:{}", self.0) }
    }
}

/// Maps every method whose flattened signature starts with `selector` to `mark`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkMapping {
    pub selector: String,
    pub mark: Mark,
}

impl MarkMapping {
    pub fn new(selector: impl Into<String>, mark: Mark) -> Self {
        Self { selector: selector.into(), mark }
    }

    pub fn matches(&self, flattened: &str) -> bool {
        flattened.starts_with(&self.selector)
    }

    /// A root selector covering every method this mapping can match.
    ///
    /// The result may select more classes than needed: a prefix that stops inside a
    /// class or method name widens to the enclosing class prefix, and a trailing `.`
    /// is dropped because it may end a package or a class name.
    pub fn covering_selector(&self) -> RootSelector {
        let selector = self.selector.as_str();
        if let Some((head, _)) = selector.split_once('(') {
            if let Some((class, method)) = head.rsplit_once('.') {
                return RootSelector::new(class, method, "");
            }
        }
        if let Some(prefix) = selector.strip_suffix('.') {
            return RootSelector::class_prefix(prefix);
        }
        if selector.ends_with('$') {
            return RootSelector::class_prefix(selector);
        }
        match selector.rsplit_once('.') {
            Some((class, _)) => RootSelector::class_prefix(class),
            None => RootSelector::class_prefix(selector),
        }
    }
}

/// Returns the mark of the first mapping matching `flattened`, or [`Mark::DEFAULT`].
pub fn first_match(mappings: &[MarkMapping], flattened: &str) -> Mark {
    mappings.iter().find(|m| m.matches(flattened)).map_or(Mark::DEFAULT, |m| m.mark)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_selectors_include_the_mapped_methods() {
        let cases = [
            ("com.foo.", "com.foo.Bar", "run", "()V"),
            ("com.foo.Bar.", "com.foo.Bar", "run", "()V"),
            ("com.foo.Outer$", "com.foo.Outer$Inner", "run", "()V"),
            ("com.foo.Bar.run(I)V", "com.foo.Bar", "run", "(I)V"),
            ("com.foo.Bar.ru", "com.foo.Bar", "run", "()V"),
            ("com.foo.Ba", "com.foo.Bar", "run", "()V"),
        ];
        for (prefix, class, method, sig) in cases {
            let mapping = MarkMapping::new(prefix, Mark::new(1));
            assert!(mapping.matches(&format!("{class}.{method}{sig}")));
            assert!(mapping.covering_selector().matches(class, method, sig), "{prefix}");
        }
    }
}
