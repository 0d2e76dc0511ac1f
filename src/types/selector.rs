//! Method selectors and flattened method signatures

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified method identity: `(class, name, signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    /// Dotted class name, e.g. `com.example.Service`
    pub class_name: String,
    /// Method name, e.g. `handle` or `<init>`
    pub method_name: String,
    /// JVM method descriptor, e.g. `(Ljava/lang/String;)V`
    pub signature: String,
}

impl MethodSignature {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }

    /// Flattened form used for prefix matching: `class.method(sig)`.
    pub fn flattened(&self) -> String {
        let mut out = String::with_capacity(
            self.class_name.len() + self.method_name.len() + self.signature.len() + 1,
        );
        out.push_str(&self.class_name);
        out.push('.');
        out.push_str(&self.method_name);
        out.push_str(&self.signature);
        out
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}

/// Pattern identifying methods eligible for instrumentation.
///
/// `class_name` is a prefix; a trailing `.*`, `.**` or `$**` wildcard is accepted and
/// stripped. An empty `method_name` selects the whole class. An empty `signature` with a
/// non-empty method name selects every overload of that method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootSelector {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(default, rename = "method")]
    pub method_name: String,
    #[serde(default)]
    pub signature: String,
}

impl RootSelector {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }

    /// Selector matching every method of classes starting with `prefix`.
    pub fn class_prefix(prefix: impl Into<String>) -> Self {
        Self::new(prefix, "", "")
    }

    /// Class prefix with wildcard suffixes removed.
    pub fn class_prefix_str(&self) -> &str {
        let name = self.class_name.as_str();
        for suffix in ["$**", ".**", ".*", "*"] {
            if let Some(stripped) = name.strip_suffix(suffix) {
                // keep the separator so `com.foo.*` does not match `com.foobar`
                return &name[..stripped.len() + usize::from(suffix.len() > 1)];
            }
        }
        name
    }

    pub fn selects_whole_class(&self) -> bool {
        self.method_name.is_empty()
    }

    pub fn matches_class(&self, class_name: &str) -> bool {
        class_name.starts_with(self.class_prefix_str())
    }

    /// Tests a method of a class against this selector.
    pub fn matches(&self, class_name: &str, method_name: &str, signature: &str) -> bool {
        if !self.matches_class(class_name) {
            return false;
        }
        if self.selects_whole_class() {
            return true;
        }
        self.method_name == method_name && (self.signature.is_empty() || self.signature == signature)
    }

    /// Tests a resolved method signature against this selector.
    pub fn matches_method(&self, method: &MethodSignature) -> bool {
        self.matches(&method.class_name, &method.method_name, &method.signature)
    }
}

impl fmt::Display for RootSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.selects_whole_class() {
            write!(f, "{}", self.class_name)
        } else {
            write!(f, "{}.{}{}", self.class_name, self.method_name, self.signature)
        }
    }
}
