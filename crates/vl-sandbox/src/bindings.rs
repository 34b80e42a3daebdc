//! Bookkeeping for shadowed globals and exposed bindings.
//!
//! The registry holds two disjoint name sets: the ambient globals that will be
//! shadowed with `null`, and the exposed bindings with their values. Every
//! exposure moves a name out of the shadowed set, and [`BindingRegistry::reset`]
//! restores the shadowed set from a fresh snapshot of the global object.

/// Words that cannot be used as parameter names.
const RESERVED_WORDS: &[&str] = &[
    "await",
    "break",
    "case",
    "catch",
    "class",
    "const",
    "continue",
    "debugger",
    "default",
    "delete",
    "do",
    "else",
    "enum",
    "export",
    "extends",
    "false",
    "finally",
    "for",
    "function",
    "if",
    "import",
    "in",
    "instanceof",
    "new",
    "null",
    "return",
    "super",
    "switch",
    "this",
    "throw",
    "true",
    "try",
    "typeof",
    "var",
    "void",
    "while",
    "with",
    "yield",
];

/// Whether a global property name can be shadowed by a parameter.
///
/// Purely numeric names (array-index-like properties) and names that are not
/// identifiers are never reachable by identifier lookup, so they are skipped.
pub fn is_shadowable(name: &str) -> bool {
    if name.is_empty() || name.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(oxc_syntax::identifier::is_identifier_start);
    starts_ok
        && chars.all(oxc_syntax::identifier::is_identifier_part)
        && !RESERVED_WORDS.contains(&name)
}

/// Shadowed global names plus exposed name/value bindings.
///
/// `V` is whatever the runner needs to materialise a value; the registry only
/// tracks names and ordering.
#[derive(Debug, Clone)]
pub struct BindingRegistry<V> {
    globals: Vec<String>,
    exposed: Vec<(String, V)>,
}

impl<V> Default for BindingRegistry<V> {
    fn default() -> Self {
        Self {
            globals: Vec::new(),
            exposed: Vec::new(),
        }
    }
}

impl<V> BindingRegistry<V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the shadowed names with `ambient` (minus unshadowable names)
    /// and drop every exposed binding.
    pub fn reset<I, S>(&mut self, ambient: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed.clear();
        self.globals.clear();
        for name in ambient {
            let name = name.into();
            if is_shadowable(&name) && !self.globals.contains(&name) {
                self.globals.push(name);
            }
        }
    }

    /// Bind `name` to `value`.
    ///
    /// A name exposed before keeps its position and gets the new value. The
    /// name stops being shadowed.
    pub fn expose(&mut self, name: &str, value: V) {
        self.globals.retain(|global| global != name);
        match self.exposed.iter_mut().find(|(key, _)| key == name) {
            Some((_, slot)) => *slot = value,
            None => self.exposed.push((name.to_string(), value)),
        }
    }

    /// Names shadowed with the inert placeholder, in snapshot order.
    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    /// Whether `name` is currently shadowed.
    pub fn is_shadowed(&self, name: &str) -> bool {
        self.globals.iter().any(|global| global == name)
    }

    /// The value bound to `name`, if it is exposed.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.exposed
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Exposed names in the order they were first exposed.
    pub fn exposed_names(&self) -> impl Iterator<Item = &str> {
        self.exposed.iter().map(|(name, _)| name.as_str())
    }

    /// Number of exposed bindings.
    pub fn exposed_len(&self) -> usize {
        self.exposed.len()
    }

    /// The parameter list for the next run: shadowed names, then exposed names.
    pub fn parameters(&self) -> Vec<&str> {
        self.globals
            .iter()
            .map(String::as_str)
            .chain(self.exposed_names())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(names: &[&str]) -> BindingRegistry<i32> {
        let mut registry = BindingRegistry::new();
        registry.reset(names.iter().copied());
        registry
    }

    #[test]
    fn reset_skips_numeric_and_non_identifier_names() {
        let registry = registry(&["Math", "0", "12", "a-b", "", "JSON", "x1", "$", "_y"]);
        assert_eq!(registry.globals(), ["Math", "JSON", "x1", "$", "_y"]);
    }

    #[test]
    fn reset_skips_reserved_words() {
        let registry = registry(&["if", "undefined", "NaN", "class"]);
        assert_eq!(registry.globals(), ["undefined", "NaN"]);
    }

    #[test]
    fn expose_moves_name_out_of_globals() {
        let mut registry = registry(&["Math", "JSON", "Date"]);
        registry.expose("JSON", 1);
        assert_eq!(registry.globals(), ["Math", "Date"]);
        assert_eq!(registry.get("JSON"), Some(&1));
        assert!(!registry.is_shadowed("JSON"));
    }

    #[test]
    fn exposing_a_new_name_leaves_globals_alone() {
        let mut registry = registry(&["Math"]);
        registry.expose("y", 42);
        assert_eq!(registry.globals(), ["Math"]);
        assert_eq!(registry.get("y"), Some(&42));
    }

    #[test]
    fn re_exposing_replaces_value_in_place() {
        let mut registry = registry(&[]);
        registry.expose("a", 1);
        registry.expose("b", 2);
        registry.expose("a", 3);
        assert_eq!(registry.exposed_names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(registry.get("a"), Some(&3));
    }

    #[test]
    fn parameters_list_globals_then_exposed() {
        let mut registry = registry(&["Math", "JSON", "Date"]);
        registry.expose("y", 1);
        registry.expose("Math", 2);
        assert_eq!(registry.parameters(), ["JSON", "Date", "y", "Math"]);
    }

    #[test]
    fn globals_and_exposed_stay_disjoint() {
        let mut registry = registry(&["Math", "JSON", "Date"]);
        registry.expose("Math", 1);
        registry.expose("z", 2);
        registry.expose("Date", 3);
        for name in registry.exposed_names() {
            assert!(!registry.is_shadowed(name), "{name} is both exposed and shadowed");
        }
        let mut union: Vec<_> = registry.parameters();
        union.sort_unstable();
        assert_eq!(union, ["Date", "JSON", "Math", "z"]);
    }

    #[test]
    fn reset_undoes_exposures() {
        let mut registry = registry(&["Math", "JSON"]);
        registry.expose("Math", 1);
        registry.expose("extra", 2);
        registry.reset(["Math", "JSON"]);
        assert_eq!(registry.globals(), ["Math", "JSON"]);
        assert_eq!(registry.exposed_len(), 0);
        assert_eq!(registry.get("Math"), None);
    }

    #[test]
    fn reset_ignores_duplicate_names() {
        let registry = registry(&["Math", "Math"]);
        assert_eq!(registry.globals(), ["Math"]);
    }
}
