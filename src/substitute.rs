//! Macro table and token-level text substitution.

use std::collections::HashMap;

use crate::scan::{is_ident_char, is_ident_start};

/// Maps macro names to owned replacement text. This is the *textual* macro
/// environment; the numeric environment lives in the expression evaluator's
/// variable table and the two need not agree.
#[derive(Clone, Debug, Default)]
pub struct MacroTable {
    map: HashMap<String, String>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `name`, replacing any previous definition.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn undefine(&mut self, name: &str) {
        self.map.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Single left-to-right substitution pass over one line.
    ///
    /// Identifier runs are looked up in the table; a match is replaced by its
    /// stored text, everything else is copied verbatim. Replacement text is
    /// not rescanned, so a macro defined in terms of another macro keeps the
    /// expansion it got at definition time.
    pub fn expand(&self, line: &str) -> String {
        if self.map.is_empty() {
            return line.to_string();
        }

        let mut out = String::with_capacity(line.len());
        let mut i = 0;
        while i < line.len() {
            let Some(c) = line[i..].chars().next() else {
                break;
            };
            if is_ident_start(c) {
                let end = line[i..]
                    .find(|c: char| !is_ident_char(c))
                    .map_or(line.len(), |off| i + off);
                let token = &line[i..end];
                out.push_str(self.get(token).unwrap_or(token));
                i = end;
            } else {
                out.push(c);
                i += c.len_utf8();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> MacroTable {
        let mut t = MacroTable::new();
        for (k, v) in pairs {
            t.define(*k, *v);
        }
        t
    }

    #[test]
    fn replaces_whole_identifiers_only() {
        let t = table(&[("A", "5")]);
        assert_eq!(t.expand("A + AB + A"), "5 + AB + 5");
        assert_eq!(t.expand("xA A Ax"), "xA 5 Ax");
    }

    #[test]
    fn non_identifier_text_is_copied_verbatim() {
        let t = table(&[("COLOR", "vec4(1.0)")]);
        assert_eq!(t.expand("out = COLOR; // x"), "out = vec4(1.0); // x");
        assert_eq!(t.expand("1.5 * 2"), "1.5 * 2");
    }

    #[test]
    fn identifiers_cannot_start_with_digits() {
        // The run starts at the first identifier-start char, so the digit
        // prefix stays and the trailing letters form the token.
        let t = table(&[("x", "Y")]);
        assert_eq!(t.expand("12x"), "12Y");
    }

    #[test]
    fn single_pass_does_not_reexpand() {
        let t = table(&[("A", "B"), ("B", "C")]);
        assert_eq!(t.expand("A"), "B");
    }

    #[test]
    fn redefinition_overwrites() {
        let mut t = table(&[("A", "1")]);
        t.define("A", "2");
        assert_eq!(t.expand("A"), "2");
        assert_eq!(t.len(), 1);

        t.undefine("A");
        assert!(t.is_empty());
        assert_eq!(t.expand("A"), "A");
    }
}
