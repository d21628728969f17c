//! Rule-based extraction of named code entities.
//!
//! Stages with entity memory enabled record the classes, functions, types and
//! modules their code defines, so later stages and later runs reuse the same
//! names. Extraction is regex-based and never calls a model.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of a code entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Class definition.
    Class,
    /// Function or method.
    Function,
    /// Struct, enum or type alias.
    Type,
    /// Trait or interface.
    Trait,
    /// Module.
    Module,
}

impl EntityKind {
    /// Lower-case label used as a memory tag.
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Class => "class",
            EntityKind::Function => "function",
            EntityKind::Type => "type",
            EntityKind::Trait => "trait",
            EntityKind::Module => "module",
        }
    }
}

/// A named definition found in code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Defined name.
    pub name: String,
    /// What kind of definition it is.
    pub kind: EntityKind,
}

// ── Compiled patterns ───────────────────────────────────────────

static RE_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:export\s+)?class\s+([A-Za-z_]\w*)").expect("valid regex"));

static RE_PY_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)").expect("valid regex"));

static RE_RS_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)")
        .expect("valid regex")
});

static RE_JS_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][\w$]*)")
        .expect("valid regex")
});

static RE_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|type)\s+([A-Za-z_]\w*)")
        .expect("valid regex")
});

static RE_TRAIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:trait|interface)\s+([A-Za-z_]\w*)")
        .expect("valid regex")
});

static RE_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_]\w*)").expect("valid regex")
});

/// Extracts entity definitions from `code`, in order of first appearance.
///
/// Private helpers (leading underscore) are skipped; each name is reported once.
pub fn extract_entities(code: &str) -> Vec<Entity> {
    let patterns: [(&Regex, EntityKind); 7] = [
        (&RE_CLASS, EntityKind::Class),
        (&RE_PY_DEF, EntityKind::Function),
        (&RE_RS_FN, EntityKind::Function),
        (&RE_JS_FUNCTION, EntityKind::Function),
        (&RE_TYPE, EntityKind::Type),
        (&RE_TRAIT, EntityKind::Trait),
        (&RE_MODULE, EntityKind::Module),
    ];

    let mut found: Vec<(usize, Entity)> = Vec::new();
    for (regex, kind) in patterns {
        for captures in regex.captures_iter(code) {
            let Some(name) = captures.get(1) else {
                continue;
            };
            if name.as_str().starts_with('_') {
                continue;
            }
            found.push((
                name.start(),
                Entity {
                    name: name.as_str().to_string(),
                    kind,
                },
            ));
        }
    }
    found.sort_by_key(|(position, _)| *position);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, entity)| entity)
        .filter(|entity| seen.insert(entity.name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(code: &str) -> Vec<(String, EntityKind)> {
        extract_entities(code)
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect()
    }

    #[test]
    fn python_classes_and_functions() {
        let code = r#"
class Account:
    def __init__(self, owner):
        self.owner = owner

    def deposit(self, amount):
        pass

def get_share_price(symbol):
    return 1.0

def _helper():
    pass
"#;
        assert_eq!(
            names(code),
            vec![
                ("Account".into(), EntityKind::Class),
                ("deposit".into(), EntityKind::Function),
                ("get_share_price".into(), EntityKind::Function),
            ]
        );
    }

    #[test]
    fn rust_items() {
        let code = r#"
pub mod ledger;
pub struct Account { balance: i64 }
enum Kind { Buy, Sell }
pub(crate) trait Priced {}
pub async fn settle() {}
"#;
        assert_eq!(
            names(code),
            vec![
                ("ledger".into(), EntityKind::Module),
                ("Account".into(), EntityKind::Type),
                ("Kind".into(), EntityKind::Type),
                ("Priced".into(), EntityKind::Trait),
                ("settle".into(), EntityKind::Function),
            ]
        );
    }

    #[test]
    fn names_are_reported_once() {
        let code = "def total():\n    pass\n\ndef total():\n    pass\n";
        assert_eq!(extract_entities(code).len(), 1);
    }

    #[test]
    fn prose_yields_nothing() {
        assert!(extract_entities("The account class handles deposits.").is_empty());
    }
}
