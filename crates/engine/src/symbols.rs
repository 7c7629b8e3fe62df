//! Regex declaration scanner: the symbol-extraction fallback when the AST
//! collaborator is disabled or fails.
//!
//! Deliberately shallow. It captures declaration names line by line for the
//! common language families; anything it misses still surfaces through snippet
//! and chunk tokens.

use crate::services::SymbolNode;
use crate::types::uri_extension;
use regex::Regex;

/// Language families with distinct declaration shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Family {
    JsTs,
    Rust,
    Python,
    Go,
    Other,
}

fn classify(ext: &str) -> Family {
    match ext {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => Family::JsTs,
        "rs" => Family::Rust,
        "py" | "pyi" => Family::Python,
        "go" => Family::Go,
        _ => Family::Other,
    }
}

/// Compiled per-family name-capture patterns. Built once and reused across
/// every file of a rebuild or watch batch.
pub struct SymbolScanner {
    js_patterns: Vec<Regex>,
    rust_patterns: Vec<Regex>,
    python_patterns: Vec<Regex>,
    go_patterns: Vec<Regex>,
}

impl SymbolScanner {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
        };
        Self {
            js_patterns: compile(&[
                r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
                r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
                r"^\s*(?:export\s+)?interface\s+([A-Za-z_$][\w$]*)",
                r"^\s*(?:export\s+)?type\s+([A-Za-z_$][\w$]*)\s*=",
                r"^\s*(?:export\s+)?(?:const\s+)?enum\s+([A-Za-z_$][\w$]*)",
                r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\(|function)",
            ]),
            rust_patterns: compile(&[
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_][\w]*)",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_][\w]*)",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_][\w]*)",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z_][\w]*)",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+([A-Z_][\w]*)\s*:",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?type\s+([A-Za-z_][\w]*)",
            ]),
            python_patterns: compile(&[
                r"^\s*(?:async\s+)?def\s+([A-Za-z_][\w]*)",
                r"^\s*class\s+([A-Za-z_][\w]*)",
            ]),
            go_patterns: compile(&[
                r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][\w]*)",
                r"^\s*type\s+([A-Za-z_][\w]*)\s+(?:struct|interface|func)",
            ]),
        }
    }

    /// Scan `text` for declaration names, preserving first-seen order.
    pub fn extract(&self, text: &str, ext: &str) -> Vec<String> {
        let patterns = match classify(ext) {
            Family::JsTs => &self.js_patterns,
            Family::Rust => &self.rust_patterns,
            Family::Python => &self.python_patterns,
            Family::Go => &self.go_patterns,
            Family::Other => return Vec::new(),
        };

        let mut seen = std::collections::HashSet::new();
        let mut symbols = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with('#') && !trimmed.starts_with("#[") {
                continue;
            }
            for pattern in patterns {
                if let Some(cap) = pattern.captures(line) {
                    if let Some(name) = cap.get(1) {
                        let name = name.as_str().to_string();
                        if seen.insert(name.clone()) {
                            symbols.push(name);
                        }
                    }
                    break;
                }
            }
        }
        symbols
    }

    /// Extract symbols for a URI by its extension.
    pub fn extract_for_uri(&self, uri: &str, text: &str) -> Vec<String> {
        match uri_extension(uri) {
            Some(ext) => self.extract(text, &ext),
            None => Vec::new(),
        }
    }
}

impl Default for SymbolScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten an AST symbol tree into a unique, ordered name list.
pub fn flatten_symbols(nodes: &[SymbolNode]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    fn walk(nodes: &[SymbolNode], seen: &mut std::collections::HashSet<String>, out: &mut Vec<String>) {
        for node in nodes {
            if !node.name.is_empty() && seen.insert(node.name.clone()) {
                out.push(node.name.clone());
            }
            walk(&node.children, seen, out);
        }
    }
    walk(nodes, &mut seen, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
