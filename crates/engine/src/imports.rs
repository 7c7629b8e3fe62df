//! Import-relationship extraction: ES-style imports and CommonJS `require()`
//! calls, parsed with regexes over raw text and resilient to malformed input.

use regex::Regex;

/// Names and module specifiers imported by one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportScan {
    /// Named, default, and namespace bindings, deduplicated in source order.
    pub imported_symbols: Vec<String>,
    /// Module specifiers, deduplicated in source order. URLs and
    /// runtime-scheme paths are filtered out.
    pub imported_from: Vec<String>,
}

pub struct ImportScanner {
    named_re: Regex,
    default_re: Regex,
    namespace_re: Regex,
    side_effect_re: Regex,
    require_re: Regex,
}

impl ImportScanner {
    pub fn new() -> Self {
        Self {
            // import { a, b as c } from 'mod' / import Default, { a } from 'mod'
            named_re: Regex::new(
                r#"import\s+(?:type\s+)?(?:([A-Za-z_$][\w$]*)\s*,\s*)?\{([^}]*)\}\s*from\s*['"]([^'"]+)['"]"#,
            )
            .unwrap(),
            default_re: Regex::new(
                r#"import\s+(?:type\s+)?([A-Za-z_$][\w$]*)\s+from\s*['"]([^'"]+)['"]"#,
            )
            .unwrap(),
            namespace_re: Regex::new(
                r#"import\s+\*\s+as\s+([A-Za-z_$][\w$]*)\s+from\s*['"]([^'"]+)['"]"#,
            )
            .unwrap(),
            side_effect_re: Regex::new(r#"import\s*['"]([^'"]+)['"]"#).unwrap(),
            require_re: Regex::new(
                r#"(?:const|let|var)\s+(?:\{([^}]*)\}|([A-Za-z_$][\w$]*))\s*=\s*require\(\s*['"]([^'"]+)['"]\s*\)"#,
            )
            .unwrap(),
        }
    }

    /// Scan `text` for imports.
    pub fn scan(&self, text: &str) -> ImportScan {
        let mut scan = ImportScan::default();

        for cap in self.named_re.captures_iter(text) {
            if let Some(default_name) = cap.get(1) {
                push_unique(&mut scan.imported_symbols, default_name.as_str());
            }
            push_named_list(&mut scan.imported_symbols, &cap[2]);
            push_module(&mut scan.imported_from, &cap[3]);
        }
        for cap in self.default_re.captures_iter(text) {
            push_unique(&mut scan.imported_symbols, &cap[1]);
            push_module(&mut scan.imported_from, &cap[2]);
        }
        for cap in self.namespace_re.captures_iter(text) {
            push_unique(&mut scan.imported_symbols, &cap[1]);
            push_module(&mut scan.imported_from, &cap[2]);
        }
        for cap in self.side_effect_re.captures_iter(text) {
            push_module(&mut scan.imported_from, &cap[1]);
        }
        for cap in self.require_re.captures_iter(text) {
            if let Some(destructured) = cap.get(1) {
                push_named_list(&mut scan.imported_symbols, destructured.as_str());
            }
            if let Some(binding) = cap.get(2) {
                push_unique(&mut scan.imported_symbols, binding.as_str());
            }
            push_module(&mut scan.imported_from, &cap[3]);
        }

        scan
    }
}

impl Default for ImportScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// `"a, b as c, type d"` contributes `a`, `b`, `d` (original exported names).
fn push_named_list(out: &mut Vec<String>, list: &str) {
    for piece in list.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let piece = piece.strip_prefix("type ").unwrap_or(piece);
        let name = piece.split_whitespace().next().unwrap_or("");
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
            push_unique(out, name);
        }
    }
}

fn push_unique(out: &mut Vec<String>, name: &str) {
    if !out.iter().any(|existing| existing == name) {
        out.push(name.to_string());
    }
}

/// Record a module specifier unless it is an absolute URL or a runtime-scheme
/// path (`node:fs`, `data:...`, `vscode:...`).
fn push_module(out: &mut Vec<String>, specifier: &str) {
    if is_url_or_scheme(specifier) {
        return;
    }
    if !out.iter().any(|existing| existing == specifier) {
        out.push(specifier.to_string());
    }
}

fn is_url_or_scheme(specifier: &str) -> bool {
    if specifier.contains("://") {
        return true;
    }
    // scheme:rest, but not Windows drive letters (c:/...)
    if let Some(colon) = specifier.find(':') {
        let scheme = &specifier[..colon];
        return scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_imports() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan("import { resolve, join as pathJoin } from 'path';");
        assert_eq!(scan.imported_symbols, vec!["resolve", "join"]);
        assert_eq!(scan.imported_from, vec!["path"]);
    }

    #[test]
    fn test_default_and_namespace() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan(
            "import React from 'react';\nimport * as fs from './fs-utils';\n",
        );
        assert_eq!(scan.imported_symbols, vec!["React", "fs"]);
        assert_eq!(scan.imported_from, vec!["react", "./fs-utils"]);
    }

    #[test]
    fn test_default_plus_named() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan("import Base, { extend, type Options } from './base';");
        assert_eq!(scan.imported_symbols, vec!["Base", "extend", "Options"]);
        assert_eq!(scan.imported_from, vec!["./base"]);
    }

    #[test]
    fn test_require_forms() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan(
            "const express = require('express');\nconst { readFile } = require('fs/promises');\n",
        );
        assert_eq!(scan.imported_symbols, vec!["express", "readFile"]);
        assert_eq!(scan.imported_from, vec!["express", "fs/promises"]);
    }

    #[test]
    fn test_urls_and_schemes_filtered() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan(
            "import x from 'https://cdn.example.com/x.js';\nimport fs from 'node:fs';\nimport y from './y';\n",
        );
        assert_eq!(scan.imported_from, vec!["./y"]);
        // Binding names still recorded even when the specifier is filtered.
        assert_eq!(scan.imported_symbols, vec!["x", "fs", "y"]);
    }

    #[test]
    fn test_side_effect_import() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan("import './polyfills';");
        assert!(scan.imported_symbols.is_empty());
        assert_eq!(scan.imported_from, vec!["./polyfills"]);
    }

    #[test]
    fn test_dedup_and_malformed_input() {
        let scanner = ImportScanner::new();
        let scan = scanner.scan(
            "import { a } from 'm';\nimport { a } from 'm';\nimport { from 'broken\n",
        );
        assert_eq!(scan.imported_symbols, vec!["a"]);
        assert_eq!(scan.imported_from, vec!["m"]);
    }
}
