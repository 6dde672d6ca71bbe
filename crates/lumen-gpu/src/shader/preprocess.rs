//! Conditional compilation and `#define` tracking.
//!
//! Conditionals are resolved here so the transpiler only ever sees the lines
//! that will be compiled. `#define` lines are kept in the output (the
//! compiler expands them in code) but are also recorded, so array sizes such
//! as `lights[MAX_LIGHTS]` can be resolved while computing the block layout.

use std::collections::{BTreeMap, BTreeSet};

use super::lexer::{self, Token, TokenKind};

/// Literal token replaced by the caller-supplied `#define` lines.
pub const DEFINITIONS_SPLICE: &str = "{$DEFINITIONS}";

const MAX_EXPANSION_DEPTH: u32 = 16;

/// Flags (`#define NAME`) and substitutions (`#define NAME VALUE`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Definitions {
    flags: BTreeSet<String>,
    values: BTreeMap<String, String>,
}

impl Definitions {
    pub fn define(&mut self, name: &str, value: Option<&str>) {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => {
                self.flags.remove(name);
                self.values.insert(name.to_string(), value.to_string());
            }
            None => {
                self.values.remove(name);
                self.flags.insert(name.to_string());
            }
        }
    }

    pub fn undefine(&mut self, name: &str) {
        self.flags.remove(name);
        self.values.remove(name);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.flags.contains(name) || self.values.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Evaluate an integer expression such as an array size.
    pub fn resolve_int(&self, expression: &str) -> Option<i64> {
        evaluate(expression, self, 0)
    }
}

/// Output of [`preprocess`].
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// Source with inactive lines blanked. Line numbers are preserved.
    pub text: String,
    pub definitions: Definitions,
    /// Malformed nesting and unparsable conditions (tolerated).
    pub warnings: Vec<String>,
}

/// Insert the caller's extra definitions at the splice token, or right after
/// `#version` when the source has no splice token.
pub fn splice_definitions(source: &str, definitions: &str) -> String {
    let mut extra = definitions.trim_end().to_string();
    if !extra.is_empty() {
        extra.push('\n');
    }

    if source.contains(DEFINITIONS_SPLICE) {
        return source.replace(DEFINITIONS_SPLICE, extra.trim_end());
    }
    if extra.is_empty() {
        return source.to_string();
    }

    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        if line.trim_start().starts_with("#version") {
            let at = offset + line.len();
            let mut out = String::with_capacity(source.len() + extra.len() + 1);
            out.push_str(&source[..at]);
            if !line.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&extra);
            out.push_str(&source[at..]);
            return out;
        }
        offset += line.len();
    }
    format!("{}{}", extra, source)
}

#[derive(Debug, Clone, Copy)]
struct Conditional {
    parent_active: bool,
    branch_taken: bool,
    active: bool,
    seen_else: bool,
}

/// Resolve conditionals, record definitions, and splice in `extra`.
pub fn preprocess(source: &str, extra: &str) -> Preprocessed {
    let spliced = splice_definitions(source, extra);
    let tokens = lexer::tokenize(&spliced);

    let mut definitions = Definitions::default();
    let mut warnings = Vec::new();
    let mut stack: Vec<Conditional> = Vec::new();
    let mut text = String::with_capacity(spliced.len());
    let mut line_number = 1usize;

    for token in &tokens {
        let active = stack.last().map_or(true, |c| c.active);
        match token.kind {
            TokenKind::Newline => {
                text.push_str(token.text);
                line_number += 1;
                continue;
            }
            TokenKind::Directive => {}
            _ => {
                if active {
                    text.push_str(token.text);
                } else {
                    // Keep line numbering of skipped multi-line comments.
                    for _ in token.text.matches('\n') {
                        text.push('\n');
                    }
                }
                line_number += token.text.matches('\n').count();
                continue;
            }
        }

        let body = token.text.trim_start().trim_start_matches('#').trim_start();
        let (keyword, rest) = match body.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
            Some(at) => (&body[..at], body[at..].trim()),
            None => (body, ""),
        };
        let rest = strip_line_comment(rest);

        match keyword {
            "if" | "ifdef" | "ifndef" => {
                let condition = match keyword {
                    "ifdef" => definitions.is_defined(rest),
                    "ifndef" => !definitions.is_defined(rest),
                    _ => match evaluate(rest, &definitions, 0) {
                        Some(value) => value != 0,
                        None => {
                            if active {
                                warnings.push(format!("line {}: cannot evaluate #if {}", line_number, rest));
                            }
                            false
                        }
                    },
                };
                let taken = active && condition;
                stack.push(Conditional {
                    parent_active: active,
                    branch_taken: taken,
                    active: taken,
                    seen_else: false,
                });
            }
            "elif" => match stack.last_mut() {
                Some(top) => {
                    if top.seen_else {
                        warnings.push(format!("line {}: #elif after #else", line_number));
                    }
                    if top.branch_taken || !top.parent_active {
                        top.active = false;
                    } else {
                        let condition = match evaluate(rest, &definitions, 0) {
                            Some(value) => value != 0,
                            None => {
                                warnings.push(format!("line {}: cannot evaluate #elif {}", line_number, rest));
                                false
                            }
                        };
                        top.active = condition;
                        top.branch_taken = condition;
                    }
                }
                None => warnings.push(format!("line {}: #elif without #if", line_number)),
            },
            "else" => match stack.last_mut() {
                Some(top) => {
                    if top.seen_else {
                        warnings.push(format!("line {}: duplicate #else", line_number));
                    }
                    top.active = top.parent_active && !top.branch_taken;
                    top.branch_taken = true;
                    top.seen_else = true;
                }
                None => warnings.push(format!("line {}: #else without #if", line_number)),
            },
            "endif" => {
                if stack.pop().is_none() {
                    warnings.push(format!("line {}: #endif without #if", line_number));
                }
            }
            "define" if active => {
                let (name, value) = match rest.find(char::is_whitespace) {
                    Some(at) => (&rest[..at], Some(rest[at..].trim())),
                    None => (rest, None),
                };
                if name.is_empty() {
                    warnings.push(format!("line {}: #define without a name", line_number));
                } else {
                    definitions.define(name, value);
                }
                text.push_str(token.text);
            }
            "undef" if active => {
                definitions.undefine(rest);
                text.push_str(token.text);
            }
            _ if active => text.push_str(token.text),
            _ => {}
        }
    }

    if !stack.is_empty() {
        warnings.push(format!("{} unterminated conditional block(s) at end of file", stack.len()));
    }

    Preprocessed {
        text,
        definitions,
        warnings,
    }
}

fn strip_line_comment(text: &str) -> &str {
    let mut cut = text.len();
    if let Some(at) = text.find("//") {
        cut = at;
    }
    if let Some(at) = text.find("/*") {
        cut = cut.min(at);
    }
    text[..cut].trim()
}

// ============================================================================
// Expression evaluation
// ============================================================================

fn evaluate(expression: &str, definitions: &Definitions, depth: u32) -> Option<i64> {
    if depth > MAX_EXPANSION_DEPTH {
        return None;
    }
    let tokens = lexer::significant(&lexer::tokenize(expression));
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        definitions,
        depth,
    };
    let value = parser.logical_or()?;
    if parser.pos == parser.tokens.len() {
        Some(value)
    } else {
        None
    }
}

struct ExprParser<'a, 'd> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    definitions: &'d Definitions,
    depth: u32,
}

impl<'a, 'd> ExprParser<'a, 'd> {
    fn peek(&self, offset: usize) -> Option<Token<'a>> {
        self.tokens.get(self.pos + offset).copied()
    }

    /// Consume a one- or two-character operator.
    fn eat(&mut self, op: &str) -> bool {
        let mut chars = op.chars();
        let first = chars.next().map(String::from).unwrap_or_default();
        let second = chars.next().map(String::from);
        match (self.peek(0), second) {
            (Some(a), Some(second)) if a.is_punct(&first) => {
                if self.peek(1).is_some_and(|b| b.is_punct(&second)) {
                    self.pos += 2;
                    true
                } else {
                    false
                }
            }
            (Some(a), None) if a.is_punct(&first) => {
                // `<` must not swallow the first half of `<=`.
                if self.peek(1).is_some_and(|b| b.is_punct("=") || b.is_punct(&first))
                    && matches!(first.as_str(), "<" | ">" | "!" | "=" | "&" | "|")
                {
                    return false;
                }
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn logical_or(&mut self) -> Option<i64> {
        let mut value = self.logical_and()?;
        while self.eat("||") {
            let rhs = self.logical_and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Some(value)
    }

    fn logical_and(&mut self) -> Option<i64> {
        let mut value = self.comparison()?;
        while self.eat("&&") {
            let rhs = self.comparison()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Some(value)
    }

    fn comparison(&mut self) -> Option<i64> {
        let lhs = self.additive()?;
        let op = ["==", "!=", "<=", ">=", "<", ">"]
            .into_iter()
            .find(|op| self.eat(op));
        let Some(op) = op else {
            return Some(lhs);
        };
        let rhs = self.additive()?;
        let result = match op {
            "==" => lhs == rhs,
            "!=" => lhs != rhs,
            "<=" => lhs <= rhs,
            ">=" => lhs >= rhs,
            "<" => lhs < rhs,
            _ => lhs > rhs,
        };
        Some(i64::from(result))
    }

    fn additive(&mut self) -> Option<i64> {
        let mut value = self.multiplicative()?;
        loop {
            if self.eat("+") {
                value = value.checked_add(self.multiplicative()?)?;
            } else if self.eat("-") {
                value = value.checked_sub(self.multiplicative()?)?;
            } else {
                return Some(value);
            }
        }
    }

    fn multiplicative(&mut self) -> Option<i64> {
        let mut value = self.unary()?;
        loop {
            if self.eat("*") {
                value = value.checked_mul(self.unary()?)?;
            } else if self.eat("/") {
                value = value.checked_div(self.unary()?)?;
            } else {
                return Some(value);
            }
        }
    }

    fn unary(&mut self) -> Option<i64> {
        if self.peek(0).is_some_and(|t| t.is_punct("!")) && !self.peek(1).is_some_and(|t| t.is_punct("=")) {
            self.pos += 1;
            return Some(i64::from(self.unary()? == 0));
        }
        if self.eat("-") {
            return self.unary()?.checked_neg();
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<i64> {
        let token = self.peek(0)?;
        self.pos += 1;
        match token.kind {
            TokenKind::Number => parse_int(token.text),
            TokenKind::Ident if token.text == "defined" => {
                let parenthesized = self.eat("(");
                let name = self.peek(0).filter(|t| t.kind == TokenKind::Ident)?;
                self.pos += 1;
                if parenthesized && !self.eat(")") {
                    return None;
                }
                Some(i64::from(self.definitions.is_defined(name.text)))
            }
            TokenKind::Ident => match self.definitions.value(token.text) {
                Some(value) => evaluate(value, self.definitions, self.depth + 1),
                // Undefined identifiers (and bare flags) evaluate to zero.
                None => Some(0),
            },
            TokenKind::Punct if token.text == "(" => {
                let value = self.logical_or()?;
                if self.eat(")") {
                    Some(value)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    digits.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_lines(pre: &Preprocessed) -> Vec<&str> {
        pre.text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    // ========================================================================
    // Conditionals
    // ========================================================================

    #[test]
    fn test_if_defined_with_else() {
        let source = "#define SHADOWS\n#if defined(SHADOWS)\na\n#else\nb\n#endif\n";
        let pre = preprocess(source, "");
        assert_eq!(active_lines(&pre), vec!["#define SHADOWS", "a"]);
        assert!(pre.warnings.is_empty());
    }

    #[test]
    fn test_elif_chain_takes_first_match_only() {
        let source = "#if defined(A)\na\n#elif defined(B)\nb\n#elif defined(C)\nc\n#else\nd\n#endif\n";
        let pre = preprocess(source, "#define B\n#define C\n");
        assert_eq!(active_lines(&pre), vec!["#define B", "#define C", "b"]);

        let pre = preprocess(source, "");
        assert_eq!(active_lines(&pre), vec!["d"]);
    }

    #[test]
    fn test_nested_inactive_parent_suppresses_children() {
        let source = "#ifdef OUTER\n#ifndef INNER\nx\n#else\ny\n#endif\n#endif\nz\n";
        let pre = preprocess(source, "#define INNER");
        assert_eq!(active_lines(&pre), vec!["#define INNER", "z"]);
    }

    #[test]
    fn test_line_numbers_preserved() {
        let source = "#if defined(X)\na\nb\n#endif\nc\n";
        let pre = preprocess(source, "");
        assert_eq!(pre.text.lines().count(), source.lines().count());
        assert_eq!(pre.text.lines().nth(4), Some("c"));
    }

    #[test]
    fn test_malformed_nesting_is_tolerated() {
        let pre = preprocess("#endif\na\n#if defined(X)\nb\n", "");
        assert_eq!(active_lines(&pre), vec!["a"]);
        assert_eq!(pre.warnings.len(), 2);
    }

    #[test]
    fn test_directives_in_comments_are_ignored() {
        let source = "/*\n#if defined(X)\n*/\nvisible\n";
        let pre = preprocess(source, "");
        assert!(pre.text.contains("visible"));
        assert!(pre.warnings.is_empty());
    }

    #[test]
    fn test_compound_condition() {
        let source = "#if defined(A) && !defined(B) || (LEVEL >= 2)\nyes\n#endif\n";
        assert_eq!(active_lines(&preprocess(source, "#define A")), vec!["#define A", "yes"]);
        assert!(active_lines(&preprocess(source, "#define A\n#define B")).len() == 2);
        assert_eq!(
            active_lines(&preprocess(source, "#define LEVEL 3")),
            vec!["#define LEVEL 3", "yes"]
        );
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    #[test]
    fn test_flags_and_substitutions_tracked_separately() {
        let pre = preprocess("#define SKINNED\n#define MAX_LIGHTS 8\n#define TOTAL (MAX_LIGHTS * 2)\n", "");
        assert!(pre.definitions.is_defined("SKINNED"));
        assert_eq!(pre.definitions.value("SKINNED"), None);
        assert_eq!(pre.definitions.value("MAX_LIGHTS"), Some("8"));
        assert_eq!(pre.definitions.resolve_int("MAX_LIGHTS"), Some(8));
        assert_eq!(pre.definitions.resolve_int("TOTAL + 1"), Some(17));
    }

    #[test]
    fn test_defines_in_inactive_branches_are_ignored() {
        let pre = preprocess("#ifdef NOPE\n#define X 1\n#endif\n", "");
        assert!(!pre.definitions.is_defined("X"));
    }

    #[test]
    fn test_recursive_definition_does_not_hang() {
        let pre = preprocess("#define A B\n#define B A\n", "");
        assert_eq!(pre.definitions.resolve_int("A"), None);
    }

    // ========================================================================
    // Splicing
    // ========================================================================

    #[test]
    fn test_splice_token_replaced() {
        let out = splice_definitions("#version 330\n{$DEFINITIONS}\nvoid main() {}\n", "#define A\n");
        assert_eq!(out, "#version 330\n#define A\nvoid main() {}\n");
    }

    #[test]
    fn test_splice_after_version_without_token() {
        let out = splice_definitions("// header\n#version 330 core\nvoid main() {}\n", "#define A");
        assert_eq!(out, "// header\n#version 330 core\n#define A\nvoid main() {}\n");
        let out = splice_definitions("void main() {}\n", "#define A");
        assert_eq!(out, "#define A\nvoid main() {}\n");
    }
}
