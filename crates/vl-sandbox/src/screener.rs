//! Pre-execution screening of sandbox source.
//!
//! A conventional function called without a receiver gets the global object
//! as `this` in sloppy mode, which would hand the snippet every global the
//! sandbox shadows:
//!
//! ```js
//! const globals = (function () { return this })();
//! ```
//!
//! Arrow functions inherit `this` from the sandbox body instead, so the
//! screener rejects every `function` keyword and leaves arrows alone.
//! Generator functions can be allowed separately. The word is rejected in
//! property position too (`this.function`, `{ function: 1 }`), so every
//! occurrence outside strings, templates and comments counts. Method
//! shorthand, getters, setters and class methods with other names carry no
//! `function` keyword and are not screened.
//!
//! Bracket nesting is bounded before parsing so that deeply nested input
//! cannot exhaust the parser's stack.

use oxc_allocator::Allocator;
use oxc_ast::ast::{Function, IdentifierName};
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::SourceType;
use oxc_syntax::identifier::is_identifier_part;
use oxc_syntax::scope::ScopeFlags;

use crate::error::SandboxError;

const FUNCTION_KEYWORD: &str = "function";

/// Deepest bracket nesting accepted by [`screen`].
pub const MAX_NESTING_DEPTH: usize = 256;

/// A `function` keyword that introduces a declaration or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionKeyword {
    /// Byte offset of the keyword in the source.
    pub offset: usize,
    /// Whether the keyword is followed by the generator marker `*`.
    pub generator: bool,
}

/// Check `source` and return the first disallowed `function` keyword as an
/// [`SandboxError::UnsafeInput`].
pub fn screen(source: &str, allow_generator_functions: bool) -> Result<(), SandboxError> {
    let rejected = function_keywords(source)?
        .into_iter()
        .find(|keyword| !(keyword.generator && allow_generator_functions));

    match rejected {
        Some(keyword) => {
            tracing::debug!(
                offset = keyword.offset,
                generator = keyword.generator,
                "sandbox source rejected"
            );
            Err(SandboxError::UnsafeInput {
                offset: keyword.offset,
                generator: keyword.generator,
            })
        }
        None => Ok(()),
    }
}

/// Check nesting depth of brackets, braces and parens before parsing.
///
/// Brackets inside strings and comments count too; the bound is loose enough
/// that this never matters for real snippets.
pub fn check_nesting_depth(source: &str) -> Result<(), SandboxError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for byte in source.bytes() {
        match byte {
            b'{' | b'[' | b'(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' | b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        tracing::debug!(max_depth, "sandbox source nested too deeply");
        return Err(SandboxError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
            actual: max_depth,
        });
    }
    Ok(())
}

/// Find every `function` keyword in `source`, in source order.
///
/// The source is parsed as a function body. Both function keywords and
/// property names spelled `function` are reported. When the source has
/// syntax errors the partial tree is still walked and the raw text is
/// additionally scanned for the whole word `function` outside string
/// literals, templates and comments, so a keyword the parser skipped over is
/// never missed. Regular expression literals are not recognised by that scan.
///
/// Fails with [`SandboxError::NestingTooDeep`] before parsing when brackets
/// nest deeper than [`MAX_NESTING_DEPTH`].
pub fn function_keywords(source: &str) -> Result<Vec<FunctionKeyword>, SandboxError> {
    check_nesting_depth(source)?;

    let allocator = Allocator::default();
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let ret = Parser::new(&allocator, source, SourceType::cjs())
        .with_options(options)
        .parse();

    let mut collector = KeywordCollector {
        source,
        found: Vec::new(),
    };
    collector.visit_program(&ret.program);
    let mut found = collector.found;

    if ret.panicked || !ret.errors.is_empty() {
        tracing::debug!(
            errors = ret.errors.len(),
            "sandbox source has syntax errors, scanning raw text"
        );
        found.extend(scan_words(source));
    }

    found.sort_by_key(|keyword| keyword.offset);
    found.dedup_by_key(|keyword| keyword.offset);
    Ok(found)
}

struct KeywordCollector<'s> {
    source: &'s str,
    found: Vec<FunctionKeyword>,
}

impl<'a> Visit<'a> for KeywordCollector<'_> {
    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        if let Some(offset) = keyword_offset(self.source, func.span.start as usize) {
            self.found.push(FunctionKeyword {
                offset,
                generator: func.generator,
            });
        }
        walk::walk_function(self, func, flags);
    }

    fn visit_identifier_name(&mut self, ident: &IdentifierName<'a>) {
        if ident.name.as_str() == FUNCTION_KEYWORD {
            let offset = ident.span.start as usize;
            self.found.push(FunctionKeyword {
                offset,
                generator: followed_by_star(self.source, offset),
            });
        }
    }
}

fn followed_by_star(source: &str, offset: usize) -> bool {
    source
        .get(offset + FUNCTION_KEYWORD.len()..)
        .is_some_and(|rest| skip_trivia(rest).starts_with('*'))
}

/// Offset of the `function` keyword opening a function node that starts at
/// `start`, or `None` for methods and accessors.
fn keyword_offset(source: &str, start: usize) -> Option<usize> {
    let mut rest = source.get(start..)?;
    let mut offset = start;

    if let Some(after_async) = strip_word(rest, "async") {
        let skipped = skip_trivia(after_async);
        offset += rest.len() - skipped.len();
        rest = skipped;
    }

    strip_word(rest, FUNCTION_KEYWORD).map(|_| offset)
}

/// Strip `word` from the front of `text` if it is a whole word there.
fn strip_word<'s>(text: &'s str, word: &str) -> Option<&'s str> {
    let after = text.strip_prefix(word)?;
    match after.chars().next() {
        Some(c) if is_identifier_part(c) => None,
        _ => Some(after),
    }
}

/// Skip whitespace and comments.
fn skip_trivia(mut text: &str) -> &str {
    loop {
        let trimmed = text.trim_start();
        if let Some(rest) = trimmed.strip_prefix("/*") {
            text = rest.find("*/").map_or("", |end| &rest[end + 2..]);
        } else if let Some(rest) = trimmed.strip_prefix("//") {
            text = rest.find('\n').map_or("", |end| &rest[end..]);
        } else {
            return trimmed;
        }
    }
}

/// Whole-word `function` occurrences outside strings, templates and
/// comments. Template substitutions are scanned as code.
fn scan_words(source: &str) -> Vec<FunctionKeyword> {
    let bytes = source.as_bytes();
    let mut found = Vec::new();
    // Brace depth at which each open `${` substitution closes.
    let mut substitutions: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => i = skip_quoted(bytes, i + 1, quote),
            b'`' => i = skip_template(bytes, i + 1, &mut substitutions, depth),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = find_byte(bytes, i + 2, b'\n').unwrap_or(bytes.len());
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |end| i + 2 + end + 2);
            }
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' if substitutions.last() == Some(&depth) => {
                substitutions.pop();
                i = skip_template(bytes, i + 1, &mut substitutions, depth);
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            _ if bytes[i..].starts_with(FUNCTION_KEYWORD.as_bytes())
                && is_whole_word(source, i, FUNCTION_KEYWORD.len()) =>
            {
                found.push(FunctionKeyword {
                    offset: i,
                    generator: followed_by_star(source, i),
                });
                i += FUNCTION_KEYWORD.len();
            }
            _ => i += 1,
        }
    }
    found
}

/// Index just past the closing `quote`, honouring backslash escapes.
fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i + 1,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index just past the end of a template chunk: its closing backtick, or the
/// `${` opening a substitution (which is then recorded at `depth`).
fn skip_template(
    bytes: &[u8],
    mut i: usize,
    substitutions: &mut Vec<usize>,
    depth: usize,
) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return i + 1,
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                substitutions.push(depth);
                return i + 2;
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from.min(bytes.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|pos| from + pos)
}

fn is_whole_word(source: &str, offset: usize, len: usize) -> bool {
    let before = source[..offset].chars().next_back();
    let after = source[offset + len..].chars().next();
    !before.is_some_and(is_identifier_part) && !after.is_some_and(is_identifier_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(source: &str, allow_generators: bool) -> (usize, bool) {
        match screen(source, allow_generators) {
            Err(SandboxError::UnsafeInput { offset, generator }) => (offset, generator),
            other => panic!("expected UnsafeInput for {source:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_empty_source() {
        assert!(screen("", false).is_ok());
        assert!(screen("   \n", false).is_ok());
    }

    #[test]
    fn accepts_arrow_functions() {
        assert!(screen("const f = () => this; this.out = f();", false).is_ok());
        assert!(screen("this.out = [1, 2].map(async (x) => x * 2);", false).is_ok());
    }

    #[test]
    fn accepts_top_level_return() {
        assert!(screen("if (x) { return; } this.out = 1;", false).is_ok());
    }

    #[test]
    fn rejects_function_expression() {
        let source = "const globals = (function () { return this })();";
        assert_eq!(rejected(source, false), (17, false));
    }

    #[test]
    fn rejects_function_declaration_even_with_generators_allowed() {
        let source = "function leak() { return this }";
        assert_eq!(rejected(source, true), (0, false));
    }

    #[test]
    fn rejects_async_function_at_the_keyword() {
        let source = "const f = async function () {};";
        assert_eq!(rejected(source, false), (16, false));
    }

    #[test]
    fn generator_allowed_when_enabled() {
        assert!(screen("function* g(){}", true).is_ok());
        assert!(screen("const g = async function * () { yield 1 };", true).is_ok());
    }

    #[test]
    fn generator_rejected_by_default() {
        assert_eq!(rejected("function* g(){}", false), (0, true));
    }

    #[test]
    fn mixed_generator_and_plain_function_rejects_plain() {
        let source = "const g = function*(){}; const f = function(){};";
        assert_eq!(rejected(source, true), (35, false));
    }

    #[test]
    fn nested_function_inside_arrow_is_found() {
        let source = "const run = () => [1].map(function (x) { return this });";
        assert_eq!(rejected(source, false), (26, false));
    }

    #[test]
    fn function_in_template_expression_is_found() {
        let source = "this.out = `${(function () { return 1 })()}`;";
        assert_eq!(rejected(source, false), (15, false));
    }

    #[test]
    fn strings_and_comments_are_not_keywords() {
        let source = r#"
            // function in a comment
            /* function */
            this.kind = typeof x === "function" ? 'function' : `function`;
        "#;
        assert!(screen(source, false).is_ok());
    }

    #[test]
    fn methods_and_accessors_are_not_screened() {
        let source = r#"
            const o = { m() { return 1 }, get v() { return 2 } };
            class A { run() { return 3 } }
            this.out = o.m() + o.v + new A().run();
        "#;
        assert!(screen(source, false).is_ok());
    }

    #[test]
    fn bare_keyword_at_end_of_input_is_not_a_generator() {
        assert_eq!(rejected("function", true), (0, false));
    }

    #[test]
    fn syntax_errors_fall_back_to_word_scan() {
        let source = "this.x = ; function () { return this }";
        let (offset, generator) = rejected(source, true);
        assert_eq!(offset, 11);
        assert!(!generator);
    }

    #[test]
    fn word_scan_ignores_longer_identifiers() {
        assert!(screen("this.x = ; const functional = 1;", false).is_ok());
    }

    #[test]
    fn property_names_spelled_function_are_rejected() {
        assert_eq!(rejected("this.function = 1;", false), (5, false));
        assert_eq!(rejected("const o = { function: 2 };", false), (12, false));
        assert_eq!(rejected("class A { function() {} }", true), (10, false));
    }

    #[test]
    fn word_scan_skips_strings_and_comments() {
        let source = r#"this.x = ; this.k = 'function' + "function"; // function
            /* function */ this.t = `function ${'function'}`;"#;
        assert!(screen(source, false).is_ok());
    }

    #[test]
    fn word_scan_finds_keyword_in_template_substitution() {
        let source = "this.x = ; `a ${(function () {})()} b`;";
        assert_eq!(rejected(source, false), (17, false));
    }

    #[test]
    fn nesting_at_the_limit_is_accepted() {
        let depth = MAX_NESTING_DEPTH;
        let source = format!("this.x = {}1{};", "(".repeat(depth), ")".repeat(depth));
        assert!(screen(&source, false).is_ok());
    }

    #[test]
    fn nesting_past_the_limit_is_rejected_before_parsing() {
        let depth = MAX_NESTING_DEPTH + 1;
        let source = format!("this.x = {}1{};", "(".repeat(depth), ")".repeat(depth));
        match screen(&source, false) {
            Err(SandboxError::NestingTooDeep { max, actual }) => {
                assert_eq!(max, MAX_NESTING_DEPTH);
                assert_eq!(actual, depth);
            }
            other => panic!("expected NestingTooDeep, got {other:?}"),
        }
    }

    #[test]
    fn pathological_nesting_does_not_overflow() {
        let source = format!("this.x = {}1{};", "(".repeat(20_000), ")".repeat(20_000));
        assert!(matches!(
            screen(&source, false),
            Err(SandboxError::NestingTooDeep { actual: 20_000, .. })
        ));
    }

    #[test]
    fn keywords_are_reported_in_source_order() {
        let keywords = function_keywords("function a(){} const b = function*(){};").unwrap();
        assert_eq!(
            keywords,
            vec![
                FunctionKeyword {
                    offset: 0,
                    generator: false
                },
                FunctionKeyword {
                    offset: 25,
                    generator: true
                },
            ]
        );
    }
}
