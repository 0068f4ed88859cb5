//! Static admission control for submitted scripts.
//!
//! Checks, in order:
//! - source size and bracket nesting (lexical, before parsing)
//! - the source parses as a standalone program
//! - the first statement is the `"use strict"` directive
//! - no `import`/`export` of any form, no `with`, no `debugger`, no meta
//!   properties
//! - no call, construction or tagged template whose callee is a dynamic code
//!   evaluation primitive
//!
//! Every violation is reported, not just the first. Parse failures are the
//! exception: they yield exactly one finding.

use oxc_allocator::Allocator;
use oxc_ast::Visit;
use oxc_ast::ast::{
    CallExpression, DebuggerStatement, ExportAllDeclaration, ExportDefaultDeclaration,
    ExportNamedDeclaration, Expression, ImportDeclaration, ImportExpression, MetaProperty,
    NewExpression, Program, TaggedTemplateExpression, WithStatement,
};
use oxc_ast::visit::walk;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::prescan::excess_nesting;
use crate::core::types::{Finding, FindingKind, Location, ValidationResult};

/// The restricted execution mode marker every script must open with.
pub const STRICT_MODE_DIRECTIVE: &str = "use strict";

/// Callees that reintroduce unreviewed code execution.
pub const FORBIDDEN_CALLEES: [&str; 5] = [
    "eval",
    "Function",
    "AsyncFunction",
    "GeneratorFunction",
    "AsyncGeneratorFunction",
];

/// Global object aliases through which a forbidden callee may be reached.
const GLOBAL_OBJECTS: [&str; 4] = ["globalThis", "self", "window", "global"];

/// Stack reserved for the parse-and-walk thread. Parsing and walking recurse
/// with the syntax tree, so admissible inputs must fit in this budget.
const VALIDATOR_STACK_BYTES: usize = 256 * 1024 * 1024;

/// Bounds applied before the source is parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorLimits {
    /// Reject sources larger than this many bytes.
    pub max_source_bytes: usize,
    /// Reject sources whose bracket nesting exceeds this depth.
    pub max_nesting_depth: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            max_nesting_depth: 512,
        }
    }
}

/// Validate a script with default limits.
pub fn validate(source: &str) -> ValidationResult {
    validate_with(source, &ValidatorLimits::default())
}

/// Validate one module body of an `EvalModule` request (same rules as scripts).
pub fn validate_module(source: &str) -> ValidationResult {
    validate_with(source, &ValidatorLimits::default())
}

/// Validate `source` under explicit limits.
#[instrument(skip_all, fields(source_len = source.len()))]
pub fn validate_with(source: &str, limits: &ValidatorLimits) -> ValidationResult {
    if source.len() > limits.max_source_bytes {
        return single(Finding::new(
            FindingKind::SourceTooLarge,
            format!(
                "source is {} bytes; the limit is {} bytes",
                source.len(),
                limits.max_source_bytes
            ),
            None,
        ));
    }

    let index = LineIndex::new(source);
    if let Some(offset) = excess_nesting(source, limits.max_nesting_depth) {
        return single(Finding::new(
            FindingKind::NestingTooDeep,
            format!(
                "bracket nesting exceeds the limit of {}",
                limits.max_nesting_depth
            ),
            Some(index.locate(offset)),
        ));
    }

    let outcome = std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("scriptbox-validate".to_string())
            .stack_size(VALIDATOR_STACK_BYTES)
            .spawn_scoped(scope, || admit(source, &index))
            .map(|handle| handle.join())
    });

    let errors = match outcome {
        Ok(Ok(errors)) => errors,
        Ok(Err(_)) => {
            warn!("validator thread panicked; rejecting source");
            vec![Finding::new(
                FindingKind::Internal,
                "validator failed on this source",
                None,
            )]
        }
        Err(err) => {
            warn!(err = %err, "could not spawn validator thread; validating inline");
            admit(source, &index)
        }
    };

    debug!(findings = errors.len(), "validation finished");
    ValidationResult { errors }
}

fn single(finding: Finding) -> ValidationResult {
    ValidationResult {
        errors: vec![finding],
    }
}

/// Parse and walk. Returns findings ordered by position.
fn admit(source: &str, index: &LineIndex<'_>) -> Vec<Finding> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(true);
    let parsed = Parser::new(&allocator, source, source_type).parse();

    if let Some(error) = parsed.errors.first() {
        let location = error
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map(|label| index.locate(label.offset()));
        return vec![Finding::new(
            FindingKind::Syntax,
            format!("syntax error: {error}"),
            location,
        )];
    }
    if parsed.panicked {
        return vec![Finding::new(
            FindingKind::Syntax,
            "syntax error: parser could not recover",
            None,
        )];
    }

    let mut walker = AdmissionWalker {
        index,
        findings: Vec::new(),
    };
    walker.check_strict_mode(&parsed.program);
    walker.visit_program(&parsed.program);

    let mut findings = walker.findings;
    findings.sort_by_key(|finding| {
        finding
            .location
            .map(|location| (location.line, location.column))
            .unwrap_or((0, 0))
    });
    findings
}

struct AdmissionWalker<'i, 's> {
    index: &'i LineIndex<'s>,
    findings: Vec<Finding>,
}

impl AdmissionWalker<'_, '_> {
    fn report(&mut self, kind: FindingKind, span: Span, message: String) {
        let location = self.index.locate(span.start as usize);
        self.findings
            .push(Finding::new(kind, message, Some(location)));
    }

    fn check_strict_mode(&mut self, program: &Program<'_>) {
        if program.directives.is_empty() && program.body.is_empty() {
            return;
        }
        let marked = program
            .directives
            .first()
            .is_some_and(|directive| directive.directive.as_str() == STRICT_MODE_DIRECTIVE);
        if marked {
            return;
        }
        let span = program
            .directives
            .first()
            .map(|directive| directive.span)
            .or_else(|| program.body.first().map(GetSpan::span))
            .unwrap_or(program.span);
        self.report(
            FindingKind::MissingStrictMode,
            span,
            format!("script must begin with the \"{STRICT_MODE_DIRECTIVE}\" directive"),
        );
    }
}

impl<'a> Visit<'a> for AdmissionWalker<'_, '_> {
    fn visit_import_declaration(&mut self, it: &ImportDeclaration<'a>) {
        self.report(
            FindingKind::ModuleSyntax,
            it.span,
            format!("import declaration ('{}') is not allowed", it.source.value),
        );
    }

    fn visit_export_named_declaration(&mut self, it: &ExportNamedDeclaration<'a>) {
        self.report(
            FindingKind::ModuleSyntax,
            it.span,
            "export declaration is not allowed".to_string(),
        );
        walk::walk_export_named_declaration(self, it);
    }

    fn visit_export_default_declaration(&mut self, it: &ExportDefaultDeclaration<'a>) {
        self.report(
            FindingKind::ModuleSyntax,
            it.span,
            "export default declaration is not allowed".to_string(),
        );
        walk::walk_export_default_declaration(self, it);
    }

    fn visit_export_all_declaration(&mut self, it: &ExportAllDeclaration<'a>) {
        self.report(
            FindingKind::ModuleSyntax,
            it.span,
            format!("export * declaration ('{}') is not allowed", it.source.value),
        );
    }

    fn visit_import_expression(&mut self, it: &ImportExpression<'a>) {
        self.report(
            FindingKind::ModuleSyntax,
            it.span,
            "dynamic import() is not allowed".to_string(),
        );
        walk::walk_import_expression(self, it);
    }

    fn visit_with_statement(&mut self, it: &WithStatement<'a>) {
        self.report(
            FindingKind::WithStatement,
            it.span,
            "'with' statement is not allowed".to_string(),
        );
        walk::walk_with_statement(self, it);
    }

    fn visit_debugger_statement(&mut self, it: &DebuggerStatement) {
        self.report(
            FindingKind::Debugger,
            it.span,
            "'debugger' statement is not allowed".to_string(),
        );
    }

    fn visit_meta_property(&mut self, it: &MetaProperty<'a>) {
        self.report(
            FindingKind::MetaProperty,
            it.span,
            format!(
                "meta property '{}.{}' is not allowed",
                it.meta.name, it.property.name
            ),
        );
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if let Some(name) = forbidden_callee(&it.callee) {
            self.report(
                FindingKind::ForbiddenCallee,
                it.span,
                format!("call to forbidden function '{name}'"),
            );
        }
        walk::walk_call_expression(self, it);
    }

    fn visit_new_expression(&mut self, it: &NewExpression<'a>) {
        if let Some(name) = forbidden_callee(&it.callee) {
            self.report(
                FindingKind::ForbiddenCallee,
                it.span,
                format!("construction of forbidden constructor '{name}'"),
            );
        }
        walk::walk_new_expression(self, it);
    }

    fn visit_tagged_template_expression(&mut self, it: &TaggedTemplateExpression<'a>) {
        if let Some(name) = forbidden_callee(&it.tag) {
            self.report(
                FindingKind::ForbiddenCallee,
                it.span,
                format!("tagged template with forbidden function '{name}'"),
            );
        }
        walk::walk_tagged_template_expression(self, it);
    }
}

/// Name of the forbidden primitive `callee` refers to, if any.
fn forbidden_callee<'e>(callee: &'e Expression<'_>) -> Option<&'e str> {
    let name = match callee {
        Expression::Identifier(ident) => ident.name.as_str(),
        Expression::ParenthesizedExpression(paren) => return forbidden_callee(&paren.expression),
        Expression::StaticMemberExpression(member) if is_global_object(&member.object) => {
            member.property.name.as_str()
        }
        Expression::ComputedMemberExpression(member) if is_global_object(&member.object) => {
            match &member.expression {
                Expression::StringLiteral(literal) => literal.value.as_str(),
                _ => return None,
            }
        }
        _ => return None,
    };
    FORBIDDEN_CALLEES.contains(&name).then_some(name)
}

fn is_global_object(object: &Expression<'_>) -> bool {
    match object {
        Expression::Identifier(ident) => GLOBAL_OBJECTS.contains(&ident.name.as_str()),
        Expression::ParenthesizedExpression(paren) => is_global_object(&paren.expression),
        _ => false,
    }
}

/// Maps byte offsets to 1-based line/column pairs.
struct LineIndex<'s> {
    source: &'s str,
    line_starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    fn new(source: &'s str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(offset, _)| offset + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    fn locate(&self, offset: usize) -> Location {
        let offset = offset.min(self.source.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next.saturating_sub(1),
        };
        let start = self.line_starts.get(line).copied().unwrap_or(0);
        let column = self
            .source
            .get(start..offset)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(offset - start);
        Location {
            line: u32::try_from(line + 1).unwrap_or(u32::MAX),
            column: u32::try_from(column + 1).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(result: &ValidationResult) -> Vec<FindingKind> {
        result.errors.iter().map(|finding| finding.kind).collect()
    }

    #[test]
    fn clean_script_has_no_findings() {
        let source = r#""use strict";
const speed = 2 * 3;
setRule("player.speed", speed);
function boost(n) { return n + 1; }
({ ops: [{ op: "setAbility", name: "dash", active: boost(0) > 0 }] });
"#;
        let result = validate(source);
        assert!(result.ok(), "{:?}", result.errors);
    }

    #[test]
    fn empty_source_is_valid() {
        assert!(validate("").ok());
        assert!(validate("  \n// only a comment\n").ok());
    }

    #[test]
    fn missing_marker_is_reported_once() {
        let result = validate("setRule('a', 1);");
        assert_eq!(kinds(&result), vec![FindingKind::MissingStrictMode]);
        assert_eq!(
            result.errors[0].location,
            Some(Location { line: 1, column: 1 })
        );
    }

    #[test]
    fn marker_must_come_first() {
        let result = validate("'other'; 'use strict'; 1;");
        assert!(result.has_kind(FindingKind::MissingStrictMode));
    }

    #[test]
    fn missing_marker_does_not_stop_the_walk() {
        let result = validate("debugger;\neval('1');");
        assert_eq!(
            kinds(&result),
            vec![
                FindingKind::MissingStrictMode,
                FindingKind::Debugger,
                FindingKind::ForbiddenCallee,
            ]
        );
    }

    #[test]
    fn rejects_import_and_export_forms() {
        let source = r#""use strict";
import fs from "fs";
export const x = 1;
export default 2;
export * from "./other.js";
"#;
        let result = validate(source);
        assert_eq!(
            kinds(&result),
            vec![FindingKind::ModuleSyntax; 4],
            "{:?}",
            result.errors
        );
        assert!(result.errors[0].message.contains("import declaration"));
        assert!(result.errors[1].message.contains("export declaration"));
        assert!(result.errors[2].message.contains("export default"));
        assert!(result.errors[3].message.contains("export *"));
    }

    #[test]
    fn rejects_dynamic_import() {
        let result = validate("'use strict'; const m = import('./x.js');");
        assert_eq!(kinds(&result), vec![FindingKind::ModuleSyntax]);
        assert!(result.errors[0].message.contains("import()"));
    }

    #[test]
    fn rejects_forbidden_callees_by_name_and_new() {
        let source = r#""use strict";
eval("1 + 1");
new Function("return 1");
globalThis.eval("2");
self["Function"]("x");
(eval)("3");
"#;
        let result = validate(source);
        let messages: Vec<&str> = result
            .errors
            .iter()
            .map(|finding| finding.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec![
                "call to forbidden function 'eval'",
                "construction of forbidden constructor 'Function'",
                "call to forbidden function 'eval'",
                "call to forbidden function 'Function'",
                "call to forbidden function 'eval'",
            ]
        );
        assert_eq!(
            result.errors[1].location,
            Some(Location { line: 3, column: 1 })
        );
    }

    #[test]
    fn allows_unrelated_members_named_like_primitives() {
        let result = validate("'use strict'; const api = { eval: (x) => x }; api.eval(1);");
        assert!(result.ok(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_meta_properties_and_debugger() {
        let source = "'use strict';\nfunction F() { return new.target; }\ndebugger;";
        let result = validate(source);
        assert_eq!(
            kinds(&result),
            vec![FindingKind::MetaProperty, FindingKind::Debugger]
        );
        assert!(result.errors[0].message.contains("new.target"));
        assert_eq!(
            result.errors[1].location,
            Some(Location { line: 3, column: 1 })
        );
    }

    #[test]
    fn rejects_with_statement() {
        let result = validate("with (Math) { max(1, 2); }");
        assert!(
            result
                .errors
                .iter()
                .any(|finding| finding.message.contains("with")),
            "{:?}",
            result.errors
        );
        assert!(!result.ok());
    }

    #[test]
    fn finds_violations_nested_in_functions() {
        let source = "'use strict';\nfunction outer() {\n  return () => eval('x');\n}";
        let result = validate(source);
        assert_eq!(kinds(&result), vec![FindingKind::ForbiddenCallee]);
        assert_eq!(
            result.errors[0].location,
            Some(Location { line: 3, column: 16 })
        );
    }

    #[test]
    fn syntax_error_is_a_single_located_finding() {
        let result = validate("'use strict';\nlet = = ;\neval('x');");
        assert_eq!(kinds(&result), vec![FindingKind::Syntax]);
        let location = result.errors[0].location.expect("syntax error location");
        assert_eq!(location.line, 2);
    }

    #[test]
    fn oversized_source_is_rejected_before_parsing() {
        let limits = ValidatorLimits {
            max_source_bytes: 16,
            ..ValidatorLimits::default()
        };
        let result = validate_with("'use strict'; let value = 1;", &limits);
        assert_eq!(kinds(&result), vec![FindingKind::SourceTooLarge]);
    }

    #[test]
    fn pathological_nesting_is_rejected_without_crashing() {
        let source = format!("'use strict';\n{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        let limits = ValidatorLimits {
            max_source_bytes: 1024 * 1024,
            ..ValidatorLimits::default()
        };
        let result = validate_with(&source, &limits);
        assert_eq!(kinds(&result), vec![FindingKind::NestingTooDeep]);
        assert_eq!(
            result.errors[0].location,
            Some(Location {
                line: 2,
                column: 513
            })
        );
    }

    #[test]
    fn regex_literal_cannot_hide_deep_nesting() {
        let source = format!(
            "'use strict';\nconst r = /`/;\n{}1{}",
            "[".repeat(2000),
            "]".repeat(2000)
        );
        let result = validate(&source);
        assert_eq!(kinds(&result), vec![FindingKind::NestingTooDeep]);
        assert_eq!(result.errors[0].location.map(|l| l.line), Some(3));
    }

    #[test]
    fn deep_but_admissible_nesting_validates() {
        let source = format!("'use strict';\n{}1{};", "(".repeat(400), ")".repeat(400));
        assert!(validate(&source).ok());
    }

    #[test]
    fn module_bodies_use_the_same_rules() {
        assert!(validate_module("'use strict'; module.exports = { a: 1 };").ok());
        assert!(!validate_module("'use strict'; export const a = 1;").ok());
    }

    #[test]
    fn columns_count_characters() {
        let index = LineIndex::new("é\nab");
        assert_eq!(index.locate(2), Location { line: 1, column: 2 });
        assert_eq!(index.locate(4), Location { line: 2, column: 2 });
    }
}
