//! ECMAScript transformer: TypeScript/JSX lowering through the oxc
//! toolchain (parse, semantic analysis, transform, codegen), followed by
//! an ESM-to-CommonJS rewrite so the linker's `require` wrapper can
//! execute the result.
//!
//! The CommonJS rewrite is span-based text splicing on a re-parse of the
//! transpiled output: import/export statements are replaced in place and
//! their `require` calls hoisted into a prelude, Babel-style. Dependency
//! discovery then scans the lowered code for `require("...")`.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    BindingPattern, BindingPatternKind, Declaration, ExportDefaultDeclarationKind,
    ImportDeclarationSpecifier, ModuleExportName, Statement,
};
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::{GetSpan, SourceType};
use oxc_transformer::{JsxOptions, JsxRuntime, TransformOptions, Transformer};
use std::path::Path;

use super::transformer::{
    EcmascriptConfig, JsxMode, Transform, TransformError, TransformInput, TransformOutput,
    TransformResult, TransformerConfig,
};

/// The default transformer for `.js/.jsx/.ts/.tsx/.mjs/.cjs` files.
pub struct EcmascriptTransformer;

impl Transform for EcmascriptTransformer {
    fn transform(
        &self,
        input: TransformInput<'_>,
        config: &TransformerConfig,
    ) -> TransformResult<TransformOutput> {
        let config = match config {
            TransformerConfig::Ecmascript(config) => config,
            _ => {
                return Err(TransformError::Transform {
                    path: input.path.to_string(),
                    message: "ecmascript transformer received a foreign config".to_string(),
                })
            }
        };

        let transpiled = transpile(&input.code, input.path, config)?;
        let lowered = lower_to_commonjs(&transpiled, input.path)?;
        let dependencies = find_requires(&lowered);

        Ok(TransformOutput {
            code: lowered,
            dependencies,
        })
    }
}

/// Run the oxc pipeline: strip TypeScript, lower JSX, regenerate code.
fn transpile(source: &str, path: &str, config: &EcmascriptConfig) -> TransformResult<String> {
    let allocator = Allocator::default();

    let mut source_type =
        SourceType::from_path(Path::new(path)).map_err(|e| TransformError::Parse {
            path: path.to_string(),
            message: format!("Unknown file extension: {e:?}"),
        })?;
    // Plain .js files are allowed to contain JSX, as bundlers
    // conventionally accept.
    if !source_type.is_typescript() {
        source_type = source_type.with_jsx(true);
    }

    let parser_return = Parser::new(&allocator, source, source_type).parse();
    if !parser_return.errors.is_empty() {
        let messages: Vec<String> = parser_return.errors.iter().map(|e| e.to_string()).collect();
        return Err(TransformError::Parse {
            path: path.to_string(),
            message: messages.join("\n"),
        });
    }

    let mut program = parser_return.program;
    let semantic_return = SemanticBuilder::new().build(&program);
    let (symbols, scopes) = semantic_return.semantic.into_symbol_table_and_scope_tree();

    let mut transform_options = TransformOptions::default();
    transform_options.jsx = build_jsx_options(config);

    let transformer_return = Transformer::new(&allocator, Path::new(path), &transform_options)
        .build_with_symbols_and_scopes(symbols, scopes, &mut program);
    if !transformer_return.errors.is_empty() {
        let messages: Vec<String> = transformer_return
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect();
        return Err(TransformError::Transform {
            path: path.to_string(),
            message: messages.join("\n"),
        });
    }

    let codegen_return = Codegen::new()
        .with_options(CodegenOptions::default())
        .build(&program);
    Ok(codegen_return.code)
}

fn build_jsx_options(config: &EcmascriptConfig) -> JsxOptions {
    let mut jsx = JsxOptions::default();
    jsx.jsx_plugin = true;
    jsx.runtime = match config.jsx_mode {
        JsxMode::Classic => JsxRuntime::Classic,
        JsxMode::Automatic => JsxRuntime::Automatic,
    };
    if let Some(ref pragma) = config.jsx_pragma {
        jsx.pragma = Some(pragma.clone().into());
    }
    if let Some(ref pragma_frag) = config.jsx_pragma_frag {
        jsx.pragma_frag = Some(pragma_frag.clone().into());
    }
    if let Some(ref import_source) = config.jsx_import_source {
        jsx.import_source = Some(import_source.clone().into());
    }
    jsx
}

/// Rewrite top-level import/export statements to CommonJS. Code without
/// module syntax passes through untouched.
fn lower_to_commonjs(code: &str, path: &str) -> TransformResult<String> {
    let allocator = Allocator::default();
    let source_type = SourceType::mjs();

    let parser_return = Parser::new(&allocator, code, source_type).parse();
    if !parser_return.errors.is_empty() {
        let messages: Vec<String> = parser_return.errors.iter().map(|e| e.to_string()).collect();
        return Err(TransformError::Parse {
            path: path.to_string(),
            message: messages.join("\n"),
        });
    }

    let program = parser_return.program;
    // (source, variable) pairs in first-appearance order.
    let mut requires: Vec<(String, String)> = Vec::new();
    let mut edits: Vec<(usize, usize, String)> = Vec::new();

    let mut require_var = |source: &str, requires: &mut Vec<(String, String)>| -> String {
        if let Some((_, var)) = requires.iter().find(|(s, _)| s == source) {
            return var.clone();
        }
        let var = format!("_import{}", requires.len());
        requires.push((source.to_string(), var.clone()));
        var
    };

    for stmt in &program.body {
        match stmt {
            Statement::ImportDeclaration(decl) => {
                if decl.import_kind.is_type() {
                    edits.push((decl.span.start as usize, decl.span.end as usize, String::new()));
                    continue;
                }
                let var = require_var(decl.source.value.as_str(), &mut requires);
                let mut lines: Vec<String> = Vec::new();
                if let Some(specifiers) = &decl.specifiers {
                    for specifier in specifiers {
                        match specifier {
                            ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                                lines.push(format!(
                                    "var {local} = {var} && {var}.__esModule ? {var}[\"default\"] : {var};",
                                    local = s.local.name
                                ));
                            }
                            ImportDeclarationSpecifier::ImportSpecifier(s) => {
                                lines.push(format!(
                                    "var {local} = {var}[{imported}];",
                                    local = s.local.name,
                                    imported = string_literal(&export_name(&s.imported)),
                                ));
                            }
                            ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                                lines.push(format!("var {local} = {var};", local = s.local.name));
                            }
                        }
                    }
                }
                edits.push((
                    decl.span.start as usize,
                    decl.span.end as usize,
                    lines.join(" "),
                ));
            }
            Statement::ExportNamedDeclaration(decl) => {
                if decl.export_kind.is_type() {
                    edits.push((decl.span.start as usize, decl.span.end as usize, String::new()));
                    continue;
                }
                let replacement = if let Some(source) = &decl.source {
                    let var = require_var(source.value.as_str(), &mut requires);
                    decl.specifiers
                        .iter()
                        .map(|s| {
                            format!(
                                "exports[{exported}] = {var}[{local}];",
                                exported = string_literal(&export_name(&s.exported)),
                                local = string_literal(&export_name(&s.local)),
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                } else if let Some(declaration) = &decl.declaration {
                    let span = declaration.span();
                    let text = &code[span.start as usize..span.end as usize];
                    let names = declaration_names(declaration);
                    let assignments: Vec<String> = names
                        .iter()
                        .map(|name| format!("exports.{name} = {name};"))
                        .collect();
                    format!("{text}\n{}", assignments.join(" "))
                } else {
                    decl.specifiers
                        .iter()
                        .map(|s| {
                            format!(
                                "exports[{exported}] = {local};",
                                exported = string_literal(&export_name(&s.exported)),
                                local = export_name(&s.local),
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                edits.push((decl.span.start as usize, decl.span.end as usize, replacement));
            }
            Statement::ExportDefaultDeclaration(decl) => {
                let replacement = match &decl.declaration {
                    ExportDefaultDeclarationKind::FunctionDeclaration(func)
                        if func.id.is_some() =>
                    {
                        let name = func.id.as_ref().unwrap().name.as_str();
                        let text = &code[func.span.start as usize..func.span.end as usize];
                        format!("{text}\nexports[\"default\"] = {name};")
                    }
                    ExportDefaultDeclarationKind::ClassDeclaration(class) if class.id.is_some() => {
                        let name = class.id.as_ref().unwrap().name.as_str();
                        let text = &code[class.span.start as usize..class.span.end as usize];
                        format!("{text}\nexports[\"default\"] = {name};")
                    }
                    other => {
                        let span = other.span();
                        let text = &code[span.start as usize..span.end as usize];
                        format!("exports[\"default\"] = ({text});")
                    }
                };
                edits.push((decl.span.start as usize, decl.span.end as usize, replacement));
            }
            Statement::ExportAllDeclaration(decl) => {
                let var = require_var(decl.source.value.as_str(), &mut requires);
                let replacement = match &decl.exported {
                    Some(name) => format!(
                        "exports[{exported}] = {var};",
                        exported = string_literal(&export_name(name)),
                    ),
                    None => format!(
                        "Object.keys({var}).forEach(function (key) {{ \
                         if (key === \"default\" || key === \"__esModule\") return; \
                         exports[key] = {var}[key]; }});"
                    ),
                };
                edits.push((decl.span.start as usize, decl.span.end as usize, replacement));
            }
            _ => {}
        }
    }

    if edits.is_empty() {
        return Ok(code.to_string());
    }

    let mut out = String::with_capacity(code.len() + 256);
    out.push_str("\"use strict\";\n");
    out.push_str("Object.defineProperty(exports, \"__esModule\", { value: true });\n");
    for (source, var) in &requires {
        out.push_str(&format!("var {var} = require({});\n", string_literal(source)));
    }

    let mut cursor = 0usize;
    for (start, end, replacement) in edits {
        out.push_str(&code[cursor..start]);
        out.push_str(&replacement);
        cursor = end;
    }
    out.push_str(&code[cursor..]);

    Ok(out)
}

fn export_name(name: &ModuleExportName) -> String {
    match name {
        ModuleExportName::IdentifierName(id) => id.name.to_string(),
        ModuleExportName::IdentifierReference(id) => id.name.to_string(),
        ModuleExportName::StringLiteral(lit) => lit.value.to_string(),
    }
}

/// Names bound by an exported declaration.
fn declaration_names(declaration: &Declaration) -> Vec<String> {
    let mut names = Vec::new();
    match declaration {
        Declaration::VariableDeclaration(var_decl) => {
            for declarator in &var_decl.declarations {
                collect_binding_names(&declarator.id, &mut names);
            }
        }
        Declaration::FunctionDeclaration(func) => {
            if let Some(id) = &func.id {
                names.push(id.name.to_string());
            }
        }
        Declaration::ClassDeclaration(class) => {
            if let Some(id) = &class.id {
                names.push(id.name.to_string());
            }
        }
        _ => {}
    }
    names
}

fn collect_binding_names(pattern: &BindingPattern, out: &mut Vec<String>) {
    match &pattern.kind {
        BindingPatternKind::BindingIdentifier(id) => out.push(id.name.to_string()),
        BindingPatternKind::ObjectPattern(object) => {
            for property in &object.properties {
                collect_binding_names(&property.value, out);
            }
            if let Some(rest) = &object.rest {
                collect_binding_names(&rest.argument, out);
            }
        }
        BindingPatternKind::ArrayPattern(array) => {
            for element in array.elements.iter().flatten() {
                collect_binding_names(element, out);
            }
            if let Some(rest) = &array.rest {
                collect_binding_names(&rest.argument, out);
            }
        }
        BindingPatternKind::AssignmentPattern(assignment) => {
            collect_binding_names(&assignment.left, out);
        }
    }
}

fn string_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

/// Find `require('...')` calls by scanning the code. Results keep first
/// appearance order without duplicates.
pub fn find_requires(code: &str) -> Vec<String> {
    let mut requires: Vec<String> = Vec::new();
    let bytes = code.as_bytes();
    let mut i = 0usize;

    while let Some(offset) = code[i..].find("require(") {
        let start = i + offset;
        i = start + "require(".len();

        // Skip matches that are part of a longer identifier, like
        // `__webpack_require__(` or `requireFrom(`.
        if start > 0 {
            let prev = bytes[start - 1];
            if prev == b'_' || prev == b'.' || prev.is_ascii_alphanumeric() {
                continue;
            }
        }

        let rest = &code[i..];
        let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let Some(end) = rest[1..].find(quote) else {
            continue;
        };
        let specifier = &rest[1..1 + end];
        if !specifier.is_empty() && !requires.iter().any(|r| r == specifier) {
            requires.push(specifier.to_string());
        }
        i += 1 + end + 1;
    }

    requires
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(path: &str, code: &str) -> TransformOutput {
        EcmascriptTransformer
            .transform(
                TransformInput {
                    path,
                    code: code.to_string(),
                },
                &TransformerConfig::Ecmascript(EcmascriptConfig::default()),
            )
            .unwrap()
    }

    #[test]
    fn strips_typescript_annotations() {
        let out = transform(
            "/test.ts",
            r#"
            const message: string = "Hello, World!";
            console.log(message);
            "#,
        );
        assert!(!out.code.contains(": string"));
        assert!(out.code.contains("Hello, World!"));
    }

    #[test]
    fn removes_interfaces() {
        let out = transform(
            "/test.ts",
            r#"
            interface User {
                name: string;
                age: number;
            }
            const user: User = { name: "Alice", age: 30 };
            "#,
        );
        assert!(!out.code.contains("interface"));
    }

    #[test]
    fn lowers_default_import_to_require() {
        let out = transform("/index.js", r#"import x from "./m"; console.log(x);"#);
        assert!(out.code.contains(r#"var _import0 = require("./m");"#));
        assert!(out.code.contains("__esModule"));
        assert_eq!(out.dependencies, vec!["./m".to_string()]);
    }

    #[test]
    fn lowers_named_and_namespace_imports() {
        let out = transform(
            "/index.js",
            r#"import { a, b as c } from "./m"; import * as ns from "./n"; a(c, ns);"#,
        );
        assert!(out.code.contains(r#"var a = _import0["a"];"#));
        assert!(out.code.contains(r#"var c = _import0["b"];"#));
        assert!(out.code.contains("var ns = _import1;"));
        assert_eq!(out.dependencies, vec!["./m".to_string(), "./n".to_string()]);
    }

    #[test]
    fn lowers_exports() {
        let out = transform(
            "/m.js",
            r#"
            export const answer = 42;
            export function helper() { return answer; }
            export default 7;
            "#,
        );
        assert!(out.code.contains("exports.answer = answer;"));
        assert!(out.code.contains("exports.helper = helper;"));
        assert!(out.code.contains("exports[\"default\"] = (7);"));
    }

    #[test]
    fn lowers_reexports_and_star_exports() {
        let out = transform(
            "/barrel.js",
            r#"export { a as b } from "./a"; export * from "./rest";"#,
        );
        assert!(out.code.contains(r#"exports["b"] = _import0["a"];"#));
        assert!(out.code.contains("Object.keys(_import1)"));
        assert_eq!(
            out.dependencies,
            vec!["./a".to_string(), "./rest".to_string()]
        );
    }

    #[test]
    fn commonjs_passes_through() {
        let source = r#"const dep = require("./dep"); module.exports = dep;"#;
        let out = transform("/cjs.js", source);
        assert!(out.code.contains(r#"require("./dep")"#));
        assert!(!out.code.contains("__esModule"));
        assert_eq!(out.dependencies, vec!["./dep".to_string()]);
    }

    #[test]
    fn jsx_automatic_runtime_pulls_in_the_runtime_package() {
        let out = transform("/app.jsx", "const el = <div>hi</div>; export default el;");
        assert!(out
            .dependencies
            .iter()
            .any(|d| d.contains("react/jsx-runtime")));
    }

    #[test]
    fn parse_errors_are_reported_with_the_path() {
        let err = EcmascriptTransformer
            .transform(
                TransformInput {
                    path: "/broken.js",
                    code: "const = ;".to_string(),
                },
                &TransformerConfig::Ecmascript(EcmascriptConfig::default()),
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::Parse { ref path, .. } if path == "/broken.js"));
    }

    #[test]
    fn require_scan_skips_longer_identifiers() {
        let requires = find_requires(
            r#"var a = require("a"); __custom_require__("b"); other.require("c"); var d = require('d');"#,
        );
        assert_eq!(requires, vec!["a".to_string(), "d".to_string()]);
    }
}
