//! The transformer capability contract.
//!
//! A transformer is a pure function from source text plus configuration
//! to compiled text plus discovered dependencies. The module handle is
//! reduced to its path; transformers never touch shared state.

use thiserror::Error;

/// Errors produced by transformers. Clone-able so they can be captured
/// on a module and surfaced again by the closure await.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Failed to transform {path}: {message}")]
    Transform { path: String, message: String },

    #[error("No transformer registered for {path}")]
    UnsupportedFile { path: String },

    #[error("Unknown transformer '{name}' requested for {path}")]
    UnknownTransformer { name: String, path: String },
}

/// Result type for transform operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// JSX lowering mode, mirroring the two Babel runtimes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JsxMode {
    /// `React.createElement`-style calls through a pragma.
    Classic,
    /// The automatic runtime (`<source>/jsx-runtime` imports).
    #[default]
    Automatic,
}

/// Configuration for the ECMAScript transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcmascriptConfig {
    pub jsx_mode: JsxMode,
    /// Pragma for classic mode (e.g. `h`).
    pub jsx_pragma: Option<String>,
    /// Fragment pragma for classic mode.
    pub jsx_pragma_frag: Option<String>,
    /// Import source for the automatic runtime (e.g. `react`).
    pub jsx_import_source: Option<String>,
}

impl Default for EcmascriptConfig {
    fn default() -> Self {
        Self {
            jsx_mode: JsxMode::Automatic,
            jsx_pragma: None,
            jsx_pragma_frag: None,
            jsx_import_source: Some("react".to_string()),
        }
    }
}

/// Configuration for the CSS transformer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CssConfig {
    /// Skip the style-injection wrapper and only export the text.
    pub text_only: bool,
}

/// Per-transformer configuration. A tagged union rather than a generic
/// map, so each variant is validated at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformerConfig {
    Ecmascript(EcmascriptConfig),
    Css(CssConfig),
    Json,
    Raw,
}

/// Input handed to a transformer: the module's identity plus the code
/// produced by the previous transformer in the chain.
#[derive(Debug)]
pub struct TransformInput<'a> {
    pub path: &'a str,
    pub code: String,
}

/// A transformer's output: compiled text and the dependencies it
/// discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    pub dependencies: Vec<String>,
}

impl TransformOutput {
    pub fn code_only(code: String) -> Self {
        Self {
            code,
            dependencies: Vec::new(),
        }
    }
}

/// The transformer contract. Implementations are registered on a preset
/// by name and selected through extension rules.
pub trait Transform {
    fn transform(
        &self,
        input: TransformInput<'_>,
        config: &TransformerConfig,
    ) -> TransformResult<TransformOutput>;
}
