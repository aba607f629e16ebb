//! CSS transformer: wraps a stylesheet in JS that appends a `<style>`
//! element when a DOM exists and exports the text either way.

use super::transformer::{
    Transform, TransformError, TransformInput, TransformOutput, TransformResult, TransformerConfig,
};

pub struct CssTransformer;

impl Transform for CssTransformer {
    fn transform(
        &self,
        input: TransformInput<'_>,
        config: &TransformerConfig,
    ) -> TransformResult<TransformOutput> {
        let config = match config {
            TransformerConfig::Css(config) => config,
            _ => {
                return Err(TransformError::Transform {
                    path: input.path.to_string(),
                    message: "css transformer received a foreign config".to_string(),
                })
            }
        };

        let literal = serde_json::to_string(&input.code).map_err(|e| TransformError::Transform {
            path: input.path.to_string(),
            message: e.to_string(),
        })?;

        let code = if config.text_only {
            format!("module.exports = {literal};\n")
        } else {
            format!(
                "var css = {literal};\n\
                 if (typeof document !== \"undefined\") {{\n\
                 \tvar style = document.createElement(\"style\");\n\
                 \tstyle.setAttribute(\"type\", \"text/css\");\n\
                 \tstyle.appendChild(document.createTextNode(css));\n\
                 \tdocument.head.appendChild(style);\n\
                 }}\n\
                 module.exports = css;\n"
            )
        };

        Ok(TransformOutput::code_only(code))
    }
}
