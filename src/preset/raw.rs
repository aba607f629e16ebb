//! Raw transformer: exports the file text verbatim. Used for HTML and
//! any other asset the preset routes here.

use super::transformer::{
    Transform, TransformError, TransformInput, TransformOutput, TransformResult, TransformerConfig,
};

pub struct RawTransformer;

impl Transform for RawTransformer {
    fn transform(
        &self,
        input: TransformInput<'_>,
        _config: &TransformerConfig,
    ) -> TransformResult<TransformOutput> {
        let literal = serde_json::to_string(&input.code).map_err(|e| TransformError::Transform {
            path: input.path.to_string(),
            message: e.to_string(),
        })?;
        Ok(TransformOutput::code_only(format!(
            "module.exports = {literal};\n"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_the_text() {
        let out = RawTransformer
            .transform(
                TransformInput {
                    path: "/index.html",
                    code: "<h1>hi</h1>".to_string(),
                },
                &TransformerConfig::Raw,
            )
            .unwrap();
        assert_eq!(out.code, "module.exports = \"<h1>hi</h1>\";\n");
    }
}
