//! JSON transformer: validates the document and exports the value.

use super::transformer::{
    Transform, TransformError, TransformInput, TransformOutput, TransformResult, TransformerConfig,
};

pub struct JsonTransformer;

impl Transform for JsonTransformer {
    fn transform(
        &self,
        input: TransformInput<'_>,
        _config: &TransformerConfig,
    ) -> TransformResult<TransformOutput> {
        let value: serde_json::Value =
            serde_json::from_str(&input.code).map_err(|e| TransformError::Parse {
                path: input.path.to_string(),
                message: e.to_string(),
            })?;

        Ok(TransformOutput::code_only(format!(
            "module.exports = {value};\n"
        )))
    }
}
