//! Presets and the transformer registry.
//!
//! A preset bundles everything template-specific: default entry points,
//! the default HTML document, the registered transformers, the
//! extension rules selecting a transform chain per file, dependency
//! augmentation and whether HMR is enabled.

pub mod css;
pub mod ecmascript;
pub mod json;
pub mod raw;
pub mod transformer;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::fs::path as vpath;
use crate::registry::DependencySet;

pub use transformer::{
    CssConfig, EcmascriptConfig, JsxMode, Transform, TransformError, TransformInput,
    TransformOutput, TransformResult, TransformerConfig,
};

use css::CssTransformer;
use ecmascript::EcmascriptTransformer;
use json::JsonTransformer;
use raw::RawTransformer;

/// An implementation-provided module evaluated before the user entry on
/// first load.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeModule {
    pub path: &'static str,
    pub source: &'static str,
}

/// Core runtime shared by all presets: installs `globalThis.process`.
const CORE_RUNTIME: RuntimeModule = RuntimeModule {
    path: "/.terrarium/runtime.js",
    source: include_str!("js/runtime.js"),
};

struct Rule {
    extensions: &'static [&'static str],
    chain: Vec<(&'static str, TransformerConfig)>,
}

/// A named configuration bundle for one target framework.
pub struct Preset {
    name: &'static str,
    entry_candidates: &'static [&'static str],
    default_html: &'static str,
    hmr_enabled: bool,
    transformers: FxHashMap<&'static str, Box<dyn Transform>>,
    rules: Vec<Rule>,
    runtime_modules: Vec<RuntimeModule>,
    augmented_dependencies: &'static [(&'static str, &'static str)],
}

impl Preset {
    /// Look up the preset for a template name. Unknown templates fall
    /// back to `vanilla`.
    pub fn for_template(template: &str) -> Preset {
        match template {
            "react" => Self::react(),
            "vanilla" => Self::vanilla(),
            other => {
                debug!(template = other, "unknown template, using vanilla");
                Self::vanilla()
            }
        }
    }

    pub fn vanilla() -> Preset {
        let mut preset = Preset::base("vanilla");
        preset.hmr_enabled = false;
        preset.entry_candidates = &[
            "/index.js",
            "/src/index.js",
            "/index.ts",
            "/src/index.ts",
            "/index.tsx",
            "/src/index.tsx",
            "/index.jsx",
            "/src/index.jsx",
        ];
        preset.default_html = "<!DOCTYPE html>\n<html>\n  <head></head>\n  <body>\n    <script src=\"index.js\"></script>\n  </body>\n</html>\n";
        preset.add_rule(
            &[".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx"],
            vec![(
                "ecmascript",
                TransformerConfig::Ecmascript(EcmascriptConfig::default()),
            )],
        );
        preset
    }

    pub fn react() -> Preset {
        let mut preset = Preset::base("react");
        preset.hmr_enabled = true;
        preset.entry_candidates = &[
            "/src/index.js",
            "/src/index.tsx",
            "/src/index.ts",
            "/src/index.jsx",
            "/index.js",
            "/index.tsx",
        ];
        preset.default_html = "<!DOCTYPE html>\n<html>\n  <head></head>\n  <body>\n    <div id=\"root\"></div>\n  </body>\n</html>\n";
        preset.augmented_dependencies = &[("react", "^18.2.0"), ("react-dom", "^18.2.0")];
        preset.add_rule(
            &[".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx"],
            vec![(
                "ecmascript",
                TransformerConfig::Ecmascript(EcmascriptConfig {
                    jsx_mode: JsxMode::Automatic,
                    jsx_import_source: Some("react".to_string()),
                    ..EcmascriptConfig::default()
                }),
            )],
        );
        preset
    }

    fn base(name: &'static str) -> Preset {
        let mut preset = Preset {
            name,
            entry_candidates: &[],
            default_html: "",
            hmr_enabled: false,
            transformers: FxHashMap::default(),
            rules: Vec::new(),
            runtime_modules: vec![CORE_RUNTIME],
            augmented_dependencies: &[],
        };
        preset.register_transformer("ecmascript", Box::new(EcmascriptTransformer));
        preset.register_transformer("css", Box::new(CssTransformer));
        preset.register_transformer("json", Box::new(JsonTransformer));
        preset.register_transformer("raw", Box::new(RawTransformer));
        preset.add_rule(
            &[".css"],
            vec![("css", TransformerConfig::Css(CssConfig::default()))],
        );
        preset.add_rule(&[".json"], vec![("json", TransformerConfig::Json)]);
        preset.add_rule(&[".html", ".htm", ".txt", ".svg"], vec![("raw", TransformerConfig::Raw)]);
        preset
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hmr_enabled(&self) -> bool {
        self.hmr_enabled
    }

    pub fn entry_candidates(&self) -> &'static [&'static str] {
        self.entry_candidates
    }

    pub fn default_html(&self) -> &'static str {
        self.default_html
    }

    pub fn runtime_modules(&self) -> &[RuntimeModule] {
        &self.runtime_modules
    }

    pub fn register_transformer(&mut self, name: &'static str, transformer: Box<dyn Transform>) {
        self.transformers.insert(name, transformer);
    }

    pub fn add_rule(
        &mut self,
        extensions: &'static [&'static str],
        chain: Vec<(&'static str, TransformerConfig)>,
    ) {
        self.rules.push(Rule { extensions, chain });
    }

    /// The ordered transform chain for a file, selected by extension.
    pub fn map_transformers(
        &self,
        path: &str,
    ) -> TransformResult<Vec<(&'static str, TransformerConfig)>> {
        let extension = vpath::extension(path).unwrap_or("");
        // Later rules win, so a preset can override the base routing.
        for rule in self.rules.iter().rev() {
            if rule.extensions.contains(&extension) {
                return Ok(rule.chain.clone());
            }
        }
        Err(TransformError::UnsupportedFile {
            path: path.to_string(),
        })
    }

    /// Run the file's transform chain: each transformer's output feeds
    /// the next one, and the union of discovered dependencies becomes
    /// the module's dependency set.
    pub fn transform(&self, path: &str, source: String) -> TransformResult<TransformOutput> {
        let chain = self.map_transformers(path)?;
        let mut code = source;
        let mut dependencies: Vec<String> = Vec::new();

        for (name, config) in &chain {
            let transformer =
                self.transformers
                    .get(name)
                    .ok_or_else(|| TransformError::UnknownTransformer {
                        name: (*name).to_string(),
                        path: path.to_string(),
                    })?;
            let output = transformer.transform(TransformInput { path, code }, config)?;
            code = output.code;
            for dependency in output.dependencies {
                if !dependencies.contains(&dependency) {
                    dependencies.push(dependency);
                }
            }
        }

        Ok(TransformOutput { code, dependencies })
    }

    /// Inject the framework packages the preset depends on, without
    /// overriding user-pinned versions.
    pub fn augment_dependencies(&self, dependencies: &mut DependencySet) {
        for (name, version) in self.augmented_dependencies {
            dependencies
                .entry((*name).to_string())
                .or_insert_with(|| (*version).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_rules_select_chains() {
        let preset = Preset::vanilla();
        let chain = preset.map_transformers("/src/app.tsx").unwrap();
        assert_eq!(chain[0].0, "ecmascript");

        let chain = preset.map_transformers("/styles/site.css").unwrap();
        assert_eq!(chain[0].0, "css");

        assert!(matches!(
            preset.map_transformers("/logo.png"),
            Err(TransformError::UnsupportedFile { .. })
        ));
    }

    #[test]
    fn transform_runs_the_chain_and_collects_dependencies() {
        let preset = Preset::vanilla();
        let out = preset
            .transform("/index.js", "import a from \"./a\";\nconsole.log(a);".into())
            .unwrap();
        assert!(out.code.contains("require(\"./a\")"));
        assert_eq!(out.dependencies, vec!["./a".to_string()]);
    }

    #[test]
    fn react_preset_augments_framework_packages() {
        let preset = Preset::react();
        let mut deps = DependencySet::new();
        deps.insert("react".into(), "17.0.0".into());
        preset.augment_dependencies(&mut deps);

        assert_eq!(deps.get("react").map(String::as_str), Some("17.0.0"));
        assert_eq!(deps.get("react-dom").map(String::as_str), Some("^18.2.0"));
    }

    #[test]
    fn vanilla_disables_hmr_react_enables_it() {
        assert!(!Preset::vanilla().hmr_enabled());
        assert!(Preset::react().hmr_enabled());
        assert_eq!(Preset::for_template("unknown").name(), "vanilla");
    }
}
