//! Global identifier replacement (`define` in the config).

use crate::dev::plugin::{HookResult, Plugin, PluginContext, TransformResult};
use crate::dev::url::{clean_url, is_js_request};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Replaces identifiers such as `__DEV__` or `process.env.NODE_ENV` in JS
/// modules with literal values.
#[derive(Debug, Default, Clone)]
pub struct DefinePlugin {
    /// Longest key first so `process.env.NODE_ENV` is not clobbered by a
    /// shorter overlapping key.
    replacements: Vec<(String, String)>,
}

impl DefinePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the config `define` map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        map.iter()
            .fold(Self::new(), |plugin, (from, to)| plugin.replace(from, to))
    }

    /// Add a replacement.
    pub fn replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replacements.push((from.into(), to.into()));
        self.replacements
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self
    }

    /// Replace `process.env.KEY` with the quoted value.
    pub fn env(self, key: &str, value: impl Into<String>) -> Self {
        let value = serde_json::Value::String(value.into()).to_string();
        self.replace(format!("process.env.{key}"), value)
    }
}

#[async_trait]
impl Plugin for DefinePlugin {
    fn name(&self) -> &str {
        "lode:define"
    }

    async fn transform(
        &self,
        code: &str,
        id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if self.replacements.is_empty() || id.starts_with('\0') || !is_js_request(clean_url(id)) {
            return Ok(None);
        }

        let mut result = code.to_string();
        let mut changed = false;
        for (from, to) in &self.replacements {
            if result.contains(from.as_str()) {
                result = result.replace(from.as_str(), to);
                changed = true;
            }
        }

        Ok(changed.then(|| TransformResult::code(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_define_replaces_identifiers() {
        let plugin = DefinePlugin::new()
            .replace("__DEV__", "false")
            .env("NODE_ENV", "development");

        let code = "if (__DEV__) { log(); }\nconst env = process.env.NODE_ENV;";
        let result = plugin
            .transform(code, "/p/src/main.ts", &PluginContext::default())
            .await
            .unwrap()
            .unwrap();

        assert!(result.code.contains("if (false)"));
        assert!(result.code.contains(r#"const env = "development";"#));
    }

    #[tokio::test]
    async fn test_define_skips_non_js_and_unchanged() {
        let plugin = DefinePlugin::from_map(&BTreeMap::from([("__DEV__".to_string(), "true".to_string())]));
        let ctx = PluginContext::default();

        assert!(plugin.transform("a { }", "/p/a.css", &ctx).await.unwrap().is_none());
        assert!(plugin.transform("const x = 1;", "/p/a.js", &ctx).await.unwrap().is_none());
    }
}
