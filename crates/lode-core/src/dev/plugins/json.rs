//! JSON files as ES modules.

use crate::dev::plugin::{HookResult, Plugin, PluginContext, PluginError, TransformResult};
use crate::dev::url::clean_url;
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPlugin;

#[async_trait]
impl Plugin for JsonPlugin {
    fn name(&self) -> &str {
        "lode:json"
    }

    async fn transform(
        &self,
        code: &str,
        id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if !clean_url(id).ends_with(".json") {
            return Ok(None);
        }

        // Reject malformed JSON here rather than as a syntax error in the browser.
        serde_json::from_str::<serde_json::Value>(code)
            .map_err(|e| PluginError::new(self.name(), "transform", format!("{id}: {e}")))?;

        Ok(Some(TransformResult {
            code: format!("export default {};", code.trim()),
            map: None,
            imported_urls: Some(Vec::new()),
            accepted_urls: None,
            self_accepting: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_to_module() {
        let ctx = PluginContext::default();
        let result = JsonPlugin
            .transform("{\"name\": \"app\"}\n", "/p/package.json?import", &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.code, r#"export default {"name": "app"};"#);

        assert!(JsonPlugin.transform("x", "/p/a.js", &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let err = JsonPlugin
            .transform("{ nope", "/p/bad.json", &PluginContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.plugin, "lode:json");
        assert_eq!(err.hook, "transform");
    }
}
