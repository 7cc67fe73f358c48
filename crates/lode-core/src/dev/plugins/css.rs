//! Stylesheets served as JS modules that inject a `<style>` tag.

use super::resolve::file_to_url;
use crate::dev::hmr::CLIENT_PUBLIC_PATH;
use crate::dev::plugin::{HookResult, LoadResult, Plugin, PluginContext, PluginError, TransformResult};
use crate::dev::url::{clean_url, is_css_request, is_import_request};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct CssPlugin;

/// JS module that applies `css` and replaces it in place on update.
///
/// `owner` is the url the module is served under; it keys both the style
/// tag and the hot context.
fn create_css_module(css: &str, owner: &str) -> String {
    let css = serde_json::Value::String(css.to_string()).to_string();
    let owner = serde_json::Value::String(owner.to_string()).to_string();

    format!(
        r#"import {{ createHotContext, updateStyle, removeStyle }} from "{CLIENT_PUBLIC_PATH}";
import.meta.hot = createHotContext({owner});
const id = {owner};
const css = {css};
updateStyle(id, css);
import.meta.hot.accept();
import.meta.hot.prune(() => removeStyle(id));
export default css;
"#
    )
}

#[async_trait]
impl Plugin for CssPlugin {
    fn name(&self) -> &str {
        "lode:css"
    }

    async fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        if id.starts_with('\0') || !is_css_request(id) {
            return Ok(None);
        }
        let path = clean_url(id);
        let css = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PluginError::new(self.name(), "load", format!("{path}: {e}")))?;
        Ok(Some(LoadResult::code(css)))
    }

    async fn transform(
        &self,
        code: &str,
        id: &str,
        ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if id.starts_with('\0') || !is_css_request(id) {
            return Ok(None);
        }

        let mut owner = file_to_url(&ctx.root, Path::new(clean_url(id)));
        if is_import_request(id) {
            owner.push_str("?import");
        }

        Ok(Some(TransformResult {
            code: create_css_module(code, &owner),
            map: None,
            imported_urls: Some(Vec::new()),
            accepted_urls: Some(Vec::new()),
            self_accepting: Some(true),
        }))
    }
}
