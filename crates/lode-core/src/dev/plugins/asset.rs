//! Static assets imported from JS (`import logo from './logo.svg'`).
//!
//! The module's default export is the asset's url; the file itself is
//! served by the static file handler.

use super::resolve::file_to_url;
use crate::dev::plugin::{HookResult, LoadResult, Plugin, PluginContext};
use crate::dev::url::{clean_url, is_css_request, is_import_request, is_js_request};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct AssetPlugin;

#[async_trait]
impl Plugin for AssetPlugin {
    fn name(&self) -> &str {
        "lode:asset"
    }

    async fn load(&self, id: &str, ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        let path = clean_url(id);
        if id.starts_with('\0')
            || !is_import_request(id)
            || is_js_request(path)
            || is_css_request(path)
            || path.ends_with(".json")
        {
            return Ok(None);
        }

        let url = file_to_url(&ctx.root, Path::new(path));
        let url = serde_json::Value::String(url).to_string();
        Ok(Some(LoadResult::code(format!("export default {url};"))))
    }
}
