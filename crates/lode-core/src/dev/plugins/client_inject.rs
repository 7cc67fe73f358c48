//! Serves the HMR client runtime and injects it into the entry document.

use crate::dev::hmr::{HmrEngine, CLIENT_PUBLIC_PATH};
use crate::dev::plugin::{HookResult, LoadResult, Plugin, PluginContext, ResolveIdResult};
use async_trait::async_trait;

/// Module id of the client runtime. Not a file.
pub const CLIENT_ID: &str = "\0lode:client";

#[derive(Debug, Clone, Copy)]
pub struct ClientInjectPlugin {
    hmr_port: u16,
}

impl ClientInjectPlugin {
    pub fn new(hmr_port: u16) -> Self {
        Self { hmr_port }
    }

    fn script_tag() -> String {
        format!(r#"<script type="module" src="{CLIENT_PUBLIC_PATH}"></script>"#)
    }
}

#[async_trait]
impl Plugin for ClientInjectPlugin {
    fn name(&self) -> &str {
        "lode:client-inject"
    }

    async fn resolve_id(
        &self,
        url: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<Option<ResolveIdResult>> {
        Ok((url == CLIENT_PUBLIC_PATH).then(|| ResolveIdResult::resolved(CLIENT_ID)))
    }

    async fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        Ok((id == CLIENT_ID).then(|| LoadResult::code(HmrEngine::client_runtime(self.hmr_port))))
    }

    async fn transform_index_html(&self, html: &str) -> HookResult<Option<String>> {
        if html.contains(CLIENT_PUBLIC_PATH) {
            return Ok(None);
        }
        let tag = Self::script_tag();

        let injected = match html.find("<head>") {
            Some(idx) => {
                let at = idx + "<head>".len();
                format!("{}\n    {tag}{}", &html[..at], &html[at..])
            }
            None => format!("{tag}\n{html}"),
        };
        Ok(Some(injected))
    }
}
