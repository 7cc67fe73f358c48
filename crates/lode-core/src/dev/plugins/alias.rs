//! Import aliases (`@/components/Button` -> `/src/components/Button`).

use super::resolve::{find_file, url_to_file};
use crate::dev::plugin::{HookResult, Plugin, PluginContext, ResolveIdResult};
use crate::paths::normalize_path;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Maps aliased specifiers to root-relative targets.
#[derive(Debug, Default, Clone)]
pub struct AliasPlugin {
    /// Longest alias first so `@lib` wins over `@`.
    aliases: Vec<(String, String)>,
}

impl AliasPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the config `alias` map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        map.iter()
            .fold(Self::new(), |plugin, (from, to)| plugin.alias(from, to))
    }

    /// Add an alias.
    pub fn alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.push((from.into(), to.into()));
        self.aliases
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self
    }

    /// Replace the aliased prefix of `specifier`, if any alias matches.
    ///
    /// An alias matches the whole specifier or a prefix followed by `/`.
    #[must_use]
    pub fn apply(&self, specifier: &str) -> Option<String> {
        self.aliases.iter().find_map(|(from, to)| {
            if specifier == from {
                return Some(to.clone());
            }
            specifier
                .strip_prefix(from.as_str())
                .filter(|rest| rest.starts_with('/'))
                .map(|rest| format!("{}{rest}", to.trim_end_matches('/')))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[async_trait]
impl Plugin for AliasPlugin {
    fn name(&self) -> &str {
        "lode:alias"
    }

    async fn resolve_id(
        &self,
        specifier: &str,
        _importer: Option<&str>,
        ctx: &PluginContext,
    ) -> HookResult<Option<ResolveIdResult>> {
        let Some(target) = self.apply(specifier) else {
            return Ok(None);
        };
        let target = target.trim_start_matches('.');
        let resolved = find_file(&url_to_file(&ctx.root, target))
            .map(|file| ResolveIdResult::resolved(normalize_path(&file)));
        Ok(resolved)
    }
}
