//! Vendor router — selects the vendor whose model patterns match a request.
//!
//! Patterns are globs (`claude-*`, `gpt-4?-*`). Vendors are consulted in
//! registration order and the first match wins; an unmatched model is an
//! error, never a silent fallback.

use async_trait::async_trait;
use parley_config::{BotConfig, VendorKind};
use parley_core::error::VendorError;
use parley_core::{LlmCompletion, LlmRequest, TransformMode, Vendor};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::anthropic::AnthropicVendor;
use crate::openai_compat::OpenAiCompatVendor;

struct Route {
    regex: Regex,
    vendor: Arc<dyn Vendor>,
}

/// Routes LLM requests to the vendor serving the requested model.
pub struct VendorRouter {
    routes: Vec<Route>,
    patterns: Vec<String>,
}

impl VendorRouter {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Register a vendor under each of its model patterns.
    pub fn register(&mut self, vendor: Arc<dyn Vendor>) -> Result<(), VendorError> {
        for pattern in vendor.model_patterns() {
            let regex = glob_to_regex(pattern).map_err(|e| {
                VendorError::InvalidResponse(format!("bad model pattern '{pattern}': {e}"))
            })?;
            self.patterns.push(pattern.clone());
            self.routes.push(Route {
                regex,
                vendor: Arc::clone(&vendor),
            });
        }
        Ok(())
    }

    /// Find the vendor for a model name.
    pub fn resolve(&self, model: &str) -> Result<Arc<dyn Vendor>, VendorError> {
        self.routes
            .iter()
            .find(|r| r.regex.is_match(model))
            .map(|r| Arc::clone(&r.vendor))
            .ok_or_else(|| VendorError::NoVendorForModel(model.to_string()))
    }

    /// Names of registered vendors, in registration order, deduplicated.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for route in &self.routes {
            let name = route.vendor.name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

impl Default for VendorRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Vendor for VendorRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn model_patterns(&self) -> &[String] {
        &self.patterns
    }

    fn max_stop_sequences(&self, model: &str) -> Option<usize> {
        self.resolve(model).ok()?.max_stop_sequences(model)
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, VendorError> {
        let vendor = self.resolve(&request.model)?;
        if request.mode == TransformMode::Prefill && !vendor.supports_prefill() {
            return Err(VendorError::UnsupportedMode {
                vendor: vendor.name().to_string(),
                mode: request.mode.to_string(),
            });
        }
        debug!(vendor = vendor.name(), model = %request.model, "Routing request");
        vendor.complete(request).await
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Build the vendor catalogue from configuration.
///
/// Vendors register in alphabetical order of name, so with overlapping
/// patterns the alphabetically first vendor wins. With no `[vendors]`
/// configured, Anthropic serves `claude-*`.
pub fn build_from_config(config: &BotConfig) -> Result<VendorRouter, VendorError> {
    let mut router = VendorRouter::new();

    for (name, vendor_config) in &config.vendors {
        let api_key = vendor_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();

        let vendor: Arc<dyn Vendor> = match vendor_config.kind {
            VendorKind::Anthropic => {
                let mut v = AnthropicVendor::new(&api_key).with_models(vendor_config.models.clone());
                if let Some(url) = &vendor_config.api_url {
                    v = v.with_base_url(url);
                }
                Arc::new(v.with_name(name))
            }
            VendorKind::OpenaiCompat => {
                let base_url = vendor_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| default_base_url(name));
                Arc::new(
                    OpenAiCompatVendor::new(name, &base_url, &api_key)
                        .with_models(vendor_config.models.clone()),
                )
            }
        };
        router.register(vendor)?;
    }

    if config.vendors.is_empty() {
        let api_key = config.api_key.clone().unwrap_or_default();
        router.register(Arc::new(
            AnthropicVendor::new(&api_key).with_models(vec!["claude-*".into()]),
        ))?;
    }

    Ok(router)
}

/// Get the default base URL for well-known OpenAI-compatible vendors.
fn default_base_url(vendor_name: &str) -> String {
    match vendor_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        _ => "https://api.openai.com/v1".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedVendor {
        name: String,
        patterns: Vec<String>,
        prefill: bool,
    }

    impl NamedVendor {
        fn new(name: &str, patterns: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                patterns: patterns.iter().map(|p| p.to_string()).collect(),
                prefill: true,
            })
        }
    }

    #[async_trait]
    impl Vendor for NamedVendor {
        fn name(&self) -> &str {
            &self.name
        }
        fn model_patterns(&self) -> &[String] {
            &self.patterns
        }
        fn supports_prefill(&self) -> bool {
            self.prefill
        }
        fn max_stop_sequences(&self, _model: &str) -> Option<usize> {
            Some(4)
        }
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmCompletion, VendorError> {
            Ok(LlmCompletion::text(self.name.clone()))
        }
    }

    #[test]
    fn glob_matching() {
        let re = glob_to_regex("claude-*").unwrap();
        assert!(re.is_match("claude-sonnet-4"));
        assert!(!re.is_match("xclaude-sonnet"));
        let re = glob_to_regex("gpt-4?").unwrap();
        assert!(re.is_match("gpt-4o"));
        assert!(!re.is_match("gpt-4o-mini"));
        let re = glob_to_regex("meta.llama").unwrap();
        assert!(!re.is_match("metaxllama"));
    }

    #[test]
    fn first_match_wins() {
        let mut router = VendorRouter::new();
        router.register(NamedVendor::new("first", &["claude-*"])).unwrap();
        router.register(NamedVendor::new("second", &["*"])).unwrap();
        assert_eq!(router.resolve("claude-opus").unwrap().name(), "first");
        assert_eq!(router.resolve("gpt-4o").unwrap().name(), "second");
        assert_eq!(router.list(), vec!["first", "second"]);
    }

    #[test]
    fn unmatched_model_fails_loudly() {
        let mut router = VendorRouter::new();
        router.register(NamedVendor::new("anthropic", &["claude-*"])).unwrap();
        let err = router.resolve("gpt-4o").err().unwrap();
        assert!(matches!(err, VendorError::NoVendorForModel(m) if m == "gpt-4o"));
    }

    #[tokio::test]
    async fn routes_completion_and_stop_cap() {
        let mut router = VendorRouter::new();
        router.register(NamedVendor::new("anthropic", &["claude-*"])).unwrap();
        let req = LlmRequest::new("claude-haiku", "Parley");
        let completion = router.complete(&req).await.unwrap();
        assert_eq!(completion.text_content(), "anthropic");
        assert_eq!(router.max_stop_sequences("claude-haiku"), Some(4));
        assert_eq!(router.max_stop_sequences("other"), None);
    }

    #[tokio::test]
    async fn prefill_rejected_for_chat_only_vendor() {
        let mut router = VendorRouter::new();
        router
            .register(Arc::new(NamedVendor {
                name: "chatonly".into(),
                patterns: vec!["*".into()],
                prefill: false,
            }))
            .unwrap();
        let req = LlmRequest::new("any", "Parley");
        let err = router.complete(&req).await.unwrap_err();
        assert!(matches!(err, VendorError::UnsupportedMode { .. }));

        let chat = LlmRequest::new("any", "Parley").with_mode(TransformMode::Chat);
        assert!(router.complete(&chat).await.is_ok());
    }

    #[test]
    fn build_default_catalogue() {
        let router = build_from_config(&BotConfig::default()).unwrap();
        assert_eq!(router.resolve("claude-sonnet-4").unwrap().name(), "anthropic");
    }

    #[test]
    fn overlapping_patterns_resolve_alphabetically() {
        let config: BotConfig = toml::from_str(
            r#"
[vendors.zeta]
kind = "openai_compat"
models = ["*"]

[vendors.alpha]
kind = "openai_compat"
models = ["*"]
"#,
        )
        .unwrap();
        let router = build_from_config(&config).unwrap();
        assert_eq!(router.list(), vec!["alpha", "zeta"]);
        assert_eq!(router.resolve("any-model").unwrap().name(), "alpha");
    }

    #[test]
    fn build_from_vendor_sections() {
        let config: BotConfig = toml::from_str(
            r#"
[vendors.openrouter]
kind = "openai_compat"
models = ["meta-*", "qwen-*"]

[vendors.anthropic]
kind = "anthropic"
models = ["claude-*"]
"#,
        )
        .unwrap();
        let router = build_from_config(&config).unwrap();
        assert_eq!(router.resolve("qwen-72b").unwrap().name(), "openrouter");
        assert_eq!(router.resolve("claude-3").unwrap().name(), "anthropic");
    }
}
