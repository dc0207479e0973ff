/// Environment inputs recognized by the SDK core.
///
/// All values are optional; the engine and clients degrade to sensible
/// defaults when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the Executor API base URL.
    pub api_base_url: Option<String>,
    /// Dev-server host override, used when no API base URL is set.
    pub dev_server_url: Option<String>,
    /// Primary request-signing key.
    pub signing_key: Option<String>,
    /// Fallback signing key honored during key rotation.
    pub signing_key_fallback: Option<String>,
    /// Disables the ambient per-run context accessor.
    pub ambient_context_disabled: bool,
}

pub const ENV_API_BASE_URL: &str = "KEEL_API_BASE_URL";
pub const ENV_DEV_SERVER_URL: &str = "KEEL_DEV_SERVER_URL";
pub const ENV_SIGNING_KEY: &str = "KEEL_SIGNING_KEY";
pub const ENV_SIGNING_KEY_FALLBACK: &str = "KEEL_SIGNING_KEY_FALLBACK";
pub const ENV_DISABLE_AMBIENT_CONTEXT: &str = "KEEL_DISABLE_AMBIENT_CONTEXT";

/// Default dev-server address when nothing is configured.
pub const DEFAULT_DEV_SERVER_URL: &str = "http://127.0.0.1:8288";

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup, mainly for tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            api_base_url: non_empty(ENV_API_BASE_URL),
            dev_server_url: non_empty(ENV_DEV_SERVER_URL),
            signing_key: non_empty(ENV_SIGNING_KEY),
            signing_key_fallback: non_empty(ENV_SIGNING_KEY_FALLBACK),
            ambient_context_disabled: lookup(ENV_DISABLE_AMBIENT_CONTEXT)
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
        }
    }

    /// The base URL clients should talk to: explicit API override first,
    /// then the dev server, then the default dev-server address.
    pub fn resolve_base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .or(self.dev_server_url.as_deref())
            .unwrap_or(DEFAULT_DEV_SERVER_URL)
    }

    /// Signing keys in verification order (primary, then fallback).
    pub fn signing_keys(&self) -> Vec<&str> {
        self.signing_key
            .iter()
            .chain(self.signing_key_fallback.iter())
            .map(String::as_str)
            .collect()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
