use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub call: CallConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP/WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,
    /// JWT secret shared with the identity provider that issues access tokens
    pub jwt_secret: Option<String>,
    /// Maximum WebSocket message size in bytes (snapshots can be large)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Per-session broadcast buffer; slower subscribers skip records beyond this
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Co-browsing capture and rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Minimum interval between pointer move events
    #[serde(default = "default_pointer_throttle_ms")]
    pub pointer_throttle_ms: u64,
    /// Replacement for sensitive field values in the transmitted copy
    #[serde(default = "default_mask_placeholder")]
    pub mask_placeholder: String,
    /// Case-insensitive substrings of `name`/`id` that mark a field as sensitive
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
    /// Attribute the host page sets to force masking of a field
    #[serde(default = "default_mask_attribute")]
    pub mask_attribute: String,
    /// Outline color for highlights authored without an explicit color
    #[serde(default = "default_highlight_color")]
    pub highlight_color: String,
    /// Highlight duration used when a command carries 0
    #[serde(default = "default_highlight_duration_ms")]
    pub highlight_duration_ms: u64,
    /// Drop <script>/<noscript> elements and on* handlers from the transmitted copy
    #[serde(default = "default_true")]
    pub strip_scripts: bool,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default)]
    pub ice: IceConfig,
    /// Transport statistics sampling interval (drives connection quality)
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrently active mirror sessions
    #[serde(default = "default_max_active_mirrors")]
    pub max_active_mirrors: usize,
    /// Maximum concurrently pending or active calls
    #[serde(default = "default_max_active_calls")]
    pub max_active_calls: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            jwt_secret: None,
            max_message_bytes: default_max_message_bytes(),
            channel_capacity: default_channel_capacity(),
            log_format: default_log_format(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            pointer_throttle_ms: default_pointer_throttle_ms(),
            mask_placeholder: default_mask_placeholder(),
            sensitive_patterns: default_sensitive_patterns(),
            mask_attribute: default_mask_attribute(),
            highlight_color: default_highlight_color(),
            highlight_duration_ms: default_highlight_duration_ms(),
            strip_scripts: true,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_mirrors: default_max_active_mirrors(),
            max_active_calls: default_max_active_calls(),
        }
    }
}

impl IceConfig {
    /// ICE servers in the shape handed to peer connections and clients.
    pub fn servers(&self) -> Vec<crate::IceServerInfo> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(crate::IceServerInfo {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(crate::IceServerInfo {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl TandemConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Port ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        // --- Message size ---
        if self.server.max_message_bytes < 65_536 {
            issues.push(format!(
                "ERROR: server.max_message_bytes must be at least 65536, got {}. \
                 Document snapshots routinely exceed smaller limits.",
                self.server.max_message_bytes
            ));
        }

        if self.server.channel_capacity == 0 {
            issues.push("ERROR: server.channel_capacity must be >= 1.".to_string());
        }

        if self.server.log_format != "text" && self.server.log_format != "json" {
            issues.push(format!(
                "ERROR: server.log_format must be \"text\" or \"json\", got \"{}\".",
                self.server.log_format
            ));
        }

        if let Some(secret) = &self.server.jwt_secret
            && secret.len() < 32
        {
            issues.push(format!(
                "WARNING: server.jwt_secret is only {} bytes. Use at least 32 random bytes.",
                secret.len()
            ));
        }

        // --- Mirror ---
        if self.mirror.pointer_throttle_ms > 1000 {
            issues.push(format!(
                "WARNING: mirror.pointer_throttle_ms is {} ms. The agent's cursor will \
                 visibly lag; typical values are 16-100 ms.",
                self.mirror.pointer_throttle_ms
            ));
        }

        if self.mirror.mask_placeholder.is_empty() {
            issues.push(
                "ERROR: mirror.mask_placeholder must not be empty; masked fields would be \
                 indistinguishable from empty ones."
                    .to_string(),
            );
        }

        if self.mirror.mask_attribute.is_empty()
            || !self
                .mirror
                .mask_attribute
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            issues.push(format!(
                "ERROR: mirror.mask_attribute '{}' is not a valid attribute name.",
                self.mirror.mask_attribute
            ));
        }

        for pattern in &self.mirror.sensitive_patterns {
            if pattern.trim().is_empty() {
                issues.push(
                    "WARNING: mirror.sensitive_patterns contains an empty entry. \
                     It would mark every named field as sensitive."
                        .to_string(),
                );
            }
        }

        if self.mirror.highlight_duration_ms == 0 {
            issues.push("ERROR: mirror.highlight_duration_ms must be >= 1.".to_string());
        }

        // --- Call ---
        if self.call.stats_interval_ms < 100 {
            issues.push(format!(
                "ERROR: call.stats_interval_ms must be at least 100, got {}.",
                self.call.stats_interval_ms
            ));
        }

        for url in &self.call.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        for url in &self.call.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        if !self.call.ice.turn_urls.is_empty()
            && (self.call.ice.turn_username.is_none() || self.call.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: call.ice.turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        // --- Session limits ---
        if self.session.max_active_mirrors == 0 {
            issues.push("ERROR: session.max_active_mirrors must be >= 1.".to_string());
        }
        if self.session.max_active_calls == 0 {
            issues.push("ERROR: session.max_active_calls must be >= 1.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8470
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_channel_capacity() -> usize {
    256
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_pointer_throttle_ms() -> u64 {
    50
}
fn default_mask_placeholder() -> String {
    "••••••••".to_string()
}
fn default_sensitive_patterns() -> Vec<String> {
    ["password", "card", "cc-number", "cvv", "cvc", "ssn", "social-security"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_mask_attribute() -> String {
    "data-tandem-mask".to_string()
}
fn default_highlight_color() -> String {
    "#ff6a00".to_string()
}
fn default_highlight_duration_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_stats_interval_ms() -> u64 {
    1000
}
fn default_max_active_mirrors() -> usize {
    512
}
fn default_max_active_calls() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: TandemConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8470);
        assert!(config.server.jwt_secret.is_none());
        assert_eq!(config.server.max_message_bytes, 1024 * 1024);
        assert_eq!(config.server.channel_capacity, 256);
        assert_eq!(config.server.log_format, "text");

        assert_eq!(config.mirror.pointer_throttle_ms, 50);
        assert_eq!(config.mirror.mask_placeholder, "••••••••");
        assert!(config.mirror.sensitive_patterns.iter().any(|p| p == "cvv"));
        assert_eq!(config.mirror.mask_attribute, "data-tandem-mask");
        assert_eq!(config.mirror.highlight_duration_ms, 2000);
        assert!(config.mirror.strip_scripts);

        assert_eq!(config.call.ice.stun_urls.len(), 2);
        assert!(config.call.ice.turn_urls.is_empty());
        assert_eq!(config.call.stats_interval_ms, 1000);

        assert_eq!(config.session.max_active_mirrors, 512);
        assert_eq!(config.session.max_active_calls, 256);
    }

    #[test]
    fn partial_config_only_mirror_section() {
        let toml_str = r#"
[mirror]
pointer_throttle_ms = 16
sensitive_patterns = ["iban"]
"#;
        let config: TandemConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.mirror.pointer_throttle_ms, 16);
        assert_eq!(config.mirror.sensitive_patterns, vec!["iban"]);
        // Remaining fields use defaults
        assert_eq!(config.mirror.mask_attribute, "data-tandem-mask");
        assert_eq!(config.server.port, 8470);
        assert_eq!(config.call.ice.stun_urls.len(), 2);
    }

    #[test]
    fn nested_ice_section() {
        let toml_str = r#"
[call.ice]
stun_urls = ["stun:custom.stun.example.com:3478"]
turn_urls = ["turn:turn.example.com:3478"]
turn_username = "user"
turn_credential = "pass"
"#;
        let config: TandemConfig = toml::from_str(toml_str).expect("ice config");
        assert_eq!(config.call.ice.stun_urls, vec!["stun:custom.stun.example.com:3478"]);
        assert_eq!(config.call.stats_interval_ms, 1000);

        let servers = config.call.ice.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username.as_deref(), Some("user"));
        assert_eq!(servers[1].credential.as_deref(), Some("pass"));
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: TandemConfig = toml::from_str("").expect("default config");
        let from_default = TandemConfig::default();
        assert_eq!(from_default.server.port, from_toml.server.port);
        assert_eq!(
            from_default.mirror.mask_placeholder,
            from_toml.mirror.mask_placeholder
        );
        assert_eq!(
            from_default.mirror.sensitive_patterns,
            from_toml.mirror.sensitive_patterns
        );
        assert_eq!(from_default.call.ice.stun_urls, from_toml.call.ice.stun_urls);
        assert_eq!(
            from_default.session.max_active_calls,
            from_toml.session.max_active_calls
        );
    }

    // --- Validation tests ---

    fn valid_config() -> TandemConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &TandemConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_small_message_limit_is_error() {
        let mut config = valid_config();
        config.server.max_message_bytes = 4096;
        assert!(has_error(&validate_issues(&config), "max_message_bytes"));
    }

    #[test]
    fn validate_unknown_log_format_is_error() {
        let mut config = valid_config();
        config.server.log_format = "xml".to_string();
        assert!(has_error(&validate_issues(&config), "log_format"));
    }

    #[test]
    fn validate_short_jwt_secret_is_warning() {
        let mut config = valid_config();
        config.server.jwt_secret = Some("short".to_string());
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "jwt_secret"));
        assert!(!has_error(&issues, "jwt_secret"));
    }

    #[test]
    fn validate_empty_placeholder_is_error() {
        let mut config = valid_config();
        config.mirror.mask_placeholder.clear();
        assert!(has_error(&validate_issues(&config), "mask_placeholder"));
    }

    #[test]
    fn validate_bad_mask_attribute_is_error() {
        let mut config = valid_config();
        config.mirror.mask_attribute = "data mask".to_string();
        assert!(has_error(&validate_issues(&config), "mask_attribute"));
    }

    #[test]
    fn validate_empty_sensitive_pattern_is_warning() {
        let mut config = valid_config();
        config.mirror.sensitive_patterns.push("  ".to_string());
        assert!(has_warning(&validate_issues(&config), "sensitive_patterns"));
    }

    #[test]
    fn validate_slow_pointer_throttle_is_warning() {
        let mut config = valid_config();
        config.mirror.pointer_throttle_ms = 1500;
        assert!(has_warning(&validate_issues(&config), "pointer_throttle_ms"));
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.call.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_without_credentials_is_warning() {
        let mut config = valid_config();
        config.call.ice.turn_urls = vec!["turns:turn.example.com:5349".to_string()];
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "turn_username"));
        assert!(!has_error(&issues, "TURN URL"));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.port = 0;
        config.session.max_active_mirrors = 0;
        config.session.max_active_calls = 0;
        let issues = validate_issues(&config);
        assert!(
            issues.len() >= 3,
            "expected at least 3 errors, got {}: {:?}",
            issues.len(),
            issues
        );
    }
}
