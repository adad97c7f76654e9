// 配置读取与覆盖合并，保持与 YAML 配置格式兼容。
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    pub dsn: String,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    /// direct 或 proxy；空值按 direct 处理。
    #[serde(default)]
    pub transport: String,
    /// proxy 模式使用的本地转发代理地址，如 socks5h://127.0.0.1:1055。
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub timeout_s: u64,
}

impl RelayConfig {
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint
            .as_ref()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    // 统一归一化共享密钥，避免空白字符导致校验误判。
    pub fn secret(&self) -> Option<String> {
        let inline = self
            .secret
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(value) = inline {
            if value.starts_with("${") && value.ends_with('}') {
                return env::var("WARBLE_RELAY_SECRET")
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty());
            }
            return Some(value.to_string());
        }
        env::var("WARBLE_RELAY_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_url
            .as_ref()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn load_config() -> Config {
    // 读取基础配置与覆盖配置，优先使用覆盖内容。
    let base_path =
        env::var("WARBLE_CONFIG_PATH").unwrap_or_else(|_| "config/warble.yaml".to_string());
    let override_path = env::var("WARBLE_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| "data/config/warble.override.yaml".to_string());

    let mut merged = read_yaml(&base_path);
    if Path::new(&override_path).exists() {
        let override_value = read_yaml(&override_path);
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，避免开发环境首次启动失败。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            // 递归合并 Mapping，保留原始层级结构。
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("WARBLE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${WARBLE_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${WARBLE_TEST_PLACEHOLDER:-d}-suffix"),
            "prefix-d-suffix"
        );

        std::env::set_var("WARBLE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("${WARBLE_TEST_PLACEHOLDER:-default}"),
            "value"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${WARBLE_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("WARBLE_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${WARBLE_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn relay_secret_prefers_inline_value() {
        std::env::remove_var("WARBLE_RELAY_SECRET");
        let config = RelayConfig {
            secret: Some("  s3cret  ".to_string()),
            ..RelayConfig::default()
        };
        assert_eq!(config.secret().as_deref(), Some("s3cret"));

        let config = RelayConfig::default();
        assert_eq!(config.secret(), None);

        std::env::set_var("WARBLE_RELAY_SECRET", "env-secret");
        assert_eq!(config.secret().as_deref(), Some("env-secret"));
        std::env::remove_var("WARBLE_RELAY_SECRET");
    }
}
