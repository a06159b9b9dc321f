//! Configuration management for the Vassago CLI.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Command-line arguments
//! 2. Environment variables (`VASSAGO_*`, `__` separates sections)
//! 3. Config file (~/.config/vassago/config.toml)
//! 4. Default values
//!
//! `OPENROUTER_API_KEY` is also honored for the provider key.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use vassago_knowledge::{ChromaConfig, ChunkerConfig, IngestionConfig, OpenRouterConfig, RetrievalConfig};
use vassago_server::ServerConfig;

/// CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding and completion provider.
    pub provider: ProviderSection,
    /// Vector store.
    pub store: StoreSection,
    /// Chunk sizing.
    pub chunking: ChunkerConfig,
    /// Ingestion concurrency and retries.
    pub ingestion: IngestionConfig,
    /// Retrieval and prompt assembly.
    pub retrieval: RetrievalConfig,
    /// Embedding cache.
    pub cache: CacheSection,
    /// HTTP server.
    pub server: ServerSection,
    /// Logging and tracing.
    pub telemetry: TelemetrySection,
}

/// Which provider backs embeddings and completions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    /// OpenRouter when an API key is configured, otherwise the offline mock.
    #[default]
    Auto,
    /// Always OpenRouter.
    OpenRouter,
    /// Offline deterministic embedder and echo generator.
    Mock,
}

/// Provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Backend selection.
    pub backend: ProviderBackend,
    /// OpenRouter connection.
    pub openrouter: OpenRouterConfig,
    /// Dimension of the mock embedder.
    pub mock_dimension: usize,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            backend: ProviderBackend::Auto,
            openrouter: OpenRouterConfig::default(),
            mock_dimension: 384,
        }
    }
}

impl ProviderSection {
    /// Resolves `Auto` against the configured API key.
    #[must_use]
    pub fn effective_backend(&self) -> ProviderBackend {
        match self.backend {
            ProviderBackend::Auto if self.openrouter.api_key.trim().is_empty() => {
                ProviderBackend::Mock
            }
            ProviderBackend::Auto => ProviderBackend::OpenRouter,
            other => other,
        }
    }
}

/// Which vector store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; contents are lost on exit.
    #[default]
    Memory,
    /// Chroma server.
    Chroma,
}

/// Vector store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Backend selection.
    pub backend: StoreBackend,
    /// Chroma connection.
    pub chroma: ChromaConfig,
}

/// Embedding cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Wrap the embedder in a cache.
    pub enabled: bool,
    /// Maximum cached embeddings. When full, an arbitrary entry is evicted to admit
    /// a new one; `0` disables caching.
    pub capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable permissive CORS.
    pub cors: bool,
    /// Deadline for each ingestion or answer request.
    pub request_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors: true,
            request_timeout_secs: 60,
        }
    }
}

impl ServerSection {
    /// Builds the server config.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn to_server_config(&self) -> Result<ServerConfig, std::net::AddrParseError> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(ServerConfig::builder()
            .addr(addr)
            .cors(self.cors)
            .request_timeout(Duration::from_secs(self.request_timeout_secs))
            .build())
    }
}

/// Logging and tracing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// OTLP collector endpoint; spans stay local when unset.
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Loads configuration from the given file, or the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let path = path.map_or_else(Self::config_path, Path::to_path_buf);
        Self::figment(&path).extract()
    }

    /// Layers defaults, the config file and the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(
                Env::raw()
                    .only(&["OPENROUTER_API_KEY"])
                    .map(|_| "provider.openrouter.api_key".into()),
            )
            .merge(Env::prefixed("VASSAGO_").split("__"))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Returns the path to the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vassago")
    }

    /// Returns a copy safe to print.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.provider.openrouter.api_key.is_empty() {
            config.provider.openrouter.api_key = "********".to_string();
        }
        config
    }
}

/// Prints the current configuration and its sources.
pub fn show_config(config: &Config, path: &Path) -> Result<(), toml::ser::Error> {
    println!("Vassago Configuration");
    println!("=====================\n");

    println!("Config file: {}", path.display());
    if path.exists() {
        println!("Status: Found\n");
    } else {
        println!("Status: Not found (using defaults)\n");
    }

    println!(
        "Effective provider: {:?}\n",
        config.provider.effective_backend()
    );
    println!("{}", toml::to_string_pretty(&config.redacted())?);

    println!("Environment variables:");
    println!("  VASSAGO_<SECTION>__<KEY>   e.g. VASSAGO_RETRIEVAL__TOP_K=8");
    println!("  OPENROUTER_API_KEY");
    Ok(())
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let config = Config::load(Some(&jail.directory().join("missing.toml")))?;
            assert_eq!(config, Config::default());
            assert_eq!(config.provider.effective_backend(), ProviderBackend::Mock);
            assert_eq!(config.store.backend, StoreBackend::Memory);
            assert_eq!(config.retrieval.top_k, 5);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [retrieval]
                top_k = 3
                min_score = 0.5

                [chunking]
                max_length = 800
                overlap = 100

                [store]
                backend = "chroma"

                [store.chroma]
                url = "http://chroma:8000"
                "#,
            )?;
            jail.set_env("VASSAGO_RETRIEVAL__TOP_K", "8");
            jail.set_env("VASSAGO_SERVER__PORT", "9090");

            let config = Config::load(Some(Path::new("config.toml")))?;
            assert_eq!(config.retrieval.top_k, 8);
            assert!((config.retrieval.min_score - 0.5).abs() < f32::EPSILON);
            assert_eq!(config.chunking.max_length, 800);
            assert_eq!(config.chunking.overlap, 100);
            assert_eq!(config.store.backend, StoreBackend::Chroma);
            assert_eq!(config.store.chroma.url, "http://chroma:8000");
            assert_eq!(config.store.chroma.collection, "vassago");
            assert_eq!(config.server.port, 9090);
            Ok(())
        });
    }

    #[test]
    fn test_api_key_from_env() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("OPENROUTER_API_KEY", "sk-or-test");
            let config = Config::load(Some(&jail.directory().join("missing.toml")))?;

            assert_eq!(config.provider.openrouter.api_key, "sk-or-test");
            assert_eq!(
                config.provider.effective_backend(),
                ProviderBackend::OpenRouter
            );
            assert_eq!(config.redacted().provider.openrouter.api_key, "********");
            Ok(())
        });
    }

    #[test]
    fn test_explicit_mock_backend_wins() {
        Jail::expect_with(|jail| {
            jail.set_env("OPENROUTER_API_KEY", "sk-or-test");
            jail.set_env("VASSAGO_PROVIDER__BACKEND", "mock");
            let config = Config::load(Some(&jail.directory().join("missing.toml")))?;
            assert_eq!(config.provider.effective_backend(), ProviderBackend::Mock);
            Ok(())
        });
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[retrieval]\ntop_k = \"many\"\n")?;
            assert!(Config::load(Some(Path::new("config.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_server_section() {
        let section = ServerSection {
            host: "127.0.0.1".to_string(),
            port: 3000,
            cors: false,
            request_timeout_secs: 5,
        };
        let config = section.to_server_config().unwrap();
        assert_eq!(config.addr, "127.0.0.1:3000".parse().unwrap());
        assert!(!config.cors);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}
