use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use studyshelf_sync::cloud::{BlobStore, Book, CloudStore, MemoryCloud, RestCloudStore};
use studyshelf_sync::keys::SegmentKeyMatcher;
use studyshelf_sync::storage::{OriginStorage, SqliteBackend};
use studyshelf_sync::{EngineConfig, EngineParts, SessionIdentity, SyncEngine};

/// Origin used for the CLI's own cache file.
const CLI_ORIGIN: &str = "studyshelf-cli";

/// Shared application state for CLI commands
pub struct App {
    pub engine: SyncEngine,
    pub config_path: Option<PathBuf>,
}

impl App {
    /// Open the cache and connect to the configured cloud.
    pub fn new(config_path: Option<PathBuf>, user: Option<String>) -> Result<Self> {
        let config_path = config_path
            .or_else(|| EngineConfig::default_data_dir().map(|d| d.join("config.toml")));
        let config = match &config_path {
            Some(path) if path.exists() => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            _ => EngineConfig::default(),
        };

        let cache_path = config
            .cache
            .resolved_path()
            .context("Failed to resolve cache location")?;
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let backend = SqliteBackend::open(&cache_path, config.cache.quota_bytes)
            .with_context(|| format!("Failed to open cache at {}", cache_path.display()))?;
        let storage = OriginStorage::new(CLI_ORIGIN, backend, config.cache.disposal.clone());

        let (cloud, blobs): (Arc<dyn CloudStore>, Arc<dyn BlobStore>) =
            match (&config.cloud.base_url, &config.cloud.api_key) {
                (Some(url), Some(key)) => {
                    let rest = Arc::new(
                        RestCloudStore::new(url, key)
                            .context("Failed to create cloud client")?
                            .with_tables(config.cloud.tables.clone()),
                    );
                    rest.set_access_token(std::env::var("STUDYSHELF_TOKEN").ok());
                    (rest.clone() as Arc<dyn CloudStore>, rest as Arc<dyn BlobStore>)
                }
                _ => {
                    log::info!("No cloud configured, using an in-process store");
                    let memory = Arc::new(MemoryCloud::new());
                    (memory.clone() as Arc<dyn CloudStore>, memory as Arc<dyn BlobStore>)
                }
            };

        let user = user.or_else(|| std::env::var("STUDYSHELF_USER").ok());
        let engine = SyncEngine::start(EngineParts {
            config,
            storage,
            cloud,
            blobs,
            identity: Arc::new(SessionIdentity::new(user)),
            transports: Vec::new(),
            matcher: Arc::new(SegmentKeyMatcher),
            tab_id: None,
        });

        Ok(Self { engine, config_path })
    }

    /// Find a book by name (case-insensitive prefix match)
    pub fn find_book(&self, name: &str) -> Result<Book> {
        let books = self.engine.books().registry().books();
        let name_lower = name.to_lowercase();

        if let Some(book) = books.iter().find(|b| b.name.to_lowercase() == name_lower) {
            return Ok(book.clone());
        }

        let matches: Vec<&Book> = books
            .iter()
            .filter(|b| b.name.to_lowercase().starts_with(&name_lower))
            .collect();

        match matches.len() {
            0 => bail!(
                "No book matching '{}'. Available books:\n{}",
                name,
                books.iter().map(|b| format!("  - {}", b.name)).collect::<Vec<_>>().join("\n")
            ),
            1 => Ok(matches[0].clone()),
            _ => bail!(
                "Ambiguous book name '{}'. Matches:\n{}",
                name,
                matches.iter().map(|b| format!("  - {}", b.name)).collect::<Vec<_>>().join("\n")
            ),
        }
    }
}
