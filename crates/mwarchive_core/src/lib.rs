//! Archive the latest revision of every page in a MediaWiki namespace into
//! SQLite or a plain-text file tree.

pub mod archive;
pub mod config;
pub mod error;
pub mod mediawiki;
pub mod store;

pub use archive::{Archiver, NamespaceReport, PageFailure};
pub use config::{ArchiverConfig, Backend, LoadedConfig, StorageTarget, resolve_config};
pub use error::{ArchiveError, RunAborted, StorageError};
pub use mediawiki::{MediaWikiClient, MediaWikiClientConfig, PageContent, PageRef, WikiReadApi};
pub use store::{FileStore, PersistOutcome, Persister, SqliteStore, sanitize_title};
