//! # Element Index
//!
//! A multi-source index and synchronization engine for AI assistant
//! elements: personas, skills, templates, agents, memories, and ensembles.
//!
//! Elements live in three places: a local portfolio on disk, the user's
//! remote portfolio repository, and a shared public collection. This crate
//! keeps a memory-bounded, staleness-aware index over all three and
//! reconciles the local and remote portfolios through explicit
//! compare/push/pull operations with conflict detection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐
//! │ Local index  │  │ Remote portfolio │  │ Collection     │
//! │ (authorit.)  │  │ TTL + breaker    │  │ ETag + breaker │
//! └──────┬───────┘  └────────┬─────────┘  └───────┬────────┘
//!        │                   │                    │
//!        └─────────┬─────────┴────────────────────┘
//!                  ▼
//!        ┌──────────────────┐        ┌──────────────┐
//!        │ UnifiedIndex     │        │ SyncManager  │──► SyncReport
//!        │ Manager (search) │        │ compare/push │
//!        └──────────────────┘        │ /pull        │
//!                                    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn demo() -> element_index::error::Result<()> {
//! use element_index::config::Config;
//! use element_index::context::EngineBuilder;
//! use element_index::models::SearchQuery;
//!
//! let engine = EngineBuilder::new(Config::default()).build().await?;
//! let page = engine.search_all(&SearchQuery::new("code review")).await;
//! for hit in &page.items {
//!     println!("{} ({})", hit.entry.display_name, hit.entry.source);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`config`] | TOML configuration parsing |
//! | [`clock`] | Injectable time source |
//! | [`cache`] | Bounded LRU cache with TTL and byte budget |
//! | [`circuit`] | Circuit breaker |
//! | [`retry`] | Retry with backoff and jitter |
//! | [`singleflight`] | Collapse concurrent identical refreshes |
//! | [`keylock`] | Per-key write serialization |
//! | [`frontmatter`] | Element header parsing |
//! | [`traits`] | Collaborator seams |
//! | [`refresh`] | Stale-while-revalidate cache shared by remote sources |
//! | [`index_collection`] | Public collection index |
//! | [`index_remote`] | Remote portfolio index |
//! | [`index_local`] | Local portfolio index |
//! | [`search`] | Unified search |
//! | [`sync_compare`] | Pure local/remote diff |
//! | [`sync`] | Push, pull, and compare |
//! | [`context`] | Engine wiring |
//! | [`fs_store`] | Filesystem local store |
//! | [`http_collection`] | HTTP collection fetcher |
//! | [`progress`] | Sync progress reporting |
//! | [`sources`] | Source health overview |
//! | [`stats`] | Cache statistics |

pub mod cache;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod frontmatter;
pub mod fs_store;
pub mod http_collection;
pub mod index_collection;
pub mod index_local;
pub mod index_remote;
pub mod keylock;
pub mod models;
pub mod progress;
pub mod refresh;
pub mod retry;
pub mod search;
pub mod singleflight;
pub mod sources;
pub mod stats;
pub mod sync;
pub mod sync_compare;
pub mod traits;
