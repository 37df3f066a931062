//! # Page Snapshot
//!
//! A small HTTP service that returns a PNG thumbnail of a web page. Images
//! are produced by an external headless renderer (PhantomJS or anything
//! that accepts a script path) and kept on disk, keyed by a name derived
//! from the page url, so each page is rendered once and served from the
//! cache afterwards.
//!
//! ## Request flow
//!
//! 1. `GET /<app_name>/screenshots?url=<u>[&refresh=true]` reaches the
//!    [`server`] router.
//! 2. [`ScreenshotCache::get_or_generate`] derives the cache key, takes the
//!    key's lock and checks the screenshot directory.
//! 3. On a miss a render script is built from the template ([`script`]),
//!    the renderer is launched with a hard timeout ([`runner`]) and the
//!    finished image is moved into place.
//! 4. The image bytes are returned as `image/png`, cacheable for eight
//!    hours unless the caller asked for a refresh.
//!
//! When no renderer is configured, or it cannot be found, the screenshot
//! route is not registered at all and the rest of the server runs as usual.
//!
//! ## Library use
//!
//! ```rust,no_run
//! use page_snapshot::{Config, ScreenshotCache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         renderer_path: Some("/usr/local/bin/phantomjs".into()),
//!         ..Default::default()
//!     };
//!     let Some(cache) = ScreenshotCache::from_config(&config)? else {
//!         return Ok(());
//!     };
//!     let shot = cache.get_or_generate("https://example.com/", false).await?;
//!     println!("{} ({} bytes)", shot.key, shot.data.len());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-snapshot --renderer /usr/local/bin/phantomjs serve --port 8081
//! page-snapshot --renderer /usr/local/bin/phantomjs capture --url https://example.com/ --output shots/
//! page-snapshot purge --url https://example.com/
//! ```

/// Configuration plus the request and response types of the service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Mapping from page urls to cache file names
pub mod cache_key;

/// Render script templating
pub mod script;

/// External process execution with timeouts
pub mod runner;

/// The screenshot cache and its locking
pub mod cache;

/// HTTP routing and the listener
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics for cache and renderer activity
pub mod metrics;

/// Health reporting for the renderer and the screenshot directory
pub mod health;

/// Utility functions and helpers
pub mod utils;


pub use cache::*;
pub use cache_key::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use self::metrics::*;
pub use runner::*;
pub use script::*;
pub use server::*;
pub use utils::*;
