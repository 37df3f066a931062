use crate::{
    derive_key, format_bytes, parse_url_list, screenshot_path, App, Config, HttpServer,
    ScreenshotCache, ScreenshotError,
};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "page-snapshot")]
#[command(about = "Cached web page thumbnails rendered by a headless browser")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, env = "APP_DATA", help = "Data directory holding the screenshot cache")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "PHANTOMJS_BIN", help = "Headless renderer executable")]
    pub renderer: Option<PathBuf>,

    #[arg(long, help = "Render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Render script template")]
    pub template: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve screenshots over HTTP
    Serve {
        #[arg(short, long, env = "APP_PORT", help = "Server port")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(long, env = "APP_NAME", help = "Path prefix for every route")]
        app_name: Option<String>,

        #[arg(long, help = "Enable metrics endpoint")]
        metrics: bool,
    },

    /// Fetch screenshots through the cache without starting a server
    Capture {
        #[arg(short, long, help = "URL to screenshot (repeatable)")]
        url: Vec<String>,

        #[arg(short, long, help = "File containing URLs (one per line)")]
        input: Option<PathBuf>,

        #[arg(short, long, help = "Directory to copy the images into")]
        output: Option<PathBuf>,

        #[arg(long, help = "Discard cached images and render again")]
        refresh: bool,
    },

    /// Remove cached screenshots
    Purge {
        #[arg(short, long, required = true, help = "URL whose screenshot to remove (repeatable)")]
        url: Vec<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply command line and environment overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(renderer) = &self.renderer {
            config.renderer_path = Some(renderer.clone());
        }
        if let Some(timeout) = self.timeout {
            config.render_timeout = Duration::from_secs(timeout);
        }
        if let Some(template) = &self.template {
            config.template_path = Some(template.clone());
        }

        if let Commands::Serve {
            port,
            bind,
            app_name,
            ..
        } = &self.command
        {
            if let Some(port) = port {
                config.port = *port;
            }
            if let Some(bind) = bind {
                config.bind = bind.clone();
            }
            if let Some(app_name) = app_name {
                config.app_name = app_name.clone();
            }
        }
    }

    pub fn wants_metrics(&self) -> bool {
        matches!(self.command, Commands::Serve { metrics: true, .. })
    }
}

pub struct CliRunner {
    pub config: Config,
    pub cache: Option<Arc<ScreenshotCache>>,
    metrics: Option<PrometheusHandle>,
    server: OnceLock<Arc<HttpServer>>,
}

impl CliRunner {
    /// Install the metrics recorder, if any, before calling this so the
    /// cache registers its handles against it.
    pub fn new(config: Config, metrics: Option<PrometheusHandle>) -> Result<Self, ScreenshotError> {
        let cache = ScreenshotCache::from_config(&config)?.map(Arc::new);
        Ok(Self {
            config,
            cache,
            metrics,
            server: OnceLock::new(),
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), ScreenshotError> {
        match command {
            Commands::Serve { .. } => self.run_server().await,
            Commands::Capture {
                url,
                input,
                output,
                refresh,
            } => {
                let mut urls = url;
                if let Some(input) = input {
                    urls.extend(self.read_urls_from_file(&input).await?);
                }
                self.run_capture(urls, output, refresh).await
            }
            Commands::Purge { url } => self.run_purge(url).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    /// Unblock a running server so its listener thread can exit.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.get() {
            server.shutdown();
        }
    }

    pub async fn run_server(&self) -> Result<(), ScreenshotError> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let server = Arc::new(HttpServer::bind(&addr)?);
        let server = self.server.get_or_init(|| server).clone();

        if self.cache.is_none() {
            warn!("Serving without the screenshot route");
        }
        let app = Arc::new(App::new(
            &self.config,
            self.cache.clone(),
            self.metrics.clone(),
        ));
        server.run(app).await
    }

    pub async fn run_capture(
        &self,
        urls: Vec<String>,
        output: Option<PathBuf>,
        refresh: bool,
    ) -> Result<(), ScreenshotError> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            ScreenshotError::Configuration("no usable renderer is configured".to_string())
        })?;
        if urls.is_empty() {
            return Err(ScreenshotError::EmptyUrl);
        }
        let output = output.as_deref();
        if let Some(output) = output {
            fs::create_dir_all(output).await?;
        }

        info!("Capturing {} urls", urls.len());
        let results = futures::future::join_all(urls.iter().map(|url| async move {
            let shot = cache.get_or_generate(url, refresh).await?;
            let saved = match output {
                Some(dir) => {
                    let path = screenshot_path(dir, &shot.key);
                    fs::write(&path, &shot.data).await?;
                    path
                }
                None => cache.path_for(url),
            };
            Ok::<_, ScreenshotError>((shot, saved))
        }))
        .await;

        let mut failures = 0;
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok((shot, saved)) => println!(
                    "{} -> {} ({}{})",
                    url,
                    saved.display(),
                    format_bytes(shot.data.len()),
                    if shot.generated { ", rendered" } else { "" }
                ),
                Err(e) => {
                    failures += 1;
                    error!("Failed to capture {}: {}", url, e);
                }
            }
        }

        if failures > 0 {
            return Err(ScreenshotError::GenerationFailed(format!(
                "{failures} of {} captures failed",
                urls.len()
            )));
        }
        Ok(())
    }

    pub async fn run_purge(&self, urls: Vec<String>) -> Result<(), ScreenshotError> {
        for url in urls {
            let removed = match &self.cache {
                Some(cache) => cache.invalidate(&url).await?,
                None => purge_file(&self.config.screenshot_dir(), &url).await?,
            };
            if removed {
                println!("Removed screenshot of {url}");
            } else {
                println!("No screenshot cached for {url}");
            }
        }
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> Result<(), ScreenshotError> {
        println!("Validating configuration: {}", config_path.display());

        let config_content = fs::read_to_string(&config_path).await?;
        let config: Config = serde_json::from_str(&config_content)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Screenshot directory: {}", config.screenshot_dir().display());
        match &config.renderer_path {
            Some(renderer) => println!("  Renderer: {}", renderer.display()),
            None => println!("  Renderer: none (screenshots disabled)"),
        }
        println!("  Timeout: {:?}", config.render_timeout);
        println!("  Lock strategy: {:?}", config.lock_strategy);
        println!(
            "  Listen: {}:{}{}",
            config.bind,
            config.port,
            config.context_path()
        );

        Ok(())
    }

    pub async fn read_urls_from_file(&self, path: &Path) -> Result<Vec<String>, ScreenshotError> {
        let content = fs::read_to_string(path).await?;
        let urls = parse_url_list(&content);
        info!("Loaded {} URLs from {}", urls.len(), path.display());
        Ok(urls)
    }
}

/// Remove a cached image without a running cache, e.g. when no renderer is
/// configured on this host.
async fn purge_file(screenshot_dir: &Path, url: &str) -> Result<bool, ScreenshotError> {
    if url.is_empty() {
        return Err(ScreenshotError::EmptyUrl);
    }
    match fs::remove_file(screenshot_path(screenshot_dir, &derive_key(url))).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let cli = parse(&[
            "page-snapshot",
            "--data-dir",
            "/srv/data",
            "--renderer",
            "/opt/phantomjs",
            "--timeout",
            "10",
            "serve",
            "--port",
            "9000",
            "--app-name",
            "home",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.renderer_path, Some(PathBuf::from("/opt/phantomjs")));
        assert_eq!(config.render_timeout, Duration::from_secs(10));
        assert_eq!(config.port, 9000);
        assert_eq!(config.app_name, "home");
        assert_eq!(config.bind, "0.0.0.0");
        assert!(!cli.wants_metrics());
    }

    #[test]
    fn test_capture_accepts_repeated_urls() {
        let cli = parse(&[
            "page-snapshot",
            "capture",
            "--url",
            "https://a.example/",
            "--url",
            "https://b.example/",
            "--refresh",
        ]);
        match cli.command {
            Commands::Capture { url, refresh, .. } => {
                assert_eq!(url, vec!["https://a.example/", "https://b.example/"]);
                assert!(refresh);
            }
            _ => panic!("expected capture"),
        }
    }

    #[test]
    fn test_purge_requires_a_url() {
        assert!(Cli::try_parse_from(["page-snapshot", "purge"]).is_err());
    }

    #[tokio::test]
    async fn test_purge_without_renderer_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let runner = CliRunner::new(config.clone(), None).unwrap();
        assert!(runner.cache.is_none());

        std::fs::create_dir_all(config.screenshot_dir()).unwrap();
        let path = screenshot_path(&config.screenshot_dir(), &derive_key("https://example.com/"));
        std::fs::write(&path, b"PNG").unwrap();

        runner
            .run_purge(vec!["https://example.com/".to_string()])
            .await
            .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_capture_without_renderer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let runner = CliRunner::new(config, None).unwrap();
        let result = runner
            .run_capture(vec!["https://example.com/".to_string()], None, false)
            .await;
        assert!(matches!(result, Err(ScreenshotError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_validate_rejects_zero_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(
            &file,
            r#"{"render_timeout": {"secs": 0, "nanos": 0}}"#,
        )
        .unwrap();

        let runner = CliRunner::new(
            Config {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert!(matches!(
            runner.validate_config(file).await,
            Err(ScreenshotError::Configuration(_))
        ));
    }
}
