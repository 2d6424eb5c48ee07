//! CLI command implementations

use crate::output::{format_bytes, print_list};
use crate::progress::{self, FetchProgress};
use crate::{ConfigAction, FetchArgs, OutputFormat};
use anyhow::{anyhow, Context, Result};
use console::style;
use imgfetch_core::config::{load_config, save_config};
use imgfetch_core::types::{DownloadOptions, DownloaderConfig};
use imgfetch_core::{
    Completion, Credentials, DownloadManager, ImageCrateDecoder, ImageDecoder, ReqwestClient,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ============================================================================
// Argument parsing
// ============================================================================

/// Parse a `Name: value` header argument
pub(crate) fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_auth(s: &str) -> Result<Credentials> {
    let (user, password) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("--auth expects user:password"))?;
    Ok(Credentials::new(user, password))
}

fn options_for(args: &FetchArgs) -> DownloadOptions {
    let mut options = DownloadOptions::empty();
    if args.low_priority {
        options |= DownloadOptions::LOW_PRIORITY;
    }
    if args.progressive {
        options |= DownloadOptions::PROGRESSIVE_DOWNLOAD;
    }
    if args.use_cache {
        options |= DownloadOptions::USE_HTTP_CACHE;
    }
    if args.ignore_cached {
        options |= DownloadOptions::IGNORE_CACHED_RESPONSE;
    }
    options
}

/// Pick a file name for `url` that no earlier download in this batch used
fn output_filename(url: &str, index: usize, taken: &mut HashSet<String>) -> String {
    let base = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|name| {
            name.chars()
                .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
                .collect::<String>()
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| format!("image-{}", index + 1));

    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 => (base[..dot].to_string(), base[dot..].to_string()),
        _ => (base.clone(), String::new()),
    };

    let mut candidate = base;
    let mut n = 1;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{}-{}{}", stem, n, ext);
        n += 1;
    }
    candidate
}

// ============================================================================
// Fetch
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum FetchStatus {
    Saved,
    Unchanged,
    Failed,
    Cancelled,
}

/// Outcome of one URL in a fetch batch
#[derive(Debug, Clone, Serialize)]
struct FetchReport {
    url: String,
    status: FetchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FetchReport {
    fn new(url: &str, status: FetchStatus) -> Self {
        Self {
            url: url.to_string(),
            status,
            path: None,
            bytes: None,
            width: None,
            height: None,
            error: None,
        }
    }

    fn failed(url: &str, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(url, FetchStatus::Failed)
        }
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            FetchStatus::Saved => {
                write!(f, "{} {}", style("✓").green().bold(), self.url)?;
                if let Some(path) = &self.path {
                    write!(f, " -> {}", style(path.display()).cyan())?;
                }
                if let Some(bytes) = self.bytes {
                    write!(f, " ({})", format_bytes(bytes))?;
                }
                if let (Some(w), Some(h)) = (self.width, self.height) {
                    write!(f, " {}x{}", w, h)?;
                }
                Ok(())
            }
            FetchStatus::Unchanged => {
                write!(f, "{} {} (cached, skipped)", style("=").dim(), self.url)
            }
            FetchStatus::Failed => write!(
                f,
                "{} {}: {}",
                style("✗").red().bold(),
                self.url,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            FetchStatus::Cancelled => write!(f, "{} {} (cancelled)", style("○").dim(), self.url),
        }
    }
}

async fn save_completion(
    url: &str,
    completion: Completion,
    path: PathBuf,
) -> Result<FetchReport> {
    if let Some(error) = completion.error {
        return Ok(FetchReport::failed(url, error));
    }
    let Some(data) = completion.data else {
        return Ok(FetchReport::new(url, FetchStatus::Unchanged));
    };

    tokio::fs::write(&path, &data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote {} bytes to {}", data.len(), path.display());

    Ok(FetchReport {
        path: Some(path),
        bytes: Some(data.len() as u64),
        width: completion.image.as_ref().map(|i| i.width()),
        height: completion.image.as_ref().map(|i| i.height()),
        ..FetchReport::new(url, FetchStatus::Saved)
    })
}

async fn effective_config(config_path: Option<&Path>) -> Result<DownloaderConfig> {
    match config_path {
        Some(path) => Ok(load_config(path).await?),
        None => Ok(DownloaderConfig::default()),
    }
}

pub(crate) async fn fetch(
    args: FetchArgs,
    config_path: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let mut config = effective_config(config_path.as_deref()).await?;
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_downloads = max.max(1);
    }
    if let Some(order) = args.order {
        config.execution_order = order.into();
    }
    if args.coalesce {
        config.coalesce_requests = true;
    }
    for (name, value) in &args.headers {
        config.headers.set(name, Some(value.as_str()));
    }

    let decoder: Option<Arc<dyn ImageDecoder>> = if args.decode {
        Some(Arc::new(ImageCrateDecoder))
    } else {
        None
    };
    let manager = DownloadManager::with_decoder(Arc::new(ReqwestClient::new()?), config, decoder)?;
    if let Some(auth) = &args.auth {
        manager.set_credentials(Some(parse_auth(auth)?));
    }

    tokio::fs::create_dir_all(&args.dir)
        .await
        .with_context(|| format!("Failed to create {}", args.dir.display()))?;

    let options = options_for(&args);
    let bars = FetchProgress::new(matches!(format, OutputFormat::Human));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, Completion)>();
    let mut reports: Vec<Option<FetchReport>> = vec![None; args.urls.len()];
    let mut bar_for = Vec::with_capacity(args.urls.len());

    for (index, url) in args.urls.iter().enumerate() {
        let bar = bars.add(url);
        let progress_bar = bar.clone();
        let done_tx = done_tx.clone();

        let submitted = manager.download_image(
            url,
            options,
            move |p| progress::update(&progress_bar, p),
            move |completion: Completion| {
                if completion.finished {
                    let _ = done_tx.send((index, completion));
                }
            },
        );
        if let Err(e) = submitted {
            progress::finish_failed(&bar, &e.to_string());
            reports[index] = Some(FetchReport::failed(url, e));
        }
        bar_for.push(bar);
    }
    drop(done_tx);

    let mut taken = HashSet::new();
    loop {
        tokio::select! {
            received = done_rx.recv() => {
                let Some((index, completion)) = received else { break };
                let url = &args.urls[index];
                let path = args.dir.join(output_filename(url, index, &mut taken));
                let report = save_completion(url, completion, path)
                    .await
                    .unwrap_or_else(|e| FetchReport::failed(url, format!("{:#}", e)));
                match report.status {
                    FetchStatus::Saved => progress::finish_ok(
                        &bar_for[index],
                        &report.bytes.map(format_bytes).unwrap_or_default(),
                    ),
                    FetchStatus::Unchanged => progress::finish_ok(&bar_for[index], "cached"),
                    _ => progress::finish_failed(
                        &bar_for[index],
                        report.error.as_deref().unwrap_or_default(),
                    ),
                }
                reports[index] = Some(report);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling remaining downloads");
                manager.cancel_all();
                break;
            }
        }
    }

    let reports: Vec<FetchReport> = reports
        .into_iter()
        .zip(&args.urls)
        .zip(&bar_for)
        .map(|((report, url), bar)| {
            report.unwrap_or_else(|| {
                progress::finish_cancelled(bar);
                FetchReport::new(url, FetchStatus::Cancelled)
            })
        })
        .collect();

    print_list(&reports, format)?;

    let failed = reports
        .iter()
        .filter(|r| r.status == FetchStatus::Failed)
        .count();
    if matches!(format, OutputFormat::Human) {
        let saved = reports
            .iter()
            .filter(|r| r.status == FetchStatus::Saved)
            .count();
        println!(
            "\n{} saved, {} failed, {} total",
            style(saved).green(),
            style(failed).red(),
            reports.len()
        );
    }
    if failed > 0 {
        return Err(anyhow!("{} of {} downloads failed", failed, reports.len()));
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub(crate) async fn config_action(
    action: Option<ConfigAction>,
    config_path: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let config = effective_config(config_path.as_deref()).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
                OutputFormat::Human => {
                    println!("{}", style("Settings").bold().underlined());
                    println!(
                        "  Max concurrent downloads: {}",
                        config.max_concurrent_downloads
                    );
                    println!("  Execution order: {:?}", config.execution_order);
                    println!("  Coalesce requests: {}", config.coalesce_requests);
                    println!("  Event capacity: {}", config.event_capacity);
                    println!("  Headers:");
                    for (name, value) in config.headers.iter() {
                        println!("    {}: {}", name, value);
                    }
                }
            }
        }

        ConfigAction::Path => match &config_path {
            Some(path) => println!("{}", path.display()),
            None => return Err(anyhow!("No config directory available on this platform")),
        },

        ConfigAction::Reset => {
            let path = config_path
                .ok_or_else(|| anyhow!("No config directory available on this platform"))?;
            save_config(&path, &DownloaderConfig::default()).await?;
            println!(
                "{} Wrote default settings to {}",
                style("✓").green().bold(),
                path.display()
            );
        }
    }

    Ok(())
}
