use crate::error::{ErrorKind, Result};
use crate::progress::ConsoleObserver;
use crate::validate::{Check, check_output, check_roots, check_state};
use crate::{StatusArgs, SyncArgs, ValidateArgs};
use exn::ResultExt;
use pagesync_config::Config;
use pagesync_remote::{HttpSource, HttpSourceConfig, RateLimiter, RateLimiterConfig};
use pagesync_state::{FingerprintKind, StateStore};
use pagesync_storage::backend::LocalBackend;
use pagesync_sync::{SyncOptions, SyncReport, SyncRoot, Syncer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

pub async fn sync(args: SyncArgs) -> Result<()> {
    let config = Config::load(args.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let output = absolute(&config.output.path)?;
    let state_file = absolute(&config.state_file())?;
    tracing::debug!(output = %output.display(), state = %state_file.display(), "Resolved paths");

    let cancel = CancellationToken::new();
    let limiter = Arc::new(rate_limiter(&config));
    let source = http_source(&config, &limiter, &cancel).or_raise(|| ErrorKind::Setup)?;
    let backend = LocalBackend::new("output", &output).or_raise(|| ErrorKind::Setup)?;

    let options = SyncOptions {
        dry_run: args.dry_run,
        force: args.force,
        concurrency: config.sync.concurrency(),
        download_attachments: config.options.download_attachments,
        attachment_folder: PathBuf::from(&config.output.attachment_folder),
        cleanup_orphans: config.options.cleanup_orphans,
    };
    let roots: Vec<SyncRoot> = config
        .sync
        .roots
        .iter()
        .map(|root| SyncRoot {
            url: root.url.clone(),
            name: root.name.clone(),
        })
        .collect();

    let mut syncer = Syncer::new(Arc::new(source), Arc::new(backend), limiter, state_file, options)
        .or_raise(|| ErrorKind::Setup)?
        .with_observer(Arc::new(ConsoleObserver::new(args.quiet)));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; letting in-flight pages finish");
            interrupt.cancel();
        }
    });

    let report = syncer.run(&roots, &cancel).await.or_raise(|| ErrorKind::Sync)?;
    print_summary(&report);
    report.check().or_raise(|| ErrorKind::Sync)
}

pub fn status(args: StatusArgs) -> Result<()> {
    let config = Config::load_unchecked(args.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let state_file = config.state_file();
    if !state_file.exists() {
        println!("No sync recorded yet ({} does not exist)", state_file.display());
        return Ok(());
    }
    let state = StateStore::load(&state_file).or_raise(|| ErrorKind::State)?;
    let stats = state.attachment_stats();

    println!("State file:   {}", state_file.display());
    match state.last_sync_time() {
        Some(at) => {
            let stamp = at.format(&Rfc3339).unwrap_or_else(|_| at.to_string());
            println!("Last sync:    {stamp} ({})", humanize_age(OffsetDateTime::now_utc() - at));
        },
        None => println!("Last sync:    never completed"),
    }
    println!(
        "Resources:    {} ({} pages, {} collections, {} entries)",
        state.resource_count(),
        state.count_of(FingerprintKind::Page),
        state.count_of(FingerprintKind::Collection),
        state.entry_count(),
    );
    println!("Attachments:  {} ({})", stats.count, format_bytes(stats.total_bytes));
    Ok(())
}

/// Run every check, print one line each, and fail if any check failed.
pub async fn validate(args: ValidateArgs) -> Result<()> {
    let mut checks = Vec::new();
    let config = match Config::load_unchecked(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            checks.push(Check::fail("Configuration loads", &*err));
            print_checks(&checks);
            exn::bail!(ErrorKind::Validation(1));
        },
    };
    checks.push(Check::pass("Configuration loads"));
    checks.push(match config.validate() {
        Ok(()) => Check::pass("Configuration valid"),
        Err(err) => Check::fail("Configuration valid", &*err),
    });

    let has_token = config.api.token.as_deref().is_some_and(|t| !t.trim().is_empty());
    if has_token {
        checks.push(Check::pass("API token set"));
        let cancel = CancellationToken::new();
        let limiter = Arc::new(rate_limiter(&config));
        match http_source(&config, &limiter, &cancel) {
            Ok(source) => match limiter.execute(&cancel, || source.current_user()).await {
                Ok(user) => {
                    checks.push(Check::pass("API reachable").with_detail(format!("connected as {user:?}")));
                    checks.extend(check_roots(&source, &limiter, &config.sync.roots, &cancel).await);
                },
                Err(err) => checks.push(Check::fail("API reachable", &*err)),
            },
            Err(err) => checks.push(Check::fail("API reachable", &*err)),
        }
    } else {
        checks.push(Check::fail("API token set", "set api.token or NOTION_TOKEN"));
    }

    if config.output.path.as_os_str().is_empty() {
        checks.push(Check::fail("Output directory writable", "output.path is not set"));
    } else {
        match std::path::absolute(&config.output.path) {
            Ok(output) => checks.push(check_output(&output).await),
            Err(err) => checks.push(Check::fail("Output directory writable", err)),
        }
        match std::path::absolute(config.state_file()) {
            Ok(state_file) => checks.extend(check_state(&state_file)),
            Err(err) => checks.push(Check::fail("State directory usable", err)),
        }
    }

    print_checks(&checks);
    let failed = checks.iter().filter(|c| !c.passed).count();
    if failed > 0 {
        exn::bail!(ErrorKind::Validation(failed));
    }
    println!("\nAll checks passed");
    Ok(())
}

fn print_checks(checks: &[Check]) {
    for check in checks {
        println!("{check}");
    }
}

fn rate_limiter(config: &Config) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig {
        requests_per_second: config.rate_limit.requests_per_second,
        burst: config.rate_limit.burst,
    })
}

fn http_source(
    config: &Config,
    limiter: &Arc<RateLimiter>,
    cancel: &CancellationToken,
) -> pagesync_remote::Result<HttpSource> {
    HttpSource::new(
        HttpSourceConfig {
            base_url: config.api.base_url.clone(),
            token: config.api.token.clone().unwrap_or_default(),
            version: config.api.version.clone(),
            timeout: config.api.timeout(),
        },
        Arc::clone(limiter),
        cancel.clone(),
    )
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).or_raise(|| ErrorKind::Setup)
}

fn print_summary(report: &SyncReport) {
    if report.dry_run {
        println!("Dry run: nothing was written");
    }
    println!(
        "{} pages processed: {} updated, {} skipped, {} failed ({} collections) in {:.1}s",
        report.processed,
        report.updated,
        report.skipped,
        report.failed,
        report.collections,
        report.duration.as_secs_f64(),
    );
    println!(
        "{} attachments downloaded, {} files removed",
        report.attachments_downloaded,
        report.removed.len()
    );
    if report.cancelled {
        println!("Interrupted; run again to pick up the remaining pages");
    }
    for err in &report.errors {
        eprintln!("  - {err}");
    }
}

fn humanize_age(age: time::Duration) -> String {
    let secs = age.whole_seconds();
    let (count, unit) = match secs {
        ..60 => return "just now".to_string(),
        60..3_600 => (secs / 60, "minute"),
        3_600..86_400 => (secs / 3_600, "hour"),
        _ => (secs / 86_400, "day"),
    };
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
