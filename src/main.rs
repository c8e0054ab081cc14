//! Footprint CLI
//!
//! Local activity telemetry daemon.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select};
use footprint_agent::{
    capture,
    stats::format_duration,
    Config, Encryptor, Monitor, MonitorError, PayloadCipher, PermissionError, PermissionGate,
    StatsAggregator, Storage, TransparencyLog, PRIVACY_DECLARATION, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Environment variable holding the optional payload passphrase.
const PASSPHRASE_ENV: &str = "FOOTPRINT_PASSPHRASE";

/// Window changes shown under "Recent activity".
const TIMELINE_LIMIT: usize = 50;

#[derive(Parser)]
#[command(name = "footprint")]
#[command(version = VERSION)]
#[command(about = "Local activity telemetry daemon", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring in the foreground (Ctrl+C to stop)
    Start,

    /// Show activity statistics
    Stats {
        /// Number of days to include (0 for all time)
        #[arg(long, default_value = "7")]
        days: u32,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Report capture permissions
    Check,

    /// Export recorded rows as JSON
    Export {
        /// Number of days to include (0 for all time)
        #[arg(long, default_value = "7")]
        days: u32,

        /// Output file (stdout if omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Decrypt key payloads into text
        #[arg(long)]
        decrypt: bool,
    },

    /// Show configuration
    Config,

    /// Display privacy declaration
    Privacy,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone();
    let result = match cli.command {
        Commands::Start => cmd_start(config_path.as_deref()),
        Commands::Stats { days, json } => cmd_stats(config_path.as_deref(), days, json),
        Commands::Check => cmd_check(),
        Commands::Export {
            days,
            output,
            decrypt,
        } => cmd_export(config_path.as_deref(), days, output, decrypt),
        Commands::Config => cmd_config(config_path.as_deref()),
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        if let Some(permission) = permission_error(&e) {
            eprintln!();
            eprintln!("{}", permission.instructions());
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn permission_error(error: &anyhow::Error) -> Option<&PermissionError> {
    error.chain().find_map(|cause| {
        cause.downcast_ref::<PermissionError>().or_else(|| {
            match cause.downcast_ref::<MonitorError>() {
                Some(MonitorError::Permission(e)) => Some(e),
                _ => None,
            }
        })
    })
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("could not load configuration")
}

fn passphrase() -> Option<Zeroizing<String>> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .map(Zeroizing::new)
}

fn open_encryptor(config: &Config) -> Result<Encryptor> {
    let passphrase = passphrase();
    Encryptor::open(&config.data_dir(), passphrase.as_ref().map(|p| p.as_str()))
        .context("could not open payload key")
}

fn cmd_start(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config
        .ensure_directories()
        .context("could not create data directory")?;

    println!("Footprint v{VERSION}");
    println!();

    let storage = Arc::new(Storage::open(&config.database_path).context("could not open database")?);
    let cipher: Option<Arc<dyn PayloadCipher>> = if config.encryption_enabled && config.capture_text {
        Some(Arc::new(open_encryptor(&config)?))
    } else {
        None
    };
    let transparency = Arc::new(TransparencyLog::with_persistence(
        config.data_dir().join("transparency.json"),
    ));

    println!("Starting monitor...");
    println!("  Database: {}", config.database_path.display());
    println!(
        "  Key text: {}",
        match (config.capture_text, config.encryption_enabled) {
            (false, _) => "counts only",
            (true, true) => "encrypted",
            (true, false) => "plaintext",
        }
    );
    println!("  Mouse: {}", enabled(config.capture_mouse));
    println!("  Windows: {}", enabled(config.capture_windows));
    println!("  Terminal: {}", enabled(config.capture_terminal));
    if !config.exclude_applications.is_empty() {
        println!("  Excluded: {}", config.exclude_applications.join(", "));
    }

    let mut monitor = Monitor::new(config, capture::create_platform(), storage, cipher)
        .with_transparency(transparency.clone());
    monitor.start()?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("could not install Ctrl+C handler")?;

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let failures = monitor.failures();
    let failed = select! {
        recv(stop_rx) -> _ => None,
        recv(failures) -> msg => msg.ok(),
    };

    println!();
    println!("Stopping monitor...");
    let report = monitor.stop()?;
    println!("Flushed {} buffered events", report.flushed);
    if report.lost > 0 {
        eprintln!(
            "Warning: {} events could not be written before the shutdown timeout",
            report.lost
        );
    }

    println!();
    println!("{}", transparency.summary());

    if let Some(failure) = failed {
        bail!(
            "all capture sources failed ({}), monitor stopped",
            failure.sources.join(", ")
        );
    }
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn cmd_stats(config_path: Option<&Path>, days: u32, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let storage = Arc::new(Storage::open(&config.database_path).context("could not open database")?);
    let aggregator = StatsAggregator::new(storage);

    let summary = aggregator.summary(days)?;
    let hourly = aggregator.hourly_activity(days)?;
    let terminal = aggregator.terminal_summary(days)?;
    let timeline = aggregator.timeline(days, TIMELINE_LIMIT)?;

    if json {
        let value = serde_json::json!({
            "summary": summary,
            "hourly_activity": hourly,
            "timeline": timeline,
            "terminal": terminal,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let range = if days == 0 {
        "all time".to_string()
    } else {
        format!("last {days} day(s)")
    };
    println!("Activity ({range})");
    println!("==================");
    println!();
    println!("  Keystrokes:     {}", summary.keystrokes);
    println!("  Clicks:         {}", summary.clicks);
    println!("  Window changes: {}", summary.window_changes);
    println!("  Active time:    {} (estimated)", format_duration(summary.active_seconds));
    println!();

    if !summary.top_apps.is_empty() {
        println!("Top applications:");
        for app in &summary.top_apps {
            println!(
                "  {:<28} {:>8} keys  {:>5.1}%",
                app.name, app.keystrokes, app.percentage
            );
        }
        println!();
    }

    let peak = hourly.iter().copied().max().unwrap_or(0);
    if peak > 0 {
        println!("Activity by hour:");
        for (hour, count) in hourly.iter().enumerate() {
            let width = (*count * 40 / peak) as usize;
            println!("  {hour:02}:00 {:<40} {count}", "█".repeat(width));
        }
        println!();
    }

    if !timeline.is_empty() {
        println!("Recent activity:");
        for entry in timeline.iter().take(10) {
            println!(
                "  {}  {:<20} {:>6} keys  {}",
                entry.started_at.with_timezone(&chrono::Local).format("%m-%d %H:%M"),
                entry.application,
                entry.keystrokes,
                entry.title
            );
        }
        println!();
    }

    if terminal.total_commands > 0 {
        println!("Terminal:");
        println!(
            "  Commands: {} ({} dangerous)",
            terminal.total_commands, terminal.dangerous_commands
        );
        for (kind, count) in &terminal.by_type {
            println!("  {kind:<16} {count}");
        }
        if !terminal.top_commands.is_empty() {
            println!("  Top commands:");
            for (command, count) in &terminal.top_commands {
                println!("    {count:>5}  {command}");
            }
        }
        if !terminal.top_projects.is_empty() {
            println!("  Top projects:");
            for (project, count) in &terminal.top_projects {
                println!("    {count:>5}  {project}");
            }
        }
    }
    Ok(())
}

fn cmd_check() -> Result<()> {
    let platform = capture::create_platform();
    let gate = PermissionGate::new(platform.as_ref());
    let permissions = gate.check();

    println!("Footprint Permissions ({})", platform.name());
    println!("======================");
    println!();
    for (name, granted, required) in [
        ("Accessibility", permissions.accessibility, true),
        ("Input Monitoring", permissions.input_monitoring, true),
        ("Screen Recording", permissions.screen_recording, false),
    ] {
        println!(
            "  {:<18} {}{}",
            name,
            if granted { "Granted ✓" } else { "Not Granted ✗" },
            if required { "" } else { " (optional, needed for window titles)" }
        );
    }
    println!();

    if !permissions.is_sufficient() {
        return Err(PermissionError {
            missing: permissions.missing_required(),
        }
        .into());
    }
    println!("Ready to monitor.");
    Ok(())
}

fn cmd_export(
    config_path: Option<&Path>,
    days: u32,
    output: Option<PathBuf>,
    decrypt: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let storage = Storage::open(&config.database_path).context("could not open database")?;
    let mut rows = storage.export_rows(days)?;

    if decrypt {
        let encryptor = open_encryptor(&config)?;
        let mut failed = 0usize;
        for row in rows.keys.iter_mut().filter(|row| row.encrypted) {
            match encryptor.decrypt(&row.payload) {
                Ok(plain) => row.text = Some(String::from_utf8_lossy(&plain).into_owned()),
                Err(_) => failed += 1,
            }
        }
        if failed > 0 {
            tracing::warn!(failed, "some key payloads could not be decrypted");
        }
    }

    let json = serde_json::to_string_pretty(&rows)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("could not write {}", path.display()))?;
            println!(
                "Exported {} windows, {} key events, {} clicks, {} commands to {}",
                rows.windows.len(),
                rows.keys.len(),
                rows.clicks.len(),
                rows.terminal_commands.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_path);

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", path.display());
    println!("Data directory: {}", config.data_dir().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
