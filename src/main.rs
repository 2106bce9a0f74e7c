use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_digest::config::{AppConfig, DEFAULT_CONFIG_PATH, LoggingSettings, MailSourceKind, Profile};
use mail_digest::llm::{LlmBackend, LlmConfig, create_provider};
use mail_digest::mail::{EmlDirSource, GmailSource, MailSource};
use mail_digest::pipeline::DigestRunner;
use mail_digest::render::MarkdownRenderer;
use mail_digest::store::{LibSqlBackend, TrackingStore};

/// Summarize a mailbox label into one deduplicated digest.
#[derive(Parser)]
#[command(name = "mail-digest", version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, env = "MAIL_DIGEST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Profile to run (defaults to the file's default_profile)
    #[arg(long)]
    profile: Option<String>,

    /// Reprocess messages that were already processed
    #[arg(long)]
    force: bool,

    /// Print tracking statistics as JSON and exit
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let profile = config
        .profile(cli.profile.as_deref())
        .context("resolving profile")?;

    let _guard = setup_logging(&profile.logging)?;
    tracing::info!(
        "Mail Digest v{} (profile: {})",
        env!("CARGO_PKG_VERSION"),
        profile.name
    );

    let store: Arc<dyn TrackingStore> = Arc::new(
        LibSqlBackend::new_local(&profile.database.path)
            .await
            .with_context(|| format!("opening database at {}", profile.database.path.display()))?,
    );

    if cli.stats {
        let stats = store.stats().await.context("reading tracking stats")?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(ExitCode::SUCCESS);
    }

    let runner = build_runner(&profile, store)?;
    let report = runner.run(cli.force).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    // No process::exit: the log guard has to drop to flush the file.
    Ok(if report.has_critical_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn build_runner(profile: &Profile, store: Arc<dyn TrackingStore>) -> anyhow::Result<DigestRunner> {
    let mail: Arc<dyn MailSource> = match profile.mail.source {
        MailSourceKind::Gmail => Arc::new(GmailSource::new(
            profile.mail_token().context("reading mail access token")?,
        )),
        MailSourceKind::Eml => {
            let dir = profile
                .mail
                .eml_dir
                .clone()
                .context("mail.eml_dir is required for the eml source")?;
            Arc::new(EmlDirSource::new(dir))
        }
    };

    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: profile.api_key().context("reading AI API key")?,
        model: profile.ai.model.clone(),
    })?;

    let renderer = Arc::new(MarkdownRenderer::from_profile(profile));
    Ok(DigestRunner::new(profile, mail, llm, store, renderer))
}

/// Console output plus an optional log file. `RUST_LOG` overrides the
/// profile's level. The returned guard flushes the file writer on drop.
fn setup_logging(settings: &LoggingSettings) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.level));

    let console_layer = settings.console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let (file_layer, guard) = match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .context("logging.file must name a file")?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_log_is_flushed_when_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("digest.log");
        let settings = LoggingSettings {
            level: "info".into(),
            file: Some(path.clone()),
            console_output: false,
        };

        let guard = setup_logging(&settings).unwrap();
        assert!(guard.is_some());
        tracing::error!(error = "listing failed", "Critical error in run");
        tracing::info!(processed = 0, "Run completed");
        drop(guard);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("Critical error in run"));
        assert!(written.contains("Run completed"));
    }
}
