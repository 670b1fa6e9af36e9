use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contact_compliance::config::PipelineConfig;
use contact_compliance::pipeline::{self, load_sources, write_export};

/// Main entry point for the application.
///
/// Runs one batch over the vCard files named on the command line:
/// - Logging and tracing.
/// - Configuration loading.
/// - Source loading (one source per file).
/// - Import, compliance and deduplication on a blocking worker.
/// - Export of the surviving records to `OUTPUT_PATH`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contact_compliance=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        anyhow::bail!("usage: contact-compliance <file.vcf>...");
    }

    // Load configuration
    let config = PipelineConfig::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let sources = load_sources(&paths).await?;
    tracing::info!("Loaded {} source file(s)", sources.len());

    let output_path = config.output_path.clone();
    let report = tokio::task::spawn_blocking(move || {
        let pipeline = pipeline::in_memory(config)?;
        pipeline.run(sources)
    })
    .await??;

    write_export(Path::new(&output_path), &report.active).await?;

    tracing::info!("Batch summary: {}", serde_json::to_string(&report.summary)?);
    for item in &report.review {
        tracing::warn!(
            "Needs review ({}): {}",
            item.kind(),
            item.record_ids().join(", ")
        );
    }

    Ok(())
}
