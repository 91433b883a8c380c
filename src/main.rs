use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slidecast::{
    Config, ExternalTools, FailurePolicy, MediaBackend, PipelineOrchestrator, ProviderKind,
    ProviderRegistry, Router,
};

fn cli() -> Command {
    Command::new("slidecast")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Turn a document into a narrated slide video")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("FILE")
                .help("Document to convert (.txt, .md, .pdf, .docx)")
                .required_unless_present("check-providers")
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Path of the final video (default: <output-dir>/final_video.mp4)")
        )
        .arg(
            Arg::new("output-dir")
                .short('d')
                .long("output-dir")
                .value_name("DIR")
                .help("Directory for intermediate artifacts")
        )
        .arg(
            Arg::new("engine")
                .short('e')
                .long("engine")
                .value_name("ENGINE")
                .help("Use only this provider: ollama, llamacpp or yandexgpt")
        )
        .arg(
            Arg::new("model")
                .short('m')
                .long("model")
                .value_name("MODEL")
                .help("Model name to request from every provider")
        )
        .arg(
            Arg::new("parallel")
                .short('p')
                .long("parallel")
                .help("Process scenes concurrently")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("max-workers")
                .long("max-workers")
                .value_name("NUM")
                .help("Concurrent scenes in parallel mode")
                .value_parser(clap::value_parser!(usize))
        )
        .arg(
            Arg::new("max-scene-chars")
                .long("max-scene-chars")
                .value_name("NUM")
                .help("Maximum characters per scene")
                .value_parser(clap::value_parser!(usize))
        )
        .arg(
            Arg::new("abort-on-scene-error")
                .long("abort-on-scene-error")
                .help("Fail the run when any scene fails instead of skipping it")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("trace, debug, info, warn or error")
        )
        .arg(
            Arg::new("check-providers")
                .long("check-providers")
                .help("Probe every configured LLM provider and exit")
                .action(ArgAction::SetTrue)
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let loaded = Config::load(config_path.as_deref());

    // Initialize logging; RUST_LOG wins over --log-level and the config file
    let level = matches
        .get_one::<String>("log-level")
        .cloned()
        .or_else(|| loaded.as_ref().ok().map(|c| c.output.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("slidecast={},warn", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = loaded.context("Failed to load configuration")?;

    if let Some(dir) = matches.get_one::<String>("output-dir") {
        config.output.base_dir = PathBuf::from(dir);
    }
    if let Some(video) = matches.get_one::<String>("output") {
        config.output.video_path = Some(PathBuf::from(video));
    }
    if matches.get_flag("parallel") {
        config.pipeline.parallel = true;
    }
    if let Some(workers) = matches.get_one::<usize>("max-workers") {
        config.pipeline.max_workers = *workers;
    }
    if let Some(chars) = matches.get_one::<usize>("max-scene-chars") {
        config.pipeline.max_scene_chars = *chars;
    }
    if matches.get_flag("abort-on-scene-error") {
        config.pipeline.failure_policy = FailurePolicy::Abort;
    }

    config.validate().context("Invalid configuration")?;

    let engine = matches
        .get_one::<String>("engine")
        .map(|e| e.parse::<ProviderKind>())
        .transpose()
        .map_err(|e| anyhow!(e))?;

    let registry = match engine {
        Some(kind) => ProviderRegistry::forced(&config, kind)?,
        None => ProviderRegistry::from_config(&config)?,
    };

    if matches.get_flag("check-providers") {
        return check_providers(&registry).await;
    }

    let input = matches
        .get_one::<String>("input")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("--input is required"))?;
    if !input.exists() {
        error!("Input document does not exist: {}", input.display());
        return Err(anyhow!("Input document not found: {}", input.display()));
    }

    info!("🚀 Slidecast starting...");
    info!("📄 Input document: {}", input.display());
    info!("{}", config.summary());

    let model = matches.get_one::<String>("model").cloned();
    if let Some(ref model) = model {
        info!("🧠 Model override: {}", model);
    }

    let router = Router::new(Arc::new(registry), config.routing.clone()).with_model_override(model);
    let media: Arc<dyn MediaBackend> = Arc::new(ExternalTools::new(config.media.clone())?);
    let pipeline = PipelineOrchestrator::new(config, Arc::new(router), media);

    let report = pipeline.run(&input).await.map_err(|e| {
        error!("❌ Pipeline failed: {}", e);
        anyhow!(e)
    })?;

    info!("🎉 Done in {:.2}s", report.total_time.as_secs_f64());
    info!("✅ Scenes in video: {}/{}", report.assembled_scenes, report.total_scenes);
    if !report.skipped.is_empty() {
        warn!("⚠️ {} scene issues, see {}", report.skipped.len(), pipeline.layout().report_path().display());
    }

    Ok(())
}

async fn check_providers(registry: &ProviderRegistry) -> Result<()> {
    info!("🔍 Checking LLM providers...");
    let results = registry.probe_all().await;

    for (kind, available) in &results {
        if *available {
            info!("✅ {} is available", kind);
        } else {
            warn!("❌ {} is not reachable", kind);
        }
    }

    if results.iter().any(|(_, available)| *available) {
        Ok(())
    } else {
        Err(anyhow!("No LLM provider is reachable"))
    }
}
