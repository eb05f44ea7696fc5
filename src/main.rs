use docqa::cli::{Cli, Commands, ConfigAction};
use docqa::config::{Config, ConfigValidator};
use docqa::engine::{Answer, Engine, EngineParts};
use docqa::error::{DocqaError, Result};
use docqa::generation::{ModelServiceClient, SamplingParams};
use docqa::index::parse_chunk_file;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Config { action } => cmd_config(cli.config, cli.profile, action),
        Commands::Health => cmd_health(cli.config, cli.profile),
        command => run_engine_command(cli.config, cli.profile, command),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "docqa=debug" } else { "docqa=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Build the engine outside the runtime, then drive the command on it
///
/// The engine may own blocking HTTP clients, which must not be created or
/// dropped on a runtime thread; the runtime is dropped first.
fn run_engine_command(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    command: Commands,
) -> Result<()> {
    let mut config = load_config(config_path, profile)?;
    config.storage.data_dir = expand_path(&config.storage.data_dir)?;

    let needs_cross_encoder = matches!(command, Commands::Ask { .. });
    let parts = EngineParts::from_config(&config, needs_cross_encoder)?;
    let engine = Engine::new(config, parts)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| DocqaError::Io {
            source: e,
            context: "Failed to start async runtime".to_string(),
        })?;

    let result = runtime.block_on(async {
        engine.load().await;
        match command {
            Commands::Index { file } => cmd_index(&engine, &file).await,
            Commands::Ask {
                query,
                user,
                no_expand,
                generate,
                json,
            } => cmd_ask(&engine, &query, user, !no_expand, generate, json).await,
            Commands::Status => cmd_status(&engine).await,
            Commands::Usage => cmd_usage(&engine),
            Commands::Unanswered { limit } => cmd_unanswered(&engine, limit),
            Commands::Config { .. } | Commands::Health => Ok(()),
        }
    });

    drop(runtime);
    result
}

async fn cmd_index(engine: &Engine, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to read chunk file: {}", file.display()),
    })?;
    let chunks = parse_chunk_file(&content)?;

    let outcome = engine.rebuild(chunks).await?;
    match outcome.generation_id {
        Some(id) => {
            println!("✓ Indexed {} chunks", outcome.indexed);
            println!("  Generation: {}", id);
        }
        None => println!("No chunks found in {}; index unchanged", file.display()),
    }
    Ok(())
}

async fn cmd_ask(
    engine: &Engine,
    query: &str,
    user: u64,
    expand: bool,
    generate: bool,
    json: bool,
) -> Result<()> {
    if generate {
        let response = engine.respond(query, user, expand).await?;
        if json {
            print_json(&response)?;
            return Ok(());
        }
        print_answer(&response.answer);
        if let Some(generation) = &response.generation {
            println!();
            println!("{}", generation.text);
        }
        if let Some(usage) = &response.usage {
            println!();
            println!(
                "Usage {}: {} / {} tokens ({:.1}%)",
                usage.month_key,
                usage.tokens_used,
                usage.limit,
                usage.ratio * 100.0
            );
        }
        return Ok(());
    }

    let answer = engine.answer(query, user, expand).await?;
    if json {
        print_json(&answer)?;
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    let fallback = if answer.fell_back {
        format!(" (fell back from {})", answer.strategy_requested)
    } else {
        String::new()
    };
    println!("Strategy: {}{}", answer.strategy_used, fallback);
    println!("Decision: {}", answer.decision.reason());
    if answer.variants.len() > 1 {
        println!("Query variants:");
        for variant in &answer.variants[1..] {
            println!("  - {}", variant);
        }
    }

    if answer.hits.is_empty() {
        println!("No results.");
        return;
    }
    println!();
    for (rank, hit) in answer.hits.iter().enumerate() {
        println!("{}. [{:.4}] {}", rank + 1, hit.score, hit.text);
    }
}

async fn cmd_status(engine: &Engine) -> Result<()> {
    let status = engine.status().await;

    println!("Index");
    println!("  Chunks: {}", status.corpus_size);
    println!(
        "  Generation: {}",
        status.generation_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Embedding model: {} ({} dims)",
        status.embedding_model, status.dimension
    );
    println!(
        "  Cross-encoder: {}",
        status.cross_encoder.as_deref().unwrap_or("(not loaded)")
    );
    println!("  Workers: {}", status.workers);
    println!("Usage");
    println!(
        "  {}: {} / {} tokens",
        status.usage.month_key, status.usage.tokens_used, status.usage.limit
    );
    Ok(())
}

fn cmd_usage(engine: &Engine) -> Result<()> {
    let usage = engine.usage();
    let limit = if usage.limit == 0 {
        "unlimited".to_string()
    } else {
        usage.limit.to_string()
    };
    println!(
        "{}: {} / {} tokens ({:.1}%)",
        usage.month_key,
        usage.tokens_used,
        limit,
        usage.ratio() * 100.0
    );
    Ok(())
}

fn cmd_unanswered(engine: &Engine, limit: usize) -> Result<()> {
    let db = engine
        .database()
        .ok_or_else(|| DocqaError::Config("No database configured".to_string()))?;
    let questions = db.recent_unanswered(limit)?;

    if questions.is_empty() {
        println!("No unanswered questions recorded.");
        return Ok(());
    }
    for question in questions {
        let score = question
            .top_score
            .map(|s| format!("{:.4}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  [{} {} {}] user {}: {}",
            question.asked_at.format("%Y-%m-%d %H:%M"),
            question.strategy,
            question.reason,
            score,
            question.user_id,
            question.query
        );
    }
    Ok(())
}

fn cmd_health(config_path: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let client = ModelServiceClient::new(
        &config.generation.service_url,
        Duration::from_secs(config.generation.timeout_secs),
        SamplingParams {
            temperature: config.generation.temperature,
            top_p: config.generation.top_p,
        },
        &config.embedding.model,
        config.embedding.dimension,
    )?;

    match client.health() {
        Ok(health) => {
            println!("✓ Model service at {}: {}", client.base_url(), health.status);
            println!("  Models loaded: {}", health.models_loaded);
            Ok(())
        }
        Err(e) => {
            println!("✗ Model service at {} is not reachable", client.base_url());
            Err(e.into())
        }
    }
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, profile)?;
            print_json(&config)?;
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DocqaError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'docqa config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| DocqaError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })?;
    println!("{}", json);
    Ok(())
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| DocqaError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| DocqaError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
