mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use rx_av::{FfmpegBackend, MediaBackend, MergeTrack, ToolRegistry};
use rx_core::config::Config;
use rx_core::events::{EventBus, EventPayload};
use rx_core::ToolKind;
use rx_pipeline::tools::{export_subtitles, payload_cues, ExportFormat};
use rx_pipeline::{
    ExtractionExecutor, JsonSidecarStore, MergeExecutor, RunSummary, SessionSettings,
    SidecarStore, StageExecutor, ToolSession,
};
use tokio::sync::broadcast::error::RecvError;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "rsext=trace,rx_pipeline=trace,rx_av=trace,rx_core=debug".to_string()
        } else {
            "rsext=info,rx_pipeline=info,rx_av=warn,rx_core=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Extract {
            inputs,
            streams,
            include_video,
            output_dir,
            jobs,
        } => {
            let params = serde_json::json!({
                "streams": streams,
                "include_video": include_video,
                "output_dir": output_dir,
            });
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(extract(config_path, inputs, params, jobs))
        }
        Commands::Merge {
            video,
            tracks,
            output,
        } => {
            let tracks = tracks
                .iter()
                .map(|spec| parse_track(spec))
                .collect::<Result<Vec<_>>>()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(merge(config_path, video, tracks, output))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(config_path, &file, json))
        }
        Commands::CheckTools => check_tools(config_path),
        Commands::Versions { file, tool, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(list_versions(&file, tool.map(ToolKind::from), json))
        }
        Commands::ExportOcr {
            file,
            output,
            format,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(export_ocr(&file, &output, format.as_deref()))
        }
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn backend(config: &Config) -> Arc<dyn MediaBackend> {
    Arc::new(FfmpegBackend::new(ToolRegistry::discover(&config.tools)))
}

fn session<E: StageExecutor>(executor: E, config: &Config) -> Arc<ToolSession<E>> {
    let sidecar: Arc<dyn SidecarStore> = Arc::new(JsonSidecarStore::new());
    Arc::new(ToolSession::new(
        executor,
        sidecar,
        Arc::new(EventBus::default()),
        config,
    ))
}

/// Print job outcomes as they happen.
fn spawn_reporter<E: StageExecutor>(session: Arc<ToolSession<E>>) -> tokio::task::JoinHandle<()> {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let name = |id: rx_core::JobId| {
                session
                    .job(id)
                    .map(|j| j.source.file_name)
                    .unwrap_or_else(|| id.to_string())
            };
            match event.payload {
                EventPayload::JobCompleted { job_id, .. } => {
                    println!("✓ {}", name(job_id));
                }
                EventPayload::JobFailed { job_id, kind, error } => {
                    println!("✗ {} ({kind}): {error}", name(job_id));
                }
                EventPayload::JobCancelled { job_id } => {
                    println!("- {} cancelled", name(job_id));
                }
                EventPayload::PersistFailed { job_id, error } => {
                    eprintln!("! could not save versions for {}: {error}", name(job_id));
                }
                _ => {}
            }
        }
    })
}

/// Run every pending job of `session`; Ctrl-C cancels the batch.
async fn run_batch<E: StageExecutor>(session: Arc<ToolSession<E>>) -> Result<RunSummary> {
    let reporter = spawn_reporter(session.clone());
    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; cancelling running jobs");
                session.cancel_all();
            }
        })
    };

    let summary = session.run_pending().await;
    session.flush().await;
    interrupt.abort();
    reporter.abort();

    println!(
        "\n{} completed, {} failed, {} cancelled, {} not started",
        summary.completed, summary.failed, summary.cancelled, summary.not_admitted
    );
    if summary.failed > 0 {
        anyhow::bail!("{} job(s) failed", summary.failed);
    }
    Ok(summary)
}

async fn extract(
    config_path: Option<&Path>,
    inputs: Vec<PathBuf>,
    params: serde_json::Value,
    jobs: Option<usize>,
) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let session = session(ExtractionExecutor::new(backend(&config)), &config);
    if let Some(jobs) = jobs {
        session.update_settings(SessionSettings {
            max_concurrent: jobs,
            ..session.settings()
        });
    }

    for input in inputs {
        if let Err(e) = session.add(&input, params.clone()).await {
            tracing::warn!(path = %input.display(), "skipping input: {e}");
        }
    }
    run_batch(session).await?;
    Ok(())
}

async fn merge(
    config_path: Option<&Path>,
    video: PathBuf,
    tracks: Vec<MergeTrack>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let session = session(MergeExecutor::new(backend(&config)), &config);
    let params = serde_json::json!({ "tracks": tracks, "output": output });
    session.add(video, params).await?;
    run_batch(session).await?;
    Ok(())
}

/// `PATH[:LANG[:DELAY_MS]]`. Trailing segments only count as options when
/// they parse as such, so paths containing ':' survive.
fn parse_track(spec: &str) -> Result<MergeTrack> {
    let is_language = |s: &str| (2..=3).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphabetic());

    let mut input = spec;
    let mut language = None;
    let mut delay_ms = 0;
    if let Some((head, last)) = input.rsplit_once(':') {
        if let Ok(delay) = last.parse::<i64>() {
            delay_ms = delay;
            input = head;
            if let Some((head, lang)) = input.rsplit_once(':').filter(|(_, l)| is_language(l)) {
                language = Some(lang.to_string());
                input = head;
            }
        } else if is_language(last) {
            language = Some(last.to_string());
            input = head;
        }
    }

    if input.is_empty() {
        anyhow::bail!("track '{spec}' has no path");
    }
    Ok(MergeTrack {
        input: PathBuf::from(input),
        delay_ms,
        language,
        title: None,
        default: false,
        forced: false,
    })
}

async fn probe_file(config_path: Option<&Path>, file: &Path, json: bool) -> Result<()> {
    rx_av::validate_media_path(file)?;
    let config = Config::load_or_default(config_path);
    let metadata = backend(&config)
        .probe(file)
        .await
        .with_context(|| format!("probing {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("File: {}", metadata.path.display());
    if let Some(ref format) = metadata.format_name {
        println!("Container: {format}");
    }
    if let Some(size) = metadata.size_bytes {
        println!("Size: {size} bytes");
    }
    if let Some(duration) = metadata.duration_secs {
        let secs = duration as u64;
        println!(
            "Duration: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }

    println!("\nStreams: {}", metadata.streams.len());
    for stream in &metadata.streams {
        print!("  [{}] {} {}", stream.index, stream.kind, stream.codec);
        if let (Some(w), Some(h)) = (stream.width, stream.height) {
            print!(" {w}x{h}");
        }
        if let Some(ch) = stream.channels {
            print!(" {ch}ch");
        }
        if let Some(ref lang) = stream.language {
            print!(" ({lang})");
        }
        if let Some(ref title) = stream.title {
            print!(" \"{title}\"");
        }
        if stream.default {
            print!(" [default]");
        }
        if stream.forced {
            print!(" [forced]");
        }
        println!();
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        if let Some(ref problem) = tool.problem {
            print!(": {problem}");
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
        Ok(())
    } else {
        anyhow::bail!("Some tools are missing. Install ffmpeg and ffprobe or set their paths in the config.")
    }
}

async fn list_versions(file: &Path, tool: Option<ToolKind>, json: bool) -> Result<()> {
    let data = JsonSidecarStore::new()
        .load(file)
        .await
        .with_context(|| format!("reading sidecar of {}", file.display()))?;
    let Some(data) = data else {
        println!("No saved versions for {}", file.display());
        return Ok(());
    };

    let sections: Vec<_> = data
        .tools
        .iter()
        .filter(|(kind, _)| tool.is_none_or(|t| t == **kind))
        .collect();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = sections
            .iter()
            .map(|(kind, section)| Ok((kind.to_string(), serde_json::to_value(section)?)))
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    for (kind, section) in sections {
        println!("{kind}: {} version(s)", section.versions.len());
        for version in &section.versions {
            let marker = if section.active_version_id == Some(version.id) {
                "*"
            } else {
                " "
            };
            print!(
                " {marker} {} ({}, {:?})",
                version.name,
                version.created_at.format("%Y-%m-%d %H:%M:%S"),
                version.outcome
            );
            if version.edited_at.is_some() {
                print!(" [edited]");
            }
            println!();
        }
    }
    Ok(())
}

async fn export_ocr(file: &Path, output: &Path, format: Option<&str>) -> Result<()> {
    let data = JsonSidecarStore::new()
        .load(file)
        .await
        .with_context(|| format!("reading sidecar of {}", file.display()))?
        .with_context(|| format!("no saved versions for {}", file.display()))?;
    let section = data
        .tools
        .get(&ToolKind::Ocr)
        .context("no OCR results saved for this file")?;
    let version = section
        .active_version_id
        .and_then(|id| section.versions.iter().find(|v| v.id == id))
        .context("no active OCR version")?;

    let format: ExportFormat = match format {
        Some(f) => f.parse()?,
        None => output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("srt")
            .parse()?,
    };
    let cues = payload_cues(&version.payload)?;
    export_subtitles(&cues, output, format)?;
    println!(
        "Exported {} cue(s) from {} to {}",
        cues.len(),
        version.name,
        output.display()
    );
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for warning in &warnings {
            println!("! {warning}");
        }
    }
    println!(
        "  Max concurrent jobs: {}",
        config.jobs.effective_concurrency()
    );
    println!("  Edit debounce: {} ms", config.jobs.edit_debounce_ms);
    println!("  Cache dir: {}", config.cache.dir.display());
    println!(
        "  Translation batches: {} (max {})",
        config.translation.default_batch_count, config.translation.max_batch_count
    );
    println!("  OCR: {} fps, min confidence {}", config.ocr.fps, config.ocr.min_confidence);
    Ok(())
}
