use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gaze_core::analyzer::select_primary;
use gaze_core::enroll::{enroll_directory, enroll_images};
use gaze_core::{
    verify_pair, CosineMatcher, Embedding, EmbeddingStore, FaceAnalyzer, FaceSelection, Frame,
    Matcher, StoreError,
};
use gaze_infer::RemoteAnalyzer;
use gaze_pipeline::{
    CapturePipeline, Config, ImageDirSource, PipelineResult, ResultSink, SessionCommand,
    SessionController, StoreHandle,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "gaze", about = "Gaze face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll faces from image files or a directory tree
    Enroll {
        /// Identity to enroll the images under
        #[arg(short, long)]
        name: Option<String>,
        /// Image files containing the person's face
        images: Vec<PathBuf>,
        /// Directory with one subdirectory per identity, named after it
        #[arg(long, conflicts_with = "name")]
        dir: Option<PathBuf>,
        /// Refuse images containing more than one face
        #[arg(long)]
        strict: bool,
    },
    /// Remove an identity and all of its samples
    Remove {
        name: String,
    },
    /// List enrolled identities
    List,
    /// Check database integrity
    Verify,
    /// Print a JSON summary of the database (no embedding vectors)
    Export,
    /// Write a backup copy of the database
    Backup {
        /// Destination path (default: timestamped sibling of the database)
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Identify every face in an image against the database
    Identify {
        image: PathBuf,
        /// Override the configured similarity threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Compare the faces in two images directly, without the database
    VerifyPair {
        first: PathBuf,
        second: PathBuf,
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Run the live pipeline over a directory of frames
    ///
    /// Reads commands from stdin while running:
    ///   enroll <name>       enroll the face in the latest frame
    ///   threshold <value>   adjust the match threshold
    ///   quit                stop the pipeline
    Watch {
        /// Directory of frames to replay
        frames: PathBuf,
        /// Milliseconds between frames
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        /// Replay in a loop instead of stopping at the last frame
        #[arg(long = "loop")]
        loop_playback: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll {
            name,
            images,
            dir,
            strict,
        } => enroll(&config, name, images, dir, strict),
        Commands::Remove { name } => remove(&config, &name),
        Commands::List => list(&config),
        Commands::Verify => verify(&config),
        Commands::Export => export(&config),
        Commands::Backup { to } => backup(&config, to),
        Commands::Identify { image, threshold } => identify(&config, &image, threshold),
        Commands::VerifyPair {
            first,
            second,
            threshold,
        } => run_verify_pair(&config, &first, &second, threshold),
        Commands::Watch {
            frames,
            interval_ms,
            loop_playback,
        } => watch(config, frames, interval_ms, loop_playback).await,
    }
}

/// Open the database; the file must exist. A missing file is an error here,
/// so a mistyped path can never make a read command answer from a silently
/// empty store.
fn open_store(config: &Config) -> Result<EmbeddingStore> {
    EmbeddingStore::load(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

/// Open the database, or start a fresh one when the file does not exist
/// yet. Only enrollment entry points get this; any other failure
/// (corruption, permissions) is still surfaced.
fn open_or_create_store(config: &Config) -> Result<EmbeddingStore> {
    match EmbeddingStore::load(&config.db_path) {
        Ok(store) => Ok(store),
        Err(StoreError::Io { ref source, .. }) if source.kind() == ErrorKind::NotFound => {
            tracing::warn!(
                path = %config.db_path.display(),
                dim = config.embedding_dim,
                "database file not found, starting a fresh store"
            );
            Ok(EmbeddingStore::new(config.embedding_dim))
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to open {}", config.db_path.display()))
        }
    }
}

fn connect(config: &Config) -> Result<RemoteAnalyzer> {
    RemoteAnalyzer::connect(Duration::from_secs(config.engine_timeout_secs))
        .context("failed to reach the face engine service")
}

fn enroll(
    config: &Config,
    name: Option<String>,
    images: Vec<PathBuf>,
    dir: Option<PathBuf>,
    strict: bool,
) -> Result<()> {
    let policy = if strict {
        FaceSelection::RejectAmbiguous
    } else {
        FaceSelection::LargestBox
    };

    let mut store = open_or_create_store(config)?;
    let mut analyzer = connect(config)?;

    let report = match (dir, name) {
        (Some(dir), _) => enroll_directory(&mut store, &mut analyzer, &dir, policy)?,
        (None, Some(name)) => {
            if images.is_empty() {
                bail!("no images given for '{name}'");
            }
            enroll_images(&mut store, &mut analyzer, &name, &images, policy)?
        }
        (None, None) => bail!("either --name with image files or --dir is required"),
    };

    if report.added > 0 {
        store.save(&config.db_path)?;
    }

    println!(
        "enrolled {} sample(s), skipped {}",
        report.added,
        report.skipped.len()
    );
    for (path, reason) in &report.skipped {
        println!("  skipped {}: {reason}", path.display());
    }
    Ok(())
}

fn remove(config: &Config, name: &str) -> Result<()> {
    let mut store = open_store(config)?;
    let removed = store.remove(name)?;
    store.save(&config.db_path)?;
    println!("removed '{name}' ({removed} sample(s))");
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    if store.is_empty() {
        println!("no identities enrolled");
        return Ok(());
    }
    for (name, samples) in store.list() {
        println!("{name}: {samples} sample(s)");
    }
    Ok(())
}

fn verify(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let report = store.verify();
    println!("{} sample(s) checked", report.samples_checked);
    if report.is_ok() {
        println!("database ok");
        return Ok(());
    }
    for issue in &report.issues {
        println!("  {issue}");
    }
    bail!("{} integrity issue(s) found", report.issues.len());
}

fn export(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    println!("{}", serde_json::to_string_pretty(&store.summary())?);
    Ok(())
}

fn backup(config: &Config, to: Option<PathBuf>) -> Result<()> {
    // Backup of a database that does not exist is an error, not a no-op.
    let store = open_store(config)?;

    let destination = to.unwrap_or_else(|| {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        config.db_path.with_extension(format!("{stamp}.bak"))
    });
    store.backup(&destination)?;
    println!("backup written to {}", destination.display());
    Ok(())
}

fn identify(config: &Config, image: &Path, threshold: Option<f32>) -> Result<()> {
    let store = open_store(config)?;
    let mut analyzer = connect(config)?;
    let frame = Frame::load(image)?;
    let detections = analyzer.analyze(&frame)?;

    if detections.is_empty() {
        println!("no faces found in {}", image.display());
        return Ok(());
    }

    let threshold = threshold.unwrap_or(config.pipeline.similarity_threshold);
    for (i, detection) in detections.iter().enumerate() {
        let result = CosineMatcher.identify(detection, &store, threshold);
        match &result.identity {
            Some(name) => println!("face {}: {name} (similarity {:.3})", i + 1, result.similarity),
            None => println!("face {}: Unknown (best {:.3})", i + 1, result.similarity),
        }
    }
    Ok(())
}

fn run_verify_pair(
    config: &Config,
    first: &Path,
    second: &Path,
    threshold: Option<f32>,
) -> Result<()> {
    let mut analyzer = connect(config)?;
    let a = primary_embedding(&mut analyzer, first)?;
    let b = primary_embedding(&mut analyzer, second)?;

    let threshold = threshold.unwrap_or(config.pipeline.similarity_threshold);
    let result = verify_pair(&a, &b, threshold);
    println!(
        "similarity {:.3}: {}",
        result.similarity,
        if result.matched {
            "same person"
        } else {
            "different people"
        }
    );
    Ok(())
}

fn primary_embedding(analyzer: &mut RemoteAnalyzer, path: &Path) -> Result<Embedding> {
    let frame = Frame::load(path)?;
    let detections = analyzer.analyze(&frame)?;
    let face = select_primary(&detections, FaceSelection::LargestBox)
        .with_context(|| format!("in {}", path.display()))?;
    Ok(face.embedding.clone())
}

async fn watch(config: Config, frames: PathBuf, interval_ms: u64, loop_playback: bool) -> Result<()> {
    let store = StoreHandle::new(open_or_create_store(&config)?);
    let analyzer: Arc<Mutex<dyn FaceAnalyzer>> = Arc::new(Mutex::new(connect(&config)?));
    let source = ImageDirSource::new(&frames, Duration::from_millis(interval_ms), loop_playback)?;

    let handle = CapturePipeline::new(config.pipeline.clone()).start(
        Box::new(source),
        Arc::clone(&analyzer),
        store.clone(),
    );

    let (command_tx, command_rx) = mpsc::channel(8);
    tokio::spawn(read_commands(command_tx));

    let controller = SessionController::new(
        handle,
        store,
        analyzer,
        config.db_path.clone(),
        FaceSelection::LargestBox,
        command_rx,
    );
    let mut sink = TerminalSink;
    controller.run(&mut sink).await?;
    Ok(())
}

async fn read_commands(tx: mpsc::Sender<SessionCommand>) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let command = if let Some(name) = line.strip_prefix("enroll ") {
            SessionCommand::Enroll {
                identity: name.trim().to_string(),
            }
        } else if let Some(value) = line.strip_prefix("threshold ") {
            match value.trim().parse() {
                Ok(t) => SessionCommand::SetThreshold(t),
                Err(_) => {
                    eprintln!("not a number: {value}");
                    continue;
                }
            }
        } else if line == "quit" || line == "q" {
            SessionCommand::Quit
        } else if line.is_empty() {
            continue;
        } else {
            eprintln!("commands: enroll <name> | threshold <value> | quit");
            continue;
        };
        if tx.send(command).await.is_err() {
            break;
        }
    }
}

struct TerminalSink;

impl ResultSink for TerminalSink {
    fn render(&mut self, result: &PipelineResult) {
        if result.matches.is_empty() {
            println!(
                "frame {:>6}: no faces ({} ms)",
                result.sequence,
                result.latency.as_millis()
            );
            return;
        }
        let faces: Vec<String> = result
            .matches
            .iter()
            .map(|m| match &m.identity {
                Some(name) => format!("{name} ({:.2})", m.similarity),
                None => format!("Unknown ({:.2})", m.similarity),
            })
            .collect();
        println!(
            "frame {:>6}: {} ({} ms)",
            result.sequence,
            faces.join(", "),
            result.latency.as_millis()
        );
    }

    fn notify(&mut self, message: &str) {
        println!("* {message}");
    }
}
