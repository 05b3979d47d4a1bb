use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{DetectionTable, ImageInput};
use rollcall_engine::{parse_roster, AttendanceEngine, EngineConfig, StoragePath, VerifyRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Parser)]
#[command(name = "rollcall", about = "Attendance from classroom photos")]
struct Cli {
    /// TOML config file; ROLLCALL_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match classroom photos against a roster and store annotated copies
    Verify {
        /// Classroom photos
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Roster JSON: [{ "id": .., "embeddings": [{ "image": .., "embedding": [..] }] }]
        #[arg(short, long)]
        roster: PathBuf,
        /// Face detections for the photos, keyed by file name
        #[arg(short, long)]
        detections: PathBuf,
        /// Subject id, used with --lecture to build the storage path
        #[arg(long, requires = "lecture", conflicts_with = "path")]
        subject: Option<String>,
        /// Lecture id
        #[arg(long, requires = "subject")]
        lecture: Option<String>,
        /// Explicit storage path prefix
        #[arg(long)]
        path: Option<String>,
        /// Match threshold (overrides config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Build reference embeddings from one student's photos
    Enroll {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Face detections for the photos, keyed by file name
        #[arg(short, long)]
        detections: PathBuf,
    },
    /// Build a roster from a directory with one sub-directory of photos per student
    Roster {
        /// Directory whose sub-directories are named by student id
        dir: PathBuf,
        /// Face detections keyed by "<student id>/<file name>"
        #[arg(short, long)]
        detections: PathBuf,
        /// Write the roster here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show effective configuration and stored objects
    Status {
        /// Only count objects under this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Verify {
            images,
            roster,
            detections,
            subject,
            lecture,
            path,
            threshold,
        } => {
            if let Some(threshold) = threshold {
                ensure!(
                    threshold.is_finite() && threshold > 0.0,
                    "threshold must be a positive number, got {threshold}"
                );
                config.match_threshold = threshold;
            }
            let storage_path = match (subject, lecture, path) {
                (Some(subject), Some(lecture), None) => StoragePath::lecture(&subject, &lecture),
                (None, None, Some(path)) => path,
                _ => bail!("give either --subject and --lecture, or --path"),
            };

            let roster_json = std::fs::read_to_string(&roster)
                .with_context(|| format!("cannot read roster {}", roster.display()))?;
            let request = VerifyRequest {
                images: read_images(&images)?,
                roster: parse_roster(&roster_json)?,
                storage_path,
            };

            let extractor = Arc::new(DetectionTable::load(&detections)?);
            let engine = AttendanceEngine::from_config(config, extractor);
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let response = engine.verify(request, &cancel).await?;
            let failed = response.results.iter().filter(|r| r.is_failed()).count();
            if failed > 0 {
                tracing::warn!(failed, "some images were not recorded");
            }
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Enroll { images, detections } => {
            let extractor = Arc::new(DetectionTable::load(&detections)?);
            let engine = AttendanceEngine::from_config(config, extractor);
            let response = engine.enroll(read_images(&images)?).await?;
            if response.embeddings.is_empty() {
                tracing::warn!("no face found in any photo");
            }
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Roster { dir, detections, out } => {
            let extractor = Arc::new(DetectionTable::load(&detections)?);
            let engine = AttendanceEngine::from_config(config, extractor);
            let students = read_student_dirs(&dir)?;
            tracing::info!(students = students.len(), dir = %dir.display(), "building roster");
            let roster = engine.build_roster(students).await?;
            let json = serde_json::to_string_pretty(&roster)?;
            match out {
                Some(out) => {
                    std::fs::write(&out, json)
                        .with_context(|| format!("cannot write {}", out.display()))?;
                    tracing::info!(path = %out.display(), entries = roster.len(), "roster written");
                }
                None => println!("{json}"),
            }
        }
        Commands::Status { prefix } => {
            let store = rollcall_store::open(&config.store);
            let objects = store.keys(&prefix).await?.len();
            let status = serde_json::json!({
                "config": config,
                "dryRun": config.is_dry_run(),
                "objects": objects,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

/// Stop starting new images once the user interrupts.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing in-flight images");
            cancel.cancel();
        }
    });
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<ImageInput>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read image {}", path.display()))?;
            Ok(ImageInput::new(file_name(path)?, bytes))
        })
        .collect()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Student photos from `dir/<student id>/*`, sorted by id then file name.
///
/// Each image is identified as `<student id>/<file name>`.
fn read_student_dirs(dir: &Path) -> Result<Vec<(String, Vec<ImageInput>)>> {
    let mut student_dirs: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    student_dirs.sort();

    let mut students = Vec::with_capacity(student_dirs.len());
    for student_dir in student_dirs {
        let id = file_name(&student_dir)?;
        let mut photos: Vec<PathBuf> = std::fs::read_dir(&student_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        photos.sort();

        let mut images = Vec::with_capacity(photos.len());
        for photo in photos {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("cannot read image {}", photo.display()))?;
            images.push(ImageInput::new(format!("{id}/{}", file_name(&photo)?), bytes));
        }
        students.push((id, images));
    }
    Ok(students)
}
