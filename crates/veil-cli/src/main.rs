use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;
use veil_core::payload;
use veil_engine::{spawn_engine, EngineHandle, EngineOptions, ImageInput, OnnxModels};
use veil_gallery::{Gallery, SqliteGalleryStore};
use veil_pipeline::{
    ConfigStore, Controller, Inspector, MemoryDocument, NodeId, PictureSpec, PictureState,
    PipelineTuning,
};

#[derive(Parser)]
#[command(name = "veil", about = "Hide pictures of chosen people")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add (or replace) a person using one or more reference photos
    Add {
        /// Person name
        #[arg(short, long)]
        name: String,
        /// Reference photos
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List people in the gallery
    List {
        /// Print the entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a person from the gallery
    Remove { name: String },
    /// Remove everyone from the gallery
    Clear,
    /// Write the gallery to a JSON file
    Export { file: PathBuf },
    /// Merge a previously exported gallery
    Import { file: PathBuf },
    /// Show engine, gallery and settings status
    Status,
    /// Run the full pipeline over local pictures and report each verdict
    Check {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

/// Locations of the gallery, settings and models, from `VEIL_*` variables with defaults.
struct Paths {
    db: PathBuf,
    settings: PathBuf,
    models: PathBuf,
}

impl Paths {
    fn from_env() -> Self {
        let data_dir = veil_core::default_data_dir();
        Self {
            db: std::env::var("VEIL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("gallery.db")),
            settings: std::env::var("VEIL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("settings.toml")),
            models: std::env::var("VEIL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| veil_core::default_model_dir()),
        }
    }

    fn gallery(&self) -> Result<Arc<Gallery>> {
        let store = SqliteGalleryStore::open(&self.db)
            .with_context(|| format!("opening gallery at {}", self.db.display()))?;
        Ok(Arc::new(Gallery::new(Arc::new(store))))
    }

    fn engine(&self, tuning: &PipelineTuning) -> Result<EngineHandle> {
        let options = EngineOptions {
            model_ready_timeout: tuning.model_ready_wait(),
            thorough_wait: tuning.thorough_wait(),
            ..EngineOptions::default()
        };
        Ok(spawn_engine(Arc::new(OnnxModels::in_dir(&self.models)), options)?)
    }
}

/// Read an image file into a `data:` URL.
fn read_payload(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let format = image::guess_format(&bytes).with_context(|| format!("{} is not an image", path.display()))?;
    Ok(payload::encode_data_url(format.to_mime_type(), &bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::from_env();

    match cli.command {
        Commands::Add { name, images } => {
            let config = ConfigStore::load(&paths.settings)?;
            let engine = paths.engine(config.tuning())?;
            let gallery = paths.gallery()?;

            let mut embeddings = Vec::new();
            let mut quality = Vec::new();
            for path in &images {
                let image = ImageInput::Payload(read_payload(path)?);
                match engine.enroll(image).await {
                    Ok(result) => {
                        println!(
                            "  {}: face {}x{} (score {:.2})",
                            path.display(),
                            result.quality.face_width,
                            result.quality.face_height,
                            result.quality.detection_score
                        );
                        embeddings.push(result.embedding);
                        quality.push(result.quality);
                    }
                    Err(e) => eprintln!("  {}: skipped ({e})", path.display()),
                }
            }
            if embeddings.is_empty() {
                bail!("no usable face in any of the {} photo(s)", images.len());
            }

            let entry = gallery.add(&name, embeddings, Some(quality))?;
            println!("Stored {} with {} reference embedding(s)", entry.person, entry.embeddings.len());
        }
        Commands::List { json } => {
            let entries = paths.gallery()?.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("Gallery is empty");
            } else {
                for entry in entries {
                    println!(
                        "{:<24} {:>2} embedding(s)  updated {}",
                        entry.person,
                        entry.embeddings.len(),
                        entry.updated_at
                    );
                }
            }
        }
        Commands::Remove { name } => {
            if paths.gallery()?.delete(&name)? {
                println!("Removed {name}");
            } else {
                println!("{name} is not in the gallery");
            }
        }
        Commands::Clear => {
            paths.gallery()?.clear()?;
            println!("Gallery cleared");
        }
        Commands::Export { file } => {
            let json = paths.gallery()?.export_json()?;
            std::fs::write(&file, json).with_context(|| format!("writing {}", file.display()))?;
            println!("Exported gallery to {}", file.display());
        }
        Commands::Import { file } => {
            let json = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = paths.gallery()?.import_json(&json)?;
            println!("Imported {} entr(y/ies)", report.imported);
            for person in report.rejected {
                println!("  rejected: {person}");
            }
        }
        Commands::Status => {
            let config = ConfigStore::load(&paths.settings)?;
            let gallery = paths.gallery()?;
            let engine = paths.engine(config.tuning())?;
            if let Err(e) = engine.wait_ready().await {
                eprintln!("models: {e}");
            }
            let status = engine.status().await?;
            let settings = config.get();

            println!("gallery:     {} ({} people)", paths.db.display(), gallery.list()?.len());
            println!("models:      {}", paths.models.display());
            println!("  ready:     {}", status.models_ready);
            println!("  thorough:  {}", status.thorough_loaded);
            println!("settings:    {}", paths.settings.display());
            println!("  enabled:   {}", settings.enabled);
            println!("  threshold: {}", settings.match_threshold);
            println!("  mode:      {}", settings.detector_mode);
        }
        Commands::Check { images } => check(&paths, images).await?,
    }

    Ok(())
}

/// Build an in-memory document from local files and run the pipeline over it.
async fn check(paths: &Paths, images: Vec<PathBuf>) -> Result<()> {
    let config = Arc::new(ConfigStore::load(&paths.settings)?);
    let tuning = config.tuning().clone();
    let gallery = paths.gallery()?;
    let engine = Arc::new(paths.engine(&tuning)?);

    let document = Arc::new(MemoryDocument::new());
    let mut pictures: Vec<(PathBuf, NodeId)> = Vec::new();
    for path in images {
        let (width, height) = match image::image_dimensions(&path) {
            Ok(dims) => dims,
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                continue;
            }
        };
        let locator = read_payload(&path)?;
        let id = document.add_picture(None, PictureSpec::loaded(locator, width as f32, height as f32));
        pictures.push((path, id));
    }
    if pictures.is_empty() {
        bail!("no readable pictures");
    }

    let controller = Controller::new(document.clone(), engine, gallery, config.clone());
    let inspector = controller.inspector();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let pipeline = tokio::spawn(controller.run(async {
        let _ = stop_rx.await;
    }));

    // Every picture either settles or is given up on after its detection timeout.
    let budget = tuning.model_ready_wait() + tuning.detect_timeout() * pictures.len() as u32;
    let settled = wait_for_verdicts(&inspector, &pictures, budget).await;
    let _ = stop_tx.send(());
    pipeline.await??;

    for (path, id) in &pictures {
        match inspector.state(*id) {
            Some(PictureState::Blocked) => match inspector.blocked_info(*id) {
                Some(info) => println!("{}: blocked ({}, distance {:.3})", path.display(), info.person, info.distance),
                None => println!("{}: blocked", path.display()),
            },
            Some(state) if state.is_terminal() => println!("{}: {state:?}", path.display()),
            _ => println!("{}: not evaluated", path.display()),
        }
    }
    if !settled {
        eprintln!("some pictures did not reach a verdict within {budget:?}");
    }
    Ok(())
}

async fn wait_for_verdicts(inspector: &Inspector, pictures: &[(PathBuf, NodeId)], budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let done = pictures
            .iter()
            .all(|(_, id)| inspector.state(*id).is_some_and(PictureState::is_terminal));
        if done {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
