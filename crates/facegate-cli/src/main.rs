use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::records::{resolve_label, IdentityLabel};
use facegate_core::vision::{crop_face, FaceDetector, FaceEmbedder};
use facegate_core::{
    encode_samples, DetectingEmbedder, EuclideanMatcher, GalleryStore, Matcher, OnnxFaceEmbedder,
    SampleStore, ScrfdFaceDetector, SqliteUserRecords, UserRecordStore, DETECTOR_MODEL_FILE,
    EMBEDDER_MODEL_FILE,
};
use facegate_hw::Camera;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face enrollment and identification CLI")]
struct Cli {
    /// Data directory [default: $XDG_DATA_HOME/facegate]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Gallery file [default: <data-dir>/gallery.json]
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
    /// User record database [default: <data-dir>/users.db]
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities and their user records
    List,
    /// Identify every face in a still image
    Match {
        /// Image file to identify
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,
        /// Directory holding the ONNX models [default: <data-dir>/models]
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Maximum embedding distance accepted as a match
        #[arg(long, default_value_t = 0.60)]
        threshold: f32,
    },
    /// Re-encode stored face samples into the gallery
    Encode {
        /// Sample directory [default: <data-dir>/dataset]
        #[arg(long)]
        samples: Option<PathBuf>,
        /// Directory holding the ONNX models [default: <data-dir>/models]
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

struct Paths {
    data_dir: PathBuf,
    gallery: PathBuf,
    db: PathBuf,
}

impl Paths {
    fn resolve(cli: &Cli) -> Self {
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(facegate_core::default_data_dir);
        Self {
            gallery: cli
                .gallery
                .clone()
                .unwrap_or_else(|| data_dir.join("gallery.json")),
            db: cli.db.clone().unwrap_or_else(|| data_dir.join("users.db")),
            data_dir,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(&cli);

    match cli.command {
        Commands::List => list(&paths),
        Commands::Match {
            image_path,
            model_dir,
            threshold,
        } => {
            let model_dir = model_dir.unwrap_or_else(|| paths.data_dir.join("models"));
            match_image(&paths, &image_path, &model_dir, threshold)
        }
        Commands::Encode { samples, model_dir } => {
            let samples = samples.unwrap_or_else(|| paths.data_dir.join("dataset"));
            let model_dir = model_dir.unwrap_or_else(|| paths.data_dir.join("models"));
            encode(&paths, &samples, &model_dir)
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
    }
}

fn list(paths: &Paths) -> Result<()> {
    let gallery = GalleryStore::open(&paths.gallery)
        .with_context(|| format!("reading gallery {}", paths.gallery.display()))?
        .snapshot();
    let records = SqliteUserRecords::open(&paths.db).context("opening user records")?;

    if gallery.is_empty() {
        println!("No identities enrolled");
    }
    for entry in gallery.entries() {
        match records.lookup_by_identity(&entry.identity)? {
            Some(record) => println!("{}  #{} {}", entry.identity, record.record_id, record.name),
            None => println!("{}  (no user record)", entry.identity),
        }
    }
    if !gallery.is_empty() {
        println!("{} identities", gallery.len());
    }

    // Records whose embedding never reached the gallery.
    let orphans: Vec<_> = records
        .list()?
        .into_iter()
        .filter(|(_, _, _, face_id)| !gallery.entries().iter().any(|e| e.identity.as_str() == face_id))
        .collect();
    if !orphans.is_empty() {
        println!("\nUser records without an enrolled face:");
        for (record_id, name, email, face_id) in orphans {
            println!("  #{record_id} {name} <{}> {face_id}", email.as_deref().unwrap_or("-"));
        }
    }
    Ok(())
}

fn encode(paths: &Paths, samples_dir: &Path, model_dir: &Path) -> Result<()> {
    let samples = SampleStore::new(samples_dir);
    let gallery = GalleryStore::open(&paths.gallery)
        .with_context(|| format!("reading gallery {}", paths.gallery.display()))?;
    let mut embedder = DetectingEmbedder::new(
        Box::new(ScrfdFaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?),
        Box::new(OnnxFaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL_FILE))?),
    );

    let report = encode_samples(&samples, &mut embedder, &gallery)
        .with_context(|| format!("encoding samples in {}", samples_dir.display()))?;

    for identity in &report.added {
        println!("{identity}  added");
    }
    for identity in &report.replaced {
        println!("{identity}  updated");
    }
    for identity in &report.no_face {
        println!("{identity}  no face found in sample");
    }
    for (identity, reason) in &report.failed {
        println!("{identity}  failed: {reason}");
    }
    println!(
        "{} encoded, {} without a face, {} failed; gallery holds {}",
        report.encoded(),
        report.no_face.len(),
        report.failed.len(),
        gallery.len()
    );
    Ok(())
}

fn match_image(paths: &Paths, image_path: &Path, model_dir: &Path, threshold: f32) -> Result<()> {
    let frame = image::open(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?
        .to_rgb8();
    let gallery = GalleryStore::open(&paths.gallery)?.snapshot();
    let records = SqliteUserRecords::open(&paths.db).context("opening user records")?;
    let mut detector = ScrfdFaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
    let mut embedder = OnnxFaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL_FILE))?;
    let matcher = EuclideanMatcher::new(threshold);

    let faces = detector.detect_faces(&frame)?;
    if faces.is_empty() {
        println!("No faces found");
        return Ok(());
    }

    for face in &faces {
        let position = format!("({:.0}, {:.0}) {:.0}x{:.0}", face.x, face.y, face.width, face.height);
        let Some(probe) = crop_face(&frame, face)
            .map(|crop| embedder.embed(&crop))
            .transpose()?
            .and_then(|found| found.into_iter().next())
        else {
            println!("{position}  could not be encoded");
            continue;
        };

        let result = matcher.find(&probe, &gallery);
        let distance = result
            .distance
            .map_or_else(|| "-".to_string(), |d| format!("{d:.3}"));
        match &result.identity {
            Some(identity) => {
                let label = match resolve_label(&records, identity) {
                    IdentityLabel::Recorded(text) => text,
                    IdentityLabel::Unrecorded(text) => format!("{text} (no user record)"),
                };
                println!("{position}  {label}  distance {distance}");
            }
            None => println!("{position}  Unknown  nearest {distance}"),
        }
    }
    Ok(())
}
