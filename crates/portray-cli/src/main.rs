use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portray_contracts::envelope;
use portray_contracts::events::EventLog;
use portray_contracts::images::ImageData;
use portray_contracts::request::SynthesisRequest;
use portray_engine::{
    FallbackConfig, GeminiBackend, LikenessValidator, Orchestrator, StubBackend, SynthesisBackend,
};
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(name = "portray", version, about = "Likeness-preserving image synthesis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the synthesis fallback sequence for a JSON request payload.
    Synthesize(SynthesizeArgs),
    /// Score an already-generated image against its reference photos.
    Validate(ValidateArgs),
}

#[derive(Debug, Parser)]
struct SynthesizeArgs {
    /// Request payload path, or `-` for stdin.
    #[arg(long)]
    request: PathBuf,
    /// Directory to write the produced image into.
    #[arg(long)]
    out: Option<PathBuf>,
    /// events.jsonl path for the per-call attempt trail.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Use the offline stub backend instead of the live API.
    #[arg(long)]
    stub: bool,
}

#[derive(Debug, Parser)]
struct ValidateArgs {
    #[arg(long)]
    request: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    stub: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("portray error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Synthesize(args) => run_synthesize(args),
        Command::Validate(args) => run_validate(args),
    }
}

fn run_synthesize(args: SynthesizeArgs) -> Result<i32> {
    let payload = read_payload(&args.request)?;
    let request = SynthesisRequest::from_payload(&payload)?;
    let config = FallbackConfig::from_env();
    let events = args
        .events
        .as_ref()
        .map(|path| EventLog::with_fresh_call_id(path));

    let outcome = if args.stub {
        let backend = StubBackend::new();
        synthesize_with(&config, &backend, &request, events.as_ref())
    } else {
        let backend = GeminiBackend::new(&config);
        synthesize_with(&config, &backend, &request, events.as_ref())
    };

    let (body, image) = outcome;
    println!("{}", serde_json::to_string_pretty(&Value::Object(body))?);

    if let (Some(out_dir), Some(image)) = (args.out.as_ref(), image.as_ref()) {
        let path = write_image(out_dir, image)?;
        eprintln!("image written to {}", path.display());
    }
    Ok(if image.is_some() { 0 } else { 1 })
}

fn synthesize_with<B: SynthesisBackend>(
    config: &FallbackConfig,
    backend: &B,
    request: &SynthesisRequest,
    events: Option<&EventLog>,
) -> (Map<String, Value>, Option<ImageData>) {
    let mut orchestrator = Orchestrator::new(config, backend);
    if let Some(events) = events {
        orchestrator = orchestrator.with_events(events);
    }
    match orchestrator.synthesize(request) {
        Ok(result) => {
            let image = result.image.clone();
            (envelope::synthesis_success(&result), Some(image))
        }
        Err(failure) => (envelope::synthesis_failure(&failure), None),
    }
}

fn run_validate(args: ValidateArgs) -> Result<i32> {
    let payload = read_payload(&args.request)?;
    let (references, descriptions, candidate) = parse_validation_payload(&payload)?;
    let config = FallbackConfig::from_env();
    let events = args
        .events
        .as_ref()
        .map(|path| EventLog::with_fresh_call_id(path));

    let report = if args.stub {
        let backend = StubBackend::new();
        validate_with(&config, &backend, &references, &descriptions, &candidate, events.as_ref())
    } else {
        let backend = GeminiBackend::new(&config);
        validate_with(&config, &backend, &references, &descriptions, &candidate, events.as_ref())
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(envelope::validation_report(&report)))?
    );
    Ok(0)
}

fn validate_with<B: SynthesisBackend>(
    config: &FallbackConfig,
    backend: &B,
    references: &[ImageData],
    descriptions: &[String],
    candidate: &ImageData,
    events: Option<&EventLog>,
) -> portray_contracts::result::ValidationReport {
    let mut validator = LikenessValidator::new(config, backend);
    if let Some(events) = events {
        validator = validator.with_events(events);
    }
    validator.validate(references, descriptions, candidate)
}

fn read_payload(path: &Path) -> Result<Map<String, Value>> {
    let raw = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed reading request payload from stdin")?;
        buffer
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?
    };
    let parsed: Value =
        serde_json::from_str(&raw).context("request payload is not valid JSON")?;
    parsed
        .as_object()
        .cloned()
        .context("request payload must be a JSON object")
}

fn parse_validation_payload(
    payload: &Map<String, Value>,
) -> Result<(Vec<ImageData>, Vec<String>, ImageData)> {
    let raw_references = payload
        .get("referenceImages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut references = Vec::with_capacity(raw_references.len());
    for (idx, row) in raw_references.iter().enumerate() {
        let Some(text) = row.as_str() else {
            bail!("referenceImages[{idx}] is not a string");
        };
        let image = ImageData::from_payload_string(text)
            .with_context(|| format!("referenceImages[{idx}] could not be decoded"))?;
        references.push(image);
    }

    let descriptions = payload
        .get("referenceDescriptions")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let candidate = payload
        .get("generatedImage")
        .and_then(Value::as_str)
        .context("validation payload is missing 'generatedImage'")
        .and_then(|text| {
            ImageData::from_payload_string(text).context("generatedImage could not be decoded")
        })?;

    Ok((references, descriptions, candidate))
}

fn write_image(out_dir: &Path, image: &ImageData) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let path = out_dir.join(format!(
        "portray-{stamp}.{}",
        extension_for_mime(image.mime_type())
    ));
    fs::write(&path, image.bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}
