use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use resurface_contracts::events::{new_session_id, EventPayload, EventWriter};
use resurface_contracts::presets::PresetCatalog;
use resurface_contracts::session::{GeneratedImage, Outcome, Phase, Session, SourceImage, Ticket};
use resurface_engine::{
    export_png, normalize_bytes, DryrunGenerator, GeminiGenerator, GenerateError,
    GenerationRequest, ImageGenerator,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "resurface", version, about = "Redesign the flooring in a building exterior photo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot: normalize a photo, run one generation, export the PNG.
    Redesign(RedesignArgs),
    /// List the built-in material presets.
    Presets,
    /// Interactive session: select a photo, iterate on prompts.
    Session(SessionArgs),
}

#[derive(Debug, Parser)]
struct RedesignArgs {
    /// Photo of the building exterior.
    #[arg(long)]
    image: PathBuf,
    /// Free-text material description.
    #[arg(long)]
    prompt: Option<String>,
    /// Preset id standing in for --prompt.
    #[arg(long)]
    preset: Option<String>,
    /// Directory for the exported PNG and events.jsonl.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Render a placeholder locally instead of calling the API.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

type CompletionMessage = (Ticket, Result<GeneratedImage, GenerateError>);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("resurface error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Redesign(args) => run_redesign(args),
        Command::Presets => {
            run_presets();
            Ok(0)
        }
        Command::Session(args) => {
            run_session(args)?;
            Ok(0)
        }
    }
}

fn run_redesign(args: RedesignArgs) -> Result<i32> {
    let events = event_writer(&args.out, args.events.as_ref());
    events.emit("session_started", event_payload(json!({ "mode": "redesign" })))?;

    let instruction = resolve_prompt(
        &PresetCatalog::default(),
        args.prompt.as_deref(),
        args.preset.as_deref(),
    )?;

    let bytes =
        fs::read(&args.image).with_context(|| format!("failed to read {}", args.image.display()))?;
    let payload = normalize_bytes(&bytes)?;
    events.emit(
        "image_selected",
        event_payload(json!({
            "source": args.image.to_string_lossy(),
            "width": payload.width,
            "height": payload.height,
        })),
    )?;
    println!(
        "Normalized {} to {}x{}",
        args.image.display(),
        payload.width,
        payload.height
    );

    let (session, ticket) = Session::new().select_image(payload).submit(&instruction);
    let Some(ticket) = ticket else {
        bail!("prompt must not be empty");
    };

    let generator = make_generator(args.dryrun);
    events.emit(
        "generation_started",
        event_payload(json!({ "generator": generator.name(), "token": ticket.token })),
    )?;

    let image = session.image().expect("image installed above").clone();
    let request = GenerationRequest {
        image: &image,
        instruction: &instruction,
    };
    let outcome = match generator.generate(&request) {
        Ok(generated) => Outcome::Success(generated),
        Err(err) => Outcome::Failure(err.to_string()),
    };
    let (session, applied) = session.complete(ticket, outcome);
    debug_assert!(applied);

    match session.phase() {
        Phase::Success => {
            let result = session.result().expect("success carries a result");
            let path = export_png(result, &args.out)?;
            events.emit(
                "generation_succeeded",
                event_payload(json!({ "token": ticket.token })),
            )?;
            events.emit(
                "image_exported",
                event_payload(json!({ "path": path.to_string_lossy() })),
            )?;
            println!("Saved {}", path.display());
            Ok(0)
        }
        Phase::Error(message) => {
            events.emit(
                "generation_failed",
                event_payload(json!({ "token": ticket.token, "error": message })),
            )?;
            eprintln!("Generation failed: {message}");
            Ok(1)
        }
        _ => bail!("unexpected session phase after completion"),
    }
}

fn run_presets() {
    let catalog = PresetCatalog::default();
    for preset in catalog.list() {
        println!(
            "{:<20} {:<18} {:<8} {}",
            preset.id, preset.label, preset.swatch, preset.prompt
        );
    }
}

fn run_session(args: SessionArgs) -> Result<()> {
    let events = event_writer(&args.out, args.events.as_ref());
    events.emit("session_started", event_payload(json!({ "mode": "session" })))?;

    let catalog = PresetCatalog::default();
    let mut session = Session::new();
    let mut pending_prompt = String::new();
    let (tx, rx) = mpsc::channel::<CompletionMessage>();

    let stdin = io::stdin();
    let mut line = String::new();

    println!("Resurface session started. Type /help for commands.");

    loop {
        session = drain_completions(session, &rx, &events)?;

        if session.is_loading() {
            print!("(generating) > ");
        } else {
            print!("> ");
        }
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_session_command(&line) {
            SessionCommand::Noop => {}
            SessionCommand::Help => {
                println!(
                    "Commands: /use <path>  /preset <id>  /go [prompt]  /save  /status  /reset  /help  /quit"
                );
                println!("Bare text sets the pending prompt for the next /go.");
            }
            SessionCommand::Quit => break,
            SessionCommand::Unknown(command) => {
                println!("Unknown command /{command}; try /help");
            }
            SessionCommand::SetPrompt(text) => {
                println!("Prompt set to: {text}");
                pending_prompt = text;
            }
            SessionCommand::Preset(id) => match catalog.get(&id) {
                Some(preset) => {
                    println!("Prompt set to: {}", preset.prompt);
                    pending_prompt = preset.prompt.clone();
                }
                None => println!("Unknown preset {id}; see `resurface presets`"),
            },
            SessionCommand::Use(path_text) => {
                if path_text.is_empty() {
                    println!("/use requires a path");
                    continue;
                }
                let path = PathBuf::from(&path_text);
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        println!("Could not read {}: {err}", path.display());
                        continue;
                    }
                };
                match normalize_bytes(&bytes) {
                    Ok(payload) => {
                        events.emit(
                            "image_selected",
                            event_payload(json!({
                                "source": path_text,
                                "width": payload.width,
                                "height": payload.height,
                            })),
                        )?;
                        println!(
                            "Selected {} ({}x{} after normalization)",
                            path.display(),
                            payload.width,
                            payload.height
                        );
                        session = session.select_image(payload);
                    }
                    Err(err) => println!("Could not use {}: {err}", path.display()),
                }
            }
            SessionCommand::Go(inline_prompt) => {
                let instruction = inline_prompt.unwrap_or_else(|| pending_prompt.clone());
                if session.is_loading() {
                    println!("A generation is already in flight; wait or /reset.");
                    continue;
                }
                if session.image().is_none() {
                    println!("No image selected; use /use <path> first.");
                    continue;
                }
                if instruction.trim().is_empty() {
                    println!("No prompt set; type one or pick a /preset.");
                    continue;
                }
                let (next, ticket) = session.submit(&instruction);
                session = next;
                let Some(ticket) = ticket else {
                    // Success phase keeps its result until a new image or reset.
                    println!("Nothing submitted; /reset or select a new image first.");
                    continue;
                };
                let generator = make_generator(args.dryrun);
                events.emit(
                    "generation_started",
                    event_payload(json!({ "generator": generator.name(), "token": ticket.token })),
                )?;
                println!("Generating…");
                let image = session.image().expect("submit checked the image").clone();
                spawn_generation(generator, image, instruction, ticket, tx.clone());
            }
            SessionCommand::Save => match session.result() {
                Some(result) => {
                    let path = export_png(result, &args.out)?;
                    events.emit(
                        "image_exported",
                        event_payload(json!({ "path": path.to_string_lossy() })),
                    )?;
                    println!("Saved {}", path.display());
                }
                None => println!("No result to save yet."),
            },
            SessionCommand::Status => {
                println!("Phase: {}", phase_label(session.phase()));
                match session.image() {
                    Some(image) => println!("Image: {}x{}", image.width, image.height),
                    None => println!("Image: none"),
                }
                if pending_prompt.is_empty() {
                    println!("Pending prompt: none");
                } else {
                    println!("Pending prompt: {pending_prompt}");
                }
            }
            SessionCommand::Reset => {
                session = session.reset();
                pending_prompt.clear();
                events.emit("session_reset", EventPayload::new())?;
                println!("Session reset.");
            }
        }
    }

    Ok(())
}

fn spawn_generation(
    generator: Box<dyn ImageGenerator>,
    image: SourceImage,
    instruction: String,
    ticket: Ticket,
    tx: mpsc::Sender<CompletionMessage>,
) {
    thread::spawn(move || {
        let request = GenerationRequest {
            image: &image,
            instruction: &instruction,
        };
        let result = generator.generate(&request);
        // The receiver may be gone if the session loop already exited.
        let _ = tx.send((ticket, result));
    });
}

fn drain_completions(
    mut session: Session,
    rx: &mpsc::Receiver<CompletionMessage>,
    events: &EventWriter,
) -> Result<Session> {
    while let Ok((ticket, result)) = rx.try_recv() {
        let outcome = match result {
            Ok(generated) => Outcome::Success(generated),
            Err(err) => Outcome::Failure(err.to_string()),
        };
        let (next, applied) = session.complete(ticket, outcome);
        session = next;
        if !applied {
            events.emit(
                "stale_completion_discarded",
                event_payload(json!({ "token": ticket.token })),
            )?;
            println!("Discarded a late response from a superseded request.");
            continue;
        }
        match session.phase() {
            Phase::Success => {
                events.emit(
                    "generation_succeeded",
                    event_payload(json!({ "token": ticket.token })),
                )?;
                println!("Redesign ready; /save to export.");
            }
            Phase::Error(message) => {
                events.emit(
                    "generation_failed",
                    event_payload(json!({ "token": ticket.token, "error": message })),
                )?;
                println!("Generation failed: {message}");
            }
            _ => {}
        }
    }
    Ok(session)
}

#[derive(Debug, PartialEq, Eq)]
enum SessionCommand {
    Help,
    Quit,
    Reset,
    Status,
    Save,
    Use(String),
    Preset(String),
    Go(Option<String>),
    SetPrompt(String),
    Unknown(String),
    Noop,
}

fn parse_session_command(input: &str) -> SessionCommand {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return SessionCommand::Noop;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return SessionCommand::SetPrompt(trimmed.to_string());
    };
    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };
    match command {
        "help" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        "reset" => SessionCommand::Reset,
        "status" => SessionCommand::Status,
        "save" => SessionCommand::Save,
        "use" => SessionCommand::Use(args.to_string()),
        "preset" => SessionCommand::Preset(args.to_string()),
        "go" => {
            if args.is_empty() {
                SessionCommand::Go(None)
            } else {
                SessionCommand::Go(Some(args.to_string()))
            }
        }
        other => SessionCommand::Unknown(other.to_string()),
    }
}

fn resolve_prompt(
    catalog: &PresetCatalog,
    prompt: Option<&str>,
    preset: Option<&str>,
) -> Result<String> {
    if let Some(id) = preset {
        let Some(preset) = catalog.get(id) else {
            bail!("unknown preset {id}; see `resurface presets`");
        };
        return Ok(preset.prompt.clone());
    }
    match prompt.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => Ok(text.to_string()),
        None => bail!("either --prompt or --preset is required"),
    }
}

fn make_generator(dryrun: bool) -> Box<dyn ImageGenerator> {
    if dryrun {
        Box::new(DryrunGenerator)
    } else {
        Box::new(GeminiGenerator::new())
    }
}

fn event_writer(out_dir: &std::path::Path, events_path: Option<&PathBuf>) -> EventWriter {
    let path = events_path
        .cloned()
        .unwrap_or_else(|| out_dir.join("events.jsonl"));
    EventWriter::new(path, new_session_id())
}

fn event_payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn phase_label(phase: &Phase) -> String {
    match phase {
        Phase::Idle => "idle".to_string(),
        Phase::Loading => "loading".to_string(),
        Phase::Success => "success".to_string(),
        Phase::Error(message) => format!("error ({message})"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use resurface_contracts::presets::PresetCatalog;
    use serde_json::Value;

    use super::{
        event_writer, parse_session_command, resolve_prompt, run_redesign, RedesignArgs,
        SessionCommand,
    };

    fn write_png(path: &Path, width: u32, height: u32) -> anyhow::Result<()> {
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([160, 140, 110]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn dryrun_redesign_exports_png_and_logs_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("porch.png");
        write_png(&image_path, 64, 48)?;
        let out_dir = temp.path().join("out");

        let code = run_redesign(RedesignArgs {
            image: image_path,
            prompt: Some("polished concrete".to_string()),
            preset: None,
            out: out_dir.clone(),
            events: None,
            dryrun: true,
        })?;
        assert_eq!(code, 0);

        let exported: Vec<String> = fs::read_dir(&out_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("exterior-redesign-") && name.ends_with(".png"))
            .collect();
        assert_eq!(exported.len(), 1);

        let log = fs::read_to_string(out_dir.join("events.jsonl"))?;
        let types: Vec<String> = log
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        for expected in [
            "session_started",
            "image_selected",
            "generation_started",
            "generation_succeeded",
            "image_exported",
        ] {
            assert!(types.contains(&expected.to_string()), "missing {expected}");
        }
        Ok(())
    }

    #[test]
    fn event_writer_defaults_to_events_jsonl_under_out_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = event_writer(temp.path(), None);
        assert_eq!(writer.path(), temp.path().join("events.jsonl"));

        let custom = temp.path().join("log").join("custom.jsonl");
        let writer = event_writer(temp.path(), Some(&custom));
        assert_eq!(writer.path(), custom);
        Ok(())
    }

    #[test]
    fn bare_text_sets_pending_prompt() {
        assert_eq!(
            parse_session_command("mossy flagstones\n"),
            SessionCommand::SetPrompt("mossy flagstones".to_string())
        );
    }

    #[test]
    fn slash_commands_parse_with_and_without_args() {
        assert_eq!(parse_session_command("/help"), SessionCommand::Help);
        assert_eq!(parse_session_command("/quit"), SessionCommand::Quit);
        assert_eq!(
            parse_session_command("/use porch photo.jpg"),
            SessionCommand::Use("porch photo.jpg".to_string())
        );
        assert_eq!(
            parse_session_command("/preset terracotta"),
            SessionCommand::Preset("terracotta".to_string())
        );
        assert_eq!(parse_session_command("/go"), SessionCommand::Go(None));
        assert_eq!(
            parse_session_command("/go polished concrete"),
            SessionCommand::Go(Some("polished concrete".to_string()))
        );
        assert_eq!(
            parse_session_command("/frobnicate"),
            SessionCommand::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn blank_input_is_a_noop() {
        assert_eq!(parse_session_command("   \n"), SessionCommand::Noop);
    }

    #[test]
    fn resolve_prompt_prefers_preset_over_free_text() {
        let catalog = PresetCatalog::default();
        let prompt =
            resolve_prompt(&catalog, Some("ignored"), Some("cobblestone")).expect("preset");
        assert_eq!(prompt, "rustic european cobblestone pathway");
    }

    #[test]
    fn resolve_prompt_rejects_unknown_preset() {
        let catalog = PresetCatalog::default();
        assert!(resolve_prompt(&catalog, None, Some("parquet")).is_err());
    }

    #[test]
    fn resolve_prompt_rejects_blank_text() {
        let catalog = PresetCatalog::default();
        assert!(resolve_prompt(&catalog, Some("   "), None).is_err());
        assert!(resolve_prompt(&catalog, None, None).is_err());
    }

    #[test]
    fn resolve_prompt_trims_free_text() {
        let catalog = PresetCatalog::default();
        let prompt = resolve_prompt(&catalog, Some("  polished concrete  "), None).expect("prompt");
        assert_eq!(prompt, "polished concrete");
    }
}
