use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use apollo_contracts::characters::Character;
use apollo_contracts::clock::SystemClock;
use apollo_contracts::episodes::paths::CHARACTERS;
use apollo_contracts::events::EventWriter;
use apollo_contracts::identity::client_ip;
use apollo_contracts::stores::{DirBlobStore, DirDocumentStore, DocumentStore};
use apollo_contracts::ApiError;
use apollo_engine::comments::AddCommentRequest;
use apollo_engine::dryrun::DryrunModel;
use apollo_engine::gallery::GalleryRequest;
use apollo_engine::gemini::GeminiModel;
use apollo_engine::model::GenerativeModel;
use apollo_engine::orchestrator::GeneratePanelImagesRequest;
use apollo_engine::publish::PublishRequest;
use apollo_engine::settings::Settings;
use apollo_engine::storyboard::PlanStoryboardRequest;
use apollo_engine::{CallContext, Service};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "apollo", version, about = "Diary-to-toon authoring backend")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Directory holding the document and blob stores.
    #[arg(long, global = true, default_value = ".apollo")]
    store: PathBuf,
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    /// Caller uid as asserted by the identity provider.
    #[arg(long, global = true)]
    uid: Option<String>,
    #[arg(long, global = true)]
    client_ip: Option<String>,
    /// Proxy header `name: value`, used to resolve the caller address.
    #[arg(long = "header", global = true)]
    headers: Vec<String>,
    /// Use the offline model instead of Gemini.
    #[arg(long, global = true)]
    dryrun: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    Plan(PlanArgs),
    Generate(GenerateArgs),
    Publish(EpisodeArgs),
    Comment(CommentArgs),
    Comments(EpisodeArgs),
    Gallery(GalleryArgs),
    UploadRef(UploadRefArgs),
    /// Adds or replaces a character library entry from a JSON file.
    Character(CharacterArgs),
}

#[derive(Debug, Args)]
struct EpisodeArgs {
    #[arg(long)]
    episode_id: String,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long)]
    episode_id: String,
    #[arg(long, conflicts_with = "diary_file")]
    diary: Option<String>,
    #[arg(long)]
    diary_file: Option<PathBuf>,
    #[arg(long)]
    panel_count: Option<usize>,
    #[arg(long, conflicts_with = "sheet_file")]
    sheet: Option<String>,
    #[arg(long)]
    sheet_file: Option<PathBuf>,
    #[arg(long)]
    character_id: Option<String>,
    #[arg(long = "ref")]
    refs: Vec<String>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    episode_id: String,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long = "ref")]
    refs: Vec<String>,
    #[arg(long = "index", allow_negative_numbers = true)]
    indices: Vec<i64>,
}

#[derive(Debug, Args)]
struct CommentArgs {
    #[arg(long)]
    episode_id: String,
    #[arg(long)]
    emoji: String,
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    anon_id: String,
}

#[derive(Debug, Args)]
struct GalleryArgs {
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    after: Option<String>,
}

#[derive(Debug, Args)]
struct UploadRefArgs {
    #[arg(long)]
    episode_id: String,
    #[arg(long)]
    file: PathBuf,
    /// Stored filename; defaults to the file's own name.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct CharacterArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    file: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("apollo error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let documents = Arc::new(DirDocumentStore::new(cli.global.store.join("documents")));
    let blobs = Arc::new(DirBlobStore::new(
        cli.global.store.join("blobs"),
        settings.public_base_url.clone(),
    ));
    let model: Arc<dyn GenerativeModel> = if cli.global.dryrun {
        Arc::new(DryrunModel)
    } else {
        Arc::new(GeminiModel::new(&settings))
    };
    let events_path = cli
        .global
        .events
        .clone()
        .unwrap_or_else(|| cli.global.store.join("events.jsonl"));
    let events = EventWriter::new(events_path, uuid::Uuid::new_v4().to_string());
    let ctx = call_context(&cli.global)?;

    if let Command::Character(args) = &cli.command {
        return store_character(documents.as_ref(), args);
    }

    let service = Service::new(
        documents,
        blobs,
        model,
        Arc::new(SystemClock),
        settings,
        events,
    );
    match cli.command {
        Command::Plan(args) => {
            let request = PlanStoryboardRequest {
                episode_id: args.episode_id,
                diary_text: text_arg(args.diary, args.diary_file.as_deref())?.unwrap_or_default(),
                panel_count: args.panel_count,
                character_sheet_text: text_arg(args.sheet, args.sheet_file.as_deref())?,
                character_id: args.character_id,
                ref_image_paths: args.refs,
            };
            respond(service.plan_storyboard(&ctx, &request))
        }
        Command::Generate(args) => {
            let request = GeneratePanelImagesRequest {
                episode_id: args.episode_id,
                aspect_ratio: args.aspect_ratio,
                ref_image_paths: args.refs,
                indices: (!args.indices.is_empty()).then_some(args.indices),
            };
            respond(service.generate_panel_images(&ctx, &request))
        }
        Command::Publish(args) => respond(service.publish_episode(
            &ctx,
            &PublishRequest {
                episode_id: args.episode_id,
            },
        )),
        Command::Comment(args) => {
            let request = AddCommentRequest {
                episode_id: args.episode_id,
                emoji: args.emoji,
                text: args.text,
                anon_id: args.anon_id,
            };
            respond(service.add_comment(&ctx, &request))
        }
        Command::Comments(args) => respond(service.list_comments(&args.episode_id)),
        Command::Gallery(args) => respond(service.list_published(&GalleryRequest {
            page_size: args.page_size,
            after: args.after,
        })),
        Command::UploadRef(args) => {
            let bytes = fs::read(&args.file)
                .with_context(|| format!("failed reading {}", args.file.display()))?;
            let name = match args.name {
                Some(name) => name,
                None => args
                    .file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            respond(service.upload_reference(&ctx, &args.episode_id, &name, &bytes))
        }
        Command::Character(_) => Ok(0),
    }
}

fn call_context(global: &GlobalArgs) -> Result<CallContext> {
    let mut headers = HashMap::new();
    for raw in &global.headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("--header expects `name: value`, got {raw:?}");
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    let address = match global.client_ip.as_deref().map(str::trim) {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => client_ip(&headers),
    };
    Ok(CallContext {
        uid: global.uid.clone(),
        client_ip: address,
    })
}

fn text_arg(inline: Option<String>, file: Option<&Path>) -> Result<Option<String>> {
    match (inline, file) {
        (Some(text), _) => Ok(Some(text)),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))
            .map(Some),
        (None, None) => Ok(None),
    }
}

fn store_character(documents: &dyn DocumentStore, args: &CharacterArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed reading {}", args.file.display()))?;
    let doc = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.file.display()))?;
    let character = Character::from_document(&args.id, doc)?;
    documents.set(CHARACTERS, &args.id, serde_json::to_value(&character)?)?;
    print_json(&character)?;
    Ok(0)
}

/// JSON body on stdout for success; `kind: message` on stderr and a
/// kind-specific exit code for a rejected call.
fn respond<T: Serialize>(result: Result<T, ApiError>) -> Result<i32> {
    match result {
        Ok(response) => {
            print_json(&response)?;
            Ok(0)
        }
        Err(err) => {
            eprintln!("apollo error: {err}");
            if let Some(seconds) = err.retry_after_seconds {
                eprintln!("retry after: {seconds}s");
            }
            Ok(err.kind.exit_code())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
