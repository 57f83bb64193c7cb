use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lumina_core::controllers::{ChatController, ChatEvent, ControllerConfig};
use lumina_core::models::{Attachment, ChannelNotifier, Role, Toast, ToastKind, User};
use lumina_core::repositories::{
    InMemorySessionStore, JsonSessionStore, SessionStore, SqliteSessionStore,
};
use lumina_core::services::{ChatSession, GeminiConfig, GeminiProvider};
use lumina_core::settings::{
    LuminaSettings, SettingsJsonRepository, SettingsRepository, StoreKind,
};

#[derive(Parser, Debug)]
#[command(name = "lumina", about = "Terminal chat with project personas")]
struct Args {
    /// Session store backend (memory, json, sqlite)
    #[arg(long)]
    store: Option<StoreKind>,

    /// Model used for replies
    #[arg(long)]
    model: Option<String>,

    /// Wait for whole replies instead of streaming them
    #[arg(long)]
    no_stream: bool,

    /// Directory for the json and sqlite stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Local user name
    #[arg(long, default_value = "local")]
    user: String,
}

const HELP: &str = "\
Commands:
  <text>               send a message
  /new                 start a new conversation
  /projects            list projects
  /project <n>         switch to project n
  /newproject <name>   create a project
  /list                list conversations
  /open <n>            open conversation n
  /rename <title>      rename the open conversation
  /delete              delete the open conversation
  /search on|off       toggle web search
  /attach <path>       attach a file to the next message
  /edit <n>            rewrite user message n (send the new text next)
  /cancel              leave edit mode
  /instruction <text>  set the project's system instruction
  /theme <id>          change the project's theme
  /quit                exit
Ctrl-C stops a reply in progress.";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they don't interleave with replies
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(&args).await?;
    info!(model = %settings.model, store = ?settings.store, "Starting Lumina");

    let store = open_store(&settings).await?;
    let provider = Arc::new(GeminiProvider::new(GeminiConfig {
        api_key: settings.api_key.clone(),
        base_url: settings.api_base_url.clone(),
    }));
    let session = Arc::new(ChatSession::new(
        provider,
        settings.model.clone(),
        settings.title_model().to_string(),
    ));

    let (toast_tx, toast_rx) = mpsc::unbounded_channel();
    let controller = Arc::new(ChatController::new(
        store,
        session,
        Arc::new(ChannelNotifier::new(toast_tx)),
        ControllerConfig::from_settings(&settings),
    ));
    tokio::spawn(print_toasts(toast_rx));
    tokio::spawn(print_stream(controller.clone()));

    controller
        .sign_in(User {
            id: args.user.clone(),
            name: args.user.clone(),
            email: String::new(),
            avatar: None,
        })
        .await;
    if let Some(project) = controller.projects().first() {
        controller.select_project(Some(&project.id)).await;
    } else {
        controller.create_project("", "", "").await;
    }

    println!("{HELP}");
    repl(&controller, settings.streaming).await?;

    controller.wait_for_background_tasks().await;
    Ok(())
}

async fn load_settings(args: &Args) -> Result<LuminaSettings> {
    let repo = match &args.settings {
        Some(path) => SettingsJsonRepository::at(path),
        None => SettingsJsonRepository::new()?,
    };
    let mut settings = match repo.load().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = ?e, path = %repo.path().display(), "Failed to load settings, using defaults");
            LuminaSettings::default()
        }
    };
    settings.apply_env(|key| std::env::var(key).ok());

    if let Some(store) = args.store {
        settings.store = store;
    }
    if let Some(model) = &args.model {
        settings.model = model.clone();
    }
    if args.no_stream {
        settings.streaming = false;
    }
    if let Some(dir) = &args.data_dir {
        settings.data_dir = Some(dir.clone());
    }
    Ok(settings)
}

async fn open_store(settings: &LuminaSettings) -> Result<Arc<dyn SessionStore>> {
    let data_dir = || {
        settings
            .data_dir()
            .ok_or_else(|| anyhow!("Cannot determine data directory, pass --data-dir"))
    };

    let store: Arc<dyn SessionStore> = match settings.store {
        StoreKind::Memory => Arc::new(InMemorySessionStore::new()),
        StoreKind::Json => {
            let store = JsonSessionStore::new(data_dir()?.join("store"));
            info!(root = %store.root().display(), "Using JSON session store");
            Arc::new(store)
        }
        StoreKind::Sqlite => {
            let dir = data_dir()?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            Arc::new(SqliteSessionStore::open(&dir.join("lumina.db")).await?)
        }
    };
    Ok(store)
}

async fn print_toasts(mut toasts: mpsc::UnboundedReceiver<Toast>) {
    while let Some(toast) = toasts.recv().await {
        let label = match toast.kind {
            ToastKind::Success => "ok",
            ToastKind::Error => "error",
            ToastKind::Info => "info",
        };
        eprintln!("[{label}] {}", toast.message);
    }
}

async fn print_stream(controller: Arc<ChatController>) {
    let mut events = controller.subscribe();
    loop {
        match events.recv().await {
            Ok(ChatEvent::StreamDelta { delta, .. }) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Stream printer lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct ReplState {
    use_search: bool,
    attachments: Vec<Attachment>,
}

async fn repl(controller: &Arc<ChatController>, streaming: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut repl = ReplState {
        use_search: false,
        attachments: Vec::new(),
    };

    loop {
        prompt(controller);
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.strip_prefix('/') {
            Some(command) => {
                let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
                (Some(name), rest.trim())
            }
            None => (None, line),
        };

        match command {
            None => send(controller, rest, &mut repl, streaming).await,
            Some("quit") | Some("exit") => break,
            Some("help") => println!("{HELP}"),
            Some("new") => {
                controller.create_conversation().await;
            }
            Some("projects") => list_projects(controller),
            Some("project") => match pick(rest, &controller.projects()) {
                Some(project) => controller.select_project(Some(&project.id)).await,
                None => println!("No such project"),
            },
            Some("newproject") => {
                controller.create_project(rest, "", "").await;
            }
            Some("list") => list_conversations(controller),
            Some("open") => match pick(rest, &controller.conversations()) {
                Some(conversation) => {
                    controller.select_conversation(&conversation.id).await;
                    print_history(controller);
                }
                None => println!("No such conversation"),
            },
            Some("rename") => {
                if let Some(id) = controller.active_conversation_id() {
                    controller.rename_conversation(&id, rest).await;
                }
            }
            Some("delete") => {
                if let Some(id) = controller.active_conversation_id() {
                    controller.delete_conversation(&id).await;
                }
            }
            Some("search") => {
                repl.use_search = rest == "on";
                println!("Web search {}", if repl.use_search { "on" } else { "off" });
            }
            Some("attach") => match read_attachment(Path::new(rest)) {
                Ok(attachment) => {
                    println!("Attached {} ({})", rest, attachment.mime_type);
                    repl.attachments.push(attachment);
                }
                Err(e) => println!("Cannot attach {rest}: {e:#}"),
            },
            Some("edit") => {
                let messages = controller.messages();
                match pick(rest, &messages) {
                    Some(message) if controller.edit_message(&message.id, &message.text) => {
                        println!("Editing: {}", message.text);
                    }
                    _ => println!("Pick a user message from the history"),
                }
            }
            Some("cancel") => controller.cancel_edit(),
            Some("instruction") => {
                if let Some(project) = controller.active_project() {
                    controller.update_project_instruction(&project.id, rest).await;
                }
            }
            Some("theme") => {
                if let Some(project) = controller.active_project() {
                    controller.change_project_theme(&project.id, rest).await;
                }
            }
            Some(other) => println!("Unknown command /{other}, try /help"),
        }
    }
    Ok(())
}

async fn send(controller: &Arc<ChatController>, text: &str, repl: &mut ReplState, streaming: bool) {
    let attachments = std::mem::take(&mut repl.attachments);
    let send = controller.send_message(text, attachments, repl.use_search);
    tokio::pin!(send);
    loop {
        tokio::select! {
            _ = &mut send => break,
            _ = tokio::signal::ctrl_c() => controller.stop_generation(),
        }
    }

    let messages = controller.messages();
    if let Some(reply) = messages.last().filter(|m| m.role == Role::Model) {
        if !streaming {
            print!("{}", reply.text);
        }
        println!();
        if let Some(metadata) = &reply.grounding_metadata {
            for source in metadata.sources() {
                println!("  [{}] {}", source.title, source.uri);
            }
        }
    }
}

fn prompt(controller: &ChatController) {
    let project = controller
        .active_project()
        .map(|p| p.name)
        .unwrap_or_else(|| "no project".to_string());
    let editing = if controller.editing().is_some() { " (editing)" } else { "" };
    print!("{project}{editing}> ");
    let _ = std::io::stdout().flush();
}

/// 1-based pick from a listing.
fn pick<'a, T>(index: &str, items: &'a [T]) -> Option<&'a T> {
    let n: usize = index.parse().ok()?;
    items.get(n.checked_sub(1)?)
}

fn list_projects(controller: &ChatController) {
    let active = controller.active_project().map(|p| p.id);
    for (i, project) in controller.projects().iter().enumerate() {
        let marker = if Some(&project.id) == active.as_ref() { "*" } else { " " };
        println!("{marker}{:>3}. {} [{}]", i + 1, project.name, project.theme_id);
    }
}

fn list_conversations(controller: &ChatController) {
    let active = controller.active_conversation_id();
    for (i, conversation) in controller.conversations().iter().enumerate() {
        let marker = if Some(&conversation.id) == active.as_ref() { "*" } else { " " };
        println!(
            "{marker}{:>3}. {}  {}",
            i + 1,
            conversation.title,
            conversation.preview.as_deref().unwrap_or("")
        );
    }
}

fn print_history(controller: &ChatController) {
    for (i, message) in controller.messages().iter().enumerate() {
        let who = match message.role {
            Role::User => "you",
            Role::Model => "model",
        };
        println!("{:>3}. {who}: {}", i + 1, message.text);
    }
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mime_type = mime_for(path).ok_or_else(|| anyhow!("unsupported file type"))?;
    let data = format!("data:{mime_type};base64,{}", BASE64.encode(bytes));
    Ok(if mime_type.starts_with("audio/") {
        Attachment::audio(mime_type, data)
    } else {
        Attachment::image(mime_type, data)
    })
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "webm" => "audio/webm",
        _ => return None,
    })
}
