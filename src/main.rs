//! # kb-assist CLI (`kba`)
//!
//! Manage per-topic knowledge bases and ask questions grounded in them.
//!
//! ## Usage
//!
//! ```bash
//! kba --config ./config/kba.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kba kb list` | Known knowledge bases and whether they have a store |
//! | `kba kb add <kb> --url U --file F` | Stage sources for the next build |
//! | `kba kb build [<kb>]` | Load, chunk, embed and store one or all knowledge bases |
//! | `kba kb skills <kb>` | List a knowledge base's skill files |
//! | `kba kb instructions <kb>` | Print a knowledge base's instructions |
//! | `kba retrieve "<query>" --kb a --kb b` | Print retrieved context and sources |
//! | `kba match "<query>"` | Run only the command matcher |
//! | `kba ask "<query>"` | Full chat turn with streamed output |
//! | `kba select <kb>...` | Persist the default knowledge-base selection |
//!
//! ## Examples
//!
//! ```bash
//! kba kb add geo --file ./paris.txt --url https://en.wikipedia.org/wiki/Paris
//! kba kb build geo
//! kba retrieve "What is the capital of France?" --kb geo
//! kba select geo
//! kba ask "What is the capital of France?"
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use kb_assist::app::App;
use kb_assist::chat::CancelFlag;
use kb_assist::commands::{CommandMatcher, CommandResult};
use kb_assist::config::{self, Config};
use kb_assist::layout::validate_kb_name;
use kb_assist::logging::init_logging;
use kb_assist::session::Session;
use kb_assist_core::models::{Content, ImageData};
use kb_assist_core::store::KnowledgeStore;

/// kb-assist: a knowledge-base retrieval layer for a conversational agent.
#[derive(Parser)]
#[command(name = "kba", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kba.toml`. A missing file means all defaults.
    #[arg(long, global = true, default_value = "./config/kba.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Retrieve context for a query without calling the chat model.
    Retrieve {
        query: String,

        /// Knowledge base to query (repeatable). Defaults to the saved selection.
        #[arg(long = "kb")]
        kbs: Vec<String>,
    },

    /// Check whether an input would be handled as a command.
    Match { query: String },

    /// Ask a question. Ctrl-C interrupts the streamed answer.
    Ask {
        query: String,

        /// Knowledge base to use (repeatable). Defaults to the saved selection.
        #[arg(long = "kb")]
        kbs: Vec<String>,
    },

    /// Save the default knowledge-base selection. No names clears it.
    Select { kbs: Vec<String> },
}

#[derive(Subcommand)]
enum KbAction {
    /// List knowledge bases.
    List,

    /// Stage a URL and/or a file. Run `kba kb build` afterwards.
    Add {
        kb: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Build one knowledge base, or all of them.
    Build { kb: Option<String> },

    /// List skill files.
    Skills { kb: String },

    /// Print instructions.
    Instructions { kb: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging);

    if let Commands::Match { query } = &cli.command {
        return run_match(query);
    }
    if let Commands::Select { kbs } = &cli.command {
        return run_select(cfg, &cli.config, kbs);
    }

    let app = App::new(cfg)?;
    let result = match cli.command {
        Commands::Kb { action } => run_kb(&app, action).await,
        Commands::Retrieve { query, kbs } => run_retrieve(&app, &query, kbs).await,
        Commands::Ask { query, kbs } => run_ask(&app, &query, kbs).await,
        Commands::Match { .. } | Commands::Select { .. } => Ok(()),
    };
    app.shutdown().await;
    result
}

fn selection(app: &App, kbs: Vec<String>) -> Vec<String> {
    if kbs.is_empty() {
        app.config.session.selected.clone()
    } else {
        kbs
    }
}

async fn run_kb(app: &App, action: KbAction) -> Result<()> {
    let manager = &app.manager;
    match action {
        KbAction::List => {
            let names = manager.known_knowledge_bases()?;
            if names.is_empty() {
                println!("No knowledge bases under {}.", manager.layout().kb_root().display());
            }
            for name in names {
                let status = if app.sqlite.exists(&name).await? {
                    format!("{} chunks", app.sqlite.count(&name).await?)
                } else {
                    "not built".to_string()
                };
                println!("{}\t{}", name, status);
            }
        }
        KbAction::Add { kb, url, file } => {
            manager.add_source(&kb, url.as_deref(), file.as_deref())?;
            println!("Staged sources for '{}'. Run `kba kb build {}` to index them.", kb, kb);
        }
        KbAction::Build { kb } => {
            let (worker, join) = app.spawn_worker();
            let reports = worker.build(kb).await;
            drop(worker);
            let _ = join.await;
            for report in reports? {
                println!(
                    "{}: {} documents, {} chunks",
                    report.knowledge_base, report.documents, report.chunks
                );
            }
        }
        KbAction::Skills { kb } => {
            let skills = manager.load_skills(&kb)?;
            if skills.is_empty() {
                println!("No skills for '{}'.", kb);
            }
            for skill in skills {
                println!("{}\t{}", skill.name, skill.path.display());
            }
        }
        KbAction::Instructions { kb } => {
            let text = manager.load_instructions(&kb)?;
            if text.is_empty() {
                println!("No instructions for '{}'.", kb);
            } else {
                println!("{}", text);
            }
        }
    }
    Ok(())
}

async fn run_retrieve(app: &App, query: &str, kbs: Vec<String>) -> Result<()> {
    let selected = selection(app, kbs);
    let (worker, join) = app.spawn_worker();
    let retrieved = worker.retrieve(query.to_string(), selected).await;
    drop(worker);
    let _ = join.await;
    let retrieved = retrieved?;
    match retrieved.context {
        None => println!("No relevant context found."),
        Some(context) => {
            println!("{}", context);
            println!("\nSources:");
            for source in retrieved.sources {
                println!("- {}", source);
            }
        }
    }
    Ok(())
}

fn run_match(query: &str) -> Result<()> {
    let matcher = CommandMatcher::with_system_capture()?;
    match matcher.match_query(query)? {
        None => println!("no command"),
        Some(CommandResult::Unchanged(q)) => println!("unchanged: {}", q),
        Some(CommandResult::Image(message)) => match message.content {
            Content::Image {
                data: ImageData::Base64(b64),
                format,
            } => println!("image ({}, {} base64 bytes)", format.mime_type(), b64.len()),
            Content::Image {
                data: ImageData::Path(path),
                format,
            } => println!("image ({}, {})", format.mime_type(), path.display()),
            Content::Text { text } => println!("text: {}", text),
        },
    }
    Ok(())
}

async fn run_ask(app: &App, query: &str, kbs: Vec<String>) -> Result<()> {
    let engine = app.chat_engine()?;
    let session = Session::with_selection(&app.manager, &selection(app, kbs))?;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = engine
        .process_input(query, &session, &cancel, |token| {
            let _ = write!(stdout, "{}", token);
            let _ = stdout.flush();
        })
        .await?;
    println!();

    if outcome.interrupted {
        println!("[interrupted]");
    }
    if !outcome.sources.is_empty() {
        println!("\nSources:");
        for source in &outcome.sources {
            println!("- {}", source);
        }
    }
    Ok(())
}

fn run_select(mut cfg: Config, path: &std::path::Path, kbs: &[String]) -> Result<()> {
    let mut selected: Vec<String> = Vec::new();
    for kb in kbs {
        validate_kb_name(kb)?;
        if !selected.contains(kb) {
            selected.push(kb.clone());
        }
    }
    let kb_root = &cfg.paths.kb_root;
    for kb in &selected {
        if !kb_root.join(kb).is_dir() {
            warn!(kb = %kb, "knowledge base does not exist yet");
        }
    }

    cfg.session.selected = selected;
    cfg.save(path)?;
    if cfg.session.selected.is_empty() {
        println!("Cleared knowledge-base selection.");
    } else {
        println!("Selected: {}", cfg.session.selected.join(", "));
    }
    Ok(())
}
