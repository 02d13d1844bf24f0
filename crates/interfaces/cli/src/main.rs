use std::io::{self, BufRead, Write};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use aidm_config::Settings;
use aidm_engine::{CharacterDraft, Engine, EnginePaths};

#[derive(Debug, Parser)]
#[command(name = "aidm", version, about = "A multi-agent narrative engine for media-faithful roleplay")]
struct Cli {
    /// Data directory (database, profiles, vector logs, cache).
    #[arg(long, default_value = ".aidm")]
    data_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start or resume an interactive session (default).
    Play,
    /// Research a title into a narrative profile without starting a campaign.
    Research {
        #[arg(value_name = "TITLE")]
        title: String,
    },
    /// Purge all campaign state. Profiles and lore indexes are preserved.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Show configured providers and per-agent models.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let paths = EnginePaths::new(&cli.data_dir);
    let settings = Settings::load_from(paths.settings())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.telemetry.log_level.clone())),
        )
        .with_writer(io::stderr)
        .init();

    let mut engine = Engine::open(settings, paths).await?;

    match cli.command.unwrap_or(Commands::Play) {
        Commands::Play => play(&mut engine).await,
        Commands::Research { title } => research(&mut engine, &title).await,
        Commands::Reset { yes } => reset(&mut engine, yes).await,
        Commands::Doctor => doctor(&engine),
    }
}

async fn play(engine: &mut Engine) -> Result<()> {
    if engine.resume().await? {
        println!("Resuming your campaign. (empty line to pass, ctrl-d to quit)\n");
    } else {
        session_zero(engine).await?;
    }

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            println!();
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let printer = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                print!("{delta}");
                let _ = io::stdout().flush();
            }
        });

        match engine.play_turn(input.trim_end(), Some(tx)).await {
            Ok(output) => {
                let _ = printer.await;
                // Streaming already printed the prose; close the scene.
                println!("\n— turn {} ({})\n", output.turn_number, output.intent.as_str());
            }
            Err(err) => {
                let _ = printer.await;
                // Narrator-voiced: mechanics failures never read as stack traces.
                println!("\n{err}\n");
            }
        }
    }
}

async fn session_zero(engine: &mut Engine) -> Result<()> {
    println!("Which world do you want to play in?");
    let title = prompt_line()?;
    let profile = research_with_progress(engine, &title).await?;
    println!(
        "\n{} is ready ({} voice cards, {} genre tags).",
        profile.name,
        profile.voice_cards.len(),
        profile.detected_genres.len()
    );
    if profile.needs_review {
        println!("(research ran degraded; the profile is flagged for review)");
    }

    println!("\nName your character:");
    let name = prompt_line()?;
    println!("Play overpowered? [y/N]");
    let op_enabled = prompt_line()?.to_lowercase().starts_with('y');

    let draft = CharacterDraft {
        name,
        power_tier: None,
        op_enabled,
        op_tension_source: op_enabled.then(|| "existential".to_string()),
        op_power_expression: op_enabled.then(|| "passive".to_string()),
        op_narrative_focus: None,
    };
    engine.handoff(&profile, &draft).await?;
    println!("\nThe story begins.\n");
    Ok(())
}

async fn research(engine: &mut Engine, title: &str) -> Result<()> {
    let profile = research_with_progress(engine, title).await?;
    println!("profile saved: {}", profile.id);
    Ok(())
}

async fn research_with_progress(
    engine: &mut Engine,
    title: &str,
) -> Result<aidm_engine::NarrativeProfile> {
    let (tx, mut rx) = mpsc::channel(16);
    let progress = tokio::spawn(async move {
        while let Some(phase) = rx.recv().await {
            let phase: aidm_research::ResearchPhase = phase;
            println!("  ... {}", phase.description());
        }
    });
    let profile = engine.prepare_profile(title, Some(&tx)).await;
    drop(tx);
    let _ = progress.await;
    Ok(profile?)
}

async fn reset(engine: &mut Engine, yes: bool) -> Result<()> {
    if !yes {
        println!("This deletes ALL campaigns, characters, turns, and memories.");
        println!("Profiles and lore indexes are kept. Continue? [y/N]");
        if !prompt_line()?.to_lowercase().starts_with('y') {
            bail!("reset aborted");
        }
    }
    engine.reset().await?;
    println!("reset complete");
    Ok(())
}

fn doctor(engine: &Engine) -> Result<()> {
    let settings = engine.settings();
    println!("default provider: {} ({})", settings.llm.provider, settings.llm.model);
    println!("fast model:       {}", settings.llm.fast_model);
    println!("embeddings:       {}", settings.llm.embedding_model);
    if settings.agents.is_empty() {
        println!("per-agent models: (none, all agents use defaults)");
    } else {
        println!("per-agent models:");
        for (agent, assignment) in &settings.agents {
            println!("  {agent}: {} ({})", assignment.model, assignment.provider);
        }
    }
    println!(
        "media generation: {}",
        if settings.media.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn prompt_line() -> Result<String> {
    print!("> ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
