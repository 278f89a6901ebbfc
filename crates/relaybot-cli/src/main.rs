//! relaybot CLI — run the bridge, inspect state, manage schedules.
//!
//! Usage:
//!   relaybot run             — Start the bridge and all observers
//!   relaybot init            — Materialize the workspace layout
//!   relaybot onboard         — Create a default configuration
//!   relaybot status          — Show configuration and health
//!   relaybot cron <action>   — Manage scheduled jobs
//!   relaybot webhook <action>— Inspect webhooks, mint tokens
//!   relaybot sessions        — List chat sessions

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relaybot_core::config::Config;
use relaybot_core::cron::{CronEntry, CronStore};
use relaybot_core::paths::WorkspacePaths;
use relaybot_core::session::SessionStore;
use relaybot_core::workspace;

/// Exit code that asks the supervisor for an immediate restart.
const RESTART_EXIT_CODE: i32 = 42;

#[derive(Parser)]
#[command(
    name = "relaybot",
    version,
    about = "Bridge a Telegram chat to AI coding-agent CLIs",
    long_about = "relaybot — one process bridging Telegram to claude/codex subprocesses,\n\
                  with a cron scheduler, webhook ingress, heartbeat, and a synced workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge and all background observers
    Run,
    /// Create or refresh the workspace layout
    Init,
    /// Write the default configuration file
    Onboard,
    /// Show configuration status and health
    Status,
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
    /// Inspect webhooks and mint bearer tokens
    Webhook {
        #[command(subcommand)]
        action: WebhookCommands,
    },
    /// List chat sessions
    Sessions,
}

#[derive(Subcommand)]
enum CronCommands {
    /// List all jobs
    List,
    /// Add a job
    Add {
        /// Job id (lowercased, hyphenated)
        #[arg(long)]
        id: String,
        /// 5-field cron expression, e.g. "0 9 * * *"
        #[arg(long)]
        schedule: String,
        /// Task folder name under workspace/cron_tasks
        #[arg(long)]
        folder: String,
        /// Instruction text for the agent
        #[arg(long)]
        instruction: String,
    },
    /// Remove a job
    Remove { id: String },
    /// Enable a job
    Enable { id: String },
    /// Disable a job
    Disable { id: String },
}

#[derive(Subcommand)]
enum WebhookCommands {
    /// List configured hooks with trigger stats
    List,
    /// Print a freshly generated bearer token
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let paths = Arc::new(WorkspacePaths::resolve());

    match cli.command {
        Commands::Run => cmd_run(paths).await?,
        Commands::Init => {
            workspace::init(&paths)?;
            Config::load(&paths)?;
            println!("  ✅ Workspace ready at {}", paths.root.display());
        }
        Commands::Onboard => cmd_onboard(&paths)?,
        Commands::Status => cmd_status(&paths).await?,
        Commands::Cron { action } => cmd_cron(&paths, action)?,
        Commands::Webhook { action } => cmd_webhook(&paths, action)?,
        Commands::Sessions => cmd_sessions(&paths).await?,
    }

    Ok(())
}

// ── Run ─────────────────────────────────────────────────────────────

#[cfg(feature = "telegram")]
async fn cmd_run(paths: Arc<WorkspacePaths>) -> Result<()> {
    use relaybot_core::agent::Orchestrator;
    use relaybot_core::cleanup::CleanupSweeper;
    use relaybot_core::cli::CliService;
    use relaybot_core::cron::CronScheduler;
    use relaybot_core::gateway::telegram::TelegramTransport;
    use relaybot_core::gateway::{ChatRef, MessagePipeline};
    use relaybot_core::heartbeat::HeartbeatService;
    use relaybot_core::process::ProcessRegistry;
    use relaybot_core::runner::{DependencyLocks, TaskReport, TaskRunner};
    use relaybot_core::webhook::{
        AppState, HookDispatcher, RateLimiter, WebhookServer, WebhookStore,
    };
    use tokio_util::sync::CancellationToken;

    workspace::init(&paths)?;
    let config = Arc::new(Config::load(&paths)?);
    if config.telegram.token.is_empty() {
        anyhow::bail!(
            "No Telegram token configured. Edit {} first.",
            paths.config_file.display()
        );
    }
    if config.telegram.allowed_user_ids.is_empty() {
        anyhow::bail!("telegram.allowedUserIds is empty; nobody could talk to the bot");
    }

    acquire_pid_lock(&paths)?;
    workspace::inject_runtime_env(&paths, std::env::var_os("RELAYBOT_SANDBOXED").is_some());

    // Core services, leaves first.
    let registry = Arc::new(ProcessRegistry::new());
    let sessions = Arc::new(SessionStore::load(&paths)?);
    let cli_service = Arc::new(CliService::new(Arc::clone(&registry), &config.cli));
    let cli_timeout = cli_service.timeout();
    let cron_store = Arc::new(CronStore::new(paths.cron_jobs_file.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&sessions),
        Arc::clone(&cli_service) as Arc<dyn relaybot_core::cli::ProviderExecutor>,
        Arc::clone(&registry),
        Arc::clone(&cron_store),
    ));

    let outbox = TelegramTransport::outbox(&config.telegram.token);
    let pipeline = Arc::new(MessagePipeline::new(
        Arc::clone(&config),
        Arc::clone(&outbox),
        Arc::clone(&orchestrator),
        Arc::clone(&registry),
    ));

    let deps = Arc::new(DependencyLocks::new());
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&cli_service),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&deps),
    ));

    let cancel = CancellationToken::new();
    let mut observers = Vec::new();

    // Cron results go to the first allowed chat.
    let (reports_tx, mut reports_rx) = tokio::sync::mpsc::channel::<TaskReport>(32);
    {
        let outbox = Arc::clone(&outbox);
        let chat_id = config.telegram.allowed_user_ids[0] as i64;
        let cancel = cancel.clone();
        observers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    report = reports_rx.recv() => {
                        let Some(report) = report else { return };
                        let text = format!(
                            "🗓 {}\n─────────────────\nstatus: {}\n\n{}",
                            report.title, report.status, report.text
                        );
                        let _ = outbox.send(&ChatRef::new(chat_id), &text).await;
                    }
                }
            }
        }));
    }

    let scheduler = CronScheduler::new(
        Arc::clone(&cron_store),
        Arc::clone(&runner),
        Arc::clone(&config),
        Some(reports_tx),
    );
    observers.push(tokio::spawn(scheduler.run(cancel.clone())));

    if config.webhook.enabled {
        let store = Arc::new(WebhookStore::new(paths.webhooks_file.clone()));
        let dispatcher = Arc::new(HookDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            pipeline.clone(),
            config
                .telegram
                .allowed_user_ids
                .iter()
                .map(|id| *id as i64)
                .collect(),
        ));
        let state = AppState {
            store,
            limiter: Arc::new(RateLimiter::new(config.webhook.rate_limit_per_minute)),
            dispatcher,
            global_token: config.webhook.token.clone(),
        };
        let server = WebhookServer::new(&config, state);
        let cancel_server = cancel.clone();
        observers.push(tokio::spawn(async move {
            if let Err(e) = server.run(cancel_server).await {
                tracing::error!(error = %e, "webhook server terminated");
            }
        }));
    }

    if config.heartbeat.enabled {
        let heartbeat = HeartbeatService::new(
            Arc::clone(&config),
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
            Arc::clone(&outbox),
            cli_timeout,
        );
        observers.push(tokio::spawn(heartbeat.run(cancel.clone())));
    }

    let sweeper = CleanupSweeper::new(Arc::clone(&config), Arc::clone(&paths));
    observers.push(tokio::spawn(sweeper.run(cancel.clone())));
    observers.push(tokio::spawn(workspace::rule_pair_watcher(
        Arc::clone(&paths),
        cancel.clone(),
    )));
    observers.push(tokio::spawn(workspace::skill_sync_watcher(
        Arc::clone(&paths),
        cancel.clone(),
    )));

    println!("  🤖 relaybot running. Press Ctrl+C to stop.");
    let transport = TelegramTransport::new(config.telegram.token.clone(), Arc::clone(&pipeline));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n  ⏳ Shutting down…");
        }
        result = transport.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "telegram transport failed");
            }
        }
    }

    // Shutdown: stop observers, reap children, undo our skill links.
    cancel.cancel();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        futures::future::join_all(observers),
    )
    .await;
    registry.kill_everything().await;
    workspace::skills::shutdown_cleanup(&paths);
    release_pid_lock(&paths);

    if paths.restart_requested.exists() {
        let _ = std::fs::remove_file(&paths.restart_requested);
        println!("  🔄 Restart requested.");
        std::process::exit(RESTART_EXIT_CODE);
    }
    println!("  ✅ Shutdown complete.");
    Ok(())
}

#[cfg(not(feature = "telegram"))]
async fn cmd_run(_paths: Arc<WorkspacePaths>) -> Result<()> {
    anyhow::bail!("this build has no chat transport; rebuild with --features telegram")
}

// ── PID lock ────────────────────────────────────────────────────────

fn acquire_pid_lock(paths: &WorkspacePaths) -> Result<()> {
    if let Ok(content) = std::fs::read_to_string(&paths.pid_file) {
        if let Ok(pid) = content.trim().parse::<i32>() {
            if process_alive(pid) {
                anyhow::bail!("relaybot already running with pid {pid}");
            }
        }
    }
    std::fs::write(&paths.pid_file, std::process::id().to_string())?;
    Ok(())
}

fn release_pid_lock(paths: &WorkspacePaths) {
    let _ = std::fs::remove_file(&paths.pid_file);
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

// ── Onboard / status ────────────────────────────────────────────────

fn cmd_onboard(paths: &WorkspacePaths) -> Result<()> {
    let created = Config::write_default_template(paths)?;
    println!();
    if created {
        println!("  ✅ Configuration created at:");
    } else {
        println!("  ℹ️ Configuration already exists at:");
    }
    println!("     {}", paths.config_file.display());
    println!();
    println!("  Next steps:");
    println!("  1. Set telegram.token and telegram.allowedUserIds");
    println!("  2. Run `relaybot init` to materialize the workspace");
    println!("  3. Run `relaybot run`");
    println!();
    Ok(())
}

async fn cmd_status(paths: &WorkspacePaths) -> Result<()> {
    println!();
    println!("  🤖 relaybot status");
    println!("  ─────────────────────────────────────");

    if !paths.config_file.exists() {
        println!("  Config:    ❌ Not found (run `relaybot onboard`)");
        return Ok(());
    }
    let config = Config::load(paths)?;
    println!("  Config:    {}", paths.config_file.display());
    println!(
        "  Telegram:  {}",
        if config.telegram.token.is_empty() {
            "❌ no token"
        } else {
            "✅ token set"
        }
    );
    println!(
        "  Users:     {} allowed",
        config.telegram.allowed_user_ids.len()
    );
    println!(
        "  Defaults:  {} / {}",
        config.defaults.provider, config.defaults.model
    );

    for provider in relaybot_core::cli::PROVIDERS {
        let binary = match *provider {
            "claude" => config.cli.claude_binary.as_str(),
            _ => config.cli.codex_binary.as_str(),
        };
        let status = relaybot_core::cli::discover_provider(provider, binary);
        println!("  {provider}:    {status:?}");
    }

    let workspace_ok = paths.workspace_dir.is_dir();
    println!(
        "  Workspace: {} {}",
        paths.workspace_dir.display(),
        if workspace_ok { "✅" } else { "⚠️ (run `relaybot init`)" }
    );

    let sessions = SessionStore::load(paths)?;
    println!("  Sessions:  {}", sessions.chat_ids().await.len());

    let cron = CronStore::new(paths.cron_jobs_file.clone());
    let jobs = cron.load().unwrap_or_default();
    println!(
        "  Cron:      {} jobs ({} enabled)",
        jobs.len(),
        jobs.iter().filter(|j| j.enabled).count()
    );
    println!(
        "  Webhook:   {}",
        if config.webhook.enabled {
            format!("✅ {}:{}", config.webhook.host, config.webhook.port)
        } else {
            "disabled".into()
        }
    );
    println!();
    Ok(())
}

// ── Cron / webhook / sessions ───────────────────────────────────────

fn cmd_cron(paths: &WorkspacePaths, action: CronCommands) -> Result<()> {
    let store = CronStore::new(paths.cron_jobs_file.clone());
    match action {
        CronCommands::List => {
            let jobs = store.load()?;
            if jobs.is_empty() {
                println!("  No scheduled jobs.");
                return Ok(());
            }
            println!();
            for job in jobs {
                let status = if job.enabled { "✅" } else { "⏸" };
                println!("  {} {} [{}]", status, job.title, job.id);
                println!("     Schedule: {}", job.schedule);
                println!("     Folder:   {}", job.task_folder);
                if let Some(last_status) = &job.last_status {
                    println!("     Last run: {}", last_status);
                }
                println!();
            }
        }
        CronCommands::Add {
            id,
            schedule,
            folder,
            instruction,
        } => {
            let entry = CronEntry {
                id: id.clone(),
                title: id,
                schedule,
                task_folder: folder.clone(),
                instruction,
                ..Default::default()
            };
            let stored = store.add(entry)?;
            let task_dir = paths.task_folder(&folder);
            std::fs::create_dir_all(&task_dir)?;
            println!("  ✅ Job added: {stored} (folder {})", task_dir.display());
        }
        CronCommands::Remove { id } => {
            if store.remove(&id)? {
                println!("  ✅ Job removed: {id}");
            } else {
                println!("  ❌ Job not found: {id}");
            }
        }
        CronCommands::Enable { id } => {
            if store.set_enabled(&id, true)? {
                println!("  ✅ Job enabled: {id}");
            } else {
                println!("  ❌ Job not found: {id}");
            }
        }
        CronCommands::Disable { id } => {
            if store.set_enabled(&id, false)? {
                println!("  ⏸ Job disabled: {id}");
            } else {
                println!("  ❌ Job not found: {id}");
            }
        }
    }
    Ok(())
}

fn cmd_webhook(paths: &WorkspacePaths, action: WebhookCommands) -> Result<()> {
    match action {
        WebhookCommands::List => {
            let store = relaybot_core::webhook::WebhookStore::new(paths.webhooks_file.clone());
            let hooks = store.entries();
            if hooks.is_empty() {
                println!("  No webhooks configured.");
                return Ok(());
            }
            println!();
            for hook in hooks {
                let status = if hook.enabled { "✅" } else { "⏸" };
                println!("  {} {} [{}] ({:?})", status, hook.title, hook.id, hook.mode);
                println!(
                    "     Triggers: {} · Last error: {}",
                    hook.trigger_count,
                    hook.last_error.as_deref().unwrap_or("none")
                );
                println!();
            }
        }
        WebhookCommands::Token => {
            println!("{}", relaybot_core::webhook::auth::generate_token());
        }
    }
    Ok(())
}

async fn cmd_sessions(paths: &WorkspacePaths) -> Result<()> {
    let sessions = SessionStore::load(paths)?;
    let mut chat_ids = sessions.chat_ids().await;
    chat_ids.sort_unstable();
    if chat_ids.is_empty() {
        println!("  No sessions.");
        return Ok(());
    }
    println!();
    for chat_id in chat_ids {
        if let Some(envelope) = sessions.get(chat_id).await {
            println!(
                "  💬 {} — {} / {} (last active {})",
                chat_id,
                if envelope.active_provider.is_empty() {
                    "default"
                } else {
                    &envelope.active_provider
                },
                if envelope.active_model.is_empty() {
                    "default"
                } else {
                    &envelope.active_model
                },
                envelope.last_active.format("%Y-%m-%d %H:%M UTC"),
            );
            for (provider, bucket) in &envelope.providers {
                println!(
                    "     {}: {} messages, {} tokens, ${:.2}",
                    provider, bucket.message_count, bucket.total_tokens, bucket.total_cost_usd
                );
            }
        }
    }
    println!();
    Ok(())
}
