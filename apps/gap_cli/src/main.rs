use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    AssessmentClient, DurableAssessmentBackend, ItemPatch, ItemQuery, SessionSummary,
    StaticIdentity, StatusFilter, SyncState,
};
use serde::Serialize;
use shared::{
    domain::{ComplianceStatus, ControlItem, ItemId, TierStatus, UserId},
    error::{AssessmentError, ErrorPayload},
    protocol::AssessmentMetrics,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod config;
mod export;

use config::{load_settings, prepare_database_url};
use export::JsonReportExporter;

#[derive(Parser, Debug)]
#[command(name = "gap", about = "NIS2 gap-analysis assessment tracker")]
struct Cli {
    /// Identity to load; omit for an anonymous demo session.
    #[arg(long, global = true)]
    user: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the control items visible on the current tier.
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value = "all")]
        status: StatusFilter,
    },
    Show {
        id: String,
    },
    SetStatus {
        id: String,
        status: ComplianceStatus,
    },
    Note {
        id: String,
        text: String,
    },
    Requirement {
        id: String,
        text: String,
    },
    /// Mark a subtask done (or not done with --undone).
    Subtask {
        id: String,
        subtask_id: String,
        #[arg(long)]
        undone: bool,
    },
    Remove {
        id: String,
    },
    Stats,
    Export,
    /// Activate the subscription for --user and switch to the pro tier.
    Upgrade,
    Status,
}

#[derive(Serialize)]
struct StatusView {
    user_id: Option<UserId>,
    tier: TierStatus,
    sync: String,
    visible: usize,
    total: usize,
    unsynced_changes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &anyhow::Error, json: bool) {
    if json {
        let payload = match err.downcast_ref::<AssessmentError>() {
            Some(assessment_err) => serde_json::to_string(&ErrorPayload::from(assessment_err)),
            None => serde_json::to_string(&serde_json::json!({
                "code": "internal",
                "message": format!("{err:#}"),
            })),
        };
        match payload {
            Ok(payload) => eprintln!("{payload}"),
            Err(_) => eprintln!("error: {err:#}"),
        }
    } else {
        eprintln!("error: {err:#}");
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let backend = DurableAssessmentBackend::initialize(&database_url).await?;
    let user_id = cli.user.as_deref().map(UserId::new);

    let client = AssessmentClient::new_with_dependencies(
        settings.client_config(),
        Arc::new(StaticIdentity::new(user_id.clone())),
        backend.clone(),
        backend.clone(),
        Arc::new(JsonReportExporter::new(settings.report_dir.clone())),
    );
    let summary = client.start_session().await?;
    if let Some(load_warning) = &summary.load_warning {
        if !cli.json {
            eprintln!("warning: stored assessment could not be loaded ({load_warning}); using the default checklist");
        }
    }

    match &cli.command {
        Command::List { search, status } => {
            let query = ItemQuery::new(search.clone().unwrap_or_default(), *status);
            let items = client.query(&query).await?;
            print_items(&items, cli.json)?;
        }
        Command::Show { id } => {
            let item = client.item(&ItemId::new(id.as_str())).await?;
            print_item(&item, cli.json)?;
        }
        Command::SetStatus { id, status } => {
            edit(&client, id, ItemPatch::status(*status), cli.json).await?;
        }
        Command::Note { id, text } => {
            edit(&client, id, ItemPatch::notes(text.as_str()), cli.json).await?;
        }
        Command::Requirement { id, text } => {
            edit(&client, id, ItemPatch::requirement(text.as_str()), cli.json).await?;
        }
        Command::Subtask {
            id,
            subtask_id,
            undone,
        } => {
            edit(
                &client,
                id,
                ItemPatch::subtask_done(subtask_id.as_str(), !*undone),
                cli.json,
            )
            .await?;
        }
        Command::Remove { id } => {
            let removed = client.remove_item(&ItemId::new(id.as_str())).await?;
            settle(&client).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&removed)?);
            } else {
                println!("removed {} {}", removed.id, removed.requirement);
            }
        }
        Command::Stats => {
            let metrics = client.metrics().await?;
            print_metrics(&metrics, cli.json)?;
        }
        Command::Export => {
            let receipt = client.export_report().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else {
                println!("exported {} items to {}", receipt.item_count, receipt.location);
            }
        }
        Command::Upgrade => {
            let Some(user_id) = &user_id else {
                bail!("upgrade requires --user");
            };
            backend.storage().set_subscription(user_id, true).await?;
            let tier = client.refresh_tier().await?;
            if cli.json {
                println!("{}", serde_json::json!({ "user_id": user_id, "tier": tier }));
            } else {
                println!("{user_id} is now on the {tier} tier");
            }
        }
        Command::Status => {
            print_status(&client, &summary, cli.json).await?;
        }
    }

    client.end_session().await;
    Ok(())
}

async fn edit(client: &Arc<AssessmentClient>, id: &str, patch: ItemPatch, json: bool) -> Result<()> {
    let item = client.update_item(&ItemId::new(id), &patch).await?;
    settle(client).await?;
    print_item(&item, json)
}

/// Waits for pending writes; the process exits right after, so a failed
/// write would lose the edit.
async fn settle(client: &Arc<AssessmentClient>) -> Result<()> {
    match client.flush().await? {
        SyncState::SyncFailed(err) => {
            warn!(error = %err, "sync: edit not persisted");
            Err(err.into())
        }
        _ => Ok(()),
    }
}

fn print_items(items: &[ControlItem], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    for item in items {
        println!(
            "{:>3}  {:<18}  {:<8}  {:<26}  {}",
            item.id.as_str(),
            item.status.as_str(),
            item.priority.as_str(),
            item.category,
            item.requirement
        );
    }
    println!("{} item(s)", items.len());
    Ok(())
}

fn print_item(item: &ControlItem, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(item)?);
        return Ok(());
    }
    println!("{} {}", item.id, item.requirement);
    println!("  category: {}", item.category);
    println!("  owner:    {}", item.owner);
    println!("  priority: {}", item.priority);
    println!("  status:   {}", item.status);
    if !item.notes.is_empty() {
        println!("  notes:    {}", item.notes);
    }
    for subtask in &item.subtasks {
        let mark = if subtask.done { "x" } else { " " };
        println!("  [{mark}] {} {}", subtask.id, subtask.text);
    }
    Ok(())
}

fn print_metrics(metrics: &AssessmentMetrics, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
        return Ok(());
    }
    let summary = &metrics.summary;
    println!(
        "progress {}%  ({} of {} compliant, {} started, {} critical)",
        summary.progress, summary.compliant, summary.total, summary.started, summary.critical
    );
    println!("by status:");
    for (status, count) in metrics.by_status.iter() {
        println!("  {:<18} {count}", status.as_str());
    }
    println!("by priority:");
    for (priority, count) in metrics.by_priority.iter() {
        println!("  {:<18} {count}", priority.as_str());
    }
    println!("by category:");
    for (category, count) in metrics.by_category.iter() {
        println!("  {category:<26} {count}");
    }
    Ok(())
}

async fn print_status(
    client: &Arc<AssessmentClient>,
    summary: &SessionSummary,
    json: bool,
) -> Result<()> {
    let view = StatusView {
        user_id: summary.user_id.clone(),
        tier: client.tier().await,
        sync: client.sync_state().await.to_string(),
        visible: summary.visible,
        total: summary.total,
        unsynced_changes: client.has_unsynced_changes().await,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    match &view.user_id {
        Some(user_id) => println!("user:    {user_id}"),
        None => println!("user:    anonymous (changes are not saved)"),
    }
    println!("tier:    {}", view.tier);
    println!("sync:    {}", view.sync);
    println!("items:   {} of {} visible", view.visible, view.total);
    Ok(())
}
