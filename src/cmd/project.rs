//! Project initialization and status commands.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use crucible::Engine;
    use crucible::config::CrucibleToml;
    use crucible::store::StateStore;

    let crucible_dir = project_dir.join(".crucible");
    let store = StateStore::open(&crucible_dir);
    let engine = Engine::new(store);
    let created = engine.init("cli")?;

    let config_path = crucible_dir.join("crucible.toml");
    if !config_path.exists() {
        CrucibleToml::default().save(&config_path)?;
    }

    if created {
        println!(
            "Initialized crucible project at {}",
            crucible_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .crucible/");
        println!("  ├── crucible.toml  # Project configuration");
        println!("  ├── state/         # Current stage, tasks, gates, workers");
        println!("  ├── checkpoints/   # Snapshots captured at gate approvals");
        println!("  ├── handoffs/      # Structured worker handoff documents");
        println!("  ├── logs/          # Daemon logs");
        println!("  └── audit.jsonl    # Append-only audit trail");
        println!();
        println!("Next steps:");
        println!("  1. Create tasks for the current stage and register workers");
        println!("  2. Satisfy gate criteria as the work completes");
        println!("  3. Run `crucible serve` to expose state over HTTP and WebSocket");
    } else {
        println!(
            "Crucible project already initialized at {}",
            crucible_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    use crucible::Engine;
    use crucible::audit::AuditFilter;
    use crucible::config::EngineConfig;
    use crucible::gates::GateStatus;
    use crucible::stage::Stage;
    use crucible::store::{Resource, StateStore};
    use crucible::task::TaskStatus;

    println!();
    println!("Crucible Project Status");
    println!("=======================");
    println!();

    let crucible_dir = project_dir.join(".crucible");
    let store = StateStore::open(&crucible_dir);
    if !store.resource_path(Resource::Stage).exists() {
        println!("Project: Not initialized");
        println!();
        println!("Run 'crucible init' to initialize the project.");
        println!();
        return Ok(());
    }

    let engine = Engine::with_config(store, EngineConfig::load(project_dir)?);

    let stage = engine.current_stage()?;
    println!(
        "Stage:   {} ({} of {})",
        stage.as_str(),
        stage.position() + 1,
        Stage::all().len()
    );

    let gate_line = match engine.check_gate(stage)? {
        GateStatus::Open => "open (approved)".to_string(),
        GateStatus::AwaitingApproval => "awaiting approval".to_string(),
        GateStatus::Closed { missing } => format!("closed: {}", missing.join("; ")),
    };
    println!("Gate:    {}", gate_line);

    let tasks = engine.tasks()?;
    println!();
    if tasks.is_empty() {
        println!("Tasks:   none recorded");
    } else {
        println!("Tasks:   {} total", tasks.len());
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Done,
        ] {
            let count = tasks.iter().filter(|t| t.status == status).count();
            if count > 0 {
                println!("  {:<12} {}", status.as_str(), count);
            }
        }
    }

    let workers = engine.workers()?;
    println!();
    if workers.is_empty() {
        println!("Workers: none registered");
    } else {
        println!("Workers: {}", workers.len());
        println!(
            "  {:<14} {:<12} {:<10} {:<7} Task",
            "ID", "Persona", "Status", "PID"
        );
        for worker in workers.values() {
            println!(
                "  {:<14} {:<12} {:<10} {:<7} {}",
                worker.id,
                worker.persona.as_str(),
                worker.status.as_str(),
                worker
                    .pid
                    .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                worker.task_id.as_deref().unwrap_or("-"),
            );
        }
    }

    let summary = engine.usage_summary()?;
    let spent = summary.total_input + summary.total_output;
    println!();
    println!(
        "Tokens:  {} of {} budgeted {}",
        spent,
        summary.budget,
        console::style(format!("(est. ${:.2})", summary.total_cost_usd)).dim()
    );
    for (id, report) in &summary.workers {
        println!(
            "  {:<14} {:>3}% of budget ({} in, {} out)",
            id, report.budget_pct, report.input, report.output
        );
    }

    let records = engine.audit_trail(&AuditFilter::default())?;
    if !records.is_empty() {
        println!();
        println!("Recent activity:");
        for record in records.iter().rev().take(5) {
            println!(
                "  {}  {:<22} {:<10} {}",
                console::style(record.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                record.action,
                record.actor,
                record.target
            );
        }
    }
    println!();

    Ok(())
}
