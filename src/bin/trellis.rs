//! trellis CLI — operator interface to the lifecycle engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use trellis_rs::catalog;
use trellis_rs::config::Config;
use trellis_rs::db::Db;
use trellis_rs::engine::{HandlerRegistry, TransitionEngine, TriggerDispatcher};
use trellis_rs::error::Error;
use trellis_rs::model::{EntityKey, HistoryQuery, replay};
use trellis_rs::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "trellis", about = "Entity lifecycle substrate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trigger dispatch daemon
    Serve,
    /// Machine definition operations
    Machine {
        #[command(subcommand)]
        action: MachineAction,
    },
    /// Apply a lifecycle event to an entity
    Fire {
        entity_type: String,
        entity_id: String,
        /// Machine code (unique within the entity type)
        machine: String,
        event: String,
        /// JSON context map evaluated by transition conditions
        #[arg(long)]
        context: Option<String>,
        /// Who or what asked for the transition
        #[arg(long, default_value = "cli")]
        triggered_by: String,
        /// Idempotency token making retries safe
        #[arg(long)]
        token: Option<String>,
    },
    /// Show an entity's current state under a machine
    State {
        entity_type: String,
        entity_id: String,
        machine: String,
    },
    /// Show an entity's audit trail under a machine
    History {
        entity_type: String,
        entity_id: String,
        machine: String,
        /// Return records after this sequence number
        #[arg(long, default_value_t = 0)]
        after: i64,
        /// Maximum records to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Re-fold the records and check they reproduce the current state
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Subcommand)]
enum MachineAction {
    /// Register every .toml machine file in a directory
    Load {
        /// Directory containing machine catalog files
        dir: PathBuf,
    },
    /// List registered machines
    List,
    /// Show a machine's states and transitions
    Show {
        entity_type: String,
        /// Machine code
        code: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Machine { action } => {
            let db = connect().await?;
            match action {
                MachineAction::Load { dir } => cmd_machine_load(&db, dir).await,
                MachineAction::List => cmd_machine_list(&db).await,
                MachineAction::Show { entity_type, code } => {
                    cmd_machine_show(&db, entity_type, code).await
                }
            }
        }
        Command::Fire {
            entity_type,
            entity_id,
            machine,
            event,
            context,
            triggered_by,
            token,
        } => {
            let db = connect().await?;
            cmd_fire(db, entity_type, entity_id, machine, event, context, triggered_by, token)
                .await
        }
        Command::State {
            entity_type,
            entity_id,
            machine,
        } => {
            let db = connect().await?;
            cmd_state(db, entity_type, entity_id, machine).await
        }
        Command::History {
            entity_type,
            entity_id,
            machine,
            after,
            limit,
            verify,
        } => {
            let db = connect().await?;
            cmd_history(db, entity_type, entity_id, machine, after, limit, verify).await
        }
    }
}

async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.ensure_queue().await?;
    Ok(db)
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "trellis".to_string(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.ensure_queue().await?;

    let dispatcher = TriggerDispatcher::new(
        Arc::new(db),
        Arc::new(HandlerRegistry::with_builtins()),
        config.dispatcher_config(),
    );

    let shutdown = dispatcher.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.notify_one();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_machine_load(db: &Db, dir: PathBuf) -> anyhow::Result<()> {
    let machines = catalog::load_from_dir(db, &dir).await?;
    for machine in &machines {
        println!("Registered: {}/{} ({})", machine.entity_type, machine.code, machine.id);
    }
    println!("{} machine(s) loaded", machines.len());
    Ok(())
}

async fn cmd_machine_list(db: &Db) -> anyhow::Result<()> {
    let machines = db.list_machines().await?;
    if machines.is_empty() {
        println!("No machines registered.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:<20}  {:<8}  CREATED",
        "ID", "ENTITY_TYPE", "CODE", "ACTIVE"
    );
    println!("{}", "-".repeat(80));
    for machine in &machines {
        println!(
            "{:<8}  {:<14}  {:<20}  {:<8}  {}",
            machine.id.to_string(),
            machine.entity_type,
            machine.code,
            machine.is_active,
            machine.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} machine(s)", machines.len());
    Ok(())
}

async fn cmd_machine_show(db: &Db, entity_type: String, code: String) -> anyhow::Result<()> {
    let machine = db.machine_by_code(&entity_type, &code).await?;
    let states = db.states_of(machine.id).await?;
    let transitions = db.transitions_of(machine.id).await?;

    println!("Machine:     {}/{}", machine.entity_type, machine.code);
    println!("Name:        {}", machine.name);
    println!("Active:      {}", machine.is_active);
    println!("Created:     {}", machine.created_at);

    println!("\nStates:");
    for state in &states {
        let mut flags = Vec::new();
        if state.is_initial {
            flags.push("initial");
        }
        if state.is_final {
            flags.push("final");
        }
        if !state.is_active {
            flags.push("disabled");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("  {} {}{}", state.id, state.code, flags);
    }

    println!("\nTransitions:");
    let code_of = |id| {
        states
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.code.as_str())
            .unwrap_or("?")
    };
    for t in &transitions {
        let guard = if t.condition.is_some() { " (conditional)" } else { "" };
        println!(
            "  {} --{}--> {}{}",
            code_of(t.from_state_id),
            t.event_name,
            code_of(t.to_state_id),
            guard
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_fire(
    db: Db,
    entity_type: String,
    entity_id: String,
    machine_code: String,
    event: String,
    context: Option<String>,
    triggered_by: String,
    token: Option<String>,
) -> anyhow::Result<()> {
    let context: serde_json::Value = match context {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let machine = db.machine_by_code(&entity_type, &machine_code).await?;
    let engine = TransitionEngine::new(Arc::new(db));

    let mut request = trellis_rs::engine::TransitionRequest::new(
        &entity_type,
        &entity_id,
        machine.id,
        &event,
    )
    .triggered_by(&triggered_by)
    .context(context);
    if let Some(ref token) = token {
        request = request.idempotency_token(token);
    }

    match engine.transition(request).await {
        Ok(outcome) => {
            let to = engine.store().state(outcome.to_state_id).await?;
            let from = match outcome.from_state_id {
                Some(id) => engine.store().state(id).await?.code,
                None => "<uninitialized>".to_string(),
            };
            let note = if outcome.replayed {
                " (idempotent replay)"
            } else if outcome.from_state_id.is_none() {
                " (bootstrapped; event not consumed)"
            } else {
                ""
            };
            println!("{from} -> {} @ seq {}{note}", to.code, outcome.record.sequence_no);
        }
        Err(e @ (Error::TransitionNotAllowed { .. } | Error::TransitionConditionFailed { .. })) => {
            println!("Rejected: {e}");
        }
        Err(e @ Error::ConcurrentTransitionConflict { .. }) => {
            println!("Conflict: {e}");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_state(
    db: Db,
    entity_type: String,
    entity_id: String,
    machine_code: String,
) -> anyhow::Result<()> {
    let machine = db.machine_by_code(&entity_type, &machine_code).await?;
    let engine = TransitionEngine::new(Arc::new(db));
    let key = EntityKey::new(&entity_type, &entity_id, machine.id);

    match engine.current_state(&key).await? {
        Some(state) => println!("{}: {} ({})", key, state.code, state.name),
        None => println!("{key}: <uninitialized>"),
    }
    Ok(())
}

async fn cmd_history(
    db: Db,
    entity_type: String,
    entity_id: String,
    machine_code: String,
    after: i64,
    limit: i64,
    verify: bool,
) -> anyhow::Result<()> {
    let machine = db.machine_by_code(&entity_type, &machine_code).await?;
    let engine = TransitionEngine::new(Arc::new(db));
    let key = EntityKey::new(&entity_type, &entity_id, machine.id);

    let records = engine
        .history(&key, &HistoryQuery { after_sequence: after, limit })
        .await?;
    if records.is_empty() {
        println!("No history for {key}.");
        return Ok(());
    }

    println!("{:<6}  {:<20}  {:<14}  {:<16}  OCCURRED", "SEQ", "EVENT", "STATE", "BY");
    println!("{}", "-".repeat(90));
    for record in &records {
        let state = engine.store().state(record.state_id).await?;
        println!(
            "{:<6}  {:<20}  {:<14}  {:<16}  {}",
            record.sequence_no,
            record.event_name,
            state.code,
            record.triggered_by,
            record.occurred_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} record(s)", records.len());

    if verify {
        // Re-read the full history so the fold starts at sequence 1.
        let full = engine
            .history(&key, &HistoryQuery { after_sequence: 0, limit: i64::MAX })
            .await?;
        match replay(&full) {
            Ok(folded) => {
                let last = full.last().map(|r| r.state_id);
                if folded == last {
                    println!("Replay OK: history folds to the current state.");
                } else {
                    anyhow::bail!("replay mismatch: fold produced {folded:?}, log ends at {last:?}");
                }
            }
            Err(e) => anyhow::bail!("replay failed: {e}"),
        }
    }
    Ok(())
}
