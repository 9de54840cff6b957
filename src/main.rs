use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowcast::config::Config;
use flowcast::dispatch::Dispatcher;
use flowcast::engine::{FlowEngine, InboundEvent};
use flowcast::gateway::{
    AudienceSpec, FixedHolidayCalendar, HolidayCalendar, InlineAudienceResolver, LoggingGateway,
    NoHolidays,
};
use flowcast::schedule::{compute_next, preview, Recurrence, Schedule, ScheduleRunner};
use flowcast::shutdown::ShutdownCoordinator;
use flowcast::storage::{
    Automation, DispatchOverrides, DispatchSettings, ExecutionQuery, ExecutionStatus, FlowRecord,
    RetryPolicy, SqliteStorage,
};

use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flowcast")]
#[command(about = "Conversation-flow automation engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the schedule poller until SIGTERM/SIGINT
    Serve,
    /// Manage flow definitions
    Flow {
        #[command(subcommand)]
        action: FlowActions,
    },
    /// Manage automations (flow + audience + dispatch settings)
    Automation {
        #[command(subcommand)]
        action: AutomationActions,
    },
    /// Manage recurring schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleActions,
    },
    /// Manage per-occurrence schedule exceptions
    Exception {
        #[command(subcommand)]
        action: ExceptionActions,
    },
    /// Feed one inbound subscriber message into a flow
    Inbound {
        /// Flow ID
        #[arg(long)]
        flow: String,
        /// Subject (contact) ID
        #[arg(long)]
        subject: String,
        /// Message text
        text: String,
        /// Channel event id, for replay detection (generated when omitted)
        #[arg(long)]
        event_id: Option<String>,
    },
    /// Inspect automation executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
}

#[derive(Subcommand)]
enum FlowActions {
    /// List stored flows
    List {
        /// Filter by organization
        #[arg(long)]
        org: Option<String>,
    },
    /// Create or update a flow from a YAML/JSON file
    Create {
        /// Path to flow definition file
        file: String,
    },
    /// Validate a flow definition file without saving it
    Validate {
        /// Path to flow definition file
        file: String,
    },
    /// Show a stored flow
    Show {
        /// Flow ID
        id: String,
    },
    /// Enable a flow
    Enable {
        /// Flow ID
        id: String,
    },
    /// Disable a flow (stops new runs; suspended conversations stall)
    Disable {
        /// Flow ID
        id: String,
    },
    /// Delete a flow
    Delete {
        /// Flow ID
        id: String,
    },
}

#[derive(Subcommand)]
enum AutomationActions {
    /// List automations
    List {
        /// Filter by organization
        #[arg(long)]
        org: Option<String>,
    },
    /// Create an automation binding a flow to an audience
    Create {
        /// Automation name
        name: String,
        /// Organization ID
        #[arg(long)]
        org: String,
        /// Flow ID to run per recipient
        #[arg(long)]
        flow: String,
        /// Contact ID (repeat for more); mutually exclusive with --segment
        #[arg(short, long = "contact")]
        contacts: Vec<String>,
        /// Saved segment ID, resolved by the external contact directory
        #[arg(long, conflicts_with = "contacts")]
        segment: Option<String>,
        /// Messages per hour across the whole batch
        #[arg(long)]
        rate_limit: Option<u32>,
        /// Concurrent recipient tasks
        #[arg(long)]
        max_concurrent: Option<u32>,
        /// Delivery attempts per recipient before permanent failure
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Run an automation immediately, ignoring its schedule
    Trigger {
        /// Automation ID
        id: String,
    },
    /// Enable an automation
    Enable {
        /// Automation ID
        id: String,
    },
    /// Disable an automation (queued occurrences lapse)
    Disable {
        /// Automation ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleActions {
    /// List schedules
    List {
        /// Filter by automation
        #[arg(long)]
        automation: Option<String>,
    },
    /// Create a schedule for an automation from a YAML/JSON file
    Create {
        /// Automation ID
        #[arg(long)]
        automation: String,
        /// Path to schedule file (recurrence, start_date, window, ...)
        file: String,
    },
    /// Show the next computed occurrences without firing anything
    Preview {
        /// Schedule ID
        id: String,
        /// How many occurrences
        #[arg(short, long, default_value = "10")]
        count: usize,
        /// How far ahead to look
        #[arg(long, default_value = "365")]
        horizon_days: i64,
    },
    /// Pause a schedule (keeps its cursor)
    Pause {
        /// Schedule ID
        id: String,
    },
    /// Resume a paused schedule, recomputing its cursor if lost
    Resume {
        /// Schedule ID
        id: String,
    },
    /// Delete a schedule and its exceptions
    Delete {
        /// Schedule ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ExceptionActions {
    /// List exceptions on a schedule
    List {
        /// Schedule ID
        #[arg(long)]
        schedule: String,
    },
    /// Add an exception covering a date range
    Add {
        /// Schedule ID
        #[arg(long)]
        schedule: String,
        /// What happens to matching occurrences
        #[arg(value_enum)]
        kind: ExceptionKindArg,
        /// First matching date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last matching date, inclusive (defaults to --from)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Replacement instant (RFC3339), required for reschedule
        #[arg(long)]
        reschedule_to: Option<DateTime<Utc>>,
        /// Rate limit override, for modify
        #[arg(long)]
        rate_limit: Option<u32>,
        /// Concurrency override, for modify
        #[arg(long)]
        max_concurrent: Option<u32>,
    },
    /// Delete an exception
    Delete {
        /// Exception ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// List executions, newest first
    List {
        /// Filter by automation
        #[arg(long)]
        automation: Option<String>,
        /// Filter by status: pending|running|completed|failed|cancelled
        #[arg(long)]
        status: Option<String>,
        /// Page size
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one execution with its per-recipient outcomes
    Show {
        /// Execution ID
        id: String,
    },
    /// Cancel an execution that has not started dispatching yet
    Cancel {
        /// Execution ID
        id: String,
    },
}

/// Exception kind flag.
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ExceptionKindArg {
    /// Suppress matching occurrences entirely
    Skip,
    /// Move matching occurrences to --reschedule-to
    Reschedule,
    /// Fire on time with overridden dispatch settings
    Modify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "flowcast=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve().await?,
        Commands::Flow { action } => match action {
            FlowActions::List { org } => cmd_flow_list(org.as_deref()).await?,
            FlowActions::Create { file } => cmd_flow_create(&file).await?,
            FlowActions::Validate { file } => cmd_flow_validate(&file)?,
            FlowActions::Show { id } => cmd_flow_show(&id).await?,
            FlowActions::Enable { id } => cmd_flow_set_enabled(&id, true).await?,
            FlowActions::Disable { id } => cmd_flow_set_enabled(&id, false).await?,
            FlowActions::Delete { id } => cmd_flow_delete(&id).await?,
        },
        Commands::Automation { action } => match action {
            AutomationActions::List { org } => cmd_automation_list(org.as_deref()).await?,
            AutomationActions::Create {
                name,
                org,
                flow,
                contacts,
                segment,
                rate_limit,
                max_concurrent,
                max_attempts,
            } => {
                cmd_automation_create(
                    &name,
                    &org,
                    &flow,
                    contacts,
                    segment,
                    rate_limit,
                    max_concurrent,
                    max_attempts,
                )
                .await?
            }
            AutomationActions::Trigger { id } => cmd_automation_trigger(&id).await?,
            AutomationActions::Enable { id } => cmd_automation_set_enabled(&id, true).await?,
            AutomationActions::Disable { id } => cmd_automation_set_enabled(&id, false).await?,
        },
        Commands::Schedule { action } => match action {
            ScheduleActions::List { automation } => {
                cmd_schedule_list(automation.as_deref()).await?
            }
            ScheduleActions::Create { automation, file } => {
                cmd_schedule_create(&automation, &file).await?
            }
            ScheduleActions::Preview {
                id,
                count,
                horizon_days,
            } => cmd_schedule_preview(&id, count, horizon_days).await?,
            ScheduleActions::Pause { id } => cmd_schedule_pause(&id).await?,
            ScheduleActions::Resume { id } => cmd_schedule_resume(&id).await?,
            ScheduleActions::Delete { id } => cmd_schedule_delete(&id).await?,
        },
        Commands::Exception { action } => match action {
            ExceptionActions::List { schedule } => cmd_exception_list(&schedule).await?,
            ExceptionActions::Add {
                schedule,
                kind,
                from,
                to,
                reschedule_to,
                rate_limit,
                max_concurrent,
            } => {
                cmd_exception_add(
                    &schedule,
                    kind,
                    from,
                    to,
                    reschedule_to,
                    rate_limit,
                    max_concurrent,
                )
                .await?
            }
            ExceptionActions::Delete { id } => cmd_exception_delete(&id).await?,
        },
        Commands::Inbound {
            flow,
            subject,
            text,
            event_id,
        } => cmd_inbound(&flow, &subject, &text, event_id.as_deref()).await?,
        Commands::Executions { action } => match action {
            ExecutionActions::List {
                automation,
                status,
                limit,
            } => cmd_executions_list(automation.as_deref(), status.as_deref(), limit).await?,
            ExecutionActions::Show { id } => cmd_executions_show(&id).await?,
            ExecutionActions::Cancel { id } => cmd_executions_cancel(&id).await?,
        },
    }

    Ok(())
}

// ============================================================================
// Serve
// ============================================================================

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::load();
    flowcast::metrics::init_metrics(config.server.metrics_listen)?;

    let storage = get_storage()?;
    let gateway = Arc::new(LoggingGateway);

    let mut engine = FlowEngine::new(storage.clone(), gateway);
    if let Some(ttl) = config.engine.state_ttl() {
        engine = engine.with_state_ttl(ttl);
    }

    let dispatcher = Dispatcher::new(
        storage.clone(),
        engine.clone(),
        Arc::new(InlineAudienceResolver),
    );

    let holidays: Arc<dyn HolidayCalendar> = if config.schedule.holidays.is_empty() {
        Arc::new(NoHolidays)
    } else {
        Arc::new(FixedHolidayCalendar::new(config.schedule.holidays.clone()))
    };

    let mut runner = ScheduleRunner::new(storage, engine, dispatcher)
        .with_poll_interval(config.server.poll_interval_ms)
        .with_holidays(holidays);
    runner.start().await?;

    println!("flowcast serving (runner {})", runner.runner_id());
    if let Some(listen) = config.server.metrics_listen {
        println!("Metrics on http://{}/metrics", listen);
    }
    println!("Press Ctrl+C to stop.");

    let shutdown = ShutdownCoordinator::install();
    shutdown.wait_for_shutdown().await;

    runner.stop().await?;
    Ok(())
}

// ============================================================================
// Flow Commands
// ============================================================================

async fn cmd_flow_list(org: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let flows = storage.list_flows(org).await?;

    if flows.is_empty() {
        println!("No flows found.");
        println!();
        println!("Create one with: flowcast flow create <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<14} {:<8} {:<8}",
        "ID", "NAME", "ORG", "VERSION", "ENABLED"
    );
    println!("{}", "-".repeat(96));
    for flow in flows {
        println!(
            "{:<38} {:<24} {:<14} {:<8} {:<8}",
            flow.id,
            flow.name,
            flow.organization_id,
            flow.version,
            if flow.enabled { "yes" } else { "no" },
        );
    }

    Ok(())
}

async fn cmd_flow_create(file: &str) -> anyhow::Result<()> {
    use flowcast::flow::{parse_flow_file, validate_flow};
    use flowcast::nodes::NodeRegistry;
    use std::path::Path;

    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let definition = parse_flow_file(path)?;
    validate_flow(&definition, &NodeRegistry::new())?;

    let raw = std::fs::read_to_string(path)?;
    let storage = get_storage()?;
    let now = Utc::now();

    let saved = storage
        .save_flow(&FlowRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: definition.name.clone(),
            organization_id: definition.organization_id.clone(),
            definition: raw,
            version: 1,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
        .await?;

    println!("✓ Flow '{}' saved (version {})", saved.name, saved.version);
    println!();
    println!("  ID: {}", saved.id);
    println!("  Nodes: {}", definition.nodes.len());
    println!("  Types: {}", definition.node_types().join(", "));

    Ok(())
}

fn cmd_flow_validate(file: &str) -> anyhow::Result<()> {
    use flowcast::flow::{parse_flow_file, validate_flow};
    use flowcast::nodes::NodeRegistry;
    use std::path::Path;

    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let definition = parse_flow_file(path)?;
    validate_flow(&definition, &NodeRegistry::new())?;

    println!("✓ Flow '{}' is valid", definition.name);
    println!("  Nodes: {}", definition.nodes.len());
    Ok(())
}

async fn cmd_flow_show(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let flow = storage
        .get_flow(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", id))?;

    println!("Flow: {} (version {})", flow.name, flow.version);
    println!("Organization: {}", flow.organization_id);
    println!("Enabled: {}", flow.enabled);
    println!("Updated: {}", flow.updated_at.format("%Y-%m-%d %H:%M"));
    println!();
    println!("{}", flow.definition);
    Ok(())
}

async fn cmd_flow_set_enabled(id: &str, enabled: bool) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.set_flow_enabled(id, enabled).await?;
    println!("✓ Flow {} {}", id, if enabled { "enabled" } else { "disabled" });
    Ok(())
}

async fn cmd_flow_delete(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.delete_flow(id).await?;
    println!("✓ Flow {} deleted", id);
    Ok(())
}

// ============================================================================
// Automation Commands
// ============================================================================

async fn cmd_automation_list(org: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let automations = storage.list_automations(org).await?;

    if automations.is_empty() {
        println!("No automations found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<38} {:<8}", "ID", "NAME", "FLOW", "ENABLED");
    println!("{}", "-".repeat(110));
    for automation in automations {
        println!(
            "{:<38} {:<24} {:<38} {:<8}",
            automation.id,
            automation.name,
            automation.flow_id,
            if automation.enabled { "yes" } else { "no" },
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_automation_create(
    name: &str,
    org: &str,
    flow_id: &str,
    contacts: Vec<String>,
    segment: Option<String>,
    rate_limit: Option<u32>,
    max_concurrent: Option<u32>,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let storage = get_storage()?;
    if storage.get_flow(flow_id).await?.is_none() {
        anyhow::bail!("Flow not found: {}", flow_id);
    }

    let audience = match segment {
        Some(segment_id) => AudienceSpec::Segment { segment_id },
        None if contacts.is_empty() => {
            anyhow::bail!("An audience is required: --contact (repeatable) or --segment")
        }
        None => AudienceSpec::ContactList {
            contact_ids: contacts,
        },
    };

    let config = Config::load();
    let defaults = config.dispatch.settings();
    let settings = DispatchSettings {
        rate_limit_per_hour: rate_limit.unwrap_or(defaults.rate_limit_per_hour),
        max_concurrent: max_concurrent.unwrap_or(defaults.max_concurrent),
        retry: RetryPolicy {
            max_attempts: max_attempts.unwrap_or(defaults.retry.max_attempts),
            ..defaults.retry
        },
    };

    let now = Utc::now();
    let automation = Automation {
        id: uuid::Uuid::new_v4().to_string(),
        organization_id: org.to_string(),
        name: name.to_string(),
        flow_id: flow_id.to_string(),
        audience,
        settings,
        enabled: true,
        created_at: now,
        updated_at: now,
    };
    storage.save_automation(&automation).await?;

    println!("✓ Automation '{}' created", automation.name);
    println!();
    println!("  ID: {}", automation.id);
    println!(
        "  Rate: {}/h, {} concurrent, {} attempts",
        automation.settings.rate_limit_per_hour,
        automation.settings.max_concurrent,
        automation.settings.retry.max_attempts
    );
    println!();
    println!(
        "Trigger now with:  flowcast automation trigger {}",
        automation.id
    );
    println!(
        "Or schedule with:  flowcast schedule create --automation {} <file.yaml>",
        automation.id
    );

    Ok(())
}

async fn cmd_automation_trigger(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let engine = FlowEngine::new(storage.clone(), Arc::new(LoggingGateway));
    let dispatcher = Dispatcher::new(storage, engine, Arc::new(InlineAudienceResolver));

    println!("Dispatching automation {}...", id);
    let execution = dispatcher.trigger(id).await?;

    println!();
    println!("Execution ID: {}", execution.id);
    println!("Status: {}", execution.status);
    print_stats(&execution.stats);

    if let Some(error) = &execution.error {
        println!("Error: {}", error);
    }
    if let Some(finished) = execution.finished_at {
        let duration = finished - execution.started_at;
        println!("Duration: {}ms", duration.num_milliseconds());
    }

    Ok(())
}

async fn cmd_automation_set_enabled(id: &str, enabled: bool) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.set_automation_enabled(id, enabled).await?;
    println!(
        "✓ Automation {} {}",
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

// ============================================================================
// Schedule Commands
// ============================================================================

async fn cmd_schedule_list(automation: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let schedules = storage.list_schedules(automation).await?;

    if schedules.is_empty() {
        println!("No schedules found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<38} {:<8} {:<8} {:<22}",
        "ID", "AUTOMATION", "PAUSED", "FIRED", "NEXT"
    );
    println!("{}", "-".repeat(116));
    for schedule in schedules {
        println!(
            "{:<38} {:<38} {:<8} {:<8} {:<22}",
            schedule.id,
            schedule.automation_id,
            if schedule.is_paused { "yes" } else { "no" },
            schedule.execution_count,
            schedule
                .next_scheduled_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}

/// Schedule fields as authored in a file; identity and cursor state are
/// filled in at creation.
#[derive(serde::Deserialize)]
struct ScheduleFile {
    recurrence: Recurrence,
    start_date: NaiveDate,
    window: flowcast::schedule::ScheduleWindow,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    blackout_dates: Vec<NaiveDate>,
    #[serde(default)]
    skip_weekends: bool,
    #[serde(default)]
    skip_holidays: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

async fn cmd_schedule_create(automation_id: &str, file: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    if storage.get_automation(automation_id).await?.is_none() {
        anyhow::bail!("Automation not found: {}", automation_id);
    }

    let content = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file, e))?;
    let spec: ScheduleFile = if content.trim_start().starts_with('{') {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };

    let mut schedule = Schedule {
        id: uuid::Uuid::new_v4().to_string(),
        automation_id: automation_id.to_string(),
        recurrence: spec.recurrence,
        start_date: spec.start_date,
        window: spec.window,
        timezone: spec.timezone,
        blackout_dates: spec.blackout_dates,
        skip_weekends: spec.skip_weekends,
        skip_holidays: spec.skip_holidays,
        is_paused: false,
        next_scheduled_at: None,
        last_executed_at: None,
        execution_count: 0,
    };
    schedule.validate()?;
    schedule.next_scheduled_at = compute_next(&schedule, Utc::now(), &config_holidays())?;
    storage.save_schedule(&schedule).await?;

    println!("✓ Schedule {} created", schedule.id);
    match schedule.next_scheduled_at {
        Some(next) => println!("  First occurrence: {}", next.format("%Y-%m-%d %H:%M UTC")),
        None => println!("  No upcoming occurrence (recurrence exhausted)"),
    }

    Ok(())
}

async fn cmd_schedule_preview(id: &str, count: usize, horizon_days: i64) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let schedule = storage
        .get_schedule(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Schedule not found: {}", id))?;
    let exceptions = storage.list_exceptions(id).await?;

    let occurrences = preview(
        &schedule,
        &exceptions,
        Utc::now(),
        count,
        horizon_days,
        &config_holidays(),
    )?;

    if occurrences.is_empty() {
        println!("No occurrences within {} days.", horizon_days);
        return Ok(());
    }

    let tz = schedule.tz()?;
    println!(
        "Next {} occurrences ({}):",
        occurrences.len(),
        schedule.timezone
    );
    for occurrence in occurrences {
        println!(
            "  {}",
            occurrence.with_timezone(&tz).format("%Y-%m-%d %H:%M %a")
        );
    }

    Ok(())
}

async fn cmd_schedule_pause(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.set_schedule_paused(id, true).await?;
    println!("✓ Schedule {} paused", id);
    Ok(())
}

async fn cmd_schedule_resume(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let schedule = storage
        .get_schedule(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Schedule not found: {}", id))?;

    storage.set_schedule_paused(id, false).await?;

    // A parked schedule has no cursor; recompute it so the poller picks
    // the schedule up again.
    if schedule.next_scheduled_at.is_none() {
        let next = compute_next(&schedule, Utc::now(), &config_holidays())?;
        storage.set_schedule_next(id, next).await?;
        match next {
            Some(next) => println!(
                "✓ Schedule {} resumed, next occurrence {}",
                id,
                next.format("%Y-%m-%d %H:%M UTC")
            ),
            None => println!(
                "✓ Schedule {} resumed, but its recurrence is exhausted",
                id
            ),
        }
    } else {
        println!("✓ Schedule {} resumed", id);
    }

    Ok(())
}

async fn cmd_schedule_delete(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.delete_schedule(id).await?;
    println!("✓ Schedule {} deleted", id);
    Ok(())
}

// ============================================================================
// Exception Commands
// ============================================================================

async fn cmd_exception_list(schedule_id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let exceptions = storage.list_exceptions(schedule_id).await?;

    if exceptions.is_empty() {
        println!("No exceptions on schedule {}.", schedule_id);
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<12} {:<12} {:<22}",
        "ID", "KIND", "FROM", "TO", "DETAIL"
    );
    println!("{}", "-".repeat(98));
    for exception in exceptions {
        let detail = match exception.kind {
            flowcast::schedule::ExceptionKind::Skip => String::new(),
            flowcast::schedule::ExceptionKind::Reschedule => exception
                .reschedule_to
                .map(|t| t.format("→ %Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default(),
            flowcast::schedule::ExceptionKind::Modify => exception
                .modified_config
                .as_ref()
                .map(|c| {
                    format!(
                        "rate={} conc={}",
                        c.rate_limit_per_hour
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".into()),
                        c.max_concurrent
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".into()),
                    )
                })
                .unwrap_or_default(),
        };
        println!(
            "{:<38} {:<12} {:<12} {:<12} {:<22}",
            exception.id,
            format!("{:?}", exception.kind).to_lowercase(),
            exception.start_date,
            exception.end_date,
            detail,
        );
    }

    Ok(())
}

async fn cmd_exception_add(
    schedule_id: &str,
    kind: ExceptionKindArg,
    from: NaiveDate,
    to: Option<NaiveDate>,
    reschedule_to: Option<DateTime<Utc>>,
    rate_limit: Option<u32>,
    max_concurrent: Option<u32>,
) -> anyhow::Result<()> {
    use flowcast::schedule::{ExceptionKind, ScheduleException};

    let storage = get_storage()?;
    if storage.get_schedule(schedule_id).await?.is_none() {
        anyhow::bail!("Schedule not found: {}", schedule_id);
    }

    let end_date = to.unwrap_or(from);
    if end_date < from {
        anyhow::bail!("--to must not be before --from");
    }

    let kind = match kind {
        ExceptionKindArg::Skip => ExceptionKind::Skip,
        ExceptionKindArg::Reschedule => {
            if reschedule_to.is_none() {
                anyhow::bail!("--reschedule-to is required for reschedule");
            }
            ExceptionKind::Reschedule
        }
        ExceptionKindArg::Modify => {
            if rate_limit.is_none() && max_concurrent.is_none() {
                anyhow::bail!("modify needs --rate-limit and/or --max-concurrent");
            }
            ExceptionKind::Modify
        }
    };

    let exception = ScheduleException {
        id: uuid::Uuid::new_v4().to_string(),
        schedule_id: schedule_id.to_string(),
        kind,
        start_date: from,
        end_date,
        reschedule_to: (kind == ExceptionKind::Reschedule)
            .then_some(reschedule_to)
            .flatten(),
        modified_config: (kind == ExceptionKind::Modify).then_some(DispatchOverrides {
            rate_limit_per_hour: rate_limit,
            max_concurrent,
        }),
    };

    storage.save_exception(&exception).await?;
    println!("✓ Exception {} added", exception.id);
    Ok(())
}

async fn cmd_exception_delete(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.delete_exception(id).await?;
    println!("✓ Exception {} deleted", id);
    Ok(())
}

// ============================================================================
// Inbound / Executions
// ============================================================================

async fn cmd_inbound(
    flow_id: &str,
    subject_id: &str,
    text: &str,
    event_id: Option<&str>,
) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let config = Config::load();
    let mut engine = FlowEngine::new(storage, Arc::new(LoggingGateway));
    if let Some(ttl) = config.engine.state_ttl() {
        engine = engine.with_state_ttl(ttl);
    }

    let event = InboundEvent {
        event_id: event_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        flow_id: flow_id.to_string(),
        subject_id: subject_id.to_string(),
        text: text.to_string(),
    };
    let turn = engine.handle_inbound(&event).await?;

    for message in &turn.outbound {
        println!("← {}", message.text);
    }
    if turn.suspended {
        println!("(awaiting input)");
    } else {
        println!("(conversation finished)");
    }

    Ok(())
}

async fn cmd_executions_list(
    automation: Option<&str>,
    status: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let status = status
        .map(|s| s.parse::<ExecutionStatus>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;

    let executions = storage
        .query_executions(&ExecutionQuery {
            automation_id: automation.map(str::to_string),
            status,
            limit,
            offset: 0,
        })
        .await?;

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<8} {:<8} {:<8} {:<18}",
        "ID", "STATUS", "TOTAL", "SENT", "FAILED", "STARTED"
    );
    println!("{}", "-".repeat(94));
    for execution in executions {
        println!(
            "{:<38} {:<12} {:<8} {:<8} {:<8} {:<18}",
            execution.id,
            execution.status,
            execution.stats.total,
            execution.stats.sent,
            execution.stats.failed,
            execution.started_at.format("%Y-%m-%d %H:%M"),
        );
    }

    Ok(())
}

async fn cmd_executions_show(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let execution = storage
        .get_execution(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", id))?;

    println!("Execution: {}", execution.id);
    println!("Automation: {}", execution.automation_id);
    println!("Status: {}", execution.status);
    if let Some(scheduled) = execution.scheduled_for {
        println!("Scheduled for: {}", scheduled.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(error) = &execution.error {
        println!("Error: {}", error);
    }
    print_stats(&execution.stats);

    let recipients = storage.list_recipients(id).await?;
    if recipients.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:<24} {:<12} {:<8} {:<30}",
        "SUBJECT", "STATUS", "RETRIES", "LAST ERROR"
    );
    println!("{}", "-".repeat(76));
    for recipient in recipients {
        println!(
            "{:<24} {:<12} {:<8} {:<30}",
            recipient.subject_id,
            recipient.status,
            recipient.retry_count,
            recipient.last_error.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

async fn cmd_executions_cancel(id: &str) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let mut execution = storage
        .get_execution(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", id))?;

    match execution.status {
        ExecutionStatus::Pending => {
            // The guarded pending->running flip means a poller racing this
            // cancel loses: once claimed here, it cannot claim the row.
            if !storage.claim_execution(id).await? {
                anyhow::bail!(
                    "Execution {} just started dispatching in the serve process",
                    id
                );
            }
            execution.status = ExecutionStatus::Cancelled;
            execution.error = Some("cancelled before dispatch".to_string());
            execution.finished_at = Some(Utc::now());
            storage.save_execution(&execution).await?;
            println!("✓ Execution {} cancelled", id);
        }
        ExecutionStatus::Running => {
            anyhow::bail!(
                "Execution {} is dispatching; in-flight recipients run to their own terminal state",
                id
            )
        }
        status => anyhow::bail!("Execution {} already finished ({})", id, status),
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn print_stats(stats: &flowcast::storage::ExecutionStats) {
    println!(
        "Stats: total={} sent={} delivered={} read={} completed={} failed={}",
        stats.total, stats.sent, stats.delivered, stats.read, stats.completed, stats.failed
    );
}

/// Holiday calendar from config, consulted by schedules that set
/// `skip_holidays`.
fn config_holidays() -> FixedHolidayCalendar {
    FixedHolidayCalendar::new(Config::load().schedule.holidays)
}

fn get_storage() -> anyhow::Result<SqliteStorage> {
    let config = Config::load();
    let db_path = config.storage.effective_database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&db_path)?)
}
