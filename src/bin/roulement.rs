#![forbid(unsafe_code)]
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use roulement::{
    io,
    model::{
        AssignmentId, EmployeeId, OrganizationId, RosterId, RotationPattern, ShiftId, UserId,
    },
    notification::{JsonLinesNotifier, LogNotifier, Notifier},
    scheduler::{Rotation, RosterDraft, Scheduler, ShiftSpec},
    storage::JsonStorage,
    Caller, Capability, EngineConfig, SwapDatePolicy, UnderstaffedPolicy,
};
use std::sync::Arc;
#[cfg(feature = "logging")]
use tracing_subscriber::{fmt::Subscriber, EnvFilter};

/// CLI du moteur de planification, sur un registre JSON local
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Active les logs (feature `logging`)
    #[arg(long, global = true)]
    log: bool,

    /// Fichier JSON du registre
    #[arg(long, global = true, default_value = "registry.json")]
    registry: String,

    /// Événements vers les logs plutôt qu'en JSON sur stdout
    #[arg(long, global = true)]
    events_to_log: bool,

    /// Fichier JSON de configuration du moteur
    #[arg(long, global = true)]
    config: Option<String>,

    /// Autorise les échanges entre dates différentes
    #[arg(long, global = true)]
    any_date_swaps: bool,

    /// Annule une rotation incomplète au lieu de la conserver
    #[arg(long, global = true)]
    abort_understaffed: bool,

    /// Utilisateur appelant
    #[arg(long = "as-user", global = true, default_value = "cli")]
    user: String,

    /// Salarié appelant (opérations sur ses propres affectations)
    #[arg(long = "as-employee", global = true)]
    employee: Option<String>,

    /// Capacités de l'appelant : "scheduler-admin,scheduler,approver"
    #[arg(long = "cap", global = true, value_delimiter = ',')]
    capabilities: Vec<Capability>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Créer un modèle de poste
    CreateShift {
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
        /// HH:MM
        #[arg(long, value_parser = parse_hhmm)]
        start: NaiveTime,
        /// HH:MM (peut passer minuit)
        #[arg(long, value_parser = parse_hhmm)]
        end: NaiveTime,
        #[arg(long, default_value_t = 0)]
        break_minutes: u32,
        /// jours 0-6 (0 = dimanche), ex. "1,2,3,4,5"
        #[arg(long, value_delimiter = ',')]
        days: Vec<u8>,
        #[arg(long, default_value_t = 1)]
        min_staff: u32,
        #[arg(long)]
        max_staff: Option<u32>,
        #[arg(long)]
        overtime: bool,
    },

    /// Importer des modèles de poste depuis un CSV
    ImportShifts {
        #[arg(long)]
        org: String,
        #[arg(long)]
        csv: String,
    },

    /// Lister les modèles d'une organisation
    Shifts {
        #[arg(long)]
        org: String,
        /// inclure les modèles désactivés
        #[arg(long)]
        all: bool,
    },

    /// Retirer un modèle du catalogue
    DeactivateShift {
        #[arg(long)]
        id: String,
    },

    /// Ouvrir un planning en brouillon
    CreateRoster {
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
        /// YYYY-MM-DD
        #[arg(long)]
        start: NaiveDate,
        /// YYYY-MM-DD
        #[arg(long)]
        end: NaiveDate,
        /// weekly | biweekly | monthly
        #[arg(long)]
        pattern: Option<RotationPattern>,
    },

    /// Affecter un salarié à un poste
    Assign {
        #[arg(long)]
        employee: String,
        #[arg(long)]
        shift: String,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        roster: Option<String>,
    },

    /// Confirmer une affectation (salarié)
    Confirm {
        #[arg(long)]
        id: String,
    },

    /// Refuser une affectation (salarié)
    Decline {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Annuler une affectation (valideur)
    Cancel {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Saisir les heures réellement travaillées (RFC3339 UTC)
    RecordTime {
        #[arg(long)]
        id: String,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long, default_value_t = 0)]
        break_minutes: u32,
    },

    /// Proposer un échange à un collègue
    RequestSwap {
        #[arg(long)]
        id: String,
        #[arg(long)]
        with: String,
        /// affectation visée chez le collègue (sinon celle du même jour)
        #[arg(long)]
        counterpart: Option<String>,
    },

    /// Trancher un échange (valideur)
    ResolveSwap {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Refuser un échange proposé (salarié sollicité)
    DeclineSwap {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Retirer sa demande d'échange
    WithdrawSwap {
        #[arg(long)]
        id: String,
    },

    /// Soumettre un planning à validation
    Submit {
        #[arg(long)]
        roster: String,
    },

    /// Valider un planning
    Approve {
        #[arg(long)]
        roster: String,
    },

    /// Publier un planning validé
    Publish {
        #[arg(long)]
        roster: String,
    },

    /// Archiver un planning
    Archive {
        #[arg(long)]
        roster: String,
    },

    /// Générer une rotation sur la période du planning
    Rotate {
        #[arg(long)]
        roster: String,
        /// liste "emp1,emp2,..."
        #[arg(long, value_delimiter = ',', required = true)]
        candidates: Vec<String>,
        /// motif explicite (sinon celui du planning)
        #[arg(long)]
        pattern: Option<RotationPattern>,
    },

    /// Émettre les rappels dus (par défaut aujourd'hui)
    Reminders {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Lister les affectations et optionnellement exporter
    List {
        #[arg(long)]
        roster: Option<String>,
        #[arg(long)]
        employee: Option<String>,
        #[arg(long)]
        out_json: Option<String>,
        #[arg(long)]
        out_csv: Option<String>,
    },
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if cli.any_date_swaps {
        config.swap_policy = SwapDatePolicy::AnyDate;
    }
    if cli.abort_understaffed {
        config.understaffed = UnderstaffedPolicy::Abort;
    }
    Ok(config)
}

fn caller(cli: &Cli) -> Caller {
    let mut caller = match &cli.employee {
        Some(e) => {
            let mut c = Caller::employee(&EmployeeId::new(e));
            c.user = UserId::new(&cli.user);
            c
        }
        None => Caller::new(&cli.user),
    };
    for cap in &cli.capabilities {
        caller = caller.with_capability(*cap);
    }
    caller
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "logging")]
    if cli.log {
        let _ = Subscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }

    let config = load_config(&cli)?;
    let storage = JsonStorage::open(&cli.registry)?;
    let notifier: Arc<dyn Notifier> = if cli.events_to_log {
        Arc::new(LogNotifier)
    } else {
        Arc::new(JsonLinesNotifier::stdout())
    };
    let scheduler = Scheduler::open(config, Box::new(storage))
        .with_context(|| format!("loading registry {}", cli.registry))?
        .with_notifier(notifier);
    let who = caller(&cli);

    let code = match cli.cmd {
        Commands::CreateShift {
            org,
            name,
            start,
            end,
            break_minutes,
            days,
            min_staff,
            max_staff,
            overtime,
        } => {
            let mut spec = ShiftSpec::new(OrganizationId::new(org), name, start, end);
            spec.break_minutes = break_minutes;
            if !days.is_empty() {
                spec.applicable_days = days;
            }
            spec.minimum_staff = min_staff;
            spec.maximum_staff = max_staff;
            spec.overtime_allowed = overtime;
            let id = scheduler.create_shift(&who, spec)?;
            println!("{id}");
            0
        }
        Commands::ImportShifts { org, csv } => {
            let specs = io::import_shifts_csv(&csv, &OrganizationId::new(org))?;
            for spec in specs {
                let name = spec.name.clone();
                let id = scheduler
                    .create_shift(&who, spec)
                    .with_context(|| format!("importing shift {name}"))?;
                println!("{id} | {name}");
            }
            0
        }
        Commands::Shifts { org, all } => {
            for s in scheduler.list_shifts(&OrganizationId::new(org), all) {
                println!(
                    "{} | {} | {} → {} | staff {}..{} | {}",
                    s.id,
                    s.name,
                    s.start_time.format("%H:%M"),
                    s.end_time.format("%H:%M"),
                    s.minimum_staff,
                    s.maximum_staff.map(|m| m.to_string()).unwrap_or_default(),
                    if s.active { "active" } else { "inactive" }
                );
            }
            0
        }
        Commands::DeactivateShift { id } => {
            scheduler.deactivate_shift(&who, &ShiftId::new(id))?;
            0
        }
        Commands::CreateRoster {
            org,
            name,
            start,
            end,
            pattern,
        } => {
            let mut draft = RosterDraft::new(OrganizationId::new(org), name, start, end);
            draft.rotation_pattern = pattern;
            let roster = scheduler.create_roster(&who, draft)?;
            println!("{}", roster.id);
            0
        }
        Commands::Assign {
            employee,
            shift,
            date,
            roster,
        } => {
            let roster = roster.map(RosterId::new);
            let a = scheduler.create_assignment(
                &who,
                &EmployeeId::new(employee),
                &ShiftId::new(shift),
                date,
                roster.as_ref(),
            )?;
            println!("{}", a.id);
            0
        }
        Commands::Confirm { id } => {
            scheduler.confirm(&who, &AssignmentId::new(id))?;
            0
        }
        Commands::Decline { id, reason } => {
            scheduler.decline(&who, &AssignmentId::new(id), reason.as_deref())?;
            0
        }
        Commands::Cancel { id, reason } => {
            scheduler.cancel(&who, &AssignmentId::new(id), reason.as_deref())?;
            0
        }
        Commands::RecordTime {
            id,
            start,
            end,
            break_minutes,
        } => {
            let a = scheduler.record_actual_time(&who, &AssignmentId::new(id), start, end, break_minutes)?;
            println!("overtime: {} min", a.overtime_minutes);
            0
        }
        Commands::RequestSwap {
            id,
            with,
            counterpart,
        } => {
            let counterpart = counterpart.map(AssignmentId::new);
            scheduler.request_swap(
                &who,
                &AssignmentId::new(id),
                &EmployeeId::new(with),
                counterpart.as_ref(),
            )?;
            0
        }
        Commands::ResolveSwap { id, reject, reason } => {
            scheduler.resolve_swap(&who, &AssignmentId::new(id), !reject, reason.as_deref())?;
            0
        }
        Commands::DeclineSwap { id, reason } => {
            scheduler.decline_swap(&who, &AssignmentId::new(id), reason.as_deref())?;
            0
        }
        Commands::WithdrawSwap { id } => {
            scheduler.withdraw_swap(&who, &AssignmentId::new(id))?;
            0
        }
        Commands::Submit { roster } => {
            scheduler.submit_for_approval(&who, &RosterId::new(roster))?;
            0
        }
        Commands::Approve { roster } => {
            scheduler.approve(&who, &RosterId::new(roster))?;
            0
        }
        Commands::Publish { roster } => {
            scheduler.publish(&who, &RosterId::new(roster))?;
            0
        }
        Commands::Archive { roster } => {
            scheduler.archive(&who, &RosterId::new(roster))?;
            0
        }
        Commands::Rotate {
            roster,
            candidates,
            pattern,
        } => {
            let roster = RosterId::new(roster);
            let candidates: Vec<EmployeeId> = candidates
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .map(EmployeeId::new)
                .collect();
            if candidates.is_empty() {
                bail!("no candidate given");
            }
            let summary = match pattern {
                Some(pattern) => {
                    let rotation = Rotation::from_pattern(pattern)
                        .context("custom rotations are only available through the library")?;
                    scheduler.generate_rotation(&who, &roster, rotation, &candidates)?
                }
                None => scheduler.generate_roster_rotation(&who, &roster, &candidates)?,
            };
            eprintln!("{summary}");
            for slot in &summary.understaffed {
                eprintln!("understaffed: {slot}");
            }
            // Code 2 = WARNING/INCOMPLETE
            if summary.is_fully_staffed() {
                0
            } else {
                2
            }
        }
        Commands::Reminders { date } => {
            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            scheduler.due_reminders(today);
            0
        }
        Commands::List {
            roster,
            employee,
            out_json,
            out_csv,
        } => {
            let registry = scheduler.snapshot();
            let rows = match (roster, employee) {
                (Some(r), _) => scheduler.assignments_for_roster(&RosterId::new(r)),
                (None, Some(e)) => scheduler.assignments_for(&EmployeeId::new(e)),
                (None, None) => registry.assignments.clone(),
            };
            if let Some(path) = out_json {
                io::export_registry_json(path, &registry)?;
            }
            if let Some(path) = out_csv {
                io::export_assignments_csv(path, &registry, &rows)?;
            }
            // impression compacte
            for a in &rows {
                let shift = registry
                    .find_shift(&a.shift)
                    .map(|s| s.name.as_str())
                    .unwrap_or("-");
                println!("{} | {} | {} | {} | {}", a.id, a.date, shift, a.employee, a.status);
            }
            0
        }
    };

    std::process::exit(code);
}
