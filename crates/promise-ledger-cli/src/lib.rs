//! Command surface for the promise ledger.
//!
//! Embedders can use [`run_cli`] for full parsed execution or
//! [`run_command`] to execute one command against an already-open store
//! with their own sync channel and clock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use promise_ledger_core::{
    forecast_day, forecast_month, forecast_week, format_iso_date, parse_iso_date, Agreement,
    AgreementStatus, ClientDirectory, Clock, ForecastDay, ForecastRange, ForecastSource, Frequency,
    MonthForecast, NullSync, PromiseBook, PromiseInput, PromiseStatus, SyncChannel, SyncEvent,
    SystemClock,
};
use promise_ledger_store_sqlite::SqlitePromiseStore;
use rust_decimal::Decimal;
use time::Date;

#[derive(Debug, Parser)]
#[command(name = "pl")]
#[command(about = "Payment promise ledger and collection forecast CLI")]
pub struct Cli {
    #[arg(long, default_value = "./promise_ledger.sqlite3")]
    db: PathBuf,

    /// Append sync events as JSON lines to this file (best effort).
    #[arg(long)]
    sync_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Promise {
        #[command(subcommand)]
        command: Box<PromiseCommand>,
    },
    Agreement {
        #[command(subcommand)]
        command: Box<AgreementCommand>,
    },
    Client {
        #[command(subcommand)]
        command: Box<ClientCommand>,
    },
    Forecast {
        #[command(subcommand)]
        command: Box<ForecastCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PromiseCommand {
    Add(PromiseAddArgs),
    List(PromiseListArgs),
    Fulfill(PromiseIndexArgs),
    Break(PromiseIndexArgs),
    Sweep(SweepArgs),
}

#[derive(Debug, Args)]
pub struct PromiseAddArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    due: String,
    #[arg(long)]
    amount: Decimal,
    #[arg(long)]
    note: Option<String>,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct PromiseListArgs {
    #[arg(long)]
    client: String,
}

#[derive(Debug, Args)]
pub struct PromiseIndexArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    index: usize,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Override the reference date (defaults to today).
    #[arg(long)]
    today: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum AgreementCommand {
    Add(AgreementAddArgs),
    Close(AgreementCloseArgs),
    List(JsonArgs),
}

#[derive(Debug, Args)]
pub struct AgreementAddArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    start: String,
    #[arg(long)]
    frequency: FrequencyArg,
    #[arg(long)]
    amount: Decimal,
    #[arg(long)]
    installments: u32,
}

#[derive(Debug, Args)]
pub struct AgreementCloseArgs {
    #[arg(long)]
    client: String,
}

#[derive(Debug, Subcommand)]
pub enum ClientCommand {
    Add(ClientAddArgs),
    List(JsonArgs),
}

#[derive(Debug, Args)]
pub struct ClientAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    balance: Decimal,
    #[arg(long, default_value_t = 0)]
    overdue_days: i64,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ForecastCommand {
    Day(ForecastArgs),
    Week(ForecastArgs),
    Month(ForecastArgs),
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    /// Reference date (defaults to today).
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FrequencyArg {
    Weekly,
    Biweekly,
}

impl FrequencyArg {
    fn into_frequency(self) -> Frequency {
        match self {
            Self::Weekly => Frequency::Weekly,
            Self::Biweekly => Frequency::Biweekly,
        }
    }
}

/// Best-effort JSON-lines sync channel. Appends happen on a background
/// thread so the mutation path never waits on the log, and a failed append
/// never rolls back the local mutation. Pending appends are joined when the
/// channel drops: events accepted before exit reach the file.
pub struct FileSync {
    path: PathBuf,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl FileSync {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl SyncChannel for FileSync {
    fn notify(&self, event: &SyncEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                log::warn!("failed to encode sync event: {err}");
                return;
            }
        };

        let path = self.path.clone();
        let handle = std::thread::spawn(move || {
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| writeln!(file, "{line}"));
            if let Err(err) = result {
                log::warn!("sync append to {} failed: {err}", path.display());
            }
        });

        match self.pending.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

impl Drop for FileSync {
    fn drop(&mut self) {
        let handles = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqlitePromiseStore::open(&cli.db)?;
    store.migrate()?;
    let clock = SystemClock;

    match cli.sync_log {
        Some(path) => {
            let sync = FileSync::new(path);
            run_command(cli.command, &store, &sync, &clock)
        }
        None => run_command(cli.command, &store, &NullSync, &clock),
    }
}

/// Executes one command against an open store.
///
/// # Errors
/// Returns an error when validation, persistence, or the requested
/// operation fails.
pub fn run_command(
    command: Command,
    store: &SqlitePromiseStore,
    sync: &dyn SyncChannel,
    clock: &dyn Clock,
) -> Result<()> {
    match command {
        Command::Promise { command } => run_promise(*command, store, sync, clock),
        Command::Agreement { command } => run_agreement(*command, store),
        Command::Client { command } => run_client(*command, store),
        Command::Forecast { command } => run_forecast(*command, store, sync, clock),
    }
}

fn run_promise(
    command: PromiseCommand,
    store: &SqlitePromiseStore,
    sync: &dyn SyncChannel,
    clock: &dyn Clock,
) -> Result<()> {
    match command {
        PromiseCommand::Add(args) => {
            let due = parse_iso_date(&args.due)?;
            let mut book = PromiseBook::open(store, sync, clock)?;
            let promise = book.add(
                &args.client,
                PromiseInput {
                    due_date: Some(due),
                    amount: args.amount,
                    note: args.note,
                    recorded_by: args.actor,
                },
            )?;

            // The store accepts over-balance promises; warning is on us.
            if let Some(profile) = store.resolve(&args.client) {
                if promise.amount > profile.balance {
                    eprintln!(
                        "warning: promised amount {} exceeds known balance {} for {}",
                        promise.amount, profile.balance, profile.display_name
                    );
                }
            }

            println!("{}", serde_json::to_string_pretty(&promise)?);
            Ok(())
        }
        PromiseCommand::List(args) => {
            let book = PromiseBook::open(store, sync, clock)?;
            println!("{}", serde_json::to_string_pretty(book.list_for(&args.client))?);
            Ok(())
        }
        PromiseCommand::Fulfill(args) => {
            let mut book = PromiseBook::open(store, sync, clock)?;
            let updated = book.transition(&args.client, args.index, PromiseStatus::Fulfilled)?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
            Ok(())
        }
        PromiseCommand::Break(args) => {
            let mut book = PromiseBook::open(store, sync, clock)?;
            let updated = book.transition(&args.client, args.index, PromiseStatus::Broken)?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
            Ok(())
        }
        PromiseCommand::Sweep(args) => {
            let today = effective_date(args.today.as_deref(), clock)?;
            let mut book = PromiseBook::open(store, sync, clock)?;
            let swept = book.sweep_expired(today);
            println!("swept {swept} expired promises as of {}", format_iso_date(today));
            Ok(())
        }
    }
}

fn run_agreement(command: AgreementCommand, store: &SqlitePromiseStore) -> Result<()> {
    match command {
        AgreementCommand::Add(args) => {
            let agreement = Agreement {
                client_id: args.client,
                start_date: parse_iso_date(&args.start)?,
                frequency: args.frequency.into_frequency(),
                installment_amount: args.amount,
                total_installments: args.installments,
                status: AgreementStatus::Active,
            };
            store.upsert_agreement(&agreement)?;
            println!("{}", serde_json::to_string_pretty(&agreement)?);
            Ok(())
        }
        AgreementCommand::Close(args) => {
            if store.close_agreement(&args.client)? {
                println!("agreement for {} closed", args.client);
            } else {
                println!("no agreement found for {}", args.client);
            }
            Ok(())
        }
        AgreementCommand::List(args) => {
            let agreements = store.list_agreements()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&agreements)?);
            } else {
                for agreement in &agreements {
                    println!(
                        "{}  {}  {} x{}  since {}  [{}]",
                        agreement.client_id,
                        agreement.frequency.as_str(),
                        agreement.installment_amount,
                        agreement.total_installments,
                        format_iso_date(agreement.start_date),
                        agreement.status.as_str()
                    );
                }
            }
            Ok(())
        }
    }
}

fn run_client(command: ClientCommand, store: &SqlitePromiseStore) -> Result<()> {
    match command {
        ClientCommand::Add(args) => {
            let profile = promise_ledger_core::ClientProfile {
                display_name: args.name,
                balance: args.balance,
                overdue_days: args.overdue_days,
            };
            store.upsert_client(&args.id, &profile)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        ClientCommand::List(args) => {
            let clients = store.list_clients()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&clients)?);
            } else {
                for (client_id, profile) in &clients {
                    println!(
                        "{}  {}  balance {}  overdue {}d",
                        client_id, profile.display_name, profile.balance, profile.overdue_days
                    );
                }
            }
            Ok(())
        }
    }
}

fn run_forecast(
    command: ForecastCommand,
    store: &SqlitePromiseStore,
    sync: &dyn SyncChannel,
    clock: &dyn Clock,
) -> Result<()> {
    let (args, view) = match &command {
        ForecastCommand::Day(args) => (args, ForecastView::Day),
        ForecastCommand::Week(args) => (args, ForecastView::Week),
        ForecastCommand::Month(args) => (args, ForecastView::Month),
    };

    let reference = effective_date(args.date.as_deref(), clock)?;
    let mut book = PromiseBook::open(store, sync, clock)?;
    // Expired pendings must never show up as still due; sweep first.
    let _ = book.sweep_expired(reference);
    let agreements = store.list_agreements()?;

    match view {
        ForecastView::Day => {
            let day = forecast_day(&book, &agreements, store, reference);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&day)?);
            } else {
                print_day(&day, &book);
            }
        }
        ForecastView::Week => {
            let week = forecast_week(&book, &agreements, store, reference);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&week)?);
            } else {
                print_range(&week);
            }
        }
        ForecastView::Month => {
            let month = forecast_month(&book, &agreements, store, reference);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&month)?);
            } else {
                print_month(&month);
            }
        }
    }

    Ok(())
}

enum ForecastView {
    Day,
    Week,
    Month,
}

fn effective_date(raw: Option<&str>, clock: &dyn Clock) -> Result<Date> {
    match raw {
        Some(value) => Ok(parse_iso_date(value)?),
        None => Ok(clock.today()),
    }
}

fn print_day(day: &ForecastDay, book: &PromiseBook<'_>) {
    println!(
        "Expected on {}: {} across {} payments",
        format_iso_date(day.date),
        day.total,
        day.entries.len()
    );

    for entry in &day.entries {
        let source = match entry.source {
            ForecastSource::Promise => "promise",
            ForecastSource::Agreement => "agreement",
        };
        println!(
            "  [{source}] {}  {}  (balance {}, overdue {}d)",
            entry.display_name, entry.amount, entry.balance, entry.overdue_days
        );
        if let Some(note) = &entry.note {
            println!("      note: {note}");
        }
        if let Some(installment) = entry.installment {
            let overrun = if installment.is_overrun() {
                " (past agreed installments)"
            } else {
                ""
            };
            println!(
                "      installment {}/{}{overrun}",
                installment.index, installment.total
            );
        }
        let broken = book.count_broken(&entry.client_id);
        if broken > 0 {
            println!("      broken promises on record: {broken}");
        }
    }
}

fn print_range(range: &ForecastRange) {
    println!("Total expected: {}", range.grand_total);
    for day in &range.days {
        println!(
            "  {}  {}  ({} payments)",
            format_iso_date(day.date),
            day.total,
            day.entries.len()
        );
    }
}

fn print_month(month: &MonthForecast) {
    println!(
        "Month {:04}-{:02}, total expected {}",
        month.year, month.month, month.grand_total
    );
    for week in &month.weeks {
        let cells: Vec<String> = week
            .iter()
            .map(|day| format!("{:02}: {}", day.date.day(), day.total))
            .collect();
        println!("  {}", cells.join("   "));
    }
}
