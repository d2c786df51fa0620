#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use promise_ledger_core::{
    format_iso_date, identifiers_match, parse_iso_date, Agreement, AgreementStatus, ArchiveError,
    ClientDirectory, ClientProfile, Frequency, Promise, PromiseArchive, PromiseStatus,
};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS promises (
  client_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  promise_id TEXT NOT NULL UNIQUE,
  due_date TEXT NOT NULL,
  amount TEXT NOT NULL,
  note TEXT,
  created_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'fulfilled', 'broken')),
  fulfilled_at TEXT,
  broken_at TEXT,
  recorded_by TEXT NOT NULL,
  PRIMARY KEY (client_id, position)
);

CREATE INDEX IF NOT EXISTS idx_promises_due_status
  ON promises(due_date, status);

CREATE TABLE IF NOT EXISTS agreements (
  client_id TEXT PRIMARY KEY,
  start_date TEXT NOT NULL,
  frequency TEXT NOT NULL CHECK (frequency IN ('weekly', 'biweekly')),
  installment_amount TEXT NOT NULL,
  total_installments INTEGER NOT NULL CHECK (total_installments >= 1),
  status TEXT NOT NULL CHECK (status IN ('active', 'closed'))
);

CREATE TABLE IF NOT EXISTS clients (
  client_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  balance TEXT NOT NULL,
  overdue_days INTEGER NOT NULL DEFAULT 0
);
";

/// SQLite home for the promise mapping plus the agreement and client
/// directory tables the forecast reads from.
pub struct SqlitePromiseStore {
    conn: Connection,
}

impl SqlitePromiseStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_timestamp(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    fn load_promises(&self) -> Result<BTreeMap<String, Vec<Promise>>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT client_id, promise_id, due_date, amount, note, created_at,
                        status, fulfilled_at, broken_at, recorded_by
                 FROM promises
                 ORDER BY client_id ASC, position ASC",
            )
            .context("failed to prepare promise load")?;

        let mut rows = stmt.query([]).context("failed to query promises")?;
        let mut map: BTreeMap<String, Vec<Promise>> = BTreeMap::new();

        while let Some(row) = rows.next().context("failed reading promise row")? {
            let client_id: String = row.get(0)?;
            let promise_id: String = row.get(1)?;
            let due_date: String = row.get(2)?;
            let amount: String = row.get(3)?;
            let note: Option<String> = row.get(4)?;
            let created_at: String = row.get(5)?;
            let status: String = row.get(6)?;
            let fulfilled_at: Option<String> = row.get(7)?;
            let broken_at: Option<String> = row.get(8)?;
            let recorded_by: String = row.get(9)?;

            let promise = Promise {
                promise_id: Ulid::from_string(&promise_id)
                    .with_context(|| format!("invalid stored promise_id {promise_id:?}"))?,
                due_date: parse_iso_date(&due_date)
                    .map_err(|err| anyhow!("invalid stored due_date: {err}"))?,
                amount: parse_amount(&amount)?,
                note,
                created_at: parse_timestamp(&created_at)?,
                status: PromiseStatus::parse(&status)
                    .ok_or_else(|| anyhow!("invalid stored promise status {status:?}"))?,
                fulfilled_at: fulfilled_at.as_deref().map(parse_timestamp).transpose()?,
                broken_at: broken_at.as_deref().map(parse_timestamp).transpose()?,
                recorded_by,
            };

            map.entry(client_id).or_default().push(promise);
        }

        Ok(map)
    }

    fn save_promises(&self, promises: &BTreeMap<String, Vec<Promise>>) -> Result<()> {
        // The archive contract replaces the whole mapping on every save, so
        // the table is rebuilt inside one transaction.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start promise save transaction")?;

        tx.execute("DELETE FROM promises", [])
            .context("failed to clear promises")?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO promises(
                        client_id, position, promise_id, due_date, amount, note,
                        created_at, status, fulfilled_at, broken_at, recorded_by
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("failed to prepare promise insert")?;

            for (client_id, list) in promises {
                for (position, promise) in list.iter().enumerate() {
                    stmt.execute(params![
                        client_id,
                        i64::try_from(position).context("promise position overflow")?,
                        promise.promise_id.to_string(),
                        format_iso_date(promise.due_date),
                        promise.amount.to_string(),
                        promise.note,
                        format_timestamp(promise.created_at)?,
                        promise.status.as_str(),
                        promise.fulfilled_at.map(format_timestamp).transpose()?,
                        promise.broken_at.map(format_timestamp).transpose()?,
                        promise.recorded_by,
                    ])
                    .context("failed to insert promise")?;
                }
            }
        }

        tx.commit().context("failed to commit promise save")
    }

    pub fn upsert_agreement(&self, agreement: &Agreement) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agreements(
                    client_id, start_date, frequency, installment_amount,
                    total_installments, status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(client_id) DO UPDATE SET
                   start_date = excluded.start_date,
                   frequency = excluded.frequency,
                   installment_amount = excluded.installment_amount,
                   total_installments = excluded.total_installments,
                   status = excluded.status",
                params![
                    agreement.client_id,
                    format_iso_date(agreement.start_date),
                    agreement.frequency.as_str(),
                    agreement.installment_amount.to_string(),
                    i64::from(agreement.total_installments),
                    agreement.status.as_str(),
                ],
            )
            .context("failed to upsert agreement")?;

        Ok(())
    }

    /// Marks the client's agreement closed. Returns false when no agreement
    /// exists for the client.
    pub fn close_agreement(&self, client_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE agreements SET status = 'closed' WHERE client_id = ?1",
                params![client_id],
            )
            .context("failed to close agreement")?;

        Ok(changed > 0)
    }

    pub fn list_agreements(&self) -> Result<Vec<Agreement>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT client_id, start_date, frequency, installment_amount,
                        total_installments, status
                 FROM agreements
                 ORDER BY client_id ASC",
            )
            .context("failed to prepare agreement load")?;

        let mut rows = stmt.query([]).context("failed to query agreements")?;
        let mut agreements = Vec::new();

        while let Some(row) = rows.next().context("failed reading agreement row")? {
            let client_id: String = row.get(0)?;
            let start_date: String = row.get(1)?;
            let frequency: String = row.get(2)?;
            let installment_amount: String = row.get(3)?;
            let total_installments: i64 = row.get(4)?;
            let status: String = row.get(5)?;

            agreements.push(Agreement {
                client_id,
                start_date: parse_iso_date(&start_date)
                    .map_err(|err| anyhow!("invalid stored start_date: {err}"))?,
                frequency: Frequency::parse(&frequency)
                    .ok_or_else(|| anyhow!("invalid stored frequency {frequency:?}"))?,
                installment_amount: parse_amount(&installment_amount)?,
                total_installments: u32::try_from(total_installments)
                    .with_context(|| format!("invalid total_installments {total_installments}"))?,
                status: AgreementStatus::parse(&status)
                    .ok_or_else(|| anyhow!("invalid stored agreement status {status:?}"))?,
            });
        }

        Ok(agreements)
    }

    pub fn upsert_client(&self, client_id: &str, profile: &ClientProfile) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO clients(client_id, display_name, balance, overdue_days)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   balance = excluded.balance,
                   overdue_days = excluded.overdue_days",
                params![
                    client_id,
                    profile.display_name,
                    profile.balance.to_string(),
                    profile.overdue_days,
                ],
            )
            .context("failed to upsert client")?;

        Ok(())
    }

    pub fn list_clients(&self) -> Result<Vec<(String, ClientProfile)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT client_id, display_name, balance, overdue_days
                 FROM clients
                 ORDER BY client_id ASC",
            )
            .context("failed to prepare client load")?;

        let mut rows = stmt.query([]).context("failed to query clients")?;
        let mut clients = Vec::new();

        while let Some(row) = rows.next().context("failed reading client row")? {
            let client_id: String = row.get(0)?;
            let display_name: String = row.get(1)?;
            let balance: String = row.get(2)?;
            let overdue_days: i64 = row.get(3)?;

            clients.push((
                client_id,
                ClientProfile {
                    display_name,
                    balance: parse_amount(&balance)?,
                    overdue_days,
                },
            ));
        }

        Ok(clients)
    }
}

impl PromiseArchive for SqlitePromiseStore {
    fn load(&self) -> Result<BTreeMap<String, Vec<Promise>>, ArchiveError> {
        self.load_promises()
            .map_err(|err| ArchiveError(format!("{err:#}")))
    }

    fn save(&self, promises: &BTreeMap<String, Vec<Promise>>) -> Result<(), ArchiveError> {
        self.save_promises(promises)
            .map_err(|err| ArchiveError(format!("{err:#}")))
    }
}

impl ClientDirectory for SqlitePromiseStore {
    fn resolve(&self, identifier: &str) -> Option<ClientProfile> {
        // A directory read failure degrades to a placeholder entry upstream
        // rather than dropping the forecast line.
        let clients = match self.list_clients() {
            Ok(clients) => clients,
            Err(err) => {
                log::warn!("client directory read failed: {err:#}");
                return None;
            }
        };

        clients
            .into_iter()
            .find(|(client_id, _)| identifiers_match(client_id, identifier))
            .map(|(_, profile)| profile)
    }
}

fn parse_amount(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("invalid stored amount {value:?}"))
}

fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .context("failed to format timestamp as RFC3339")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid stored timestamp {value:?}"))
}
