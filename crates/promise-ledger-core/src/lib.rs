use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Weekday};
use ulid::Ulid;

/// Display name used when an identifier cannot be resolved to a client.
pub const PLACEHOLDER_NAME: &str = "Cliente";

const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid amount {0}: amount must be greater than zero")]
    InvalidAmount(Decimal),
    #[error("missing due date")]
    MissingDate,
    #[error("promise not found for client {client_id} at index {index}")]
    NotFound { client_id: String, index: usize },
    #[error("invalid transition: promise is {current}, only pending promises can move")]
    InvalidTransition { current: PromiseStatus },
    #[error("invalid date: {0}")]
    InvalidDate(String),
}

/// Opaque failure from the persistence collaborator. Save failures are
/// observed and logged but never rolled back into the in-memory mapping.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("archive error: {0}")]
pub struct ArchiveError(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Broken,
}

impl PromiseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Broken => "broken",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "fulfilled" => Some(Self::Fulfilled),
            "broken" => Some(Self::Broken),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Broken)
    }
}

impl Display for PromiseStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
}

impl Frequency {
    /// Days between consecutive due installments.
    #[must_use]
    pub fn days(self) -> i64 {
        match self {
            Self::Weekly => 7,
            Self::Biweekly => 15,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "weekly" => Some(Self::Weekly),
            "biweekly" => Some(Self::Biweekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Active,
    Closed,
}

impl AgreementStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ForecastSource {
    Promise,
    Agreement,
}

/// A client's commitment to pay a specific amount by a specific date.
/// The client identifier is the key of the owning mapping, not a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promise {
    pub promise_id: Ulid,
    pub due_date: Date,
    pub amount: Decimal,
    pub note: Option<String>,
    pub created_at: OffsetDateTime,
    pub status: PromiseStatus,
    pub fulfilled_at: Option<OffsetDateTime>,
    pub broken_at: Option<OffsetDateTime>,
    pub recorded_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromiseInput {
    pub due_date: Option<Date>,
    pub amount: Decimal,
    pub note: Option<String>,
    pub recorded_by: String,
}

impl PromiseInput {
    /// Validates an input before it is turned into a stored promise.
    ///
    /// # Errors
    /// Returns [`LedgerError::MissingDate`] when no due date was given and
    /// [`LedgerError::InvalidAmount`] when the amount is not positive.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.due_date.is_none() {
            return Err(LedgerError::MissingDate);
        }

        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(self.amount));
        }

        Ok(())
    }
}

/// A recurring installment plan. Owned by an external collaborator; the
/// core only reads agreements when expanding forecasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agreement {
    pub client_id: String,
    pub start_date: Date,
    pub frequency: Frequency,
    pub installment_amount: Decimal,
    pub total_installments: u32,
    pub status: AgreementStatus,
}

/// Position of a due installment within its agreement. Indexes ascend from
/// 1 and keep ascending past `total`; display layers flag the overrun.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct InstallmentRef {
    pub index: u32,
    pub total: u32,
}

impl InstallmentRef {
    #[must_use]
    pub fn is_overrun(self) -> bool {
        self.index > self.total
    }
}

/// One expected payment on a given date, merged from either source.
/// Derived per query and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastEntry {
    pub client_id: String,
    pub display_name: String,
    pub amount: Decimal,
    pub due_date: Date,
    pub source: ForecastSource,
    pub note: Option<String>,
    pub balance: Decimal,
    pub overdue_days: i64,
    pub installment: Option<InstallmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastDay {
    pub date: Date,
    pub entries: Vec<ForecastEntry>,
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastRange {
    pub days: Vec<ForecastDay>,
    pub grand_total: Decimal,
}

/// A calendar month of forecasts partitioned into Monday-aligned rows.
/// The first and last rows may be partial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthForecast {
    pub year: i32,
    pub month: u8,
    pub weeks: Vec<Vec<ForecastDay>>,
    pub grand_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientProfile {
    pub display_name: String,
    pub balance: Decimal,
    pub overdue_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    PromiseCreated {
        client_id: String,
        promise: Promise,
    },
    PromiseStatusChanged {
        client_id: String,
        promise_id: Ulid,
        index: usize,
        status: PromiseStatus,
    },
}

/// Persistence collaborator. Loaded once at start, written through after
/// every mutation.
pub trait PromiseArchive {
    /// Loads the full client → promises mapping.
    ///
    /// # Errors
    /// Returns [`ArchiveError`] when the backing store cannot be read.
    fn load(&self) -> Result<BTreeMap<String, Vec<Promise>>, ArchiveError>;

    /// Replaces the stored mapping with the given one.
    ///
    /// # Errors
    /// Returns [`ArchiveError`] when the backing store cannot be written.
    fn save(&self, promises: &BTreeMap<String, Vec<Promise>>) -> Result<(), ArchiveError>;
}

/// No-op archive for ephemeral sessions and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullArchive;

impl PromiseArchive for NullArchive {
    fn load(&self) -> Result<BTreeMap<String, Vec<Promise>>, ArchiveError> {
        Ok(BTreeMap::new())
    }

    fn save(&self, _promises: &BTreeMap<String, Vec<Promise>>) -> Result<(), ArchiveError> {
        Ok(())
    }
}

/// Resolves an identifier to a client record. Misses degrade to placeholder
/// display data; they are never an error.
pub trait ClientDirectory {
    fn resolve(&self, identifier: &str) -> Option<ClientProfile>;
}

/// Best-effort remote replication. At-most-once, fire-and-forget: a failed
/// notification never blocks or rolls back the local mutation.
pub trait SyncChannel {
    fn notify(&self, event: &SyncEvent);
}

/// Sync channel that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSync;

impl SyncChannel for NullSync {
    fn notify(&self, _event: &SyncEvent) {}
}

/// Injectable time source so sweeps and forecasts are deterministic under
/// test.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;

    fn today(&self) -> Date {
        self.now().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// Owns the client → promises mapping and the promise lifecycle.
///
/// Single-threaded and synchronous: every operation runs to completion, and
/// the only recognized race (a sweep and a manual transition hitting the
/// same index) is resolved by re-checking Pending immediately before any
/// mutation.
pub struct PromiseBook<'a> {
    promises: BTreeMap<String, Vec<Promise>>,
    archive: &'a dyn PromiseArchive,
    sync: &'a dyn SyncChannel,
    clock: &'a dyn Clock,
}

impl<'a> PromiseBook<'a> {
    /// Loads the stored mapping and wires the collaborators.
    ///
    /// # Errors
    /// Returns [`ArchiveError`] when the initial load fails. Later save
    /// failures are logged, not surfaced.
    pub fn open(
        archive: &'a dyn PromiseArchive,
        sync: &'a dyn SyncChannel,
        clock: &'a dyn Clock,
    ) -> Result<Self, ArchiveError> {
        let promises = archive.load()?;
        Ok(Self {
            promises,
            archive,
            sync,
            clock,
        })
    }

    /// Records a new pending promise for the client.
    ///
    /// The amount is accepted even when it exceeds the client's known
    /// balance; warning about that is the caller's concern.
    ///
    /// # Errors
    /// Returns [`LedgerError::MissingDate`] or [`LedgerError::InvalidAmount`]
    /// when the input fails validation.
    pub fn add(&mut self, client_id: &str, input: PromiseInput) -> Result<Promise, LedgerError> {
        input.validate()?;
        let Some(due_date) = input.due_date else {
            return Err(LedgerError::MissingDate);
        };

        let promise = Promise {
            promise_id: Ulid::new(),
            due_date,
            amount: input.amount,
            note: input.note,
            created_at: self.clock.now(),
            status: PromiseStatus::Pending,
            fulfilled_at: None,
            broken_at: None,
            recorded_by: input.recorded_by,
        };

        self.promises
            .entry(client_id.to_string())
            .or_default()
            .push(promise.clone());
        self.persist();
        self.sync.notify(&SyncEvent::PromiseCreated {
            client_id: client_id.to_string(),
            promise: promise.clone(),
        });

        Ok(promise)
    }

    /// Returns the client's promises in insertion order, empty for unknown
    /// clients.
    #[must_use]
    pub fn list_for(&self, client_id: &str) -> &[Promise] {
        self.promises.get(client_id).map_or(&[], Vec::as_slice)
    }

    /// Moves a pending promise into a terminal state and stamps the
    /// matching timestamp.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for a bad client or index and
    /// [`LedgerError::InvalidTransition`] when the promise is no longer
    /// Pending (including when a sweep got there first) or when the target
    /// state is not terminal.
    pub fn transition(
        &mut self,
        client_id: &str,
        index: usize,
        new_status: PromiseStatus,
    ) -> Result<Promise, LedgerError> {
        let now = self.clock.now();
        let list = self
            .promises
            .get_mut(client_id)
            .ok_or_else(|| LedgerError::NotFound {
                client_id: client_id.to_string(),
                index,
            })?;
        let promise = list.get_mut(index).ok_or_else(|| LedgerError::NotFound {
            client_id: client_id.to_string(),
            index,
        })?;

        // Optimistic re-check: a sweep may have expired this promise between
        // the caller's read and this call.
        if promise.status != PromiseStatus::Pending || !new_status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                current: promise.status,
            });
        }

        promise.status = new_status;
        match new_status {
            PromiseStatus::Fulfilled => promise.fulfilled_at = Some(now),
            PromiseStatus::Broken => promise.broken_at = Some(now),
            PromiseStatus::Pending => {}
        }

        let updated = promise.clone();
        self.persist();
        self.sync.notify(&SyncEvent::PromiseStatusChanged {
            client_id: client_id.to_string(),
            promise_id: updated.promise_id,
            index,
            status: updated.status,
        });

        Ok(updated)
    }

    /// Count of broken promises for the client. A display-only risk signal,
    /// never a gate.
    #[must_use]
    pub fn count_broken(&self, client_id: &str) -> usize {
        self.list_for(client_id)
            .iter()
            .filter(|promise| promise.status == PromiseStatus::Broken)
            .count()
    }

    /// Expires every pending promise whose due date is strictly before
    /// `today`. A promise due today stays Pending through the whole day.
    ///
    /// This is the sole automatic transition and runs before any forecast
    /// query. Returns the number of promises swept.
    pub fn sweep_expired(&mut self, today: Date) -> usize {
        let now = self.clock.now();
        let mut swept = Vec::new();

        for (client_id, list) in &mut self.promises {
            for (index, promise) in list.iter_mut().enumerate() {
                if promise.status == PromiseStatus::Pending && promise.due_date < today {
                    promise.status = PromiseStatus::Broken;
                    promise.broken_at = Some(now);
                    swept.push(SyncEvent::PromiseStatusChanged {
                        client_id: client_id.clone(),
                        promise_id: promise.promise_id,
                        index,
                        status: PromiseStatus::Broken,
                    });
                }
            }
        }

        if !swept.is_empty() {
            self.persist();
            for event in &swept {
                self.sync.notify(event);
            }
        }

        swept.len()
    }

    /// Clients and their promises in stored iteration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[Promise])> {
        self.promises
            .iter()
            .map(|(client_id, list)| (client_id.as_str(), list.as_slice()))
    }

    fn persist(&self) {
        if let Err(err) = self.archive.save(&self.promises) {
            log::warn!("promise archive save failed, in-memory state stays authoritative: {err}");
        }
    }
}

/// Decides whether the agreement has an installment due on `date`.
///
/// Due only when the day difference from the start date is a positive exact
/// multiple of the frequency. Closed agreements never produce entries.
/// Generation does not stop past `total_installments`; callers flag overrun
/// via [`InstallmentRef::is_overrun`].
#[must_use]
pub fn installment_due_on(agreement: &Agreement, date: Date) -> Option<InstallmentRef> {
    if agreement.status != AgreementStatus::Active {
        return None;
    }

    let diff_days = (date - agreement.start_date).whole_days();
    if diff_days <= 0 {
        return None;
    }

    let every = agreement.frequency.days();
    if diff_days % every != 0 {
        return None;
    }

    let index = u32::try_from(diff_days / every).ok()?;
    Some(InstallmentRef {
        index,
        total: agreement.total_installments,
    })
}

/// Merges both commitment sources into the expected payments for one date.
///
/// Promise-sourced entries come first in the book's client iteration order,
/// then agreement-sourced entries in slice order; no further sort. Only
/// Pending promises with a due date equal to `date` match, so callers sweep
/// expired promises before querying. A resolver miss degrades to the
/// placeholder profile; entries are never dropped.
#[must_use]
pub fn forecast_for(
    book: &PromiseBook<'_>,
    agreements: &[Agreement],
    directory: &dyn ClientDirectory,
    date: Date,
) -> Vec<ForecastEntry> {
    let mut entries = Vec::new();

    for (client_id, promises) in book.entries() {
        for promise in promises
            .iter()
            .filter(|promise| promise.status == PromiseStatus::Pending && promise.due_date == date)
        {
            let profile = resolve_or_placeholder(directory, client_id);
            entries.push(ForecastEntry {
                client_id: client_id.to_string(),
                display_name: profile.display_name,
                amount: promise.amount,
                due_date: date,
                source: ForecastSource::Promise,
                note: promise.note.clone(),
                balance: profile.balance,
                overdue_days: profile.overdue_days,
                installment: None,
            });
        }
    }

    for agreement in agreements {
        if let Some(installment) = installment_due_on(agreement, date) {
            let profile = resolve_or_placeholder(directory, &agreement.client_id);
            entries.push(ForecastEntry {
                client_id: agreement.client_id.clone(),
                display_name: profile.display_name,
                amount: agreement.installment_amount,
                due_date: date,
                source: ForecastSource::Agreement,
                note: Some(format!(
                    "{} agreement, installment {}/{}",
                    agreement.frequency.as_str(),
                    installment.index,
                    installment.total
                )),
                balance: profile.balance,
                overdue_days: profile.overdue_days,
                installment: Some(installment),
            });
        }
    }

    entries
}

#[must_use]
pub fn forecast_day(
    book: &PromiseBook<'_>,
    agreements: &[Agreement],
    directory: &dyn ClientDirectory,
    date: Date,
) -> ForecastDay {
    let entries = forecast_for(book, agreements, directory, date);
    let total = entries.iter().map(|entry| entry.amount).sum();
    ForecastDay {
        date,
        entries,
        total,
    }
}

/// One forecast per calendar day over the inclusive range. The grand total
/// is the sum of the daily totals.
#[must_use]
pub fn forecast_range(
    book: &PromiseBook<'_>,
    agreements: &[Agreement],
    directory: &dyn ClientDirectory,
    start: Date,
    end_inclusive: Date,
) -> ForecastRange {
    let mut days = Vec::new();
    let mut date = start;

    while date <= end_inclusive {
        days.push(forecast_day(book, agreements, directory, date));
        match date.next_day() {
            Some(next) => date = next,
            None => break,
        }
    }

    let grand_total = days.iter().map(|day| day.total).sum();
    ForecastRange { days, grand_total }
}

/// The Monday of the ISO week containing `date`.
#[must_use]
pub fn monday_of_week(date: Date) -> Date {
    date - Duration::days(i64::from(date.weekday().number_days_from_monday()))
}

/// Exactly seven consecutive days starting the Monday of `today`'s week.
#[must_use]
pub fn forecast_week(
    book: &PromiseBook<'_>,
    agreements: &[Agreement],
    directory: &dyn ClientDirectory,
    today: Date,
) -> ForecastRange {
    let monday = monday_of_week(today);
    forecast_range(book, agreements, directory, monday, monday + Duration::days(6))
}

/// The full calendar month of `today`, partitioned into Monday-aligned rows
/// ending on Sundays. Partial first and last rows still contribute full
/// per-day totals.
#[must_use]
pub fn forecast_month(
    book: &PromiseBook<'_>,
    agreements: &[Agreement],
    directory: &dyn ClientDirectory,
    today: Date,
) -> MonthForecast {
    let first = today.replace_day(1).unwrap_or(today);
    let last_day = time::util::days_in_year_month(today.year(), today.month());
    let last = today.replace_day(last_day).unwrap_or(today);

    let mut weeks = Vec::new();
    let mut row = Vec::new();
    let mut grand_total = Decimal::ZERO;
    let mut date = first;

    loop {
        let day = forecast_day(book, agreements, directory, date);
        grand_total += day.total;
        row.push(day);

        let at_end = date == last;
        if date.weekday() == Weekday::Sunday || at_end {
            weeks.push(std::mem::take(&mut row));
        }
        if at_end {
            break;
        }
        match date.next_day() {
            Some(next) => date = next,
            None => break,
        }
    }

    if !row.is_empty() {
        weeks.push(row);
    }

    MonthForecast {
        year: today.year(),
        month: u8::from(today.month()),
        weeks,
        grand_total,
    }
}

fn resolve_or_placeholder(directory: &dyn ClientDirectory, identifier: &str) -> ClientProfile {
    directory
        .resolve(identifier)
        .unwrap_or_else(|| ClientProfile {
            display_name: PLACEHOLDER_NAME.to_string(),
            balance: Decimal::ZERO,
            overdue_days: 0,
        })
}

/// Strips everything but ASCII digits from an identifier.
#[must_use]
pub fn digits_only(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Matches two identifiers after digit normalization: equal in full, or
/// equal on the last ten digits to tolerate country-code prefixes.
#[must_use]
pub fn identifiers_match(a: &str, b: &str) -> bool {
    let a = digits_only(a);
    let b = digits_only(b);

    if a.is_empty() || b.is_empty() {
        return false;
    }

    a == b || suffix10(&a) == suffix10(&b)
}

fn suffix10(digits: &str) -> &str {
    // Safe to slice bytes: digits_only output is pure ASCII.
    &digits[digits.len().saturating_sub(10)..]
}

/// Parses a calendar date in ISO `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`LedgerError::InvalidDate`] when the input does not parse.
pub fn parse_iso_date(value: &str) -> Result<Date, LedgerError> {
    Date::parse(value, ISO_DATE)
        .map_err(|err| LedgerError::InvalidDate(format!("{value:?}: {err}")))
}

/// Formats a calendar date as ISO `YYYY-MM-DD`.
#[must_use]
pub fn format_iso_date(date: Date) -> String {
    date.format(ISO_DATE).unwrap_or_else(|_| date.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::str::FromStr;
    use time::macros::datetime;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    fn date(value: &str) -> Date {
        must_ok(parse_iso_date(value))
    }

    fn dec(value: &str) -> Decimal {
        must_ok(Decimal::from_str(value))
    }

    fn input(due: &str, amount: &str) -> PromiseInput {
        PromiseInput {
            due_date: Some(date(due)),
            amount: dec(amount),
            note: None,
            recorded_by: "juan".to_string(),
        }
    }

    fn active_agreement(client_id: &str, start: &str, frequency: Frequency) -> Agreement {
        Agreement {
            client_id: client_id.to_string(),
            start_date: date(start),
            frequency,
            installment_amount: dec("300"),
            total_installments: 6,
            status: AgreementStatus::Active,
        }
    }

    #[derive(Default)]
    struct RecordingSync {
        events: RefCell<Vec<SyncEvent>>,
    }

    impl SyncChannel for RecordingSync {
        fn notify(&self, event: &SyncEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    struct FailingArchive;

    impl PromiseArchive for FailingArchive {
        fn load(&self) -> Result<BTreeMap<String, Vec<Promise>>, ArchiveError> {
            Ok(BTreeMap::new())
        }

        fn save(&self, _promises: &BTreeMap<String, Vec<Promise>>) -> Result<(), ArchiveError> {
            Err(ArchiveError("disk full".to_string()))
        }
    }

    #[derive(Default)]
    struct CapturingArchive {
        saved: RefCell<Vec<BTreeMap<String, Vec<Promise>>>>,
    }

    impl PromiseArchive for CapturingArchive {
        fn load(&self) -> Result<BTreeMap<String, Vec<Promise>>, ArchiveError> {
            Ok(BTreeMap::new())
        }

        fn save(&self, promises: &BTreeMap<String, Vec<Promise>>) -> Result<(), ArchiveError> {
            self.saved.borrow_mut().push(promises.clone());
            Ok(())
        }
    }

    struct MapDirectory {
        clients: Vec<(String, ClientProfile)>,
    }

    impl ClientDirectory for MapDirectory {
        fn resolve(&self, identifier: &str) -> Option<ClientProfile> {
            self.clients
                .iter()
                .find(|(id, _)| identifiers_match(id, identifier))
                .map(|(_, profile)| profile.clone())
        }
    }

    struct EmptyDirectory;

    impl ClientDirectory for EmptyDirectory {
        fn resolve(&self, _identifier: &str) -> Option<ClientProfile> {
            None
        }
    }

    fn fixture_clock() -> FixedClock {
        FixedClock(datetime!(2026-02-10 10:30 UTC))
    }

    fn directory() -> MapDirectory {
        MapDirectory {
            clients: vec![(
                "5215551234".to_string(),
                ClientProfile {
                    display_name: "Maria Lopez".to_string(),
                    balance: dec("1200"),
                    overdue_days: 12,
                },
            )],
        }
    }

    #[test]
    fn add_then_list_includes_pending_entry() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let promise = must_ok(book.add("5215551234", input("2026-02-14", "500")));

        let listed = book.list_for("5215551234");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], promise);
        assert_eq!(listed[0].status, PromiseStatus::Pending);
        assert_eq!(listed[0].created_at, clock.now());
    }

    #[test]
    fn add_rejects_non_positive_amount() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let err = must_err(book.add("c1", input("2026-02-14", "0")));
        assert_eq!(err, LedgerError::InvalidAmount(dec("0")));

        let err = must_err(book.add("c1", input("2026-02-14", "-5")));
        assert_eq!(err, LedgerError::InvalidAmount(dec("-5")));
        assert!(book.list_for("c1").is_empty());
    }

    #[test]
    fn add_rejects_missing_date() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let mut missing = input("2026-02-14", "500");
        missing.due_date = None;
        let err = must_err(book.add("c1", missing));
        assert_eq!(err, LedgerError::MissingDate);
    }

    #[test]
    fn list_for_unknown_client_is_empty() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        assert!(book.list_for("nobody").is_empty());
    }

    #[test]
    fn transition_succeeds_once_then_rejects() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));

        let updated = must_ok(book.transition("c1", 0, PromiseStatus::Fulfilled));
        assert_eq!(updated.status, PromiseStatus::Fulfilled);
        assert_eq!(updated.fulfilled_at, Some(clock.now()));

        let err = must_err(book.transition("c1", 0, PromiseStatus::Broken));
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                current: PromiseStatus::Fulfilled
            }
        );
    }

    #[test]
    fn transition_to_pending_is_invalid() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));

        let err = must_err(book.transition("c1", 0, PromiseStatus::Pending));
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                current: PromiseStatus::Pending
            }
        );
    }

    #[test]
    fn transition_out_of_range_is_not_found() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));

        let err = must_err(book.transition("c1", 3, PromiseStatus::Fulfilled));
        assert_eq!(
            err,
            LedgerError::NotFound {
                client_id: "c1".to_string(),
                index: 3
            }
        );

        let err = must_err(book.transition("other", 0, PromiseStatus::Fulfilled));
        assert_eq!(
            err,
            LedgerError::NotFound {
                client_id: "other".to_string(),
                index: 0
            }
        );
    }

    #[test]
    fn sweep_expires_only_strictly_earlier_dates() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-09", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-10", "200")));
        let _ = must_ok(book.add("c2", input("2026-02-11", "300")));

        let swept = book.sweep_expired(date("2026-02-10"));
        assert_eq!(swept, 1);

        let c1 = book.list_for("c1");
        assert_eq!(c1[0].status, PromiseStatus::Broken);
        assert_eq!(c1[0].broken_at, Some(clock.now()));
        assert_eq!(c1[1].status, PromiseStatus::Pending);
        assert_eq!(book.list_for("c2")[0].status, PromiseStatus::Pending);
    }

    #[test]
    fn sweep_skips_terminal_promises() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-01", "100")));
        let _ = must_ok(book.transition("c1", 0, PromiseStatus::Fulfilled));

        assert_eq!(book.sweep_expired(date("2026-02-10")), 0);
        assert_eq!(book.list_for("c1")[0].status, PromiseStatus::Fulfilled);
    }

    #[test]
    fn transition_after_sweep_reports_invalid_transition() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-01", "100")));

        assert_eq!(book.sweep_expired(date("2026-02-10")), 1);

        let err = must_err(book.transition("c1", 0, PromiseStatus::Fulfilled));
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                current: PromiseStatus::Broken
            }
        );
    }

    #[test]
    fn count_broken_counts_only_broken() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-01", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-02", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-14", "100")));
        let _ = must_ok(book.transition("c1", 1, PromiseStatus::Fulfilled));

        let _ = book.sweep_expired(date("2026-02-10"));

        assert_eq!(book.count_broken("c1"), 1);
        assert_eq!(book.count_broken("unknown"), 0);
    }

    #[test]
    fn save_failure_keeps_in_memory_state() {
        let archive = FailingArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let promise = must_ok(book.add("c1", input("2026-02-14", "500")));
        let listed = book.list_for("c1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], promise);
    }

    #[test]
    fn every_mutation_writes_through() {
        let archive = CapturingArchive::default();
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let _ = must_ok(book.add("c1", input("2026-02-01", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-14", "200")));
        let _ = must_ok(book.transition("c1", 1, PromiseStatus::Fulfilled));
        let _ = book.sweep_expired(date("2026-02-10"));

        let saved = archive.saved.borrow();
        assert_eq!(saved.len(), 4);
        let last = &saved[3]["c1"];
        assert_eq!(last[0].status, PromiseStatus::Broken);
        assert_eq!(last[1].status, PromiseStatus::Fulfilled);
    }

    #[test]
    fn sync_events_fire_on_add_transition_and_sweep() {
        let archive = NullArchive;
        let sync = RecordingSync::default();
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let promise = must_ok(book.add("c1", input("2026-02-01", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-14", "200")));
        let _ = must_ok(book.transition("c1", 1, PromiseStatus::Fulfilled));
        let _ = book.sweep_expired(date("2026-02-10"));

        let events = sync.events.borrow();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            SyncEvent::PromiseCreated { client_id, promise: created }
                if client_id == "c1" && created.promise_id == promise.promise_id
        ));
        assert!(matches!(
            &events[2],
            SyncEvent::PromiseStatusChanged { index: 1, status: PromiseStatus::Fulfilled, .. }
        ));
        assert!(matches!(
            &events[3],
            SyncEvent::PromiseStatusChanged { index: 0, status: PromiseStatus::Broken, .. }
        ));
    }

    #[test]
    fn weekly_agreement_due_dates() {
        let agreement = active_agreement("A1", "2026-02-01", Frequency::Weekly);

        for (day, expected) in [
            ("2026-02-01", None),
            ("2026-02-05", None),
            ("2026-02-08", Some(1)),
            ("2026-02-14", None),
            ("2026-02-15", Some(2)),
        ] {
            let due = installment_due_on(&agreement, date(day));
            assert_eq!(due.map(|d| d.index), expected, "date {day}");
        }
    }

    #[test]
    fn biweekly_agreement_due_dates() {
        let agreement = active_agreement("A1", "2026-02-01", Frequency::Biweekly);

        let due = installment_due_on(&agreement, date("2026-02-16"));
        assert_eq!(due.map(|d| d.index), Some(1));
        assert!(installment_due_on(&agreement, date("2026-02-08")).is_none());
        let due = installment_due_on(&agreement, date("2026-03-03"));
        assert_eq!(due.map(|d| d.index), Some(2));
    }

    #[test]
    fn closed_agreement_never_produces_entries() {
        let mut agreement = active_agreement("A1", "2026-02-01", Frequency::Weekly);
        agreement.status = AgreementStatus::Closed;

        assert!(installment_due_on(&agreement, date("2026-02-08")).is_none());
    }

    #[test]
    fn installments_keep_generating_past_total_with_overrun_flag() {
        let mut agreement = active_agreement("A1", "2026-02-01", Frequency::Weekly);
        agreement.total_installments = 2;

        let due = installment_due_on(&agreement, date("2026-02-22"));
        let Some(installment) = due else {
            panic!("expected installment past total");
        };
        assert_eq!(installment.index, 3);
        assert!(installment.is_overrun());
    }

    #[test]
    fn forecast_matches_promise_only_on_exact_due_date() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("5215551234", input("2026-02-14", "500")));

        let dir = directory();
        let on_due = forecast_for(&book, &[], &dir, date("2026-02-14"));
        assert_eq!(on_due.len(), 1);
        assert_eq!(on_due[0].amount, dec("500"));
        assert_eq!(on_due[0].display_name, "Maria Lopez");
        assert_eq!(on_due[0].balance, dec("1200"));
        assert_eq!(on_due[0].source, ForecastSource::Promise);

        assert!(forecast_for(&book, &[], &dir, date("2026-02-15")).is_empty());
    }

    #[test]
    fn forecast_skips_terminal_promises() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));
        let _ = must_ok(book.transition("c1", 0, PromiseStatus::Fulfilled));

        assert!(forecast_for(&book, &[], &EmptyDirectory, date("2026-02-14")).is_empty());
    }

    #[test]
    fn forecast_includes_agreement_installment() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let agreement = active_agreement("A1", "2026-02-01", Frequency::Biweekly);

        let entries = forecast_for(&book, &[agreement], &EmptyDirectory, date("2026-02-16"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, dec("300"));
        assert_eq!(entries[0].source, ForecastSource::Agreement);
        assert_eq!(
            entries[0].installment,
            Some(InstallmentRef { index: 1, total: 6 })
        );
    }

    #[test]
    fn resolver_miss_degrades_to_placeholder_without_dropping() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("unknown-1", input("2026-02-14", "500")));
        let agreement = active_agreement("unknown-2", "2026-02-07", Frequency::Weekly);

        let entries = forecast_for(&book, &[agreement], &EmptyDirectory, date("2026-02-14"));
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert_eq!(entry.display_name, PLACEHOLDER_NAME);
            assert_eq!(entry.balance, Decimal::ZERO);
            assert_eq!(entry.overdue_days, 0);
        }
    }

    #[test]
    fn forecast_orders_promises_before_agreements() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));
        let agreement = active_agreement("A1", "2026-02-07", Frequency::Weekly);

        let entries = forecast_for(&book, &[agreement], &EmptyDirectory, date("2026-02-14"));
        assert_eq!(entries[0].source, ForecastSource::Promise);
        assert_eq!(entries[1].source, ForecastSource::Agreement);
    }

    #[test]
    fn day_total_sums_both_sources() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-14", "500")));
        let _ = must_ok(book.add("c2", input("2026-02-14", "250")));
        let agreement = active_agreement("A1", "2026-02-07", Frequency::Weekly);

        let day = forecast_day(&book, &[agreement], &EmptyDirectory, date("2026-02-14"));
        assert_eq!(day.total, dec("1050"));
        assert_eq!(day.entries.len(), 3);
    }

    #[test]
    fn range_is_inclusive_and_totals_match_daily_calls() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-09", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-12", "200")));
        let _ = must_ok(book.add("c2", input("2026-02-15", "400")));
        let agreement = active_agreement("A1", "2026-02-01", Frequency::Weekly);
        let agreements = [agreement];

        let range = forecast_range(
            &book,
            &agreements,
            &EmptyDirectory,
            date("2026-02-09"),
            date("2026-02-15"),
        );
        assert_eq!(range.days.len(), 7);
        assert_eq!(range.days[0].date, date("2026-02-09"));
        assert_eq!(range.days[6].date, date("2026-02-15"));

        let mut daily_sum = Decimal::ZERO;
        let mut day = date("2026-02-09");
        while day <= date("2026-02-15") {
            daily_sum += forecast_day(&book, &agreements, &EmptyDirectory, day).total;
            day = match day.next_day() {
                Some(next) => next,
                None => break,
            };
        }
        assert_eq!(range.grand_total, daily_sum);
        // 100 + 200 + 400 promised, installments on 02-08 excluded, 02-15 included.
        assert_eq!(range.grand_total, dec("1000"));
    }

    #[test]
    fn empty_range_when_start_after_end() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let book = must_ok(PromiseBook::open(&archive, &sync, &clock));

        let range = forecast_range(
            &book,
            &[],
            &EmptyDirectory,
            date("2026-02-15"),
            date("2026-02-09"),
        );
        assert!(range.days.is_empty());
        assert_eq!(range.grand_total, Decimal::ZERO);
    }

    #[test]
    fn monday_of_week_handles_every_weekday() {
        // 2026-02-09 is a Monday.
        assert_eq!(monday_of_week(date("2026-02-09")), date("2026-02-09"));
        assert_eq!(monday_of_week(date("2026-02-11")), date("2026-02-09"));
        // Sunday belongs to the week that started the previous Monday.
        assert_eq!(monday_of_week(date("2026-02-15")), date("2026-02-09"));
    }

    #[test]
    fn week_forecast_spans_monday_through_sunday() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-09", "100")));
        let _ = must_ok(book.add("c1", input("2026-02-15", "900")));

        let week = forecast_week(&book, &[], &EmptyDirectory, date("2026-02-11"));
        assert_eq!(week.days.len(), 7);
        assert_eq!(week.days[0].date, date("2026-02-09"));
        assert_eq!(week.days[6].date, date("2026-02-15"));
        assert_eq!(week.grand_total, dec("1000"));
    }

    #[test]
    fn month_rows_are_monday_aligned_with_partial_edges() {
        let archive = NullArchive;
        let sync = NullSync;
        let clock = fixture_clock();
        let mut book = must_ok(PromiseBook::open(&archive, &sync, &clock));
        let _ = must_ok(book.add("c1", input("2026-02-01", "50")));
        let _ = must_ok(book.add("c1", input("2026-02-28", "70")));

        // February 2026: starts Sunday the 1st, ends Saturday the 28th.
        let month = forecast_month(&book, &[], &EmptyDirectory, date("2026-02-10"));
        assert_eq!(month.year, 2026);
        assert_eq!(month.month, 2);
        assert_eq!(month.weeks.len(), 5);
        assert_eq!(month.weeks[0].len(), 1);
        assert_eq!(month.weeks[1].len(), 7);
        assert_eq!(month.weeks[4].len(), 6);
        assert_eq!(month.weeks[0][0].date, date("2026-02-01"));
        assert_eq!(month.grand_total, dec("120"));

        let day_count: usize = month.weeks.iter().map(Vec::len).sum();
        assert_eq!(day_count, 28);
    }

    #[test]
    fn identifier_matching_tolerates_country_codes() {
        assert!(identifiers_match("5215551234", "5215551234"));
        assert!(identifiers_match("(521) 555-1234", "5215551234"));
        assert!(identifiers_match("+52 1 555 123 4567", "5551234567"));
        assert!(!identifiers_match("5215551234", "5215559999"));
        assert!(!identifiers_match("", "5215551234"));
        assert!(!identifiers_match("abc", "def"));
    }

    #[test]
    fn iso_date_round_trip() {
        let parsed = date("2026-02-14");
        assert_eq!(format_iso_date(parsed), "2026-02-14");
        let err = must_err(parse_iso_date("14/02/2026"));
        assert!(matches!(err, LedgerError::InvalidDate(_)));
    }

    #[test]
    fn status_and_frequency_string_round_trips() {
        for status in [
            PromiseStatus::Pending,
            PromiseStatus::Fulfilled,
            PromiseStatus::Broken,
        ] {
            assert_eq!(PromiseStatus::parse(status.as_str()), Some(status));
        }
        assert!(PromiseStatus::parse("unknown").is_none());

        for frequency in [Frequency::Weekly, Frequency::Biweekly] {
            assert_eq!(Frequency::parse(frequency.as_str()), Some(frequency));
        }
        assert_eq!(Frequency::Weekly.days(), 7);
        assert_eq!(Frequency::Biweekly.days(), 15);

        for status in [AgreementStatus::Active, AgreementStatus::Closed] {
            assert_eq!(AgreementStatus::parse(status.as_str()), Some(status));
        }
    }
}
