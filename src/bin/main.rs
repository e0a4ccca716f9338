// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use kwh_market::{
    Action, ActionKind, Announcement, Command, Engine, EngineConfig, MarketError, SessionRequest,
    Transaction, TransactionId, TransactionStatus, UserId, format_amount,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// KWh Market - Replay marketplace actions
///
/// Publishes the given announcements, replays a CSV of actor actions against
/// them, and writes the resulting transactions to stdout.
#[derive(Parser, Debug)]
#[command(name = "kwh-market")]
#[command(about = "Replays charging marketplace actions from a CSV file", long_about = None)]
struct Args {
    /// Engine configuration in TOML; defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Announcements to publish before the replay (JSON array)
    #[arg(long, value_name = "FILE")]
    announcements: PathBuf,

    /// Path to CSV file with actions
    ///
    /// Expected format: actor,transaction,action,value
    /// Example: cargo run -- --announcements ads.json actions.csv > transactions.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid announcements: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Market(#[from] MarketError),
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, LoadError> {
    match path {
        Some(path) => Ok(EngineConfig::from_toml_str(&read(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

/// Publishes every announcement in a JSON array and returns how many were stored.
fn load_announcements(engine: &Engine, path: &Path) -> Result<usize, LoadError> {
    let announcements: Vec<Announcement> = serde_json::from_str(&read(path)?)?;
    let count = announcements.len();
    for announcement in announcements {
        engine.publish_announcement(announcement)?;
    }
    Ok(count)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let engine = match load_config(args.config.as_deref())
        .and_then(|config| Engine::with_config(config).map_err(LoadError::from))
    {
        Ok(engine) => engine,
        Err(e) => {
            error!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    match load_announcements(&engine, &args.announcements) {
        Ok(count) => info!(count, "announcements published"),
        Err(e) => {
            error!("Error loading announcements: {e}");
            process::exit(1);
        }
    }

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let replay = match replay_actions(&engine, BufReader::new(file)) {
        Ok(replay) => replay,
        Err(e) => {
            error!("Error replaying actions: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = write_transactions(&engine, &replay, std::io::stdout()) {
        error!("Error writing output: {e}");
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `actor, transaction, action, value`
#[derive(Debug, Deserialize)]
struct ActionRecord {
    actor: i64,
    /// Label given on the `request` row, or a full transaction id.
    transaction: String,
    action: String,
    #[serde(default)]
    value: Option<String>,
}

/// Transactions opened during a replay, keyed by their label.
#[derive(Debug, Default)]
pub struct Replay {
    labels: HashMap<String, TransactionId>,
    order: Vec<String>,
}

impl Replay {
    fn reference<'a>(&'a self, label: &'a str) -> &'a str {
        self.labels.get(label).map_or(label, |id| id.as_str())
    }

    /// Labels with their transaction ids, in request order.
    pub fn labelled(&self) -> impl Iterator<Item = (&str, &TransactionId)> {
        self.order
            .iter()
            .filter_map(|label| self.labels.get(label).map(|id| (label.as_str(), id)))
    }
}

fn apply_record(engine: &Engine, replay: &mut Replay, record: ActionRecord) -> Result<(), MarketError> {
    let actor = UserId(record.actor);
    let value = record.value.unwrap_or_default();

    match record.action.as_str() {
        "request" => {
            if replay.labels.contains_key(&record.transaction) {
                return Err(MarketError::Validation(format!(
                    "label '{}' is already taken",
                    record.transaction
                )));
            }
            let tx = engine.request_session(actor, &value, SessionRequest::default())?;
            replay.order.push(record.transaction.clone());
            replay.labels.insert(record.transaction, tx.id().clone());
        }
        "append_issue" => {
            engine.append_issue(actor, replay.reference(&record.transaction), &value)?;
        }
        name => {
            let kind: ActionKind = name.parse()?;
            let command = Command::from_parts(kind, &value)?;
            let outcome = engine.process(Action::new(actor, replay.reference(&record.transaction), command))?;
            if !outcome.was_applied() {
                debug!(transaction = %record.transaction, action = %kind, "already applied");
            }
        }
    }
    Ok(())
}

/// Replays actions from a CSV reader.
///
/// Malformed rows and rejected actions are logged and skipped; the replay
/// only stops on a reader failure.
///
/// # CSV Format
///
/// Expected columns: `actor, transaction, action, value`
/// - `actor`: user id of whoever performs the action
/// - `transaction`: label chosen on the `request` row, or a full id
/// - `action`: `request`, `append_issue`, or any action name (`accept`, `declare_kwh`, ...)
/// - `value`: announcement id for `request`, otherwise the action payload
///
/// # Example
///
/// ```csv
/// actor,transaction,action,value
/// 2,t1,request,ann-1
/// 1,t1,accept,
/// 1,t1,cancel,station closed
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn replay_actions<R: Read>(engine: &Engine, reader: R) -> Result<Replay, csv::Error> {
    let mut replay = Replay::default();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (row, result) in rdr.deserialize::<ActionRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e),
            Err(e) => {
                warn!(row = row + 1, error = %e, "skipping malformed row");
                continue;
            }
        };
        if let Err(e) = apply_record(engine, &mut replay, record) {
            warn!(row = row + 1, error = %e, "skipping rejected action");
        }
    }

    Ok(replay)
}

/// Output row for one transaction.
#[derive(Debug, Serialize)]
struct TransactionRow<'a> {
    label: &'a str,
    transaction: &'a str,
    status: TransactionStatus,
    seller: UserId,
    buyer: UserId,
    retries: u32,
    billed_kwh: String,
    price_per_kwh: String,
    total: String,
    issues: usize,
}

fn money(amount: Option<Decimal>) -> String {
    amount.map(|a| format!("{:.2}", format_amount(a))).unwrap_or_default()
}

impl<'a> TransactionRow<'a> {
    fn new(label: &'a str, tx: &'a Transaction) -> Self {
        TransactionRow {
            label,
            transaction: tx.id().as_str(),
            status: tx.status(),
            seller: tx.seller_id(),
            buyer: tx.buyer_id(),
            retries: tx.retry_count(),
            billed_kwh: tx.declared_kwh().map(|k| k.normalize().to_string()).unwrap_or_default(),
            price_per_kwh: tx.price_per_kwh().map(|p| p.normalize().to_string()).unwrap_or_default(),
            total: money(tx.total_amount()),
            issues: tx.issues().len(),
        }
    }
}

/// Writes the replayed transactions as CSV, in request order.
///
/// # CSV Format
///
/// Columns: `label, transaction, status, seller, buyer, retries, billed_kwh, price_per_kwh, total, issues`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_transactions<W: Write>(engine: &Engine, replay: &Replay, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for (label, id) in replay.labelled() {
        let tx = match engine.get_transaction(id) {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(e) => {
                warn!(transaction = %id, error = %e, "cannot load transaction");
                continue;
            }
        };
        wtr.serialize(TransactionRow::new(label, &tx))?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwh_market::{AnnouncementId, PricingConfig};
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    const SELLER: UserId = UserId(1);
    const BUYER: UserId = UserId(2);

    fn make_engine() -> Engine {
        let engine = Engine::new();
        let announcement = Announcement {
            id: AnnouncementId::from("ann-1"),
            ..Announcement::new(SELLER, PricingConfig::fixed(dec!(0.35)))
        };
        engine.publish_announcement(announcement).unwrap();
        engine
    }

    fn status_of(engine: &Engine, replay: &Replay, label: &str) -> TransactionStatus {
        let id = replay.labels.get(label).unwrap();
        engine.get_transaction(id).unwrap().unwrap().status()
    }

    #[test]
    fn parse_request_and_accept() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   1,t1,accept,\n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        assert_eq!(replay.labelled().count(), 1);
        assert_eq!(status_of(&engine, &replay, "t1"), TransactionStatus::Confirmed);
    }

    #[test]
    fn parse_full_lifecycle() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   1,t1,accept,\n\
                   2,t1,confirm_arrival,\n\
                   1,t1,activate_charging,\n\
                   2,t1,confirm_charging_started,\n\
                   2,t1,finish_charging,\n\
                   2,t1,attach_photo,meter.jpg\n\
                   2,t1,declare_kwh,50\n\
                   1,t1,confirm_kwh,\n\
                   2,t1,declare_payment,\n\
                   1,t1,confirm_payment,\n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        let id = replay.labels.get("t1").unwrap();
        let tx = engine.get_transaction(id).unwrap().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Completed);
        assert_eq!(tx.total_amount(), Some(dec!(17.50)));
    }

    #[test]
    fn parse_with_whitespace() {
        let csv = "actor,transaction,action,value\n 2 , t1 , request , ann-1 \n 1 , t1 , reject , busy \n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        let id = replay.labels.get("t1").unwrap();
        let tx = engine.get_transaction(id).unwrap().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Cancelled);
        assert_eq!(tx.cancellation_reason(), Some("busy"));
    }

    #[test]
    fn skip_malformed_and_rejected_rows() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   not-a-user,t1,accept,\n\
                   2,t1,accept,\n\
                   1,t1,teleport,\n\
                   1,t1,accept,\n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        // Buyer cannot accept and the unknown action is dropped; only the seller's accept lands.
        assert_eq!(status_of(&engine, &replay, "t1"), TransactionStatus::Confirmed);
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   3,t1,request,ann-1\n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        assert_eq!(replay.labelled().count(), 1);
        assert_eq!(engine.get_transaction_stats().unwrap().total, 1);
    }

    #[test]
    fn append_issue_keeps_status() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   2,t1,append_issue,plug was wet\n";
        let engine = make_engine();

        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        let id = replay.labels.get("t1").unwrap();
        let tx = engine.get_transaction(id).unwrap().unwrap();
        assert_eq!(tx.status(), TransactionStatus::PendingSeller);
        assert_eq!(tx.issues().len(), 1);
    }

    #[test]
    fn write_rounds_amounts_to_cents() {
        let csv = "actor,transaction,action,value\n\
                   2,t1,request,ann-1\n\
                   1,t1,accept,\n\
                   2,t1,confirm_arrival,\n\
                   1,t1,activate_charging,\n\
                   2,t1,confirm_charging_started,\n\
                   2,t1,finish_charging,\n\
                   2,t1,attach_photo,meter.jpg\n\
                   2,t1,declare_kwh,12.345\n\
                   2,t2,request,ann-1\n";
        let engine = make_engine();
        let replay = replay_actions(&engine, Cursor::new(csv)).unwrap();

        let mut output = Vec::new();
        write_transactions(&engine, &replay, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(
            lines[0],
            "label,transaction,status,seller,buyer,retries,billed_kwh,price_per_kwh,total,issues"
        );
        // 12.345 * 0.35 = 4.32075
        assert!(lines[1].starts_with("t1,"));
        assert!(lines[1].contains(",kwh_declared,1,2,0,12.345,0.35,4.32,0"));
        assert!(lines[2].contains(",pending_seller,1,2,0,,,,0"));
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }
}
