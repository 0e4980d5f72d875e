mod availability;
mod commitment;
mod cycle;
mod directory;
mod error;
mod events;
mod membership;
mod resolution;
mod retry;
mod store;

pub use availability::{common_spans, merge_overlapping, subtract_intervals};
pub use commitment::{text_of_clashes, ClonedCommitment, CommitmentOverrides};
pub use directory::NewGroup;
pub use error::EngineError;
pub use resolution::Resolver;
pub use retry::with_optimistic_retry;
pub use store::{GroupState, Ledger};

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info};
use ulid::Ulid;

use crate::config::{SchedulerConfig, Settings};
use crate::model::*;
use crate::wal::Wal;

pub type SharedCycle = Arc<RwLock<Cycle>>;

// ── Group-commit WAL channel ─────────────────────────────

/// One transaction's records travel as a single `Append`.
pub(super) enum WalCommand {
    Append {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Record>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Waits for one Append, drains whatever else is already queued, then
/// fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { records, response } = cmd else {
            handle_command(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(records, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { records, response }) => batch.push((records, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .flat_map(|(records, _)| records)
        .try_for_each(|record| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = result {
        // Callers in a failed batch never apply, so nothing from it may reach replay.
        if let Err(rollback_err) = wal.rollback(mark) {
            error!("WAL rollback after failed batch: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { records, response } => {
            let batch = vec![(records, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

pub struct Engine {
    pub(super) ledger: RwLock<Ledger>,
    pub(super) cycles: DashMap<Ulid, SharedCycle>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    settings: Settings,
}

impl Engine {
    /// Replay the WAL named by `config` and start the background writer.
    /// Must be called from inside a tokio runtime.
    pub fn open(config: SchedulerConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.wal_path();
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut ledger = Ledger::new();
        let cycles = DashMap::new();
        for record in &records {
            match record {
                Record::CycleSaved(cycle) => {
                    cycles.insert(cycle.id, Arc::new(RwLock::new(cycle.clone())));
                }
                Record::CycleDeleted { id } => {
                    cycles.remove(id);
                }
                other => ledger.apply(other),
            }
        }
        info!(records = records.len(), path = %wal_path.display(), "ledger replayed");

        Ok(Self {
            ledger: RwLock::new(ledger),
            cycles,
            wal_tx,
            settings: Settings::new(config),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Write records to the WAL through the group-commit writer.
    pub(super) async fn wal_append(&self, records: Vec<Record>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, with the caller holding the ledger write guard.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut Ledger,
        records: Vec<Record>,
    ) -> Result<(), EngineError> {
        self.wal_append(records.clone()).await?;
        for record in &records {
            ledger.apply(record);
        }
        Ok(())
    }

    pub(super) fn resolver<'a>(&self, ledger: &'a Ledger) -> Resolver<'a> {
        Resolver::new(ledger, self.settings.current().max_group_depth)
    }

    // ── Group resolution ─────────────────────────────────

    pub async fn members(
        &self,
        group_id: Ulid,
        date: Option<NaiveDate>,
        recurse: bool,
        exclude_groups: bool,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let started = std::time::Instant::now();
        let ledger = self.ledger.read().await;
        let result = self
            .resolver(&ledger)
            .members(group_id, date, recurse, exclude_groups);
        metrics::histogram!(crate::observability::RESOLUTION_DURATION_SECONDS, "query" => "members")
            .record(started.elapsed().as_secs_f64());
        result
    }

    pub async fn is_member(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<bool, EngineError> {
        let ledger = self.ledger.read().await;
        self.resolver(&ledger).is_member(group_id, element_id, date)
    }

    pub async fn parents_for(
        &self,
        group_id: Ulid,
        element_id: Ulid,
        date: NaiveDate,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let started = std::time::Instant::now();
        let ledger = self.ledger.read().await;
        let result = self.resolver(&ledger).parents_for(group_id, element_id, date);
        metrics::histogram!(crate::observability::RESOLUTION_DURATION_SECONDS, "query" => "parents_for")
            .record(started.elapsed().as_secs_f64());
        result
    }

    pub async fn groups_for(
        &self,
        element_id: Ulid,
        date: NaiveDate,
        recurse: bool,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        let ledger = self.ledger.read().await;
        ledger
            .element(&element_id)
            .ok_or(EngineError::NotFound(element_id))?;
        self.resolver(&ledger).groups_for(element_id, date, recurse)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal record set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // The write guard keeps ledger and cycle writers out until the swap is done.
        let ledger = self.ledger.write().await;
        let mut records = ledger.snapshot();

        let shared: Vec<SharedCycle> = self.cycles.iter().map(|e| e.value().clone()).collect();
        let mut cycles = Vec::with_capacity(shared.len());
        for cycle in shared {
            cycles.push(cycle.read().await.clone());
        }
        cycles.sort_by_key(|c| c.id);
        records.extend(cycles.into_iter().map(Record::CycleSaved));

        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(ledger);
        info!(records = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
