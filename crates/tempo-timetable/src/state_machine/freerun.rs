use std::sync::Arc;

use tracing::{error, info, warn, Level};

use tempo_core::config::{FreerunConfig, TempoConfig};
use tempo_core::time::actual_timeperiod;
use tempo_core::{Clock, Qualifier};
use tempo_store::{
    FreerunEntry, MqTransmission, Store, StoreError, UnitOfWork, UowState, UowType,
};

use crate::error::{Result, TimetableError};
use crate::publisher::Publisher;

/// Timer-driven lane outside the timeperiod trees.
///
/// Each `(process, entry)` pair keeps at most one unit of work in flight;
/// a finished one is replaced on the next trigger.
pub struct FreerunStateMachine {
    config: Arc<TempoConfig>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    clock: Clock,
}

impl FreerunStateMachine {
    pub fn new(
        config: Arc<TempoConfig>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            store,
            publisher,
            clock,
        }
    }

    /// Persisted companion of `freerun`, created on first use.
    pub fn entry(&self, freerun: &FreerunConfig) -> Result<FreerunEntry> {
        match self.store.get_freerun(&freerun.process_name, &freerun.entry_name) {
            Ok(mut entry) => {
                entry.arguments = freerun.arguments.clone();
                Ok(entry)
            }
            Err(e) if e.is_not_found() => {
                let mut entry = FreerunEntry::new(
                    &freerun.process_name,
                    &freerun.entry_name,
                    freerun.arguments.clone(),
                );
                entry.id = Some(self.store.update_freerun(&entry)?);
                info!(entry = %entry.schedulable_name(), "registered freerun entry");
                Ok(entry)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One trigger of the lane: start, republish or replace its unit of work.
    pub fn manage_schedulable(&self, freerun: &FreerunConfig) -> Result<()> {
        let mut entry = self.entry(freerun)?;
        match self.related_uow(&mut entry)? {
            None => self.insert_and_publish_uow(&mut entry),
            Some(uow) if matches!(uow.state, UowState::Requested | UowState::InProgress) => {
                self.publish(&uow)?;
                let message = format!("Re-published unit of work {} [{}]", uow.key(), uow.state);
                self.log_message(&mut entry, Level::INFO, message)
            }
            Some(uow) => {
                let message = format!(
                    "Unit of work {} is {}; scheduling a new one",
                    uow.key(),
                    uow.state
                );
                self.log_message(&mut entry, Level::INFO, message)?;
                self.insert_and_publish_uow(&mut entry)
            }
        }
    }

    /// Cancel the entry's unit of work if it has not finished.
    pub fn cancel_uow(&self, freerun: &FreerunConfig) -> Result<()> {
        let mut entry = self.entry(freerun)?;
        let Some(mut uow) = self.related_uow(&mut entry)? else {
            return Ok(());
        };
        if uow.is_finished() {
            return Ok(());
        }
        uow.state = UowState::Canceled;
        uow.finished_at = Some(self.clock.now());
        self.store.update_uow(&uow)?;
        let message = format!("Canceled unit of work {}", uow.key());
        self.log_message(&mut entry, Level::INFO, message)
    }

    fn related_uow(&self, entry: &mut FreerunEntry) -> Result<Option<UnitOfWork>> {
        let Some(id) = entry.related_unit_of_work else {
            return Ok(None);
        };
        match self.store.get_uow(id) {
            Ok(uow) => Ok(Some(uow)),
            Err(e) if e.is_not_found() => {
                let message = format!("Related unit of work {id} is gone; starting afresh");
                self.log_message(entry, Level::WARN, message)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn insert_and_publish_uow(&self, entry: &mut FreerunEntry) -> Result<()> {
        let process = self.config.process(&entry.process_name)?;
        let now = self.clock.now();
        let timeperiod = actual_timeperiod(Qualifier::RealTime, now);
        let mut arguments = process.arguments.clone();
        arguments.extend(entry.arguments.clone());

        let mut uow = UnitOfWork {
            id: None,
            process_name: entry.schedulable_name(),
            timeperiod: timeperiod.clone(),
            start_timeperiod: timeperiod.clone(),
            end_timeperiod: timeperiod,
            start_id: "0".to_string(),
            end_id: "0".to_string(),
            source: process.source.clone(),
            sink: process.sink.clone(),
            arguments,
            state: UowState::Requested,
            created_at: now,
            submitted_at: Some(now),
            started_at: None,
            finished_at: None,
            number_of_retries: 0,
            uow_type: UowType::Freerun,
        };

        match self.store.insert_uow(&uow) {
            Ok(id) => uow.id = Some(id),
            Err(StoreError::DuplicateKey { .. }) => {
                warn!(
                    entry = %uow.process_name,
                    timeperiod = %uow.timeperiod,
                    "Catching up with latest unit of work"
                );
                match self
                    .store
                    .get_uow_by_params(&uow.process_name, &uow.timeperiod, "0", "0")
                {
                    Ok(existing) => uow = existing,
                    Err(e) if e.is_not_found() => {
                        let message = format!(
                            "PERSISTENT TIER ERROR! Unable to locate unit of work for {}@{}",
                            uow.process_name, uow.timeperiod
                        );
                        self.log_message(entry, Level::ERROR, message)?;
                        return Err(TimetableError::ManualIntervention {
                            process_name: uow.process_name,
                            timeperiod: uow.timeperiod,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        entry.related_unit_of_work = uow.id;
        entry.id = Some(self.store.update_freerun(entry)?);
        self.publish(&uow)?;
        let message = format!("Published unit of work {} for {}", uow.key(), uow.timeperiod);
        self.log_message(entry, Level::INFO, message)
    }

    fn publish(&self, uow: &UnitOfWork) -> Result<()> {
        let Some(unit_of_work_id) = uow.id else {
            return Err(TimetableError::Dispatch(format!(
                "unit of work for {} has no id",
                uow.process_name
            )));
        };
        let (process_name, entry_name) = match uow.process_name.split_once("::") {
            Some((process, entry)) => (process.to_string(), Some(entry.to_string())),
            None => (uow.process_name.clone(), None),
        };
        self.publisher.publish(&MqTransmission {
            process_name,
            entry_name,
            unit_of_work_id,
        })
    }

    /// Log and persist the message on the entry.
    fn log_message(&self, entry: &mut FreerunEntry, level: Level, message: String) -> Result<()> {
        let name = entry.schedulable_name();
        match level {
            Level::ERROR => error!(entry = %name, "{message}"),
            Level::WARN => warn!(entry = %name, "{message}"),
            _ => info!(entry = %name, "{message}"),
        }
        let stamp = self.clock.now().format("%Y-%m-%d %H:%M:%S");
        entry.add_log_entry(format!("{stamp} {message}"));
        entry.id = Some(self.store.update_freerun(entry)?);
        Ok(())
    }
}
