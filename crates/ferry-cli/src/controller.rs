//! Transfer scheduler.
//!
//! The controller periodically scans the database for client transfers that
//! are due (planned ones whose start date has passed, failed or interrupted
//! ones whose retry date has passed) and starts them, within the limits of
//! the registry. It also fails the server transfers a partner never came to
//! fetch.

use ferry_core::{
    Transfer, TransferColumn, TransferError, TransferErrorCode, TransferStatus, TransferStep,
};
use ferry_pipeline::{ClientPipeline, Pipeline, Services};
use std::time::Duration;

/// Scheduler of client transfers
#[derive(Debug, Clone)]
pub struct Controller {
    services: Services,
}

/// Claimed row, with its state before the claim
struct Claim {
    before: Transfer,
    claimed: Transfer,
}

fn is_due(trans: &Transfer, now: u64) -> bool {
    if trans.is_server() {
        return false;
    }
    match trans.status {
        TransferStatus::Planned => trans.start <= now,
        TransferStatus::Interrupted | TransferStatus::Error => {
            trans.next_retry.is_some_and(|at| at <= now)
        }
        _ => false,
    }
}

fn is_expired(trans: &Transfer, now: u64) -> bool {
    trans.is_server() && trans.status == TransferStatus::Available && trans.start <= now
}

impl Controller {
    /// Create a controller
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Mark the transfers left running by a previous process as interrupted,
    /// so that they are resumed at the next tick. Those stopped while running
    /// their error-tasks have no checkpoint to resume from and are failed.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be updated.
    pub fn recover(&self, now: u64) -> anyhow::Result<usize> {
        let registry = &self.services.registry;
        let mut recovered = 0;

        self.services.store.transaction(&mut |session| {
            recovered = 0;
            let orphans = session.select_for_update(
                &|t| t.status == TransferStatus::Running && !registry.exists(t.id),
                None,
            )?;
            for mut trans in orphans {
                if trans.step == TransferStep::ErrorTasks {
                    trans.status = TransferStatus::Error;
                    trans.next_retry = None;
                    trans.error = TransferError::new(
                        TransferErrorCode::Internal,
                        "the transfer was interrupted during its error-tasks",
                    );
                    session.update(
                        &trans,
                        &[
                            TransferColumn::Status,
                            TransferColumn::Retry,
                            TransferColumn::Error,
                        ],
                    )?;
                    tracing::warn!(
                        transfer_id = trans.id,
                        "Transfer stopped during its error-tasks cannot be resumed"
                    );
                    continue;
                }
                trans.status = TransferStatus::Interrupted;
                trans.next_retry = Some(now);
                session.update(&trans, &[TransferColumn::Status, TransferColumn::Retry])?;
                recovered += 1;
            }
            Ok(())
        })?;

        if recovered > 0 {
            tracing::info!(count = recovered, "Interrupted transfers will be resumed");
        }
        Ok(recovered)
    }

    /// Claim the due client transfers, and return their pipelines ready to
    /// be run. Expired server transfers are failed on the way.
    pub fn tick(&self, now: u64) -> Vec<ClientPipeline> {
        let pipelines = self.start_client_transfers(now);
        self.expire_server_transfers(now);
        pipelines
    }

    fn start_client_transfers(&self, now: u64) -> Vec<ClientPipeline> {
        let claims = match self.claim(
            self.services.registry.available_client(),
            |t| is_due(t, now),
            |trans| {
                trans.next_retry = None;
                trans.remaining_tries = trans.remaining_tries.saturating_sub(1);
            },
        ) {
            Ok(claims) => claims,
            Err(err) => {
                tracing::error!("Failed to retrieve the transfers to run: {}", err);
                return Vec::new();
            }
        };

        let mut pipelines = Vec::with_capacity(claims.len());
        for claim in claims {
            let id = claim.claimed.id;
            match ClientPipeline::new(&self.services, claim.claimed) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(err) if err.code() == TransferErrorCode::ExceededLimit => {
                    tracing::debug!(transfer_id = id, "Transfer postponed: {}", err);
                    self.release(&claim.before);
                }
                Err(err) => {
                    tracing::error!(transfer_id = id, "Failed to start the transfer: {}", err);
                }
            }
        }

        pipelines
    }

    fn expire_server_transfers(&self, now: u64) {
        let claims = match self.claim(
            self.services.registry.available_server(),
            |t| is_expired(t, now),
            |_| {},
        ) {
            Ok(claims) => claims,
            Err(err) => {
                tracing::error!("Failed to retrieve expired transfers: {}", err);
                return;
            }
        };

        for claim in claims {
            let id = claim.claimed.id;
            match Pipeline::new_server(&self.services, claim.claimed) {
                Ok(pipeline) => pipeline.set_error(TransferErrorCode::Unknown, "transfer expired"),
                Err(err) if err.code() == TransferErrorCode::ExceededLimit => {
                    self.release(&claim.before);
                }
                Err(err) => {
                    tracing::error!(transfer_id = id, "Failed to expire the transfer: {}", err);
                }
            }
        }
    }

    /// Mark up to `limit` matching rows as running in a single transaction
    fn claim(
        &self,
        limit: Option<u64>,
        filter: impl Fn(&Transfer) -> bool,
        update: impl Fn(&mut Transfer),
    ) -> ferry_core::Result<Vec<Claim>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let limit = limit.map(|n| usize::try_from(n).unwrap_or(usize::MAX));

        let mut claims = Vec::new();
        self.services.store.transaction(&mut |session| {
            claims.clear();
            for before in session.select_for_update(&filter, limit)? {
                let mut claimed = before.clone();
                claimed.status = TransferStatus::Running;
                update(&mut claimed);
                session.update(&claimed, &[TransferColumn::Status, TransferColumn::Retry])?;
                claims.push(Claim { before, claimed });
            }
            Ok(())
        })?;

        Ok(claims)
    }

    /// Give back a claimed row that could not be started
    fn release(&self, before: &Transfer) {
        if let Err(err) = self
            .services
            .store
            .update_transfer(before, &[TransferColumn::Status, TransferColumn::Retry])
        {
            tracing::error!(
                transfer_id = before.id,
                "Failed to release the transfer: {}",
                err
            );
        }
    }

    /// Interrupt every running client transfer, giving each partner
    /// `deadline` to acknowledge
    pub fn interrupt_all(&self, deadline: Duration) {
        let clients = match self.services.store.list_clients() {
            Ok(clients) => clients,
            Err(err) => {
                tracing::error!("Failed to list the protocol clients: {}", err);
                return;
            }
        };
        for client in clients {
            let stopped = self
                .services
                .registry
                .stop_all_from_client(client.id, deadline);
            if let Err(err) = stopped {
                tracing::warn!(client = %client.name, "Failed to interrupt transfers: {}", err);
            }
        }
    }
}

/// Run one claimed transfer to its end
pub fn run_pipeline(pipeline: &ClientPipeline) {
    let id = pipeline.pipeline().transfer_id();
    if let Err(err) = pipeline.run() {
        tracing::error!(transfer_id = id, "Transfer failed: {}", err);
    }
}
