//! Outgoing transaction construction: input selection, ring assembly and fee estimation.
//!
//! The constructor reads committed wallet state only, so it may run while blocks are being
//! applied. It never signs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use wallet3_config::{ConstructionConfig, SelectionPolicy};

use crate::decoys::DecoySelector;
use crate::error::{ConstructionError, DaemonError, DecoyError};
use crate::interface::{DaemonComms, WalletStorage};
use crate::keys::Address;
use crate::primitives::{DecoyOutput, Output};

use self::fees::{FeeParameters, TxShape};
use self::pending::{PendingTransaction, Ring, RingMember, TxDestination};

pub mod fees;
pub mod pending;

/// Rounds of decoy sampling per ring before giving up on locked or missing decoys
const MAX_DECOY_FETCH_ATTEMPTS: usize = 3;

/// Builds [`PendingTransaction`]s from the wallet's spendable outputs
#[derive(Debug)]
pub struct TransactionConstructor<S, D> {
    storage: Arc<S>,
    daemon: Arc<D>,
    decoy_selector: DecoySelector,
    blacklist: HashSet<u64>,
    fee_parameters: FeeParameters,
    config: ConstructionConfig,
}

impl<S, D> TransactionConstructor<S, D>
where
    S: WalletStorage,
    D: DaemonComms,
{
    /// Creates a constructor. Fee parameters are read from the daemon once, here, and are not
    /// refreshed by later builds; see [`TransactionConstructor::refresh_fee_parameters`].
    pub async fn new(
        storage: Arc<S>,
        daemon: Arc<D>,
        config: ConstructionConfig,
    ) -> Result<Self, ConstructionError> {
        let (fee_parameters, output_count) =
            futures::try_join!(daemon.get_fee_parameters(), daemon.get_output_count())?;
        tracing::info!(
            "Fee parameters: {} per byte, {} per output",
            fee_parameters.fee_per_byte,
            fee_parameters.fee_per_output
        );

        Ok(Self {
            storage,
            daemon,
            decoy_selector: DecoySelector::from_output_count(output_count),
            blacklist: HashSet::new(),
            fee_parameters,
            config,
        })
    }

    /// Fee rates in use
    pub fn fee_parameters(&self) -> FeeParameters {
        self.fee_parameters
    }

    /// Rereads the fee rates from the daemon
    pub async fn refresh_fee_parameters(&mut self) -> Result<FeeParameters, ConstructionError> {
        self.fee_parameters = self.daemon.get_fee_parameters().await?;
        Ok(self.fee_parameters)
    }

    /// The decoy selector and its current bound
    pub fn decoy_selector(&self) -> &DecoySelector {
        &self.decoy_selector
    }

    /// Builds a transaction paying `recipients`, with the remainder sent to `change`.
    ///
    /// The decoy range and the output blacklist are refreshed from the daemon first.
    pub async fn create_transaction(
        &mut self,
        recipients: Vec<TxDestination>,
        change: Address,
    ) -> Result<PendingTransaction, ConstructionError> {
        validate_recipients(&recipients)?;

        let (output_count, blacklist) = futures::try_join!(
            self.daemon.get_output_count(),
            self.daemon.get_output_blacklist()
        )?;
        self.decoy_selector.update_output_count(output_count);
        self.blacklist = blacklist.into_iter().collect();

        let mut ptx = PendingTransaction::new(recipients, change);
        self.select_inputs(&mut ptx)?;
        self.select_and_fetch_decoys(&mut ptx).await?;
        self.select_inputs_and_finalise(&mut ptx).await?;

        tracing::info!(
            "Built transaction with {} inputs paying {} plus fee {}, change {}",
            ptx.chosen_outputs().len(),
            ptx.sum_recipients(),
            ptx.fee(),
            ptx.change_amount()
        );
        Ok(ptx)
    }

    /// Adds spendable outputs, in policy order, until they cover the destinations and the
    /// estimated fee.
    pub fn select_inputs(&self, ptx: &mut PendingTransaction) -> Result<(), ConstructionError> {
        self.add_inputs(ptx, 0)
    }

    fn add_inputs(
        &self,
        ptx: &mut PendingTransaction,
        minimum_fee: u64,
    ) -> Result<(), ConstructionError> {
        let height = self.storage.last_scan_height()?;
        let chosen: HashSet<_> = ptx
            .chosen_outputs()
            .iter()
            .map(Output::key_image)
            .collect();
        let mut candidates: Vec<Output> = self
            .storage
            .available_outputs(height)?
            .into_iter()
            .filter(|output| !chosen.contains(&output.key_image()))
            .collect();
        sort_by_policy(&mut candidates, self.config.selection_policy);
        let mut candidates = candidates.into_iter();

        loop {
            let required = ptx
                .sum_recipients()
                .saturating_add(self.estimate_fee(ptx).max(minimum_fee));
            if ptx.sum_inputs() >= required {
                tracing::debug!(
                    "Selected {} inputs worth {} for {}",
                    ptx.chosen_outputs().len(),
                    ptx.sum_inputs(),
                    required
                );
                return Ok(());
            }
            match candidates.next() {
                Some(output) => ptx.push_input(output),
                None => {
                    return Err(ConstructionError::InsufficientFunds {
                        available: ptx.sum_inputs(),
                        required,
                    })
                }
            }
        }
    }

    /// Fetches a ring for every chosen input that has none yet. Rings are fetched concurrently.
    pub async fn select_and_fetch_decoys(
        &self,
        ptx: &mut PendingTransaction,
    ) -> Result<(), ConstructionError> {
        let mut exclude = self.blacklist.clone();
        exclude.extend(ptx.chosen_outputs().iter().map(Output::global_index));

        let inputs = ptx.inputs_without_ring().to_vec();
        let rings =
            try_join_all(inputs.iter().map(|input| self.fetch_ring(input, &exclude))).await?;
        ptx.push_rings(rings);
        Ok(())
    }

    async fn fetch_ring(
        &self,
        input: &Output,
        exclude: &HashSet<u64>,
    ) -> Result<Ring, ConstructionError> {
        let decoy_count = self.config.ring_size.saturating_sub(1);
        let mut exclude = exclude.clone();
        let mut decoys: BTreeMap<u64, DecoyOutput> = BTreeMap::new();
        let mut real = None;

        for _ in 0..MAX_DECOY_FETCH_ATTEMPTS {
            if decoys.len() == decoy_count && real.is_some() {
                break;
            }
            let picks = self
                .decoy_selector
                .select(decoy_count - decoys.len(), &exclude)?;
            let mut request: Vec<u64> = picks.iter().copied().collect();
            if real.is_none() {
                request.push(input.global_index());
            }
            let fetched = self.daemon.get_outputs(request).await?;
            exclude.extend(picks.iter().copied());

            for output in fetched {
                if output.global_index() == input.global_index() {
                    real = Some(output);
                } else if !picks.contains(&output.global_index()) {
                    tracing::warn!("Daemon returned unrequested output {}", output.global_index());
                } else if output.unlocked() {
                    decoys.insert(output.global_index(), output);
                } else {
                    tracing::debug!("Dropping locked decoy {}", output.global_index());
                }
            }
        }

        let real = real.ok_or(DaemonError::MissingOutputs {
            requested: 1,
            returned: 0,
        })?;
        if decoys.len() < decoy_count {
            return Err(DecoyError::NoDecoysAvailable {
                requested: decoy_count,
                excluded: exclude.len(),
                universe: self.decoy_selector.universe(),
            }
            .into());
        }

        let real = RingMember {
            key: input.key(),
            ..RingMember::from(real)
        };
        Ok(Ring::new(real, decoys.into_values().map(RingMember::from)))
    }

    /// Fee for the transaction as currently assembled. Exact ring offsets are used once every
    /// input has its ring.
    pub fn estimate_fee(&self, ptx: &PendingTransaction) -> u64 {
        let inputs = ptx.chosen_outputs().len();
        let key_offset_bytes = (ptx.rings().len() == inputs)
            .then(|| ptx.rings().iter().map(Ring::key_offset_bytes).sum());
        self.fee_parameters.fee(&TxShape {
            inputs,
            ring_size: self.config.ring_size,
            key_offset_bytes,
            outputs: ptx.output_count(),
            subaddress_destination: ptx.has_subaddress_destination(),
        })
    }

    /// Checks the fee still fits once the rings are attached, selecting more inputs (and their
    /// rings) when it does not. Fails when the fee is still not covered after
    /// `max_finalise_attempts` rounds of selection.
    ///
    /// An earlier ring using a newly selected input as a decoy is fetched again.
    pub async fn select_inputs_and_finalise(
        &self,
        ptx: &mut PendingTransaction,
    ) -> Result<(), ConstructionError> {
        let max_attempts = self.config.max_finalise_attempts;
        for attempt in 0..=max_attempts {
            if !ptx.inputs_without_ring().is_empty() {
                self.select_and_fetch_decoys(ptx).await?;
            }
            let fee = self.estimate_fee(ptx);
            if ptx.sum_inputs() >= ptx.sum_recipients().saturating_add(fee) {
                ptx.finalise(fee);
                return Ok(());
            }
            if attempt == max_attempts {
                break;
            }
            tracing::debug!(
                "Fee {} not covered by inputs after attempt {}, selecting more",
                fee,
                attempt
            );

            let already_chosen = ptx.chosen_outputs().len();
            self.add_inputs(ptx, fee)?;
            let added: HashSet<u64> = ptx.chosen_outputs()[already_chosen..]
                .iter()
                .map(Output::global_index)
                .collect();
            let dropped = ptx.discard_rings_using(&added);
            if dropped > 0 {
                tracing::debug!("Refetching {} rings that used a new input as decoy", dropped);
            }
        }

        Err(ConstructionError::FeeEstimationFailed {
            attempts: max_attempts,
        })
    }
}

fn validate_recipients(recipients: &[TxDestination]) -> Result<(), ConstructionError> {
    if recipients.is_empty() {
        return Err(ConstructionError::InvalidDestinations(
            "no recipients".to_string(),
        ));
    }
    if recipients.iter().any(|recipient| recipient.amount == 0) {
        return Err(ConstructionError::InvalidDestinations(
            "zero amount".to_string(),
        ));
    }
    recipients
        .iter()
        .try_fold(0u64, |sum, recipient| sum.checked_add(recipient.amount))
        .ok_or_else(|| ConstructionError::InvalidDestinations("amounts overflow".to_string()))?;
    Ok(())
}

fn sort_by_policy(outputs: &mut [Output], policy: SelectionPolicy) {
    match policy {
        SelectionPolicy::LargestFirst => outputs.sort_by_key(|output| {
            (
                Reverse(output.amount()),
                output.block_height(),
                output.global_index(),
            )
        }),
        SelectionPolicy::OldestFirst => outputs.sort_by_key(|output| {
            (
                output.block_height(),
                Reverse(output.amount()),
                output.global_index(),
            )
        }),
    }
}
