//! Transaction under construction, handed to the signer once finalized.

use std::collections::HashSet;

use getset::{CopyGetters, Getters};

use crate::keys::{write_varint, Address};
use crate::primitives::{DecoyOutput, Output};

/// Address and amount to pay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDestination {
    /// Receiving address
    pub address: Address,
    /// Amount paid
    pub amount: u64,
}

impl TxDestination {
    /// Creates new TxDestination from parts
    pub fn new(address: Address, amount: u64) -> Self {
        Self { address, amount }
    }
}

/// Progress of a [`PendingTransaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConstructionStage {
    /// Inputs cover the destinations and estimated fee
    InputsSelected,
    /// Every input has its ring
    DecoysFetched,
    /// Fee and change are fixed, ready for signing
    Finalized,
}

/// Public data of a ring member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingMember {
    /// Global output index
    pub global_index: u64,
    /// One-time public key
    pub key: [u8; 32],
    /// Amount commitment
    pub mask: [u8; 32],
}

impl From<DecoyOutput> for RingMember {
    fn from(output: DecoyOutput) -> Self {
        Self {
            global_index: output.global_index(),
            key: output.key(),
            mask: output.mask(),
        }
    }
}

/// Ring of one input, ordered by global index
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Ring {
    /// Members ordered by global index
    #[getset(get = "pub")]
    members: Vec<RingMember>,
    /// Position of the real output within `members`
    #[getset(get_copy = "pub")]
    real_position: usize,
}

impl Ring {
    /// Builds the ring from the real output and its decoys. A decoy sharing the real output's
    /// global index is dropped, as are repeated decoys.
    pub fn new(real: RingMember, decoys: impl IntoIterator<Item = RingMember>) -> Self {
        let mut members: Vec<RingMember> = decoys
            .into_iter()
            .filter(|decoy| decoy.global_index != real.global_index)
            .collect();
        members.sort_by_key(|member| member.global_index);
        members.dedup_by_key(|member| member.global_index);

        let real_position =
            members.partition_point(|member| member.global_index < real.global_index);
        members.insert(real_position, real);
        Self {
            members,
            real_position,
        }
    }

    /// Global indices of the decoys
    pub fn decoy_indices(&self) -> Vec<u64> {
        self.members
            .iter()
            .enumerate()
            .filter(|(position, _)| *position != self.real_position)
            .map(|(_, member)| member.global_index)
            .collect()
    }

    /// Indices as serialized: the first absolute, each next relative to the previous
    pub fn key_offsets(&self) -> Vec<u64> {
        let mut previous = 0;
        self.members
            .iter()
            .map(|member| {
                let offset = member.global_index - previous;
                previous = member.global_index;
                offset
            })
            .collect()
    }

    /// Encoded size of the key offsets
    pub fn key_offset_bytes(&self) -> usize {
        let mut encoded = Vec::new();
        for offset in self.key_offsets() {
            write_varint(offset, &mut encoded);
        }
        encoded.len()
    }
}

/// A transaction being built by the [`crate::construct::TransactionConstructor`]
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct PendingTransaction {
    /// Destinations paid
    #[getset(get = "pub")]
    recipients: Vec<TxDestination>,
    /// Address receiving the change
    #[getset(get_copy = "pub")]
    change: Address,
    /// Owned outputs spent by the transaction
    #[getset(get = "pub")]
    chosen_outputs: Vec<Output>,
    /// One ring per chosen output, in the same order
    #[getset(get = "pub")]
    rings: Vec<Ring>,
    /// Final fee, zero until finalized
    #[getset(get_copy = "pub")]
    fee: u64,
    /// Inputs minus destinations and fee, zero until finalized
    #[getset(get_copy = "pub")]
    change_amount: u64,
    #[getset(get_copy = "pub")]
    stage: ConstructionStage,
}

impl PendingTransaction {
    pub(crate) fn new(recipients: Vec<TxDestination>, change: Address) -> Self {
        Self {
            recipients,
            change,
            chosen_outputs: Vec::new(),
            rings: Vec::new(),
            fee: 0,
            change_amount: 0,
            stage: ConstructionStage::InputsSelected,
        }
    }

    /// Sum of the destination amounts
    pub fn sum_recipients(&self) -> u64 {
        self.recipients
            .iter()
            .fold(0u64, |sum, recipient| sum.saturating_add(recipient.amount))
    }

    /// Sum of the chosen inputs
    pub fn sum_inputs(&self) -> u64 {
        self.chosen_outputs
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.amount()))
    }

    /// Outputs the transaction creates, change included
    pub fn output_count(&self) -> usize {
        self.recipients.len() + 1
    }

    /// Returns true if any destination, change included, is a subaddress
    pub fn has_subaddress_destination(&self) -> bool {
        self.change.is_subaddress
            || self
                .recipients
                .iter()
                .any(|recipient| recipient.address.is_subaddress)
    }

    /// Decoy index set of every input
    pub fn decoy_indices(&self) -> Vec<Vec<u64>> {
        self.rings.iter().map(Ring::decoy_indices).collect()
    }

    /// Change destination with its final amount
    pub fn change_destination(&self) -> TxDestination {
        TxDestination::new(self.change, self.change_amount)
    }

    pub(crate) fn push_input(&mut self, output: Output) {
        self.chosen_outputs.push(output);
        self.stage = ConstructionStage::InputsSelected;
    }

    /// Chosen outputs still waiting for a ring
    pub(crate) fn inputs_without_ring(&self) -> &[Output] {
        &self.chosen_outputs[self.rings.len()..]
    }

    /// Drops the first ring using any of `indices` as a decoy along with every ring after it,
    /// leaving their inputs without a ring. Returns the number of rings dropped.
    pub(crate) fn discard_rings_using(&mut self, indices: &HashSet<u64>) -> usize {
        let Some(first) = self.rings.iter().position(|ring| {
            ring.decoy_indices()
                .iter()
                .any(|index| indices.contains(index))
        }) else {
            return 0;
        };
        let dropped = self.rings.len() - first;
        self.rings.truncate(first);
        self.stage = ConstructionStage::InputsSelected;
        dropped
    }

    pub(crate) fn push_rings(&mut self, rings: Vec<Ring>) {
        self.rings.extend(rings);
        if self.rings.len() == self.chosen_outputs.len() {
            self.stage = ConstructionStage::DecoysFetched;
        }
    }

    pub(crate) fn finalise(&mut self, fee: u64) {
        self.fee = fee;
        self.change_amount = self
            .sum_inputs()
            .saturating_sub(self.sum_recipients())
            .saturating_sub(fee);
        self.stage = ConstructionStage::Finalized;
    }
}
