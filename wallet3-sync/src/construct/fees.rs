//! Fee calculation
//!
//! Fees are `fee_per_byte × estimated size + fee_per_output × outputs`. The size estimate
//! follows the layout of a RingCT transaction with CLSAG rings and a single aggregated
//! bulletproof covering every output.

/// Default fee per serialized byte
pub const FEE_PER_BYTE: u64 = 215;
/// Default fee per created output
pub const FEE_PER_OUTPUT: u64 = 5_000_000;

/// Fee rates reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeParameters {
    /// Fee per serialized byte
    pub fee_per_byte: u64,
    /// Fee per created output
    pub fee_per_output: u64,
}

impl Default for FeeParameters {
    fn default() -> Self {
        Self {
            fee_per_byte: FEE_PER_BYTE,
            fee_per_output: FEE_PER_OUTPUT,
        }
    }
}

impl FeeParameters {
    /// Fee for a transaction of the given shape
    pub fn fee(&self, shape: &TxShape) -> u64 {
        self.fee_per_byte
            .saturating_mul(shape.estimated_size() as u64)
            .saturating_add(self.fee_per_output.saturating_mul(shape.outputs as u64))
    }
}

/// The parts of a transaction its serialized size depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxShape {
    /// Number of inputs
    pub inputs: usize,
    /// Members per ring, the real output included
    pub ring_size: usize,
    /// Exact encoded size of every ring's relative key offsets, once the rings are known.
    /// Estimated at two bytes per member otherwise.
    pub key_offset_bytes: Option<usize>,
    /// Number of outputs, change included
    pub outputs: usize,
    /// A destination is a subaddress, which needs a tx public key per output
    pub subaddress_destination: bool,
}

impl TxShape {
    /// Size in bytes of the tx extra field
    pub fn extra_size(&self) -> usize {
        // tag + tx public key
        let mut size = 1 + 32;
        if self.subaddress_destination {
            // tag + count + per-output keys
            size += 1 + 1 + 32 * self.outputs;
        }
        size
    }

    /// Estimated serialized size in bytes
    pub fn estimated_size(&self) -> usize {
        let key_offset_bytes = self
            .key_offset_bytes
            .unwrap_or(self.inputs * self.ring_size * 2);

        // version and unlock time
        let mut size = 1 + 6;
        // input tag, amount, ring member count and key image
        size += self.inputs * (1 + 6 + 1 + 32) + key_offset_bytes;
        // amount, output tag, one-time key and view tag
        size += self.outputs * (6 + 1 + 32 + 1);
        size += 1 + self.extra_size();
        // rct type
        size += 1;
        size += bulletproof_size(self.outputs);
        // clsag: s scalars, c1 and D
        size += self.inputs * (32 * self.ring_size + 64);
        // pseudo outs
        size += 32 * self.inputs;
        // ecdh amounts and output commitments
        size += (8 + 32) * self.outputs;
        // fee
        size += 4;
        size
    }
}

fn bulletproof_size(outputs: usize) -> usize {
    let log_padded_outputs = outputs.max(1).next_power_of_two().trailing_zeros() as usize;
    (2 * (6 + log_padded_outputs) + 4 + 5) * 32 + 3
}
