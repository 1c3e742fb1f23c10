//! Wallet key material and the output ownership routines.
//!
//! Ownership follows the CryptoNote one-time address scheme: a sender publishes `R = rG` (or
//! `R = rD` for a subaddress `D`) and pays to `P = Hs(8rA ‖ i)G + B`. The recipient recomputes
//! the shared secret from its private view key `a` as `8aR` and recovers `B` from `P`.

use std::collections::HashMap;

use curve25519_dalek::{
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
};
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use crate::primitives::{KeyImage, SubaddressIndex, Transaction, TxOutput};

mod hash_to_point;

pub(crate) use hash_to_point::hash_to_point;

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

pub(crate) fn hash_to_scalar(data: &[u8]) -> Scalar {
    Scalar::from_bytes_mod_order(keccak256(data))
}

pub(crate) fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn decompress(bytes: &[u8; 32]) -> Option<EdwardsPoint> {
    CompressedEdwardsY(*bytes).decompress()
}

/// Public receiving address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// Public spend key `B` (or `D` for a subaddress)
    pub spend_public: [u8; 32],
    /// Public view key `A` (or `C = aD` for a subaddress)
    pub view_public: [u8; 32],
    /// Subaddresses need `R = rD`, and an additional tx key per output
    pub is_subaddress: bool,
}

#[derive(Debug, Clone)]
struct SubaddressEntry {
    index: SubaddressIndex,
    /// `m` in `D = B + mG`; zero for the primary address
    offset: Scalar,
}

/// Errors constructing key material
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Public key bytes are not a valid curve point
    #[error("Invalid public key {0}")]
    InvalidPublicKey(String),
}

/// The wallet's private view/spend material and the spend keys of every tracked subaddress.
pub struct Keyring {
    spend_secret: Option<Zeroizing<Scalar>>,
    view_secret: Zeroizing<Scalar>,
    spend_public: EdwardsPoint,
    view_public: EdwardsPoint,
    subaddresses: HashMap<[u8; 32], SubaddressEntry>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("main_address", &self.main_address())
            .field("can_spend", &self.can_spend())
            .field("subaddresses", &self.tracked_addresses())
            .finish()
    }
}

impl Keyring {
    /// Creates a full keyring from the private spend and view keys
    pub fn new(spend_secret: Scalar, view_secret: Scalar) -> Self {
        let spend_public = EdwardsPoint::mul_base(&spend_secret);
        Self::from_parts(Some(spend_secret), spend_public, view_secret)
    }

    /// Deterministic keyring; the view key is the hash of the spend key
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let spend_secret = Scalar::from_bytes_mod_order(seed);
        let view_secret = hash_to_scalar(spend_secret.as_bytes());
        Self::new(spend_secret, view_secret)
    }

    /// Creates a view-only keyring. It detects received outputs but cannot derive key images.
    pub fn view_only(spend_public: [u8; 32], view_secret: Scalar) -> Result<Self, KeyError> {
        let spend_public = decompress(&spend_public)
            .ok_or_else(|| KeyError::InvalidPublicKey(hex::encode(spend_public)))?;
        Ok(Self::from_parts(None, spend_public, view_secret))
    }

    fn from_parts(
        spend_secret: Option<Scalar>,
        spend_public: EdwardsPoint,
        view_secret: Scalar,
    ) -> Self {
        let mut keyring = Self {
            spend_secret: spend_secret.map(Zeroizing::new),
            view_public: EdwardsPoint::mul_base(&view_secret),
            view_secret: Zeroizing::new(view_secret),
            spend_public,
            subaddresses: HashMap::new(),
        };
        keyring.subaddresses.insert(
            spend_public.compress().to_bytes(),
            SubaddressEntry {
                index: SubaddressIndex::PRIMARY,
                offset: Scalar::ZERO,
            },
        );
        keyring
    }

    /// Tracks every subaddress `(major, minor)` with `major < majors` and `minor < minors`
    pub fn with_subaddress_lookahead(mut self, majors: u32, minors: u32) -> Self {
        for major in 0..majors {
            for minor in 0..minors {
                self.add_subaddress(SubaddressIndex::new(major, minor));
            }
        }
        self
    }

    /// Tracks a single subaddress
    pub fn add_subaddress(&mut self, index: SubaddressIndex) {
        if index.is_primary() {
            return;
        }
        let offset = self.subaddress_offset(index);
        let spend_key = self.spend_public + EdwardsPoint::mul_base(&offset);
        self.subaddresses
            .insert(spend_key.compress().to_bytes(), SubaddressEntry { index, offset });
    }

    fn subaddress_offset(&self, index: SubaddressIndex) -> Scalar {
        let mut data = Zeroizing::new(Vec::with_capacity(48));
        data.extend_from_slice(b"SubAddr\0");
        data.extend_from_slice(self.view_secret.as_bytes());
        data.extend_from_slice(&index.major.to_le_bytes());
        data.extend_from_slice(&index.minor.to_le_bytes());
        hash_to_scalar(&data)
    }

    /// The primary receiving address
    pub fn main_address(&self) -> Address {
        Address {
            spend_public: self.spend_public.compress().to_bytes(),
            view_public: self.view_public.compress().to_bytes(),
            is_subaddress: false,
        }
    }

    /// Receiving address for a subaddress index
    pub fn subaddress(&self, index: SubaddressIndex) -> Address {
        if index.is_primary() {
            return self.main_address();
        }
        let spend_key = self.spend_public + EdwardsPoint::mul_base(&self.subaddress_offset(index));
        let view_key = &*self.view_secret * spend_key;
        Address {
            spend_public: spend_key.compress().to_bytes(),
            view_public: view_key.compress().to_bytes(),
            is_subaddress: true,
        }
    }

    /// Number of tracked addresses, the primary included
    pub fn tracked_addresses(&self) -> usize {
        self.subaddresses.len()
    }

    /// Returns true if the keyring holds the private spend key
    pub fn can_spend(&self) -> bool {
        self.spend_secret.is_some()
    }
}

/// An output of a transaction found to belong to the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMatch {
    /// Index of the output within the transaction
    pub output_index: u32,
    /// Decrypted amount
    pub amount: u64,
    /// One-time public key
    pub key: [u8; 32],
    /// `None` for view-only keyrings
    pub key_image: Option<KeyImage>,
    /// Subaddress the output was paid to
    pub subaddress: SubaddressIndex,
    /// Transaction public key the shared secret was derived from
    pub tx_pubkey: [u8; 32],
}

/// Maps a transaction's public outputs to the outputs owned by a keyring. Holds no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct KeyMatcher<'a> {
    keys: &'a Keyring,
}

struct Derivation {
    tx_pubkey: [u8; 32],
    shared: [u8; 32],
}

impl<'a> KeyMatcher<'a> {
    /// Creates a matcher for `keys`
    pub fn new(keys: &'a Keyring) -> Self {
        Self { keys }
    }

    /// Returns every output of `tx` paying one of the tracked addresses, in output order.
    /// Invalid points are treated as not owned.
    pub fn owned_outputs(&self, tx: &Transaction) -> Vec<OwnedMatch> {
        let primary = tx
            .extra
            .tx_pubkey
            .and_then(|tx_pubkey| self.derivation(tx_pubkey));

        tx.outputs
            .iter()
            .enumerate()
            .filter_map(|(output_index, output)| {
                let additional = tx
                    .extra
                    .additional_pubkeys
                    .get(output_index)
                    .and_then(|tx_pubkey| self.derivation(*tx_pubkey));
                primary
                    .iter()
                    .chain(additional.iter())
                    .find_map(|derivation| self.try_match(derivation, output_index, output))
            })
            .collect()
    }

    fn derivation(&self, tx_pubkey: [u8; 32]) -> Option<Derivation> {
        let point = decompress(&tx_pubkey)?;
        let shared = (&*self.keys.view_secret * point)
            .mul_by_cofactor()
            .compress()
            .to_bytes();
        Some(Derivation { tx_pubkey, shared })
    }

    fn try_match(
        &self,
        derivation: &Derivation,
        output_index: usize,
        output: &TxOutput,
    ) -> Option<OwnedMatch> {
        let secrets = OutputSecrets::new(&derivation.shared, output_index as u64);
        if let Some(view_tag) = output.view_tag {
            if view_tag != secrets.view_tag {
                return None;
            }
        }

        let output_key = decompress(&output.key)?;
        let spend_candidate = output_key - EdwardsPoint::mul_base(&secrets.shared_scalar);
        let entry = self
            .keys
            .subaddresses
            .get(&spend_candidate.compress().to_bytes())?;

        let key_image = self.keys.spend_secret.as_ref().and_then(|spend_secret| {
            let one_time_secret =
                Zeroizing::new(**spend_secret + secrets.shared_scalar + entry.offset);
            let image = &*one_time_secret * hash_to_point(&output.key)?;
            Some(KeyImage(image.compress().to_bytes()))
        });

        Some(OwnedMatch {
            output_index: output_index as u32,
            amount: secrets.decrypt_amount(output.encrypted_amount),
            key: output.key,
            key_image,
            subaddress: entry.index,
            tx_pubkey: derivation.tx_pubkey,
        })
    }
}

struct OutputSecrets {
    view_tag: u8,
    shared_scalar: Scalar,
}

impl OutputSecrets {
    fn new(shared: &[u8; 32], output_index: u64) -> Self {
        let mut derivation = Zeroizing::new(Vec::with_capacity(48));
        derivation.extend_from_slice(shared);
        write_varint(output_index, &mut derivation);

        let view_tag = keccak256(&[b"view_tag".as_slice(), derivation.as_slice()].concat())[0];

        Self {
            view_tag,
            shared_scalar: hash_to_scalar(&derivation),
        }
    }

    fn amount_mask(&self) -> u64 {
        let mut data = Zeroizing::new(b"amount".to_vec());
        data.extend_from_slice(self.shared_scalar.as_bytes());
        let hash = keccak256(&data);
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&hash[..8]);
        u64::from_le_bytes(mask)
    }

    fn encrypt_amount(&self, amount: u64) -> [u8; 8] {
        (amount ^ self.amount_mask()).to_le_bytes()
    }

    fn decrypt_amount(&self, encrypted: [u8; 8]) -> u64 {
        u64::from_le_bytes(encrypted) ^ self.amount_mask()
    }
}

/// Sender side of an output: the public output and the tx public key the recipient derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedOutput {
    /// Public output to place in the transaction
    pub output: TxOutput,
    /// `rG`, or `rD` for a subaddress
    pub tx_pubkey: [u8; 32],
}

/// Derives the one-time output paying `amount` to `address` at `output_index`, using the
/// transaction secret `r`. Returns `None` if the address keys are not valid points.
pub fn derive_output(
    tx_secret: &Scalar,
    address: &Address,
    output_index: u64,
    amount: u64,
) -> Option<DerivedOutput> {
    let spend_public = decompress(&address.spend_public)?;
    let view_public = decompress(&address.view_public)?;

    let tx_pubkey = if address.is_subaddress {
        tx_secret * spend_public
    } else {
        EdwardsPoint::mul_base(tx_secret)
    };
    let shared = (tx_secret * view_public)
        .mul_by_cofactor()
        .compress()
        .to_bytes();
    let secrets = OutputSecrets::new(&shared, output_index);
    let key = EdwardsPoint::mul_base(&secrets.shared_scalar) + spend_public;

    Some(DerivedOutput {
        output: TxOutput {
            key: key.compress().to_bytes(),
            view_tag: Some(secrets.view_tag),
            encrypted_amount: secrets.encrypt_amount(amount),
        },
        tx_pubkey: tx_pubkey.compress().to_bytes(),
    })
}
