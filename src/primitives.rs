use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};

/// A monetary amount in millisatoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Msat(pub u64);

impl std::fmt::Display for Msat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_msat", self.0)
    }
}

/// Error returned when parsing one of the primitives below fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

/// A short channel id in `<block>x<tx_index>x<output_index>` notation.
///
/// LND addresses channels by the packed `u64` form, so conversions in both
/// directions are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortChannelId {
    block: u32,
    tx_index: u32,
    output_index: u16,
}

impl ShortChannelId {
    pub fn new(block: u32, tx_index: u32, output_index: u16) -> Result<Self, ParseError> {
        if block >= 1 << 24 || tx_index >= 1 << 24 {
            return Err(ParseError(format!(
                "short channel id component out of range: {}x{}x{}",
                block, tx_index, output_index
            )));
        }
        Ok(Self {
            block,
            tx_index,
            output_index,
        })
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn tx_index(&self) -> u32 {
        self.tx_index
    }

    pub fn output_index(&self) -> u16 {
        self.output_index
    }

    /// Packs the id into the 64-bit representation used on the wire.
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.block) << 40) | (u64::from(self.tx_index) << 16) | u64::from(self.output_index)
    }
}

impl From<u64> for ShortChannelId {
    fn from(value: u64) -> Self {
        Self {
            block: ((value >> 40) & 0xFF_FFFF) as u32,
            tx_index: ((value >> 16) & 0xFF_FFFF) as u32,
            output_index: (value & 0xFFFF) as u16,
        }
    }
}

impl FromStr for ShortChannelId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('x').collect();
        let &[block, tx_index, output_index] = parts.as_slice() else {
            return Err(ParseError(format!(
                "expected '<block>x<tx>x<output>', found '{}'",
                s
            )));
        };
        let parse_err = |part: &str| ParseError(format!("invalid component '{}' in '{}'", part, s));
        let block = block.parse::<u32>().map_err(|_| parse_err(block))?;
        let tx_index = tx_index.parse::<u32>().map_err(|_| parse_err(tx_index))?;
        let output_index = output_index
            .parse::<u16>()
            .map_err(|_| parse_err(output_index))?;
        Self::new(block, tx_index, output_index)
    }
}

impl std::fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.block, self.tx_index, self.output_index)
    }
}

fn decode_32(hex_str: &str, what: &str) -> Result<[u8; 32], ParseError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ParseError(format!("{} is not valid hex: {}", what, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ParseError(format!("{} must be 32 bytes, got {}", what, bytes.len())))
}

/// The 32-byte payment hash of an HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(PaymentHash)
    }

    /// Lower-case hex, the form the node signs and the authorization
    /// service expects.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for PaymentHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s, "payment hash").map(PaymentHash)
    }
}

impl std::fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The 32-byte secret that settles an HTLC.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the payment hash this preimage unlocks.
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }

    /// Returns true if `sha256(self) == hash`.
    pub fn unlocks(&self, hash: &PaymentHash) -> bool {
        self.payment_hash() == *hash
    }
}

impl FromStr for Preimage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s, "preimage").map(Preimage)
    }
}

impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the derived hash is printed; the secret stays out of logs.
        write!(f, "Preimage(for {})", self.payment_hash())
    }
}

/// A message signature produced by the node, in the node's own string
/// encoding (zbase32 for LND).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
