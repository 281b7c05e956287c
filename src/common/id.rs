//! Kademlia node Id or a lookup target
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// SHA-1 digest of arbitrary bytes as an [Id].
    pub fn hash(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }

    /// Node id of a peer, bound to both its public key and the ip it was observed at.
    ///
    /// `SHA1(ip ‖ SHA1(public_key))`
    pub fn from_public_key(public_key: &[u8], ip: &Ipv4Addr) -> Id {
        let mid = Id::hash(public_key);

        let mut hasher = Sha1::new();
        hasher.update(&ip.octets());
        hasher.update(mid.as_bytes());

        Id(hasher.digest().bytes())
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Full XOR metric between two ids, comparable as a big-endian unsigned integer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0).enumerate() {
            result[i] = a ^ b;
        }

        result.into()
    }

    /// A random id whose [Self::distance] from `self` is exactly `distance`.
    ///
    /// Used to pick lookup targets that land in a specific bucket.
    pub fn random_at_distance(&self, distance: u8) -> Id {
        if distance == 0 {
            return *self;
        }

        let distance = distance.min(MAX_DISTANCE);
        let shared_prefix = (MAX_DISTANCE - distance) as usize;

        let mut bytes: [u8; ID_SIZE] = rand::thread_rng().gen();

        for bit in 0..=shared_prefix {
            let byte = bit / 8;
            let mask = 0x80_u8 >> (bit % 8);

            let own = self.0[byte] & mask;
            // The first differing bit is flipped, everything before it is shared.
            let value = if bit == shared_prefix { own ^ mask } else { own };

            bytes[byte] = (bytes[byte] & !mask) | value;
        }

        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(value: Id) -> Self {
        value.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() % 2 != 0 {
            return Err(DecodeIdError::OddNumberOfCharacters);
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let pair = s.get(i * 2..i * 2 + 2).ok_or(DecodeIdError::InvalidHexCharacter)?;
            let byte =
                u8::from_str_radix(pair, 16).map_err(|_| DecodeIdError::InvalidHexCharacter)?;

            bytes.push(byte);
        }

        Ok(Id::from_bytes(bytes)?)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
/// Errors parsing an [Id] from a hex string.
pub enum DecodeIdError {
    #[error("Hex encoding should have an even number of characters")]
    OddNumberOfCharacters,

    #[error("Invalid hex character")]
    InvalidHexCharacter,

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),
}
