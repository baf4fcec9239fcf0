//! Account addresses.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cell::{CellBuilder, CellParser};
use crate::error::{AddressError, CellError};

const FLAG_BOUNCEABLE: u8 = 0x11;
const FLAG_NON_BOUNCEABLE: u8 = 0x51;
const FLAG_TESTNET: u8 = 0x80;

/// Which chain the driver talks to. Only affects how addresses are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn is_testnet(self) -> bool {
        matches!(self, Network::Testnet)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// A standard internal address: workchain plus 256-bit account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl Address {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    /// `<workchain>:<hex>`.
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    /// The 48-character base64url form.
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut flags = if bounceable {
            FLAG_BOUNCEABLE
        } else {
            FLAG_NON_BOUNCEABLE
        };
        if testnet {
            flags |= FLAG_TESTNET;
        }
        let mut bytes = Vec::with_capacity(36);
        bytes.push(flags);
        bytes.push(self.workchain as u8);
        bytes.extend_from_slice(&self.hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        URL_SAFE.encode(bytes)
    }

    /// The form requests are stored under: bounceable, network-flagged.
    pub fn to_request_form(&self, network: Network) -> String {
        self.to_friendly(true, network.is_testnet())
    }

    fn from_friendly(s: &str) -> Result<Self, AddressError> {
        let bytes = if s.contains('-') || s.contains('_') {
            URL_SAFE.decode(s)
        } else {
            STANDARD.decode(s)
        }
        .map_err(|e| AddressError::InvalidBase64(e.to_string()))?;
        if bytes.len() != 36 {
            return Err(AddressError::InvalidBase64(format!(
                "decoded to {} bytes",
                bytes.len()
            )));
        }
        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(AddressError::ChecksumMismatch);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self::new(bytes[1] as i8, hash))
    }

    fn from_raw(s: &str) -> Result<Self, AddressError> {
        let (workchain, account) = s
            .split_once(':')
            .ok_or_else(|| AddressError::InvalidRaw(s.to_string()))?;
        let workchain: i8 = workchain
            .parse()
            .map_err(|_| AddressError::InvalidRaw(s.to_string()))?;
        let decoded = hex::decode(account).map_err(|_| AddressError::InvalidRaw(s.to_string()))?;
        let hash: [u8; 32] = decoded
            .try_into()
            .map_err(|_| AddressError::InvalidRaw(s.to_string()))?;
        Ok(Self::new(workchain, hash))
    }

    /// `addr_std$10 anycast:(Maybe Anycast) workchain_id:int8 address:bits256`.
    pub fn store(&self, builder: &mut CellBuilder) -> Result<(), CellError> {
        builder.store_bit(true).store_bit(false).store_bit(false);
        builder.store_uint(u64::from(self.workchain as u8), 8)?;
        for byte in self.hash {
            builder.store_uint(u64::from(byte), 8)?;
        }
        Ok(())
    }

    /// Reads a `MsgAddress`; `addr_none` yields `None`.
    pub fn load(parser: &mut CellParser<'_>) -> Result<Option<Self>, CellError> {
        let tag = parser.load_uint(2)?;
        match tag {
            0b00 => Ok(None),
            0b10 => {
                if parser.load_bit()? {
                    return Err(CellError::InvalidLabel("anycast addresses are not supported"));
                }
                let workchain = parser.load_uint(8)? as u8 as i8;
                let mut hash = [0u8; 32];
                for byte in hash.iter_mut() {
                    *byte = parser.load_uint(8)? as u8;
                }
                Ok(Some(Self::new(workchain, hash)))
            }
            _ => Err(CellError::InvalidLabel("unsupported address kind")),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            return Self::from_raw(s);
        }
        if s.len() != 48 {
            return Err(AddressError::InvalidLength(s.len()));
        }
        Self::from_friendly(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

/// CRC-16/XMODEM.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
