//! Message bodies the driver reads and writes.

use num_bigint::BigUint;

use crate::address::Address;
use crate::cell::{Cell, CellBuilder, CellParser};
use crate::chain::OutgoingMessage;
use crate::error::CellError;

/// Treasury → wallet, emitted when a stake is accepted for a round.
pub const OP_SAVE_COIN: u32 = 0x7f30_ee55;
/// Wallet → treasury, emitted when tokens are reserved for withdrawal.
pub const OP_RESERVE_TOKEN: u32 = 0x7bdd_97de;
/// Driver → wallet.
pub const OP_STAKE_COIN: u32 = 0x4cae_3ab1;
/// Driver → wallet.
pub const OP_WITHDRAW: u32 = 0x469b_d91e;

pub const STAKE_COIN_AMOUNT: u64 = 150_000_000;
pub const WITHDRAW_AMOUNT: u64 = 300_000_000;
const SEND_MODE_PAY_FEES_SEPARATELY: u8 = 1;

/// Query ids of outgoing messages are the current unix time.
pub fn query_id_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

fn expect_opcode(parser: &mut CellParser<'_>, expected: u32) -> Result<(), CellError> {
    let found = parser.load_u32()?;
    if found != expected {
        return Err(CellError::UnexpectedOpcode { expected, found });
    }
    Ok(())
}

/// `save_coin query_id:uint64 amount:Grams round_since:uint32 return_excess:MsgAddress`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveCoin {
    pub query_id: u64,
    pub amount: BigUint,
    pub round_since: u32,
}

impl SaveCoin {
    pub fn decode(body: &Cell) -> Result<Self, CellError> {
        let mut parser = body.parser();
        expect_opcode(&mut parser, OP_SAVE_COIN)?;
        Ok(Self {
            query_id: parser.load_u64()?,
            amount: parser.load_coins()?,
            round_since: parser.load_u32()?,
        })
    }

    pub fn encode(&self, return_excess: Option<&Address>) -> Result<Cell, CellError> {
        let mut builder = CellBuilder::new();
        builder.store_u32(OP_SAVE_COIN).store_u64(self.query_id);
        builder.store_coins(&self.amount)?;
        builder.store_u32(self.round_since);
        store_optional_address(&mut builder, return_excess)?;
        builder.build()
    }
}

/// `reserve_token query_id:uint64 tokens:Grams owner:MsgAddress return_excess:MsgAddress`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveToken {
    pub query_id: u64,
    pub tokens: BigUint,
}

impl ReserveToken {
    pub fn decode(body: &Cell) -> Result<Self, CellError> {
        let mut parser = body.parser();
        expect_opcode(&mut parser, OP_RESERVE_TOKEN)?;
        Ok(Self {
            query_id: parser.load_u64()?,
            tokens: parser.load_coins()?,
        })
    }

    pub fn encode(&self, owner: &Address) -> Result<Cell, CellError> {
        let mut builder = CellBuilder::new();
        builder.store_u32(OP_RESERVE_TOKEN).store_u64(self.query_id);
        builder.store_coins(&self.tokens)?;
        owner.store(&mut builder)?;
        builder.store_address_none();
        builder.build()
    }
}

fn store_optional_address(
    builder: &mut CellBuilder,
    address: Option<&Address>,
) -> Result<(), CellError> {
    match address {
        Some(address) => address.store(builder),
        None => {
            builder.store_address_none();
            Ok(())
        }
    }
}

/// Asks a wallet to stake the coins it holds for `round_since`.
pub fn stake_coin_message(
    wallet: Address,
    query_id: u64,
    round_since: u32,
) -> Result<OutgoingMessage, CellError> {
    let mut builder = CellBuilder::new();
    builder
        .store_u32(OP_STAKE_COIN)
        .store_u64(query_id)
        .store_u32(round_since)
        .store_address_none();
    Ok(OutgoingMessage {
        destination: wallet,
        amount: STAKE_COIN_AMOUNT,
        bounce: true,
        mode: SEND_MODE_PAY_FEES_SEPARATELY,
        body: builder.build()?,
    })
}

/// Asks a wallet to withdraw everything it has pending.
pub fn withdraw_message(wallet: Address, query_id: u64) -> Result<OutgoingMessage, CellError> {
    let mut builder = CellBuilder::new();
    builder
        .store_u32(OP_WITHDRAW)
        .store_u64(query_id)
        .store_address_none();
    Ok(OutgoingMessage {
        destination: wallet,
        amount: WITHDRAW_AMOUNT,
        bounce: true,
        mode: SEND_MODE_PAY_FEES_SEPARATELY,
        body: builder.build()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_coin_decodes_round() {
        let body = SaveCoin {
            query_id: 9,
            amount: BigUint::from(5_000_000_000u64),
            round_since: 1_700_000_000,
        }
        .encode(None)
        .unwrap();

        let decoded = SaveCoin::decode(&body).unwrap();
        assert_eq!(decoded.round_since, 1_700_000_000);
        assert_eq!(decoded.amount, BigUint::from(5_000_000_000u64));
    }

    #[test]
    fn reserve_token_wrong_opcode_is_rejected() {
        let body = SaveCoin {
            query_id: 1,
            amount: BigUint::from(1u8),
            round_since: 1,
        }
        .encode(None)
        .unwrap();

        assert_eq!(
            ReserveToken::decode(&body).unwrap_err(),
            CellError::UnexpectedOpcode {
                expected: OP_RESERVE_TOKEN,
                found: OP_SAVE_COIN
            }
        );
    }

    #[test]
    fn truncated_body_fails_to_decode() {
        let mut builder = CellBuilder::new();
        builder.store_u32(OP_RESERVE_TOKEN).store_u64(1);
        let body = builder.build().unwrap();

        assert!(matches!(
            ReserveToken::decode(&body),
            Err(CellError::BitUnderflow { .. })
        ));
    }

    #[test]
    fn stake_coin_message_layout() {
        let wallet = Address::new(0, [3; 32]);
        let message = stake_coin_message(wallet, 77, 12).unwrap();

        assert_eq!(message.destination, wallet);
        assert_eq!(message.amount, STAKE_COIN_AMOUNT);
        assert!(message.bounce);
        assert_eq!(message.mode, 1);
        assert_eq!(message.body.bit_len(), 32 + 64 + 32 + 2);

        let mut parser = message.body.parser();
        assert_eq!(parser.load_u32().unwrap(), OP_STAKE_COIN);
        assert_eq!(parser.load_u64().unwrap(), 77);
        assert_eq!(parser.load_u32().unwrap(), 12);
    }

    #[test]
    fn withdraw_message_layout() {
        let message = withdraw_message(Address::new(0, [4; 32]), 5).unwrap();
        assert_eq!(message.amount, WITHDRAW_AMOUNT);
        assert_eq!(message.body.opcode(), Some(OP_WITHDRAW));
        assert_eq!(message.body.bit_len(), 32 + 64 + 2);
    }
}
