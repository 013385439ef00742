use crate::{
    controller::{
        AppController,
        ControllerConfig,
    },
    ledger::InMemoryLedger,
    types::{
        Address,
        Amount,
        PaymentAsset,
        PoolInfo,
        PoolState,
        Position,
    },
};
use std::time::Duration;

pub const ALICE: Address = Address::new([0xa1; 20]);
pub const BOB: Address = Address::new([0xb0; 20]);
pub const POOL: Address = Address::new([0x50; 20]);
pub const TOKEN: Address = Address::new([0x70; 20]);
pub const UNIT_PRICE: Amount = 100;

pub fn pos(index: u8) -> Position {
    Position::new(index).unwrap()
}

pub fn open_pool(asset: PaymentAsset) -> PoolInfo {
    PoolInfo {
        pool: POOL,
        state: PoolState::Open,
        unit_price: UNIT_PRICE,
        asset,
        total_pot: 0,
        sold_count: 0,
        cells_per_user: None,
    }
}

/// One pool shared by Alice (the client under test) and Bob.
pub struct TestContext {
    alice: InMemoryLedger,
    bob: InMemoryLedger,
}

impl TestContext {
    pub fn native() -> Self {
        Self::with_pool(open_pool(PaymentAsset::Native))
    }

    pub fn fungible() -> Self {
        Self::with_pool(open_pool(PaymentAsset::Fungible {
            token: TOKEN,
            decimals: 6,
        }))
    }

    pub fn with_pool(pool: PoolInfo) -> Self {
        let alice = InMemoryLedger::new(ALICE, pool);
        let bob = alice.for_account(BOB);
        Self { alice, bob }
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.alice
    }

    pub fn bob(&self) -> &InMemoryLedger {
        &self.bob
    }

    /// Controller for Alice with a fixed seed and fast polling.
    pub fn controller(&self) -> AppController<InMemoryLedger> {
        AppController::new(
            self.alice.clone(),
            ControllerConfig {
                poll_interval: Duration::from_millis(1),
                refresh_delay: Duration::from_millis(10),
                max_polls: 20,
                seed: Some(42),
                ..ControllerConfig::default()
            },
        )
    }
}
