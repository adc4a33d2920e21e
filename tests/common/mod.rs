//! Shared chain harness for integration tests

#![allow(dead_code)]

use silver_staking::{
    Address, BlockHeader, Coin, ConsAddress, ConsPubKey, Context, GenesisState, JailQueueReader,
    MsgCreateValidator, Params, Querier, Snapshot, StakingEvent, StakingKeeper, StateDb,
    ValidatorUpdate,
};
use silver_staking::types::{Commission, Description, ADDRESS_LEN};
use std::collections::BTreeSet;

pub const REDUCTION: u128 = 1_000_000;

/// Seconds of block time per height
pub const BLOCK_SECS: u64 = 5;

pub fn addr(id: u8) -> Address {
    Address::new([id; ADDRESS_LEN])
}

pub fn pubkey(id: u8) -> ConsPubKey {
    ConsPubKey::new(vec![id; 32]).unwrap()
}

pub fn cons_addr(id: u8) -> ConsAddress {
    pubkey(id).address()
}

pub fn create_msg(id: u8, tokens: u128) -> MsgCreateValidator {
    MsgCreateValidator {
        operator_address: addr(id),
        pubkey: pubkey(id),
        description: Description {
            moniker: format!("validator-{}", id),
            ..Description::default()
        },
        commission: Commission {
            rate_bps: 500,
            max_rate_bps: 2_000,
            max_change_rate_bps: 100,
            update_time: 0,
        },
        min_self_delegation: 1,
        value: Coin::new("sbtc", tokens),
    }
}

/// Chain driven block by block on a fresh state database
pub struct TestChain {
    pub db: StateDb,
    pub keeper: StakingKeeper,
    pub height: u64,
    pub events: Vec<StakingEvent>,
}

impl TestChain {
    /// Empty genesis with `params`, committed at height 0
    pub fn new(params: Params) -> Self {
        let db = StateDb::new();
        let keeper = StakingKeeper::new();
        let mut ctx = Context::with_params(BlockHeader::new(0, 0), db.begin(), params.clone());
        let genesis = GenesisState {
            params,
            ..GenesisState::default()
        };
        keeper.init_genesis(&mut ctx, genesis).unwrap();
        ctx.commit(&db).unwrap();
        Self {
            db,
            keeper,
            height: 0,
            events: Vec::new(),
        }
    }

    /// Execute the next block: `f` runs before end-block
    pub fn block<F>(&mut self, f: F) -> Vec<ValidatorUpdate>
    where
        F: FnOnce(&StakingKeeper, &mut Context),
    {
        let height = self.height + 1;
        self.block_at(height, f)
    }

    /// Execute a block at `height`, skipping any heights in between
    pub fn block_at<F>(&mut self, height: u64, f: F) -> Vec<ValidatorUpdate>
    where
        F: FnOnce(&StakingKeeper, &mut Context),
    {
        assert!(height > self.height, "heights must increase");
        let header = BlockHeader::new(height, height * BLOCK_SECS);
        let mut ctx = Context::begin(&self.db, header).unwrap();
        f(&self.keeper, &mut ctx);
        let updates = self.keeper.end_block(&mut ctx).unwrap();
        let outcome = ctx.commit(&self.db).unwrap();
        self.events = outcome.events;
        self.height = height;
        updates
    }

    pub fn snapshot(&self) -> Snapshot {
        self.db.snapshot()
    }

    pub fn querier(&self) -> Querier {
        Querier::new(self.db.snapshot())
    }

    /// Latest key node set
    pub fn key_nodes(&self) -> BTreeSet<Address> {
        self.querier().latest_epoch().unwrap().key_nodes()
    }
}

/// Chain with validators 1..=13 bonded and forming the key node committee
///
/// Validator `id` self-delegates `10 + id` units, so higher ids rank first.
pub fn committee_of_13() -> TestChain {
    let mut chain = TestChain::new(Params {
        max_validators: 35,
        ..Params::default()
    });
    chain.block(|keeper, ctx| {
        for id in 1..=13u8 {
            keeper
                .create_validator(ctx, create_msg(id, (10 + u128::from(id)) * REDUCTION))
                .unwrap();
        }
    });
    chain.block(|_, _| {});
    chain
}

/// Queued validators that are members of the latest key node set
pub fn queued_key_nodes(snapshot: &Snapshot) -> u64 {
    let querier = Querier::new(snapshot.clone());
    let key_nodes = querier.latest_epoch().unwrap().key_nodes();
    snapshot
        .jailed_queue()
        .unwrap()
        .iter()
        .filter(|(_, addr)| key_nodes.contains(addr))
        .count() as u64
}
