use super::{
    LedgerError,
    LedgerRead,
    LedgerResult,
    LedgerWrite,
    TxTracker,
};
use crate::types::{
    Address,
    Amount,
    Checkpoint,
    Grid,
    GridNumbers,
    PaymentAsset,
    PoolInfo,
    PoolState,
    Position,
    PurchaseOrder,
    QuarterRecord,
    TxHandle,
    TxKind,
    TxStatus,
    WinnerRecord,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use tracing::debug;

/// Ledger kept entirely in memory. Clones share state, so one handle per
/// account can model several players acting on the same pool.
#[derive(Clone)]
pub struct InMemoryLedger {
    account: Address,
    state: Arc<Mutex<LedgerState>>,
}

struct LedgerState {
    pool: PoolInfo,
    grid: Grid,
    quarters: [QuarterRecord; 4],
    winners: [WinnerRecord; 4],
    numbers: Option<GridNumbers>,
    allowances: HashMap<(Address, Address, Address), Amount>,
    txs: HashMap<TxHandle, TxRecord>,
    next_tx: u64,
    auto_confirm: bool,
    next_fault: Option<Fault>,
}

enum Fault {
    Reject(String),
    Revert(String),
}

struct TxRecord {
    kind: TxKind,
    effect: Effect,
    doomed: Option<String>,
    status: TxStatus,
}

#[derive(Clone)]
enum Effect {
    Approve {
        token: Address,
        owner: Address,
        spender: Address,
        amount: Amount,
    },
    Purchase {
        owner: Address,
        positions: Vec<Position>,
        total_cost: Amount,
    },
}

impl InMemoryLedger {
    pub fn new(account: Address, pool: PoolInfo) -> Self {
        let state = LedgerState {
            pool,
            grid: Grid::empty(),
            quarters: Checkpoint::ALL.map(QuarterRecord::pending),
            winners: Checkpoint::ALL.map(|cp| WinnerRecord::new(cp, Address::ZERO, 0)),
            numbers: None,
            allowances: HashMap::new(),
            txs: HashMap::new(),
            next_tx: 1,
            auto_confirm: false,
            next_fault: None,
        };
        Self {
            account,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Open pool with a handful of cells already sold to other players.
    pub fn demo(account: Address, asset: PaymentAsset) -> Self {
        let pool = PoolInfo {
            pool: Address::new([0x50; 20]),
            state: PoolState::Open,
            unit_price: 10u128.pow(u32::from(asset.decimals()) / 2),
            asset,
            total_pot: 0,
            sold_count: 0,
            cells_per_user: Some(10),
        };
        let ledger = Self::new(account, pool);
        ledger.set_auto_confirm(true);
        let others = [Address::new([0x0a; 20]), Address::new([0x0b; 20])];
        for (i, index) in [4u8, 11, 23, 37, 42, 58, 66, 71, 89, 95].iter().enumerate() {
            if let Ok(position) = Position::new(*index) {
                ledger.assign_cell(position, others[i % others.len()]);
            }
        }
        ledger
    }

    /// Handle on the same ledger acting as another account.
    pub fn for_account(&self, account: Address) -> Self {
        Self {
            account,
            state: self.state.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool_address(&self) -> Address {
        self.state().pool.pool
    }

    pub fn pool_snapshot(&self) -> PoolInfo {
        self.state().pool.clone()
    }

    pub fn grid_snapshot(&self) -> Grid {
        self.state().grid.clone()
    }

    /// Confirm transactions on their first status poll.
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.state().auto_confirm = enabled;
    }

    /// The signer declines the next write request.
    pub fn reject_next_write(&self, reason: impl Into<String>) {
        self.state().next_fault = Some(Fault::Reject(reason.into()));
    }

    /// The next write is broadcast but fails once it lands.
    pub fn revert_next_write(&self, reason: impl Into<String>) {
        self.state().next_fault = Some(Fault::Revert(reason.into()));
    }

    pub fn set_pool_state(&self, state: PoolState) {
        self.state().pool.state = state;
    }

    pub fn set_unit_price(&self, unit_price: Amount) {
        self.state().pool.unit_price = unit_price;
    }

    pub fn set_cells_per_user(&self, limit: Option<u32>) {
        self.state().pool.cells_per_user = limit;
    }

    pub fn set_grid_numbers(&self, numbers: GridNumbers) {
        self.state().numbers = Some(numbers);
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: Amount) {
        self.state().allowances.insert((token, owner, spender), amount);
    }

    /// Records a purchase made outside this client.
    pub fn assign_cell(&self, position: Position, owner: Address) -> bool {
        let mut state = self.state();
        let unit_price = state.pool.unit_price;
        if !state.grid.assign(position, owner) {
            return false;
        }
        state.pool.sold_count += 1;
        state.pool.total_pot += unit_price;
        true
    }

    pub fn submit_score(&self, checkpoint: Checkpoint, team_a_score: u32, team_b_score: u32) {
        let mut state = self.state();
        let quarter = &mut state.quarters[checkpoint.index()];
        quarter.team_a_score = team_a_score;
        quarter.team_b_score = team_b_score;
        quarter.submitted = true;
    }

    /// Marks a checkpoint settled with the given winner (zero for none) and
    /// its non-cumulative base payout.
    pub fn settle_quarter(&self, checkpoint: Checkpoint, winner: Address, base_payout: Amount) {
        let mut state = self.state();
        let quarter = &mut state.quarters[checkpoint.index()];
        quarter.submitted = true;
        quarter.settled = true;
        state.winners[checkpoint.index()] = WinnerRecord::new(checkpoint, winner, base_payout);
        state.pool.state = PoolState::Scored(checkpoint);
    }

    pub fn pending_transactions(&self) -> Vec<TxHandle> {
        let state = self.state();
        let mut pending: Vec<TxHandle> = state
            .txs
            .iter()
            .filter(|(_, tx)| tx.status == TxStatus::Pending)
            .map(|(handle, _)| handle.clone())
            .collect();
        pending.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        pending
    }

    /// Lands a pending transaction and applies its effect.
    pub fn confirm(&self, handle: &TxHandle) -> LedgerResult<TxStatus> {
        let mut state = self.state();
        state.land(handle)
    }

    fn record_tx(&self, kind: TxKind, effect: Effect) -> LedgerResult<TxHandle> {
        let mut state = self.state();
        let doomed = match state.next_fault.take() {
            Some(Fault::Reject(reason)) => return Err(LedgerError::Rejected(reason)),
            Some(Fault::Revert(reason)) => Some(reason),
            None => None,
        };
        let handle = TxHandle::new(format!("0x{:064x}", state.next_tx));
        state.next_tx += 1;
        debug!(%handle, ?kind, "recorded in-memory transaction");
        state.txs.insert(
            handle.clone(),
            TxRecord {
                kind,
                effect,
                doomed,
                status: TxStatus::Pending,
            },
        );
        Ok(handle)
    }
}

impl LedgerState {
    fn allowance(&self, token: Address, owner: Address, spender: Address) -> Amount {
        self.allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default()
    }

    fn land(&mut self, handle: &TxHandle) -> LedgerResult<TxStatus> {
        let (kind, doomed, effect) = match self.txs.get(handle) {
            None => return Err(LedgerError::Transport(format!("unknown transaction {handle}"))),
            Some(tx) if tx.status != TxStatus::Pending => return Ok(tx.status.clone()),
            Some(tx) => (tx.kind, tx.doomed.clone(), tx.effect.clone()),
        };
        let outcome = match doomed {
            Some(reason) => Err(reason),
            None => self.apply(effect),
        };
        let status = match outcome {
            Ok(()) => TxStatus::Confirmed { kind },
            Err(reason) => TxStatus::Failed { reason },
        };
        if let Some(tx) = self.txs.get_mut(handle) {
            tx.status = status.clone();
        }
        Ok(status)
    }

    fn apply(&mut self, effect: Effect) -> Result<(), String> {
        match effect {
            Effect::Approve {
                token,
                owner,
                spender,
                amount,
            } => {
                self.allowances.insert((token, owner, spender), amount);
                Ok(())
            }
            Effect::Purchase {
                owner,
                positions,
                total_cost,
            } => self.settle_purchase(owner, &positions, total_cost),
        }
    }

    fn settle_purchase(
        &mut self,
        owner: Address,
        positions: &[Position],
        total_cost: Amount,
    ) -> Result<(), String> {
        if !self.pool.state.accepts_purchases() {
            return Err(format!("pool is {:?}", self.pool.state));
        }
        if let Some(taken) = positions.iter().find(|p| self.grid.is_owned(**p)) {
            return Err(format!("cell {taken} already sold"));
        }
        let expected = self.pool.unit_price * positions.len() as Amount;
        if total_cost != expected {
            return Err(format!("paid {total_cost}, expected {expected}"));
        }
        if let Some(limit) = self.pool.cells_per_user
            && self.grid.owned_by(&owner) + positions.len() as u32 > limit
        {
            return Err(format!("purchase exceeds the {limit} cell limit"));
        }
        if let PaymentAsset::Fungible { token, .. } = self.pool.asset {
            let spender = self.pool.pool;
            let available = self.allowance(token, owner, spender);
            if available < total_cost {
                return Err(format!("allowance {available} below cost {total_cost}"));
            }
            self.allowances
                .insert((token, owner, spender), available - total_cost);
        }
        for position in positions {
            self.grid.assign(*position, owner);
        }
        self.pool.sold_count += positions.len() as u32;
        self.pool.total_pot += total_cost;
        Ok(())
    }
}

impl LedgerRead for InMemoryLedger {
    fn account(&self) -> Address {
        self.account
    }

    async fn pool_info(&self) -> LedgerResult<PoolInfo> {
        Ok(self.state().pool.clone())
    }

    async fn grid(&self) -> LedgerResult<Grid> {
        Ok(self.state().grid.clone())
    }

    async fn quarter_score(&self, checkpoint: Checkpoint) -> LedgerResult<QuarterRecord> {
        Ok(self.state().quarters[checkpoint.index()])
    }

    async fn quarter_winner(&self, checkpoint: Checkpoint) -> LedgerResult<WinnerRecord> {
        Ok(self.state().winners[checkpoint.index()])
    }

    async fn allowance(&self, token: &Address, spender: &Address) -> LedgerResult<Amount> {
        Ok(self.state().allowance(*token, self.account, *spender))
    }

    async fn grid_numbers(&self) -> LedgerResult<Option<GridNumbers>> {
        Ok(self.state().numbers)
    }
}

impl LedgerWrite for InMemoryLedger {
    async fn purchase(&self, order: &PurchaseOrder) -> LedgerResult<TxHandle> {
        {
            let state = self.state();
            if let PaymentAsset::Fungible { token, .. } = state.pool.asset {
                let available = state.allowance(token, self.account, state.pool.pool);
                if available < order.total_cost {
                    return Err(LedgerError::InsufficientAllowance {
                        required: order.total_cost,
                        available,
                    });
                }
            }
        }
        self.record_tx(
            TxKind::Purchase,
            Effect::Purchase {
                owner: self.account,
                positions: order.positions.clone(),
                total_cost: order.total_cost,
            },
        )
    }

    async fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: Amount,
    ) -> LedgerResult<TxHandle> {
        self.record_tx(
            TxKind::Approval,
            Effect::Approve {
                token: *token,
                owner: self.account,
                spender: *spender,
                amount,
            },
        )
    }
}

impl TxTracker for InMemoryLedger {
    async fn status(&self, handle: &TxHandle) -> LedgerResult<TxStatus> {
        let mut state = self.state();
        let Some(tx) = state.txs.get(handle) else {
            return Err(LedgerError::Transport(format!("unknown transaction {handle}")));
        };
        if tx.status == TxStatus::Pending && state.auto_confirm {
            return state.land(handle);
        }
        Ok(tx.status.clone())
    }
}
