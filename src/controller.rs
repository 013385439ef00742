use crate::{
    config::{
        AppConfig,
        DEFAULT_MAX_POLLS,
        DEFAULT_POLL_INTERVAL,
        DEFAULT_REFRESH_DELAY,
    },
    error::{
        Error,
        Result,
    },
    ledger::{
        Ledger,
        LedgerRead,
    },
    orchestrator::{
        Progress,
        PurchaseOrchestrator,
        PurchaseReceipt,
        Step,
        Suppression,
    },
    scheduler::RefreshScheduler,
    selection::{
        Quota,
        Selection,
    },
    settlement::{
        CheckpointInput,
        EqualShare,
        Settlement,
        reconstruct,
    },
    types::{
        Address,
        Amount,
        Checkpoint,
        Grid,
        GridNumbers,
        PoolInfo,
        Position,
        QuarterRecord,
        TxHandle,
        TxStatus,
        WinnerRecord,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use futures::future::try_join_all;
use rand::{
    SeedableRng,
    rngs::StdRng,
};
use std::time::Duration;
use tokio::{
    sync::mpsc::{
        self,
        UnboundedReceiver,
        UnboundedSender,
    },
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

const MAX_ERRORS: usize = 50;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub spender: Option<Address>,
    pub refresh_delay: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Fixed seed for quick-picks; drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            spender: None,
            refresh_delay: DEFAULT_REFRESH_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            seed: None,
        }
    }
}

impl From<&AppConfig> for ControllerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            spender: config.spender,
            refresh_delay: config.refresh_delay,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
            seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WinningCell {
    pub position: Position,
    pub owner: Option<Address>,
}

/// Everything read from the ledger in one refresh, plus the payouts
/// reconstructed from it.
#[derive(Clone, Debug)]
pub struct PoolView {
    pub info: PoolInfo,
    pub grid: Grid,
    pub quarters: [QuarterRecord; 4],
    pub winners: [WinnerRecord; 4],
    pub numbers: Option<GridNumbers>,
    pub settlement: Settlement,
    /// Allowance granted to the spender; `None` for natively priced pools.
    pub allowance: Option<Amount>,
}

impl PoolView {
    pub fn quota_for(&self, account: &Address) -> Quota {
        Quota::for_account(self.info.cells_per_user, self.grid.owned_by(account))
    }

    /// Cell matching a submitted quarter's score, once numbers are drawn.
    pub fn winning_cell(&self, checkpoint: Checkpoint) -> Option<WinningCell> {
        let quarter = &self.quarters[checkpoint.index()];
        if !quarter.submitted {
            return None;
        }
        let position = self
            .numbers?
            .winning_position(quarter.team_a_score, quarter.team_b_score)?;
        Some(WinningCell {
            position,
            owner: self.grid.owner(position),
        })
    }

    /// Split of the final pot across every sold cell when nobody won Final.
    pub fn equal_share(&self) -> Option<EqualShare> {
        self.settlement.equal_share(self.grid.sold_count())
    }
}

pub async fn fetch_pool_view<L: LedgerRead>(
    ledger: &L,
    spender: Option<Address>,
) -> Result<PoolView> {
    let (info, grid, numbers) =
        futures::try_join!(ledger.pool_info(), ledger.grid(), ledger.grid_numbers())?;
    let (quarters, winners) = futures::try_join!(
        try_join_all(Checkpoint::ALL.map(|cp| ledger.quarter_score(cp))),
        try_join_all(Checkpoint::ALL.map(|cp| ledger.quarter_winner(cp))),
    )?;
    let quarters: [QuarterRecord; 4] = quarters
        .try_into()
        .map_err(|_| Error::Ledger("expected four quarter records".to_string()))?;
    let winners: [WinnerRecord; 4] = winners
        .try_into()
        .map_err(|_| Error::Ledger("expected four winner records".to_string()))?;

    let allowance = match info.asset.token() {
        Some(token) => {
            let spender = spender.unwrap_or(info.pool);
            Some(ledger.allowance(token, &spender).await?)
        }
        None => None,
    };

    let mut inputs = Checkpoint::ALL.map(CheckpointInput::unknown);
    for (slot, (quarter, winner)) in inputs.iter_mut().zip(quarters.iter().zip(&winners)) {
        *slot = CheckpointInput::from_records(quarter, winner)?;
    }
    let settlement = reconstruct(&inputs)?;
    if let Err(err) = settlement.check_against_pot(info.total_pot) {
        warn!(%err, "reconstructed payouts disagree with the pot");
    }

    Ok(PoolView {
        info,
        grid,
        quarters,
        winners,
        numbers,
        settlement,
        allowance,
    })
}

#[derive(Clone, Debug)]
pub struct AppSnapshot {
    pub account: Address,
    pub view: Option<PoolView>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub selection: Vec<Position>,
    pub selection_cost: Option<Amount>,
    pub quota: Option<Quota>,
    pub step: Step,
    pub pending_tx: Option<TxHandle>,
    pub receipt: Option<PurchaseReceipt>,
    pub status: String,
    pub errors: Vec<String>,
}

pub struct AppController<L> {
    ledger: L,
    config: ControllerConfig,
    view: Option<PoolView>,
    fetched_at: Option<DateTime<Utc>>,
    selection: Selection,
    orchestrator: PurchaseOrchestrator,
    rng: StdRng,
    pub status: String,
    errors: Vec<String>,
    scheduler: RefreshScheduler,
    worker: Option<UnboundedSender<SnapshotWorkerCommand>>,
}

impl<L: Ledger> AppController<L> {
    pub fn new(ledger: L, config: ControllerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            ledger,
            orchestrator: PurchaseOrchestrator::new(config.spender),
            config,
            view: None,
            fetched_at: None,
            selection: Selection::new(),
            rng,
            status: String::from("Ready"),
            errors: Vec::new(),
            scheduler: RefreshScheduler::new(),
            worker: None,
        }
    }

    pub fn account(&self) -> Address {
        self.ledger.account()
    }

    pub fn view(&self) -> Option<&PoolView> {
        self.view.as_ref()
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn orchestrator(&self) -> &PurchaseOrchestrator {
        &self.orchestrator
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn scheduled_refreshes(&self) -> usize {
        self.scheduler.pending()
    }

    /// Routes follow-up refetches through a running snapshot worker.
    pub fn attach_worker(&mut self, tx: UnboundedSender<SnapshotWorkerCommand>) {
        self.worker = Some(tx);
    }

    pub async fn refresh(&mut self) -> Result<&PoolView> {
        match fetch_pool_view(&self.ledger, self.config.spender).await {
            Ok(view) => {
                self.apply_view(view);
                self.view
                    .as_ref()
                    .ok_or_else(|| Error::Ledger("pool view missing after refresh".to_string()))
            }
            Err(err) => {
                self.push_errors(vec![format!("Refresh failed: {err}")]);
                Err(err)
            }
        }
    }

    pub fn apply_view(&mut self, view: PoolView) {
        debug!(
            sold = view.info.sold_count,
            pot = view.info.total_pot,
            state = ?view.info.state,
            "pool view updated"
        );
        self.view = Some(view);
        self.fetched_at = Some(Utc::now());
    }

    pub fn invalidate_cache(&mut self) {
        self.view = None;
        self.fetched_at = None;
    }

    pub fn quota(&self) -> Result<Quota> {
        let view = self.loaded_view()?;
        Ok(view.quota_for(&self.account()))
    }

    pub fn toggle(&mut self, position: Position) -> Result<bool> {
        let quota = self.quota()?;
        let Some(view) = self.view.as_ref() else {
            return Err(Error::validation("pool not loaded yet"));
        };
        let changed = self.selection.toggle(position, &view.grid, quota);
        if !changed {
            debug!(%position, ?quota, "toggle ignored");
        }
        Ok(changed)
    }

    pub fn random_select(&mut self, count: u32) -> Result<usize> {
        let quota = self.quota()?;
        let Some(view) = self.view.as_ref() else {
            return Err(Error::validation("pool not loaded yet"));
        };
        let picked = self
            .selection
            .random_select(count, &view.grid, quota, &mut self.rng)?;
        self.set_status(format!("Quick-picked {picked} cells"));
        Ok(picked)
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selection_cost(&self) -> Option<Amount> {
        let unit_price = self.unit_price()?;
        self.selection.cost(unit_price).ok()
    }

    pub async fn submit(&mut self, proof: Option<Vec<[u8; 32]>>) -> Result<Step> {
        match self
            .orchestrator
            .submit(&self.ledger, &mut self.selection, proof)
            .await
        {
            Ok(step) => {
                self.set_status(format!("Purchase in progress: {step:?}"));
                Ok(step)
            }
            Err(err) => {
                self.push_errors(vec![format!("Purchase failed: {err}")]);
                Err(err)
            }
        }
    }

    /// Feeds an externally observed transaction status to the orchestrator.
    pub async fn notify(&mut self, handle: &TxHandle, status: TxStatus) -> Progress {
        let unit_price = self.unit_price();
        let progress = self
            .orchestrator
            .notify(&self.ledger, handle, status, &mut self.selection, unit_price)
            .await;
        self.handle_progress(&progress).await;
        progress
    }

    pub async fn recheck(&mut self) -> Result<Option<Progress>> {
        let unit_price = self.unit_price();
        let progress = match self
            .orchestrator
            .recheck(&self.ledger, &mut self.selection, unit_price)
            .await
        {
            Ok(progress) => progress,
            Err(err) => {
                self.push_errors(vec![format!("Status check failed: {err}")]);
                return Err(err);
            }
        };
        if let Some(progress) = &progress {
            self.handle_progress(progress).await;
        }
        Ok(progress)
    }

    /// Polls until the purchase completes, fails or stalls on a guard.
    pub async fn wait_for_confirmation(&mut self) -> Result<Progress> {
        for _ in 0..self.config.max_polls {
            match self.recheck().await? {
                None => return Ok(Progress::Advanced(self.orchestrator.step())),
                Some(Progress::Waiting | Progress::Advanced(_)) => {}
                Some(done) => return Ok(done),
            }
            time::sleep(self.config.poll_interval).await;
        }
        warn!(step = ?self.orchestrator.step(), "gave up waiting for confirmation");
        Ok(Progress::Waiting)
    }

    pub fn reset_purchase(&mut self) {
        self.orchestrator.reset();
        self.scheduler.cancel_all();
        self.set_status("Purchase reset");
    }

    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.send(SnapshotWorkerCommand::Shutdown);
        }
    }

    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            account: self.account(),
            view: self.view.clone(),
            fetched_at: self.fetched_at,
            selection: self.selection.positions(),
            selection_cost: self.selection_cost(),
            quota: self.quota().ok(),
            step: self.orchestrator.step(),
            pending_tx: self.orchestrator.pending_tx().cloned(),
            receipt: self.orchestrator.receipt().cloned(),
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    fn loaded_view(&self) -> Result<&PoolView> {
        self.view
            .as_ref()
            .ok_or_else(|| Error::validation("pool not loaded yet"))
    }

    fn unit_price(&self) -> Option<Amount> {
        self.view.as_ref().map(|view| view.info.unit_price)
    }

    async fn handle_progress(&mut self, progress: &Progress) {
        match progress {
            Progress::Waiting => {}
            Progress::Advanced(step) => {
                self.set_status(format!("Approval confirmed, purchase now {step:?}"));
                self.after_confirmation().await;
            }
            Progress::Suppressed(
                reason @ (Suppression::EmptySelection | Suppression::UnknownPrice),
            ) => {
                self.set_status(format!(
                    "Approval confirmed; submit again to purchase ({reason:?})"
                ));
                self.after_confirmation().await;
            }
            Progress::Suppressed(reason) => {
                debug!(?reason, "stale confirmation ignored");
            }
            Progress::Completed(receipt) => {
                self.set_status(format!(
                    "Purchased {} cells for {}",
                    receipt.count, receipt.total_cost
                ));
                self.after_confirmation().await;
            }
            Progress::Failed(err) => {
                self.push_errors(vec![format!("Purchase failed: {err}")]);
                // the approval itself landed; only the purchase was held back
                if self.orchestrator.step() == Step::Approved {
                    self.after_confirmation().await;
                }
            }
        }
    }

    /// Drops cached reads, refetches now and once more after the configured
    /// delay to catch a lagging gateway.
    async fn after_confirmation(&mut self) {
        self.invalidate_cache();
        if let Err(err) = self.refresh().await {
            warn!(%err, "refresh after confirmation failed");
        }
        if let Some(worker) = self.worker.clone() {
            self.scheduler.schedule(
                self.config.refresh_delay,
                worker,
                SnapshotWorkerCommand::FetchNow,
            );
        }
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        info!(status = %self.status, "status");
    }

    fn push_errors(&mut self, mut items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        for item in &items {
            error!("{}", item);
        }
        self.errors.append(&mut items);
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }
}

impl<L: Ledger + Clone + Send + Sync + 'static> AppController<L> {
    /// Starts a snapshot worker reading with this controller's spender and
    /// routes follow-up refetches through it.
    pub fn spawn_worker(
        &mut self,
        poll_interval: Duration,
    ) -> (JoinHandle<()>, UnboundedReceiver<SnapshotWorkerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(snapshot_worker(
            self.ledger.clone(),
            self.config.spender,
            poll_interval,
            cmd_rx,
            snapshot_tx,
        ));
        self.attach_worker(cmd_tx);
        (worker, snapshot_rx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotWorkerCommand {
    FetchNow,
    Shutdown,
}

#[derive(Debug)]
pub enum SnapshotWorkerEvent {
    View(Box<PoolView>),
    Failed(String),
}

/// Background poller feeding fresh pool views to a display loop.
pub async fn snapshot_worker<L: LedgerRead>(
    ledger: L,
    spender: Option<Address>,
    poll_interval: Duration,
    mut cmd_rx: UnboundedReceiver<SnapshotWorkerCommand>,
    snapshot_tx: UnboundedSender<SnapshotWorkerEvent>,
) {
    async fn fetch_snapshot<L: LedgerRead>(
        ledger: &L,
        spender: Option<Address>,
        snapshot_tx: &UnboundedSender<SnapshotWorkerEvent>,
    ) {
        let event = match fetch_pool_view(ledger, spender).await {
            Ok(view) => SnapshotWorkerEvent::View(Box::new(view)),
            Err(err) => {
                warn!(%err, "snapshot fetch failed");
                SnapshotWorkerEvent::Failed(err.to_string())
            }
        };
        if snapshot_tx.send(event).is_err() {
            debug!("snapshot receiver dropped");
        }
    }

    let mut ticker = time::interval(poll_interval);
    loop {
        if snapshot_tx.is_closed() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                fetch_snapshot(&ledger, spender, &snapshot_tx).await;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                match cmd {
                    SnapshotWorkerCommand::FetchNow => {
                        fetch_snapshot(&ledger, spender, &snapshot_tx).await;
                    }
                    SnapshotWorkerCommand::Shutdown => break,
                }
            }
        }
    }
    info!("snapshot worker stopped");
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        ledger::InMemoryLedger,
        types::{
            PaymentAsset,
            PoolState,
        },
    };

    const ALICE: Address = Address::new([0xa1; 20]);

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new(
            ALICE,
            PoolInfo {
                pool: Address::new([0x50; 20]),
                state: PoolState::Open,
                unit_price: 100,
                asset: PaymentAsset::Native,
                total_pot: 0,
                sold_count: 0,
                cells_per_user: Some(3),
            },
        )
    }

    #[tokio::test]
    async fn toggle__needs_a_loaded_pool() {
        let mut controller = AppController::new(ledger(), ControllerConfig::default());

        let result = controller.toggle(Position::new(1).unwrap());

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn random_select__respects_pool_quota() {
        // given
        let config = ControllerConfig {
            seed: Some(11),
            ..ControllerConfig::default()
        };
        let mut controller = AppController::new(ledger(), config);
        controller.refresh().await.unwrap();

        // when
        let picked = controller.random_select(10).unwrap();

        // then
        assert_eq!(picked, 3);
        assert_eq!(controller.selection_cost(), Some(300));
    }

    #[tokio::test]
    async fn push_errors__keeps_latest_fifty() {
        let mut controller = AppController::new(ledger(), ControllerConfig::default());

        controller.push_errors((0..60).map(|i| format!("error {i}")).collect());

        assert_eq!(controller.errors().len(), MAX_ERRORS);
        assert_eq!(controller.errors()[0], "error 10");
    }

    #[tokio::test]
    async fn spawn_worker__reads_allowance_for_configured_spender() {
        // given
        let token = Address::new([0x70; 20]);
        let spender = Address::new([0x5e; 20]);
        let ledger = InMemoryLedger::new(
            ALICE,
            PoolInfo {
                pool: Address::new([0x50; 20]),
                state: PoolState::Open,
                unit_price: 100,
                asset: PaymentAsset::Fungible { token, decimals: 6 },
                total_pot: 0,
                sold_count: 0,
                cells_per_user: None,
            },
        );
        ledger.set_allowance(token, ALICE, spender, 500);
        let config = ControllerConfig {
            spender: Some(spender),
            ..ControllerConfig::default()
        };
        let mut controller = AppController::new(ledger, config);

        // when
        let (worker, mut snapshot_rx) = controller.spawn_worker(Duration::from_secs(60));
        let first = snapshot_rx.recv().await;
        controller.shutdown();

        // then
        let Some(SnapshotWorkerEvent::View(view)) = first else {
            panic!("expected a view, got {first:?}");
        };
        assert_eq!(view.allowance, Some(500));
        time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_worker__stops_on_shutdown() {
        // given
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(snapshot_worker(
            ledger(),
            None,
            Duration::from_secs(60),
            cmd_rx,
            snapshot_tx,
        ));

        // when
        let first = snapshot_rx.recv().await;
        cmd_tx.send(SnapshotWorkerCommand::Shutdown).unwrap();

        // then
        assert!(matches!(first, Some(SnapshotWorkerEvent::View(_))));
        time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
