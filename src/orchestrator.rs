use crate::{
    error::{
        Error,
        Result,
    },
    ledger::{
        Ledger,
        LedgerError,
    },
    selection::{
        Quota,
        Selection,
    },
    types::{
        Address,
        Amount,
        PaymentAsset,
        PoolInfo,
        Position,
        PurchaseOrder,
        TxHandle,
        TxKind,
        TxStatus,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use itertools::Itertools;
use std::{
    collections::HashMap,
    fmt,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Token minted for every purchase attempt. Confirmations carrying an older
/// token are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a failed step hands control back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    Idle,
    CheckingAllowance,
    Approved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Idle,
    // native
    Submitting,
    Confirming,
    // fungible
    CheckingAllowance,
    ApprovalSubmitting,
    ApprovalConfirming,
    Approved,
    PurchaseSubmitting,
    PurchaseConfirming,
    Complete,
    Error(Resume),
}

impl From<Resume> for Step {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::Idle => Step::Idle,
            Resume::CheckingAllowance => Step::CheckingAllowance,
            Resume::Approved => Step::Approved,
        }
    }
}

/// Which transaction, if any, the current session is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InFlight {
    None,
    Approving(SessionId),
    Purchasing(SessionId),
}

/// Why a status notification did not move the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suppression {
    NoSession,
    UnknownHandle,
    NotApproving,
    NotPurchasing,
    EmptySelection,
    UnknownPrice,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub session: SessionId,
    pub count: u32,
    pub total_cost: Amount,
    pub positions: Vec<Position>,
    pub tx: TxHandle,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Waiting,
    Advanced(Step),
    Suppressed(Suppression),
    Completed(PurchaseReceipt),
    Failed(Error),
}

/// Positions and cost captured right before a purchase is broadcast.
#[derive(Clone, Debug)]
struct PurchaseSnapshot {
    positions: Vec<Position>,
    total_cost: Amount,
}

#[derive(Clone, Debug)]
struct PurchaseSession {
    id: SessionId,
    asset: PaymentAsset,
    spender: Address,
    proof: Option<Vec<[u8; 32]>>,
    pending: Option<TxHandle>,
    requested_approval: Option<Amount>,
    approved: Option<Amount>,
    purchase_resume: Resume,
    snapshot: Option<PurchaseSnapshot>,
}

enum Entry {
    Fresh,
    Allowance,
    Approved,
}

/// Drives a selection through approval (when the pool is paid in a fungible
/// token) and purchase.
#[derive(Debug)]
pub struct PurchaseOrchestrator {
    spender: Option<Address>,
    step: Step,
    history: Vec<Step>,
    in_flight: InFlight,
    session: Option<PurchaseSession>,
    issued: HashMap<TxHandle, TxKind>,
    next_session: u64,
    receipt: Option<PurchaseReceipt>,
    last_error: Option<Error>,
}

impl Default for PurchaseOrchestrator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PurchaseOrchestrator {
    /// `spender` overrides the account granted the allowance; the pool itself
    /// when `None`.
    pub fn new(spender: Option<Address>) -> Self {
        Self {
            spender,
            step: Step::Idle,
            history: vec![Step::Idle],
            in_flight: InFlight::None,
            session: None,
            issued: HashMap::new(),
            next_session: 1,
            receipt: None,
            last_error: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Steps visited by the current session, starting at `Idle`.
    pub fn history(&self) -> &[Step] {
        &self.history
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn pending_tx(&self) -> Option<&TxHandle> {
        self.session.as_ref().and_then(|s| s.pending.as_ref())
    }

    pub fn receipt(&self) -> Option<&PurchaseReceipt> {
        self.receipt.as_ref()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Handles still awaiting a terminal status.
    pub fn tracked_transactions(&self) -> usize {
        self.issued.len()
    }

    /// Starts or resumes a purchase of the current selection.
    ///
    /// The pool and grid are refetched first. Cells sold in the meantime, or
    /// beyond the account's remaining quota, are removed from the selection
    /// and reported as a validation error so the new cost can be reviewed.
    pub async fn submit<L: Ledger>(
        &mut self,
        ledger: &L,
        selection: &mut Selection,
        proof: Option<Vec<[u8; 32]>>,
    ) -> Result<Step> {
        let entry = self.entry()?;
        if selection.is_empty() {
            return Err(Error::validation("no cells selected"));
        }
        let (pool, snapshot) = revalidate_selection(ledger, selection).await?;
        self.last_error = None;

        match entry {
            Entry::Fresh => {
                self.start_session(pool.asset, self.spender.unwrap_or(pool.pool), proof);
                match pool.asset {
                    PaymentAsset::Native => self.submit_purchase(ledger, snapshot).await,
                    PaymentAsset::Fungible { .. } => self.check_allowance(ledger, snapshot).await,
                }
            }
            Entry::Allowance => {
                self.session_mut()?.proof = proof;
                self.check_allowance(ledger, snapshot).await
            }
            Entry::Approved => {
                self.session_mut()?.proof = proof;
                self.submit_purchase(ledger, snapshot).await
            }
        }
    }

    /// Feeds a transaction status into the state machine.
    ///
    /// A confirmed approval only continues into the purchase when it belongs to
    /// the session currently approving, the selection is still non-empty and
    /// the unit price is known. The selection is then checked against a fresh
    /// pool and grid just like `submit` does. Otherwise the session rests in
    /// `Approved` until `submit` is called again.
    pub async fn notify<L: Ledger>(
        &mut self,
        ledger: &L,
        handle: &TxHandle,
        status: TxStatus,
        selection: &mut Selection,
        unit_price: Option<Amount>,
    ) -> Progress {
        let issued = match status {
            TxStatus::Pending => self.issued.get(handle).copied(),
            _ => self.issued.remove(handle),
        };
        let Some(issued) = issued else {
            return self.suppress(handle, Suppression::UnknownHandle);
        };
        let Some(current) = self.session() else {
            return self.suppress(handle, Suppression::NoSession);
        };

        match status {
            TxStatus::Pending => Progress::Waiting,
            TxStatus::Failed { reason } => {
                let (expected, resume) = match issued {
                    TxKind::Approval => (InFlight::Approving(current), Resume::CheckingAllowance),
                    TxKind::Purchase => (
                        InFlight::Purchasing(current),
                        self.session
                            .as_ref()
                            .map_or(Resume::Idle, |s| s.purchase_resume),
                    ),
                };
                if self.in_flight != expected {
                    return self.suppress(handle, not_in_flight(issued));
                }
                Progress::Failed(self.fail(Error::TransactionFailed(reason), resume))
            }
            TxStatus::Confirmed { kind } => {
                if kind != issued {
                    warn!(%handle, reported = ?kind, expected = ?issued, "confirmation kind mismatch");
                }
                match issued {
                    TxKind::Approval => {
                        self.approval_confirmed(ledger, handle, current, selection, unit_price)
                            .await
                    }
                    TxKind::Purchase => self.purchase_confirmed(handle, current, selection),
                }
            }
        }
    }

    /// Polls the ledger once for the pending transaction, if any.
    pub async fn recheck<L: Ledger>(
        &mut self,
        ledger: &L,
        selection: &mut Selection,
        unit_price: Option<Amount>,
    ) -> Result<Option<Progress>> {
        let Some(handle) = self.pending_tx().cloned() else {
            return Ok(None);
        };
        let status = ledger.status(&handle).await?;
        Ok(Some(
            self.notify(ledger, &handle, status, selection, unit_price)
                .await,
        ))
    }

    /// Abandons the current session. Transactions already broadcast are not
    /// cancelled; their confirmations are ignored from now on.
    pub fn reset(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session = %session.id, step = ?self.step, "purchase session reset");
        }
        self.in_flight = InFlight::None;
        self.step = Step::Idle;
        self.history = vec![Step::Idle];
        self.receipt = None;
        self.last_error = None;
    }

    pub fn dismiss_error(&mut self) {
        if let Step::Error(resume) = self.step {
            self.last_error = None;
            self.enter(resume.into());
        }
    }

    fn entry(&self) -> Result<Entry> {
        let resumable = self.session.is_some();
        match self.step {
            Step::CheckingAllowance | Step::Error(Resume::CheckingAllowance) if resumable => {
                Ok(Entry::Allowance)
            }
            Step::Approved | Step::Error(Resume::Approved) if resumable => Ok(Entry::Approved),
            Step::Idle
            | Step::Complete
            | Step::CheckingAllowance
            | Step::Approved
            | Step::Error(_) => Ok(Entry::Fresh),
            busy => Err(Error::validation(format!(
                "a purchase is already in progress ({busy:?})"
            ))),
        }
    }

    fn start_session(
        &mut self,
        asset: PaymentAsset,
        spender: Address,
        proof: Option<Vec<[u8; 32]>>,
    ) {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        // Handles from earlier sessions can no longer advance anything.
        self.issued.clear();
        let purchase_resume = match asset {
            PaymentAsset::Native => Resume::Idle,
            PaymentAsset::Fungible { .. } => Resume::CheckingAllowance,
        };
        self.session = Some(PurchaseSession {
            id,
            asset,
            spender,
            proof,
            pending: None,
            requested_approval: None,
            approved: None,
            purchase_resume,
            snapshot: None,
        });
        self.in_flight = InFlight::None;
        self.receipt = None;
        self.last_error = None;
        self.step = Step::Idle;
        self.history = vec![Step::Idle];
        info!(session = %id, ?asset, "purchase session started");
    }

    fn session_mut(&mut self) -> Result<&mut PurchaseSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::validation("no purchase session"))
    }

    async fn check_allowance<L: Ledger>(
        &mut self,
        ledger: &L,
        snapshot: PurchaseSnapshot,
    ) -> Result<Step> {
        let session = self.session_mut()?;
        let (id, spender) = (session.id, session.spender);
        let Some(token) = session.asset.token().copied() else {
            return Err(Error::validation("native pools need no allowance"));
        };
        if self.step != Step::CheckingAllowance {
            self.enter(Step::CheckingAllowance);
        }

        let available = ledger.allowance(&token, &spender).await?;
        if available >= snapshot.total_cost {
            debug!(session = %id, available, required = snapshot.total_cost, "allowance sufficient");
            self.session_mut()?.purchase_resume = Resume::CheckingAllowance;
            return self.submit_purchase(ledger, snapshot).await;
        }

        self.enter(Step::ApprovalSubmitting);
        match ledger.approve(&token, &spender, snapshot.total_cost).await {
            Ok(handle) => {
                self.issued.insert(handle.clone(), TxKind::Approval);
                let session = self.session_mut()?;
                session.pending = Some(handle.clone());
                session.requested_approval = Some(snapshot.total_cost);
                session.approved = None;
                self.in_flight = InFlight::Approving(id);
                info!(session = %id, %handle, amount = snapshot.total_cost, "approval submitted");
                self.enter(Step::ApprovalConfirming);
                Ok(self.step)
            }
            Err(err) => Err(self.fail(err.into(), Resume::CheckingAllowance)),
        }
    }

    async fn submit_purchase<L: Ledger>(
        &mut self,
        ledger: &L,
        snapshot: PurchaseSnapshot,
    ) -> Result<Step> {
        let session = self.session_mut()?;
        let id = session.id;
        let native = session.asset == PaymentAsset::Native;
        let resume = session.purchase_resume;
        let approved = session.approved;
        let order = PurchaseOrder {
            positions: snapshot.positions.clone(),
            total_cost: snapshot.total_cost,
            proof: session.proof.clone(),
        };
        if let Some(approved) = approved
            && snapshot.total_cost > approved
        {
            let err = Error::Allowance {
                required: snapshot.total_cost,
                available: approved,
            };
            return Err(self.fail(err, Resume::CheckingAllowance));
        }

        self.enter(if native {
            Step::Submitting
        } else {
            Step::PurchaseSubmitting
        });
        match ledger.purchase(&order).await {
            Ok(handle) => {
                self.issued.insert(handle.clone(), TxKind::Purchase);
                let session = self.session_mut()?;
                session.pending = Some(handle.clone());
                session.snapshot = Some(snapshot);
                self.in_flight = InFlight::Purchasing(id);
                info!(session = %id, %handle, cells = order.positions.len(), "purchase submitted");
                self.enter(if native {
                    Step::Confirming
                } else {
                    Step::PurchaseConfirming
                });
                Ok(self.step)
            }
            Err(err) => {
                let resume = match err {
                    LedgerError::InsufficientAllowance { .. } if !native => {
                        Resume::CheckingAllowance
                    }
                    _ => resume,
                };
                Err(self.fail(err.into(), resume))
            }
        }
    }

    async fn approval_confirmed<L: Ledger>(
        &mut self,
        ledger: &L,
        handle: &TxHandle,
        current: SessionId,
        selection: &mut Selection,
        unit_price: Option<Amount>,
    ) -> Progress {
        if self.in_flight != InFlight::Approving(current) {
            return self.suppress(handle, Suppression::NotApproving);
        }
        self.in_flight = InFlight::None;
        if let Some(session) = self.session.as_mut() {
            session.pending = None;
            session.approved = session.requested_approval;
            session.purchase_resume = Resume::Approved;
        }
        info!(session = %current, %handle, "approval confirmed");

        if selection.is_empty() {
            self.enter(Step::Approved);
            return self.suppress(handle, Suppression::EmptySelection);
        }
        if unit_price.is_none() {
            self.enter(Step::Approved);
            return self.suppress(handle, Suppression::UnknownPrice);
        }
        let snapshot = match revalidate_selection(ledger, selection).await {
            Ok((_, snapshot)) => snapshot,
            Err(err) => {
                warn!(session = %current, error = %err, "purchase held after approval");
                self.last_error = Some(err.clone());
                self.enter(Step::Approved);
                return Progress::Failed(err);
            }
        };
        match self.submit_purchase(ledger, snapshot).await {
            Ok(step) => Progress::Advanced(step),
            Err(err) => Progress::Failed(err),
        }
    }

    fn purchase_confirmed(
        &mut self,
        handle: &TxHandle,
        current: SessionId,
        selection: &mut Selection,
    ) -> Progress {
        if self.in_flight != InFlight::Purchasing(current) {
            return self.suppress(handle, Suppression::NotPurchasing);
        }
        self.in_flight = InFlight::None;
        let snapshot = self.session.as_mut().and_then(|s| {
            s.pending = None;
            s.snapshot.take()
        });
        let (positions, total_cost) = snapshot
            .map(|s| (s.positions, s.total_cost))
            .unwrap_or_default();
        selection.clear();
        let receipt = PurchaseReceipt {
            session: current,
            count: positions.len() as u32,
            total_cost,
            positions,
            tx: handle.clone(),
            confirmed_at: Utc::now(),
        };
        info!(
            session = %current,
            %handle,
            count = receipt.count,
            total_cost = receipt.total_cost,
            "purchase confirmed"
        );
        self.receipt = Some(receipt.clone());
        self.enter(Step::Complete);
        Progress::Completed(receipt)
    }

    fn fail(&mut self, err: Error, resume: Resume) -> Error {
        self.in_flight = InFlight::None;
        if let Some(session) = self.session.as_mut() {
            session.pending = None;
        }
        warn!(session = ?self.session(), step = ?self.step, error = %err, "purchase step failed");
        self.last_error = Some(err.clone());
        self.enter(Step::Error(resume));
        err
    }

    fn suppress(&self, handle: &TxHandle, reason: Suppression) -> Progress {
        debug!(%handle, ?reason, step = ?self.step, "confirmation ignored");
        Progress::Suppressed(reason)
    }

    fn enter(&mut self, step: Step) {
        info!(session = ?self.session(), from = ?self.step, to = ?step, "purchase step");
        self.step = step;
        self.history.push(step);
    }
}

/// Refetches the pool and grid, then drops cells sold in the meantime or
/// beyond the account's remaining quota. Any drop is reported as a validation
/// error with the selection already pruned.
async fn revalidate_selection<L: Ledger>(
    ledger: &L,
    selection: &mut Selection,
) -> Result<(PoolInfo, PurchaseSnapshot)> {
    let (pool, grid) = futures::try_join!(ledger.pool_info(), ledger.grid())?;
    if !pool.state.accepts_purchases() {
        return Err(Error::validation(format!(
            "pool is not open for purchases ({:?})",
            pool.state
        )));
    }
    let quota = Quota::for_account(pool.cells_per_user, grid.owned_by(&ledger.account()));
    let dropped = selection.revalidate(&grid, quota);
    if !dropped.is_empty() {
        return Err(Error::validation(format!(
            "cells {} are no longer available; review the updated selection",
            dropped.iter().join(", ")
        )));
    }
    let snapshot = PurchaseSnapshot {
        positions: selection.positions(),
        total_cost: selection.cost(pool.unit_price)?,
    };
    Ok((pool, snapshot))
}

fn not_in_flight(kind: TxKind) -> Suppression {
    match kind {
        TxKind::Approval => Suppression::NotApproving,
        TxKind::Purchase => Suppression::NotPurchasing,
    }
}
