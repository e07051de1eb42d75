//! Pipeline driver
//!
//! Runs the initialization pipeline in order:
//! 1. Resolve the connection and network
//! 2. Look up the network's contracts (unsupported networks stop here)
//! 3. Bind both tokens and the exchange, installing its event subscriptions
//! 4. Load the account and its native balance
//! 5. Take the first balance snapshot
//!
//! Then reacts to agent notices, exchange events and user commands. A network
//! change tears everything down and restarts from step 1.

mod command;

pub use command::SessionCommand;

use crate::account::{self, Account};
use crate::agent::{AgentNotice, ChainAgent, SessionId};
use crate::chain::{self, Connection};
use crate::config::{ContractDirectory, NetworkContracts};
use crate::contracts::{bind_exchange, bind_token, ExchangeBinding, TokenHandle, TransferHandler};
use crate::error::{ClientError, ClientResult};
use crate::events::{DispatchSink, Emitted, StateEvent, TokenSlot, TransferEvent};
use crate::reconcile::{reconcile, BalanceSnapshot};
use crate::transfer::{TransferBook, TransferDirection, TransferOrchestrator, TransferRequest, TransferStatus};
use crate::units::Quantity;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work arriving from subscriptions and transfer tasks, tagged with the
/// session it belongs to
enum Inbound {
    Exchange(SessionId, TransferEvent),
    Progress(SessionId, TransferRequest),
    Finished(SessionId, Emitted<TransferRequest>),
}

/// Bound contracts of a supported network
#[derive(Clone)]
struct Deployment {
    tokens: [TokenHandle; 2],
    exchange: ExchangeBinding,
}

/// State of one pipeline run
struct Pipeline {
    connection: Connection,
    chain_id: u64,
    deployment: Option<Deployment>,
    account: Option<Account>,
}

/// Exchange client session
pub struct Session {
    agent: Option<Arc<dyn ChainAgent>>,
    directory: Arc<dyn ContractDirectory>,
    sink: Arc<dyn DispatchSink>,
    notices: Option<broadcast::Receiver<AgentNotice>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    pipeline: Option<Pipeline>,
    transfers: TransferBook,
    balances: BalanceSnapshot,
}

impl Session {
    pub fn new(
        agent: Option<Arc<dyn ChainAgent>>,
        directory: Arc<dyn ContractDirectory>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        let notices = agent.as_ref().map(|agent| agent.notices());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            agent,
            directory,
            sink,
            notices,
            inbound_tx,
            inbound_rx,
            pipeline: None,
            transfers: TransferBook::new(),
            balances: BalanceSnapshot::default(),
        }
    }

    /// Connection of the current pipeline run
    pub fn connection(&self) -> Option<&Connection> {
        self.pipeline.as_ref().map(|p| &p.connection)
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.pipeline.as_ref().map(|p| p.chain_id)
    }

    pub fn account(&self) -> Option<Account> {
        self.pipeline.as_ref().and_then(|p| p.account)
    }

    /// Last known balances
    pub fn balances(&self) -> &BalanceSnapshot {
        &self.balances
    }

    /// In-flight transfers
    pub fn transfers(&self) -> &TransferBook {
        &self.transfers
    }

    /// Dispatch events, keeping the balance snapshot in step
    fn emit<T>(&mut self, emitted: Emitted<T>) -> T {
        self.balances.apply_all(&emitted.events);
        emitted.dispatch(self.sink.as_ref())
    }

    /// Run the initialization pipeline.
    ///
    /// Setup failures are returned. `UserDeclined` leaves the pipeline
    /// waiting for `retry_account`.
    pub async fn start(&mut self) -> ClientResult<()> {
        let resolved = chain::resolve(self.agent.clone()).await?;
        let connection = self.emit(resolved);
        let network = chain::resolve_network(&connection).await?;
        let chain_id = self.emit(network);

        self.pipeline = Some(Pipeline {
            connection: connection.clone(),
            chain_id,
            deployment: None,
            account: None,
        });

        match self.directory.lookup(chain_id) {
            Some(contracts) => {
                let deployment = self.bind(&connection, &contracts).await?;
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.deployment = Some(deployment);
                }
            }
            None => info!("Network {} has no configured deployment, skipping contracts", chain_id),
        }

        self.load_account().await
    }

    async fn bind(&mut self, connection: &Connection, contracts: &NetworkContracts) -> ClientResult<Deployment> {
        let first = bind_token(TokenSlot::First, contracts.token_a.address, connection).await?;
        let first = self.emit(first);
        let second = bind_token(TokenSlot::Second, contracts.token_b.address, connection).await?;
        let second = self.emit(second);

        let session = connection.session();
        let tx = self.inbound_tx.clone();
        let on_transfer: TransferHandler = Arc::new(move |event: TransferEvent| {
            // Receiver gone means the session was dropped
            let _ = tx.send(Inbound::Exchange(session, event));
        });
        let exchange = bind_exchange(contracts.exchange.address, connection, on_transfer).await?;
        let exchange = self.emit(exchange);

        Ok(Deployment {
            tokens: [first, second],
            exchange,
        })
    }

    async fn load_account(&mut self) -> ClientResult<()> {
        let connection = self
            .connection()
            .cloned()
            .ok_or_else(|| ClientError::NotReady("no connection".to_string()))?;

        let account = match account::resolve_account(&connection).await {
            Ok(emitted) => self.emit(emitted),
            Err(e) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.account = None;
                }
                return Err(e);
            }
        };

        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.account = Some(account);
        }

        self.refresh_balances().await
    }

    /// Request account access again, then reconcile. Runs the whole
    /// pipeline when setup stopped before a connection was established.
    pub async fn retry_account(&mut self) -> ClientResult<()> {
        if self.pipeline.is_none() {
            return self.start().await;
        }
        self.load_account().await
    }

    fn ready(&self) -> Option<(Deployment, Account)> {
        let pipeline = self.pipeline.as_ref()?;
        Some((pipeline.deployment.clone()?, pipeline.account?))
    }

    /// Take a fresh balance snapshot. Does nothing on an unsupported network
    /// or before an account is loaded.
    pub async fn refresh_balances(&mut self) -> ClientResult<()> {
        let Some((deployment, account)) = self.ready() else {
            debug!("Skipping reconcile, contracts or account not loaded");
            return Ok(());
        };

        let emitted = reconcile(&deployment.tokens, &deployment.exchange.handle, account, &self.balances).await;
        self.balances = self.emit(emitted);
        Ok(())
    }

    /// Tear down the current pipeline run
    async fn reset(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Some(deployment) = pipeline.deployment {
                deployment.exchange.teardown().await;
            }
            debug!("Dropped pipeline for {}", pipeline.connection.session());
        }

        if !self.transfers.is_empty() {
            warn!("Discarding {} in-flight transfers", self.transfers.len());
        }
        self.transfers.clear();
        self.balances = BalanceSnapshot::default();
    }

    pub async fn handle_notice(&mut self, notice: AgentNotice) -> ClientResult<()> {
        match notice {
            AgentNotice::ChainChanged(chain_id) => {
                info!("Agent switched to network {}, restarting", chain_id);
                self.reset().await;
                crate::metrics::record_pipeline_restart("network_changed");
                self.start().await
            }
            AgentNotice::AccountsChanged(accounts) => {
                if self.pipeline.is_none() {
                    return Ok(());
                }
                info!("Agent accounts changed to {:?}", accounts);
                self.load_account().await
            }
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.pipeline
            .as_ref()
            .map_or(false, |p| p.connection.session() == session)
    }

    async fn handle_inbound(&mut self, inbound: Inbound) -> ClientResult<()> {
        match inbound {
            Inbound::Exchange(session, event) => {
                if !self.is_current(session) {
                    debug!("Dropping exchange event from superseded {}", session);
                    return Ok(());
                }
                self.handle_transfer_event(event).await
            }
            Inbound::Progress(session, request) => {
                if self.is_current(session) {
                    self.transfers.track(request);
                }
                Ok(())
            }
            Inbound::Finished(session, emitted) => {
                if !self.is_current(session) {
                    debug!("Dropping result of superseded transfer {}", emitted.value.id);
                    return Ok(());
                }
                let request = self.emit(emitted);
                let failed = request.status == TransferStatus::Failed;
                self.transfers.finish(request);
                if failed {
                    self.refresh_balances().await?;
                    self.transfers.drain_terminal();
                }
                Ok(())
            }
        }
    }

    /// Dispatch an observed exchange event. Matching transfers are confirmed
    /// whichever account initiated them; events for the active account also
    /// trigger a reconcile.
    async fn handle_transfer_event(&mut self, event: TransferEvent) -> ClientResult<()> {
        let user = event.user;
        self.emit(Emitted::new(()).with(StateEvent::TransferSuccess { event: event.clone() }));

        if let Some(confirmed) = self
            .transfers
            .confirm(&event)
            .and_then(|id| self.transfers.get(&id))
        {
            info!("Transfer {} confirmed", confirmed.id);
            crate::metrics::record_transfer(confirmed.direction, "confirmed");
        }

        if self.account() == Some(user) {
            self.refresh_balances().await?;
        } else {
            debug!("Exchange event for {:?} is not for the active account", user);
        }
        self.transfers.drain_terminal();
        Ok(())
    }

    /// Validate and request a transfer, then run it on its own task.
    ///
    /// `TRANSFER_REQUEST` is dispatched before this returns; progress and the
    /// outcome come back through the session's inbound queue.
    pub fn start_transfer(
        &mut self,
        direction: TransferDirection,
        slot: TokenSlot,
        amount: &str,
    ) -> ClientResult<(Uuid, JoinHandle<()>)> {
        let amount = Quantity::parse(amount)?;
        let (deployment, account) = self
            .ready()
            .ok_or_else(|| ClientError::NotReady("contracts or account not loaded".to_string()))?;

        let token = deployment.tokens[slot.index()].clone();
        let orchestrator = TransferOrchestrator::new(&deployment.exchange.handle, account);
        let session = token.connection().session();

        let requested = orchestrator.request(direction, &token, amount)?;
        let request = self.emit(requested);
        let id = request.id;
        self.transfers.track(request.clone());

        let progress_tx = self.inbound_tx.clone();
        let done_tx = self.inbound_tx.clone();
        let task = tokio::spawn(async move {
            let done = orchestrator
                .execute(&token, request, move |r: &TransferRequest| {
                    let _ = progress_tx.send(Inbound::Progress(session, r.clone()));
                })
                .await;
            let _ = done_tx.send(Inbound::Finished(session, done));
        });

        Ok((id, task))
    }

    /// Run a transfer to completion and process everything it produced
    pub async fn transfer(&mut self, direction: TransferDirection, slot: TokenSlot, amount: &str) -> ClientResult<Uuid> {
        let (id, task) = self.start_transfer(direction, slot, amount)?;
        if let Err(e) = task.await {
            error!("Transfer task {} aborted: {}", id, e);
        }
        self.drain_pending().await;
        Ok(id)
    }

    /// Handle every queued notice and inbound item without waiting
    pub async fn drain_pending(&mut self) {
        loop {
            let notice = self.notices.as_mut().and_then(|rx| rx.try_recv().ok());
            if let Some(notice) = notice {
                if let Err(e) = self.handle_notice(notice).await {
                    report(&e);
                }
                continue;
            }

            match self.inbound_rx.try_recv() {
                Ok(inbound) => {
                    if let Err(e) = self.handle_inbound(inbound).await {
                        report(&e);
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ClientResult<()> {
        match command {
            SessionCommand::Transfer {
                direction,
                slot,
                amount,
            } => {
                // Detached; the outcome arrives as `Inbound::Finished`
                self.start_transfer(direction, slot, &amount).map(|_| ())
            }
            SessionCommand::RetryAccount => self.retry_account().await,
            SessionCommand::Refresh => self.refresh_balances().await,
        }
    }

    /// Steady-state loop: agent notices, exchange events, transfer progress
    /// and user commands, until `shutdown` resolves
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        shutdown: impl Future<Output = ()>,
    ) -> ClientResult<()> {
        let mut notices = self
            .notices
            .take()
            .ok_or_else(|| ClientError::AgentUnavailable("no chain-access agent installed".to_string()))?;
        let mut commands_open = true;
        tokio::pin!(shutdown);

        info!("Session running");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                notice = notices.recv() => match notice {
                    Ok(notice) => {
                        if let Err(e) = self.handle_notice(notice).await {
                            report(&e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} agent notices, restarting", missed);
                        self.reset().await;
                        crate::metrics::record_pipeline_restart("notices_lagged");
                        if let Err(e) = self.start().await {
                            report(&e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        error!("Agent notice stream closed");
                        break;
                    }
                },

                Some(inbound) = self.inbound_rx.recv() => {
                    if let Err(e) = self.handle_inbound(inbound).await {
                        report(&e);
                    }
                }

                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            report(&e);
                        }
                    }
                    None => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                },
            }
        }

        self.notices = Some(notices);
        self.reset().await;
        info!("Session stopped");
        Ok(())
    }
}

fn report(e: &ClientError) {
    if e.is_fatal() {
        error!("{}", e);
    } else {
        warn!("{}", e);
    }
}
