//! Execution engine - Dispatch slices through the pool, aggregate one report

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::WorkerPool;
use crate::context::EngineContext;
use crate::core::config::ExecutionConfig;
use crate::core::{
    CancelToken, Error, Fill, OrderStatus, PositionSource, Route, RouteSlice, Side, Symbol,
};
use crate::router::RoutingDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Filled,
    PartiallyFilled,
    /// Resting on the book with nothing filled yet
    Accepted,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SliceReport {
    pub slice_id: Uuid,
    pub route: Route,
    pub priority: u32,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
    pub status: SliceStatus,
    pub attempts: u32,
    pub exchange_order_id: Option<String>,
    pub error_code: Option<&'static str>,
    pub error: Option<String>,
    pub latency_us: u64,
}

impl SliceReport {
    fn pending(slice: &RouteSlice) -> Self {
        Self {
            slice_id: slice.id,
            route: slice.route.clone(),
            priority: slice.priority,
            quantity: slice.quantity,
            filled_quantity: Decimal::ZERO,
            avg_price: None,
            fee: Decimal::ZERO,
            status: SliceStatus::Failed,
            attempts: 0,
            exchange_order_id: None,
            error_code: None,
            error: None,
            latency_us: 0,
        }
    }

    fn failed(slice: &RouteSlice, err: &Error) -> Self {
        Self::pending(slice).with_error(err)
    }

    fn cancelled(slice: &RouteSlice) -> Self {
        Self {
            status: SliceStatus::Cancelled,
            ..Self::pending(slice)
        }
    }

    fn with_error(mut self, err: &Error) -> Self {
        self.status = SliceStatus::Failed;
        self.error_code = Some(err.code());
        self.error = Some(err.to_string());
        self
    }

    pub fn is_filled(&self) -> bool {
        self.status == SliceStatus::Filled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    PartiallyFilled,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub decision_id: Uuid,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub total_fee: Decimal,
    pub avg_price: Option<Decimal>,
    /// Signed against the order: positive means worse than the reference
    pub slippage: Option<Decimal>,
    pub status: ExecutionStatus,
    /// Priority order
    pub slices: Vec<SliceReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    fn aggregate(decision: &RoutingDecision, slices: Vec<SliceReport>, started_at: DateTime<Utc>) -> Self {
        let filled: Decimal = slices.iter().map(|s| s.filled_quantity).sum();
        let total_fee = slices.iter().map(|s| s.fee).sum();
        let value: Decimal = slices
            .iter()
            .filter_map(|s| s.avg_price.map(|p| p * s.filled_quantity))
            .sum();
        let avg_price = (!filled.is_zero()).then(|| value / filled);

        let reference = decision.order.price.or(decision.reference_price);
        let slippage = match (avg_price, reference) {
            (Some(avg), Some(reference)) if !reference.is_zero() => {
                Some((avg - reference) / reference * decision.order.side.sign())
            }
            _ => None,
        };

        let requested = decision.order.quantity;
        let resting = slices.iter().any(|s| s.status == SliceStatus::Accepted);
        let status = if filled >= requested {
            ExecutionStatus::Completed
        } else if filled.is_zero() && !resting {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::PartiallyFilled
        };

        Self {
            decision_id: decision.id,
            client_order_id: decision.order.client_order_id.clone(),
            symbol: decision.order.symbol.clone(),
            side: decision.order.side,
            requested_quantity: requested,
            filled_quantity: filled,
            total_fee,
            avg_price,
            slippage,
            status,
            slices,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Per-slice timeout and retry budget
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub timeout: Duration,
    /// Resubmissions after a timeout; other errors are never retried
    pub max_retries: u32,
}

impl DispatchPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            timeout: config.order_timeout(),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub decisions: u64,
    pub slices_dispatched: u64,
    pub slices_filled: u64,
    pub slices_failed: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub rate_limited: u64,
}

#[derive(Default)]
struct Counters {
    decisions: AtomicU64,
    dispatched: AtomicU64,
    filled: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
}

/// What a slice task needs, shared by every job
struct Dispatcher {
    ctx: Arc<EngineContext>,
    fills: Arc<dyn PositionSource>,
    order_weight: u32,
    counters: Counters,
}

impl Dispatcher {
    /// Runs on a pool worker; scheduled slices are only submitted once due
    async fn run(&self, slice: RouteSlice, policy: DispatchPolicy, cancel: CancelToken) -> SliceReport {
        if cancel.is_cancelled() {
            return SliceReport::cancelled(&slice);
        }

        let start = Instant::now();
        let report = self.place(&slice, policy, &cancel).await;
        let report = SliceReport {
            latency_us: start.elapsed().as_micros() as u64,
            ..report
        };

        let c = &self.counters;
        match report.status {
            SliceStatus::Filled => c.filled.fetch_add(1, Ordering::Relaxed),
            SliceStatus::Failed => c.failed.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        report
    }

    async fn place(&self, slice: &RouteSlice, policy: DispatchPolicy, cancel: &CancelToken) -> SliceReport {
        let exchange = match self.ctx.exchange(&slice.route.exchange) {
            Ok(exchange) => exchange,
            Err(e) => return SliceReport::failed(slice, &e),
        };
        let key = slice.route.account_key();
        let mut report = SliceReport::pending(slice);

        let ack = loop {
            report.attempts += 1;
            if let Err(e) = self.ctx.rate_limits.try_acquire(&key, self.order_weight) {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                return report.with_error(&e);
            }
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

            match tokio::time::timeout(policy.timeout, exchange.place_order(slice)).await {
                Ok(Ok(ack)) => break ack,
                Ok(Err(e)) => return report.with_error(&e),
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    let err = Error::Timeout(policy.timeout);
                    if report.attempts > policy.max_retries || cancel.is_cancelled() {
                        return report.with_error(&err);
                    }
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!("⏱️ Slice {} on {} timed out, retry {}/{}", slice.id, slice.route, report.attempts, policy.max_retries);
                }
            }
        };

        let filled = ack.filled_quantity.min(slice.quantity);
        report.exchange_order_id = Some(ack.exchange_order_id.clone());
        report.fee = ack.fee;
        report.filled_quantity = filled;
        report.avg_price = ack.avg_price.filter(|_| !filled.is_zero());

        if !filled.is_zero() {
            let fill = Fill {
                account: key,
                symbol: slice.symbol.clone(),
                side: slice.side,
                quantity: filled,
                price: ack.avg_price.or(slice.expected_price).unwrap_or(Decimal::ZERO),
                fee: ack.fee,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.fills.apply_fill(fill).await {
                warn!("Fill for slice {} not applied: {}", slice.id, e);
            }
        }

        report.status = match ack.status {
            _ if filled >= slice.quantity => SliceStatus::Filled,
            _ if !filled.is_zero() => SliceStatus::PartiallyFilled,
            OrderStatus::New | OrderStatus::PartiallyFilled => SliceStatus::Accepted,
            status => {
                let err = Error::Exchange(format!("order {} ended {:?} with no fill", ack.exchange_order_id, status));
                return report.with_error(&err);
            }
        };
        report
    }
}

pub struct ExecutionEngine {
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    /// Spawns the worker pool; requires a tokio runtime
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let fills: Arc<dyn PositionSource> = ctx.positions.clone();
        Self::with_position_source(ctx, fills)
    }

    pub fn with_position_source(ctx: Arc<EngineContext>, fills: Arc<dyn PositionSource>) -> Self {
        let config = ctx.config.execution.clone();
        let pool = WorkerPool::new(config.workers, config.queue_depth(), config.overflow);
        let order_weight = ctx.config.rate_limit.order_weight;
        Self {
            dispatcher: Arc::new(Dispatcher {
                ctx,
                fills,
                order_weight,
                counters: Counters::default(),
            }),
            pool,
            config,
        }
    }

    pub fn default_policy(&self) -> DispatchPolicy {
        DispatchPolicy::from_config(&self.config)
    }

    /// Run every slice of `decision` and wait for all of them, or the decision deadline.
    ///
    /// Immediate slices are submitted in priority order. Scheduled slices wait
    /// here, off the pool, and are submitted as each comes due, so a TWAP
    /// schedule holds no worker while it waits. Results are collected as they
    /// complete. Slices unresolved at the deadline are reported failed; fills
    /// already confirmed stay confirmed.
    pub async fn execute(&self, decision: &RoutingDecision, cancel: &CancelToken) -> ExecutionReport {
        let started_at = Utc::now();
        self.dispatcher.counters.decisions.fetch_add(1, Ordering::Relaxed);

        let mut ranked: Vec<&RouteSlice> = decision.slices.iter().collect();
        ranked.sort_by_key(|s| s.priority);

        // scheduled slices extend the deadline to their last start time
        let schedule = ranked
            .iter()
            .filter_map(|s| s.execute_at)
            .max()
            .and_then(|last| (last - started_at).to_std().ok())
            .unwrap_or_default();
        let deadline = tokio::time::Instant::now() + self.config.execution_timeout() + schedule;
        let policy = self.default_policy();

        let (mut scheduled, immediate): (Vec<&RouteSlice>, Vec<&RouteSlice>) = ranked
            .iter()
            .copied()
            .partition(|s| s.execute_at.is_some_and(|at| at > started_at));
        // stable: equal start times keep priority order
        scheduled.sort_by_key(|s| s.execute_at);
        let mut scheduled = VecDeque::from(scheduled);

        let (tx, rx) = flume::bounded::<SliceReport>(ranked.len().max(1));
        let mut results: HashMap<Uuid, SliceReport> = HashMap::with_capacity(ranked.len());
        let mut in_flight = 0usize;

        for slice in immediate {
            match self.submit(slice, policy, cancel, &tx, deadline).await {
                Ok(()) => in_flight += 1,
                Err(report) => {
                    results.insert(slice.id, report);
                }
            }
        }
        // held only while scheduled slices remain, so a dropped job ends the wait
        let mut tx = (!scheduled.is_empty()).then_some(tx);

        while in_flight > 0 || !scheduled.is_empty() {
            let next_due = scheduled
                .front()
                .and_then(|s| s.execute_at)
                .map(|at| tokio::time::Instant::now() + (at - Utc::now()).to_std().unwrap_or_default());

            tokio::select! {
                received = rx.recv_async(), if in_flight > 0 => match received {
                    Ok(report) => {
                        in_flight -= 1;
                        results.insert(report.slice_id, report);
                    }
                    // a job was dropped without reporting
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or(deadline)), if next_due.is_some() => {
                    let (Some(slice), Some(sender)) = (scheduled.pop_front(), tx.as_ref()) else {
                        break;
                    };
                    match self.submit(slice, policy, cancel, sender, deadline).await {
                        Ok(()) => in_flight += 1,
                        Err(report) => {
                            results.insert(slice.id, report);
                        }
                    }
                    if scheduled.is_empty() {
                        tx = None;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Decision {} hit its deadline with {} slices unresolved, {} not yet due",
                        decision.id,
                        in_flight,
                        scheduled.len()
                    );
                    break;
                }
            }
        }

        let slices = ranked
            .iter()
            .map(|slice| {
                results.remove(&slice.id).unwrap_or_else(|| {
                    SliceReport::failed(slice, &Error::Timeout(self.config.execution_timeout()))
                })
            })
            .collect();

        let report = ExecutionReport::aggregate(decision, slices, started_at);
        info!(
            "📊 {} {} {}: filled {}/{} over {} slices, fee {} ({:?})",
            report.client_order_id,
            report.side,
            report.symbol,
            report.filled_quantity,
            report.requested_quantity,
            report.slices.len(),
            report.total_fee,
            report.status
        );
        report
    }

    /// Hand one slice to the pool; the error is the report to record in its place
    async fn submit(
        &self,
        slice: &RouteSlice,
        policy: DispatchPolicy,
        cancel: &CancelToken,
        tx: &flume::Sender<SliceReport>,
        deadline: tokio::time::Instant,
    ) -> std::result::Result<(), SliceReport> {
        if cancel.is_cancelled() {
            return Err(SliceReport::cancelled(slice));
        }
        let dispatcher = self.dispatcher.clone();
        let (slice_owned, cancel_owned, tx) = (slice.clone(), cancel.clone(), tx.clone());
        let job = async move {
            let report = dispatcher.run(slice_owned, policy, cancel_owned).await;
            let _ = tx.send_async(report).await;
        };

        match tokio::time::timeout_at(deadline, self.pool.submit(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SliceReport::failed(slice, &e)),
            Err(_) => Err(SliceReport::failed(slice, &Error::Timeout(self.config.execution_timeout()))),
        }
    }

    /// Run one slice through the pool and wait for its outcome.
    ///
    /// A slice with a future `execute_at` waits for it before taking a worker.
    ///
    /// Cancelling `cancel` stops the slice only if no worker has picked it up yet.
    pub async fn dispatch(&self, slice: RouteSlice, policy: DispatchPolicy, cancel: &CancelToken) -> SliceReport {
        if let Some(wait) = slice.execute_at.and_then(|at| (at - Utc::now()).to_std().ok()) {
            tokio::time::sleep(wait).await;
        }
        let (reply, outcome) = oneshot::channel();
        let dispatcher = self.dispatcher.clone();
        let fallback = SliceReport::pending(&slice);
        let cancel = cancel.clone();
        let job = async move {
            let report = dispatcher.run(slice, policy, cancel).await;
            let _ = reply.send(report);
        };

        if let Err(e) = self.pool.submit(job).await {
            return fallback.with_error(&e);
        }
        match outcome.await {
            Ok(report) => report,
            Err(_) => {
                debug!("Slice {} job dropped before reporting", fallback.slice_id);
                fallback.with_error(&Error::ChannelClosed("slice job"))
            }
        }
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        let c = &self.dispatcher.counters;
        ExecutionMetrics {
            decisions: c.decisions.load(Ordering::Relaxed),
            slices_dispatched: c.dispatched.load(Ordering::Relaxed),
            slices_filled: c.filled.load(Ordering::Relaxed),
            slices_failed: c.failed.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Drain queued and in-flight slices, then stop the workers
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
