use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::alert::{Alerter, EmailAlerter};
use crate::config::load_grid_file;
use crate::grid::{GridBook, LegPlacement};
use crate::order_index::CorrelationIndex;
use crate::persist::GridStore;
use crate::ports::venue::{
    ExecutionGateway, NotificationSource, OrderType, OrderUpdate, PlaceOrderRequest, VenueError,
};
use crate::snapshot::{fetch_snapshot, DEFAULT_STALENESS_MS};
use crate::stats::RUN_STATS;
use crate::status::StatusReporter;
use crate::trade::execution::gateway_box::GatewayBox;
use crate::trade::hedge_pair::repair_sweep;
use crate::trade::reconcile::{apply_order_update, apply_rejection, UpdateEffect};
use crate::trade::trigger::{apply_trigger, compute_spreads, evaluate};

const DEFAULT_VENUE: &str = "paper";
const DEFAULT_GRID_FILE: &str = "grid.csv";
const DEFAULT_STATE_FILE: &str = "save.yaml";
const DEFAULT_CHECK_INTERVAL_MS: u64 = 1500;
const DEFAULT_QUICK_RECHECK_INTERVAL_MS: u64 = 500;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;
const DEFAULT_STALE_ORDER_SECS: u64 = 3;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_STARTUP_COUNTDOWN_SECS: u64 = 3;
const DEFAULT_REPLAY_TICK_MS: u64 = 1000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GridHedgeYaml {
    venue: Option<String>,
    agent_name: Option<String>,
    grid_file: Option<String>,
    state_file: Option<String>,
    check_interval_ms: Option<u64>,
    quick_recheck_interval_ms: Option<u64>,
    staleness_ms: Option<u64>,
    sync_interval_secs: Option<u64>,
    stale_order_secs: Option<u64>,
    keep_alive_secs: Option<u64>,
    startup_countdown_secs: Option<u64>,
    observe_only: Option<bool>,
    disable_persist: Option<bool>,
    replay_file: Option<String>,
    replay_tick_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GridHedgeConfig {
    pub venue: String,
    pub agent_name: Option<String>,
    pub grid_file: String,
    pub state_file: String,
    pub check_interval_ms: u64,
    pub quick_recheck_interval_ms: u64,
    pub staleness_ms: u64,
    pub sync_interval_secs: u64,
    pub stale_order_secs: u64,
    pub keep_alive_secs: u64,
    pub startup_countdown_secs: u64,
    /// Log trigger decisions without creating pairs or placing orders.
    pub observe_only: bool,
    pub disable_persist: bool,
    pub replay_file: Option<String>,
    pub replay_tick_ms: u64,
}

impl Default for GridHedgeConfig {
    fn default() -> Self {
        Self {
            venue: DEFAULT_VENUE.to_string(),
            agent_name: None,
            grid_file: DEFAULT_GRID_FILE.to_string(),
            state_file: DEFAULT_STATE_FILE.to_string(),
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            quick_recheck_interval_ms: DEFAULT_QUICK_RECHECK_INTERVAL_MS,
            staleness_ms: DEFAULT_STALENESS_MS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            stale_order_secs: DEFAULT_STALE_ORDER_SECS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            startup_countdown_secs: DEFAULT_STARTUP_COUNTDOWN_SECS,
            observe_only: false,
            disable_persist: false,
            replay_file: None,
            replay_tick_ms: DEFAULT_REPLAY_TICK_MS,
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Some(value) = env_string(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid {}={}", key, value))?;
    }
    Ok(())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str, target: &mut bool) -> Result<()> {
    if let Some(value) = env_string(key) {
        *target = parse_flag(&value).ok_or_else(|| anyhow!("invalid {}={}", key, value))?;
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl GridHedgeConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        match env_string("GRIDHEDGE_CONFIG_PATH") {
            Some(path) => Self::from_yaml_path(path),
            None => Self::from_env(),
        }
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open GridHedge config {}", path_ref.display()))?;
        let yaml: GridHedgeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse GridHedge config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml);
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: GridHedgeYaml) -> Self {
        let defaults = Self::default();
        Self {
            venue: yaml.venue.unwrap_or(defaults.venue),
            agent_name: yaml.agent_name,
            grid_file: yaml.grid_file.unwrap_or(defaults.grid_file),
            state_file: yaml.state_file.unwrap_or(defaults.state_file),
            check_interval_ms: yaml.check_interval_ms.unwrap_or(defaults.check_interval_ms),
            quick_recheck_interval_ms: yaml
                .quick_recheck_interval_ms
                .unwrap_or(defaults.quick_recheck_interval_ms),
            staleness_ms: yaml.staleness_ms.unwrap_or(defaults.staleness_ms),
            sync_interval_secs: yaml
                .sync_interval_secs
                .unwrap_or(defaults.sync_interval_secs),
            stale_order_secs: yaml.stale_order_secs.unwrap_or(defaults.stale_order_secs),
            keep_alive_secs: yaml.keep_alive_secs.unwrap_or(defaults.keep_alive_secs),
            startup_countdown_secs: yaml
                .startup_countdown_secs
                .unwrap_or(defaults.startup_countdown_secs),
            observe_only: yaml.observe_only.unwrap_or(false),
            disable_persist: yaml.disable_persist.unwrap_or(false),
            replay_file: yaml.replay_file,
            replay_tick_ms: yaml.replay_tick_ms.unwrap_or(defaults.replay_tick_ms),
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("VENUE") {
            self.venue = value;
        }
        if let Some(value) = env_string("AGENT_NAME") {
            self.agent_name = Some(value);
        }
        if let Some(value) = env_string("GRID_FILE") {
            self.grid_file = value;
        }
        if let Some(value) = env_string("STATE_FILE") {
            self.state_file = value;
        }
        if let Some(value) = env_string("REPLAY_FILE") {
            self.replay_file = Some(value);
        }
        env_override("CHECK_INTERVAL_MS", &mut self.check_interval_ms)?;
        env_override(
            "QUICK_RECHECK_INTERVAL_MS",
            &mut self.quick_recheck_interval_ms,
        )?;
        env_override("STALENESS_MS", &mut self.staleness_ms)?;
        env_override("SYNC_INTERVAL_SECS", &mut self.sync_interval_secs)?;
        env_override("STALE_ORDER_SECS", &mut self.stale_order_secs)?;
        env_override("KEEP_ALIVE_SECS", &mut self.keep_alive_secs)?;
        env_override("STARTUP_COUNTDOWN_SECS", &mut self.startup_countdown_secs)?;
        env_override("REPLAY_TICK_MS", &mut self.replay_tick_ms)?;
        env_bool("OBSERVE_ONLY", &mut self.observe_only)?;
        env_bool("DISABLE_PERSIST", &mut self.disable_persist)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval_ms == 0 || self.quick_recheck_interval_ms == 0 {
            return Err(anyhow!("check intervals must be positive"));
        }
        if self.keep_alive_secs == 0 || self.sync_interval_secs == 0 {
            return Err(anyhow!("keep_alive_secs and sync_interval_secs must be positive"));
        }
        if self.replay_tick_ms == 0 {
            return Err(anyhow!("replay_tick_ms must be positive"));
        }
        Ok(())
    }

    fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    fn quick_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.quick_recheck_interval_ms)
    }
}

/// Work items for the engine loop. Producers only ever enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    OrderUpdate(OrderUpdate),
    Rejected { client_id: String },
}

pub struct GridHedgeEngine {
    cfg: GridHedgeConfig,
    gateway: Arc<dyn ExecutionGateway>,
    notifications: Option<Arc<dyn NotificationSource>>,
    book: GridBook,
    index: CorrelationIndex,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    alerter: Arc<dyn Alerter>,
    store: Option<GridStore>,
    status_reporter: Option<StatusReporter>,
    last_sync: Option<Instant>,
    dirty: bool,
}

impl GridHedgeEngine {
    pub async fn new(cfg: GridHedgeConfig) -> Result<Self> {
        let (gateway, notifications) = GatewayBox::create(
            &cfg.venue,
            cfg.replay_file.as_deref(),
            Duration::from_millis(cfg.replay_tick_ms),
        )
        .map_err(|e| anyhow!("failed to create venue '{}': {}", cfg.venue, e))?;

        let store = (!cfg.disable_persist).then(|| GridStore::new(&cfg.state_file));
        let book = match &store {
            Some(store) if store.exists() => {
                log::info!("[PERSIST] loading state from {}", store.path().display());
                store.load()?
            }
            _ => load_grid_file(&cfg.grid_file)
                .with_context(|| format!("failed to load grid file {}", cfg.grid_file))?,
        };

        let alerter: Arc<dyn Alerter> = Arc::new(EmailAlerter::new(cfg.agent_name.clone()));
        let status_reporter =
            StatusReporter::from_env(cfg.agent_name.clone(), &cfg.venue, cfg.observe_only);

        let mut engine = Self::from_parts(cfg, Arc::new(gateway), Some(notifications), book, alerter);
        engine.store = store;
        engine.status_reporter = status_reporter;
        Ok(engine)
    }

    /// Assembles an engine around an existing venue and book; the index is
    /// rebuilt from the book.
    pub fn from_parts(
        cfg: GridHedgeConfig,
        gateway: Arc<dyn ExecutionGateway>,
        notifications: Option<Arc<dyn NotificationSource>>,
        book: GridBook,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let index = CorrelationIndex::rebuild(&book);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            gateway,
            notifications,
            book,
            index,
            events_tx,
            events_rx,
            alerter,
            store: None,
            status_reporter: None,
            last_sync: None,
            dirty: false,
        }
    }

    pub fn with_store(mut self, store: GridStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn book(&self) -> &GridBook {
        &self.book
    }

    pub fn index(&self) -> &CorrelationIndex {
        &self.index
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] venue={} observe_only={} persist={} check={}ms quick={}ms staleness={}ms",
            self.cfg.venue,
            self.cfg.observe_only,
            self.store.is_some(),
            self.cfg.check_interval_ms,
            self.cfg.quick_recheck_interval_ms,
            self.cfg.staleness_ms
        );
        self.log_grid_summary();
        self.log_positions().await;
        self.countdown().await;

        if let Some(source) = self.notifications.clone() {
            spawn_notification_task(
                source,
                self.events_tx.clone(),
                Duration::from_secs(self.cfg.keep_alive_secs),
            );
        }

        let mut next_check = Instant::now();
        loop {
            tokio::select! {
                _ = sleep_until(next_check) => {
                    let fired = self.check_cycle().await;
                    let wait = if fired {
                        self.cfg.quick_recheck_interval()
                    } else {
                        self.cfg.check_interval()
                    };
                    next_check = Instant::now() + wait;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                    self.drain_events();
                }
            }
            self.after_wake().await;
        }
    }

    /// One market check. Returns true when a trigger created pairs.
    pub async fn check_cycle(&mut self) -> bool {
        let snapshot = match fetch_snapshot(
            self.gateway.as_ref(),
            &self.book.spot_market,
            &self.book.future_market,
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                RUN_STATS.record_snapshot_error();
                log::warn!("[SNAPSHOT] {} (after {:?})", e, e.elapsed());
                return false;
            }
        };
        if snapshot.is_stale(Duration::from_millis(self.cfg.staleness_ms)) {
            RUN_STATS.record_stale_snapshot();
            log::warn!(
                "[SNAPSHOT] discarded, fetch took {:?} (bound {}ms)",
                snapshot.elapsed,
                self.cfg.staleness_ms
            );
            return false;
        }
        let Some(spreads) = compute_spreads(&snapshot.spot, &snapshot.future) else {
            log::warn!(
                "[SNAPSHOT] unusable spot quote bid={} ask={}",
                snapshot.spot.bid,
                snapshot.spot.ask
            );
            return false;
        };
        let Some(decision) = evaluate(&self.book.levels, &spreads) else {
            return false;
        };

        log::info!(
            "[TRIGGER] level {:03} open={} close={} openSpread={} closeSpread={}",
            decision.level,
            decision.open,
            decision.close,
            spreads.open.round_dp(6),
            spreads.close.round_dp(6)
        );
        if self.cfg.observe_only {
            log::info!("[TRIGGER] observe-only, nothing placed");
            return false;
        }

        let placements = apply_trigger(&mut self.book, &mut self.index, &decision, Utc::now());
        if placements.is_empty() {
            return false;
        }
        RUN_STATS.record_trigger();
        self.dirty = true;
        self.persist();
        for placement in &placements {
            self.place_leg(placement).await;
        }
        true
    }

    async fn place_leg(&mut self, placement: &LegPlacement) {
        let request = PlaceOrderRequest {
            client_id: placement.client_id.clone(),
            market: placement.market.clone(),
            side: placement.side,
            price: None,
            order_type: OrderType::Market,
            size: placement.qty,
            reduce_only: false,
            post_only: false,
        };
        log::info!(
            "[ORDER] place {} {} {} {} (pair {}, client id {})",
            placement.leg,
            request.market,
            request.side,
            request.size,
            placement.pair_id,
            request.client_id
        );

        match self.gateway.place_order(&request).await {
            Ok(ack) => {
                if let Some(venue_id) = ack.venue_order_id {
                    self.record_venue_id(&request.client_id, venue_id);
                }
            }
            Err(e) => {
                log::error!(
                    "[ORDER] placement failed for {} {} {}: {}",
                    request.market,
                    request.side,
                    request.size,
                    e
                );
                let _ = self.events_tx.send(EngineEvent::Rejected {
                    client_id: request.client_id.clone(),
                });
                self.alerter.alert(
                    "Placement failed",
                    &format!(
                        "Failed to place order: {} {} {} (pair {}).\nReason: {}",
                        request.market, request.side, request.size, placement.pair_id, e
                    ),
                );
            }
        }
    }

    fn record_venue_id(&mut self, client_id: &str, venue_id: String) {
        let Some(order_ref) = self.index.get(client_id) else {
            return;
        };
        if let Some(pair) =
            self.book
                .pair_mut(order_ref.level, order_ref.direction, &order_ref.pair_id)
        {
            let order = pair.order_mut(order_ref.leg);
            if order.venue_id.is_none() {
                order.venue_id = Some(venue_id);
                self.dirty = true;
            }
        }
    }

    pub fn handle_event(&mut self, event: EngineEvent) {
        let now = Utc::now();
        match event {
            EngineEvent::OrderUpdate(update) => {
                if let UpdateEffect::Applied { delta, .. } =
                    apply_order_update(&mut self.book, &mut self.index, &update, now)
                {
                    if delta > Decimal::ZERO {
                        RUN_STATS.record_fill();
                    }
                    self.dirty = true;
                }
            }
            EngineEvent::Rejected { client_id } => {
                if apply_rejection(&mut self.book, &mut self.index, &client_id, now) {
                    RUN_STATS.record_rejection();
                    self.dirty = true;
                }
            }
        }
    }

    /// Applies everything already queued. Returns how many events were handled.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    async fn after_wake(&mut self) {
        self.repair_pairs().await;
        if self.sync_due() {
            self.spawn_reconcile_poll();
        }
        self.persist();
        self.write_status();
    }

    pub async fn repair_pairs(&mut self) {
        let outcome = repair_sweep(&mut self.book, &mut self.index, Utc::now());
        if outcome.is_empty() {
            return;
        }
        self.dirty = true;
        RUN_STATS.record_repairs(outcome.placements.len());
        RUN_STATS.record_abandoned(outcome.abandoned.len());
        RUN_STATS.record_exhausted(outcome.exhausted.len());

        for key in &outcome.exhausted {
            if let Some(pair) = self.book.pair(key.level, key.direction, &key.pair_id) {
                self.alerter.alert(
                    "Repair retries exhausted",
                    &format!(
                        "Pair {} ({}) on level {:03} needs manual attention.\n\
                         target={} spot={} future={} retries={}",
                        pair.id,
                        pair.direction,
                        key.level,
                        pair.target_qty,
                        pair.spot_qty,
                        pair.future_qty,
                        pair.retry_place
                    ),
                );
            }
        }

        self.persist();
        for placement in &outcome.placements {
            self.place_leg(placement).await;
        }
    }

    fn sync_due(&self) -> bool {
        self.last_sync
            .map(|t| t.elapsed() >= Duration::from_secs(self.cfg.sync_interval_secs))
            .unwrap_or(true)
    }

    /// Starts a background poll of the venue. Results come back as events.
    pub fn spawn_reconcile_poll(&mut self) -> JoinHandle<()> {
        let now = Utc::now();
        let stale_after = chrono::Duration::seconds(self.cfg.stale_order_secs as i64);
        let stale_ids: Vec<String> = self
            .index
            .iter()
            .filter_map(|(client_id, order_ref)| {
                let pair =
                    self.book
                        .pair(order_ref.level, order_ref.direction, &order_ref.pair_id)?;
                let order = pair.order(order_ref.leg);
                (now - order.last_activity() >= stale_after).then(|| client_id.clone())
            })
            .collect();
        let markets = vec![
            self.book.spot_market.clone(),
            self.book.future_market.clone(),
        ];
        self.last_sync = Some(Instant::now());
        tokio::spawn(reconcile_poll(
            self.gateway.clone(),
            self.events_tx.clone(),
            markets,
            stale_ids,
        ))
    }

    fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.book) {
                log::error!("[PERSIST] failed to save state: {:?}", e);
                return;
            }
        }
        self.dirty = false;
    }

    fn write_status(&mut self) {
        if let Some(reporter) = &mut self.status_reporter {
            if let Err(err) =
                reporter.write_snapshot_if_due(&self.book, self.index.len(), RUN_STATS.snapshot())
            {
                log::warn!("[STATUS] failed to write status: {:?}", err);
            }
        }
    }

    fn log_grid_summary(&self) {
        log::info!("[GRID] spot: {}", self.book.spot_market);
        log::info!("[GRID] future: {}", self.book.future_market);
        let mut acc_qty = 0u64;
        for (i, level) in self.book.levels.iter().enumerate() {
            let grid_qty = u64::from(level.open_chance) + u64::from(level.close_chance);
            acc_qty += grid_qty;
            log::info!(
                "[GRID] [{:03}] {} {} {} {} -- gridQty={} accQty={} distance={}",
                i,
                level.open_at,
                level.close_at,
                level.open_chance,
                level.close_chance,
                grid_qty,
                acc_qty,
                (level.open_at - level.close_at).round_dp(6)
            );
        }
        log::info!(
            "[GRID] pairs={} indexed orders={}",
            self.book.pair_count(),
            self.index.len()
        );
    }

    async fn log_positions(&self) {
        match self.gateway.get_positions().await {
            Ok(positions) if positions.is_empty() => log::info!("[POSITION] none open"),
            Ok(positions) => {
                for position in positions {
                    log::info!("[POSITION] {} size={}", position.market, position.size);
                }
            }
            Err(e) => log::warn!("[POSITION] failed to query positions: {}", e),
        }
    }

    async fn countdown(&self) {
        for remaining in (1..=self.cfg.startup_countdown_secs).rev() {
            log::info!("[CONFIG] starting in {}...", remaining);
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Queries open orders of every market, then every stale order by client id.
/// An order the venue no longer knows is treated as rejected.
pub async fn reconcile_poll(
    gateway: Arc<dyn ExecutionGateway>,
    events: mpsc::UnboundedSender<EngineEvent>,
    markets: Vec<String>,
    stale_ids: Vec<String>,
) {
    for market in &markets {
        match gateway.get_open_orders(market).await {
            Ok(orders) => {
                log::debug!("[SYNC] {} open orders on {}", orders.len(), market);
                for order in &orders {
                    if events
                        .send(EngineEvent::OrderUpdate(OrderUpdate::from(order)))
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => log::warn!("[SYNC] get_open_orders {} failed: {}", market, e),
        }
    }

    for client_id in stale_ids {
        let event = match gateway.get_order_by_client_id(&client_id).await {
            Ok(order) => EngineEvent::OrderUpdate(OrderUpdate::from(&order)),
            Err(VenueError::NotFound(_)) => {
                log::warn!("[SYNC] order {} not found at venue; rejecting", client_id);
                EngineEvent::Rejected { client_id }
            }
            Err(e) => {
                log::warn!("[SYNC] get_order_by_client_id {} failed: {}", client_id, e);
                continue;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Forwards venue notifications into the engine queue, pinging the source
/// while subscribed and resubscribing whenever the stream ends.
pub fn spawn_notification_task(
    source: Arc<dyn NotificationSource>,
    events: mpsc::UnboundedSender<EngineEvent>,
    keep_alive: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.subscribe().await {
                Ok(mut updates) => {
                    log::info!("[NOTIFY] subscribed to order updates");
                    let mut ping = tokio::time::interval(keep_alive);
                    ping.tick().await;
                    loop {
                        tokio::select! {
                            msg = updates.recv() => {
                                let Some(update) = msg else {
                                    log::warn!("[NOTIFY] stream closed");
                                    break;
                                };
                                if update.client_id.is_empty() {
                                    log::debug!("[NOTIFY] dropped update without client id");
                                } else if events.send(EngineEvent::OrderUpdate(update)).is_err() {
                                    return;
                                }
                            }
                            _ = ping.tick() => {
                                if let Err(e) = source.keep_alive().await {
                                    log::warn!("[NOTIFY] keep-alive failed: {}", e);
                                }
                            }
                        }
                    }
                }
                Err(e) => log::warn!("[NOTIFY] subscribe failed: {}", e),
            }
            if events.is_closed() {
                return;
            }
            sleep(RECONNECT_DELAY).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlerter;
    use crate::grid::{GridLevel, HedgePair, Leg, PairDirection, PairStatus};
    use crate::ports::paper_venue::PaperVenue;
    use crate::ports::venue::OrderSide;
    use crate::ports::venue::{MarketQuote, PlaceOrderAck, VenueOrder};
    use crate::trade::hedge_pair::MAX_REPAIR_RETRIES;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, NamedTempFile};

    // process env is shared between test threads
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Records when the spot quote is requested, so check cadence is visible.
    struct CountingGateway {
        inner: Arc<PaperVenue>,
        spot_checks: Mutex<Vec<Instant>>,
    }

    impl CountingGateway {
        fn new(inner: Arc<PaperVenue>) -> Self {
            Self {
                inner,
                spot_checks: Mutex::new(Vec::new()),
            }
        }

        fn spot_checks(&self) -> Vec<Instant> {
            self.spot_checks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionGateway for CountingGateway {
        async fn get_market(&self, market: &str) -> Result<MarketQuote, VenueError> {
            if market == "BTC/USD" {
                self.spot_checks.lock().unwrap().push(Instant::now());
            }
            self.inner.get_market(market).await
        }

        async fn place_order(
            &self,
            request: &PlaceOrderRequest,
        ) -> Result<PlaceOrderAck, VenueError> {
            self.inner.place_order(request).await
        }

        async fn get_open_orders(&self, market: &str) -> Result<Vec<VenueOrder>, VenueError> {
            self.inner.get_open_orders(market).await
        }

        async fn get_order_by_client_id(
            &self,
            client_id: &str,
        ) -> Result<VenueOrder, VenueError> {
            self.inner.get_order_by_client_id(client_id).await
        }
    }

    /// Notification source whose connection can be refused or cut.
    #[derive(Default)]
    struct FlakySource {
        refusals_left: Mutex<usize>,
        live: Mutex<Option<mpsc::UnboundedSender<OrderUpdate>>>,
        subscriptions: AtomicUsize,
    }

    impl FlakySource {
        fn refusing(count: usize) -> Self {
            Self {
                refusals_left: Mutex::new(count),
                ..Self::default()
            }
        }

        fn subscriptions(&self) -> usize {
            self.subscriptions.load(Ordering::SeqCst)
        }

        fn cut(&self) {
            self.live.lock().unwrap().take();
        }

        fn push(&self, client_id: &str, filled: &str) -> bool {
            let update = OrderUpdate {
                client_id: client_id.to_string(),
                venue_id: None,
                market: "BTC/USD".to_string(),
                filled_size: dec(filled),
                closed: false,
            };
            match self.live.lock().unwrap().as_ref() {
                Some(tx) => tx.send(update).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl NotificationSource for FlakySource {
        async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<OrderUpdate>, VenueError> {
            {
                let mut refusals = self.refusals_left.lock().unwrap();
                if *refusals > 0 {
                    *refusals -= 1;
                    return Err(VenueError::Other("connection refused".to_string()));
                }
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.live.lock().unwrap() = Some(tx);
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(rx)
        }

        async fn keep_alive(&self) -> Result<(), VenueError> {
            Ok(())
        }
    }

    fn expect_update(event: EngineEvent) -> OrderUpdate {
        match event {
            EngineEvent::OrderUpdate(update) => update,
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn test_config() -> GridHedgeConfig {
        GridHedgeConfig {
            stale_order_secs: 0,
            startup_countdown_secs: 0,
            disable_persist: true,
            ..GridHedgeConfig::default()
        }
    }

    fn venue_with_spread() -> Arc<PaperVenue> {
        let venue = Arc::new(PaperVenue::new());
        venue.set_quote("BTC/USD", dec("99"), dec("100"));
        venue.set_quote("BTC-PERP", dec("101"), dec("102"));
        venue
    }

    fn single_level_book() -> GridBook {
        GridBook::new(
            "BTC/USD",
            "BTC-PERP",
            vec![GridLevel::new(dec("0.01"), dec("-1"), 1, 0, dec("5"))],
        )
    }

    fn engine_with(
        cfg: GridHedgeConfig,
        venue: &Arc<PaperVenue>,
        book: GridBook,
    ) -> (GridHedgeEngine, Arc<RecordingAlerter>) {
        let alerter = Arc::new(RecordingAlerter::default());
        let notifications: Arc<dyn NotificationSource> = venue.clone();
        let engine = GridHedgeEngine::from_parts(
            cfg,
            venue.clone(),
            Some(notifications),
            book,
            alerter.clone(),
        );
        (engine, alerter)
    }

    async fn poll_and_drain(engine: &mut GridHedgeEngine) {
        engine.spawn_reconcile_poll().await.unwrap();
        engine.drain_events();
    }

    fn only_pair(engine: &GridHedgeEngine) -> &HedgePair {
        engine.book().levels[0].open_pairs.values().next().unwrap()
    }

    #[tokio::test]
    async fn trigger_places_both_legs_and_reconciles() {
        let venue = venue_with_spread();
        let (mut engine, alerter) = engine_with(test_config(), &venue, single_level_book());

        assert!(engine.check_cycle().await);

        let placed = venue.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].market, "BTC/USD");
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].size, dec("5"));
        assert_eq!(placed[1].market, "BTC-PERP");
        assert_eq!(placed[1].side, OrderSide::Sell);
        assert_eq!(placed[1].size, dec("5"));
        assert_eq!(engine.book().levels[0].open_chance, 0);
        assert!(only_pair(&engine).spot.venue_id.is_some());

        poll_and_drain(&mut engine).await;

        let pair = only_pair(&engine);
        assert_eq!(pair.status(), PairStatus::Reconciled);
        assert!(engine.index().is_empty());
        assert!(alerter.subjects().is_empty());

        // the chance is spent, nothing more happens
        assert!(!engine.check_cycle().await);
        assert_eq!(venue.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn partial_fill_is_repaired_with_remainder() {
        let venue = venue_with_spread();
        venue.set_fill_ratio("BTC/USD", dec("0.6"));
        let (mut engine, _) = engine_with(test_config(), &venue, single_level_book());

        engine.check_cycle().await;
        poll_and_drain(&mut engine).await;
        assert_eq!(only_pair(&engine).spot_qty, dec("3"));
        assert_eq!(only_pair(&engine).status(), PairStatus::AwaitingRepair);

        venue.set_fill_ratio("BTC/USD", Decimal::ONE);
        engine.repair_pairs().await;

        let placed = venue.placed_orders();
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[2].market, "BTC/USD");
        assert_eq!(placed[2].side, OrderSide::Buy);
        assert_eq!(placed[2].size, dec("2"));
        assert_eq!(only_pair(&engine).retry_place, 1);

        poll_and_drain(&mut engine).await;
        let pair = only_pair(&engine);
        assert_eq!(pair.spot_qty, dec("5"));
        assert_eq!(pair.status(), PairStatus::Reconciled);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_never_triggers() {
        let venue = venue_with_spread();
        venue.set_quote_latency(Duration::from_millis(3100));
        let (mut engine, _) = engine_with(test_config(), &venue, single_level_book());

        assert!(!engine.check_cycle().await);

        assert!(venue.placed_orders().is_empty());
        assert_eq!(engine.book().levels[0].open_chance, 1);
        assert_eq!(engine.book().pair_count(), 0);
    }

    #[tokio::test]
    async fn missing_quote_skips_the_cycle() {
        let venue = Arc::new(PaperVenue::new());
        venue.set_quote("BTC/USD", dec("99"), dec("100"));
        let (mut engine, _) = engine_with(test_config(), &venue, single_level_book());

        assert!(!engine.check_cycle().await);
        assert_eq!(engine.book().levels[0].open_chance, 1);
    }

    #[tokio::test]
    async fn observe_only_places_nothing() {
        let venue = venue_with_spread();
        let cfg = GridHedgeConfig {
            observe_only: true,
            ..test_config()
        };
        let (mut engine, _) = engine_with(cfg, &venue, single_level_book());

        assert!(!engine.check_cycle().await);
        assert!(venue.placed_orders().is_empty());
        assert_eq!(engine.book().levels[0].open_chance, 1);
    }

    #[tokio::test]
    async fn placement_failure_rejects_leg_and_alerts() {
        let venue = venue_with_spread();
        venue.fail_next_placement(VenueError::Other("insufficient margin".to_string()));
        let (mut engine, alerter) = engine_with(test_config(), &venue, single_level_book());

        assert!(engine.check_cycle().await);
        assert_eq!(engine.drain_events(), 1);

        let pair = only_pair(&engine);
        assert!(pair.spot.closed);
        assert_eq!(pair.spot_qty, Decimal::ZERO);
        assert!(!engine.index().contains(&pair.spot.client_id));
        assert_eq!(alerter.subjects(), vec!["Placement failed".to_string()]);
    }

    #[tokio::test]
    async fn unknown_order_during_poll_is_rejected() {
        let venue = venue_with_spread();
        venue.hold_orders(true);
        let (mut engine, _) = engine_with(test_config(), &venue, single_level_book());

        engine.check_cycle().await;
        let spot_id = only_pair(&engine).spot.client_id.clone();
        venue.forget_order(&spot_id);

        poll_and_drain(&mut engine).await;

        let pair = only_pair(&engine);
        assert!(pair.spot.closed);
        assert!(!pair.future.closed);
        assert!(!engine.index().contains(&spot_id));
        assert!(engine.index().contains(&pair.future.client_id));
    }

    #[tokio::test]
    async fn exhausted_pair_alerts_once() {
        let now = Utc::now();
        let mut book = single_level_book();
        let mut pair = HedgePair::new(&book.levels[0].id, PairDirection::Open, dec("5"), now);
        pair.add_filled(Leg::Spot, dec("3"));
        pair.add_filled(Leg::Future, dec("5"));
        pair.spot.close(now);
        pair.future.close(now);
        pair.retry_place = MAX_REPAIR_RETRIES + 1;
        book.levels[0].open_pairs.insert(pair.id.clone(), pair);

        let venue = venue_with_spread();
        let (mut engine, alerter) = engine_with(test_config(), &venue, book);

        engine.repair_pairs().await;
        engine.repair_pairs().await;

        assert_eq!(
            alerter.subjects(),
            vec!["Repair retries exhausted".to_string()]
        );
        assert!(venue.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn notifications_are_forwarded_to_the_queue() {
        let venue = Arc::new(PaperVenue::new());
        venue.hold_orders(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_notification_task(venue.clone(), tx, Duration::from_secs(15));
        while venue.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        let request = PlaceOrderRequest {
            client_id: "c-1".to_string(),
            market: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            price: None,
            order_type: OrderType::Market,
            size: dec("5"),
            reduce_only: false,
            post_only: false,
        };
        venue.place_order(&request).await.unwrap();
        assert!(venue.complete_order("c-1", dec("2"), false));

        let update = expect_update(rx.recv().await.unwrap());
        assert_eq!(update.client_id, "c-1");
        assert_eq!(update.filled_size, dec("2"));
        assert!(!update.closed);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_is_resubscribed_after_delay() {
        let source = Arc::new(FlakySource::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_notification_task(source.clone(), tx, Duration::from_secs(15));
        while source.subscriptions() == 0 {
            tokio::task::yield_now().await;
        }

        source.cut();
        sleep(Duration::from_millis(900)).await;
        assert_eq!(source.subscriptions(), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(source.subscriptions(), 2);

        assert!(source.push("c-2", "1"));
        let update = expect_update(rx.recv().await.unwrap());
        assert_eq!(update.client_id, "c-2");
        assert_eq!(update.filled_size, dec("1"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_subscription_is_retried() {
        let source = Arc::new(FlakySource::refusing(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_notification_task(source.clone(), tx, Duration::from_secs(15));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(source.subscriptions(), 0);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(source.subscriptions(), 1);

        assert!(source.push("c-3", "2"));
        assert_eq!(expect_update(rx.recv().await.unwrap()).client_id, "c-3");
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_rechecks_quickly_only_after_a_trigger() {
        let venue = venue_with_spread();
        let gateway = Arc::new(CountingGateway::new(venue.clone()));
        let notifications: Arc<dyn NotificationSource> = venue.clone();
        let mut engine = GridHedgeEngine::from_parts(
            test_config(),
            gateway.clone(),
            Some(notifications),
            single_level_book(),
            Arc::new(RecordingAlerter::default()),
        );
        let task = tokio::spawn(async move { engine.run().await });

        sleep(Duration::from_millis(2100)).await;
        task.abort();

        let checks = gateway.spot_checks();
        assert_eq!(checks.len(), 3);
        // the first check fires the only chance, the second finds nothing
        assert_eq!(checks[1] - checks[0], Duration::from_millis(500));
        assert_eq!(checks[2] - checks[1], Duration::from_millis(1500));
        assert_eq!(venue.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn state_is_persisted_after_trigger() {
        let dir = tempdir().unwrap();
        let store = GridStore::new(dir.path().join("save.yaml"));
        let venue = venue_with_spread();
        let (engine, _) = engine_with(test_config(), &venue, single_level_book());
        let mut engine = engine.with_store(store.clone());

        engine.check_cycle().await;

        let restored = store.load().unwrap();
        assert_eq!(restored.levels[0].open_chance, 0);
        assert_eq!(restored.pair_count(), 1);
        let index = CorrelationIndex::rebuild(&restored);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["1", "true", "TRUE", "yes", " On "] {
            assert_eq!(parse_flag(value), Some(true), "{}", value);
        }
        for value in ["0", "false", "No", "off"] {
            assert_eq!(parse_flag(value), Some(false), "{}", value);
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn observe_only_env_is_read_leniently_and_strictly() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for value in ["1", "TRUE", "yes"] {
            env::set_var("OBSERVE_ONLY", value);
            let cfg = GridHedgeConfig::from_env().unwrap();
            assert!(cfg.observe_only, "OBSERVE_ONLY={} must keep orders back", value);
        }
        env::set_var("OBSERVE_ONLY", "0");
        assert!(!GridHedgeConfig::from_env().unwrap().observe_only);

        env::set_var("OBSERVE_ONLY", "maybe");
        assert!(GridHedgeConfig::from_env().is_err());
        env::remove_var("OBSERVE_ONLY");

        env::set_var("CHECK_INTERVAL_MS", "fast");
        assert!(GridHedgeConfig::from_env().is_err());
        env::remove_var("CHECK_INTERVAL_MS");
    }

    #[test]
    fn yaml_config_fills_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "agent_name: grid-01\ngrid_file: grids/btc.csv\ncheck_interval_ms: 2000\nobserve_only: true"
        )
        .unwrap();

        let cfg = GridHedgeConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.agent_name.as_deref(), Some("grid-01"));
        assert_eq!(cfg.grid_file, "grids/btc.csv");
        assert_eq!(cfg.check_interval_ms, 2000);
        assert!(cfg.observe_only);
        assert_eq!(cfg.state_file, "save.yaml");
        assert_eq!(cfg.quick_recheck_interval_ms, 500);
        assert_eq!(cfg.staleness_ms, 3000);
        assert_eq!(cfg.sync_interval_secs, 5);
        assert_eq!(cfg.stale_order_secs, 3);
    }

    #[test]
    fn yaml_config_rejects_unknown_keys_and_zero_intervals() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "check_interval: 2000").unwrap();
        assert!(GridHedgeConfig::from_yaml_path(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "quick_recheck_interval_ms: 0").unwrap();
        assert!(GridHedgeConfig::from_yaml_path(file.path()).is_err());
    }

    #[tokio::test]
    async fn unknown_venue_fails_startup() {
        let cfg = GridHedgeConfig {
            venue: "ftx".to_string(),
            ..test_config()
        };
        assert!(GridHedgeEngine::new(cfg).await.is_err());
    }
}
