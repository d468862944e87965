//! Service composition.
//!
//! [`WebhookService`] wires the trigger, store, breaker manager,
//! dispatcher, and scheduler behind one value, with no ambient globals. The
//! host platform owns the store handles and calls
//! [`WebhookService::handle_transactions`] from its transaction pipeline;
//! everything downstream of that call is courier's.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_breaker::{BreakerManager, HealthProbe};
use courier_clock::SharedClock;
use courier_dispatch::Dispatcher;
use courier_scheduler::{DeliveryScheduler, SchedulerHealth};
use courier_store::{EventStore, SubscriptionStore};
use courier_trigger::{ChangeTx, PlatformControl, Trigger};
use courier_types::{DeliveryStats, Event};

use crate::config::CourierConfig;

/// The composed webhook delivery core.
pub struct WebhookService {
    store: Arc<dyn EventStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    trigger: Trigger,
    breakers: Arc<BreakerManager>,
    scheduler: DeliveryScheduler,
}

impl WebhookService {
    /// Build the service without a breaker health probe (probing disabled).
    pub fn new(
        store: Arc<dyn EventStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        config: CourierConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        Self::build(store, subscriptions, config, clock, None)
    }

    /// Build the service with a breaker health probe.
    pub fn with_probe(
        store: Arc<dyn EventStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        config: CourierConfig,
        clock: SharedClock,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        Self::build(store, subscriptions, config, clock, Some(probe))
    }

    fn build(
        store: Arc<dyn EventStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        config: CourierConfig,
        clock: SharedClock,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Self> {
        let mut breakers = BreakerManager::new(config.breaker, clock.clone());
        if let Some(probe) = probe {
            breakers = breakers.with_probe(probe);
        }
        let breakers = Arc::new(breakers);
        let dispatcher =
            Arc::new(Dispatcher::new(clock.clone()).context("building webhook dispatcher")?);
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&subscriptions),
            dispatcher,
            Arc::clone(&breakers),
            clock.clone(),
            config.scheduler,
        );
        Ok(Self {
            store,
            subscriptions,
            trigger: Trigger::new(clock),
            breakers,
            scheduler,
        })
    }

    /// Start delivery and, when a probe is configured, breaker health
    /// checks. Idempotent.
    pub fn start(&self) {
        self.breakers.start_health_checks();
        self.scheduler.start();
    }

    /// Stop admissions, drain in-flight deliveries, stop health checks.
    /// Idempotent.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.breakers.shutdown();
    }

    /// The host platform's trigger callback.
    ///
    /// Translates the batch against the currently enabled subscriptions,
    /// persists the resulting events, and nudges the scheduler past its
    /// poll latency. Returns the persisted events; an event that fails to
    /// persist is logged and dropped without affecting its siblings.
    pub async fn handle_transactions(
        &self,
        batch: &[ChangeTx],
        control: &dyn PlatformControl,
    ) -> Result<Vec<Event>> {
        let subscriptions = self
            .subscriptions
            .list_enabled()
            .await
            .context("loading enabled subscriptions")?;
        let events = self.trigger.translate(batch, control, &subscriptions);

        let mut persisted = Vec::with_capacity(events.len());
        for event in events {
            match self.store.insert_event(event.clone()).await {
                Ok(()) => persisted.push(event),
                Err(error) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subscription = %event.subscription_id,
                        error = %error,
                        "failed to persist event"
                    );
                }
            }
        }
        for event in &persisted {
            self.scheduler.enqueue(event);
        }
        Ok(persisted)
    }

    /// Rolling delivery stats for one subscription and period.
    pub async fn stats(
        &self,
        subscription_id: &str,
        period: &str,
    ) -> Result<Option<DeliveryStats>> {
        self.store
            .stats_for(subscription_id, period)
            .await
            .context("loading delivery stats")
    }

    /// Scheduler state for operator health views.
    pub fn health(&self) -> SchedulerHealth {
        self.scheduler.health()
    }

    /// Breaker manager, for metrics views and tests.
    pub fn breakers(&self) -> &BreakerManager {
        &self.breakers
    }
}
