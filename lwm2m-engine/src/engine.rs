//! Shareable async engine handle
//!
//! `Engine` wraps `EngineState` in a tokio mutex and drives it against a
//! `Transport` and a `Clock`. The lock is only held while the state is
//! touched; every exchange with a server and every wait happens with the
//! lock released, so application calls never stall behind the network.
//!
//! # Usage Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use lwm2m_core::MonotonicClock;
//! use lwm2m_engine::{Engine, EngineConfig, Transport};
//! use lwm2m_interface::DeviceConfig;
//! use lwm2m_registration::ServerSettings;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> lwm2m_core::Lwm2mResult<()> {
//! let engine = Engine::new(transport, Arc::new(MonotonicClock::new()));
//! engine
//!     .configure(EngineConfig::new("node-1"), Some(DeviceConfig::new()), None)
//!     .await?;
//! engine.add_server(ServerSettings::new(1, "coap://server")).await?;
//! engine.run_until(tokio::signal::ctrl_c()).await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};

use lwm2m_core::{
    Clock, EventListener, InstanceId, Lwm2mResult, ObjectId, ResourceId, ShortServerId, Timestamp,
};
use lwm2m_interface::{
    ChangeKind, DeviceConfig, DeviceObject, Lwm2mObject, ObjectContext, ObjectDefinition,
};
use lwm2m_registration::{ExchangeOutcome, RetryPolicy, ServerSettings};

use crate::config::EngineConfig;
use crate::dispatcher::{Request, Response};
use crate::state::EngineState;
use crate::transport::Transport;

/// Cloneable handle to one engine instance
#[derive(Clone)]
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    /// Wakes the step loop when something changed
    notify: Arc<Notify>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an unconfigured engine
    ///
    /// # Arguments
    /// * `transport` - Carries outbound exchanges
    /// * `clock` - Monotonic time source for every deadline
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::new())),
            notify: Arc::new(Notify::new()),
            transport,
            clock,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Exclusive access to the engine state
    ///
    /// Hold the guard briefly; the step loop waits for it.
    pub async fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().await
    }

    /// Wake the step loop so it re-evaluates its deadlines
    pub fn interrupt(&self) {
        self.notify.notify_one();
    }

    /// Run `f` under the lock and wake the loop afterwards
    async fn mutate<R>(&self, f: impl FnOnce(&mut EngineState, Timestamp) -> R) -> R {
        let result = {
            let mut state = self.state.lock().await;
            f(&mut *state, self.clock.now())
        };
        self.interrupt();
        result
    }

    pub async fn configure(
        &self,
        config: EngineConfig,
        device: Option<DeviceConfig>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.configure(config, device, listener))
            .await
    }

    pub async fn add_object(
        &self,
        definition: ObjectDefinition,
        handler: Box<dyn Lwm2mObject>,
        instances: Vec<InstanceId>,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, now| state.add_object(definition, handler, instances, now))
            .await
    }

    pub async fn remove_object(&self, object: ObjectId) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.remove_object(object)).await
    }

    pub async fn add_instance(&self, object: ObjectId, instance: InstanceId) -> Lwm2mResult<()> {
        self.mutate(|state, now| state.add_instance(object, instance, now))
            .await
    }

    pub async fn remove_instance(&self, object: ObjectId, instance: InstanceId) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.remove_instance(object, instance))
            .await
    }

    /// Serve a request decoded by the transport
    pub async fn dispatch(&self, peer: Option<ShortServerId>, request: Request) -> Response {
        self.mutate(|state, now| state.dispatch(peer, &request, now))
            .await
    }

    pub async fn object_resource_changed(
        &self,
        object: ObjectId,
        instance: Option<InstanceId>,
        resource: Option<ResourceId>,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.object_resource_changed(object, instance, resource))
            .await
    }

    pub async fn object_instance_changed(
        &self,
        object: ObjectId,
        instance: InstanceId,
        kind: ChangeKind,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.object_instance_changed(object, instance, kind))
            .await
    }

    pub async fn notification_lock(&self, enter: bool) {
        self.mutate(|state, _| state.notification_lock(enter)).await
    }

    pub async fn add_server(&self, settings: ServerSettings) -> Lwm2mResult<InstanceId> {
        self.mutate(|state, _| state.add_server(settings)).await
    }

    pub async fn remove_server(&self, server: ShortServerId) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.remove_server(server)).await
    }

    pub async fn set_server_lifetime(&self, server: ShortServerId, lifetime: u64) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.set_server_lifetime(server, lifetime))
            .await
    }

    pub async fn set_server_binding(&self, server: ShortServerId, binding: &str) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.set_server_binding(server, binding))
            .await
    }

    pub async fn set_server_priority(
        &self,
        server: ShortServerId,
        priority_order: u32,
        initial_delay: u64,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.set_server_priority(server, priority_order, initial_delay))
            .await
    }

    pub async fn set_server_retry_policy(&self, server: ShortServerId, policy: RetryPolicy) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.set_server_retry_policy(server, policy))
            .await
    }

    pub async fn set_server_flags(
        &self,
        server: ShortServerId,
        block_on_failure: bool,
        bootstrap_on_failure: bool,
    ) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.set_server_flags(server, block_on_failure, bootstrap_on_failure))
            .await
    }

    pub async fn connection_lost(&self, server: ShortServerId) -> Lwm2mResult<()> {
        self.mutate(|state, _| state.connection_lost(server)).await
    }

    pub async fn retry_server(&self, server: ShortServerId) -> Lwm2mResult<()> {
        self.mutate(|state, now| state.retry_server(server, now)).await
    }

    pub async fn set_bootstrap_server(&self, uri: Option<String>) {
        self.mutate(|state, _| state.set_bootstrap_server(uri)).await
    }

    /// Update the Device object; see `EngineState::update_device`
    pub async fn update_device<R>(
        &self,
        f: impl FnOnce(&mut DeviceObject, &mut ObjectContext) -> Lwm2mResult<R>,
    ) -> Lwm2mResult<R> {
        self.mutate(|state, now| state.update_device(now, f)).await
    }

    pub async fn update_sensor(&self, object: ObjectId, instance: InstanceId, value: f64) -> Lwm2mResult<()> {
        self.mutate(|state, now| state.update_sensor(object, instance, value, now))
            .await
    }

    /// Run one tick and every exchange it hands out
    ///
    /// Exchanges run one after another with the lock released; a transport
    /// error counts as a failed exchange.
    ///
    /// # Returns
    /// Number of exchanges run
    pub async fn step(&self) -> usize {
        let actions = {
            let mut state = self.state.lock().await;
            state.tick(self.clock.now())
        };
        let count = actions.len();

        for action in actions {
            let outcome = match self.transport.send(action.message.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("Exchange with server {} failed: {}", action.server(), e);
                    ExchangeOutcome::Failure
                }
            };
            let mut state = self.state.lock().await;
            state.complete(&action, outcome, self.clock.now());
        }
        count
    }

    /// Time until the next step has work, capped by the configured maximum wait
    async fn wait_duration(&self) -> Duration {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let max_wait = state.config().max_wait;
        let wait = state
            .next_deadline(now)
            .map_or(max_wait, |deadline| deadline.saturating_sub(now).min(max_wait));
        Duration::from_secs(wait)
    }

    /// Step until `shutdown` completes
    ///
    /// Between steps the loop sleeps until the next deadline or until
    /// `interrupt` is called, whichever comes first.
    pub async fn run_until<F: Future>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        log::info!("Engine loop started");
        loop {
            self.step().await;
            let wait = self.wait_duration().await;
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        log::info!("Engine loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, OutboundMessage};
    use lwm2m_core::{Lwm2mError, ManualClock};
    use lwm2m_registration::RegistrationState;

    fn engine(transport: MockTransport, clock: Arc<ManualClock>) -> Engine {
        Engine::new(Arc::new(transport), clock)
    }

    #[tokio::test]
    async fn test_step_registers() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|m| matches!(m, OutboundMessage::Register { ssid: 1, .. }))
            .times(1)
            .returning(|_| Ok(ExchangeOutcome::Success));
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(transport, clock.clone());

        engine
            .configure(EngineConfig::new("node"), Some(DeviceConfig::new()), None)
            .await
            .unwrap();
        engine.add_server(ServerSettings::new(1, "coap://a")).await.unwrap();

        assert_eq!(engine.step().await, 1);
        clock.advance(1);
        assert_eq!(engine.step().await, 0);
        let state = engine.lock().await;
        assert_eq!(state.account(1).unwrap().state(), RegistrationState::Ready);
    }

    #[tokio::test]
    async fn test_transport_error_is_a_failure() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(Lwm2mError::Timeout));
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(transport, clock);

        engine
            .configure(EngineConfig::new("node"), None, None)
            .await
            .unwrap();
        engine.add_server(ServerSettings::new(1, "coap://a")).await.unwrap();

        assert_eq!(engine.step().await, 1);
        let state = engine.lock().await;
        assert_eq!(state.account(1).unwrap().state(), RegistrationState::RegisterRequired);
        assert_eq!(state.next_deadline(0), Some(60));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(ExchangeOutcome::Success));
        let engine = engine(transport, Arc::new(ManualClock::new(0)));
        engine
            .configure(EngineConfig::new("node"), None, None)
            .await
            .unwrap();
        engine.add_server(ServerSettings::new(1, "coap://a")).await.unwrap();

        engine.run_until(std::future::ready(())).await;
        let state = engine.lock().await;
        assert_eq!(state.account(1).unwrap().state(), RegistrationState::Registered);
    }

    #[tokio::test]
    async fn test_interrupt_wakes_the_loop() {
        let (sent_tx, mut sent_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut transport = MockTransport::new();
        transport.expect_send().returning(move |message| {
            let _ = sent_tx.send(message);
            Ok(ExchangeOutcome::Success)
        });
        let engine = engine(transport, Arc::new(ManualClock::new(0)));
        engine
            .configure(EngineConfig::new("node"), None, None)
            .await
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = engine.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        engine.add_server(ServerSettings::new(7, "coap://a")).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv())
            .await
            .expect("loop woke up")
            .expect("message sent");
        assert_eq!(message.server(), 7);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
