//! Engine state
//!
//! Everything the engine owns lives in one `EngineState`: the object
//! registry, the notification batcher, the observation table and one
//! registration machine per configured server. Callers hold the engine lock
//! for the duration of any method call. Nothing in here blocks or performs
//! I/O; exchanges with servers leave through `tick` as `OutboundAction`s and
//! come back through `complete`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use lwm2m_core::{
    Event, EventListener, InstanceId, Lwm2mError, Lwm2mResult, ObjectId, Operation, ResourceId,
    ResourceRecord, ShortServerId, Status, Timestamp, Uri, Value,
};
use lwm2m_interface::{
    ChangeKind, ChangeMarker, DeviceConfig, DeviceObject, GenericSensor, Lwm2mObject,
    ObjectContext, ObjectDefinition, SINGLE_INSTANCE_ID, ServerObject, SideEffect,
};
use lwm2m_registration::{
    ActionKind, ExchangeOutcome, RegistrationMachine, RegistrationState, RetryPolicy,
    ServerSettings,
};

use crate::batcher::NotificationBatcher;
use crate::config::EngineConfig;
use crate::dispatcher::{self, Request, Response};
use crate::observe::{NotificationAttributes, ObservationTable};
use crate::registry::{ObjectEntry, ObjectRegistry};
use crate::transport::{OutboundAction, OutboundMessage};

/// Registration bookkeeping of one configured server
#[derive(Debug, Clone)]
pub struct ServerAccount {
    settings: ServerSettings,
    machine: RegistrationMachine,
    instance: InstanceId,
}

impl ServerAccount {
    fn new(settings: ServerSettings, instance: InstanceId) -> Self {
        let mut machine = RegistrationMachine::new(settings.short_server_id);
        if settings.bootstrap_first {
            machine = machine.with_bootstrap();
        }
        Self {
            machine,
            settings,
            instance,
        }
    }

    pub fn server(&self) -> ShortServerId {
        self.settings.short_server_id
    }

    /// Settings as last read from the Server object
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn state(&self) -> RegistrationState {
        self.machine.state()
    }

    pub fn machine(&self) -> &RegistrationMachine {
        &self.machine
    }

    /// Server object instance holding this account
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    fn notification_defaults(&self) -> NotificationAttributes {
        NotificationAttributes::new(
            self.settings.default_min_period,
            self.settings.default_max_period,
        )
    }
}

/// Guarded engine context
#[derive(Default)]
pub struct EngineState {
    config: EngineConfig,
    configured: bool,
    registry: ObjectRegistry,
    batcher: NotificationBatcher,
    observations: ObservationTable,
    accounts: BTreeMap<ShortServerId, ServerAccount>,
    bootstrap_server: Option<String>,
    listener: Option<Arc<dyn EventListener>>,
    /// Exchanges queued outside a tick, handed out by the next one
    outbox: Vec<OutboundAction>,
    update_all: bool,
    update_servers: BTreeSet<ShortServerId>,
    /// Latest time seen by any entry point
    now: Timestamp,
}

impl fmt::Debug for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineState")
            .field("config", &self.config)
            .field("configured", &self.configured)
            .field("registry", &self.registry)
            .field("accounts", &self.accounts)
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time initialization
    ///
    /// # Arguments
    /// * `config` - Endpoint name and engine tuning
    /// * `device` - Registers the Device object (/3/0) when given
    /// * `listener` - Receives every engine event
    ///
    /// # Errors
    /// `PreconditionFailed` when called twice, `DuplicateObject` when the
    /// Device object is requested but /3 is already registered
    pub fn configure(
        &mut self,
        config: EngineConfig,
        device: Option<DeviceConfig>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Lwm2mResult<()> {
        if self.configured {
            return Err(Lwm2mError::PreconditionFailed(
                "engine is already configured".to_string(),
            ));
        }
        config.validate()?;
        if self.registry.contains(ServerObject::OBJECT_ID) {
            return Err(Lwm2mError::DuplicateObject(ServerObject::OBJECT_ID));
        }
        if device.is_some() && self.registry.contains(DeviceObject::OBJECT_ID) {
            return Err(Lwm2mError::DuplicateObject(DeviceObject::OBJECT_ID));
        }

        let now = self.now;
        self.registry.add_object(
            ServerObject::definition(),
            Box::new(ServerObject::new()),
            std::iter::empty(),
            now,
        )?;
        if let Some(device) = device {
            let device = DeviceObject::new(device);
            self.registry
                .add_object(device.definition(), Box::new(device), [SINGLE_INSTANCE_ID], now)?;
        }

        log::info!("Engine configured for endpoint {}", config.endpoint_name);
        self.config = config;
        self.listener = listener;
        self.configured = true;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn observations(&self) -> &ObservationTable {
        &self.observations
    }

    pub fn batcher(&self) -> &NotificationBatcher {
        &self.batcher
    }

    pub fn account(&self, server: ShortServerId) -> Option<&ServerAccount> {
        self.accounts.get(&server)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &ServerAccount> {
        self.accounts.values()
    }

    fn require_configured(&self) -> Lwm2mResult<()> {
        if !self.configured {
            return Err(Lwm2mError::PreconditionFailed(
                "engine is not configured".to_string(),
            ));
        }
        Ok(())
    }

    // ---- object registry ----

    /// Register an object; see `ObjectRegistry::add_object`
    pub fn add_object(
        &mut self,
        definition: ObjectDefinition,
        handler: Box<dyn Lwm2mObject>,
        instances: impl IntoIterator<Item = InstanceId>,
        now: Timestamp,
    ) -> Lwm2mResult<()> {
        self.now = now;
        self.registry.add_object(definition, handler, instances, now)?;
        self.update_all = true;
        Ok(())
    }

    /// Unregister an object, dropping observations under it
    ///
    /// The Server object is managed by the engine and cannot be removed.
    pub fn remove_object(&mut self, object: ObjectId) -> Lwm2mResult<()> {
        if object == ServerObject::OBJECT_ID && self.configured {
            return Err(Lwm2mError::not_allowed("removal of the Server object"));
        }
        self.registry.remove_object(object)?;
        let events = self
            .observations
            .cancel_under(&Uri::object(object))
            .into_iter()
            .map(|(server, uri)| Event::ObservationCanceled { server, uri })
            .collect();
        self.emit(events);
        self.update_all = true;
        Ok(())
    }

    pub fn add_instance(&mut self, object: ObjectId, instance: InstanceId, now: Timestamp) -> Lwm2mResult<()> {
        if object == ServerObject::OBJECT_ID {
            return Err(Lwm2mError::not_allowed("Server instances are added with add_server"));
        }
        self.now = now;
        self.registry.add_instance(object, instance, now)?;
        self.mark(ChangeMarker::instance_created(object, instance));
        Ok(())
    }

    pub fn remove_instance(&mut self, object: ObjectId, instance: InstanceId) -> Lwm2mResult<()> {
        if object == ServerObject::OBJECT_ID {
            return Err(Lwm2mError::not_allowed(
                "Server instances are removed with remove_server",
            ));
        }
        self.registry.remove_instance(object, instance)?;
        self.mark(ChangeMarker::instance_deleted(object, instance));
        Ok(())
    }

    pub fn lookup(&self, object: ObjectId, instance: Option<InstanceId>) -> Lwm2mResult<&ObjectEntry> {
        self.registry.lookup(object, instance)
    }

    /// Typed read access to an object handler
    pub fn with_object<T: Lwm2mObject, R>(&self, object: ObjectId, f: impl FnOnce(&T) -> R) -> Lwm2mResult<R> {
        self.registry
            .handler::<T>(object)
            .map(f)
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}", object)))
    }

    /// Typed mutable access to an object handler
    ///
    /// Everything `f` marks through the context is flushed as one batch.
    pub fn with_object_mut<T: Lwm2mObject, R>(
        &mut self,
        object: ObjectId,
        now: Timestamp,
        f: impl FnOnce(&mut T, &mut ObjectContext) -> Lwm2mResult<R>,
    ) -> Lwm2mResult<R> {
        self.now = now;
        let mut ctx = ObjectContext::new(now, object);
        self.batcher.enter();
        let result = match self.registry.handler_mut::<T>(object) {
            Some(handler) => f(handler, &mut ctx),
            None => Err(Lwm2mError::not_found(format!("/{}", object))),
        };
        self.finish(ctx);
        if let Some(batch) = self.batcher.leave() {
            self.evaluate(batch);
        }
        result
    }

    /// Update the Device object
    ///
    /// # Errors
    /// `PreconditionFailed` before `configure`, `NotFound` when the engine was
    /// configured without a Device object
    pub fn update_device<R>(
        &mut self,
        now: Timestamp,
        f: impl FnOnce(&mut DeviceObject, &mut ObjectContext) -> Lwm2mResult<R>,
    ) -> Lwm2mResult<R> {
        self.require_configured()?;
        self.with_object_mut(DeviceObject::OBJECT_ID, now, f)
    }

    /// Push a new measurement into a generic sensor instance
    pub fn update_sensor(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        value: f64,
        now: Timestamp,
    ) -> Lwm2mResult<()> {
        self.registry.lookup(object, Some(instance))?;
        self.with_object_mut(object, now, |sensor: &mut GenericSensor, ctx| {
            sensor.update_value(ctx, instance, value)
        })
    }

    // ---- operations ----

    /// Serve a request decoded by the transport
    ///
    /// # Arguments
    /// * `peer` - Short server id of the requesting server; observation
    ///   bookkeeping needs one
    /// * `request` - Operation, target path and payload
    /// * `now` - Current monotonic time
    pub fn dispatch(&mut self, peer: Option<ShortServerId>, request: &Request, now: Timestamp) -> Response {
        self.now = now;
        let mut ctx = ObjectContext::new(now, request.uri.object);
        let response = match request.op {
            Operation::Observe => self.observe(peer, request, &mut ctx),
            Operation::CancelObserve => self.cancel_observe(peer, request, &mut ctx),
            Operation::WriteAttributes => self.write_attributes(peer, request, &mut ctx),
            _ => dispatcher::dispatch(&mut self.registry, &mut ctx, request),
        };
        self.finish(ctx);

        if request.uri.object == ServerObject::OBJECT_ID && response.is_success() {
            match request.op {
                Operation::Create => {
                    if let Some(instance) = response.created {
                        self.apply_server_defaults(instance, &request.records);
                    }
                    self.reconcile_servers();
                }
                Operation::Delete => self.reconcile_servers(),
                _ => {}
            }
        }
        response
    }

    fn observe(&mut self, peer: Option<ShortServerId>, request: &Request, ctx: &mut ObjectContext) -> Response {
        let Some(server) = peer else {
            log::debug!("Observe on {} without a server", request.uri);
            return Response::error(Status::BadRequest);
        };
        let response = dispatcher::dispatch(&mut self.registry, ctx, request);
        if response.is_success() && self.observations.observe(server, request.uri, self.now) {
            ctx.emit(Event::ObservationStarted {
                server,
                uri: request.uri,
            });
        }
        response
    }

    fn cancel_observe(
        &mut self,
        peer: Option<ShortServerId>,
        request: &Request,
        ctx: &mut ObjectContext,
    ) -> Response {
        let Some(server) = peer else {
            return Response::error(Status::BadRequest);
        };
        let response = dispatcher::dispatch(&mut self.registry, ctx, request);
        if !response.is_success() {
            return response;
        }
        if !self.observations.cancel(server, &request.uri) {
            return Response::error(Status::NotFound);
        }
        ctx.emit(Event::ObservationCanceled {
            server,
            uri: request.uri,
        });
        response
    }

    fn write_attributes(
        &mut self,
        peer: Option<ShortServerId>,
        request: &Request,
        ctx: &mut ObjectContext,
    ) -> Response {
        let Some(server) = peer else {
            return Response::error(Status::BadRequest);
        };
        let response = dispatcher::dispatch(&mut self.registry, ctx, request);
        if !response.is_success() {
            return response;
        }
        let attributes = request.attributes;
        if let Err(e) = self.observations.set_attributes(server, request.uri, attributes) {
            log::debug!("Attributes for {} rejected: {}", request.uri, e);
            return Response::error(Status::from(&e));
        }
        ctx.emit(Event::EvaluationPeriodChanged {
            server,
            uri: request.uri,
            pmin: attributes.pmin,
            pmax: attributes.pmax,
        });
        response
    }

    // ---- notifications ----

    /// Mark a resource, an instance (`resource` = `None`) or a whole object
    /// (`instance` = `None`) as changed
    pub fn object_resource_changed(
        &mut self,
        object: ObjectId,
        instance: Option<InstanceId>,
        resource: Option<ResourceId>,
    ) -> Lwm2mResult<()> {
        let entry = self.registry.lookup(object, instance)?;
        if let Some(resource) = resource {
            if entry.definition().resource(resource).is_none() {
                return Err(Lwm2mError::not_found(format!("resource {} of /{}", resource, object)));
            }
        }
        self.mark(ChangeMarker::resource(object, instance, resource));
        Ok(())
    }

    /// Report an instance created or deleted by the object itself
    ///
    /// `ChangeKind::ResourceChanged` marks every resource of the instance.
    pub fn object_instance_changed(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        kind: ChangeKind,
    ) -> Lwm2mResult<()> {
        self.registry.lookup(object, None)?;
        let marker = match kind {
            ChangeKind::InstanceCreated => ChangeMarker::instance_created(object, instance),
            ChangeKind::InstanceDeleted => ChangeMarker::instance_deleted(object, instance),
            ChangeKind::ResourceChanged => ChangeMarker::resource(object, Some(instance), None),
        };
        self.mark(marker);
        Ok(())
    }

    /// Enter (`true`) or leave (`false`) a notification batch
    pub fn notification_lock(&mut self, enter: bool) {
        if let Some(batch) = self.batcher.lock(enter) {
            self.evaluate(batch);
        }
    }

    fn mark(&mut self, marker: ChangeMarker) {
        if let Some(batch) = self.batcher.mark(marker) {
            self.evaluate(batch);
        }
    }

    /// One evaluation pass over a flushed batch
    fn evaluate(&mut self, batch: Vec<ChangeMarker>) {
        let mut events = Vec::new();
        let mut update = false;
        let mut pending = 0;
        for marker in &batch {
            let uri = marker.uri();
            match marker.kind {
                ChangeKind::InstanceCreated => {
                    update = true;
                    if let Some(instance) = marker.instance {
                        events.push(Event::InstanceCreated {
                            object: marker.object,
                            instance,
                        });
                    }
                }
                ChangeKind::InstanceDeleted => {
                    update = true;
                    if let Some(instance) = marker.instance {
                        events.push(Event::InstanceDeleted {
                            object: marker.object,
                            instance,
                        });
                    }
                    events.extend(
                        self.observations
                            .cancel_under(&uri)
                            .into_iter()
                            .map(|(server, uri)| Event::ObservationCanceled { server, uri }),
                    );
                }
                ChangeKind::ResourceChanged => update |= self.config.update_on_resource_change,
            }
            pending += self.observations.mark_changed(&uri);
        }
        log::debug!(
            "Evaluated {} change marker(s), {} observation(s) pending",
            batch.len(),
            pending
        );
        if update {
            self.update_all = true;
        }
        self.emit(events);
    }

    /// Apply what a callback queued on its context
    fn finish(&mut self, mut ctx: ObjectContext) {
        let (changes, effects) = ctx.take();
        let mut events = Vec::new();
        for effect in effects {
            match effect {
                SideEffect::Event(event) => events.push(event),
                SideEffect::RegistrationUpdate(Some(server)) => {
                    self.update_servers.insert(server);
                }
                SideEffect::RegistrationUpdate(None) => self.update_all = true,
                SideEffect::BootstrapRequest(server) => {
                    let now = self.now;
                    if let Some(account) = self.accounts.get_mut(&server) {
                        log::info!("Bootstrap requested for server {}", server);
                        let action = account.machine.request_bootstrap(now, &mut events);
                        self.queue(server, action);
                    }
                }
                SideEffect::ServerDisable { server, timeout } => {
                    let now = self.now;
                    if let Some(account) = self.accounts.get_mut(&server) {
                        log::info!("Server {} disabled for {}s", server, timeout);
                        let action = account.machine.disable(now, timeout, &mut events);
                        self.queue(server, action);
                    }
                }
            }
        }
        self.emit(events);
        if !changes.is_empty() {
            if let Some(batch) = self.batcher.mark_all(changes) {
                self.evaluate(batch);
            }
        }
    }

    fn queue(&mut self, server: ShortServerId, action: Option<ActionKind>) {
        if let Some(ActionKind::Deregister) = action {
            self.outbox
                .push(OutboundAction::new(OutboundMessage::Deregister { ssid: server }));
        }
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            log::info!("{}", event.description());
            if let Some(listener) = &self.listener {
                listener.on_event(&event);
            }
        }
    }

    // ---- server accounts ----

    fn server_object_mut(&mut self) -> Lwm2mResult<&mut ServerObject> {
        self.registry
            .handler_mut::<ServerObject>(ServerObject::OBJECT_ID)
            .ok_or_else(|| Lwm2mError::PreconditionFailed("Server object not registered".to_string()))
    }

    /// Add a server account and its Server object instance
    ///
    /// # Returns
    /// The Server object instance holding the account
    ///
    /// # Errors
    /// `PreconditionFailed` before `configure`, `BadRequest` for invalid
    /// settings, `AlreadyExists` for a short server id already in use
    pub fn add_server(&mut self, settings: ServerSettings) -> Lwm2mResult<InstanceId> {
        self.require_configured()?;
        settings.validate()?;
        let server = settings.short_server_id;
        if self.accounts.contains_key(&server) {
            return Err(Lwm2mError::AlreadyExists(format!("server {}", server)));
        }

        let object = self.server_object_mut()?;
        let instance = object
            .free_instance_id()
            .ok_or_else(|| Lwm2mError::Internal("no free Server instance".to_string()))?;
        object.insert(instance, settings.clone())?;
        let now = self.now;
        if let Err(e) = self.registry.add_instance(ServerObject::OBJECT_ID, instance, now) {
            if let Ok(object) = self.server_object_mut() {
                object.remove(instance);
            }
            return Err(e);
        }

        log::info!("Added server {} ({}) as /1/{}", server, settings.uri, instance);
        self.accounts.insert(server, ServerAccount::new(settings, instance));
        self.mark(ChangeMarker::instance_created(ServerObject::OBJECT_ID, instance));
        Ok(instance)
    }

    /// Remove a server account
    ///
    /// A registered account queues a best-effort Deregister first. Results
    /// of exchanges still in flight for it are ignored.
    pub fn remove_server(&mut self, server: ShortServerId) -> Lwm2mResult<()> {
        let mut account = self
            .accounts
            .remove(&server)
            .ok_or_else(|| Lwm2mError::not_found(format!("server {}", server)))?;
        let mut events = Vec::new();
        self.drop_account(&mut account, &mut events);
        self.emit(events);

        if self
            .registry
            .remove_instance(ServerObject::OBJECT_ID, account.instance)
            .is_ok()
        {
            self.mark(ChangeMarker::instance_deleted(ServerObject::OBJECT_ID, account.instance));
        }
        log::info!("Removed server {}", server);
        Ok(())
    }

    fn drop_account(&mut self, account: &mut ServerAccount, events: &mut Vec<Event>) {
        let server = account.server();
        let action = account.machine.deregister(events);
        self.queue(server, action);
        events.extend(
            self.observations
                .remove_server(server)
                .into_iter()
                .map(|uri| Event::ObservationCanceled { server, uri }),
        );
    }

    /// Bring the account list in line with the Server object instances
    fn reconcile_servers(&mut self) {
        let Some(object) = self.registry.handler::<ServerObject>(ServerObject::OBJECT_ID) else {
            return;
        };
        let present: BTreeMap<ShortServerId, (InstanceId, ServerSettings)> = object
            .instances()
            .map(|(instance, settings)| (settings.short_server_id, (instance, settings.clone())))
            .collect();

        let gone: Vec<ShortServerId> = self
            .accounts
            .keys()
            .filter(|server| !present.contains_key(server))
            .copied()
            .collect();
        let mut events = Vec::new();
        for server in gone {
            if let Some(mut account) = self.accounts.remove(&server) {
                log::info!("Server {} left with /1/{}", server, account.instance);
                self.drop_account(&mut account, &mut events);
            }
        }
        for (server, (instance, settings)) in present {
            self.accounts.entry(server).or_insert_with(|| {
                log::info!("Server {} appeared as /1/{}", server, instance);
                ServerAccount::new(settings, instance)
            });
        }
        self.emit(events);
    }

    /// A freshly created Server instance without a Lifetime gets the default one
    fn apply_server_defaults(&mut self, instance: InstanceId, records: &[ResourceRecord]) {
        if records.iter().any(|r| r.resource == ServerObject::RES_LIFETIME) {
            return;
        }
        let lifetime = self.config.default_lifetime;
        if let Some(settings) = self
            .server_object_mut()
            .ok()
            .and_then(|object| object.settings_mut(instance))
        {
            settings.lifetime = lifetime;
        }
    }

    /// Write Server object resources of one account through the dispatcher
    fn write_server(&mut self, server: ShortServerId, values: Vec<(ResourceId, Value)>) -> Lwm2mResult<()> {
        let instance = self
            .accounts
            .get(&server)
            .map(ServerAccount::instance)
            .ok_or_else(|| Lwm2mError::not_found(format!("server {}", server)))?;
        let records = values
            .into_iter()
            .map(|(resource, value)| {
                ResourceRecord::with_value(ServerObject::OBJECT_ID, instance, resource, value)
            })
            .collect();
        let now = self.now;
        let response = self.dispatch(None, &Request::write(ServerObject::OBJECT_ID, instance, records), now);
        response
            .status
            .into_result(format!("write to /1/{}", instance))?;
        self.refresh_settings();
        Ok(())
    }

    pub fn set_server_lifetime(&mut self, server: ShortServerId, lifetime: u64) -> Lwm2mResult<()> {
        let lifetime = i64::try_from(lifetime)
            .map_err(|_| Lwm2mError::bad_request(format!("lifetime {}", lifetime)))?;
        self.write_server(server, vec![(ServerObject::RES_LIFETIME, Value::Integer(lifetime))])
    }

    pub fn set_server_binding(&mut self, server: ShortServerId, binding: &str) -> Lwm2mResult<()> {
        self.write_server(
            server,
            vec![(ServerObject::RES_BINDING, Value::String(binding.to_string()))],
        )
    }

    /// Set the registration priority order and the initial registration delay
    pub fn set_server_priority(
        &mut self,
        server: ShortServerId,
        priority_order: u32,
        initial_delay: u64,
    ) -> Lwm2mResult<()> {
        self.write_server(
            server,
            vec![
                (ServerObject::RES_PRIORITY_ORDER, Value::UnsignedInteger(priority_order as u64)),
                (ServerObject::RES_INITIAL_DELAY, Value::UnsignedInteger(initial_delay)),
            ],
        )
    }

    pub fn set_server_retry_policy(&mut self, server: ShortServerId, policy: RetryPolicy) -> Lwm2mResult<()> {
        self.write_server(
            server,
            vec![
                (ServerObject::RES_RETRY_COUNT, Value::UnsignedInteger(policy.retry_count as u64)),
                (ServerObject::RES_RETRY_TIMER, Value::UnsignedInteger(policy.retry_timer)),
                (
                    ServerObject::RES_SEQUENCE_DELAY_TIMER,
                    Value::UnsignedInteger(policy.sequence_delay_timer),
                ),
                (
                    ServerObject::RES_SEQUENCE_RETRY_COUNT,
                    Value::UnsignedInteger(policy.sequence_retry_count as u64),
                ),
            ],
        )
    }

    /// Set the Registration Failure Block and Bootstrap on Registration Failure flags
    pub fn set_server_flags(
        &mut self,
        server: ShortServerId,
        block_on_failure: bool,
        bootstrap_on_failure: bool,
    ) -> Lwm2mResult<()> {
        self.write_server(
            server,
            vec![
                (ServerObject::RES_BLOCK_ON_FAILURE, Value::Boolean(block_on_failure)),
                (ServerObject::RES_BOOTSTRAP_ON_FAILURE, Value::Boolean(bootstrap_on_failure)),
            ],
        )
    }

    /// The transport lost its connection to a server
    pub fn connection_lost(&mut self, server: ShortServerId) -> Lwm2mResult<()> {
        let account = self
            .accounts
            .get_mut(&server)
            .ok_or_else(|| Lwm2mError::not_found(format!("server {}", server)))?;
        let mut events = Vec::new();
        account.machine.connection_lost(&mut events);
        self.emit(events);
        Ok(())
    }

    /// Re-arm an account whose registration or bootstrap gave up
    pub fn retry_server(&mut self, server: ShortServerId, now: Timestamp) -> Lwm2mResult<()> {
        self.now = now;
        let account = self
            .accounts
            .get_mut(&server)
            .ok_or_else(|| Lwm2mError::not_found(format!("server {}", server)))?;
        account.machine.restart(now);
        Ok(())
    }

    /// Bootstrap server URI used when an account falls back to bootstrapping
    pub fn set_bootstrap_server(&mut self, uri: Option<String>) {
        self.bootstrap_server = uri;
    }

    /// Re-read every account's settings from the Server object
    fn refresh_settings(&mut self) {
        let now = self.now;
        for account in self.accounts.values_mut() {
            let mut ctx = ObjectContext::new(now, ServerObject::OBJECT_ID);
            let request = Request::read(Uri::instance(ServerObject::OBJECT_ID, account.instance));
            let response = dispatcher::dispatch(&mut self.registry, &mut ctx, &request);
            if response.records.is_empty() {
                log::warn!(
                    "Settings of server {} unreadable: {}",
                    account.server(),
                    response.status
                );
                continue;
            }
            ServerObject::apply_records(&mut account.settings, &response.records);
        }
    }

    /// Account with a lower priority order whose initial registration holds this one back
    fn blocked_by(&self, server: ShortServerId) -> Option<ShortServerId> {
        let account = self.accounts.get(&server)?;
        let order = account.settings.priority_order?;
        if !account.machine.is_initial_registration_pending() {
            return None;
        }
        self.accounts
            .values()
            .filter(|other| other.server() != server)
            .find(|other| match other.settings.priority_order {
                Some(theirs) if theirs < order => {
                    other.machine.is_initial_registration_pending()
                        || (other.state().is_failed() && other.settings.block_on_failure)
                }
                _ => false,
            })
            .map(ServerAccount::server)
    }

    fn build_message(&self, server: ShortServerId, kind: ActionKind) -> Option<OutboundMessage> {
        let settings = &self.accounts.get(&server)?.settings;
        Some(match kind {
            ActionKind::Bootstrap => {
                self.bootstrap_server.as_ref()?;
                OutboundMessage::Bootstrap {
                    ssid: server,
                    endpoint: self.config.endpoint_name.clone(),
                }
            }
            ActionKind::Register => OutboundMessage::Register {
                ssid: server,
                endpoint: self.config.endpoint_name.clone(),
                lifetime: settings.lifetime,
                binding: settings.binding.clone(),
                queue_mode: settings.queue_mode(),
                links: self.registry.links(),
            },
            ActionKind::Update => OutboundMessage::Update {
                ssid: server,
                lifetime: settings.lifetime,
                binding: settings.binding.clone(),
                links: self.registry.links(),
            },
            ActionKind::Deregister => OutboundMessage::Deregister { ssid: server },
        })
    }

    // ---- scheduling ----

    /// Periodic tick
    ///
    /// Fires every registration action and notification whose deadline is
    /// at or before `now`, and hands out the exchanges to run.
    pub fn tick(&mut self, now: Timestamp) -> Vec<OutboundAction> {
        self.now = now;
        if !self.configured {
            return Vec::new();
        }
        self.refresh_settings();

        let mut events = Vec::new();
        let mut actions = std::mem::take(&mut self.outbox);

        let update_all = std::mem::take(&mut self.update_all);
        let update_servers = std::mem::take(&mut self.update_servers);
        for account in self.accounts.values_mut() {
            if update_all || update_servers.contains(&account.server()) {
                account.machine.request_update(now);
            }
        }

        let tuning = self.config.tuning();
        let servers: Vec<ShortServerId> = self.accounts.keys().copied().collect();
        for server in servers {
            if let Some(blocker) = self.blocked_by(server) {
                log::debug!("Server {} waits for server {}", server, blocker);
                continue;
            }
            let Some(account) = self.accounts.get_mut(&server) else {
                continue;
            };
            let Some(kind) = account
                .machine
                .poll(now, &account.settings, &mut events)
            else {
                continue;
            };
            match self.build_message(server, kind) {
                Some(message) => actions.push(OutboundAction::new(message)),
                None => {
                    log::warn!("No bootstrap server configured for server {}", server);
                    if let Some(account) = self.accounts.get_mut(&server) {
                        account.machine.complete(
                            kind,
                            ExchangeOutcome::Failure,
                            now,
                            &account.settings,
                            &tuning,
                            &mut events,
                        );
                    }
                }
            }
        }

        self.emit(events);
        actions.extend(self.collect_notifications(now));
        actions
    }

    /// Read every due observation and queue its notification
    fn collect_notifications(&mut self, now: Timestamp) -> Vec<OutboundAction> {
        let accounts = &self.accounts;
        let due = self.observations.due(now, |server| {
            accounts
                .get(&server)
                .filter(|a| a.state().is_registered())
                .map(ServerAccount::notification_defaults)
        });

        let mut actions = Vec::new();
        for (server, uri) in due {
            let mut ctx = ObjectContext::new(now, uri.object);
            let response =
                dispatcher::dispatch(&mut self.registry, &mut ctx, &Request::new(Operation::Notify, uri));
            self.finish(ctx);
            if !response.is_success() && response.records.is_empty() {
                log::debug!("Observed path {} of server {} is gone", uri, server);
                if self.observations.cancel(server, &uri) {
                    self.emit(vec![Event::ObservationCanceled { server, uri }]);
                }
                continue;
            }
            self.observations.notified(server, &uri, now);
            actions.push(OutboundAction::new(OutboundMessage::Notify {
                ssid: server,
                uri,
                records: response.records,
            }));
        }
        actions
    }

    /// Report the result of an exchange handed out by `tick`
    pub fn complete(&mut self, action: &OutboundAction, outcome: ExchangeOutcome, now: Timestamp) {
        self.now = now;
        let server = action.server();
        let Some(kind) = action.kind() else {
            if outcome == ExchangeOutcome::Failure {
                log::warn!("Notification to server {} failed", server);
            }
            return;
        };
        if kind == ActionKind::Deregister {
            log::debug!("Deregister from server {} finished: {:?}", server, outcome);
            return;
        }

        let tuning = self.config.tuning();
        let mut events = Vec::new();
        match self.accounts.get_mut(&server) {
            Some(account) => {
                account
                    .machine
                    .complete(kind, outcome, now, &account.settings, &tuning, &mut events)
            }
            None => log::debug!("Ignoring {:?} result for removed server {}", kind, server),
        }
        self.emit(events);
    }

    /// Earliest time the next tick has work to do, never before `now`
    pub fn next_deadline(&self, now: Timestamp) -> Option<Timestamp> {
        if !self.outbox.is_empty() || self.update_all || !self.update_servers.is_empty() {
            return Some(now);
        }
        let machines = self
            .accounts
            .values()
            .filter(|account| self.blocked_by(account.server()).is_none())
            .filter_map(|account| account.machine.next_deadline());
        let observations = self.observations.next_deadline(|server| {
            self.accounts
                .get(&server)
                .filter(|a| a.state().is_registered())
                .map(ServerAccount::notification_defaults)
        });
        machines
            .chain(observations)
            .min()
            .map(|deadline| deadline.max(now))
    }
}
