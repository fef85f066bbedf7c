//! End-to-end scenarios against the engine state and the async handle

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mockall::mock;

use lwm2m_core::{
    CallbackEventListener, Event, EventListener, InstanceId, Lwm2mError, Lwm2mResult, ManualClock,
    Operation, ResourceDescriptor, ResourceFlags, ResourceRecord, Status, Timestamp, Uri, Value,
    ValueType,
};
use lwm2m_engine::{Engine, EngineConfig, EngineState, OutboundMessage, Request, Transport};
use lwm2m_interface::{Lwm2mObject, Multiplicity, ObjectContext, ObjectDefinition};
use lwm2m_registration::{
    ActionKind, ExchangeOutcome, RegistrationState, RetryPolicy, ServerSettings,
};

mock! {
    pub Link {}

    #[async_trait]
    impl Transport for Link {
        async fn send(&self, message: OutboundMessage) -> Lwm2mResult<ExchangeOutcome>;
    }
}

const SWITCHBOARD: u16 = 50;
const BEACON: u16 = 60;

/// Multi-instance object: 0 is a read-only flag, 1 a writable level and 2
/// a reading that is never available
#[derive(Debug, Default)]
struct Switchboard {
    levels: BTreeMap<InstanceId, i64>,
}

impl Switchboard {
    fn definition() -> ObjectDefinition {
        ObjectDefinition::new(SWITCHBOARD, Multiplicity::Multiple).with_resources([
            ResourceDescriptor::read_only(0, ValueType::Boolean, ResourceFlags::MANDATORY),
            ResourceDescriptor::read_write(1, ValueType::Integer, ResourceFlags::OPTIONAL),
            ResourceDescriptor::read_only(2, ValueType::Integer, ResourceFlags::OPTIONAL),
        ])
    }
}

impl Lwm2mObject for Switchboard {
    fn handle(
        &mut self,
        _ctx: &mut ObjectContext,
        op: Operation,
        instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()> {
        let level = self.levels.entry(instance).or_default();
        for record in records.iter_mut() {
            match (op, record.resource) {
                (Operation::Read, 0) => record.set(Value::Boolean(true)),
                (Operation::Read, 1) => record.set(Value::Integer(*level)),
                (Operation::Read, _) => record.fail(Status::NotFound),
                (Operation::Write | Operation::Create, 1) => match record.value.as_i64() {
                    Some(value) => *level = value,
                    None => record.fail(Status::BadRequest),
                },
                _ => record.fail(Status::MethodNotAllowed),
            }
        }
        Ok(())
    }

    fn create_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        self.levels.insert(instance, 0);
        Ok(())
    }

    fn delete_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        self.levels
            .remove(&instance)
            .map(|_| ())
            .ok_or_else(|| Lwm2mError::not_found(format!("/50/{}", instance)))
    }

    fn attach_instance(&mut self, instance: InstanceId, _now: Timestamp) -> Lwm2mResult<()> {
        self.levels.entry(instance).or_default();
        Ok(())
    }

    fn detach_instance(&mut self, instance: InstanceId) {
        self.levels.remove(&instance);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Single-instance object with one read-only boolean initialized to true
#[derive(Debug)]
struct Beacon {
    lit: bool,
}

impl Lwm2mObject for Beacon {
    fn handle(
        &mut self,
        _ctx: &mut ObjectContext,
        _op: Operation,
        _instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()> {
        for record in records.iter_mut() {
            record.set(Value::Boolean(self.lit));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn beacon_definition() -> ObjectDefinition {
    ObjectDefinition::new(BEACON, Multiplicity::Single).with_resource(ResourceDescriptor::read_only(
        0,
        ValueType::Boolean,
        ResourceFlags::MANDATORY,
    ))
}

fn recorder() -> (Arc<Mutex<Vec<Event>>>, Arc<dyn EventListener>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener = CallbackEventListener::new(move |event: &Event| {
        sink.lock().unwrap().push(event.clone());
    });
    (events, Arc::new(listener))
}

fn engine_state(listener: Option<Arc<dyn EventListener>>) -> EngineState {
    let mut state = EngineState::new();
    state
        .configure(EngineConfig::new("scenario"), None, listener)
        .unwrap();
    state
        .add_object(Switchboard::definition(), Box::new(Switchboard::default()), [0], 0)
        .unwrap();
    state
}

#[test]
fn test_add_remove_object_round_trip() {
    let mut state = engine_state(None);
    let links = state.registry().links();
    let objects: Vec<u16> = state.registry().object_ids().collect();

    state
        .add_object(beacon_definition(), Box::new(Beacon { lit: true }), [0], 0)
        .unwrap();
    assert_ne!(state.registry().links(), links);
    state.remove_object(BEACON).unwrap();

    assert_eq!(state.registry().links(), links);
    assert_eq!(state.registry().object_ids().collect::<Vec<_>>(), objects);
    assert!(state.lookup(BEACON, None).is_err());
}

#[test]
fn test_create_then_delete_yields_one_marker_each() {
    let (events, listener) = recorder();
    let mut state = engine_state(Some(listener));

    let response = state.dispatch(None, &Request::create(SWITCHBOARD, Some(3), Vec::new()), 0);
    assert_eq!(response.created, Some(3));
    let response = state.dispatch(None, &Request::delete(SWITCHBOARD, 3), 1);
    assert!(response.is_success());

    let events = events.lock().unwrap();
    let created = events
        .iter()
        .filter(|e| **e == Event::InstanceCreated { object: SWITCHBOARD, instance: 3 })
        .count();
    let deleted = events
        .iter()
        .filter(|e| **e == Event::InstanceDeleted { object: SWITCHBOARD, instance: 3 })
        .count();
    assert_eq!((created, deleted), (1, 1));
}

#[test]
fn test_repeated_write_inside_lock_leaves_one_marker() {
    let mut state = engine_state(None);
    let evaluations = state.batcher().evaluations();
    let write = Request::write_value(SWITCHBOARD, 0, 1, Value::Integer(5));

    state.notification_lock(true);
    assert!(state.dispatch(None, &write, 0).is_success());
    assert!(state.dispatch(None, &write, 0).is_success());
    assert_eq!(state.batcher().pending().count(), 1);
    state.notification_lock(false);

    assert_eq!(state.batcher().pending().count(), 0);
    assert_eq!(state.batcher().evaluations(), evaluations + 1);
}

#[test]
fn test_partial_read_keeps_successful_records() {
    let mut state = engine_state(None);
    let request = Request {
        records: vec![
            ResourceRecord::target(SWITCHBOARD, 0, 0),
            ResourceRecord::target(SWITCHBOARD, 0, 2),
        ],
        ..Request::read(Uri::instance(SWITCHBOARD, 0))
    };

    let response = state.dispatch(None, &request, 0);
    assert_eq!(response.status, Status::NotFound);
    assert_eq!(response.records[0].value.as_bool(), Some(true));
    assert!(response.records[0].is_ok());
    assert!(!response.records[1].is_ok());
}

#[test]
fn test_registration_retry_ladder() {
    let (events, listener) = recorder();
    let mut state = engine_state(Some(listener));
    state
        .add_server(
            ServerSettings::new(1, "coap://unreachable")
                .with_retry_policy(RetryPolicy::new(3, 60, 0, 86400)),
        )
        .unwrap();

    let mut now = 0;
    let mut retries = Vec::new();
    for _ in 0..4 {
        let actions = state.tick(now);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), Some(ActionKind::Register));
        state.complete(&actions[0], ExchangeOutcome::Failure, now);
        match state.next_deadline(now) {
            Some(deadline) => {
                retries.push(deadline - now);
                now = deadline;
            }
            None => break,
        }
    }

    assert_eq!(retries, vec![60, 120, 240]);
    assert_eq!(state.account(1).unwrap().state(), RegistrationState::RegisterFailed);
    assert!(events
        .lock()
        .unwrap()
        .contains(&Event::RegistrationFailed { server: 1 }));
}

#[test]
fn test_boolean_resource_read_then_object_removed() {
    let mut state = engine_state(None);
    state
        .add_object(beacon_definition(), Box::new(Beacon { lit: true }), [0], 0)
        .unwrap();

    let read = Request::read(Uri::resource(BEACON, 0, 0));
    let response = state.dispatch(None, &read, 0);
    assert_eq!(response.status, Status::NoError);
    assert_eq!(response.value(0).and_then(Value::as_bool), Some(true));

    state.remove_object(BEACON).unwrap();
    assert_eq!(state.dispatch(None, &read, 1).status, Status::NotFound);
}

#[tokio::test]
async fn test_changes_in_one_lock_bracket_update_once() {
    let mut link = MockLink::new();
    link.expect_send()
        .withf(|m| matches!(m, OutboundMessage::Register { ssid: 1, lifetime: 50, .. }))
        .times(1)
        .returning(|_| Ok(ExchangeOutcome::Success));
    link.expect_send()
        .withf(|m| matches!(m, OutboundMessage::Update { ssid: 1, .. }))
        .times(1)
        .returning(|_| Ok(ExchangeOutcome::Success));
    link.expect_send()
        .withf(|m| matches!(m, OutboundMessage::Notify { ssid: 1, .. }))
        .times(1)
        .returning(|_| Ok(ExchangeOutcome::Success));

    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::new(Arc::new(link), clock.clone());
    let (events, listener) = recorder();
    engine
        .configure(EngineConfig::new("scenario"), None, Some(listener))
        .await
        .unwrap();
    engine
        .add_object(Switchboard::definition(), Box::new(Switchboard::default()), vec![0])
        .await
        .unwrap();
    engine
        .add_server(ServerSettings::new(1, "coap://server").with_lifetime(50))
        .await
        .unwrap();

    assert_eq!(engine.step().await, 1);
    clock.advance(1);
    assert_eq!(engine.step().await, 0);

    let observed = Uri::resource(SWITCHBOARD, 0, 1);
    assert!(engine.dispatch(Some(1), Request::observe(observed)).await.is_success());

    engine.notification_lock(true).await;
    for _ in 0..3 {
        engine
            .object_resource_changed(SWITCHBOARD, Some(0), Some(1))
            .await
            .unwrap();
    }
    engine
        .object_resource_changed(SWITCHBOARD, Some(0), Some(0))
        .await
        .unwrap();
    engine.notification_lock(false).await;

    clock.advance(1);
    assert_eq!(engine.step().await, 2);
    clock.advance(1);
    assert_eq!(engine.step().await, 0);

    let events = events.lock().unwrap();
    let updating = events
        .iter()
        .filter(|e| **e == Event::Updating { server: 1 })
        .count();
    let registered = events
        .iter()
        .filter(|e| **e == Event::Registered { server: 1 })
        .count();
    assert_eq!((updating, registered), (1, 2));
    let state = engine.lock().await;
    assert_eq!(state.account(1).unwrap().state(), RegistrationState::Ready);
}
