//! Registration state machine of one server account
//!
//! The machine never performs I/O. `poll` is called from the periodic tick
//! and returns the exchange to start, if any; the caller runs the exchange
//! outside the engine lock and reports the result through `complete`.
//! Every scheduled action carries an absolute deadline in the tick's clock
//! domain and fires on the first poll at or past it.

use lwm2m_core::{Event, ShortServerId, Timestamp};

use crate::account::ServerSettings;
use crate::policy::{RetryCounters, RetryDecision};
use crate::state::RegistrationState;

/// Exchange requested by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Bootstrap,
    Register,
    Update,
    Deregister,
}

/// Result of an exchange, as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success,
    Failure,
}

/// Engine-wide timing knobs shared by all machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Upper bound on any backoff delay, in seconds
    pub backoff_ceiling: u64,
    /// How long before lifetime expiry the update is sent, in seconds
    pub update_margin: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            backoff_ceiling: 86400,
            update_margin: 10,
        }
    }
}

impl Tuning {
    /// Seconds after a successful registration at which the next update is due
    pub fn update_interval(&self, lifetime: u64) -> u64 {
        if lifetime > self.update_margin.saturating_mul(2) {
            lifetime - self.update_margin
        } else {
            (lifetime / 2).max(1)
        }
    }
}

/// Registration state machine of one server account
#[derive(Debug, Clone)]
pub struct RegistrationMachine {
    server: ShortServerId,
    state: RegistrationState,
    counters: RetryCounters,
    /// Deadline of the next bootstrap/register attempt
    deadline: Option<Timestamp>,
    /// Deadline of the next update while registered
    update_due: Option<Timestamp>,
    /// Lifetime expiry of the current registration
    expires_at: Option<Timestamp>,
    /// An update was requested while another exchange was in flight
    update_again: bool,
    /// Start in the bootstrap phase instead of registering directly
    bootstrap_first: bool,
    /// Initial registration has succeeded or definitively failed
    settled: bool,
}

impl RegistrationMachine {
    pub fn new(server: ShortServerId) -> Self {
        Self {
            server,
            state: RegistrationState::Initial,
            counters: RetryCounters::new(),
            deadline: None,
            update_due: None,
            expires_at: None,
            update_again: false,
            bootstrap_first: false,
            settled: false,
        }
    }

    /// Start with a bootstrap exchange instead of registering directly
    pub fn with_bootstrap(mut self) -> Self {
        self.bootstrap_first = true;
        self
    }

    pub fn server(&self) -> ShortServerId {
        self.server
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn counters(&self) -> RetryCounters {
        self.counters
    }

    /// Lifetime expiry of the current registration, if registered
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    /// Whether the first registration is still undecided
    ///
    /// Lower-priority accounts wait while this holds.
    pub fn is_initial_registration_pending(&self) -> bool {
        !self.settled && !self.state.is_failed()
    }

    /// Earliest absolute time at which `poll` has work to do
    pub fn next_deadline(&self) -> Option<Timestamp> {
        match self.state {
            RegistrationState::Initial
            | RegistrationState::Unregistered
            | RegistrationState::BootstrapFinished
            | RegistrationState::Registered => Some(0),
            RegistrationState::BootstrapRequired | RegistrationState::RegisterRequired => {
                self.deadline
            }
            RegistrationState::Ready => match (self.update_due, self.expires_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            RegistrationState::Bootstrapping
            | RegistrationState::Registering
            | RegistrationState::Updating
            | RegistrationState::BootstrapFailed
            | RegistrationState::RegisterFailed => None,
        }
    }

    /// Advance time-driven transitions and return the exchange to start
    pub fn poll(
        &mut self,
        now: Timestamp,
        settings: &ServerSettings,
        events: &mut Vec<Event>,
    ) -> Option<ActionKind> {
        let due = |deadline: Option<Timestamp>| deadline.is_some_and(|d| d <= now);
        loop {
            match self.state {
                RegistrationState::Initial => {
                    if self.bootstrap_first {
                        self.schedule(RegistrationState::BootstrapRequired, now);
                    } else {
                        self.schedule(
                            RegistrationState::RegisterRequired,
                            now.saturating_add(settings.initial_delay),
                        );
                    }
                }
                RegistrationState::Unregistered => {
                    self.schedule(RegistrationState::RegisterRequired, now);
                }
                RegistrationState::BootstrapFinished => {
                    self.counters.reset();
                    self.schedule(RegistrationState::RegisterRequired, now);
                }
                RegistrationState::BootstrapRequired => {
                    if !due(self.deadline) {
                        return None;
                    }
                    self.transition(RegistrationState::Bootstrapping);
                    events.push(Event::BootstrapStarted { server: self.server });
                    return Some(ActionKind::Bootstrap);
                }
                RegistrationState::RegisterRequired => {
                    if !due(self.deadline) {
                        return None;
                    }
                    self.transition(RegistrationState::Registering);
                    events.push(Event::Registering { server: self.server });
                    return Some(ActionKind::Register);
                }
                RegistrationState::Registered => {
                    self.transition(RegistrationState::Ready);
                }
                RegistrationState::Ready => {
                    if due(self.expires_at) {
                        log::warn!("Registration with server {} expired", self.server);
                        self.drop_registration();
                        self.transition(RegistrationState::Unregistered);
                        events.push(Event::Deregistered { server: self.server });
                        continue;
                    }
                    if !due(self.update_due) {
                        return None;
                    }
                    self.transition(RegistrationState::Updating);
                    events.push(Event::Updating { server: self.server });
                    return Some(ActionKind::Update);
                }
                RegistrationState::Bootstrapping
                | RegistrationState::Registering
                | RegistrationState::Updating
                | RegistrationState::BootstrapFailed
                | RegistrationState::RegisterFailed => return None,
            }
        }
    }

    /// Apply the result of an exchange previously returned by `poll`
    ///
    /// Results that do not match the exchange in flight are stale and ignored.
    pub fn complete(
        &mut self,
        kind: ActionKind,
        outcome: ExchangeOutcome,
        now: Timestamp,
        settings: &ServerSettings,
        tuning: &Tuning,
        events: &mut Vec<Event>,
    ) {
        match (self.state, kind, outcome) {
            (RegistrationState::Bootstrapping, ActionKind::Bootstrap, ExchangeOutcome::Success) => {
                self.counters.reset();
                self.transition(RegistrationState::BootstrapFinished);
                events.push(Event::BootstrapFinished { server: self.server });
            }
            (RegistrationState::Bootstrapping, ActionKind::Bootstrap, ExchangeOutcome::Failure) => {
                match self.counters.on_failure(&settings.retry, tuning.backoff_ceiling) {
                    RetryDecision::RetryAfter(delay) | RetryDecision::NextSequenceAfter(delay) => {
                        log::warn!(
                            "Bootstrap for server {} failed, retrying in {}s",
                            self.server, delay
                        );
                        self.schedule(RegistrationState::BootstrapRequired, now.saturating_add(delay));
                    }
                    RetryDecision::Exhausted => {
                        log::error!("Bootstrap for server {} failed, giving up", self.server);
                        self.settled = true;
                        self.transition(RegistrationState::BootstrapFailed);
                        events.push(Event::BootstrapFailed { server: self.server });
                    }
                }
            }
            (RegistrationState::Registering, ActionKind::Register, ExchangeOutcome::Success)
            | (RegistrationState::Updating, ActionKind::Update, ExchangeOutcome::Success) => {
                self.enter_registered(now, settings, tuning);
                events.push(Event::Registered { server: self.server });
            }
            (RegistrationState::Registering, ActionKind::Register, ExchangeOutcome::Failure) => {
                match self.counters.on_failure(&settings.retry, tuning.backoff_ceiling) {
                    RetryDecision::RetryAfter(delay) => {
                        log::warn!(
                            "Registration with server {} failed, retrying in {}s",
                            self.server, delay
                        );
                        self.schedule(RegistrationState::RegisterRequired, now.saturating_add(delay));
                    }
                    RetryDecision::NextSequenceAfter(delay) => {
                        log::warn!(
                            "Registration sequence with server {} failed, next sequence in {}s",
                            self.server, delay
                        );
                        self.schedule(RegistrationState::RegisterRequired, now.saturating_add(delay));
                    }
                    RetryDecision::Exhausted => {
                        log::error!("Registration with server {} failed, retries exhausted", self.server);
                        events.push(Event::RegistrationFailed { server: self.server });
                        if settings.bootstrap_on_failure {
                            self.counters.reset();
                            self.schedule(RegistrationState::BootstrapRequired, now);
                        } else {
                            self.settled = true;
                            self.transition(RegistrationState::RegisterFailed);
                        }
                    }
                }
            }
            (RegistrationState::Updating, ActionKind::Update, ExchangeOutcome::Failure) => {
                match self.counters.on_failure(&settings.retry, tuning.backoff_ceiling) {
                    RetryDecision::RetryAfter(delay) | RetryDecision::NextSequenceAfter(delay) => {
                        log::warn!(
                            "Update with server {} failed, retrying in {}s",
                            self.server, delay
                        );
                        self.update_due = Some(now.saturating_add(delay));
                        self.transition(RegistrationState::Registered);
                    }
                    RetryDecision::Exhausted => {
                        log::error!(
                            "Update with server {} failed, registering again",
                            self.server
                        );
                        events.push(Event::UpdateFailed { server: self.server });
                        self.drop_registration();
                        self.counters.reset();
                        self.schedule(RegistrationState::RegisterRequired, now);
                    }
                }
            }
            (state, kind, _) => {
                log::debug!(
                    "Ignoring stale {:?} result for server {} in state {}",
                    kind, self.server, state
                );
            }
        }
    }

    /// Schedule an update as soon as possible
    ///
    /// Repeated requests before the update is sent collapse into one.
    pub fn request_update(&mut self, now: Timestamp) {
        match self.state {
            RegistrationState::Registered | RegistrationState::Ready => {
                self.update_due = Some(self.update_due.map_or(now, |due| due.min(now)));
            }
            RegistrationState::Updating | RegistrationState::Registering => {
                self.update_again = true;
            }
            _ => {}
        }
    }

    /// Fall back to bootstrapping, e.g. on a Bootstrap-Request Trigger
    pub fn request_bootstrap(&mut self, now: Timestamp, events: &mut Vec<Event>) -> Option<ActionKind> {
        let action = self.leave_registration(events);
        self.counters.reset();
        self.schedule(RegistrationState::BootstrapRequired, now);
        action
    }

    /// Deregister and stay away for `timeout` seconds
    pub fn disable(
        &mut self,
        now: Timestamp,
        timeout: u64,
        events: &mut Vec<Event>,
    ) -> Option<ActionKind> {
        let action = self.leave_registration(events);
        self.counters.reset();
        self.schedule(RegistrationState::RegisterRequired, now.saturating_add(timeout));
        action
    }

    /// Deregister before the account is removed
    pub fn deregister(&mut self, events: &mut Vec<Event>) -> Option<ActionKind> {
        let action = self.leave_registration(events);
        self.transition(RegistrationState::Unregistered);
        action
    }

    /// The connection to the server was lost; the registration is gone
    pub fn connection_lost(&mut self, events: &mut Vec<Event>) {
        if self.state.is_registered() {
            log::warn!("Connection to server {} lost", self.server);
            self.drop_registration();
            self.transition(RegistrationState::Unregistered);
            events.push(Event::Deregistered { server: self.server });
        }
    }

    /// Re-arm an account that gave up
    pub fn restart(&mut self, now: Timestamp) {
        let next = match self.state {
            RegistrationState::BootstrapFailed => RegistrationState::BootstrapRequired,
            RegistrationState::RegisterFailed => RegistrationState::RegisterRequired,
            _ => return,
        };
        self.counters.reset();
        self.settled = false;
        self.schedule(next, now);
    }

    fn leave_registration(&mut self, events: &mut Vec<Event>) -> Option<ActionKind> {
        if !self.state.is_registered() {
            return None;
        }
        self.drop_registration();
        events.push(Event::Deregistered { server: self.server });
        Some(ActionKind::Deregister)
    }

    fn enter_registered(&mut self, now: Timestamp, settings: &ServerSettings, tuning: &Tuning) {
        self.counters.reset();
        self.settled = true;
        self.deadline = None;
        self.expires_at = Some(now.saturating_add(settings.lifetime));
        self.update_due = if std::mem::take(&mut self.update_again) {
            Some(now)
        } else {
            Some(now.saturating_add(tuning.update_interval(settings.lifetime)))
        };
        self.transition(RegistrationState::Registered);
    }

    fn drop_registration(&mut self) {
        self.update_due = None;
        self.expires_at = None;
        self.update_again = false;
    }

    fn schedule(&mut self, state: RegistrationState, deadline: Timestamp) {
        self.deadline = Some(deadline);
        self.transition(state);
    }

    fn transition(&mut self, next: RegistrationState) {
        if self.state != next {
            log::info!("Server {}: {} -> {}", self.server, self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;

    fn settings() -> ServerSettings {
        ServerSettings::new(1, "coap://server").with_lifetime(100)
    }

    fn register(machine: &mut RegistrationMachine, settings: &ServerSettings, now: Timestamp) {
        let tuning = Tuning::default();
        let mut events = Vec::new();
        assert_eq!(machine.poll(now, settings, &mut events), Some(ActionKind::Register));
        machine.complete(ActionKind::Register, ExchangeOutcome::Success, now, settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::Registered);
    }

    #[test]
    fn test_happy_path() {
        let settings = settings();
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        assert_eq!(machine.poll(0, &settings, &mut events), Some(ActionKind::Register));
        assert_eq!(machine.state(), RegistrationState::Registering);
        assert_eq!(machine.poll(1, &settings, &mut events), None);

        machine.complete(ActionKind::Register, ExchangeOutcome::Success, 2, &settings, &tuning, &mut events);
        assert_eq!(
            events,
            vec![Event::Registering { server: 1 }, Event::Registered { server: 1 }]
        );

        assert_eq!(machine.poll(3, &settings, &mut events), None);
        assert_eq!(machine.state(), RegistrationState::Ready);
        assert_eq!(machine.expires_at(), Some(102));
        assert_eq!(machine.next_deadline(), Some(92));

        assert_eq!(machine.poll(92, &settings, &mut events), Some(ActionKind::Update));
        assert_eq!(machine.state(), RegistrationState::Updating);
    }

    #[test]
    fn test_initial_delay() {
        let settings = settings().with_initial_delay(30);
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        assert_eq!(machine.poll(0, &settings, &mut events), None);
        assert_eq!(machine.state(), RegistrationState::RegisterRequired);
        assert_eq!(machine.next_deadline(), Some(30));
        assert_eq!(machine.poll(30, &settings, &mut events), Some(ActionKind::Register));
    }

    #[test]
    fn test_retry_ladder_backs_off_exponentially() {
        let settings = settings().with_retry_policy(RetryPolicy::new(3, 60, 0, 0));
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        let mut now = 0;
        for expected_delay in [60, 120, 240] {
            assert_eq!(machine.poll(now, &settings, &mut events), Some(ActionKind::Register));
            machine.complete(ActionKind::Register, ExchangeOutcome::Failure, now, &settings, &tuning, &mut events);
            assert_eq!(machine.state(), RegistrationState::RegisterRequired);
            assert_eq!(machine.next_deadline(), Some(now + expected_delay));
            assert_eq!(machine.poll(now + expected_delay - 1, &settings, &mut events), None);
            now += expected_delay;
        }

        assert_eq!(machine.poll(now, &settings, &mut events), Some(ActionKind::Register));
        machine.complete(ActionKind::Register, ExchangeOutcome::Failure, now, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::RegisterFailed);
        assert!(!machine.is_initial_registration_pending());
        assert_eq!(events.last(), Some(&Event::RegistrationFailed { server: 1 }));
        assert_eq!(
            events.iter().filter(|e| e.is_failure()).count(),
            1,
            "failures surface once the budget is exhausted"
        );
    }

    #[test]
    fn test_next_sequence_after_attempts_exhausted() {
        let settings = settings().with_retry_policy(RetryPolicy::new(1, 10, 1, 500));
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        machine.poll(0, &settings, &mut events);
        machine.complete(ActionKind::Register, ExchangeOutcome::Failure, 0, &settings, &tuning, &mut events);
        assert_eq!(machine.next_deadline(), Some(10));

        machine.poll(10, &settings, &mut events);
        machine.complete(ActionKind::Register, ExchangeOutcome::Failure, 10, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::RegisterRequired);
        assert_eq!(machine.next_deadline(), Some(510));
        assert_eq!(machine.counters().completed_sequences, 1);
    }

    #[test]
    fn test_bootstrap_on_failure() {
        let settings = settings()
            .with_retry_policy(RetryPolicy::no_retry())
            .with_bootstrap_on_failure(true);
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        machine.poll(0, &settings, &mut events);
        machine.complete(ActionKind::Register, ExchangeOutcome::Failure, 0, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::BootstrapRequired);
        assert!(machine.is_initial_registration_pending());

        assert_eq!(machine.poll(0, &settings, &mut events), Some(ActionKind::Bootstrap));
        machine.complete(ActionKind::Bootstrap, ExchangeOutcome::Success, 1, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::BootstrapFinished);

        assert_eq!(machine.poll(1, &settings, &mut events), Some(ActionKind::Register));
        assert!(events.contains(&Event::BootstrapFinished { server: 1 }));
    }

    #[test]
    fn test_bootstrap_failure_is_terminal() {
        let settings = settings().with_retry_policy(RetryPolicy::no_retry());
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1).with_bootstrap();
        let mut events = Vec::new();

        assert_eq!(machine.poll(0, &settings, &mut events), Some(ActionKind::Bootstrap));
        machine.complete(ActionKind::Bootstrap, ExchangeOutcome::Failure, 0, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::BootstrapFailed);
        assert_eq!(machine.poll(100, &settings, &mut events), None);

        machine.restart(100);
        assert_eq!(machine.poll(100, &settings, &mut events), Some(ActionKind::Bootstrap));
    }

    #[test]
    fn test_update_failure_keeps_registration() {
        let settings = settings().with_retry_policy(RetryPolicy::new(1, 5, 0, 0));
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        machine.request_update(10);
        assert_eq!(machine.poll(10, &settings, &mut events), Some(ActionKind::Update));
        machine.complete(ActionKind::Update, ExchangeOutcome::Failure, 10, &settings, &tuning, &mut events);
        assert!(machine.state().is_registered());
        assert_eq!(machine.expires_at(), Some(100));

        assert_eq!(machine.poll(14, &settings, &mut events), None);
        assert_eq!(machine.poll(15, &settings, &mut events), Some(ActionKind::Update));
        machine.complete(ActionKind::Update, ExchangeOutcome::Failure, 15, &settings, &tuning, &mut events);
        assert_eq!(events.last(), Some(&Event::UpdateFailed { server: 1 }));
        assert_eq!(machine.state(), RegistrationState::RegisterRequired);
        assert_eq!(machine.poll(15, &settings, &mut events), Some(ActionKind::Register));
    }

    #[test]
    fn test_update_requests_coalesce() {
        let settings = settings();
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        machine.request_update(5);
        machine.request_update(6);
        machine.request_update(7);
        assert_eq!(machine.poll(7, &settings, &mut events), Some(ActionKind::Update));
        machine.complete(ActionKind::Update, ExchangeOutcome::Success, 7, &settings, &tuning, &mut events);
        assert_eq!(machine.poll(8, &settings, &mut events), None);
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::Updating { .. })).count(),
            1
        );
    }

    #[test]
    fn test_update_requested_in_flight_runs_after() {
        let settings = settings();
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        machine.request_update(1);
        assert_eq!(machine.poll(1, &settings, &mut events), Some(ActionKind::Update));
        machine.request_update(2);
        machine.complete(ActionKind::Update, ExchangeOutcome::Success, 3, &settings, &tuning, &mut events);
        assert_eq!(machine.poll(3, &settings, &mut events), Some(ActionKind::Update));
    }

    #[test]
    fn test_lifetime_expiry() {
        let settings = settings();
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        assert_eq!(machine.poll(90, &settings, &mut events), Some(ActionKind::Update));
        machine.complete(
            ActionKind::Update,
            ExchangeOutcome::Failure,
            90,
            &settings.clone().with_retry_policy(RetryPolicy::new(1, 50, 0, 0)),
            &tuning,
            &mut events,
        );
        assert_eq!(machine.poll(100, &settings, &mut events), Some(ActionKind::Register));
        assert!(events.contains(&Event::Deregistered { server: 1 }));
    }

    #[test]
    fn test_disable_and_deregister() {
        let settings = settings();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        assert_eq!(machine.disable(10, 60, &mut events), Some(ActionKind::Deregister));
        assert_eq!(machine.state(), RegistrationState::RegisterRequired);
        assert_eq!(machine.poll(69, &settings, &mut events), None);
        assert_eq!(machine.poll(70, &settings, &mut events), Some(ActionKind::Register));
        assert_eq!(machine.deregister(&mut events), None);
    }

    #[test]
    fn test_connection_lost() {
        let settings = settings();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();
        register(&mut machine, &settings, 0);

        machine.connection_lost(&mut events);
        assert_eq!(machine.state(), RegistrationState::Unregistered);
        assert_eq!(machine.poll(1, &settings, &mut events), Some(ActionKind::Register));
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let settings = settings();
        let tuning = Tuning::default();
        let mut machine = RegistrationMachine::new(1);
        let mut events = Vec::new();

        machine.complete(ActionKind::Update, ExchangeOutcome::Success, 0, &settings, &tuning, &mut events);
        assert_eq!(machine.state(), RegistrationState::Initial);
        assert!(events.is_empty());
    }

    #[test]
    fn test_update_interval() {
        let tuning = Tuning::default();
        assert_eq!(tuning.update_interval(100), 90);
        assert_eq!(tuning.update_interval(10), 5);
        assert_eq!(tuning.update_interval(1), 1);
    }
}
