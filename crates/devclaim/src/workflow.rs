use alloc::format;
use alloc::string::String;

use core::fmt;

use log::{debug, error, info, warn};

use serde::Serialize;

use crate::cloud::{
    Clock, Cloud, DeviceIdentity, InboundEvent, SESSION_END_EVENT, SubscriptionScope, Visibility,
};
use crate::config::{
    ByteStore, ConfigStorage, ConfigStore, DEFAULT_OFFSET, FLAG_CLAIMED, OffsetStorage,
};
use crate::error::{Error, ErrorKind, Result};

/// Default name of the event that triggers the claim.
pub const DEFAULT_CLAIM_EVENT: &str = "deviceClaim";

/// Default name of the event used to verify the claim.
pub const DEFAULT_TEST_EVENT: &str = "deviceTest";

/// Maximum length of the verification event name.
pub const MAX_TEST_EVENT_LEN: usize = 24;

// Suffix of the response sent to the first, and only, webhook listener.
const RESPONSE_SUFFIX: &str = "/0";

/// The claim workflow options.
///
/// Options are set once, before the workflow is created:
///
/// ```
/// use devclaim::workflow::ClaimOptions;
///
/// let options = ClaimOptions::new()
///     .offset(1990)
///     .claim_event("deviceClaim")
///     .connect_wait_ms(0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize), serde(default))]
pub struct ClaimOptions {
    /// Offset of the configuration record inside a byte store.
    pub offset: usize,
    /// Name of the event that triggers the claim webhook.
    pub claim_event: String,
    /// Name of the event that verifies the claim.
    pub test_event: String,
    /// Time to wait after connecting before publishing the claim event.
    pub connect_wait_ms: u64,
    /// Time to wait after the claim event before ending the cloud session.
    pub claim_request_wait_ms: u64,
    /// Time to wait for the verification response before failing.
    pub test_wait_ms: u64,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            offset: DEFAULT_OFFSET,
            claim_event: DEFAULT_CLAIM_EVENT.into(),
            test_event: DEFAULT_TEST_EVENT.into(),
            connect_wait_ms: 2000,
            claim_request_wait_ms: 3000,
            test_wait_ms: 10000,
        }
    }
}

impl ClaimOptions {
    /// Creates [`ClaimOptions`] with default values.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the offset of the configuration record.
    ///
    /// The byte store must have 8 bytes available at this offset.
    #[must_use]
    #[inline]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the name of the claim event.
    ///
    /// It must match the webhook configured on the cloud.
    #[must_use]
    #[inline]
    pub fn claim_event(mut self, name: impl Into<String>) -> Self {
        self.claim_event = name.into();
        self
    }

    /// Sets the name of the verification event.
    ///
    /// It must match the webhook configured on the cloud and must not be
    /// longer than [`MAX_TEST_EVENT_LEN`] characters.
    #[must_use]
    #[inline]
    pub fn test_event(mut self, name: impl Into<String>) -> Self {
        self.test_event = name.into();
        self
    }

    /// Sets the time to wait after connecting before publishing the claim
    /// event.
    #[must_use]
    #[inline]
    pub fn connect_wait_ms(mut self, ms: u64) -> Self {
        self.connect_wait_ms = ms;
        self
    }

    /// Sets the time to wait after the claim event before ending the cloud
    /// session.
    #[must_use]
    #[inline]
    pub fn claim_request_wait_ms(mut self, ms: u64) -> Self {
        self.claim_request_wait_ms = ms;
        self
    }

    /// Sets the time to wait for the verification response.
    ///
    /// Under normal conditions the response arrives quickly and this timeout
    /// is never reached.
    #[must_use]
    #[inline]
    pub fn test_wait_ms(mut self, ms: u64) -> Self {
        self.test_wait_ms = ms;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.claim_event.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidOptions,
                "The claim event name is empty.",
            ));
        }

        if self.test_event.is_empty() || self.test_event.chars().count() > MAX_TEST_EVENT_LEN {
            return Err(Error::new(
                ErrorKind::InvalidOptions,
                format!(
                    "The verification event name `{}` must contain from 1 to {MAX_TEST_EVENT_LEN} characters.",
                    self.test_event
                ),
            ));
        }

        Ok(())
    }
}

/// States of the claim workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    /// Waiting for the cloud connection.
    Start,
    /// Connected, waiting before publishing the claim event.
    ConnectWait,
    /// Claim event published, waiting before ending the session.
    RequestWait,
    /// Session end requested, waiting for the disconnection.
    DisconnectWait,
    /// Disconnected, waiting for the connection to come back.
    ReconnectWait,
    /// Subscribes to the response channel and publishes the verification
    /// event.
    CheckClaim,
    /// Waiting for the verification response.
    CheckWait,
    /// The claim could not be verified.
    Failure,
    /// The device is claimed.
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::ConnectWait => "CONNECT_WAIT",
            Self::RequestWait => "REQUEST_WAIT",
            Self::DisconnectWait => "DISCONNECT_WAIT",
            Self::ReconnectWait => "RECONNECT_WAIT",
            Self::CheckClaim => "CHECK_CLAIM",
            Self::CheckWait => "CHECK_WAIT",
            Self::Failure => "FAILURE",
            Self::Done => "DONE",
        };
        name.fmt(f)
    }
}

/// Overall progress of the claim workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Progress {
    /// The claim is in progress.
    InProgress,
    /// The claim event was sent but the verification did not succeed.
    Failure,
    /// The device was claimed, now or in a previous session.
    Done,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => "in progress".fmt(f),
            Self::Failure => "failure".fmt(f),
            Self::Done => "done".fmt(f),
        }
    }
}

#[inline]
fn is_success_response(name: &str) -> bool {
    name.ends_with(RESPONSE_SUFFIX)
}

#[inline]
fn log_publish(name: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!("Published `{name}`"),
        Err(e) => warn!("Impossible to publish `{name}`: {e}"),
    }
}

/// The claim workflow.
///
/// A finite state machine advanced by calling [`Self::tick`] repeatedly,
/// typically once per iteration of the main loop. A tick never blocks and
/// performs at most one state transition.
pub struct ClaimWorkflow<S, C, K>
where
    S: ConfigStorage,
    C: Cloud,
    K: Clock,
{
    options: ClaimOptions,
    config: ConfigStore<S>,
    cloud: C,
    clock: K,
    device_id: String,
    state: State,
    state_time: u64,
    subscribed: bool,
}

impl<S, C, K> ClaimWorkflow<S, C, K>
where
    S: ConfigStorage,
    C: Cloud,
    K: Clock,
{
    /// Creates a [`ClaimWorkflow`].
    ///
    /// The configuration record is loaded from the storage and reinitialized
    /// if it is missing or corrupt. When the device has already been claimed,
    /// the workflow starts in the [`State::Done`] state and never touches the
    /// network.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::InvalidOptions`] error if an event name is empty or
    /// the verification event name is too long.
    pub fn new<I>(
        options: ClaimOptions,
        storage: S,
        cloud: C,
        clock: K,
        identity: &I,
    ) -> Result<Self>
    where
        I: DeviceIdentity + ?Sized,
    {
        options.validate()?;

        let config = ConfigStore::init(storage);

        let state = if config.is_claimed() {
            info!("Device already claimed");
            State::Done
        } else {
            State::Start
        };
        let state_time = clock.now_ms();

        Ok(Self {
            options,
            config,
            cloud,
            clock,
            device_id: identity.device_id(),
            state,
            state_time,
            subscribed: false,
        })
    }

    /// Advances the workflow.
    ///
    /// Queued verification responses are handled first. Otherwise, the
    /// current state checks its exit condition.
    pub fn tick(&mut self) {
        while let Some(event) = self.cloud.poll_inbound() {
            if self.handle_event(&event) {
                return;
            }
        }

        let now = self.clock.now_ms();
        let elapsed = now.wrapping_sub(self.state_time);

        match self.state {
            State::Start => {
                if self.cloud.is_connected() {
                    self.transition(State::ConnectWait, now);
                }
            }
            State::ConnectWait => {
                if elapsed >= self.options.connect_wait_ms {
                    let result =
                        self.cloud
                            .publish(&self.options.claim_event, "", Visibility::Private);
                    log_publish(&self.options.claim_event, result);
                    self.transition(State::RequestWait, now);
                }
            }
            State::RequestWait => {
                if elapsed >= self.options.claim_request_wait_ms {
                    // Private events reach a newly claimed device only after
                    // its session has been restarted.
                    let result = self
                        .cloud
                        .publish(SESSION_END_EVENT, "", Visibility::Private);
                    log_publish(SESSION_END_EVENT, result);
                    self.transition(State::DisconnectWait, now);
                }
            }
            State::DisconnectWait => {
                if !self.cloud.is_connected() {
                    self.transition(State::ReconnectWait, now);
                }
            }
            State::ReconnectWait => {
                if self.cloud.is_connected() {
                    self.transition(State::CheckClaim, now);
                }
            }
            State::CheckClaim => {
                self.subscribe_response();
                let result = self
                    .cloud
                    .publish(&self.options.test_event, "", Visibility::Private);
                log_publish(&self.options.test_event, result);
                self.transition(State::CheckWait, now);
            }
            State::CheckWait => {
                if elapsed >= self.options.test_wait_ms {
                    info!("Claiming failed");
                    self.transition(State::Failure, now);
                }
            }
            State::Failure | State::Done => {}
        }
    }

    /// Handles an event received on the verification response channel.
    ///
    /// Only an event whose name ends with `/0` is a successful response: the
    /// claimed flag is set and persisted, and the workflow moves to
    /// [`State::Done`]. Any other event is ignored.
    ///
    /// Returns whether the event completed the claim.
    pub fn handle_event(&mut self, event: &InboundEvent) -> bool {
        if !is_success_response(&event.name) {
            debug!("Ignoring event `{}`", event.name);
            return false;
        }

        if self.state == State::Done {
            debug!("Ignoring response `{}`, already claimed", event.name);
            return false;
        }

        self.config.set_flag(FLAG_CLAIMED, true);
        if let Err(e) = self.config.save() {
            error!("Impossible to persist the claimed flag: {e}");
        }

        info!("Successfully claimed");
        let now = self.clock.now_ms();
        self.transition(State::Done, now);

        true
    }

    /// Forces the device to be claimed again.
    ///
    /// The claimed flag is cleared and persisted. If the workflow is in the
    /// [`State::Failure`] or [`State::Done`] state, it restarts from
    /// [`State::Start`]. A handshake in flight is **not** interrupted.
    ///
    /// Claiming an already claimed device succeeds, but it costs a few
    /// kilobytes of data.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::StorageWrite`] error if the cleared flag cannot be
    /// persisted. In this case the claimed flag and the workflow state are
    /// left unchanged.
    pub fn force_claim(&mut self) -> Result<()> {
        let claimed = self.config.is_claimed();
        self.config.set_flag(FLAG_CLAIMED, false);
        if let Err(e) = self.config.save() {
            self.config.set_flag(FLAG_CLAIMED, claimed);
            return Err(e);
        }

        if matches!(self.state, State::Failure | State::Done) {
            let now = self.clock.now_ms();
            self.transition(State::Start, now);
        }

        Ok(())
    }

    /// Returns the [`Progress`] of the workflow.
    #[must_use]
    pub const fn progress(&self) -> Progress {
        match self.state {
            State::Done => Progress::Done,
            State::Failure => Progress::Failure,
            _ => Progress::InProgress,
        }
    }

    /// Returns the current [`State`].
    #[must_use]
    #[inline]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns whether the claimed flag is set.
    #[must_use]
    #[inline]
    pub const fn is_claimed(&self) -> bool {
        self.config.is_claimed()
    }

    /// Returns the [`ClaimOptions`].
    #[must_use]
    #[inline]
    pub const fn options(&self) -> &ClaimOptions {
        &self.options
    }

    /// Returns the device identifier.
    #[must_use]
    #[inline]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the channel where the verification response is expected.
    #[must_use]
    pub fn response_channel(&self) -> String {
        format!(
            "{}/hook-response/{}",
            self.device_id, self.options.test_event
        )
    }

    /// Returns the [`ConfigStore`].
    #[must_use]
    #[inline]
    pub const fn config(&self) -> &ConfigStore<S> {
        &self.config
    }

    /// Returns a reference to the [`Cloud`] connection.
    #[must_use]
    #[inline]
    pub const fn cloud(&self) -> &C {
        &self.cloud
    }

    /// Returns a mutable reference to the [`Cloud`] connection.
    #[must_use]
    #[inline]
    pub fn cloud_mut(&mut self) -> &mut C {
        &mut self.cloud
    }

    /// Consumes the [`ClaimWorkflow`] and returns its [`ConfigStore`], its
    /// [`Cloud`] connection and its [`Clock`].
    #[must_use]
    pub fn into_parts(self) -> (ConfigStore<S>, C, K) {
        (self.config, self.cloud, self.clock)
    }

    fn subscribe_response(&mut self) {
        if self.subscribed {
            return;
        }

        let channel = self.response_channel();
        match self.cloud.subscribe(&channel, SubscriptionScope::MyDevices) {
            Ok(()) => {
                debug!("Subscribed to `{channel}`");
                self.subscribed = true;
            }
            Err(e) => warn!("Impossible to subscribe to `{channel}`: {e}"),
        }
    }

    #[inline]
    fn transition(&mut self, next: State, now: u64) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
        self.state_time = now;
    }
}

impl<B, C, K> ClaimWorkflow<OffsetStorage<B>, C, K>
where
    B: ByteStore,
    C: Cloud,
    K: Clock,
{
    /// Creates a [`ClaimWorkflow`] keeping its record in a [`ByteStore`] at
    /// [`ClaimOptions::offset`].
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_byte_store<I>(
        options: ClaimOptions,
        store: B,
        cloud: C,
        clock: K,
        identity: &I,
    ) -> Result<Self>
    where
        I: DeviceIdentity + ?Sized,
    {
        let storage = OffsetStorage::new(store, options.offset);
        Self::new(options, storage, cloud, clock, identity)
    }
}

#[cfg(test)]
mod tests {
    use alloc::collections::VecDeque;
    use alloc::rc::Rc;
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;

    use core::cell::Cell;

    use crate::cloud::{
        Clock, Cloud, InboundEvent, SESSION_END_EVENT, SubscriptionScope, Visibility,
    };
    use crate::config::{
        ConfigRecord, ConfigStorage, FLAG_CLAIMED, MemoryStore, OffsetStorage, RECORD_SIZE,
    };
    use crate::error::{Error, ErrorKind, Result};

    use super::{ClaimOptions, ClaimWorkflow, Progress, State};

    const DEVICE_ID: &str = "e00fce68f0e6d3b1c2a4a7f1";
    const CAPACITY: usize = 2047;

    #[derive(Default)]
    struct FakeCloud {
        connected: bool,
        fail_publish: bool,
        published: Vec<(String, String, Visibility)>,
        subscriptions: Vec<(String, SubscriptionScope)>,
        inbound: VecDeque<InboundEvent>,
    }

    impl FakeCloud {
        fn published_names(&self) -> Vec<&str> {
            self.published
                .iter()
                .map(|(name, _, _)| name.as_str())
                .collect()
        }
    }

    impl Cloud for FakeCloud {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn publish(&mut self, name: &str, data: &str, visibility: Visibility) -> Result<()> {
            if self.fail_publish {
                return Err(Error::new(ErrorKind::Cloud, "queue full"));
            }
            self.published
                .push((name.to_string(), data.to_string(), visibility));
            Ok(())
        }

        fn subscribe(&mut self, prefix: &str, scope: SubscriptionScope) -> Result<()> {
            self.subscriptions.push((prefix.to_string(), scope));
            Ok(())
        }

        fn poll_inbound(&mut self) -> Option<InboundEvent> {
            self.inbound.pop_front()
        }
    }

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<u64>>);

    impl ManualClock {
        fn advance(&self, ms: u64) {
            self.0.set(self.0.get() + ms);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    type Workflow = ClaimWorkflow<OffsetStorage<MemoryStore>, FakeCloud, ManualClock>;

    fn workflow_with_store(options: ClaimOptions, store: MemoryStore) -> (Workflow, ManualClock) {
        let clock = ManualClock::default();
        let workflow = ClaimWorkflow::with_byte_store(
            options,
            store,
            FakeCloud::default(),
            clock.clone(),
            DEVICE_ID,
        )
        .unwrap();
        (workflow, clock)
    }

    fn workflow(options: ClaimOptions) -> (Workflow, ManualClock) {
        workflow_with_store(options, MemoryStore::new(CAPACITY))
    }

    fn persisted_record(workflow: &Workflow) -> ConfigRecord {
        let offset = workflow.options().offset;
        let bytes = &workflow.config().storage().store().as_bytes()[offset..offset + RECORD_SIZE];
        ConfigRecord::from_bytes(bytes.try_into().unwrap())
    }

    fn success_response() -> InboundEvent {
        InboundEvent::new(
            "e00fce68f0e6d3b1c2a4a7f1/hook-response/deviceTest/0",
            "{\"ok\":true}",
        )
    }

    // Drives the workflow from `START` to `CHECK_WAIT`.
    fn run_to_check_wait(workflow: &mut Workflow, clock: &ManualClock) {
        workflow.cloud_mut().connected = true;
        workflow.tick();
        assert_eq!(workflow.state(), State::ConnectWait);

        clock.advance(workflow.options().connect_wait_ms);
        workflow.tick();
        assert_eq!(workflow.state(), State::RequestWait);

        clock.advance(workflow.options().claim_request_wait_ms);
        workflow.tick();
        assert_eq!(workflow.state(), State::DisconnectWait);

        workflow.cloud_mut().connected = false;
        workflow.tick();
        assert_eq!(workflow.state(), State::ReconnectWait);

        workflow.cloud_mut().connected = true;
        workflow.tick();
        assert_eq!(workflow.state(), State::CheckClaim);

        workflow.tick();
        assert_eq!(workflow.state(), State::CheckWait);
    }

    #[test]
    fn already_claimed_device_skips_handshake() {
        let mut record = ConfigRecord::initialized();
        record.set_flag(FLAG_CLAIMED, true);
        let mut store = MemoryStore::new(CAPACITY);
        store.write_record(1998, &record);

        let (mut workflow, clock) = workflow_with_store(ClaimOptions::new(), store);
        assert_eq!(workflow.state(), State::Done);
        assert_eq!(workflow.progress(), Progress::Done);

        workflow.cloud_mut().connected = true;
        clock.advance(60_000);
        workflow.tick();

        assert_eq!(workflow.state(), State::Done);
        assert!(workflow.cloud().published.is_empty());
        assert!(workflow.cloud().subscriptions.is_empty());
    }

    #[test]
    fn erased_store_is_initialized() {
        let (workflow, _clock) = workflow(ClaimOptions::new());

        assert_eq!(workflow.state(), State::Start);
        assert!(!workflow.is_claimed());
        assert_eq!(persisted_record(&workflow), ConfigRecord::initialized());
    }

    #[test]
    fn nothing_happens_while_disconnected() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());

        for _ in 0..10 {
            clock.advance(5000);
            workflow.tick();
        }

        assert_eq!(workflow.state(), State::Start);
        assert_eq!(workflow.progress(), Progress::InProgress);
        assert!(workflow.cloud().published.is_empty());
    }

    #[test]
    fn claim_event_waits_for_connect_delay() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());

        workflow.cloud_mut().connected = true;
        workflow.tick();
        assert_eq!(workflow.state(), State::ConnectWait);

        clock.advance(1999);
        workflow.tick();
        assert_eq!(workflow.state(), State::ConnectWait);
        assert!(workflow.cloud().published.is_empty());

        clock.advance(1);
        workflow.tick();
        assert_eq!(workflow.state(), State::RequestWait);
        assert_eq!(
            workflow.cloud().published,
            [(String::from("deviceClaim"), String::new(), Visibility::Private)]
        );
    }

    #[test]
    fn claim_event_without_connect_delay() {
        let options = ClaimOptions::new()
            .offset(1990)
            .claim_event("deviceClaim")
            .connect_wait_ms(0);
        let (mut workflow, _clock) = workflow(options);

        workflow.cloud_mut().connected = true;
        workflow.tick();
        workflow.tick();

        assert_eq!(workflow.progress(), Progress::InProgress);
        assert_eq!(
            workflow.cloud().published,
            [(String::from("deviceClaim"), String::new(), Visibility::Private)]
        );
        assert_eq!(persisted_record(&workflow), ConfigRecord::initialized());
    }

    #[test]
    fn successful_claim() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());

        run_to_check_wait(&mut workflow, &clock);

        assert_eq!(
            workflow.cloud().published_names(),
            ["deviceClaim", SESSION_END_EVENT, "deviceTest"]
        );
        assert!(
            workflow
                .cloud()
                .published
                .iter()
                .all(|(_, data, visibility)| data.is_empty() && *visibility == Visibility::Private)
        );
        assert_eq!(
            workflow.cloud().subscriptions,
            [(
                String::from("e00fce68f0e6d3b1c2a4a7f1/hook-response/deviceTest"),
                SubscriptionScope::MyDevices
            )]
        );

        clock.advance(100);
        workflow.cloud_mut().inbound.push_back(success_response());
        workflow.tick();

        assert_eq!(workflow.state(), State::Done);
        assert_eq!(workflow.progress(), Progress::Done);
        assert!(workflow.is_claimed());
        assert!(persisted_record(&workflow).flag(FLAG_CLAIMED));
    }

    #[test]
    fn response_wins_over_elapsed_timeout() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());
        run_to_check_wait(&mut workflow, &clock);

        clock.advance(workflow.options().test_wait_ms);
        workflow.cloud_mut().inbound.push_back(success_response());
        workflow.tick();

        assert_eq!(workflow.state(), State::Done);
        assert!(persisted_record(&workflow).flag(FLAG_CLAIMED));
    }

    #[test]
    fn verification_timeout_fails() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());
        run_to_check_wait(&mut workflow, &clock);

        clock.advance(9999);
        workflow.tick();
        assert_eq!(workflow.state(), State::CheckWait);

        clock.advance(1);
        workflow.tick();
        assert_eq!(workflow.state(), State::Failure);
        assert_eq!(workflow.progress(), Progress::Failure);
        assert!(!persisted_record(&workflow).flag(FLAG_CLAIMED));
    }

    #[test]
    fn unmatched_events_are_ignored() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());
        run_to_check_wait(&mut workflow, &clock);

        workflow.cloud_mut().inbound.extend([
            InboundEvent::new("e00fce68f0e6d3b1c2a4a7f1/hook-response/deviceTest/1", ""),
            InboundEvent::new("e00fce68f0e6d3b1c2a4a7f1/hook-error/deviceTest/0x", ""),
            InboundEvent::new("0", ""),
        ]);
        workflow.tick();

        assert_eq!(workflow.state(), State::CheckWait);
        assert!(!workflow.is_claimed());
        assert!(workflow.cloud().inbound.is_empty());
    }

    #[test]
    fn late_response_after_failure_claims() {
        let (mut workflow, clock) = workflow(ClaimOptions::new().test_wait_ms(100));
        run_to_check_wait(&mut workflow, &clock);

        clock.advance(100);
        workflow.tick();
        assert_eq!(workflow.state(), State::Failure);

        assert!(workflow.handle_event(&success_response()));
        assert_eq!(workflow.progress(), Progress::Done);
        assert!(persisted_record(&workflow).flag(FLAG_CLAIMED));
    }

    #[test]
    fn force_claim_restarts_terminal_workflow() {
        let mut record = ConfigRecord::initialized();
        record.set_flag(FLAG_CLAIMED, true);
        let mut store = MemoryStore::new(CAPACITY);
        store.write_record(1998, &record);

        let (mut workflow, _clock) = workflow_with_store(ClaimOptions::new(), store);
        assert_eq!(workflow.state(), State::Done);

        workflow.force_claim().unwrap();

        assert_eq!(workflow.state(), State::Start);
        assert!(!workflow.is_claimed());
        assert!(!persisted_record(&workflow).flag(FLAG_CLAIMED));
    }

    #[test]
    fn force_claim_retries_after_failure() {
        let (mut workflow, clock) = workflow(ClaimOptions::new());
        run_to_check_wait(&mut workflow, &clock);

        clock.advance(workflow.options().test_wait_ms);
        workflow.tick();
        assert_eq!(workflow.state(), State::Failure);

        workflow.force_claim().unwrap();
        assert_eq!(workflow.state(), State::Start);

        // The connect delay is measured from the restart.
        workflow.tick();
        assert_eq!(workflow.state(), State::ConnectWait);
        clock.advance(1000);
        workflow.tick();
        assert_eq!(workflow.state(), State::ConnectWait);

        clock.advance(1000);
        workflow.tick();
        assert_eq!(workflow.state(), State::RequestWait);
        assert_eq!(
            workflow.cloud().published_names(),
            ["deviceClaim", SESSION_END_EVENT, "deviceTest", "deviceClaim"]
        );
    }

    struct CountingStorage {
        inner: OffsetStorage<MemoryStore>,
        saves: Rc<Cell<usize>>,
    }

    impl ConfigStorage for CountingStorage {
        fn load(&mut self) -> Result<ConfigRecord> {
            self.inner.load()
        }

        fn save(&mut self, record: &ConfigRecord) -> Result<()> {
            self.saves.set(self.saves.get() + 1);
            self.inner.save(record)
        }
    }

    #[test]
    fn force_claim_does_not_interrupt_handshake() {
        let mut record = ConfigRecord::initialized();
        record.reserved = 0x00aa;
        let mut store = MemoryStore::new(CAPACITY);
        store.write_record(1998, &record);

        let saves = Rc::new(Cell::new(0));
        let storage = CountingStorage {
            inner: OffsetStorage::new(store, 1998),
            saves: Rc::clone(&saves),
        };
        let clock = ManualClock::default();
        let mut workflow = ClaimWorkflow::new(
            ClaimOptions::new(),
            storage,
            FakeCloud::default(),
            clock.clone(),
            DEVICE_ID,
        )
        .unwrap();
        // A valid record is not written back at startup.
        assert_eq!(saves.get(), 0);

        workflow.cloud_mut().connected = true;
        workflow.tick();
        clock.advance(500);
        workflow.force_claim().unwrap();

        assert_eq!(workflow.state(), State::ConnectWait);
        assert_eq!(saves.get(), 1);

        let bytes = &workflow.config().storage().inner.store().as_bytes()[1998..1998 + RECORD_SIZE];
        let persisted = ConfigRecord::from_bytes(bytes.try_into().unwrap());
        assert!(!persisted.flag(FLAG_CLAIMED));
        assert_eq!(persisted.reserved, 0x00aa);

        // The connect delay still runs from the original transition.
        clock.advance(1500);
        workflow.tick();
        assert_eq!(workflow.state(), State::RequestWait);
    }

    struct ReadOnlyStorage {
        inner: OffsetStorage<MemoryStore>,
    }

    impl ConfigStorage for ReadOnlyStorage {
        fn load(&mut self) -> Result<ConfigRecord> {
            self.inner.load()
        }

        fn save(&mut self, _record: &ConfigRecord) -> Result<()> {
            Err(Error::storage_write("write protected"))
        }
    }

    #[test]
    fn failed_force_claim_keeps_claimed_device_done() {
        let mut record = ConfigRecord::initialized();
        record.set_flag(FLAG_CLAIMED, true);
        let mut store = MemoryStore::new(CAPACITY);
        store.write_record(1998, &record);

        let mut workflow = ClaimWorkflow::new(
            ClaimOptions::new(),
            ReadOnlyStorage {
                inner: OffsetStorage::new(store, 1998),
            },
            FakeCloud::default(),
            ManualClock::default(),
            DEVICE_ID,
        )
        .unwrap();
        assert_eq!(workflow.state(), State::Done);

        assert_eq!(
            workflow.force_claim().unwrap_err().kind(),
            ErrorKind::StorageWrite
        );

        assert_eq!(workflow.state(), State::Done);
        assert_eq!(workflow.progress(), Progress::Done);
        assert!(workflow.is_claimed());
        assert!(workflow.config().record().flag(FLAG_CLAIMED));
    }

    #[test]
    fn parts_outlive_workflow() {
        let (mut workflow, clock) = workflow(ClaimOptions::new().connect_wait_ms(0));
        workflow.cloud_mut().connected = true;
        workflow.tick();
        workflow.tick();
        clock.advance(42);

        let (config, cloud, clock) = workflow.into_parts();

        assert!(!config.is_claimed());
        assert_eq!(cloud.published_names(), ["deviceClaim"]);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn retried_handshake_subscribes_once() {
        let (mut workflow, clock) = workflow(ClaimOptions::new().test_wait_ms(10));
        run_to_check_wait(&mut workflow, &clock);

        clock.advance(10);
        workflow.tick();
        workflow.force_claim().unwrap();
        run_to_check_wait(&mut workflow, &clock);

        assert_eq!(workflow.cloud().subscriptions.len(), 1);
        assert_eq!(
            workflow
                .cloud()
                .published_names()
                .iter()
                .filter(|name| **name == "deviceTest")
                .count(),
            2
        );
    }

    #[test]
    fn publish_failures_do_not_stall() {
        let (mut workflow, clock) = workflow(ClaimOptions::new().connect_wait_ms(0));
        workflow.cloud_mut().fail_publish = true;
        workflow.cloud_mut().connected = true;

        workflow.tick();
        workflow.tick();
        assert_eq!(workflow.state(), State::RequestWait);

        clock.advance(3000);
        workflow.tick();
        assert_eq!(workflow.state(), State::DisconnectWait);
        assert!(workflow.cloud().published.is_empty());
    }

    #[test]
    fn invalid_options() {
        let clock = ManualClock::default();
        let options = ClaimOptions::new().test_event("aVeryLongVerificationEvent");

        let error = ClaimWorkflow::with_byte_store(
            options,
            MemoryStore::new(CAPACITY),
            FakeCloud::default(),
            clock.clone(),
            DEVICE_ID,
        )
        .err()
        .unwrap();
        assert_eq!(error.kind(), ErrorKind::InvalidOptions);

        let error = ClaimWorkflow::with_byte_store(
            ClaimOptions::new().claim_event(""),
            MemoryStore::new(CAPACITY),
            FakeCloud::default(),
            clock,
            DEVICE_ID,
        )
        .err()
        .unwrap();
        assert_eq!(error.kind(), ErrorKind::InvalidOptions);
    }

    #[test]
    #[cfg(feature = "deserialize")]
    fn options_from_partial_json() {
        let options: ClaimOptions = serde_json::from_value(serde_json::json!({
            "offset": 1990,
            "test_wait_ms": 5000
        }))
        .unwrap();

        assert_eq!(
            options,
            ClaimOptions::new().offset(1990).test_wait_ms(5000)
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(State::DisconnectWait.to_string(), "DISCONNECT_WAIT");
        assert_eq!(Progress::InProgress.to_string(), "in progress");
    }

    trait WriteRecord {
        fn write_record(&mut self, offset: usize, record: &ConfigRecord);
    }

    impl WriteRecord for MemoryStore {
        fn write_record(&mut self, offset: usize, record: &ConfigRecord) {
            crate::config::ByteStore::write(self, offset, &record.to_bytes()).unwrap();
        }
    }
}
