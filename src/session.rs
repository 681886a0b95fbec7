//! One fetch worth of radio lifecycle.
//!
//! A [`ConnectionSession`] finds the peripheral, connects, resolves the
//! family's characteristics, subscribes to notifications and hands the link to
//! the sequencer. Whatever happens after the link is up, the session
//! disconnects before returning. Each phase runs under its own timer; the
//! timer is dropped with the phase, so nothing outlives the session.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::adapter::DeviceAdapter;
use crate::ble::{BleLink, DeviceTarget, Peripheral, Radio};
use crate::command::{CommandPlan, CompletedFrame};
use crate::config::SessionConfig;
use crate::error::{Error, Phase, Result, TransportError};
use crate::sequencer;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Found,
    NotFound,
    Connecting,
    Connected,
    ResolvingServices,
    Subscribing,
    Ready,
    Sequencing,
    Disconnecting,
    Closed,
}

pub struct ConnectionSession<'a> {
    radio: &'a dyn Radio,
    target: DeviceTarget,
    config: &'a SessionConfig,
    state: SessionState,
    ready: bool,
    history: Vec<SessionState>,
}

impl<'a> ConnectionSession<'a> {
    pub fn new(radio: &'a dyn Radio, target: DeviceTarget, config: &'a SessionConfig) -> Self {
        Self {
            radio,
            target,
            config,
            state: SessionState::Idle,
            ready: false,
            history: vec![SessionState::Idle],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has passed through, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    fn transition(&mut self, next: SessionState) {
        debug!(address = %self.target.address, from = ?self.state, to = ?next, "session state");
        self.state = next;
        self.history.push(next);
    }

    /// Run `plan` against the target and return the completed frames.
    pub async fn run(
        &mut self,
        adapter: &dyn DeviceAdapter,
        plan: &CommandPlan,
    ) -> Result<Vec<CompletedFrame>> {
        let peripheral = match self.discover().await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                self.transition(SessionState::Closed);
                return Err(err);
            }
        };

        let mut link = match self.connect(&peripheral).await {
            Ok(link) => link,
            Err(err) => {
                self.transition(SessionState::Disconnecting);
                if matches!(err, Error::ConnectionTimeout { .. }) {
                    // The stack may still complete the abandoned connect.
                    self.abandon(&peripheral).await;
                }
                self.transition(SessionState::Closed);
                return Err(err);
            }
        };

        let result = self.drive(link.as_mut(), adapter, plan).await;
        self.disconnect(link.as_mut()).await;
        drop(link);
        self.transition(SessionState::Closed);
        result
    }

    async fn discover(&mut self) -> Result<Peripheral> {
        self.transition(SessionState::Discovering);
        self.radio
            .start_discovery()
            .await
            .map_err(|err| Error::ConnectionError(format!("discovery failed: {err}")))?;

        let found = self.poll_registry().await;
        self.radio.stop_discovery().await;

        match found {
            Ok(Some(peripheral)) => {
                info!(
                    address = %self.target.address,
                    id = %peripheral.id,
                    name = ?peripheral.name,
                    "found device"
                );
                self.transition(SessionState::Found);
                Ok(peripheral)
            }
            Ok(None) => {
                self.transition(SessionState::NotFound);
                Err(Error::DeviceNotFound(self.target.address.to_string()))
            }
            Err(err) => Err(Error::ConnectionError(format!("discovery failed: {err}"))),
        }
    }

    /// Check the registry once per poll interval until the budget runs out.
    async fn poll_registry(&self) -> std::result::Result<Option<Peripheral>, TransportError> {
        let poll = self.config.discovery_poll_interval.max(MIN_POLL_INTERVAL);
        let mut budget = self.config.discovery_timeout;

        while !budget.is_zero() {
            sleep(poll).await;
            let peripherals = self.radio.peripherals().await?;
            debug!(address = %self.target.address, count = peripherals.len(), "devices found");
            if let Some(peripheral) = self.target.select(peripherals) {
                return Ok(Some(peripheral));
            }
            budget = budget.saturating_sub(poll);
        }
        Ok(None)
    }

    async fn connect(&mut self, peripheral: &Peripheral) -> Result<Box<dyn BleLink>> {
        self.transition(SessionState::Connecting);
        let link = timeout(self.config.connect_timeout, self.radio.connect(peripheral))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                phase: Phase::Connecting,
            })?
            .map_err(|err| Error::ConnectionError(err.to_string()))?;
        info!(address = %self.target.address, "connected");
        self.transition(SessionState::Connected);
        Ok(link)
    }

    async fn drive(
        &mut self,
        link: &mut dyn BleLink,
        adapter: &dyn DeviceAdapter,
        plan: &CommandPlan,
    ) -> Result<Vec<CompletedFrame>> {
        let chars = adapter.characteristics();

        self.transition(SessionState::ResolvingServices);
        let available = timeout(self.config.resolve_timeout, link.discover_characteristics())
            .await
            .map_err(|_| Error::ConnectionTimeout {
                phase: Phase::ResolvingServices,
            })?
            .map_err(|err| Error::ConnectionError(format!("service discovery failed: {err}")))?;
        for uuid in [chars.notify, chars.write] {
            if !available.contains(&uuid) {
                warn!(address = %self.target.address, %uuid, "characteristic missing");
                return Err(Error::CharacteristicNotFound { uuid });
            }
        }

        self.transition(SessionState::Subscribing);
        let mut notifications = timeout(self.config.subscribe_timeout, link.subscribe(chars.notify))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                phase: Phase::Subscribing,
            })?
            .map_err(|err| {
                Error::ConnectionError(format!("enabling notifications failed: {err}"))
            })?;
        if !self.config.subscribe_settle.is_zero() {
            sleep(self.config.subscribe_settle).await;
        }

        if !self.ready {
            self.ready = true;
            self.transition(SessionState::Ready);
        }

        self.transition(SessionState::Sequencing);
        sequencer::run(
            link,
            &mut notifications,
            adapter,
            chars.write,
            plan,
            self.config,
        )
        .await
    }

    async fn abandon(&self, peripheral: &Peripheral) {
        let address = &self.target.address;
        match timeout(self.config.disconnect_timeout, self.radio.disconnect(peripheral)).await {
            Ok(Ok(())) => debug!(%address, "abandoned connect"),
            Ok(Err(err)) => warn!(%address, %err, "disconnect after connect timeout failed"),
            Err(_) => warn!(%address, "disconnect after connect timeout timed out"),
        }
    }

    async fn disconnect(&mut self, link: &mut dyn BleLink) {
        self.transition(SessionState::Disconnecting);
        let address = &self.target.address;
        let teardown = async {
            if !link.is_connected().await {
                return Ok(());
            }
            link.disconnect().await
        };
        match timeout(self.config.disconnect_timeout, teardown).await {
            Ok(Ok(())) => debug!(%address, "disconnected"),
            Ok(Err(err)) => warn!(%address, %err, "disconnect failed"),
            Err(_) => warn!(%address, "disconnect timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;
    use crate::adapter::jbd::tests::{basic_info_payload, cell_voltages_payload, response};
    use crate::adapter::{AdapterKind, JbdBms};
    use crate::ble::mock::{ConnectBehaviour, Event, LinkScript, MockRadio, WriteLog};

    const ADDRESS: &str = "A4:C1:38:0B:79:22";

    fn jbd_link() -> LinkScript {
        LinkScript::for_adapter(&JbdBms::default()).with_responses(vec![
            vec![response(0x03, &basic_info_payload())],
            vec![response(0x04, &cell_voltages_payload())],
        ])
    }

    async fn run_session(radio: &MockRadio) -> (Result<Vec<CompletedFrame>>, Vec<SessionState>) {
        let config = SessionConfig::default();
        let adapter = AdapterKind::Jbd.create();
        let plan = adapter.default_plan();
        let mut session = ConnectionSession::new(radio, DeviceTarget::new(ADDRESS), &config);
        let result = session.run(adapter.as_ref(), &plan).await;
        assert_eq!(session.state(), Closed);
        (result, session.history().to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle() {
        let log = WriteLog::default();
        let radio = MockRadio::new(log.clone()).with_peripheral(
            ADDRESS,
            None,
            2,
            ConnectBehaviour::Succeed(jbd_link()),
        );
        let (result, history) = run_session(&radio).await;
        assert_eq!(result.unwrap().len(), 2);
        assert_eq!(
            history,
            vec![
                Idle,
                Discovering,
                Found,
                Connecting,
                Connected,
                ResolvingServices,
                Subscribing,
                Ready,
                Sequencing,
                Disconnecting,
                Closed
            ]
        );
        assert_eq!(radio.polls(), 2);

        // Disconnect only after the last write.
        let events = log.events();
        assert_eq!(events.last(), Some(&Event::Disconnect(ADDRESS.to_string())));
        assert_eq!(log.count(|e| matches!(e, Event::Write(..))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowercase_address_matches() {
        let radio = MockRadio::new(WriteLog::default()).with_peripheral(
            &ADDRESS.to_lowercase(),
            None,
            1,
            ConnectBehaviour::Succeed(jbd_link()),
        );
        let (result, _) = run_session(&radio).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_never_connects() {
        let log = WriteLog::default();
        let radio = MockRadio::new(log.clone()).with_peripheral(
            "11:22:33:44:55:66",
            Some("other"),
            1,
            ConnectBehaviour::Succeed(jbd_link()),
        );
        let started = tokio::time::Instant::now();
        let (result, history) = run_session(&radio).await;

        assert!(matches!(result, Err(Error::DeviceNotFound(addr)) if addr == ADDRESS));
        assert_eq!(history, vec![Idle, Discovering, NotFound, Closed]);
        assert_eq!(radio.polls(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(log.count(|e| matches!(e, Event::Connect(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_an_error() {
        let radio = MockRadio::new(WriteLog::default()).with_peripheral(
            ADDRESS,
            None,
            1,
            ConnectBehaviour::Fail("le-connection-abort-by-local".into()),
        );
        let (result, history) = run_session(&radio).await;
        assert!(matches!(result, Err(Error::ConnectionError(msg)) if msg.contains("abort")));
        assert!(!history.contains(&Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_disconnects_peripheral() {
        let log = WriteLog::default();
        let radio =
            MockRadio::new(log.clone()).with_peripheral(ADDRESS, None, 1, ConnectBehaviour::Hang);
        let (result, history) = run_session(&radio).await;
        assert!(matches!(
            result,
            Err(Error::ConnectionTimeout {
                phase: Phase::Connecting
            })
        ));
        assert_eq!(&history[history.len() - 2..], &[Disconnecting, Closed]);
        assert_eq!(
            log.events().last(),
            Some(&Event::Disconnect(ADDRESS.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_match_wins_over_alias() {
        let log = WriteLog::default();
        let radio = MockRadio::new(log.clone())
            .with_peripheral(
                "00:00:00:00:00:01",
                Some("xiaoxiang BMS"),
                1,
                ConnectBehaviour::Fail("wrong device".into()),
            )
            .with_peripheral(ADDRESS, None, 1, ConnectBehaviour::Succeed(jbd_link()));
        let config = SessionConfig::default();
        let adapter = AdapterKind::Jbd.create();
        let plan = adapter.default_plan();
        let target = DeviceTarget::new(ADDRESS).with_alias("xiaoxiang BMS");
        let mut session = ConnectionSession::new(&radio, target, &config);
        assert!(session.run(adapter.as_ref(), &plan).await.is_ok());
        assert_eq!(
            log.count(|e| matches!(e, Event::Connect(id) if id == ADDRESS)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_disconnects() {
        let log = WriteLog::default();
        let chars = JbdBms::default().characteristics();
        let script = jbd_link().with_characteristics(vec![chars.notify]);
        let radio = MockRadio::new(log.clone()).with_peripheral(
            ADDRESS,
            None,
            1,
            ConnectBehaviour::Succeed(script),
        );
        let (result, history) = run_session(&radio).await;
        assert!(matches!(
            result,
            Err(Error::CharacteristicNotFound { uuid }) if uuid == chars.write
        ));
        assert!(!history.contains(&Subscribing));
        assert_eq!(log.count(|e| matches!(e, Event::Disconnect(_))), 1);
        assert_eq!(log.count(|e| matches!(e, Event::Write(..))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout_disconnects() {
        let log = WriteLog::default();
        let radio = MockRadio::new(log.clone()).with_peripheral(
            ADDRESS,
            None,
            1,
            ConnectBehaviour::Succeed(jbd_link().with_hanging_subscribe()),
        );
        let (result, history) = run_session(&radio).await;
        assert!(matches!(
            result,
            Err(Error::ConnectionTimeout {
                phase: Phase::Subscribing
            })
        ));
        assert!(!history.contains(&Ready));
        assert_eq!(log.count(|e| matches!(e, Event::Disconnect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_disconnect_still_closes() {
        let radio = MockRadio::new(WriteLog::default()).with_peripheral(
            ADDRESS,
            None,
            1,
            ConnectBehaviour::Succeed(jbd_link().with_hanging_disconnect()),
        );
        let (result, history) = run_session(&radio).await;
        assert!(result.is_ok());
        assert_eq!(history.last(), Some(&Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_disconnects() {
        let log = WriteLog::default();
        let radio = MockRadio::new(log.clone()).with_peripheral(
            ADDRESS,
            None,
            1,
            ConnectBehaviour::Succeed(jbd_link().with_responses(vec![])),
        );
        let (result, _) = run_session(&radio).await;
        assert!(matches!(
            result,
            Err(Error::ConnectionTimeout {
                phase: Phase::AwaitingResponse
            })
        ));
        assert_eq!(log.count(|e| matches!(e, Event::Disconnect(_))), 1);
    }
}
