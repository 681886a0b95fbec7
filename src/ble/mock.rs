//! Scripted radio for exercising sessions without hardware.
//!
//! A [`MockRadio`] holds peripherals that appear after a number of registry
//! polls and a [`LinkScript`] per peripheral describing how its link behaves.
//! Every connect, write attempt and disconnect is appended to a shared
//! [`WriteLog`] so tests can check ordering across sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;
use tokio::sync::mpsc;

use super::{BleLink, Peripheral, Radio};
use crate::adapter::DeviceAdapter;
use crate::error::{TransportError, WriteError};

const FRAGMENT_GAP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    DiscoveryStarted,
    Connect(String),
    Write(String, Vec<u8>),
    Disconnect(String),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct WriteLog(Arc<Mutex<Vec<Event>>>);

impl WriteLog {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Write(_, payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ConnectBehaviour {
    Succeed(LinkScript),
    Fail(String),
    Hang,
}

/// How one link answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkScript {
    characteristics: Vec<Uuid>,
    /// Notification fragments sent after each successful write, in order.
    responses: VecDeque<Vec<Vec<u8>>>,
    busy_writes: u32,
    back_to_back: bool,
    failing_writes: Option<String>,
    subscribe_hangs: bool,
    disconnect_hangs: bool,
}

impl LinkScript {
    pub(crate) fn for_adapter(adapter: &dyn DeviceAdapter) -> Self {
        let chars = adapter.characteristics();
        Self {
            characteristics: vec![chars.notify, chars.write],
            ..Default::default()
        }
    }

    pub(crate) fn with_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    pub(crate) fn with_responses(mut self, responses: Vec<Vec<Vec<u8>>>) -> Self {
        self.responses = responses.into();
        self
    }

    /// Every distinct payload is refused as busy this many times first.
    pub(crate) fn with_busy_writes(mut self, busy_writes: u32) -> Self {
        self.busy_writes = busy_writes;
        self
    }

    /// Queue all fragments of a response at once instead of spacing them out.
    pub(crate) fn with_back_to_back_fragments(mut self) -> Self {
        self.back_to_back = true;
        self
    }

    pub(crate) fn with_failing_writes(mut self, msg: &str) -> Self {
        self.failing_writes = Some(msg.to_string());
        self
    }

    pub(crate) fn with_hanging_subscribe(mut self) -> Self {
        self.subscribe_hangs = true;
        self
    }

    pub(crate) fn with_hanging_disconnect(mut self) -> Self {
        self.disconnect_hangs = true;
        self
    }
}

pub(crate) struct MockRadio {
    peripherals: Vec<(u32, Peripheral)>,
    behaviours: HashMap<String, ConnectBehaviour>,
    polls: AtomicU32,
    log: WriteLog,
}

impl MockRadio {
    pub(crate) fn new(log: WriteLog) -> Self {
        Self {
            peripherals: Vec::new(),
            behaviours: HashMap::new(),
            polls: AtomicU32::new(0),
            log,
        }
    }

    /// Add a peripheral that shows up on the `appears_after`th registry poll.
    pub(crate) fn with_peripheral(
        mut self,
        id: &str,
        name: Option<&str>,
        appears_after: u32,
        behaviour: ConnectBehaviour,
    ) -> Self {
        self.peripherals.push((
            appears_after,
            Peripheral {
                id: id.to_string(),
                name: name.map(str::to_string),
            },
        ));
        self.behaviours.insert(id.to_string(), behaviour);
        self
    }

    pub(crate) fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn start_discovery(&self) -> Result<(), TransportError> {
        self.polls.store(0, Ordering::SeqCst);
        self.log.push(Event::DiscoveryStarted);
        Ok(())
    }

    async fn stop_discovery(&self) {}

    async fn peripherals(&self) -> Result<Vec<Peripheral>, TransportError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self
            .peripherals
            .iter()
            .filter(|(appears_after, _)| *appears_after <= polls)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<Box<dyn BleLink>, TransportError> {
        self.log.push(Event::Connect(peripheral.id.clone()));
        match self.behaviours.get(&peripheral.id).cloned() {
            Some(ConnectBehaviour::Succeed(script)) => Ok(Box::new(MockLink::new(
                &peripheral.id,
                script,
                self.log.clone(),
            ))),
            Some(ConnectBehaviour::Fail(msg)) => Err(TransportError::new(msg)),
            Some(ConnectBehaviour::Hang) => std::future::pending().await,
            None => Err(TransportError::new("unknown peripheral")),
        }
    }

    async fn disconnect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        self.log.push(Event::Disconnect(peripheral.id.clone()));
        Ok(())
    }
}

pub(crate) struct MockLink {
    id: String,
    script: LinkScript,
    log: WriteLog,
    connected: bool,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
    last_payload: Option<Vec<u8>>,
    busy_left: u32,
}

impl MockLink {
    pub(crate) fn new(id: &str, script: LinkScript, log: WriteLog) -> Self {
        Self {
            id: id.to_string(),
            script,
            log,
            connected: true,
            notify_tx: None,
            last_payload: None,
            busy_left: 0,
        }
    }
}

#[async_trait]
impl BleLink for MockLink {
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, TransportError> {
        Ok(self.script.characteristics.clone())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if self.script.subscribe_hangs {
            return std::future::pending().await;
        }
        if !self.script.characteristics.contains(&uuid) {
            return Err(TransportError::new("no such characteristic"));
        }
        let (tx, rx) = mpsc::channel(64);
        self.notify_tx = Some(tx);
        Ok(rx)
    }

    async fn write(&mut self, _uuid: Uuid, payload: &[u8]) -> Result<(), WriteError> {
        self.log.push(Event::Write(self.id.clone(), payload.to_vec()));
        if let Some(msg) = &self.script.failing_writes {
            return Err(WriteError::Failed(msg.clone()));
        }

        if self.last_payload.as_deref() != Some(payload) {
            self.last_payload = Some(payload.to_vec());
            self.busy_left = self.script.busy_writes;
        }
        if self.busy_left > 0 {
            self.busy_left -= 1;
            return Err(WriteError::Busy);
        }
        // Fresh payload next time, even if identical.
        self.last_payload = None;

        if let (Some(fragments), Some(tx)) = (self.script.responses.pop_front(), &self.notify_tx) {
            let tx = tx.clone();
            let back_to_back = self.script.back_to_back;
            tokio::spawn(async move {
                for (i, fragment) in fragments.into_iter().enumerate() {
                    if i == 0 || !back_to_back {
                        tokio::time::sleep(FRAGMENT_GAP).await;
                    }
                    if tx.send(fragment).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.script.disconnect_hangs {
            return std::future::pending().await;
        }
        self.connected = false;
        self.notify_tx = None;
        self.log.push(Event::Disconnect(self.id.clone()));
        Ok(())
    }
}
