//! The single entry point: fetch telemetry from one device.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::AdapterKind;
use crate::ble::{DeviceTarget, Radio};
use crate::command::CommandPlan;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::ConnectionSession;
use crate::telemetry::TelemetrySnapshot;

/// Runs fetches against a shared radio, one at a time.
///
/// The radio can only hold one session, so concurrent fetches queue on an
/// internal lock. A queued fetch starts its discovery timer only once it
/// holds the lock.
///
/// Each fetch runs on its own task. Dropping the returned future does not
/// interrupt the session: it still disconnects before the radio is released.
pub struct Fetcher {
    radio: Arc<dyn Radio>,
    config: Arc<SessionConfig>,
    busy: Arc<Mutex<()>>,
}

impl Fetcher {
    pub fn new(radio: Arc<dyn Radio>, config: SessionConfig) -> Self {
        Self {
            radio,
            config: Arc::new(config),
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Fetch using the family's default plan.
    pub async fn fetch(
        &self,
        target: DeviceTarget,
        kind: AdapterKind,
    ) -> Result<TelemetrySnapshot> {
        let plan = kind.create().default_plan();
        self.fetch_with_plan(target, kind, &plan).await
    }

    pub async fn fetch_with_plan(
        &self,
        target: DeviceTarget,
        kind: AdapterKind,
        plan: &CommandPlan,
    ) -> Result<TelemetrySnapshot> {
        // Encoding failures need no radio time.
        kind.create().encode_plan(plan)?;

        let radio = Arc::clone(&self.radio);
        let config = Arc::clone(&self.config);
        let busy = Arc::clone(&self.busy);
        let plan = plan.clone();
        let worker = tokio::spawn(async move {
            let _radio = busy.lock().await;
            run_fetch(radio.as_ref(), &config, target, kind, &plan).await
        });

        worker
            .await
            .map_err(|err| Error::ConnectionError(format!("fetch task failed: {err}")))?
    }
}

async fn run_fetch(
    radio: &dyn Radio,
    config: &SessionConfig,
    target: DeviceTarget,
    kind: AdapterKind,
    plan: &CommandPlan,
) -> Result<TelemetrySnapshot> {
    let mut adapter = kind.create();
    let address = target.address.clone();
    info!(%address, adapter = %kind, commands = plan.len(), "fetch");

    let mut session = ConnectionSession::new(radio, target, config);
    let frames = match session.run(adapter.as_ref(), plan).await {
        Ok(frames) => frames,
        Err(err) => {
            warn!(%address, %err, "fetch failed");
            return Err(err);
        }
    };

    for frame in &frames {
        adapter.decode(frame.kind, &frame.bytes);
    }
    Ok(TelemetrySnapshot::assemble(adapter.telemetry()))
}
