//! BLE GATT transport (BlueZ via bluer)
//!
//! One primary service exposes a characteristic per channel. Clients write
//! chunked messages to the writable channels and subscribe to notifications
//! for replies and events. Every payload in either direction goes through
//! [`robot_link_shared::frame`].

use super::traits::{Transport, TransportContext};
use super::{pump_changes, ChangeFeed};
use crate::command::PendingResult;
use crate::events::{DeviceNotifier, OutputSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bluer::adv::{Advertisement, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
};
use bluer::Uuid;
use bytes::Bytes;
use futures::FutureExt;
use robot_link_shared::frame;
use robot_link_shared::{Command, CommandResult, Reassembler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Primary service carrying every channel
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x5f8e_0001_6c1a_4f3b_9d2e_7a41_c0b3_e210);

/// A GATT characteristic of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Device state updates (notify)
    Device,
    /// Shell commands run in the project directory
    Execution,
    /// Command lines for the dispatcher
    Communication,
    /// Program output (notify)
    Logging,
    /// Client keep-alive
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Device,
        Channel::Execution,
        Channel::Communication,
        Channel::Logging,
        Channel::Heartbeat,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Device => Uuid::from_u128(0x5f8e_0002_6c1a_4f3b_9d2e_7a41_c0b3_e210),
            Channel::Execution => Uuid::from_u128(0x5f8e_0003_6c1a_4f3b_9d2e_7a41_c0b3_e210),
            Channel::Communication => Uuid::from_u128(0x5f8e_0004_6c1a_4f3b_9d2e_7a41_c0b3_e210),
            Channel::Logging => Uuid::from_u128(0x5f8e_0005_6c1a_4f3b_9d2e_7a41_c0b3_e210),
            Channel::Heartbeat => Uuid::from_u128(0x5f8e_0006_6c1a_4f3b_9d2e_7a41_c0b3_e210),
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Channel::Execution | Channel::Communication | Channel::Heartbeat
        )
    }
}

/// Prefix a payload with its status byte
fn status_frame(success: bool, body: &[u8]) -> Bytes {
    CommandResult {
        success,
        response: Bytes::copy_from_slice(body).into(),
    }
    .to_status_frame()
}

type Subscribers = HashMap<Channel, Vec<CharacteristicNotifier>>;

/// What a reassembled message turned into
enum Inbound {
    Reply(Bytes),
    Queued(PendingResult),
    Ignored,
}

/// GATT server bridging BLE centrals to the dispatcher
pub struct BleTransport {
    ctx: TransportContext,
    reassembler: Mutex<Reassembler<Channel>>,
    inbound_tx: mpsc::UnboundedSender<(Channel, Vec<u8>)>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(Channel, Vec<u8>)>>>,
    outbound_tx: mpsc::UnboundedSender<(Channel, Bytes)>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(Channel, Bytes)>>>,
    subscribers: tokio::sync::Mutex<Subscribers>,
    changes: ChangeFeed,
    staleness: Duration,
}

impl BleTransport {
    pub fn new(ctx: TransportContext, staleness: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            reassembler: Mutex::new(Reassembler::with_staleness(staleness)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subscribers: tokio::sync::Mutex::new(HashMap::new()),
            changes: ChangeFeed::new(),
            staleness,
        }
    }

    /// Queue a whole message for notification on `channel`
    fn enqueue(&self, channel: Channel, payload: Bytes) {
        let _ = self.outbound_tx.send((channel, payload));
    }

    /// Add one written fragment; returns the message it completes, if any
    fn accept_fragment(&self, channel: Channel, fragment: &[u8]) -> Option<Bytes> {
        let mut reassembler = self.reassembler.lock().ok()?;
        let message = reassembler.push(&channel, fragment);
        if message.is_none() {
            debug!(
                "[BLE] {:?}: {} bytes pending",
                channel,
                reassembler.pending_len(&channel)
            );
        }
        message
    }

    /// Take one reassembled message off a channel. Commands are queued on
    /// the dispatcher before this returns, so messages accepted in order
    /// also run in order.
    async fn accept_message(&self, channel: Channel, message: Bytes) -> Inbound {
        let text = String::from_utf8_lossy(&message);
        let command = match channel {
            Channel::Heartbeat => {
                self.ctx.supervisor.beat();
                return Inbound::Reply(Bytes::from_static(b"0,"));
            }
            Channel::Communication => match Command::parse_line(text.trim_end_matches(['\r', '\n'])) {
                Ok(command) => command,
                Err(e) => return Inbound::Reply(status_frame(false, e.to_string().as_bytes())),
            },
            Channel::Execution => Command::new("execute-command").with("command", text.into_owned()),
            Channel::Device | Channel::Logging => {
                warn!("[BLE] Ignoring write to read-only channel {:?}", channel);
                return Inbound::Ignored;
            }
        };
        Inbound::Queued(self.ctx.dispatcher.submit(command).await)
    }

    fn characteristic(self: &Arc<Self>, channel: Channel) -> Characteristic {
        let write = channel.is_writable().then(|| {
            let tx = self.inbound_tx.clone();
            CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                    let sent = tx.send((channel, value));
                    async move { sent.map_err(|_| ReqError::Failed) }.boxed()
                })),
                ..Default::default()
            }
        });

        let this = self.clone();
        let notify = CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let this = this.clone();
                async move {
                    debug!("[BLE] Subscriber on {:?}", channel);
                    this.subscribers
                        .lock()
                        .await
                        .entry(channel)
                        .or_default()
                        .push(notifier);
                }
                .boxed()
            })),
            ..Default::default()
        };

        Characteristic {
            uuid: channel.uuid(),
            write,
            notify: Some(notify),
            ..Default::default()
        }
    }

    /// Send queued messages chunk by chunk so frames of different messages
    /// never interleave on a channel
    async fn run_sender(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Channel, Bytes)>) {
        while let Some((channel, payload)) = rx.recv().await {
            let mut subscribers = self.subscribers.lock().await;
            let Some(notifiers) = subscribers.get_mut(&channel) else {
                continue;
            };
            notifiers.retain(|n| !n.is_stopped());

            for chunk in frame::encode(&payload) {
                let mut failed = Vec::new();
                for (i, notifier) in notifiers.iter_mut().enumerate() {
                    if let Err(e) = notifier.notify(chunk.to_vec()).await {
                        debug!("[BLE] Dropping subscriber on {:?}: {}", channel, e);
                        failed.push(i);
                    }
                }
                for i in failed.into_iter().rev() {
                    notifiers.remove(i);
                }
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Channel, Vec<u8>)>) {
        // Command replies are awaited here, in submission order, so the
        // receive loop stays free for heartbeats
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<(Channel, PendingResult)>();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some((channel, pending)) = pending_rx.recv().await {
                let reply = pending.wait().await.to_status_frame();
                this.enqueue(channel, reply);
            }
        });

        while let Some((channel, fragment)) = rx.recv().await {
            let Some(message) = self.accept_fragment(channel, &fragment) else {
                continue;
            };
            match self.accept_message(channel, message).await {
                Inbound::Reply(reply) => self.enqueue(channel, reply),
                Inbound::Queued(pending) => {
                    let _ = pending_tx.send((channel, pending));
                }
                Inbound::Ignored => {}
            }
        }
    }

    async fn evict_stale(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.staleness.max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;
            if let Ok(mut reassembler) = self.reassembler.lock() {
                let dropped = reassembler.evict_stale(Instant::now());
                if dropped > 0 {
                    debug!("[BLE] Dropped {} stale partial messages", dropped);
                }
            }
        }
    }
}

impl OutputSink for BleTransport {
    fn on_stdout(&self, line: &str) {
        self.enqueue(Channel::Logging, status_frame(true, line.as_bytes()));
    }

    fn on_stderr(&self, line: &str) {
        self.enqueue(Channel::Logging, status_frame(false, line.as_bytes()));
    }
}

impl DeviceNotifier for BleTransport {
    fn on_device_changed(&self, device_id: &str) {
        self.changes.push(device_id);
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn name(&self) -> &'static str {
        "BLE"
    }

    async fn serve(self: Arc<Self>) -> Result<()> {
        let session = bluer::Session::new().await.context("no BlueZ session")?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: Channel::ALL.iter().map(|c| self.characteristic(*c)).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let _app = adapter.serve_gatt_application(app).await?;

        let name = self.ctx.projects.name();
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [SERVICE_UUID].into_iter().collect(),
            local_name: Some(name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };
        let _adv = adapter.advertise(advertisement).await?;
        info!("[BLE] Advertising as '{}' on {}", name, adapter.name());

        if let Some(rx) = self.changes.take() {
            let this = self.clone();
            tokio::spawn(async move {
                let devices = this.ctx.devices.clone();
                pump_changes(rx, devices, |id, state| {
                    let update = serde_json::json!({ id: state });
                    this.enqueue(Channel::Device, Bytes::from(update.to_string()));
                })
                .await;
            });
        }

        let outbound = self.outbound_rx.lock().ok().and_then(|mut rx| rx.take());
        if let Some(rx) = outbound {
            tokio::spawn(self.clone().run_sender(rx));
        }
        tokio::spawn(self.clone().evict_stale());

        let inbound = self
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .context("BLE transport already serving")?;
        self.run_receiver(inbound).await;
        Ok(())
    }
}
