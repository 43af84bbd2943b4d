//! Reconnecting WebSocket link to the gateway.
//!
//! One socket, one task. On every (re)connect the bare registration record
//! goes out first, then all traffic is enveloped frames. A heartbeat ticks
//! while connected; on disconnect the link sleeps and dials again,
//! re-registering idempotently. Outbound frames queue across reconnects so
//! callers never block on link state.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rivulet_config::GatewaySettings;
use rivulet_proto::{Frame, NodeRecord};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Sender half handed to the rest of the worker.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl LinkHandle {
    /// Queue a frame for the gateway. Frames sent while disconnected are
    /// delivered after the next successful reconnect.
    pub fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            debug!("gateway link is shut down; frame dropped");
        }
    }
}

/// Spawn the link task.
///
/// Inbound frames are forwarded to `inbound`; dropping its receiver does
/// not stop the link — flip `shutdown` for that.
pub fn spawn(
    settings: GatewaySettings,
    record: NodeRecord,
    inbound: mpsc::UnboundedSender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) -> (LinkHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut outbound) = mpsc::unbounded_channel::<Frame>();
    let handle = LinkHandle { tx };

    let task = tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(settings.url.as_str()).await {
                Ok((socket, _)) => {
                    info!(url = %settings.url, node_id = %record.id, "connected to gateway");
                    run_connection(
                        socket,
                        &settings,
                        &record,
                        &mut outbound,
                        &inbound,
                        &mut shutdown,
                    )
                    .await;
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(url = %settings.url, "gateway connection lost");
                }
                Err(error) => {
                    warn!(url = %settings.url, error = %error, "gateway connection failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(settings.reconnect_delay()) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("gateway link stopped");
    });

    (handle, task)
}

async fn run_connection(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    settings: &GatewaySettings,
    record: &NodeRecord,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    inbound: &mpsc::UnboundedSender<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();

    // Registration is the single non-enveloped frame in the protocol.
    let registration = match serde_json::to_string(record) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(error = %error, "registration record not serialisable");
            return;
        }
    };
    if sink.send(Message::Text(registration.into())).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = Frame::Heartbeat {
                    timestamp: Utc::now().timestamp(),
                    node_id: record.id.clone(),
                };
                if send_frame(&mut sink, &frame).await.is_err() {
                    return;
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                if send_frame(&mut sink, &frame).await.is_err() {
                    return;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(text.as_str()) {
                            Ok(frame) => {
                                if inbound.send(frame).is_err() {
                                    debug!("inbound dispatcher gone; frame dropped");
                                }
                            }
                            Err(error) => {
                                warn!(error = %error, "unparseable gateway frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Drain already queued frames before closing.
                    while let Ok(frame) = outbound.try_recv() {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    return;
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let raw = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(raw.into())).await.map_err(|_| ())
}
