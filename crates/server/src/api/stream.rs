//! Server-streaming policy subscription.
//!
//! Flow per connection:
//! 1. TLS layer verified a client certificate (enforced by the
//!    [`ClientCert`] extractor), the agent self-reports its identity.
//! 2. Initial sync: snapshot or delta, depending on the agent's last
//!    known revision versus the hub's.
//! 3. Node marked online, hub subscription installed.
//! 4. Watch loop: hub events are forwarded; the resync sentinel becomes
//!    a fresh full snapshot scoped to this client.
//! 5. On any exit the node is marked offline by a drop guard, so the
//!    status write happens even when the connection is torn down.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use bor_domain::model::{Node, NodeStatus};
use bor_domain::Error;
use bor_protocol::{PolicyUpdate, UpdateKind};

use crate::hub::{HubEvent, InitialSync};
use crate::state::AppState;
use crate::store::NodeRepo;

use super::policies::{applicable_to_wire, policy_to_wire};
use super::{ApiError, ClientCert};

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub last_known_revision: u64,
}

/// GET /v1/policies/subscribe — upgrade to the policy stream.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    cert: ClientCert,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    if query.client_id.is_empty() {
        return ApiError(Error::InvalidInput("client_id must not be empty".into()))
            .into_response();
    }
    let node = match state.nodes.get_by_name(&query.client_id) {
        Ok(Some(node)) => node,
        Ok(None) => {
            return ApiError(Error::not_found("node", &query.client_id)).into_response()
        }
        Err(e) => return ApiError(e).into_response(),
    };
    if cert.common_name != query.client_id {
        tracing::debug!(
            cert_cn = %cert.common_name,
            client_id = %query.client_id,
            "client identity differs from certificate subject"
        );
    }

    let last_known = query.last_known_revision;
    ws.on_upgrade(move |socket| handle_stream(socket, state, node, last_known))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type WsSink = SplitSink<WebSocket, Message>;

async fn handle_stream(socket: WebSocket, state: AppState, node: Node, last_known: u64) {
    let (mut sink, mut stream) = socket.split();

    // ── Initial sync ─────────────────────────────────────────────────
    let synced = match state.hub.plan_initial_sync(last_known) {
        InitialSync::Snapshot => send_snapshot(&mut sink, &state, &node).await,
        InitialSync::Delta(events) => send_events(&mut sink, &events).await,
        InitialSync::UpToDate => Ok(()),
    };
    if let Err(e) = synced {
        tracing::warn!(node = %node.name, error = %e, "initial sync failed");
        return;
    }

    // ── Online / offline bracketing ──────────────────────────────────
    if let Err(e) = state.nodes.set_status(&node.id, NodeStatus::Online) {
        tracing::warn!(node = %node.name, error = %e, "failed to mark node online");
    }
    let _offline = OfflineGuard {
        nodes: state.nodes.clone(),
        node_id: node.id.clone(),
        node_name: node.name.clone(),
    };

    let mut sub = state.hub.subscribe(&node.name);
    tracing::info!(
        node = %node.name,
        last_known_revision = last_known,
        revision = state.hub.revision(),
        "policy stream established"
    );

    // ── Watch loop ───────────────────────────────────────────────────
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                // Server-streaming RPC: client payloads are ignored.
                Some(Ok(_)) => {}
            },
            event = sub.rx.recv() => {
                let Some(event) = event else { break };
                let sent = if event.is_resync() {
                    send_snapshot(&mut sink, &state, &node).await
                } else {
                    send_update(&mut sink, &event_to_update(&event)).await
                };
                if let Err(e) = sent {
                    tracing::debug!(node = %node.name, error = %e, "stream send failed");
                    break;
                }
            },
            _ = state.shutdown.cancelled() => {
                tracing::debug!(node = %node.name, "server stopping, closing stream");
                break;
            }
        }
    }

    tracing::info!(node = %node.name, "policy stream closed");
}

/// Marks the node offline when the stream handler ends, including when
/// the task is dropped mid-await by a peer disconnect.
struct OfflineGuard {
    nodes: Arc<dyn NodeRepo>,
    node_id: String,
    node_name: String,
}

impl Drop for OfflineGuard {
    fn drop(&mut self) {
        if let Err(e) = self.nodes.set_status(&self.node_id, NodeStatus::Offline) {
            tracing::warn!(node = %self.node_name, error = %e, "failed to mark node offline");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compute and stream a full snapshot for this node.
///
/// Every message carries the revision observed at snapshot start; the
/// last one sets `snapshot_complete`. An empty applicable set still emits
/// one payload-less marker so the agent knows it is synchronised.
async fn send_snapshot(sink: &mut WsSink, state: &AppState, node: &Node) -> Result<(), Error> {
    let revision = state.hub.revision();
    let groups = state.groups.groups_for_node(&node.id)?;
    let group_ids: Vec<String> = groups.into_iter().map(|g| g.id).collect();
    let applicable = state.query.applicable_for_groups(&group_ids)?;

    if applicable.is_empty() {
        return send_update(
            sink,
            &PolicyUpdate {
                kind: UpdateKind::Snapshot,
                policy: None,
                revision,
                snapshot_complete: true,
            },
        )
        .await;
    }

    let last = applicable.len() - 1;
    for (i, entry) in applicable.iter().enumerate() {
        let update = PolicyUpdate {
            kind: UpdateKind::Snapshot,
            policy: Some(applicable_to_wire(entry)?),
            revision,
            snapshot_complete: i == last,
        };
        send_update(sink, &update).await?;
    }
    tracing::debug!(node = %node.name, policies = applicable.len(), revision, "snapshot sent");
    Ok(())
}

async fn send_events(sink: &mut WsSink, events: &[HubEvent]) -> Result<(), Error> {
    for event in events {
        send_update(sink, &event_to_update(event)).await?;
    }
    Ok(())
}

fn event_to_update(event: &HubEvent) -> PolicyUpdate {
    let policy = event
        .policy
        .as_ref()
        .and_then(|p| policy_to_wire(p, 0).ok());
    PolicyUpdate {
        kind: event.kind,
        policy,
        revision: event.revision,
        snapshot_complete: false,
    }
}

async fn send_update(sink: &mut WsSink, update: &PolicyUpdate) -> Result<(), Error> {
    let json = serde_json::to_string(update)?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| Error::Transport(format!("websocket send: {e}")))
}
