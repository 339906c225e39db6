//! Built-in connectivity check over the signaling path
//!
//! The lower-index peer sends `{"type":"probe"}`, the other answers with
//! `{"type":"probe-ack"}`. Each side marks itself connected once it has
//! heard from the other. No direct transport is opened.

use serde_json::{json, Value};
use tracing::{debug, info};

use super::negotiation::{Negotiation, NegotiationContext, Negotiator};

#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeNegotiator;

impl Negotiator for ProbeNegotiator {
    fn negotiate(&self, ctx: NegotiationContext) -> Box<dyn Negotiation> {
        if ctx.is_initiator() {
            debug!("Probing {}", ctx.remote_peer_id.short());
            ctx.link.send(json!({"type": "probe", "index": ctx.local_index}));
        }
        Box::new(Probe { ctx })
    }
}

struct Probe {
    ctx: NegotiationContext,
}

impl Negotiation for Probe {
    fn on_message(&mut self, payload: Value) {
        match payload.get("type").and_then(|t| t.as_str()) {
            Some("probe") => {
                self.ctx
                    .link
                    .send(json!({"type": "probe-ack", "index": self.ctx.local_index}));
                if self.ctx.link.mark_connected() {
                    info!("Reached {} in {}", self.ctx.remote_peer_id.short(), self.ctx.network_id);
                }
            }
            Some("probe-ack") => {
                if self.ctx.link.mark_connected() {
                    info!("Reached {} in {}", self.ctx.remote_peer_id.short(), self.ctx.network_id);
                }
            }
            other => debug!("Ignoring payload of type {:?}", other),
        }
    }

    fn on_close(&mut self) {
        debug!("Probe with {} closed", self.ctx.remote_peer_id.short());
    }
}
