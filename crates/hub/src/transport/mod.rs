//! Live-data channels between the hub and a device.
//!
//! Each transport feeds [`InboundEvent`](crate::reconciler::InboundEvent)s
//! and link changes into the engine through its [`EngineHandle`], and carries
//! control commands the other way. Acknowledgements are matched to their
//! `send` inside the transport.

pub mod poll;
pub mod push;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::reconciler::{Change, Confirmation, Tier};

pub use poll::PollTransport;
pub use push::PushTransport;

/// A confirmed command, stamped by whoever confirmed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub confirmation: Confirmation,
    pub tier: Tier,
    pub at: OffsetDateTime,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Source tier stamped on everything this transport delivers.
    fn tier(&self) -> Tier;

    /// Start background work. Returns once tasks are running; the link is
    /// reported through the engine when it actually comes up.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Stop background work and report the link as down.
    async fn disconnect(&self);

    /// Deliver one command and wait for its confirmation.
    async fn send(&self, change: &Change) -> Result<Ack, EngineError>;

    fn is_connected(&self) -> bool;

    /// Re-fetch the profile list out of band. No-op where the device pushes
    /// profile changes itself.
    async fn refresh_profiles(&self) {}
}

/// Report a link state through the engine, ignoring a stopped engine.
pub(crate) async fn report_link(engine: &EngineHandle, tier: Tier, connected: bool) {
    if engine.set_link(tier, connected).await.is_err() {
        tracing::debug!(?tier, connected, "engine stopped; link change dropped");
    }
}
