//! Route table for forwarded `call`/`set` requests.
//!
//! The broker rewrites the id of every forwarded request to a fresh
//! [`RouteId`], so the owning peer's reply can be matched back to the
//! requester and its original id. Each entry is claimed exactly once: by the
//! matching response, by its timeout, or by a disconnect. Claiming means
//! removing the entry; whoever comes second finds nothing.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::JetError;
use crate::message;
use crate::peer::PeerId;

/// Broker-local id of a forwarded request.
pub type RouteId = u64;

/// Cancels a pending route timeout when dropped or cancelled.
#[derive(Debug, Default)]
pub struct TimeoutHandle(Option<AbortHandle>);

impl TimeoutHandle {
    pub fn new(handle: AbortHandle) -> Self {
        Self(Some(handle))
    }

    /// A handle with no timer behind it.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Arms route timeouts. When a timeout fires, the scheduler must arrange for
/// [`Router::expire`] to be called with the route id.
pub trait TimeoutScheduler: Send {
    fn schedule(&self, route: RouteId, after: Duration) -> TimeoutHandle;
}

/// A scheduler whose timeouts never fire. Timeouts are driven by calling
/// [`Router::expire`] directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualTimeouts;

impl TimeoutScheduler for ManualTimeouts {
    fn schedule(&self, _route: RouteId, _after: Duration) -> TimeoutHandle {
        TimeoutHandle::detached()
    }
}

/// One pending forwarded request.
#[derive(Debug)]
pub struct RouteEntry {
    pub requester: PeerId,
    /// The id the requester used; its reply carries this id again.
    pub request_id: Value,
    pub target: PeerId,
    pub path: String,
    timer: TimeoutHandle,
}

/// A reply the router wants delivered to a requester.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub route: RouteId,
    pub to: PeerId,
    pub message: Value,
}

pub struct Router {
    next_id: RouteId,
    routes: HashMap<RouteId, RouteEntry>,
    timeout: Duration,
    scheduler: Box<dyn TimeoutScheduler>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("next_id", &self.next_id)
            .field("routes", &self.routes)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(timeout: Duration, scheduler: Box<dyn TimeoutScheduler>) -> Self {
        Self {
            next_id: 1,
            routes: HashMap::new(),
            timeout,
            scheduler,
        }
    }

    /// Open a route and arm its timeout. Returns the id to put on the
    /// forwarded request.
    pub fn request(
        &mut self,
        requester: &PeerId,
        request_id: Value,
        target: &PeerId,
        path: &str,
    ) -> RouteId {
        let route = self.next_id;
        self.next_id += 1;
        let timer = self.scheduler.schedule(route, self.timeout);
        debug!("Route {route}: {requester} -> {target} ({path})");
        self.routes.insert(
            route,
            RouteEntry {
                requester: requester.clone(),
                request_id,
                target: target.clone(),
                path: path.to_string(),
                timer,
            },
        );
        route
    }

    /// Match a response from `responder`. Unknown routes and responses from
    /// anyone but the route's target are logged and ignored.
    pub fn resolve(
        &mut self,
        route: RouteId,
        responder: &PeerId,
        outcome: Result<Value, Value>,
    ) -> Option<Delivery> {
        match self.routes.get(&route) {
            None => {
                debug!("Ignoring response from {responder} for unknown route {route}");
                return None;
            }
            Some(entry) if &entry.target != responder => {
                warn!(
                    "Ignoring response for route {route} from {responder}, expected {}",
                    entry.target
                );
                return None;
            }
            Some(_) => {}
        }

        let entry = self.claim(route)?;
        let message = match outcome {
            Ok(result) => message::result_reply(entry.request_id, result),
            Err(raw) => message::error_reply(entry.request_id, &JetError::handler_failure(raw)),
        };
        Some(Delivery {
            route,
            to: entry.requester,
            message,
        })
    }

    /// The route's timeout fired. Returns `None` when it was already claimed.
    pub fn expire(&mut self, route: RouteId) -> Option<Delivery> {
        let entry = self.claim(route)?;
        debug!("Route {route} to {} timed out ({})", entry.target, entry.path);
        let error = JetError::ResponseTimeout { path: entry.path };
        Some(Delivery {
            route,
            to: entry.requester.clone(),
            message: message::error_reply(entry.request_id, &error),
        })
    }

    /// Fail every route involving `peer` with `PeerGone`. Routes the peer
    /// itself requested have nobody left to tell and produce no delivery.
    pub fn drop_peer(&mut self, peer: &PeerId) -> Vec<Delivery> {
        let mut involved: Vec<RouteId> = self
            .routes
            .iter()
            .filter(|(_, entry)| &entry.requester == peer || &entry.target == peer)
            .map(|(route, _)| *route)
            .collect();
        involved.sort_unstable();

        let mut deliveries = Vec::new();
        for route in involved {
            let Some(entry) = self.claim(route) else {
                continue;
            };
            if &entry.requester == peer {
                debug!("Route {route} abandoned, requester {peer} is gone");
                continue;
            }
            let error = JetError::PeerGone { path: entry.path };
            deliveries.push(Delivery {
                route,
                to: entry.requester,
                message: message::error_reply(entry.request_id, &error),
            });
        }
        deliveries
    }

    pub fn get(&self, route: RouteId) -> Option<&RouteEntry> {
        self.routes.get(&route)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn claim(&mut self, route: RouteId) -> Option<RouteEntry> {
        let mut entry = self.routes.remove(&route)?;
        std::mem::take(&mut entry.timer).cancel();
        Some(entry)
    }
}
