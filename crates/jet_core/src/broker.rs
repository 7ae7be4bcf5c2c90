//! The broker state and its operations.
//!
//! [`Broker`] owns the peer table, the element registry, the fetch engine
//! and the route table. It is plain synchronous data; the service task in
//! [`crate::service`] is the only thing that drives it at runtime.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::element::{Access, ElementDescriptor, Elements};
use crate::error::{JetError, Result};
use crate::fetch::{FETCH_ALL_ID, FetchEngine};
use crate::fetcher::FetchParams;
use crate::info::Info;
use crate::message::{self, Outbound};
use crate::peer::{Peer, PeerId, PeerSender, Peers};
use crate::router::{Delivery, RouteId, Router, TimeoutScheduler};

/// A `call` or `set` to forward to an element's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Forward {
    Call {
        path: String,
        args: Value,
    },
    Set {
        path: String,
        value: Value,
        value_as_result: bool,
    },
}

impl Forward {
    pub fn path(&self) -> &str {
        match self {
            Self::Call { path, .. } | Self::Set { path, .. } => path,
        }
    }
}

/// Params of the `config` method.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    peers: Peers,
    elements: Elements,
    fetches: FetchEngine,
    router: Router,
}

impl Broker {
    pub fn new(config: BrokerConfig, scheduler: Box<dyn TimeoutScheduler>) -> Self {
        let router = Router::new(config.route_timeout, scheduler);
        Self {
            config,
            peers: Peers::new(),
            elements: Elements::new(),
            fetches: FetchEngine::new(),
            router,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    pub fn fetches(&self) -> &FetchEngine {
        &self.fetches
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn info(&self) -> Info {
        Info::new(&self.config)
    }

    /// Register a freshly connected peer.
    pub fn connect(&mut self, peer: PeerId, sender: PeerSender) {
        info!("Peer connected: {peer}");
        self.peers.add_peer(Peer::new(peer, sender));
    }

    /// Tear down everything a peer owned: its fetchers go first so it is
    /// not notified about its own departure, then its elements (other
    /// fetchers see them disappear), then every route it was part of.
    pub fn disconnect(&mut self, peer: &PeerId) {
        let Some(gone) = self.peers.remove_peer(peer) else {
            debug!("Disconnect for unknown peer {peer}");
            return;
        };

        let fetch_ids = self.fetches.remove_peer(peer);
        for path in gone.elements() {
            if let Err(e) = self.elements.remove(peer, path, &mut self.fetches) {
                warn!("Failed to remove {path} of departed peer {peer}: {e}");
            }
        }
        for delivery in self.router.drop_peer(peer) {
            self.deliver(delivery);
        }
        info!(
            "Peer disconnected: {peer} after {}s ({} elements, {} fetches)",
            gone.session_duration().num_seconds(),
            gone.elements().len(),
            fetch_ids.len()
        );
        self.flush();
    }

    /// Disconnect every peer whose outbound queue overflowed. Disconnecting
    /// one can overflow another, so this runs until none is left.
    pub fn drop_stalled(&mut self) {
        while let Some(peer) = self.peers.take_stalled() {
            self.disconnect(&peer);
        }
    }

    pub fn add(&mut self, peer: &PeerId, descriptor: ElementDescriptor) -> Result<()> {
        let path = descriptor.path.clone();
        self.elements.add(peer, descriptor, &mut self.fetches)?;
        if let Some(owner) = self.peers.get_peer_mut(peer) {
            owner.track_element(&path);
        }
        debug!("Peer {peer} added {path}");
        Ok(())
    }

    pub fn remove(&mut self, peer: &PeerId, path: &str) -> Result<()> {
        self.elements.remove(peer, path, &mut self.fetches)?;
        if let Some(owner) = self.peers.get_peer_mut(peer) {
            owner.untrack_element(path);
        }
        debug!("Peer {peer} removed {path}");
        Ok(())
    }

    pub fn change(&mut self, peer: &PeerId, path: &str, value: Value) -> Result<()> {
        self.elements.change(peer, path, value, &mut self.fetches)
    }

    /// Start a full fetch.
    pub fn fetch(&mut self, peer: &PeerId, params: FetchParams) -> Result<()> {
        let id = params.id.clone();
        self.fetches.fetch(peer, params, &self.elements)?;
        if let Some(fetcher) = self.peers.get_peer_mut(peer) {
            fetcher.track_fetcher(&id);
        }
        Ok(())
    }

    /// Start the simple-mode fetch of everything.
    pub fn fetch_all(&mut self, peer: &PeerId) -> Result<()> {
        self.fetches.fetch_all(peer, &self.elements)?;
        if let Some(fetcher) = self.peers.get_peer_mut(peer) {
            fetcher.track_fetcher(FETCH_ALL_ID);
        }
        Ok(())
    }

    pub fn unfetch(&mut self, peer: &PeerId, id: &str) -> Result<()> {
        self.fetches.unfetch(peer, id)?;
        if let Some(fetcher) = self.peers.get_peer_mut(peer) {
            fetcher.untrack_fetcher(id);
        }
        Ok(())
    }

    /// Forward a `call`/`set` to the element's owner. With a `request_id`
    /// a route is opened and the requester is answered later, by the
    /// owner's response or by the route's timeout. Without one the message
    /// is forwarded as a notification.
    pub fn forward(
        &mut self,
        peer: &PeerId,
        request_id: Option<Value>,
        forward: Forward,
    ) -> Result<Option<RouteId>> {
        let element = self.elements.get(forward.path())?;
        match (&forward, element.access) {
            (Forward::Call { path, .. }, Access::State) => {
                return Err(JetError::InvalidParams(format!("{path} is a state, not a method")));
            }
            (Forward::Set { path, .. }, Access::Method) => {
                return Err(JetError::InvalidParams(format!("{path} is a method, not a state")));
            }
            _ => {}
        }
        let target = element.owner.clone();

        let route = request_id.map(|id| {
            let route = self.router.request(peer, id, &target, forward.path());
            if let Some(requester) = self.peers.get_peer_mut(peer) {
                requester.track_route(route);
            }
            route
        });

        let (path, params) = match forward {
            Forward::Call { path, args } => (path, args),
            Forward::Set {
                path,
                value,
                value_as_result,
            } => {
                let mut params = Map::new();
                params.insert("value".into(), value);
                if value_as_result {
                    params.insert("valueAsResult".into(), Value::Bool(true));
                }
                (path, Value::Object(params))
            }
        };
        let id = route.map(Value::from);
        self.peers
            .send(&target, Outbound::Message(message::request(id, &path, params)));
        Ok(route)
    }

    /// A peer answered a forwarded request.
    pub fn respond(
        &mut self,
        peer: &PeerId,
        id: &Value,
        outcome: std::result::Result<Value, Value>,
    ) {
        let Some(route) = id.as_u64() else {
            debug!("Ignoring response from {peer} with foreign id {id}");
            return;
        };
        if let Some(delivery) = self.router.resolve(route, peer, outcome) {
            self.deliver(delivery);
        }
    }

    /// A route's timeout fired.
    pub fn expire_route(&mut self, route: RouteId) {
        if let Some(delivery) = self.router.expire(route) {
            self.deliver(delivery);
        }
    }

    pub fn configure(&mut self, peer: &PeerId, params: ConfigParams) -> Result<()> {
        if let Some(encoding) = params.encoding {
            return Err(JetError::InvalidParams(format!(
                "unsupported encoding: {encoding}"
            )));
        }
        if let Some(name) = params.name {
            if let Some(named) = self.peers.get_peer_mut(peer) {
                debug!("Peer {peer} is now known as {name}");
                named.set_name(name);
            }
        }
        Ok(())
    }

    /// Queue a message for a peer.
    pub fn send(&mut self, peer: &PeerId, message: Outbound) {
        self.peers.send(peer, message);
    }

    /// Deliver every notification batch produced since the last flush.
    pub fn flush(&mut self) {
        for (peer, batch) in self.fetches.take_outbox() {
            self.peers.send(&peer, batch);
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        if let Some(requester) = self.peers.get_peer_mut(&delivery.to) {
            requester.untrack_route(delivery.route);
        }
        self.peers.send(&delivery.to, Outbound::Message(delivery.message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PEER_QUEUE_LEN;
    use crate::router::ManualTimeouts;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Client {
        id: PeerId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        /// Every message received so far, batches flattened.
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(outbound) = self.rx.try_recv() {
                out.extend(outbound.messages().iter().cloned());
            }
            out
        }
    }

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default(), Box::new(ManualTimeouts))
    }

    fn join(broker: &mut Broker, name: &str) -> Client {
        join_with_queue(broker, name, PEER_QUEUE_LEN)
    }

    fn join_with_queue(broker: &mut Broker, name: &str, capacity: usize) -> Client {
        let (tx, rx) = mpsc::channel(capacity);
        let id = PeerId::from_string(name);
        broker.connect(id.clone(), tx);
        Client { id, rx }
    }

    fn state(path: &str, value: Value) -> ElementDescriptor {
        ElementDescriptor {
            path: path.into(),
            value: Some(value),
            access: None,
        }
    }

    fn method(path: &str) -> ElementDescriptor {
        ElementDescriptor {
            path: path.into(),
            value: None,
            access: Some(Access::Method),
        }
    }

    fn fetch_params(value: Value) -> FetchParams {
        serde_json::from_value(value).unwrap()
    }

    fn events(messages: &[Value]) -> Vec<(String, String, Value)> {
        messages
            .iter()
            .map(|m| {
                (
                    m["params"]["event"].as_str().unwrap().to_string(),
                    m["params"]["path"].as_str().unwrap().to_string(),
                    m["params"]["index"].clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_light_scenario() {
        let mut broker = broker();
        let a = join(&mut broker, "a");
        let mut b = join(&mut broker, "b");

        broker.add(&a.id, state("light1", json!(false))).unwrap();
        broker
            .fetch(&b.id, fetch_params(json!({"id": "l", "path": {"startsWith": "light"}})))
            .unwrap();
        broker.flush();
        broker.change(&a.id, "light1", json!(true)).unwrap();
        broker.flush();

        let received = b.drain();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["params"], json!({"path": "light1", "value": false, "event": "add"}));
        assert_eq!(
            received[1]["params"],
            json!({"path": "light1", "value": true, "event": "change"})
        );
        assert_eq!(broker.elements().get("light1").unwrap().value, Some(json!(true)));
    }

    #[test]
    fn test_sorted_window_scenario() {
        let mut broker = broker();
        let a = join(&mut broker, "a");
        let mut b = join(&mut broker, "b");
        for i in 1..=5 {
            broker.add(&a.id, state(&format!("v{i}"), json!(i))).unwrap();
        }
        let sort = json!({"id": "top", "sort": {"byValue": "number", "descending": true, "from": 0, "to": 2}});
        broker.fetch(&b.id, fetch_params(sort)).unwrap();
        broker.flush();
        assert_eq!(
            events(&b.drain()),
            vec![
                ("add".into(), "v5".into(), json!(0)),
                ("add".into(), "v4".into(), json!(1)),
                ("add".into(), "v3".into(), json!(2)),
            ]
        );

        broker.add(&a.id, state("v4.5", json!(4.5))).unwrap();
        broker.flush();
        let outbound = b.rx.try_recv().unwrap();
        // One mutation, one batch.
        assert!(matches!(outbound, Outbound::Batch(_)));
        assert_eq!(
            events(outbound.messages()),
            vec![
                ("remove".into(), "v3".into(), json!(2)),
                ("add".into(), "v4.5".into(), json!(1)),
                ("change".into(), "v4".into(), json!(2)),
            ]
        );
    }

    #[test]
    fn test_greet_call_and_reply() {
        let mut broker = broker();
        let mut a = join(&mut broker, "a");
        let mut b = join(&mut broker, "b");
        broker.add(&a.id, method("greet")).unwrap();

        let call = Forward::Call {
            path: "greet".into(),
            args: json!({"name": "bob"}),
        };
        let route = broker.forward(&b.id, Some(json!(1)), call).unwrap().unwrap();
        assert!(broker.peers().get_peer(&b.id).unwrap().routes().contains(&route));

        let forwarded = a.drain();
        assert_eq!(
            forwarded,
            vec![json!({"id": route, "method": "greet", "params": {"name": "bob"}})]
        );

        broker.respond(&a.id, &json!(route), Ok(json!("hi bob")));
        assert_eq!(b.drain(), vec![json!({"id": 1, "result": "hi bob"})]);
        assert!(broker.router().is_empty());
        assert!(broker.peers().get_peer(&b.id).unwrap().routes().is_empty());

        // A late duplicate is dropped.
        broker.respond(&a.id, &json!(route), Ok(json!("again")));
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_greet_timeout_then_late_reply() {
        let mut broker = broker();
        let mut a = join(&mut broker, "a");
        let mut b = join(&mut broker, "b");
        broker.add(&a.id, method("greet")).unwrap();

        let call = Forward::Call {
            path: "greet".into(),
            args: json!(["bob"]),
        };
        let route = broker.forward(&b.id, Some(json!("q")), call).unwrap().unwrap();
        a.drain();

        broker.expire_route(route);
        let reply = b.drain();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0]["id"], "q");
        assert_eq!(reply[0]["error"]["code"], crate::error::RESPONSE_TIMEOUT);

        broker.respond(&a.id, &json!(route), Ok(json!("too late")));
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_set_forwarding_shape() {
        let mut broker = broker();
        let mut a = join(&mut broker, "a");
        let b = join(&mut broker, "b");
        broker.add(&a.id, state("temp", json!(20))).unwrap();

        let set = Forward::Set {
            path: "temp".into(),
            value: json!(21),
            value_as_result: true,
        };
        assert!(broker.forward(&b.id, None, set).unwrap().is_none());
        assert_eq!(
            a.drain(),
            vec![json!({"method": "temp", "params": {"value": 21, "valueAsResult": true}})]
        );
        assert!(broker.router().is_empty());
    }

    #[test]
    fn test_forward_checks_access() {
        let mut broker = broker();
        let a = join(&mut broker, "a");
        broker.add(&a.id, state("temp", json!(20))).unwrap();
        broker.add(&a.id, method("greet")).unwrap();

        let call_state = Forward::Call {
            path: "temp".into(),
            args: Value::Null,
        };
        assert!(matches!(
            broker.forward(&a.id, Some(json!(1)), call_state),
            Err(JetError::InvalidParams(_))
        ));
        let set_method = Forward::Set {
            path: "greet".into(),
            value: json!(1),
            value_as_result: false,
        };
        assert!(broker.forward(&a.id, Some(json!(2)), set_method).is_err());
        let missing = Forward::Call {
            path: "nope".into(),
            args: Value::Null,
        };
        assert_eq!(
            broker.forward(&a.id, Some(json!(3)), missing).unwrap_err(),
            JetError::NotFound("nope".into())
        );
        assert!(broker.router().is_empty());
    }

    #[test]
    fn test_disconnect_cascade() {
        let mut broker = broker();
        let mut a = join(&mut broker, "a");
        let mut b = join(&mut broker, "b");
        let mut c = join(&mut broker, "c");

        broker.add(&a.id, state("light1", json!(true))).unwrap();
        broker.add(&a.id, method("greet")).unwrap();
        broker.add(&b.id, state("door", json!("open"))).unwrap();
        broker.fetch(&b.id, fetch_params(json!({"id": "all"}))).unwrap();
        broker.fetch(&a.id, fetch_params(json!({"id": "mine"}))).unwrap();
        broker.flush();
        let call = Forward::Call {
            path: "greet".into(),
            args: Value::Null,
        };
        broker.forward(&c.id, Some(json!(9)), call).unwrap();
        b.drain();
        a.drain();

        broker.disconnect(&a.id);

        // b saw a's elements disappear, c's pending call failed.
        let mut removed: Vec<_> = events(&b.drain())
            .into_iter()
            .map(|(event, path, _)| (event, path))
            .collect();
        removed.sort();
        assert_eq!(
            removed,
            vec![("remove".into(), "greet".into()), ("remove".into(), "light1".into())]
        );
        let failed = c.drain();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["id"], 9);
        assert_eq!(failed[0]["error"]["code"], crate::error::PEER_GONE);

        // a is gone with everything it owned; b's element is untouched.
        assert!(a.drain().is_empty());
        assert!(!broker.peers().contains(&a.id));
        assert_eq!(broker.elements().len(), 1);
        assert!(broker.elements().contains("door"));
        assert!(broker.fetches().get(&a.id, "mine").is_none());
        assert!(broker.router().is_empty());

        // Disconnecting twice is harmless.
        broker.disconnect(&a.id);
    }

    #[test]
    fn test_configure() {
        let mut broker = broker();
        let a = join(&mut broker, "a");
        let params = ConfigParams {
            name: Some("panel".into()),
            encoding: None,
        };
        broker.configure(&a.id, params).unwrap();
        assert_eq!(broker.peers().get_peer(&a.id).unwrap().name(), Some("panel"));

        let params = ConfigParams {
            name: None,
            encoding: Some("msgpack".into()),
        };
        assert!(matches!(
            broker.configure(&a.id, params),
            Err(JetError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_peer_tracking_follows_operations() {
        let mut broker = broker();
        let a = join(&mut broker, "a");
        broker.add(&a.id, state("x", json!(1))).unwrap();
        broker.fetch(&a.id, fetch_params(json!({"id": "f"}))).unwrap();
        let peer = broker.peers().get_peer(&a.id).unwrap();
        assert!(peer.elements().contains("x"));
        assert!(peer.fetchers().contains("f"));

        broker.remove(&a.id, "x").unwrap();
        broker.unfetch(&a.id, "f").unwrap();
        let peer = broker.peers().get_peer(&a.id).unwrap();
        assert!(peer.elements().is_empty());
        assert!(peer.fetchers().is_empty());
    }

    #[test]
    fn test_stalled_peer_is_disconnected() {
        let mut broker = broker();
        let mut a = join(&mut broker, "a");
        let mut slow = join_with_queue(&mut broker, "slow", 2);

        broker.add(&slow.id, state("slow/own", json!(0))).unwrap();
        broker.fetch(&a.id, fetch_params(json!({"id": "all"}))).unwrap();
        broker.fetch(&slow.id, fetch_params(json!({"id": "churn"}))).unwrap();
        broker.flush();
        a.drain();

        // slow never reads; churn overflows its queue.
        broker.add(&a.id, state("n", json!(0))).unwrap();
        for i in 1..10 {
            broker.change(&a.id, "n", json!(i)).unwrap();
            broker.flush();
        }
        assert!(broker.peers().contains(&slow.id));
        broker.drop_stalled();

        assert!(!broker.peers().contains(&slow.id));
        assert!(broker.fetches().get(&slow.id, "churn").is_none());
        assert!(!broker.elements().contains("slow/own"));
        // Other peers see the stalled peer's elements go away.
        let seen = events(&a.drain());
        assert_eq!(seen.last().unwrap().0, "remove");
        assert_eq!(seen.last().unwrap().1, "slow/own");

        // What was queued before the overflow is still readable, then the
        // queue is closed.
        assert_eq!(slow.drain().len(), 2);
        assert_eq!(slow.rx.try_recv(), Err(TryRecvError::Disconnected));

        // Nothing left to do.
        broker.drop_stalled();
        assert!(broker.peers().contains(&a.id));
    }
}
