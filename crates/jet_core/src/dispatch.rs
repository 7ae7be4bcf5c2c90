//! Inbound message dispatch: decode, execute against the broker, reply.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{Broker, ConfigParams, Forward};
use crate::config::FetchMode;
use crate::error::{JetError, Result};
use crate::fetch::FETCH_ALL_ID;
use crate::message::{self, Inbound, Outbound};
use crate::peer::PeerId;

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ChangeParams {
    path: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct UnfetchParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    path: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetParams {
    path: String,
    value: Value,
    #[serde(default)]
    value_as_result: bool,
}

/// Handle one decoded transport frame from `peer`. A JSON array is a batch
/// whose members are handled in order.
pub fn handle(broker: &mut Broker, peer: &PeerId, raw: Value) {
    match raw {
        Value::Array(batch) => {
            for raw in batch {
                handle_one(broker, peer, raw);
            }
        }
        raw => handle_one(broker, peer, raw),
    }
}

fn handle_one(broker: &mut Broker, peer: &PeerId, raw: Value) {
    let id = Inbound::peek_id(&raw);
    let inbound = match Inbound::parse(raw) {
        Ok(inbound) => inbound,
        Err(e) => {
            match id {
                Some(id) => broker.send(peer, Outbound::Message(message::error_reply(id, &e))),
                None => warn!("Dropping malformed message from {peer}: {e}"),
            }
            return;
        }
    };

    match inbound {
        Inbound::Response { id, outcome } => broker.respond(peer, &id, outcome),
        Inbound::Request { id, method, params } => {
            match execute(broker, peer, &method, params, Some(&id)) {
                Ok(Some(result)) => {
                    broker.send(peer, Outbound::Message(message::result_reply(id, result)));
                }
                // Routed: the reply comes from the route.
                Ok(None) => {}
                Err(e) => {
                    debug!("{method} from {peer} failed: {e}");
                    broker.send(peer, Outbound::Message(message::error_reply(id, &e)));
                }
            }
        }
        Inbound::Notification { method, params } => {
            if let Err(e) = execute(broker, peer, &method, params, None) {
                warn!("Notification {method} from {peer} failed: {e}");
            }
        }
    }
    // Notifications caused by this message follow its reply.
    broker.flush();
}

/// Run one method. `Ok(None)` means the reply is deferred to a route.
fn execute(
    broker: &mut Broker,
    peer: &PeerId,
    method: &str,
    params: Value,
    id: Option<&Value>,
) -> Result<Option<Value>> {
    let done = Ok(Some(Value::Bool(true)));
    match method {
        "add" => {
            broker.add(peer, parse(params)?)?;
            done
        }
        "remove" => {
            let PathParams { path } = parse(params)?;
            broker.remove(peer, &path)?;
            done
        }
        "change" => {
            let ChangeParams { path, value } = parse(params)?;
            broker.change(peer, &path, value)?;
            done
        }
        "fetch" => match broker.config().fetch {
            FetchMode::Full => {
                broker.fetch(peer, parse(params)?)?;
                done
            }
            FetchMode::Simple => {
                broker.fetch_all(peer)?;
                Ok(Some(Value::from(FETCH_ALL_ID)))
            }
        },
        "unfetch" => {
            let id = match broker.config().fetch {
                FetchMode::Full => parse::<UnfetchParams>(params)?.id,
                FetchMode::Simple => FETCH_ALL_ID.to_string(),
            };
            broker.unfetch(peer, &id)?;
            done
        }
        "call" => {
            let CallParams { path, args } = parse(params)?;
            broker.forward(peer, id.cloned(), Forward::Call { path, args })?;
            Ok(None)
        }
        "set" => {
            let SetParams {
                path,
                value,
                value_as_result,
            } = parse(params)?;
            let set = Forward::Set {
                path,
                value,
                value_as_result,
            };
            broker.forward(peer, id.cloned(), set)?;
            Ok(None)
        }
        "info" => Ok(Some(serde_json::to_value(broker.info()).unwrap_or_default())),
        "echo" => Ok(Some(params)),
        "config" => {
            let params: ConfigParams = if params.is_null() {
                ConfigParams::default()
            } else {
                parse(params)?
            };
            broker.configure(peer, params)?;
            done
        }
        other => Err(JetError::MethodNotFound(other.to_string())),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| JetError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::error;
    use crate::peer::PEER_QUEUE_LEN;
    use crate::router::ManualTimeouts;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        id: PeerId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(outbound) = self.rx.try_recv() {
                out.extend(outbound.messages().iter().cloned());
            }
            out
        }
    }

    fn join(broker: &mut Broker, name: &str) -> Client {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_LEN);
        let id = PeerId::from_string(name);
        broker.connect(id.clone(), tx);
        Client { id, rx }
    }

    fn setup(config: BrokerConfig) -> (Broker, Client, Client) {
        let mut broker = Broker::new(config, Box::new(ManualTimeouts));
        let a = join(&mut broker, "a");
        let b = join(&mut broker, "b");
        (broker, a, b)
    }

    #[test]
    fn test_request_gets_exactly_one_reply() {
        let (mut broker, mut a, _b) = setup(BrokerConfig::default());
        handle(
            &mut broker,
            &a.id,
            json!({"id": 1, "method": "add", "params": {"path": "x", "value": 1}}),
        );
        assert_eq!(a.drain(), vec![json!({"id": 1, "result": true})]);

        handle(
            &mut broker,
            &a.id,
            json!({"id": 2, "method": "add", "params": {"path": "x", "value": 1}}),
        );
        let reply = a.drain();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0]["error"]["code"], error::INVALID_PARAMS);
        assert_eq!(reply[0]["error"]["data"], json!({"pathAlreadyExists": "x"}));
    }

    #[test]
    fn test_notifications_are_never_answered() {
        let (mut broker, mut a, _b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "x"}}));
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "x"}}));
        handle(&mut broker, &a.id, json!({"method": "bogus"}));
        assert!(a.drain().is_empty());
        assert!(broker.elements().contains("x"));
    }

    #[test]
    fn test_unknown_method_and_bad_params() {
        let (mut broker, mut a, _b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"id": 1, "method": "bogus"}));
        handle(&mut broker, &a.id, json!({"id": 2, "method": "change", "params": {"value": 1}}));
        handle(&mut broker, &a.id, json!({"id": 3, "method": 7}));
        handle(&mut broker, &a.id, json!({"no": "id"}));

        let replies = a.drain();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["error"]["code"], error::METHOD_NOT_FOUND);
        assert_eq!(replies[1]["error"]["code"], error::INVALID_PARAMS);
        assert_eq!(replies[2]["id"], 3);
        assert_eq!(replies[2]["error"]["code"], error::INVALID_REQUEST);
    }

    #[test]
    fn test_batch_handled_in_order() {
        let (mut broker, mut a, _b) = setup(BrokerConfig::default());
        handle(
            &mut broker,
            &a.id,
            json!([
                {"id": 1, "method": "add", "params": {"path": "n", "value": 1}},
                {"id": 2, "method": "change", "params": {"path": "n", "value": 2}},
                {"id": 3, "method": "remove", "params": {"path": "n"}},
                {"id": 4, "method": "remove", "params": {"path": "n"}}
            ]),
        );
        let replies = a.drain();
        let ids: Vec<_> = replies.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(replies[3]["error"]["data"], json!({"pathNotExists": "n"}));
    }

    #[test]
    fn test_fetch_reply_precedes_notifications() {
        let (mut broker, mut a, mut b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "light1", "value": false}}));
        handle(
            &mut broker,
            &b.id,
            json!({"id": 5, "method": "fetch", "params": {"id": "lights", "path": {"startsWith": "light"}}}),
        );
        handle(
            &mut broker,
            &a.id,
            json!({"id": 6, "method": "change", "params": {"path": "light1", "value": true}}),
        );

        assert_eq!(a.drain(), vec![json!({"id": 6, "result": true})]);
        assert_eq!(
            b.drain(),
            vec![
                json!({"id": 5, "result": true}),
                json!({"method": "lights", "params": {"path": "light1", "value": false, "event": "add"}}),
                json!({"method": "lights", "params": {"path": "light1", "value": true, "event": "change"}}),
            ]
        );

        handle(&mut broker, &b.id, json!({"id": 7, "method": "unfetch", "params": {"id": "lights"}}));
        handle(&mut broker, &b.id, json!({"id": 8, "method": "unfetch", "params": {"id": "lights"}}));
        let replies = b.drain();
        assert_eq!(replies[0], json!({"id": 7, "result": true}));
        assert_eq!(replies[1]["error"]["data"], json!({"notFetching": "lights"}));
    }

    #[test]
    fn test_call_routes_reply_with_original_id() {
        let (mut broker, mut a, mut b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "greet", "access": "method"}}));
        handle(
            &mut broker,
            &b.id,
            json!({"id": "q1", "method": "call", "params": {"path": "greet", "args": {"name": "bob"}}}),
        );
        assert!(b.drain().is_empty());

        let forwarded = a.drain();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["method"], "greet");
        let route = forwarded[0]["id"].clone();

        handle(&mut broker, &a.id, json!({"id": route, "result": "hi bob"}));
        assert_eq!(b.drain(), vec![json!({"id": "q1", "result": "hi bob"})]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_set_error_is_forwarded() {
        let (mut broker, mut a, mut b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "temp", "value": 20}}));
        handle(
            &mut broker,
            &b.id,
            json!({"id": 1, "method": "set", "params": {"path": "temp", "value": 99}}),
        );
        let forwarded = a.drain();
        assert_eq!(forwarded[0]["params"], json!({"value": 99}));

        let route = forwarded[0]["id"].clone();
        handle(&mut broker, &a.id, json!({"id": route, "error": "out of range"}));
        let reply = b.drain();
        assert_eq!(reply[0]["error"]["code"], error::HANDLER_FAILURE);
        assert_eq!(reply[0]["error"]["data"], "out of range");
    }

    #[test]
    fn test_boundary_methods() {
        let (mut broker, mut a, _b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"id": 1, "method": "info"}));
        handle(&mut broker, &a.id, json!({"id": 2, "method": "echo", "params": {"ping": [1, 2]}}));
        handle(&mut broker, &a.id, json!({"id": 3, "method": "config", "params": {"name": "panel"}}));
        handle(&mut broker, &a.id, json!({"id": 4, "method": "config", "params": {"encoding": "msgpack"}}));

        let replies = a.drain();
        assert_eq!(replies[0]["result"]["protocolVersion"], 2);
        assert_eq!(replies[0]["result"]["features"]["fetch"], "full");
        assert_eq!(replies[1]["result"], json!({"ping": [1, 2]}));
        assert_eq!(replies[2]["result"], true);
        assert_eq!(broker.peers().get_peer(&a.id).unwrap().name(), Some("panel"));
        assert_eq!(replies[3]["error"]["code"], error::INVALID_PARAMS);
    }

    #[test]
    fn test_simple_fetch_mode() {
        let config = BrokerConfig {
            fetch: FetchMode::Simple,
            ..BrokerConfig::default()
        };
        let (mut broker, mut a, mut b) = setup(config);
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "x", "value": 1}}));
        handle(&mut broker, &b.id, json!({"id": 1, "method": "fetch", "params": {"id": "ignored"}}));
        handle(&mut broker, &b.id, json!({"id": 2, "method": "fetch"}));

        let replies = b.drain();
        assert_eq!(replies[0], json!({"id": 1, "result": "fetch_all"}));
        assert_eq!(replies[1]["params"], json!({"path": "x", "value": 1, "event": "add"}));
        assert_eq!(replies[1]["method"], "fetch_all");
        assert_eq!(replies[2]["error"]["data"], json!({"alreadyFetching": "fetch_all"}));

        handle(&mut broker, &b.id, json!({"id": 3, "method": "unfetch"}));
        handle(&mut broker, &b.id, json!({"id": 4, "method": "unfetch"}));
        let replies = b.drain();
        assert_eq!(replies[0]["result"], true);
        assert_eq!(replies[1]["error"]["code"], error::INVALID_PARAMS);
        a.drain();
    }

    #[test]
    fn test_out_of_range_window_is_rejected() {
        let (mut broker, mut a, mut b) = setup(BrokerConfig::default());
        handle(&mut broker, &a.id, json!({"method": "add", "params": {"path": "x", "value": 1}}));
        handle(
            &mut broker,
            &b.id,
            json!({"id": 1, "method": "fetch", "params": {"id": "f", "sort": {"from": 0, "to": u64::MAX}}}),
        );
        handle(
            &mut broker,
            &b.id,
            json!({"id": 2, "method": "fetch", "params": {"id": "g", "sort": {"from": u64::MAX}}}),
        );

        let replies = b.drain();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["error"]["code"], error::INVALID_PARAMS);
        assert_eq!(replies[1]["id"], 2);
        assert_eq!(replies[1]["error"]["code"], error::INVALID_PARAMS);
        assert!(broker.fetches().is_empty());

        // The broker keeps serving afterwards.
        handle(
            &mut broker,
            &b.id,
            json!({"id": 3, "method": "fetch", "params": {"id": "f", "sort": {"from": 0, "to": 4}}}),
        );
        let replies = b.drain();
        assert_eq!(replies[0], json!({"id": 3, "result": true}));
        assert_eq!(replies[1]["params"], json!({"path": "x", "value": 1, "event": "add", "index": 0}));
        a.drain();
    }
}
