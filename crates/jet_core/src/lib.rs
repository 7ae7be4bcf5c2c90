//! Jet Core: the in-memory state of a jet publish/subscribe broker.
//!
//! Peers register *elements* (states carrying a JSON value, or methods that
//! can be invoked) under unique paths, and *fetch* live views of the
//! elements matching a predicate, optionally sorted into a bounded window.
//! `call` and `set` requests are forwarded to the owning peer and the reply
//! is routed back to the requester, with a timeout.
//!
//! # Architecture
//!
//! - **Registry**: [`element::Elements`], the path → element table. Every
//!   mutation is reported synchronously to one observer.
//! - **Fetch engine**: [`fetch::FetchEngine`], the observer. Keeps each
//!   [`fetcher::Fetcher`] incrementally up to date and batches its
//!   notifications per mutation.
//! - **Router**: [`router::Router`], pending forwarded requests with
//!   cancellable timeouts.
//! - **Broker**: [`broker::Broker`] ties the above to the peer table;
//!   [`dispatch`] maps JSON-RPC-like messages onto its operations.
//! - **Service**: [`service::spawn`] runs the broker in a single tokio task.
//!   Transports talk to it through a [`BrokerHandle`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use jet_core::{BrokerConfig, PEER_QUEUE_LEN, service};
//! use serde_json::json;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> jet_core::Result<()> {
//! let (broker, _task) = service::spawn(BrokerConfig::default());
//!
//! let (tx, mut rx) = mpsc::channel(PEER_QUEUE_LEN);
//! let peer = broker.connect(tx).await?;
//! broker
//!     .inbound(&peer, json!({"id": 1, "method": "add", "params": {"path": "light1", "value": false}}))
//!     .await?;
//! let reply = rx.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod fetch;
pub mod fetcher;
pub mod info;
pub mod matcher;
pub mod message;
pub mod peer;
pub mod router;
pub mod service;
pub mod sorter;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use broker::Broker;
pub use config::{BrokerConfig, FetchMode};
pub use element::{Access, Element, ElementDescriptor, Elements};
pub use error::{JetError, Result};
pub use message::{Inbound, Outbound};
pub use peer::{PEER_QUEUE_LEN, PeerId, PeerSender};
pub use service::{BrokerHandle, Command};
