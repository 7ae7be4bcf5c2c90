//! Fetch engine. Owns every fetcher and re-evaluates them on registry events.

use std::collections::BTreeMap;

use tracing::debug;

use crate::element::{ElementEvent, ElementObserver, Elements};
use crate::error::{JetError, Result};
use crate::fetcher::{FetchId, FetchParams, Fetcher, Notification};
use crate::matcher::Matcher;
use crate::message::Outbound;
use crate::peer::PeerId;
use crate::sorter::Sorter;

/// Fetch id and reply result of the single fetcher installed in simple mode.
pub const FETCH_ALL_ID: &str = "fetch_all";

/// All live fetchers, keyed by `(owner, fetch id)`.
///
/// Notifications are not sent directly: they are queued per fetcher as one
/// [`Outbound`] batch and drained by the broker with [`take_outbox`] once the
/// triggering operation has replied.
///
/// [`take_outbox`]: FetchEngine::take_outbox
#[derive(Debug, Default)]
pub struct FetchEngine {
    fetchers: BTreeMap<(PeerId, FetchId), Fetcher>,
    outbox: Vec<(PeerId, Outbound)>,
}

impl FetchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fetcher from `fetch` params and queue its initial adds.
    pub fn fetch(&mut self, peer: &PeerId, params: FetchParams, elements: &Elements) -> Result<()> {
        let matcher = Matcher::from_params(&params.filter)?;
        let sorter = params.sort.as_ref().map(Sorter::from_params).transpose()?;
        self.install(peer, params.id, matcher, sorter, elements)
    }

    /// Install the unsorted "everything" fetcher used in simple mode.
    pub fn fetch_all(&mut self, peer: &PeerId, elements: &Elements) -> Result<()> {
        self.install(peer, FETCH_ALL_ID.to_string(), Matcher::Always, None, elements)
    }

    fn install(
        &mut self,
        peer: &PeerId,
        id: FetchId,
        matcher: Matcher,
        sorter: Option<Sorter>,
        elements: &Elements,
    ) -> Result<()> {
        let key = (peer.clone(), id);
        if self.fetchers.contains_key(&key) {
            return Err(JetError::AlreadyFetching(key.1));
        }

        let mut fetcher = Fetcher::new(key.1.clone(), peer.clone(), matcher, sorter);
        let initial = fetcher.prime(elements);
        debug!(
            "Peer {peer} fetching {} ({} initial matches)",
            key.1,
            fetcher.matched_len()
        );
        self.outbox.extend(package(&fetcher, initial));
        self.fetchers.insert(key, fetcher);
        Ok(())
    }

    /// Stop a fetch. Nothing more is queued for it afterwards.
    pub fn unfetch(&mut self, peer: &PeerId, id: &str) -> Result<Fetcher> {
        let fetcher = self
            .fetchers
            .remove(&(peer.clone(), id.to_string()))
            .ok_or_else(|| JetError::NotFetching(id.to_string()))?;
        debug!("Peer {peer} stopped fetching {id}");
        Ok(fetcher)
    }

    /// Drop every fetcher owned by `peer`, along with anything still queued
    /// for it. Returns the removed fetch ids.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<FetchId> {
        let ids: Vec<FetchId> = self
            .fetchers
            .keys()
            .filter(|(owner, _)| owner == peer)
            .map(|(_, id)| id.clone())
            .collect();
        for id in &ids {
            self.fetchers.remove(&(peer.clone(), id.clone()));
        }
        self.outbox.retain(|(to, _)| to != peer);
        ids
    }

    pub fn get(&self, peer: &PeerId, id: &str) -> Option<&Fetcher> {
        self.fetchers.get(&(peer.clone(), id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Hand over the queued notification batches, in the order they were produced.
    pub fn take_outbox(&mut self) -> Vec<(PeerId, Outbound)> {
        std::mem::take(&mut self.outbox)
    }
}

/// Turn one fetcher's notifications into a single delivery for its owner.
fn package(fetcher: &Fetcher, batch: Vec<Notification>) -> Option<(PeerId, Outbound)> {
    if batch.is_empty() {
        return None;
    }
    let messages = batch
        .iter()
        .map(|notification| notification.to_message(fetcher.id()))
        .collect();
    Some((fetcher.owner().clone(), Outbound::from_messages(messages)))
}

impl ElementObserver for FetchEngine {
    fn on_element_event(&mut self, event: ElementEvent<'_>, elements: &Elements) {
        let Self { fetchers, outbox } = self;
        for fetcher in fetchers.values_mut() {
            let batch = fetcher.on_event(event, elements);
            outbox.extend(package(fetcher, batch));
        }
    }
}
