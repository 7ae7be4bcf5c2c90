//! Fetchers. Each is one peer's live view of the elements matching a predicate.
//!
//! An unsorted fetcher tracks the set of matching paths. A sorted fetcher
//! keeps the rank of *every* match, not only the windowed ones, so that an
//! eviction or a removal can promote the next element without rescanning the
//! registry. After each event the window is recomputed from the ranking and
//! diffed against the previous one; the diff is the notification batch.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::element::{Element, ElementEvent, Elements};
use crate::matcher::{MatchParams, Matcher};
use crate::message;
use crate::peer::PeerId;
use crate::sorter::{Rank, SortParams, Sorter};

/// Identifier chosen by the fetching peer, unique per peer.
pub type FetchId = String;

/// Params of a `fetch` request.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchParams {
    pub id: FetchId,
    #[serde(flatten)]
    pub filter: MatchParams,
    #[serde(default)]
    pub sort: Option<SortParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchEvent {
    Add,
    Remove,
    Change,
}

/// Params of one fetch notification. `index` is only set for sorted fetches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub event: FetchEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl Notification {
    fn of(event: FetchEvent, element: &Element, index: Option<usize>) -> Self {
        Self {
            path: element.path.clone(),
            value: element.value.clone(),
            event,
            index,
        }
    }

    /// The `{method: <fetch id>, params}` message delivered to the fetching peer.
    pub fn to_message(&self, fetch_id: &str) -> Value {
        message::request(None, fetch_id, serde_json::to_value(self).unwrap_or_default())
    }
}

/// A live subscription.
#[derive(Debug)]
pub struct Fetcher {
    id: FetchId,
    owner: PeerId,
    matcher: Matcher,
    view: View,
}

#[derive(Debug)]
enum View {
    Unsorted { matched: BTreeSet<String> },
    Sorted(SortedView),
}

#[derive(Debug)]
struct SortedView {
    sorter: Sorter,
    ranked: BTreeSet<Rank>,
    ranks: HashMap<String, Rank>,
    /// Paths currently reported, in window order.
    window: Vec<String>,
}

impl Fetcher {
    pub fn new(id: FetchId, owner: PeerId, matcher: Matcher, sorter: Option<Sorter>) -> Self {
        let view = match sorter {
            None => View::Unsorted {
                matched: BTreeSet::new(),
            },
            Some(sorter) => View::Sorted(SortedView {
                sorter,
                ranked: BTreeSet::new(),
                ranks: HashMap::new(),
                window: Vec::new(),
            }),
        };
        Self {
            id,
            owner,
            matcher,
            view,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    /// Number of currently matching elements, windowed or not.
    pub fn matched_len(&self) -> usize {
        match &self.view {
            View::Unsorted { matched } => matched.len(),
            View::Sorted(view) => view.ranks.len(),
        }
    }

    /// The reported window of a sorted fetch.
    pub fn window(&self) -> Option<&[String]> {
        match &self.view {
            View::Unsorted { .. } => None,
            View::Sorted(view) => Some(&view.window),
        }
    }

    /// Evaluate the matcher against the whole registry and return the
    /// initial `add` notifications.
    pub fn prime(&mut self, elements: &Elements) -> Vec<Notification> {
        let Self { matcher, view, .. } = self;
        match view {
            View::Unsorted { matched } => elements
                .iter()
                .filter(|element| matcher.matches_element(element))
                .map(|element| {
                    matched.insert(element.path.clone());
                    Notification::of(FetchEvent::Add, element, None)
                })
                .collect(),
            View::Sorted(view) => {
                for element in elements.iter().filter(|e| matcher.matches_element(e)) {
                    view.insert(element);
                }
                view.refresh(elements, None)
            }
        }
    }

    /// React to one registry mutation. Returns this fetcher's batch, which
    /// is empty when the element is of no interest.
    pub fn on_event(&mut self, event: ElementEvent<'_>, elements: &Elements) -> Vec<Notification> {
        let Self { matcher, view, .. } = self;
        match view {
            View::Unsorted { matched } => unsorted_event(matcher, matched, event),
            View::Sorted(view) => {
                let element = event.element();
                match event {
                    ElementEvent::Appeared(_) => {
                        if !matcher.matches_element(element) {
                            return Vec::new();
                        }
                        view.insert(element);
                    }
                    ElementEvent::Disappeared(_) => {
                        if !view.remove(&element.path) {
                            return Vec::new();
                        }
                    }
                    ElementEvent::Changed { .. } => {
                        let was = view.remove(&element.path);
                        let now = matcher.matches_element(element);
                        if now {
                            view.insert(element);
                        }
                        if !was && !now {
                            return Vec::new();
                        }
                    }
                }
                view.refresh(elements, Some(element.path.as_str()))
            }
        }
    }
}

fn unsorted_event(
    matcher: &Matcher,
    matched: &mut BTreeSet<String>,
    event: ElementEvent<'_>,
) -> Vec<Notification> {
    let element = event.element();
    let event = match event {
        ElementEvent::Appeared(_) if matcher.matches_element(element) => {
            matched.insert(element.path.clone());
            FetchEvent::Add
        }
        ElementEvent::Appeared(_) => return Vec::new(),
        ElementEvent::Disappeared(_) if matched.remove(&element.path) => FetchEvent::Remove,
        ElementEvent::Disappeared(_) => return Vec::new(),
        ElementEvent::Changed { .. } => {
            let was = matched.contains(&element.path);
            match (was, matcher.matches_element(element)) {
                (false, false) => return Vec::new(),
                (false, true) => {
                    matched.insert(element.path.clone());
                    FetchEvent::Add
                }
                (true, false) => {
                    matched.remove(&element.path);
                    FetchEvent::Remove
                }
                (true, true) => FetchEvent::Change,
            }
        }
    };
    vec![Notification::of(event, element, None)]
}

impl SortedView {
    fn insert(&mut self, element: &Element) {
        let rank = self.sorter.rank(&element.path, element.value.as_ref());
        self.ranked.insert(rank.clone());
        self.ranks.insert(element.path.clone(), rank);
    }

    fn remove(&mut self, path: &str) -> bool {
        match self.ranks.remove(path) {
            Some(rank) => {
                self.ranked.remove(&rank);
                true
            }
            None => false,
        }
    }

    /// Recompute the window and diff it against the reported one: removes
    /// first (at their old index), then adds and moves in window order.
    /// `changed` also gets a `change` if its value changed in place.
    fn refresh(&mut self, elements: &Elements, changed: Option<&str>) -> Vec<Notification> {
        let from = self.sorter.from;
        let window: Vec<String> = self
            .ranked
            .iter()
            .skip(from)
            .take(self.sorter.window_len())
            .map(|rank| rank.path.clone())
            .collect();

        let mut batch = Vec::new();
        {
            let before: HashMap<&str, usize> = self
                .window
                .iter()
                .enumerate()
                .map(|(i, path)| (path.as_str(), i))
                .collect();
            let after: HashSet<&str> = window.iter().map(String::as_str).collect();

            for (i, path) in self.window.iter().enumerate() {
                if !after.contains(path.as_str()) {
                    batch.push(notify(elements, FetchEvent::Remove, path, from + i));
                }
            }
            for (i, path) in window.iter().enumerate() {
                let event = match before.get(path.as_str()) {
                    None => FetchEvent::Add,
                    Some(&old) if old != i => FetchEvent::Change,
                    Some(_) if changed == Some(path.as_str()) => FetchEvent::Change,
                    Some(_) => continue,
                };
                batch.push(notify(elements, event, path, from + i));
            }
        }
        self.window = window;
        batch
    }
}

/// Build a windowed notification. Windowed paths are always registered:
/// removals are diffed while the element is still in the registry.
fn notify(elements: &Elements, event: FetchEvent, path: &str, index: usize) -> Notification {
    let value = elements.get(path).ok().and_then(|e| e.value.clone());
    debug_assert!(elements.contains(path), "windowed path {path} is not registered");
    Notification {
        path: path.to_string(),
        value,
        event,
        index: Some(index),
    }
}
