//! Element registry: the path to element table.
//!
//! The registry is plain in-memory data. Every successful mutation is
//! reported synchronously to an [`ElementObserver`] while the registry is
//! still borrowed, so no other mutation can slip in between "apply the
//! change" and "re-evaluate subscriptions".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JetError, Result};
use crate::peer::PeerId;

static NULL: Value = Value::Null;

/// Whether an element holds a value or can be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    State,
    Method,
}

/// Params of an `add` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ElementDescriptor {
    pub path: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub access: Option<Access>,
}

/// A registered state or method.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub path: String,
    pub access: Access,
    /// Always `Some` for states, `None` for methods.
    pub value: Option<Value>,
    pub owner: PeerId,
}

impl Element {
    /// The element value, `null` for methods.
    pub fn value_or_null(&self) -> &Value {
        self.value.as_ref().unwrap_or(&NULL)
    }
}

/// A registry mutation, as seen by the observer.
#[derive(Debug, Clone, Copy)]
pub enum ElementEvent<'a> {
    /// A new element was added.
    Appeared(&'a Element),
    /// The element is about to be deleted; it still carries its final value.
    Disappeared(&'a Element),
    /// The element's value was replaced; `element` carries the new value.
    Changed { element: &'a Element, old: &'a Value },
}

impl<'a> ElementEvent<'a> {
    pub fn element(&self) -> &'a Element {
        match *self {
            Self::Appeared(element) | Self::Disappeared(element) => element,
            Self::Changed { element, .. } => element,
        }
    }
}

/// Receives every registry mutation.
pub trait ElementObserver {
    fn on_element_event(&mut self, event: ElementEvent<'_>, elements: &Elements);
}

/// An observer that ignores everything.
impl ElementObserver for () {
    fn on_element_event(&mut self, _event: ElementEvent<'_>, _elements: &Elements) {}
}

/// The element table. Paths iterate in ascending order.
#[derive(Debug, Default)]
pub struct Elements {
    table: BTreeMap<String, Element>,
}

impl Elements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new element owned by `owner`.
    pub fn add(
        &mut self,
        owner: &PeerId,
        descriptor: ElementDescriptor,
        observer: &mut impl ElementObserver,
    ) -> Result<()> {
        let ElementDescriptor {
            path,
            value,
            access,
        } = descriptor;

        if path.is_empty() {
            return Err(JetError::InvalidParams("path must not be empty".into()));
        }
        if self.table.contains_key(&path) {
            return Err(JetError::DuplicatePath(path));
        }
        let access = access.unwrap_or(Access::State);
        let value = match access {
            Access::State => Some(value.unwrap_or(Value::Null)),
            Access::Method if value.is_some() => {
                return Err(JetError::InvalidParams(format!(
                    "method {path} cannot carry a value"
                )));
            }
            Access::Method => None,
        };

        let element = Element {
            path: path.clone(),
            access,
            value,
            owner: owner.clone(),
        };
        self.table.insert(path.clone(), element);
        if let Some(element) = self.table.get(&path) {
            observer.on_element_event(ElementEvent::Appeared(element), self);
        }
        Ok(())
    }

    /// Remove an element. Only its owner may do so. The observer sees the
    /// element before it is deleted.
    pub fn remove(
        &mut self,
        peer: &PeerId,
        path: &str,
        observer: &mut impl ElementObserver,
    ) -> Result<Element> {
        {
            let element = self.owned(peer, path)?;
            observer.on_element_event(ElementEvent::Disappeared(element), self);
        }
        self.table
            .remove(path)
            .ok_or_else(|| JetError::NotFound(path.to_string()))
    }

    /// Replace a state's value. Only its owner may do so.
    pub fn change(
        &mut self,
        peer: &PeerId,
        path: &str,
        value: Value,
        observer: &mut impl ElementObserver,
    ) -> Result<()> {
        let element = self.owned_mut(peer, path)?;
        if element.access == Access::Method {
            return Err(JetError::InvalidParams(format!(
                "method {path} has no value to change"
            )));
        }
        let old = element.value.replace(value).unwrap_or(Value::Null);

        if let Some(element) = self.table.get(path) {
            observer.on_element_event(ElementEvent::Changed { element, old: &old }, self);
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<&Element> {
        self.table
            .get(path)
            .ok_or_else(|| JetError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.table.contains_key(path)
    }

    /// All elements in path order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.table.values()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn owned(&self, peer: &PeerId, path: &str) -> Result<&Element> {
        let element = self.get(path)?;
        if &element.owner != peer {
            return Err(JetError::NotOwner(path.to_string()));
        }
        Ok(element)
    }

    fn owned_mut(&mut self, peer: &PeerId, path: &str) -> Result<&mut Element> {
        let element = self
            .table
            .get_mut(path)
            .ok_or_else(|| JetError::NotFound(path.to_string()))?;
        if &element.owner != peer {
            return Err(JetError::NotOwner(path.to_string()));
        }
        Ok(element)
    }
}
