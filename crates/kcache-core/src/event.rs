use std::fmt;
use std::sync::Arc;

use strum::{Display, EnumString};

use crate::object::Object;

/// Kind of state transition, as seen by one particular cache.
///
/// The same upstream change may be an `Update` in one view and a
/// `Create` or `Delete` in a filtered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// One observed transition of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventType,
    pub object: Arc<Object>,
}

impl Event {
    pub fn new(kind: EventType, object: Arc<Object>) -> Self {
        Self { kind, object }
    }

    pub fn create(object: Arc<Object>) -> Self {
        Self::new(EventType::Create, object)
    }

    pub fn update(object: Arc<Object>) -> Self {
        Self::new(EventType::Update, object)
    }

    pub fn delete(object: Arc<Object>) -> Self {
        Self::new(EventType::Delete, object)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}@{}",
            self.kind,
            self.object.namespace(),
            self.object.name(),
            self.object.resource_version()
        )
    }
}
