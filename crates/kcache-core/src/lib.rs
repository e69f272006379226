// kcache-core: Incrementally synchronized object cache over a list + watch upstream.
//
// A `Controller` keeps a local, versioned copy of one remote collection
// by combining periodic full lists with a live watch, and fans the
// resulting create/update/delete events out to subscribers. Derived
// views (filtered subscriptions, cloned publishers, monitors) all build
// on the same `Publisher` capability.

mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod filter;
mod lister;
pub mod monitor;
pub mod nsname;
pub mod object;
pub mod publisher;
pub mod signal;
pub mod subscription;
mod watch;

#[cfg(test)]
mod testutil;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::CacheReader;
pub use client::{Client, ClientError, ListOptions, Status, WatchEvent, WatchStream, watch_channel};
pub use config::{ControllerConfig, ReconnectConfig};
pub use controller::{Controller, ControllerBuilder, ControllerState};
pub use error::CoreError;
pub use event::{Event, EventType};
pub use filter::{Filter, FilterFn, LabelSelector, LabelSelectorRequirement, SelectorOperator};
pub use monitor::{FnHandler, Handler, HandlerBuilder, Monitor};
pub use nsname::{InvalidNsName, NsName};
pub use object::{Object, ObjectList, ObjectMeta, parse_version};
pub use publisher::{FilterPublisher, Publisher, SubscriptionPublisher};
pub use signal::Signal;
pub use subscription::{EventSource, FilterSubscription, Subscription, SubscriptionId};
