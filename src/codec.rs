//! Contains the [`Codec`] trait used to translate Domain Events to and from
//! their opaque encoded form, plus a JSON implementation built on `serde`.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{EventData, RawEvent};

/// Gives a Domain Event its wire-level type name.
///
/// The name should ideally be unique within the domain you are operating in,
/// e.g. `"OrderWasPlaced"`. Backends persist it next to the payload and
/// compaction predicates may dispatch on it.
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

/// A [`Codec`] translates Domain Events into the opaque encoded form stored
/// by a [Backend][crate::store::Backend], and back.
///
/// Decoding is tolerant: an event this codec does not understand yields
/// `None` and is skipped by the load path, so that streams can carry foreign
/// or retired event types.
pub trait Codec<E>: Send + Sync {
    /// Encodes the given event into its persistable form.
    fn encode(&self, event: &E) -> EventData;

    /// Decodes an event from its encoded form, persisted or not.
    fn try_decode(&self, raw: RawEvent<'_>) -> Option<E>;
}

/// JSON [`Codec`] implementation for any `serde`-enabled event type.
#[derive(Debug, Clone, Copy)]
pub struct Json<E>(PhantomData<E>);

impl<E> Default for Json<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E> Codec<E> for Json<E>
where
    E: EventType + Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, event: &E) -> EventData {
        let data = serde_json::to_vec(event).expect("serialize domain event to JSON");

        EventData::new(event.event_type(), data)
    }

    fn try_decode(&self, raw: RawEvent<'_>) -> Option<E> {
        serde_json::from_slice(raw.data).ok()
    }
}
