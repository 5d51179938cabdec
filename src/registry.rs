//! Type registry: rebuilds typed values from envelopes.
//!
//! Each module that defines a message type registers it once at startup;
//! buses register their handler's request and response types automatically.

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::envelope::rebuild;
use crate::lock::{read_ignore_poison, write_ignore_poison};
use crate::{
    // ---
    BusError,
    Envelope,
    Message,
    Parameters,
    Result,
    TypeTag,
};

/// A reconstructed message whose concrete type is known only at run time.
pub type AnyMessage = Box<dyn Any + Send>;

type Factory = fn(&Parameters) -> Result<AnyMessage>;

fn factory<M: Message>(parameters: &Parameters) -> Result<AnyMessage> {
    rebuild::<M>(parameters).map(|m| Box::new(m) as AnyMessage)
}

/// Mapping from type tag to a factory that rebuilds that type.
#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<TypeTag, Factory>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under its tag.
    ///
    /// Registering the same type again is a no-op, so every bus may register
    /// the types it touches without coordination.
    pub fn register<M: Message>(&self) {
        // ---
        write_ignore_poison(&self.factories)
            .entry(M::type_tag())
            .or_insert(factory::<M>);
    }

    pub fn contains(&self, tag: &TypeTag) -> bool {
        read_ignore_poison(&self.factories).contains_key(tag)
    }

    /// Rebuild the value an envelope carries.
    ///
    /// # Errors
    ///
    /// [`BusError::UnknownType`] if the tag was never registered, or
    /// [`BusError::InvalidParameters`] if the parameters do not fit the type.
    pub fn to_request(&self, envelope: &Envelope) -> Result<AnyMessage> {
        // ---
        let factory = read_ignore_poison(&self.factories)
            .get(envelope.type_tag())
            .copied()
            .ok_or_else(|| BusError::UnknownType(envelope.type_tag().clone()))?;

        factory(envelope.parameters())
    }

    /// Rebuild and downcast in one step.
    pub fn to_typed<M: Message>(&self, envelope: &Envelope) -> Result<M> {
        // ---
        downcast::<M>(self.to_request(envelope)?, envelope.type_tag())
    }
}

/// Recover the concrete type of a registry-built value.
pub(crate) fn downcast<M: Message>(value: AnyMessage, found: &TypeTag) -> Result<M> {
    // ---
    value
        .downcast::<M>()
        .map(|boxed| *boxed)
        .map_err(|_| BusError::TypeMismatch {
            expected: M::type_tag(),
            found: found.clone(),
        })
}
