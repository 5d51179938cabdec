//! Message model shared by every bus.
//!
//! A message is any serde-serializable struct carrying a globally unique
//! [`TypeTag`]. The tag routes the message (it is the request topic) and keys
//! the [`TypeRegistry`](crate::TypeRegistry) used to rebuild the value on the
//! receiving side.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Suffix appended to a request's type tag to form its reply topic.
pub const REPLY_SUFFIX: &str = "-Response";

/// Namespace-qualified name of a message type.
///
/// Doubles as the broker topic for requests of that type. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    /// Borrow the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic on which replies to requests of this type are published.
    ///
    /// Both ends of an exchange derive it the same way; it is not
    /// configurable per call.
    pub fn reply_topic(&self) -> String {
        format!("{}{REPLY_SUFFIX}", self.0)
    }
}

impl<T> From<T> for TypeTag
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        TypeTag(value.into())
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value that can travel inside an [`Envelope`](crate::Envelope).
///
/// The serialized form must be a JSON object: its fields become the
/// envelope's parameter map.
///
/// ```
/// use mom_cqrs::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct ExampleCommand {
///     parameter_one: String,
/// }
///
/// impl Message for ExampleCommand {
///     const TYPE_TAG: &'static str = "example.command.ExampleCommand";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Globally unique, namespace-qualified name of this type.
    const TYPE_TAG: &'static str;

    /// The tag as a [`TypeTag`].
    fn type_tag() -> TypeTag {
        TypeTag::from(Self::TYPE_TAG)
    }
}

/// A fire-and-forget intent.
pub trait Command: Message {}

/// A request expecting exactly one correlated response.
pub trait Query: Message {
    /// The value produced by the query's handler.
    type Response: Message;
}
