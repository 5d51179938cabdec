use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::lock::{read_ignore_poison, write_ignore_poison};
use crate::registry::{downcast, AnyMessage};
use crate::{
    // ---
    BusError,
    Command,
    Envelope,
    Query,
    Result,
    TypeTag,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased async handler function
///
/// Takes the registry-rebuilt request plus the envelope it arrived in and
/// yields the reply envelope, if the bus kind produces one. Command
/// handlers always yield `None`; query handlers yield the response wrapped
/// with the request's correlation id.
///
/// Wrapped in Arc for cheap cloning out of the registry lock.
pub(crate) type BoxedHandler = Arc<dyn Fn(AnyMessage, &Envelope) -> HandlerFuture + Send + Sync>;

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Option<Envelope>>>;

/// Wrap a typed command handler into a type-erased handler
pub(crate) fn wrap_command_handler<C, F, Fut>(handler: F) -> BoxedHandler
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    // ---
    Arc::new(move |request: AnyMessage, envelope: &Envelope| -> HandlerFuture {
        let command = match downcast::<C>(request, envelope.type_tag()) {
            Ok(c) => c,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = handler(command);
        Box::pin(async move {
            fut.await?;
            Ok::<_, BusError>(None)
        })
    })
}

/// Wrap a typed query handler into a type-erased handler
pub(crate) fn wrap_query_handler<Q, F, Fut>(handler: F) -> BoxedHandler
where
    Q: Query,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Q::Response>> + Send + 'static,
{
    // ---
    Arc::new(move |request: AnyMessage, envelope: &Envelope| -> HandlerFuture {
        let query = match downcast::<Q>(request, envelope.type_tag()) {
            Ok(q) => q,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let correlation_id = envelope.correlation_id().clone();
        let fut = handler(query);
        Box::pin(async move {
            let response = fut.await?;
            Envelope::encode(&response, Some(correlation_id)).map(Some)
        })
    })
}

/// At most one handler per type tag.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<TypeTag, BoxedHandler>>,
}

impl HandlerRegistry {
    /// Bind `tag` to `handler`.
    ///
    /// A duplicate registration fails and leaves the existing binding intact.
    pub fn insert(&self, tag: TypeTag, handler: BoxedHandler) -> Result<()> {
        // ---
        let mut handlers = write_ignore_poison(&self.handlers);
        if handlers.contains_key(&tag) {
            return Err(BusError::AlreadyRegistered(tag));
        }
        handlers.insert(tag, handler);
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<BoxedHandler> {
        // ---
        read_ignore_poison(&self.handlers)
            .get(&TypeTag::from(tag))
            .cloned()
    }

    pub fn contains(&self, tag: &TypeTag) -> bool {
        read_ignore_poison(&self.handlers).contains_key(tag)
    }

    /// Registered tags, sorted for stable subscription order.
    pub fn tags(&self) -> Vec<TypeTag> {
        // ---
        let mut tags: Vec<TypeTag> = read_ignore_poison(&self.handlers).keys().cloned().collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Message, TypeRegistry};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const TYPE_TAG: &'static str = "test.Ping";
    }

    impl Query for Ping {
        type Response = Pong;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        n: u32,
    }

    impl Message for Pong {
        const TYPE_TAG: &'static str = "test.Pong";
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        // ---
        let registry = HandlerRegistry::default();
        let first = wrap_query_handler(|p: Ping| async move { Ok(Pong { n: p.n }) });
        let second = wrap_query_handler(|_: Ping| async move { Ok(Pong { n: 0 }) });

        registry.insert(Ping::type_tag(), first.clone()).unwrap();
        let err = registry.insert(Ping::type_tag(), second).unwrap_err();

        assert!(matches!(err, BusError::AlreadyRegistered(_)));
        let kept = registry.get("test.Ping").unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[tokio::test]
    async fn test_query_handler_reply_keeps_correlation_id() {
        // ---
        let types = TypeRegistry::new();
        types.register::<Ping>();

        let handler = wrap_query_handler(|p: Ping| async move { Ok(Pong { n: p.n + 1 }) });
        let request = Envelope::encode(&Ping { n: 41 }, None).unwrap();

        let reply = handler(types.to_request(&request).unwrap(), &request)
            .await
            .unwrap()
            .expect("query handler must reply");

        assert_eq!(reply.correlation_id(), request.correlation_id());
        assert_eq!(reply.to_message::<Pong>().unwrap(), Pong { n: 42 });
    }
}
