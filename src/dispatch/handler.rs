//! Handler abstractions.
//!
//! Handlers are trait objects keyed by method name. Plain async closures
//! implement the traits directly; [`TypedMethod`] and [`TypedEvent`] wrap
//! closures over concrete param/result types and do the JSON conversion.

use std::future::Future;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::{NotificationContext, RequestContext};
use crate::error::HandlerError;

/// Result returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Handles one request method.
///
/// The handler owns the [`RequestContext`] and is expected to answer
/// through it. Returning `Err` without answering makes the dispatcher
/// send the error to the client.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request.
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> HandlerResult;
}

/// Handles one notification method.
///
/// Errors are logged; notifications never produce a response.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handles one notification.
    async fn handle(&self, params: Option<Value>, ctx: NotificationContext) -> HandlerResult;
}

#[async_trait::async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> HandlerResult {
        (self)(params, ctx).await
    }
}

#[async_trait::async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Option<Value>, NotificationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: NotificationContext) -> HandlerResult {
        (self)(params, ctx).await
    }
}

/// Request handler over typed params and result.
///
/// Params that fail to deserialize are answered with `-32602`.
pub struct TypedMethod<F, P, R> {
    f: F,
    _types: PhantomData<fn(P) -> R>,
}

impl<F, P, R> TypedMethod<F, P, R> {
    /// Wraps a closure.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut, P, R> RequestHandler for TypedMethod<F, P, R>
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + Sync + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> HandlerResult {
        let params = parse_params::<P>(params)?;
        let result = (self.f)(params).await?;
        ctx.send_result(&result).await?;
        Ok(())
    }
}

/// Notification handler over typed params.
pub struct TypedEvent<F, P> {
    f: F,
    _types: PhantomData<fn(P)>,
}

impl<F, P> TypedEvent<F, P> {
    /// Wraps a closure.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut, P> NotificationHandler for TypedEvent<F, P>
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, _ctx: NotificationContext) -> HandlerResult {
        let params = parse_params::<P>(params)?;
        (self.f)(params).await
    }
}

/// Deserializes params, treating an absent member as `null` and then as
/// an empty object so both `()` and all-default structs accept it.
///
/// # Errors
///
/// Returns [`HandlerError::InvalidParams`] when the value does not match `P`.
pub fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, HandlerError> {
    match params {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(serde_json::Map::new())))
            .map_err(HandlerError::from),
    }
}
