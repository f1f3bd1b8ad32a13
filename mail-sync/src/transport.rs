//! # Transport
//!
//! The transport carries method calls to the server and brings back
//! their responses. It is an external collaborator: implementors only
//! need to provide [`Transport::call`], which is expected to deliver
//! responses in request order.
//!
//! The library never retries a failed call: transport errors are
//! forwarded to the caller, wrapped in [`Error::CallMethodError`].

use std::{result, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    error::AnyBoxedError,
    protocol::{Invocation, Request, Responses},
    Error, Result,
};

/// The transport trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Calls the given method with the given arguments, and returns
    /// the list of invocations the server answered with.
    async fn call(&self, method: &str, args: Value) -> result::Result<Vec<Invocation>, AnyBoxedError>;

    /// Sends the given request.
    async fn send(&self, req: &Request) -> Result<Responses> {
        let method = req.method();
        let args = req.arguments()?;
        debug!("calling method {method}");
        trace!("arguments: {args:#?}");

        let invocations = self
            .call(method, args)
            .await
            .map_err(|err| Error::CallMethodError(err, method.to_owned()))?;

        Ok(Responses::from(invocations))
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn call(&self, method: &str, args: Value) -> result::Result<Vec<Invocation>, AnyBoxedError> {
        (**self).call(method, args).await
    }
}
