//!
//! Conveyor Core - Durable workflow execution engine
//!
//! This crate defines the engine, domain models, and port traits for the
//! Conveyor platform. Messaging and state backends live in other crates
//! and plug in through the traits in [`domain::repository`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - the executor and its worker pool
pub mod application;

/// Circuit breaker protecting primitive calls
pub mod resilience;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::ConveyorError;
pub use types::DataPacket;

pub use application::executor::{ExecutorConfig, WorkflowExecutor};
pub use domain::execution::{
    ExecutionContext, ExecutionData, ExecutionStatus, ExecutionStatusView, RunId, StepRecord,
};
pub use domain::message::{
    reply_subject, CorrelationId, ExecutionReply, ExecutionRequest, Message, MessageId,
};
pub use domain::repository::{
    MessageChannel, PoisonHandler, ResponseHandle, RunStateStore, WorkflowRegistry,
};
pub use domain::workflow::{
    ChildStep, RequestSpec, Step, ValidationSpec, WorkflowDefinition, WorkflowId,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, GuardedPrimitive};

/// A named capability the engine can invoke during a child step
///
/// Implementations must be safe to call concurrently; the engine shares
/// one instance across all runs.
#[async_trait]
pub trait Primitive: Send + Sync {
    /// Invoke the capability with a request payload
    async fn invoke(&self, request: DataPacket) -> Result<DataPacket, ConveyorError>;
}

/// Resolves primitive names to implementations
///
/// Injected into the executor so deployments can swap capability sets
/// without touching engine code.
#[async_trait]
pub trait PrimitiveResolver: Send + Sync {
    /// Resolve a primitive by name
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Primitive>, ConveyorError>;
}

/// A fixed, immutable set of primitives
#[derive(Default)]
pub struct StaticPrimitiveResolver {
    primitives: HashMap<String, Arc<dyn Primitive>>,
}

impl StaticPrimitiveResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a primitive under a name, replacing any existing entry
    pub fn with(mut self, name: impl Into<String>, primitive: Arc<dyn Primitive>) -> Self {
        self.primitives.insert(name.into(), primitive);
        self
    }
}

#[async_trait]
impl PrimitiveResolver for StaticPrimitiveResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Primitive>, ConveyorError> {
        self.primitives.get(name).cloned().ok_or_else(|| {
            ConveyorError::PrimitiveFailure(format!("No primitive registered for name: {}", name))
        })
    }
}

/// Adapter turning an async closure into a [`Primitive`]
pub struct FnPrimitive {
    handler: Box<
        dyn Fn(DataPacket) -> BoxFuture<'static, Result<DataPacket, ConveyorError>> + Send + Sync,
    >,
}

impl FnPrimitive {
    /// Wrap an async function as a primitive
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(DataPacket) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<DataPacket, ConveyorError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |request| Box::pin(handler(request))),
        }
    }
}

#[async_trait]
impl Primitive for FnPrimitive {
    async fn invoke(&self, request: DataPacket) -> Result<DataPacket, ConveyorError> {
        (self.handler)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_resolver_resolves_registered_primitive() {
        let resolver = StaticPrimitiveResolver::new().with(
            "echo",
            Arc::new(FnPrimitive::new(|request| async move { Ok(request) })),
        );

        let primitive = resolver.resolve("echo").await.unwrap();
        let response = primitive
            .invoke(DataPacket::new(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(response.as_value()["x"], 1);
    }

    #[tokio::test]
    async fn test_static_resolver_rejects_unknown_primitive() {
        let resolver = StaticPrimitiveResolver::new();
        let result = resolver.resolve("missing").await;
        assert!(matches!(result, Err(ConveyorError::PrimitiveFailure(_))));
    }

    #[tokio::test]
    async fn test_fn_primitive_propagates_errors() {
        let primitive = FnPrimitive::new(|_| async {
            Err(ConveyorError::PrimitiveFailure("down".to_string()))
        });
        let result = primitive.invoke(DataPacket::null()).await;
        assert!(matches!(result, Err(ConveyorError::PrimitiveFailure(_))));
    }
}
