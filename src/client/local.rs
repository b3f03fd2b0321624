use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::{NodeOutput, NodeService, ServiceError};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<NodeOutput, ServiceError>> + Send + Sync>;

/// In-process node backed by an async function
#[derive(Clone)]
pub struct LocalService {
    handler: Handler,
}

impl LocalService {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<NodeOutput, ServiceError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |v| Box::pin(f(v))),
        }
    }

    /// Node that answers every request with a JSON value computed from it
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |v| {
            let f = f.clone();
            async move { Ok(NodeOutput::Data(f(v))) }
        })
    }
}

#[async_trait]
impl NodeService for LocalService {
    async fn invoke(&self, request: Value) -> Result<NodeOutput, ServiceError> {
        (self.handler)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_from_fn() {
        let svc = LocalService::from_fn(|v| json!({"echo": v["text"]}));
        let out = svc.invoke(json!({"text": "hi"})).await.unwrap();
        match out {
            NodeOutput::Data(v) => assert_eq!(v["echo"], "hi"),
            NodeOutput::Stream(_) => panic!("expected data"),
        }
    }

    #[tokio::test]
    async fn test_async_handler_error() {
        let svc = LocalService::new(|_| async {
            Err(ServiceError::Http("connection refused".to_string()))
        });
        assert!(svc.invoke(json!({})).await.is_err());
    }
}
