//! Handler registration.
//!
//! Business code registers ordinary typed async functions; the table erases
//! each of them to the one calling convention the engine dispatches with:
//! `Option<Value>` params in, `Result<Value, JsonRpcError>` out.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::message::JsonRpcError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, JsonRpcError>> + Send>>;

/// Uniform handler signature used by the dispatcher.
pub type ErasedHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;

/// Method name → handler mapping.
///
/// The registration helpers cover the supported handler shapes:
///
/// | helper              | shape                          |
/// |---------------------|--------------------------------|
/// | [`register`]        | `(params) -> Result<R, E>`     |
/// | [`register_value`]  | `(params) -> R`                |
/// | [`register_fallible`] | `(params) -> Result<(), E>`  |
/// | [`register_sink`]   | `(params)`                     |
/// | [`register_nullary`] | `() -> Result<R, E>`          |
///
/// [`register`]: HandlerTable::register
/// [`register_value`]: HandlerTable::register_value
/// [`register_fallible`]: HandlerTable::register_fallible
/// [`register_sink`]: HandlerTable::register_sink
/// [`register_nullary`]: HandlerTable::register_nullary
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, ErasedHandler>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Deserialize raw params into the handler's parameter type.
///
/// Absent params are treated as JSON `null`, so `()` and `Option<T>` accept them.
pub fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::invalid_params(Some(format!("Invalid params: {}", e))))
}

/// Serialize a handler's result value.
pub fn encode_result<R: Serialize>(result: R) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result).map_err(|e| {
        JsonRpcError::internal_error(Some(format!("Failed to serialize result: {}", e)))
    })
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that returns a value or an error.
    pub fn register<P, R, E, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<JsonRpcError> + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert_erased(
            method,
            Arc::new(move |params: Option<Value>| -> HandlerFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let params = decode_params::<P>(params)?;
                    let result = handler(params).await.map_err(Into::<JsonRpcError>::into)?;
                    encode_result(result)
                })
            }),
        )
    }

    /// Register a handler that always succeeds with a value.
    pub fn register_value<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert_erased(
            method,
            Arc::new(move |params: Option<Value>| -> HandlerFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let params = decode_params::<P>(params)?;
                    encode_result(handler(params).await)
                })
            }),
        )
    }

    /// Register a handler that returns no value but may fail.
    /// A successful call answers with `null`.
    pub fn register_fallible<P, E, F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        E: Into<JsonRpcError> + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert_erased(
            method,
            Arc::new(move |params: Option<Value>| -> HandlerFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let params = decode_params::<P>(params)?;
                    handler(params).await.map_err(Into::<JsonRpcError>::into)?;
                    Ok(Value::Null)
                })
            }),
        )
    }

    /// Register a handler with neither result nor error, typically a
    /// notification sink.
    pub fn register_sink<P, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert_erased(
            method,
            Arc::new(move |params: Option<Value>| -> HandlerFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let params = decode_params::<P>(params)?;
                    handler(params).await;
                    Ok(Value::Null)
                })
            }),
        )
    }

    /// Register a handler for a method without input. Any params sent by
    /// the peer are ignored.
    pub fn register_nullary<R, E, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        R: Serialize + Send + 'static,
        E: Into<JsonRpcError> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert_erased(
            method,
            Arc::new(move |_params: Option<Value>| -> HandlerFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let result = handler().await.map_err(Into::<JsonRpcError>::into)?;
                    encode_result(result)
                })
            }),
        )
    }

    /// Register an already-erased handler. Replaces any existing entry.
    pub fn insert_erased(&mut self, method: impl Into<String>, handler: ErasedHandler) -> &mut Self {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_some() {
            log::debug!("Replaced handler for method '{}'", method);
        }
        self
    }

    pub fn remove(&mut self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn get(&self, method: &str) -> Option<ErasedHandler> {
        self.handlers.get(method).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Resolve and invoke `method`. Unknown methods yield -32601.
    pub async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match self.get(method) {
            Some(handler) => handler(params).await,
            None => Err(JsonRpcError::method_not_found(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct ReadParams {
        value: String,
    }

    #[derive(Debug, Serialize)]
    struct ReadResult {
        echoed: String,
    }

    #[tokio::test]
    async fn test_register_result_shape() {
        let mut table = HandlerTable::new();
        table.register("read", |p: ReadParams| async move {
            if p.value.is_empty() {
                return Err(JsonRpcError::handler_error("value must not be empty"));
            }
            Ok(ReadResult { echoed: p.value })
        });

        let ok = table.dispatch("read", Some(json!({"value": "x"}))).await.unwrap();
        assert_eq!(ok, json!({"echoed": "x"}));

        let err = table.dispatch("read", Some(json!({"value": ""}))).await.unwrap_err();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "value must not be empty");
    }

    #[tokio::test]
    async fn test_invalid_params_is_32602() {
        let mut table = HandlerTable::new();
        table.register_value("read", |p: ReadParams| async move { p.value });

        let err = table.dispatch("read", Some(json!({"other": 1}))).await.unwrap_err();
        assert_eq!(err.code, -32602);

        let err = table.dispatch("read", None).await.unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn test_fallible_and_sink_shapes_answer_null() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = HandlerTable::new();

        let counter = hits.clone();
        table.register_sink("progress", move |_: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        table.register_fallible("delete", |(id,): (u64,)| async move {
            if id == 0 {
                Err(anyhow::anyhow!("no such resource"))
            } else {
                Ok(())
            }
        });

        assert_eq!(table.dispatch("progress", Some(json!([1]))).await.unwrap(), Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(table.dispatch("delete", Some(json!([5]))).await.unwrap(), Value::Null);
        let err = table.dispatch("delete", Some(json!([0]))).await.unwrap_err();
        assert_eq!(err.message, "no such resource");
    }

    #[tokio::test]
    async fn test_nullary_ignores_params() {
        let mut table = HandlerTable::new();
        table.register_nullary("health", || async { Ok::<_, JsonRpcError>(json!({"ok": true})) });

        assert_eq!(table.dispatch("health", None).await.unwrap(), json!({"ok": true}));
        assert_eq!(
            table.dispatch("health", Some(json!({"ignored": 1}))).await.unwrap(),
            json!({"ok": true})
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_32601() {
        let table = HandlerTable::new();
        let err = table.dispatch("create", None).await.unwrap_err();
        assert!(err.is_method_not_found());
    }

    #[test]
    fn test_methods_sorted_and_replace() {
        let mut table = HandlerTable::new();
        table
            .register_value("read", |_: Value| async { 1 })
            .register_value("create", |_: Value| async { 2 })
            .register_value("read", |_: Value| async { 3 });

        assert_eq!(table.methods(), vec!["create", "read"]);
        assert_eq!(table.len(), 2);
        assert!(table.remove("create"));
        assert!(!table.contains("create"));
    }
}
