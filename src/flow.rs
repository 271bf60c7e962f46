//! Ordered interceptor pipelines.
//!
//! A [`Flow`] is a mutable sequence of nodes wrapped around one well-defined
//! point of an endpoint's lifecycle: before a call goes out, after raw bytes
//! come in, and so on. Each node receives the stage payload, may rewrite it,
//! and either passes it on or aborts the whole operation. Endpoints expose
//! their flows as public fields, so applications register nodes without any
//! exclusive borrow of the endpoint itself.

use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::{BoxFuture, FutureExt};

use crate::common::log::Logger;

/// What a flow node decided to do with the payload.
#[must_use]
pub enum FlowControl<T> {
    /// Hand the (possibly rewritten) payload to the next node.
    Continue(T),
    /// Halt the pipeline; the downstream operation must not run.
    Abort,
}

type Node<T> = Arc<dyn Fn(T) -> BoxFuture<'static, FlowControl<T>> + Send + Sync>;

/// An ordered, mutable interceptor pipeline around one stage.
pub struct Flow<T> {
    name: &'static str,
    nodes: RwLock<Vec<Node<T>>>,
}

impl<T: Send + 'static> Flow<T> {
    pub(crate) fn new(name: &'static str) -> Flow<T> {
        Flow {
            name,
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Appends a synchronous node.
    pub fn push<F>(&self, node: F)
    where
        F: Fn(T) -> FlowControl<T> + Send + Sync + 'static,
    {
        self.push_node(Arc::new(move |t| {
            let out = node(t);
            async move { out }.boxed()
        }));
    }

    /// Appends an asynchronous node.
    pub fn push_async<F, Fut>(&self, node: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowControl<T>> + Send + 'static,
    {
        self.push_node(Arc::new(move |t| node(t).boxed()));
    }

    fn push_node(&self, node: Node<T>) {
        self.nodes
            .write()
            .expect("flow nodes lock poisoned")
            .push(node);
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().expect("flow nodes lock poisoned").len()
    }

    /// Whether no nodes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every node in registration order over `input`.
    ///
    /// Returns `None` as soon as a node aborts; the caller must then skip the
    /// downstream operation.
    pub(crate) async fn exec(&self, input: T, logger: &Logger) -> Option<T> {
        // Snapshot so nodes can register further nodes without deadlocking.
        let nodes: Vec<Node<T>> = self
            .nodes
            .read()
            .expect("flow nodes lock poisoned")
            .clone();
        let mut value = input;
        for (i, node) in nodes.iter().enumerate() {
            match node(value).await {
                FlowControl::Continue(next) => value = next,
                FlowControl::Abort => {
                    logger.debug(format_args!(
                        "[{}] aborted by node #{}",
                        self.name, i
                    ));
                    return None;
                }
            }
        }
        Some(value)
    }
}

impl<T> std::fmt::Debug for FlowControl<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FlowControl::Continue(_) => f.write_str("Continue(..)"),
            FlowControl::Abort => f.write_str("Abort"),
        }
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("nodes", &self.nodes.read().map(|n| n.len()).unwrap_or(0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::log::{LogLevel, Logger};

    fn logger() -> Logger {
        Logger::new("[test] ", LogLevel::None)
    }

    #[tokio::test]
    async fn nodes_run_in_registration_order() {
        let flow: Flow<Vec<u32>> = Flow::new("order");
        for i in 0..3 {
            flow.push(move |mut v: Vec<u32>| {
                v.push(i);
                FlowControl::Continue(v)
            });
        }
        let out = flow.exec(Vec::new(), &logger()).await.unwrap();
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn abort_short_circuits() {
        let flow: Flow<u32> = Flow::new("abort");
        flow.push(|n| FlowControl::Continue(n + 1));
        flow.push(|_| FlowControl::Abort);
        flow.push(|_: u32| panic!("must not run after abort"));
        assert!(flow.exec(0, &logger()).await.is_none());
    }

    #[tokio::test]
    async fn async_nodes_are_awaited() {
        let flow: Flow<String> = Flow::new("async");
        flow.push_async(|s: String| async move {
            tokio::task::yield_now().await;
            FlowControl::Continue(format!("{}!", s))
        });
        let out = flow.exec("hi".to_string(), &logger()).await.unwrap();
        assert_eq!(out, "hi!");
    }

    #[tokio::test]
    async fn empty_flow_passes_input_through() {
        let flow: Flow<u32> = Flow::new("empty");
        assert_eq!(flow.exec(7, &logger()).await, Some(7));
    }
}
