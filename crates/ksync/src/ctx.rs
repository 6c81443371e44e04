// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine context: the process-wide state of the original design, carried
//! as an explicit value so tests can build as many as they like.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::deps::DependencyGraph;
use crate::flow::object::FlowObject;
use crate::object::{EntryObject, ObjectManager};
use crate::transport::{Transport, Wire};

/// Everything the engine owns: the dependency graph, the per-shard
/// transports, the registered entry objects, and the object manager.
///
/// `init` builds the pieces; `shutdown` cancels the task set and asserts,
/// in reverse construction order, that every registry and both reference
/// trees drained.
pub struct Ksync {
    graph: Arc<DependencyGraph>,
    transports: Vec<Arc<Transport>>,
    manager: Arc<ObjectManager>,
    objects: Mutex<Vec<Arc<EntryObject>>>,
    flow_objects: Mutex<Vec<Arc<FlowObject>>>,
    shutdown: CancellationToken,
}

impl Ksync {
    /// Build a context with one transport per shard; `wire(shard)` supplies
    /// each shard's socket.
    pub fn init(
        shards: usize,
        mut wire: impl FnMut(usize) -> Arc<dyn Wire>,
    ) -> Arc<Self> {
        assert!(shards > 0);
        let shutdown = CancellationToken::new();
        let graph = DependencyGraph::new();
        let transports: Vec<Arc<Transport>> =
            (0..shards).map(|shard| Transport::new(wire(shard))).collect();
        let manager = ObjectManager::new(shutdown.clone());
        Arc::new(Self {
            graph,
            transports,
            manager,
            objects: Mutex::new(Vec::new()),
            flow_objects: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Test-mode context over inline transports.
    pub fn init_inline(shards: usize, mut wire: impl FnMut(usize) -> Arc<dyn Wire>) -> Arc<Self> {
        assert!(shards > 0);
        let shutdown = CancellationToken::new();
        let graph = DependencyGraph::new();
        let transports: Vec<Arc<Transport>> =
            (0..shards).map(|shard| Transport::new_inline(wire(shard))).collect();
        let manager = ObjectManager::new(shutdown.clone());
        Arc::new(Self {
            graph,
            transports,
            manager,
            objects: Mutex::new(Vec::new()),
            flow_objects: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Start the transport task sets.
    pub fn start(&self) {
        for transport in &self.transports {
            transport.start(self.shutdown.clone());
        }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn manager(&self) -> &Arc<ObjectManager> {
        &self.manager
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Shard 0's transport, the home of every non-flow object.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transports[0]
    }

    pub fn shard_transport(&self, shard: usize) -> &Arc<Transport> {
        &self.transports[shard % self.transports.len()]
    }

    pub fn shard_count(&self) -> usize {
        self.transports.len()
    }

    /// Build and register a plain registry on shard 0.
    pub fn new_object(&self, name: &str) -> Arc<EntryObject> {
        let object = EntryObject::new(name, self.graph.clone(), self.transport().clone());
        self.objects.lock().push(object.clone());
        object
    }

    /// Build and register an indexed registry on shard 0.
    pub fn new_indexed_object(&self, name: &str, max_index: usize) -> Arc<EntryObject> {
        let object = EntryObject::with_index_table(
            name,
            self.graph.clone(),
            self.transport().clone(),
            max_index,
        );
        self.objects.lock().push(object.clone());
        object
    }

    /// Build and register one flow registry per shard.
    pub fn new_flow_objects(&self) -> Vec<Arc<FlowObject>> {
        let objects: Vec<Arc<FlowObject>> = (0..self.shard_count())
            .map(|shard| {
                FlowObject::new(shard, self.graph.clone(), self.shard_transport(shard).clone())
            })
            .collect();
        self.flow_objects.lock().extend(objects.iter().cloned());
        objects
    }

    /// Tear down: cancel the task set, then verify in reverse order that
    /// nothing is left — every registry empty, no in-flight requests, both
    /// reference trees drained.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        for object in self.flow_objects.lock().drain(..) {
            assert!(
                object.object().is_empty(),
                "flow registry {} still holds entries at shutdown",
                object.object().name()
            );
        }
        for object in self.objects.lock().drain(..) {
            assert!(
                object.is_empty(),
                "registry {} still holds entries at shutdown",
                object.name()
            );
        }
        for transport in &self.transports {
            assert_eq!(
                transport.in_flight(),
                0,
                "transport still holds in-flight contexts at shutdown"
            );
        }
        assert!(self.graph.is_empty(), "dependency graph not empty at shutdown");
        info!("ksync context shut down");
    }
}

#[cfg(test)]
#[path = "ctx_tests.rs"]
mod tests;
