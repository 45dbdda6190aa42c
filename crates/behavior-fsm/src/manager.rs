use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use behavior_core::{ActionSink, Error, Result, StateChangeListener};

use crate::definition::StateMachineDefinition;
use crate::expr::Evaluator;
use crate::instance::StateMachineInstance;

/// Registry of definitions plus a pool of named instances with batch
/// ticking. Explicit and caller-owned — deliberately not a global.
#[derive(Default)]
pub struct StateMachineManager {
    definitions: HashMap<String, Arc<StateMachineDefinition>>,
    instances: HashMap<String, StateMachineInstance>,
    order: Vec<String>,
    sink: Option<Arc<dyn ActionSink>>,
    listener: Option<Arc<dyn StateChangeListener>>,
    evaluator: Option<Arc<Evaluator>>,
}

impl StateMachineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default sink inherited by instances created afterwards; existing
    /// instances are unaffected.
    pub fn set_action_sink(&mut self, sink: Arc<dyn ActionSink>) {
        self.sink = Some(sink);
    }

    pub fn set_state_listener(&mut self, listener: Arc<dyn StateChangeListener>) {
        self.listener = Some(listener);
    }

    /// Shared evaluator (e.g. with host-registered functions) for instances
    /// created afterwards.
    pub fn set_evaluator(&mut self, evaluator: Arc<Evaluator>) {
        self.evaluator = Some(evaluator);
    }

    /// Stores a definition by id. Re-registering the same id replaces it;
    /// already-created instances keep their own reference.
    pub fn register_definition(&mut self, definition: StateMachineDefinition) {
        tracing::debug!(definition = %definition.id, "Definition registered");
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn definition(&self, id: &str) -> Option<Arc<StateMachineDefinition>> {
        self.definitions.get(id).cloned()
    }

    /// Constructs and starts an instance of a registered definition, pools
    /// it under `instance_id` (auto-generated when absent) and returns it.
    pub async fn create_instance(
        &mut self,
        definition_id: &str,
        instance_id: Option<&str>,
    ) -> Result<&mut StateMachineInstance> {
        let definition = self
            .definitions
            .get(definition_id)
            .cloned()
            .ok_or_else(|| Error::UnknownDefinition(definition_id.to_string()))?;

        let id = match instance_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        if self.instances.contains_key(&id) {
            return Err(Error::DuplicateInstance(id));
        }

        let mut instance = StateMachineInstance::new(definition)?.with_id(id.clone());
        if let Some(sink) = &self.sink {
            instance.set_action_sink(sink.clone());
        }
        if let Some(listener) = &self.listener {
            instance.set_state_listener(listener.clone());
        }
        if let Some(evaluator) = &self.evaluator {
            instance.set_evaluator(evaluator.clone());
        }
        instance.start().await?;

        self.order.push(id.clone());
        Ok(self.instances.entry(id).or_insert(instance))
    }

    pub fn instance(&self, id: &str) -> Option<&StateMachineInstance> {
        self.instances.get(id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut StateMachineInstance> {
        self.instances.get_mut(id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Removes an instance from the pool. There is no instance-level
    /// teardown hook; dropping it is the whole lifecycle.
    pub fn destroy_instance(&mut self, id: &str) -> bool {
        self.order.retain(|entry| entry != id);
        self.instances.remove(id).is_some()
    }

    /// Ticks every pooled instance once, in creation order, sequentially —
    /// no two instances' actions ever interleave mid-transition.
    pub async fn update_all(&mut self, dt: f64) -> Result<()> {
        for id in &self.order {
            if let Some(instance) = self.instances.get_mut(id) {
                instance.update(dt).await?;
            }
        }
        Ok(())
    }
}
