//! Node class registry: creation, categories, and type convertibility

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use uuid::Uuid;

use crate::data::{DataType, NodeData};
use crate::env::Env;
use crate::error::{raise, FlowError, Result};

use super::node::{ComputeFn, Node};
use super::port::{Port, PortDefinition, PortDirection};

/// A registered node class: identity, organization, port schema, and the
/// compute procedure bound to every instance
#[derive(Clone)]
pub struct NodeClass {
    pub class_id: String,
    pub category: String,
    pub friendly_name: String,
    pub description: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub compute: ComputeFn,
}

impl NodeClass {
    pub fn new(class_id: &str, friendly_name: &str, category: &str) -> Self {
        Self {
            class_id: class_id.to_string(),
            category: category.to_string(),
            friendly_name: friendly_name.to_string(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            compute: Arc::new(|_| Err("node class declares no computation".to_string())),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<PortDefinition>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PortDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_compute(
        mut self,
        compute: impl Fn(&super::node::ComputeContext) -> std::result::Result<super::node::ComputeOutputs, String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.compute = Arc::new(compute);
        self
    }
}

struct ClassRecord {
    class: NodeClass,
    /// Name of the module that contributed this class; `None` for built-ins
    provenance: Option<String>,
}

struct FactoryInner {
    classes: BTreeMap<String, ClassRecord>,
    conversions: HashSet<(DataType, DataType)>,
    live_instances: HashMap<String, usize>,
}

/// Registry mapping class identifiers to node constructors, grouped by
/// category, with the engine's type-convertibility table
pub struct NodeFactory {
    inner: Mutex<FactoryInner>,
}

impl NodeFactory {
    /// An empty factory with the engine's default convertibility table
    pub fn new() -> Arc<NodeFactory> {
        let conversions = [
            (DataType::Integer, DataType::Float),
            (DataType::Integer, DataType::String),
            (DataType::Float, DataType::String),
            (DataType::Boolean, DataType::String),
        ]
        .into_iter()
        .collect();
        Arc::new(NodeFactory {
            inner: Mutex::new(FactoryInner {
                classes: BTreeMap::new(),
                conversions,
                live_instances: HashMap::new(),
            }),
        })
    }

    /// A factory pre-seeded with the built-in node classes
    pub fn with_builtins() -> Arc<NodeFactory> {
        let factory = NodeFactory::new();
        for class in super::builtin::classes() {
            if let Err(err) = factory.register_class(class) {
                warn!("failed to register built-in class: {err}");
            }
        }
        factory
    }

    /// Instantiate a node of `class_id`.
    ///
    /// A fresh UUID is drawn when `desired_id` is absent or empty. Fails
    /// with `NodeNotFound` for an unregistered class.
    pub fn create_node(
        self: &Arc<Self>,
        class_id: &str,
        desired_id: Option<&str>,
        name: &str,
        env: &Arc<Env>,
    ) -> Result<Arc<Node>> {
        let class = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.classes.get(class_id).ok_or_else(|| {
                raise(FlowError::NodeNotFound(format!(
                    "node class not found: {class_id}"
                )))
            })?;
            let class = record.class.clone();
            *inner.live_instances.entry(class_id.to_string()).or_insert(0) += 1;
            class
        };

        let id = match desired_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let inputs = class
            .inputs
            .iter()
            .map(|def| Port::from_definition(def, PortDirection::Input))
            .collect();
        let outputs = class
            .outputs
            .iter()
            .map(|def| Port::from_definition(def, PortDirection::Output))
            .collect();

        debug!("creating node {id} of class {class_id}");
        Ok(Node::new(
            id,
            class.class_id,
            name.to_string(),
            inputs,
            outputs,
            class.compute,
            Arc::downgrade(env),
            Arc::downgrade(self),
        ))
    }

    /// Stable, duplicate-free category listing
    pub fn get_categories(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut categories: Vec<String> = inner
            .classes
            .values()
            .map(|r| r.class.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Class identifiers registered under `category`, sorted
    pub fn get_node_classes(&self, category: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .classes
            .values()
            .filter(|r| r.class.category == category)
            .map(|r| r.class.class_id.clone())
            .collect()
    }

    pub fn get_friendly_name(&self, class_id: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .classes
            .get(class_id)
            .map(|r| r.class.friendly_name.clone())
            .ok_or_else(|| {
                raise(FlowError::NodeNotFound(format!(
                    "node class not found: {class_id}"
                )))
            })
    }

    /// The registered schema for a class
    pub fn get_class(&self, class_id: &str) -> Result<NodeClass> {
        let inner = self.inner.lock().unwrap();
        inner
            .classes
            .get(class_id)
            .map(|r| r.class.clone())
            .ok_or_else(|| {
                raise(FlowError::NodeNotFound(format!(
                    "node class not found: {class_id}"
                )))
            })
    }

    /// Whether data of `from` may implicitly satisfy a port declared `to`.
    ///
    /// The relation is directional: integer to float does not imply the
    /// reverse.
    pub fn is_convertible(&self, from: &DataType, to: &DataType) -> bool {
        if from == to {
            return true;
        }
        let inner = self.inner.lock().unwrap();
        inner.conversions.contains(&(from.clone(), to.clone()))
    }

    /// Extend the convertibility table with a directional pair
    pub fn add_conversion(&self, from: DataType, to: DataType) {
        self.inner.lock().unwrap().conversions.insert((from, to));
    }

    /// Adapt `data` to the declared type `to`, per the convertibility table
    pub(crate) fn convert(&self, data: &NodeData, to: &DataType) -> Result<NodeData> {
        let from = data.data_type();
        if from == *to {
            return Ok(data.clone());
        }
        if !self.is_convertible(&from, to) {
            return Err(raise(FlowError::TypeMismatch(format!(
                "{from} is not convertible to {to}"
            ))));
        }
        match (data, to) {
            (NodeData::Integer(v), DataType::Float) => Ok(NodeData::float(f64::from(*v))),
            (NodeData::Integer(v), DataType::String) => Ok(NodeData::string(v.to_string())),
            (NodeData::Float(v), DataType::String) => Ok(NodeData::string(v.to_string())),
            (NodeData::Boolean(v), DataType::String) => Ok(NodeData::string(v.to_string())),
            _ => Err(raise(FlowError::TypeMismatch(format!(
                "no conversion rule from {from} to {to}"
            )))),
        }
    }

    /// Register one class. Fails on an identifier collision.
    pub fn register_class(&self, class: NodeClass) -> Result<()> {
        self.register_classes(vec![class], None)
    }

    /// Register a batch of classes atomically: on any identifier collision
    /// nothing is registered.
    pub(crate) fn register_classes(
        &self,
        classes: Vec<NodeClass>,
        provenance: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut batch_ids = HashSet::new();
        for class in &classes {
            if inner.classes.contains_key(&class.class_id) || !batch_ids.insert(class.class_id.clone())
            {
                return Err(raise(FlowError::InvalidArgument(format!(
                    "node class already registered: {}",
                    class.class_id
                ))));
            }
        }
        for class in classes {
            debug!("registering node class {}", class.class_id);
            inner.classes.insert(
                class.class_id.clone(),
                ClassRecord {
                    class,
                    provenance: provenance.map(str::to_string),
                },
            );
        }
        Ok(())
    }

    /// Remove a batch of classes atomically.
    ///
    /// Rejected without removing anything if any class is unknown or still
    /// has live node instances.
    pub(crate) fn unregister_classes(&self, class_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for class_id in class_ids {
            if !inner.classes.contains_key(class_id) {
                return Err(raise(FlowError::InvalidArgument(format!(
                    "node class not registered: {class_id}"
                ))));
            }
            let live = inner.live_instances.get(class_id).copied().unwrap_or(0);
            if live > 0 {
                return Err(raise(FlowError::InvalidArgument(format!(
                    "node class {class_id} still has {live} live instance(s)"
                ))));
            }
        }
        for class_id in class_ids {
            debug!("unregistering node class {class_id}");
            inner.classes.remove(class_id);
            inner.live_instances.remove(class_id);
        }
        Ok(())
    }

    /// Classes contributed by the named module
    pub(crate) fn classes_from(&self, provenance: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .classes
            .values()
            .filter(|r| r.provenance.as_deref() == Some(provenance))
            .map(|r| r.class.class_id.clone())
            .collect()
    }

    /// Live node instances of a class (diagnostic)
    pub fn live_instances(&self, class_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.live_instances.get(class_id).copied().unwrap_or(0)
    }

    pub(crate) fn note_instance_dropped(&self, class_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.live_instances.get_mut(class_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NodeData;

    fn marker_class(class_id: &str, category: &str) -> NodeClass {
        NodeClass::new(class_id, class_id, category)
            .with_outputs(vec![PortDefinition::required("out", DataType::Integer)])
            .with_compute(|_| Ok(vec![("out".to_string(), NodeData::integer(1))]))
    }

    #[test]
    fn create_node_fails_for_unknown_class() {
        let env = Env::create(1).unwrap();
        let factory = env.factory();
        assert!(matches!(
            factory.create_node("no.such.class", None, "x", &env),
            Err(FlowError::NodeNotFound(_))
        ));
    }

    #[test]
    fn category_and_class_listings_are_stable() {
        let factory = NodeFactory::new();
        factory.register_class(marker_class("b.second", "letters")).unwrap();
        factory.register_class(marker_class("a.first", "letters")).unwrap();
        factory.register_class(marker_class("z.only", "last")).unwrap();

        assert_eq!(factory.get_categories(), vec!["last", "letters"]);
        assert_eq!(
            factory.get_node_classes("letters"),
            vec!["a.first", "b.second"]
        );
        assert!(factory.get_node_classes("unknown").is_empty());
        assert_eq!(factory.get_friendly_name("z.only").unwrap(), "z.only");
        assert!(factory.get_friendly_name("nope").is_err());
    }

    #[test]
    fn registration_collision_is_rejected() {
        let factory = NodeFactory::new();
        factory.register_class(marker_class("dup", "c")).unwrap();
        assert!(matches!(
            factory.register_class(marker_class("dup", "c")),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn batch_registration_is_atomic() {
        let factory = NodeFactory::new();
        factory.register_class(marker_class("taken", "c")).unwrap();
        let result = factory.register_classes(
            vec![marker_class("fresh", "c"), marker_class("taken", "c")],
            Some("mod"),
        );
        assert!(result.is_err());
        assert!(factory.get_friendly_name("fresh").is_err());
    }

    #[test]
    fn default_convertibility_table() {
        let factory = NodeFactory::new();
        assert!(factory.is_convertible(&DataType::Integer, &DataType::Float));
        assert!(factory.is_convertible(&DataType::Integer, &DataType::String));
        assert!(!factory.is_convertible(&DataType::Float, &DataType::Integer));
        assert!(!factory.is_convertible(&DataType::String, &DataType::Boolean));
        // The relation is directional
        assert!(factory.is_convertible(&DataType::Float, &DataType::String));
        assert!(!factory.is_convertible(&DataType::String, &DataType::Float));
    }

    #[test]
    fn conversion_produces_adapted_values() {
        let factory = NodeFactory::new();
        assert_eq!(
            factory
                .convert(&NodeData::integer(3), &DataType::Float)
                .unwrap(),
            NodeData::float(3.0)
        );
        assert_eq!(
            factory
                .convert(&NodeData::boolean(true), &DataType::String)
                .unwrap(),
            NodeData::string("true")
        );
        assert!(matches!(
            factory.convert(&NodeData::string("x"), &DataType::Integer),
            Err(FlowError::TypeMismatch(_))
        ));
    }

    #[test]
    fn unregister_rejected_while_instances_alive() {
        let env = Env::create(1).unwrap();
        let factory = env.factory();
        factory
            .register_classes(vec![marker_class("plugin.node", "plugin")], Some("plugin"))
            .unwrap();

        let node = factory
            .create_node("plugin.node", None, "instance", &env)
            .unwrap();
        assert_eq!(factory.live_instances("plugin.node"), 1);
        assert!(factory
            .unregister_classes(&["plugin.node".to_string()])
            .is_err());
        // Rejection removed nothing
        assert!(factory.get_friendly_name("plugin.node").is_ok());

        drop(node);
        assert_eq!(factory.live_instances("plugin.node"), 0);
        factory
            .unregister_classes(&["plugin.node".to_string()])
            .unwrap();
        assert!(factory.get_friendly_name("plugin.node").is_err());
    }

    #[test]
    fn instance_counting_across_register_cycles() {
        let env = Env::create(1).unwrap();
        let factory = env.factory();
        for _ in 0..3 {
            factory
                .register_classes(vec![marker_class("cycle.node", "plugin")], Some("cycler"))
                .unwrap();
            let node = factory
                .create_node("cycle.node", None, "instance", &env)
                .unwrap();
            assert!(factory
                .unregister_classes(&["cycle.node".to_string()])
                .is_err());
            drop(node);
            factory
                .unregister_classes(&["cycle.node".to_string()])
                .unwrap();
        }
    }

    #[test]
    fn classes_from_tracks_provenance() {
        let factory = NodeFactory::new();
        factory
            .register_classes(vec![marker_class("m.one", "m"), marker_class("m.two", "m")], Some("mod"))
            .unwrap();
        factory.register_class(marker_class("other", "m")).unwrap();
        let mut from_mod = factory.classes_from("mod");
        from_mod.sort();
        assert_eq!(from_mod, vec!["m.one", "m.two"]);
    }
}
