//! Built-in node classes seeded into every factory
//!
//! Constants apply their declared default literal when no input data is
//! present; everything else reads its inputs verbatim.

use crate::data::{DataType, NodeData};
use crate::nodes::factory::NodeClass;
use crate::nodes::node::{ComputeContext, ComputeOutputs};
use crate::nodes::port::PortDefinition;

/// The full built-in class set
pub fn classes() -> Vec<NodeClass> {
    vec![
        const_int(),
        const_float(),
        const_bool(),
        const_string(),
        math_add(),
        math_multiply(),
        string_concat(),
        env_get(),
    ]
}

fn const_int() -> NodeClass {
    NodeClass::new("const.int", "Integer Constant", "constants")
        .with_description("Emits a constant integer")
        .with_inputs(vec![
            PortDefinition::optional("value", DataType::Integer).with_default("0")
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::Integer)])
        .with_compute(|ctx: &ComputeContext| {
            let value = match ctx.input("value") {
                Some(data) => data.as_integer().map_err(|e| e.to_string())?,
                None => ctx
                    .default_literal("value")
                    .unwrap_or("0")
                    .parse::<i32>()
                    .map_err(|e| e.to_string())?,
            };
            Ok(vec![("out".to_string(), NodeData::integer(value))])
        })
}

fn const_float() -> NodeClass {
    NodeClass::new("const.float", "Float Constant", "constants")
        .with_description("Emits a constant float")
        .with_inputs(vec![
            PortDefinition::optional("value", DataType::Float).with_default("0")
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::Float)])
        .with_compute(|ctx: &ComputeContext| {
            let value = match ctx.input("value") {
                Some(data) => data.as_float().map_err(|e| e.to_string())?,
                None => ctx
                    .default_literal("value")
                    .unwrap_or("0")
                    .parse::<f64>()
                    .map_err(|e| e.to_string())?,
            };
            Ok(vec![("out".to_string(), NodeData::float(value))])
        })
}

fn const_bool() -> NodeClass {
    NodeClass::new("const.bool", "Boolean Constant", "constants")
        .with_description("Emits a constant boolean")
        .with_inputs(vec![
            PortDefinition::optional("value", DataType::Boolean).with_default("false")
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::Boolean)])
        .with_compute(|ctx: &ComputeContext| {
            let value = match ctx.input("value") {
                Some(data) => data.as_boolean().map_err(|e| e.to_string())?,
                None => ctx
                    .default_literal("value")
                    .unwrap_or("false")
                    .parse::<bool>()
                    .map_err(|e| e.to_string())?,
            };
            Ok(vec![("out".to_string(), NodeData::boolean(value))])
        })
}

fn const_string() -> NodeClass {
    NodeClass::new("const.string", "String Constant", "constants")
        .with_description("Emits a constant string")
        .with_inputs(vec![
            PortDefinition::optional("value", DataType::String).with_default("")
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::String)])
        .with_compute(|ctx: &ComputeContext| {
            let value = match ctx.input("value") {
                Some(data) => data.as_string().map_err(|e| e.to_string())?.to_string(),
                None => ctx.default_literal("value").unwrap_or("").to_string(),
            };
            Ok(vec![("out".to_string(), NodeData::string(value))])
        })
}

fn required_integer(ctx: &ComputeContext, key: &str) -> std::result::Result<i32, String> {
    ctx.input(key)
        .ok_or_else(|| format!("missing input '{key}'"))?
        .as_integer()
        .map_err(|e| e.to_string())
}

fn math_add() -> NodeClass {
    NodeClass::new("math.add", "Add", "math")
        .with_description("Adds two integers")
        .with_inputs(vec![
            PortDefinition::required("lhs", DataType::Integer),
            PortDefinition::required("rhs", DataType::Integer),
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::Integer)])
        .with_compute(|ctx: &ComputeContext| -> std::result::Result<ComputeOutputs, String> {
            let lhs = required_integer(ctx, "lhs")?;
            let rhs = required_integer(ctx, "rhs")?;
            Ok(vec![("out".to_string(), NodeData::integer(lhs + rhs))])
        })
}

fn math_multiply() -> NodeClass {
    NodeClass::new("math.multiply", "Multiply", "math")
        .with_description("Multiplies two integers")
        .with_inputs(vec![
            PortDefinition::required("lhs", DataType::Integer),
            PortDefinition::required("rhs", DataType::Integer),
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::Integer)])
        .with_compute(|ctx: &ComputeContext| -> std::result::Result<ComputeOutputs, String> {
            let lhs = required_integer(ctx, "lhs")?;
            let rhs = required_integer(ctx, "rhs")?;
            Ok(vec![("out".to_string(), NodeData::integer(lhs * rhs))])
        })
}

fn string_concat() -> NodeClass {
    NodeClass::new("string.concat", "Concatenate", "string")
        .with_description("Joins two strings")
        .with_inputs(vec![
            PortDefinition::required("lhs", DataType::String),
            PortDefinition::required("rhs", DataType::String),
        ])
        .with_outputs(vec![PortDefinition::required("out", DataType::String)])
        .with_compute(|ctx: &ComputeContext| {
            let lhs = ctx
                .input("lhs")
                .ok_or("missing input 'lhs'")?
                .as_string()
                .map_err(|e| e.to_string())?;
            let rhs = ctx
                .input("rhs")
                .ok_or("missing input 'rhs'")?
                .as_string()
                .map_err(|e| e.to_string())?;
            Ok(vec![(
                "out".to_string(),
                NodeData::string(format!("{lhs}{rhs}")),
            )])
        })
}

fn env_get() -> NodeClass {
    NodeClass::new("env.get", "Environment Variable", "environment")
        .with_description("Reads a process environment variable, empty when unset")
        .with_inputs(vec![PortDefinition::required("name", DataType::String)])
        .with_outputs(vec![PortDefinition::required("value", DataType::String)])
        .with_compute(|ctx: &ComputeContext| {
            let env = ctx.env().ok_or("environment is gone")?;
            let name = ctx
                .input("name")
                .ok_or("missing input 'name'")?
                .as_string()
                .map_err(|e| e.to_string())?;
            let value = env.var(name).unwrap_or_default();
            Ok(vec![("value".to_string(), NodeData::string(value))])
        })
}

#[cfg(test)]
mod tests {
    use crate::data::NodeData;
    use crate::env::Env;

    #[test]
    fn const_int_applies_its_default() {
        let env = Env::create(1).unwrap();
        let node = env
            .factory()
            .create_node("const.int", None, "A", &env)
            .unwrap();
        node.invoke_compute().unwrap();
        assert_eq!(
            node.get_output_data("out").unwrap(),
            Some(NodeData::integer(0))
        );

        node.set_input_data("value", NodeData::integer(42)).unwrap();
        node.invoke_compute().unwrap();
        assert_eq!(
            node.get_output_data("out").unwrap(),
            Some(NodeData::integer(42))
        );
    }

    #[test]
    fn math_add_sums_inputs() {
        let env = Env::create(1).unwrap();
        let node = env
            .factory()
            .create_node("math.add", None, "B", &env)
            .unwrap();
        node.set_input_data("lhs", NodeData::integer(2)).unwrap();
        node.set_input_data("rhs", NodeData::integer(5)).unwrap();
        node.invoke_compute().unwrap();
        assert_eq!(
            node.get_output_data("out").unwrap(),
            Some(NodeData::integer(7))
        );
    }

    #[test]
    fn string_concat_joins() {
        let env = Env::create(1).unwrap();
        let node = env
            .factory()
            .create_node("string.concat", None, "C", &env)
            .unwrap();
        node.set_input_data("lhs", NodeData::string("ab")).unwrap();
        node.set_input_data("rhs", NodeData::string("cd")).unwrap();
        node.invoke_compute().unwrap();
        assert_eq!(
            node.get_output_data("out").unwrap(),
            Some(NodeData::string("abcd"))
        );
    }

    #[test]
    fn env_get_reads_variables() {
        let env = Env::create(1).unwrap();
        std::env::set_var("NODEFLOW_BUILTIN_TEST", "from-env");
        let node = env
            .factory()
            .create_node("env.get", None, "E", &env)
            .unwrap();
        node.set_input_data("name", NodeData::string("NODEFLOW_BUILTIN_TEST"))
            .unwrap();
        node.invoke_compute().unwrap();
        assert_eq!(
            node.get_output_data("value").unwrap(),
            Some(NodeData::string("from-env"))
        );
    }

    #[test]
    fn builtin_catalogue_is_listed_by_category() {
        let env = Env::create(1).unwrap();
        let factory = env.factory();
        let categories = factory.get_categories();
        assert!(categories.iter().any(|c| c == "constants"));
        assert!(categories.iter().any(|c| c == "math"));
        assert_eq!(
            factory.get_node_classes("math"),
            vec!["math.add", "math.multiply"]
        );
        assert_eq!(factory.get_friendly_name("math.add").unwrap(), "Add");
    }
}
