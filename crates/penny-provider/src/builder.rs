//! Builders for constructing [`chat::Tool`] definitions by hand.
//!
//! Grounded on `querymt::builder`'s `ParamBuilder`/`FunctionBuilder`, kept
//! as-is: adapters and tool registries declare their function-calling
//! schemas with these rather than hand-assembling `serde_json::Value`.
//! `querymt`'s `LLMBuilder`/`ProviderRegistry` provider-instantiation
//! machinery is dropped — adapters here are constructed directly
//! (`HttpAdapter::new`, `MockAdapter::new`), not resolved through a runtime
//! plugin registry.

use std::collections::HashMap;

use crate::chat::{FunctionTool, ParameterProperty, ParametersSchema, Tool};

/// Builder for a single function parameter's JSON Schema entry.
pub struct ParamBuilder {
    name: String,
    property_type: String,
    description: String,
    items: Option<Box<ParamBuilder>>,
    enum_list: Option<Vec<String>>,
}

impl ParamBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            property_type: "string".to_string(),
            description: String::new(),
            items: None,
            enum_list: None,
        }
    }

    pub fn type_of<T: Into<String>>(mut self, type_str: T) -> Self {
        self.property_type = type_str.into();
        self
    }

    pub fn description<D: Into<String>>(mut self, desc: D) -> Self {
        self.description = desc.into();
        self
    }

    pub fn items(mut self, item_builder: ParamBuilder) -> Self {
        self.items = Some(Box::new(item_builder));
        self
    }

    pub fn enum_list<I, S>(mut self, vals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_list = Some(vals.into_iter().map(Into::into).collect());
        self
    }

    fn build(self) -> (String, ParameterProperty) {
        let items_prop = self.items.map(|b| Box::new(b.build().1));
        (
            self.name.clone(),
            ParameterProperty {
                property_type: self.property_type,
                description: self.description,
                items: items_prop,
                enum_list: self.enum_list,
            },
        )
    }
}

/// Builder for a `Tool` (function-calling) definition.
pub struct FunctionBuilder {
    name: String,
    description: String,
    parameters: Vec<ParamBuilder>,
    required: Vec<String>,
}

impl FunctionBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            required: Vec::new(),
        }
    }

    pub fn description<D: Into<String>>(mut self, desc: D) -> Self {
        self.description = desc.into();
        self
    }

    pub fn param(mut self, param: ParamBuilder) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Tool {
        let mut props = HashMap::new();
        for pb in self.parameters {
            let (key, prop) = pb.build();
            props.insert(key, prop);
        }

        let schema = ParametersSchema {
            schema_type: "object".to_string(),
            properties: props,
            required: self.required,
        };

        Tool {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: self.name,
                description: self.description,
                parameters: serde_json::to_value(schema).unwrap_or(serde_json::Value::Null),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_well_formed_tool_definition() {
        let tool = FunctionBuilder::new("get_weather")
            .description("Look up current weather for a city")
            .param(
                ParamBuilder::new("city")
                    .type_of("string")
                    .description("City name"),
            )
            .required(["city"])
            .build();
        assert_eq!(tool.function.name, "get_weather");
        assert_eq!(tool.tool_type, "function");
    }
}
