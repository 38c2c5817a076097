use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{context::ToolContext, error::ToolError};

pub type Arguments = Map<String, Value>;

/// Uniform call contract for every tool body. Handlers enforce their own
/// rate-limit category and write their own audit entry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: ToolContext, args: Arguments) -> Result<Value, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
        (self)(ctx, args).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub fn tool_def(name: &str, description: &str, input_schema: Value) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

struct ToolEntry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Immutable name → (descriptor, handler) table. Each entry carries both
/// halves, so the described names and the callable names are the same set.
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.index
            .get(name)
            .map(|idx| self.entries[*idx].handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub async fn dispatch(
        &self,
        ctx: ToolContext,
        name: &str,
        args: Arguments,
    ) -> Result<Value, ToolError> {
        let handler = self
            .lookup(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler.call(ctx, args).await
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    entries: Vec<ToolEntry>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, descriptor: ToolDescriptor, handler: impl ToolHandler + 'static) -> Self {
        self.entries.push(ToolEntry {
            descriptor,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn build(self) -> Result<ToolRegistry> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            let name = entry.descriptor.name.as_str();
            if name.trim().is_empty() {
                bail!("Tool registered with a blank name");
            }
            if name.trim() != name {
                bail!("Tool name has surrounding whitespace: {name:?}");
            }
            if index.insert(name.to_string(), idx).is_some() {
                bail!("Tool registered twice: {name}");
            }
        }

        Ok(ToolRegistry {
            entries: self.entries,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::{json, Map, Value};

    use super::{tool_def, Arguments, ToolRegistry};
    use crate::{context::ToolContext, error::ToolError, test_support::test_context};

    async fn echo(_ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
        Ok(Value::Object(args))
    }

    fn sample_registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(tool_def("echo", "Echo arguments", json!({"type": "object"})), echo)
            .register(
                tool_def("fail", "Always fails", json!({"type": "object"})),
                |_ctx: ToolContext, _args: Arguments| async { Err(ToolError::failed("boom")) },
            )
            .build()
            .expect("registry builds")
    }

    #[test]
    fn duplicate_blank_and_padded_names_are_rejected() {
        let dup = ToolRegistry::builder()
            .register(tool_def("echo", "a", json!({})), echo)
            .register(tool_def("echo", "b", json!({})), echo)
            .build();
        assert!(dup.is_err());

        let blank = ToolRegistry::builder()
            .register(tool_def("  ", "a", json!({})), echo)
            .build();
        assert!(blank.is_err());

        let padded = ToolRegistry::builder()
            .register(tool_def(" echo ", "a", json!({})), echo)
            .build();
        assert!(padded.is_err());
    }

    #[test]
    fn descriptors_and_handlers_are_a_bijection() {
        let registry = crate::tools::build_registry().expect("default registry builds");
        let described = registry
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect::<Vec<_>>();
        let unique = described.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(unique.len(), described.len());

        for name in registry.names() {
            assert!(registry.lookup(&name).is_some());
            assert_eq!(described.iter().filter(|d| **d == name).count(), 1);
        }
        assert_eq!(registry.names().len(), registry.len());
    }

    #[tokio::test]
    async fn dispatch_passes_arguments_and_propagates_failures() {
        let registry = sample_registry();
        let (ctx, _guard) = test_context();

        let mut args = Map::new();
        args.insert("value".to_string(), json!(42));
        let echoed = registry
            .dispatch(ctx.clone(), "echo", args)
            .await
            .expect("echo succeeds");
        assert_eq!(echoed, json!({"value": 42}));

        let err = registry
            .dispatch(ctx.clone(), "fail", Map::new())
            .await
            .expect_err("fail propagates");
        assert_eq!(err.to_string(), "boom");

        let missing = registry
            .dispatch(ctx, "nope", Map::new())
            .await
            .expect_err("unknown tool");
        assert!(matches!(missing, ToolError::NotFound(name) if name == "nope"));
    }
}
