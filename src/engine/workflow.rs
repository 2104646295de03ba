//! Workflow templates and their parameter bindings.
//!
//! A template is a backend graph (`<templateId>.json`, node id -> node)
//! plus a bindings file (`<templateId>.bindings.json`) mapping logical
//! keys such as `positive` or `seed` to `{node, input}`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::model::JsonMap;
use crate::model::lora::ResolvedLora;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Binding {
    pub node: String,
    pub input: String,
}

#[derive(Debug, Clone)]
pub struct Workflow {
    graph: JsonMap,
    bindings: BTreeMap<String, Binding>,
}

/// Nodes added and LoRAs applied by [`Workflow::chain_loras`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraChain {
    pub applied: usize,
    pub added_nodes: usize,
}

impl Workflow {
    pub fn new(graph: Value, bindings: BTreeMap<String, Binding>) -> Result<Self> {
        match graph {
            Value::Object(graph) => Ok(Self { graph, bindings }),
            _ => Err(Error::Other("workflow template must be a JSON object".into())),
        }
    }

    /// An inline graph without bindings.
    pub fn inline(graph: Value) -> Result<Self> {
        Self::new(graph, BTreeMap::new())
    }

    /// Load `<dir>/<templateId>.json` and its optional bindings file.
    pub async fn load(dir: &Path, template_id: &str) -> Result<Self> {
        let template_path = dir.join(format!("{template_id}.json"));
        if !tokio::fs::try_exists(&template_path).await? {
            return Err(Error::Other(format!(
                "generate job missing input.workflow and template not found: {}",
                template_path.display()
            )));
        }
        let graph: Value = serde_json::from_slice(&tokio::fs::read(&template_path).await?)?;
        let bindings_path = dir.join(format!("{template_id}.bindings.json"));
        let bindings = if tokio::fs::try_exists(&bindings_path).await? {
            serde_json::from_slice(&tokio::fs::read(&bindings_path).await?)?
        } else {
            BTreeMap::new()
        };
        Self::new(graph, bindings)
    }

    pub fn binding(&self, key: &str) -> Option<&Binding> {
        self.bindings.get(key)
    }

    fn inputs_mut(&mut self, node: &str) -> Option<&mut JsonMap> {
        self.graph
            .get_mut(node)?
            .get_mut("inputs")?
            .as_object_mut()
    }

    /// Set the bound input. Returns false when the key is unbound or its
    /// node has no inputs.
    pub fn apply(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let Some(Binding { node, input }) = self.bindings.get(key).cloned() else {
            return false;
        };
        match self.inputs_mut(&node) {
            Some(inputs) => {
                inputs.insert(input, value.into());
                true
            }
            None => false,
        }
    }

    /// The first LoRA goes into the node bound to `lora_name`; each further
    /// LoRA gets a cloned loader node chained after the previous one, and
    /// every consumer of the base loader's model/clip outputs is rewired
    /// to the end of the chain. `None` when `lora_name` is unbound.
    pub fn chain_loras(&mut self, loras: &[ResolvedLora]) -> Option<LoraChain> {
        let base_id = self.binding("lora_name")?.node.clone();
        let base = self.graph.get(&base_id)?.clone();
        let base_inputs = base.get("inputs")?.as_object()?.clone();
        let Some(first) = loras.first() else {
            return Some(LoraChain {
                applied: 0,
                added_nodes: 0,
            });
        };
        if let Some(inputs) = self.inputs_mut(&base_id) {
            set_lora(inputs, first);
        }

        let mut prev = base_id.clone();
        let mut added = Vec::new();
        for lora in &loras[1..] {
            let id = self.next_node_id();
            let mut inputs = base_inputs.clone();
            inputs.insert("model".into(), json!([prev, 0]));
            inputs.insert("clip".into(), json!([prev, 1]));
            set_lora(&mut inputs, lora);
            self.graph.insert(
                id.clone(),
                json!({ "class_type": base.get("class_type").cloned().unwrap_or(Value::Null), "inputs": inputs }),
            );
            added.push(id.clone());
            prev = id;
        }

        if !added.is_empty() {
            for (id, node) in self.graph.iter_mut() {
                if *id == base_id || added.contains(id) {
                    continue;
                }
                let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                    continue;
                };
                for value in inputs.values_mut() {
                    if let Some(slot) = base_output_slot(value, &base_id) {
                        *value = json!([prev, slot]);
                    }
                }
            }
        }
        Some(LoraChain {
            applied: loras.len(),
            added_nodes: added.len(),
        })
    }

    fn next_node_id(&self) -> String {
        let max = self
            .graph
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.graph)
    }
}

fn set_lora(inputs: &mut JsonMap, lora: &ResolvedLora) {
    inputs.insert("lora_name".into(), json!(lora.lora_name));
    inputs.insert("strength_model".into(), json!(lora.strength_model));
    inputs.insert("strength_clip".into(), json!(lora.strength_clip));
}

/// `Some(0 | 1)` for a link `[base, 0]` or `[base, 1]`.
fn base_output_slot(value: &Value, base_id: &str) -> Option<u64> {
    let link = value.as_array().filter(|a| a.len() >= 2)?;
    let node = match &link[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let slot = link[1].as_u64().filter(|s| *s <= 1)?;
    (node == base_id).then_some(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Workflow {
        let graph = json!({
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": ""}},
            "10": {"class_type": "LoraLoader", "inputs": {
                "model": ["4", 0], "clip": ["4", 1],
                "lora_name": "", "strength_model": 1.0, "strength_clip": 1.0
            }},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["10", 1]}},
            "3": {"class_type": "KSampler", "inputs": {"model": ["10", 0], "seed": 0}}
        });
        let bindings: BTreeMap<String, Binding> = serde_json::from_value(json!({
            "checkpoint": {"node": "4", "input": "ckpt_name"},
            "lora_name": {"node": "10", "input": "lora_name"},
            "positive": {"node": "6", "input": "text"},
            "seed": {"node": "3", "input": "seed"},
            "missing_node": {"node": "99", "input": "x"}
        }))
        .unwrap();
        Workflow::new(graph, bindings).unwrap()
    }

    fn lora(name: &str) -> ResolvedLora {
        ResolvedLora {
            lora_id: None,
            release_id: None,
            lora_name: name.into(),
            strength_model: 0.8,
            strength_clip: 0.7,
        }
    }

    #[test]
    fn apply_sets_bound_inputs_only() {
        let mut wf = template();
        assert!(wf.apply("seed", 42));
        assert!(wf.apply("positive", "a ship"));
        assert!(!wf.apply("width", 512));
        assert!(!wf.apply("missing_node", 1));
        let graph = wf.into_value();
        assert_eq!(graph["3"]["inputs"]["seed"], json!(42));
        assert_eq!(graph["6"]["inputs"]["text"], json!("a ship"));
    }

    #[test]
    fn lora_chain_rewires_consumers() {
        let mut wf = template();
        let chain = wf.chain_loras(&[lora("a.safetensors"), lora("b.safetensors"), lora("c.safetensors")]);
        assert_eq!(
            chain,
            Some(LoraChain {
                applied: 3,
                added_nodes: 2
            })
        );
        let graph = wf.into_value();
        assert_eq!(graph["10"]["inputs"]["lora_name"], json!("a.safetensors"));
        assert_eq!(graph["11"]["inputs"]["model"], json!(["10", 0]));
        assert_eq!(graph["12"]["inputs"]["clip"], json!(["11", 1]));
        assert_eq!(graph["12"]["inputs"]["lora_name"], json!("c.safetensors"));
        assert_eq!(graph["3"]["inputs"]["model"], json!(["12", 0]));
        assert_eq!(graph["6"]["inputs"]["clip"], json!(["12", 1]));
        // The base loader still reads from the checkpoint.
        assert_eq!(graph["10"]["inputs"]["model"], json!(["4", 0]));
    }

    #[test]
    fn lora_chain_needs_a_binding() {
        let mut wf = Workflow::inline(json!({"1": {"inputs": {}}})).unwrap();
        assert!(wf.chain_loras(&[lora("a")]).is_none());
    }
}
