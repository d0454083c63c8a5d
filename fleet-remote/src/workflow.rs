//! Prompt graph construction.

use fleet_common::GenerationParams;
use serde_json::{json, Value};

pub const DEFAULT_CHECKPOINT: &str = "v1-5-pruned-emaonly.safetensors";
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG: f32 = 7.0;
pub const DEFAULT_SIZE: u32 = 512;

fn template_vars(params: &GenerationParams, seed: u64) -> Vec<(&'static str, Value)> {
    vec![
        ("prompt", json!(params.prompt)),
        (
            "negative_prompt",
            json!(params.negative_prompt.clone().unwrap_or_default()),
        ),
        ("seed", json!(seed)),
        ("steps", json!(params.steps.unwrap_or(DEFAULT_STEPS))),
        ("cfg", json!(params.cfg.unwrap_or(DEFAULT_CFG))),
        ("width", json!(params.width.unwrap_or(DEFAULT_SIZE))),
        ("height", json!(params.height.unwrap_or(DEFAULT_SIZE))),
        (
            "checkpoint",
            json!(params
                .checkpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_CHECKPOINT.to_string())),
        ),
    ]
}

/// Replace `{{name}}` placeholders in every string of `graph`.
///
/// A string that is exactly one placeholder takes the typed value (so
/// `"{{seed}}"` becomes a number); embedded placeholders are substituted textually.
pub fn substitute_placeholders(graph: &Value, vars: &[(&str, Value)]) -> Value {
    match graph {
        Value::String(s) => {
            for (name, value) in vars {
                if s.trim() == format!("{{{{{}}}}}", name) {
                    return value.clone();
                }
            }
            let mut out = s.clone();
            for (name, value) in vars {
                let needle = format!("{{{{{}}}}}", name);
                if out.contains(&needle) {
                    let text = match value {
                        Value::String(v) => v.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&needle, &text);
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_placeholders(v, vars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_placeholders(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Built-in text-to-image graph (checkpoint -> encode -> sample -> decode -> save).
pub fn txt2img_graph(params: &GenerationParams, seed: u64) -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": seed,
                "steps": params.steps.unwrap_or(DEFAULT_STEPS),
                "cfg": params.cfg.unwrap_or(DEFAULT_CFG),
                "sampler_name": "euler",
                "scheduler": "normal",
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": {
                "ckpt_name": params.checkpoint.clone().unwrap_or_else(|| DEFAULT_CHECKPOINT.to_string())
            }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": {
                "width": params.width.unwrap_or(DEFAULT_SIZE),
                "height": params.height.unwrap_or(DEFAULT_SIZE),
                "batch_size": 1
            }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": params.prompt, "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": {
                "text": params.negative_prompt.clone().unwrap_or_default(),
                "clip": ["4", 1]
            }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": "fleet", "images": ["8", 0] }
        }
    })
}

/// Prompt graph for a job: the explicit workflow with placeholders filled
/// in, or the built-in text-to-image graph.
pub fn build_prompt(params: &GenerationParams, seed: u64) -> Value {
    match &params.workflow {
        Some(graph) if graph.is_object() => {
            substitute_placeholders(graph, &template_vars(params, seed))
        }
        _ => txt2img_graph(params, seed),
    }
}

/// Number of executable nodes in a prompt graph.
pub fn node_count(graph: &Value) -> u32 {
    graph
        .as_object()
        .map(|m| m.values().filter(|v| v.get("class_type").is_some()).count() as u32)
        .unwrap_or(0)
}
