//! Описание сети: входы и упорядоченный список слоев.

use super::{NetError, Result};
use crate::nn::config::LayerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Вход сети, который заполняет вызывающий код.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    /// Считать градиенты для всех входов, где это допускают слои.
    #[serde(default)]
    pub force_backward: bool,
    pub layers: Vec<LayerConfig>,
}

impl NetConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, name: &str, shape: &[usize]) -> Self {
        self.inputs.push(InputConfig {
            name: name.to_string(),
            shape: shape.to_vec(),
        });
        self
    }

    pub fn with_layer(mut self, layer: LayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| NetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn split_layer_name(tensor: &str, producer: &str) -> String {
    format!("{}_{}_split", tensor, producer)
}

fn split_top_name(tensor: &str, producer: &str, index: usize) -> String {
    format!("{}_{}_split_{}", tensor, producer, index)
}

/// Вставляет слои `Split` для тензоров, которые читают несколько потребителей.
///
/// Ненулевой вес потерь у выхода считается еще одним потребителем: такой
/// выход переносит вес на нулевой выход split-слоя.
pub fn insert_splits(inputs: &[InputConfig], layers: &[LayerConfig]) -> Vec<LayerConfig> {
    let mut consumers: HashMap<&str, usize> = HashMap::new();
    for layer in layers {
        for bottom in &layer.bottoms {
            *consumers.entry(bottom.as_str()).or_default() += 1;
        }
        for (i, top) in layer.tops.iter().enumerate() {
            if layer.loss_weights.get(i).copied().unwrap_or(0.0) != 0.0 {
                *consumers.entry(top.as_str()).or_default() += 1;
            }
        }
    }

    let mut next_split: HashMap<String, usize> = HashMap::new();
    let mut producer_of: HashMap<String, String> = HashMap::new();
    let mut result = Vec::with_capacity(layers.len());

    let split = |tensor: &str, producer: &str, count: usize, loss_weight: f32| {
        let mut config = LayerConfig::new(&split_layer_name(tensor, producer), "Split");
        config.bottoms = vec![tensor.to_string()];
        config.tops = (0..count)
            .map(|k| split_top_name(tensor, producer, k))
            .collect();
        if loss_weight != 0.0 {
            let mut weights = vec![0.0; count];
            weights[0] = loss_weight;
            config.loss_weights = weights;
        }
        config
    };

    for input in inputs {
        let count = consumers.get(input.name.as_str()).copied().unwrap_or(0);
        producer_of.insert(input.name.clone(), "input".to_string());
        if count > 1 {
            result.push(split(&input.name, "input", count, 0.0));
            next_split.insert(input.name.clone(), 0);
        }
    }

    for layer in layers {
        let mut layer = layer.clone();
        for bottom in layer.bottoms.iter_mut() {
            if let Some(k) = next_split.get_mut(bottom.as_str()) {
                let producer = producer_of
                    .get(bottom.as_str())
                    .cloned()
                    .unwrap_or_default();
                let renamed = split_top_name(bottom, &producer, *k);
                *k += 1;
                *bottom = renamed;
            }
        }

        let mut splits = Vec::new();
        for (i, top) in layer.tops.iter().enumerate() {
            producer_of.insert(top.clone(), layer.name.clone());
            let count = consumers.get(top.as_str()).copied().unwrap_or(0);
            if count > 1 {
                let weight = layer.loss_weights.get(i).copied().unwrap_or(0.0);
                splits.push(split(top, &layer.name, count, weight));
                // Вес потерь переходит к split-слою.
                next_split.insert(top.clone(), if weight != 0.0 { 1 } else { 0 });
                if weight != 0.0 {
                    layer.loss_weights[i] = 0.0;
                }
            }
        }
        result.push(layer);
        result.extend(splits);
    }
    result
}
