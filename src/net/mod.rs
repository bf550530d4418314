//! # Network Module
//!
//! A [`Network`] is an ordered list of layers wired together through named
//! tensors. Construction filters layers by phase, inserts `Split` layers
//! where one tensor feeds several consumers, sets every layer up in order
//! and works out which layers and inputs need gradients.
//!
//! The network owns every intermediate tensor. Learnable parameters stay
//! inside their layers; the network keeps alias handles to them (see
//! [`Tensor::alias`]) so that a solver can update them in place.

pub mod config;

pub use config::{insert_splits, InputConfig, NetConfig};

use crate::nn::config::Phase;
use crate::nn::layer::{LayerError, LayerInstance, LayerSlot};
use crate::nn::registry::LayerRegistry;
use crate::runtime::Context;
use crate::serialization::safetensors_io::{self, SafeTensorsError};
use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("layer '{layer}': {source}")]
    Layer {
        layer: String,
        #[source]
        source: LayerError,
    },

    #[error("layer '{layer}' reads unknown tensor '{bottom}'")]
    UnknownBottom { layer: String, bottom: String },

    #[error("layer '{layer}' produces tensor '{top}', which already exists")]
    DuplicateTop { layer: String, top: String },

    #[error("layer '{layer}' computes '{tensor}' in place, which is not supported")]
    InPlace { layer: String, tensor: String },

    #[error("networks differ: {0}")]
    LayerMismatch(String),

    #[error("parameter '{name}' has shape {actual:?}, expected {expected:?}")]
    ParamMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid network description: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Имя параметра в снапшотах: `<layer>.<index>`.
pub fn param_name(layer: &str, index: usize) -> String {
    format!("{}.{}", layer, index)
}

// INFO только в корневой сети.
fn note(root: bool, message: fmt::Arguments<'_>) {
    if root {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

pub struct Network {
    name: String,
    phase: Phase,
    ctx: Arc<Context>,
    layers: Vec<LayerInstance>,

    tensors: Vec<Tensor>,
    tensor_names: Vec<String>,
    tensor_ids: HashMap<String, usize>,
    bottom_ids: Vec<Vec<usize>>,
    top_ids: Vec<Vec<usize>>,
    input_ids: Vec<usize>,
    output_ids: Vec<usize>,

    layer_need_backward: Vec<bool>,
    bottom_need_backward: Vec<Vec<bool>>,

    params: Vec<Tensor>,
    param_names: Vec<String>,
    params_lr: Vec<f32>,
    params_weight_decay: Vec<f32>,
}

impl Network {
    /// Строит сеть для фазы `phase`.
    pub fn new(
        config: &NetConfig,
        phase: Phase,
        ctx: Arc<Context>,
        registry: &LayerRegistry,
    ) -> Result<Self> {
        let root = ctx.is_root();
        note(
            root,
            format_args!("Initializing net '{}' for phase {:?}", config.name, phase),
        );

        let filtered: Vec<_> = config
            .layers
            .iter()
            .filter(|layer| layer.included_in(phase))
            .cloned()
            .collect();
        let layer_configs = insert_splits(&config.inputs, &filtered);

        let mut net = Self {
            name: config.name.clone(),
            phase,
            ctx: Arc::clone(&ctx),
            layers: Vec::with_capacity(layer_configs.len()),
            tensors: Vec::new(),
            tensor_names: Vec::new(),
            tensor_ids: HashMap::new(),
            bottom_ids: Vec::new(),
            top_ids: Vec::new(),
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            layer_need_backward: Vec::new(),
            bottom_need_backward: Vec::new(),
            params: Vec::new(),
            param_names: Vec::new(),
            params_lr: Vec::new(),
            params_weight_decay: Vec::new(),
        };

        let mut tensor_need_backward: Vec<bool> = Vec::new();
        let mut consumed: HashSet<usize> = HashSet::new();

        for input in &config.inputs {
            let id = net.add_tensor(&input.name, "input")?;
            net.tensors[id].reshape(&input.shape);
            tensor_need_backward.push(config.force_backward);
            net.input_ids.push(id);
            note(
                root,
                format_args!("Input {} -> {}", input.name, net.tensors[id].shape_string()),
            );
        }

        for layer_config in layer_configs {
            let layer_name = layer_config.name.clone();
            let wrap = |source: LayerError| NetError::Layer {
                layer: layer_name.clone(),
                source,
            };
            note(root, format_args!("Creating Layer {}", layer_name));
            let layer = registry.create(&layer_config, phase, &ctx).map_err(wrap)?;

            let mut bottoms = Vec::with_capacity(layer_config.bottoms.len());
            for bottom in &layer_config.bottoms {
                if layer_config.tops.contains(bottom) {
                    return Err(NetError::InPlace {
                        layer: layer_name.clone(),
                        tensor: bottom.clone(),
                    });
                }
                let id = *net
                    .tensor_ids
                    .get(bottom)
                    .ok_or_else(|| NetError::UnknownBottom {
                        layer: layer_name.clone(),
                        bottom: bottom.clone(),
                    })?;
                note(root, format_args!("{} <- {}", layer_name, bottom));
                consumed.insert(id);
                bottoms.push(id);
            }
            let mut tops = Vec::with_capacity(layer_config.tops.len());
            for top in &layer_config.tops {
                tops.push(net.add_tensor(top, &layer_name)?);
                tensor_need_backward.push(false);
                note(root, format_args!("{} -> {}", layer_name, top));
            }

            let mut instance = LayerInstance::new(layer_config.clone(), layer, Arc::clone(&ctx));
            net.setup_layer(&mut instance, &bottoms, &tops).map_err(wrap)?;
            for &id in &tops {
                note(
                    root,
                    format_args!("Top shape: {}", net.tensors[id].shape_string()),
                );
            }

            // Параметры с lr_mult == 0 не обучаются и не требуют градиента.
            let mut need_backward = bottoms.iter().any(|&id| tensor_need_backward[id]);
            for index in 0..instance.num_blobs() {
                let spec = layer_config.param_spec(index);
                let learnable = spec.lr_mult != 0.0;
                instance.set_param_propagate_down(index, learnable);
                need_backward |= learnable;
                net.param_names.push(param_name(&layer_name, index));
                net.params_lr.push(spec.lr_mult);
                net.params_weight_decay.push(spec.decay_mult);
            }
            for &id in &tops {
                tensor_need_backward[id] = need_backward;
            }
            net.bottom_need_backward.push(
                bottoms
                    .iter()
                    .enumerate()
                    .map(|(j, &id)| tensor_need_backward[id] && instance.allow_force_backward(j))
                    .collect(),
            );
            net.layer_need_backward.push(need_backward);
            net.bottom_ids.push(bottoms);
            net.top_ids.push(tops);
            net.layers.push(instance);
        }

        net.prune_backward(config.force_backward, &mut tensor_need_backward);
        for (i, layer) in net.layers.iter().enumerate() {
            if net.layer_need_backward[i] {
                note(root, format_args!("{} needs backward computation.", layer.name()));
            } else {
                note(root, format_args!("{} does not need backward computation.", layer.name()));
            }
        }

        net.output_ids = (0..net.tensors.len())
            .filter(|id| !consumed.contains(id))
            .collect();
        for &id in &net.output_ids {
            note(
                root,
                format_args!("This network produces output {}", net.tensor_names[id]),
            );
        }
        net.rebuild_params();
        note(root, format_args!("Network initialization done."));
        Ok(net)
    }

    fn add_tensor(&mut self, name: &str, producer: &str) -> Result<usize> {
        if self.tensor_ids.contains_key(name) {
            return Err(NetError::DuplicateTop {
                layer: producer.to_string(),
                top: name.to_string(),
            });
        }
        let id = self.tensors.len();
        self.tensors.push(Tensor::default());
        self.tensor_names.push(name.to_string());
        self.tensor_ids.insert(name.to_string(), id);
        Ok(id)
    }

    fn setup_layer(
        &mut self,
        instance: &mut LayerInstance,
        bottom_ids: &[usize],
        top_ids: &[usize],
    ) -> std::result::Result<(), LayerError> {
        let mut tops: Vec<Tensor> = top_ids
            .iter()
            .map(|&id| std::mem::take(&mut self.tensors[id]))
            .collect();
        let bottoms: Vec<&Tensor> = bottom_ids.iter().map(|&id| &self.tensors[id]).collect();
        let result = instance.setup(&bottoms, &mut tops);
        for (&id, tensor) in top_ids.iter().zip(tops) {
            self.tensors[id] = tensor;
        }
        result
    }

    /// Отключает backward у слоев, не влияющих на потери.
    fn prune_backward(&mut self, force_backward: bool, tensor_need_backward: &mut [bool]) {
        let mut under_loss: HashSet<usize> = HashSet::new();
        for i in (0..self.layers.len()).rev() {
            let contributes = self.top_ids[i]
                .iter()
                .enumerate()
                .any(|(j, id)| self.layers[i].loss_weight(j) != 0.0 || under_loss.contains(id));
            if !contributes {
                self.layer_need_backward[i] = false;
                for flag in self.bottom_need_backward[i].iter_mut() {
                    *flag = false;
                }
            } else {
                under_loss.extend(self.bottom_ids[i].iter().copied());
            }
        }

        if force_backward {
            for i in 0..self.layers.len() {
                self.layer_need_backward[i] = true;
                for (j, &id) in self.bottom_ids[i].iter().enumerate() {
                    let allowed = self.layers[i].allow_force_backward(j);
                    self.bottom_need_backward[i][j] |= allowed;
                    tensor_need_backward[id] |= allowed;
                }
            }
        }
    }

    /// Пересобирает псевдонимы параметров после разделения или замены слоев.
    fn rebuild_params(&mut self) {
        self.params = self
            .layers
            .iter()
            .flat_map(|layer| layer.blob_aliases())
            .collect();
    }

    // --- Проходы ---

    /// Прямой проход по всей сети; возвращает суммарные взвешенные потери.
    pub fn forward(&mut self) -> Result<f32> {
        if self.layers.is_empty() {
            return Ok(0.0);
        }
        self.forward_from_to(0, self.layers.len() - 1)
    }

    /// Прямой проход по слоям `start..=end`.
    pub fn forward_from_to(&mut self, start: usize, end: usize) -> Result<f32> {
        assert!(
            start <= end && end < self.layers.len(),
            "invalid layer range {}..={} for {} layers",
            start,
            end,
            self.layers.len()
        );
        let mut loss = 0.0;
        for i in start..=end {
            let mut tops: Vec<Tensor> = self.top_ids[i]
                .iter()
                .map(|&id| std::mem::take(&mut self.tensors[id]))
                .collect();
            let bottoms: Vec<&Tensor> =
                self.bottom_ids[i].iter().map(|&id| &self.tensors[id]).collect();
            let result = self.layers[i].forward(&bottoms, &mut tops);
            for (&id, tensor) in self.top_ids[i].iter().zip(tops) {
                self.tensors[id] = tensor;
            }
            loss += result.map_err(|source| NetError::Layer {
                layer: self.layers[i].name().to_string(),
                source,
            })?;
        }
        Ok(loss)
    }

    /// Обратный проход по слоям, которым он нужен, от последнего к первому.
    pub fn backward(&mut self) -> Result<()> {
        for i in (0..self.layers.len()).rev() {
            if !self.layer_need_backward[i] {
                continue;
            }
            // Градиент выхода с весом потерь у слоя без собственной функции потерь.
            if !self.layers[i].is_loss() {
                for (j, &id) in self.top_ids[i].iter().enumerate() {
                    let weight = self.layers[i].loss_weight(j);
                    if weight != 0.0 {
                        self.tensors[id].fill_gradient(weight);
                    }
                }
            }
            let tops: Vec<&Tensor> = self.top_ids[i].iter().map(|&id| &self.tensors[id]).collect();
            let bottoms: Vec<&Tensor> =
                self.bottom_ids[i].iter().map(|&id| &self.tensors[id]).collect();
            self.layers[i]
                .backward(&tops, &self.bottom_need_backward[i], &bottoms)
                .map_err(|source| NetError::Layer {
                    layer: self.layers[i].name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn forward_backward(&mut self) -> Result<f32> {
        let loss = self.forward()?;
        self.backward()?;
        Ok(loss)
    }

    /// Обнуляет градиенты всех обучаемых параметров.
    pub fn clear_param_diffs(&self) {
        for param in &self.params {
            param.fill_gradient(0.0);
        }
    }

    /// `value -= gradient` для каждого параметра.
    pub fn update(&self) {
        for param in &self.params {
            param.update();
        }
    }

    // --- Разделение и копирование параметров ---

    /// Разделяет значения параметров одноименных слоев другой сети.
    ///
    /// Так тестовая сеть видит веса обучаемой без копирования.
    pub fn share_trained_layers_with(&mut self, other: &Network) -> Result<()> {
        for layer in self.layers.iter_mut() {
            let source = match other.layers.iter().find(|l| l.name() == layer.name()) {
                Some(source) => source,
                None => {
                    debug!("Ignoring target layer {}", layer.name());
                    continue;
                }
            };
            if layer.slot().same_layer(source.slot()) {
                continue;
            }
            let source_blobs = source.blob_aliases();
            let name = layer.name().to_string();
            layer.with_blobs_mut(|blobs| -> Result<()> {
                if blobs.len() != source_blobs.len() {
                    return Err(NetError::LayerMismatch(format!(
                        "layer '{}' has {} parameters, source has {}",
                        name,
                        blobs.len(),
                        source_blobs.len()
                    )));
                }
                for (index, (blob, source_blob)) in blobs.iter_mut().zip(&source_blobs).enumerate() {
                    if blob.shape() != source_blob.shape() {
                        return Err(NetError::ParamMismatch {
                            name: param_name(&name, index),
                            expected: blob.shape().to_vec(),
                            actual: source_blob.shape().to_vec(),
                        });
                    }
                    blob.share_value(source_blob);
                }
                Ok(())
            })?;
        }
        self.rebuild_params();
        Ok(())
    }

    /// Копирует значения параметров из карты `<layer>.<index> -> массив`.
    ///
    /// Ключи без соответствующего параметра пропускаются.
    pub fn copy_trained_layers_from(&mut self, params: &HashMap<String, ArrayD<f32>>) -> Result<()> {
        let mut copied = 0;
        for layer in self.layers.iter_mut() {
            let name = layer.name().to_string();
            copied += layer.with_blobs_mut(|blobs| -> Result<usize> {
                let mut copied = 0;
                for (index, blob) in blobs.iter_mut().enumerate() {
                    let key = param_name(&name, index);
                    let Some(array) = params.get(&key) else {
                        continue;
                    };
                    if blob.shape() != array.shape() {
                        return Err(NetError::ParamMismatch {
                            name: key,
                            expected: blob.shape().to_vec(),
                            actual: array.shape().to_vec(),
                        });
                    }
                    let mut value = blob.value_mut();
                    for (dst, &src) in value.iter_mut().zip(array.iter()) {
                        *dst = src;
                    }
                    copied += 1;
                }
                Ok(copied)
            })?;
        }
        debug!("Copied {} of {} parameter tensors", copied, params.len());
        Ok(())
    }

    /// Загружает параметры из файла `.model` (safetensors).
    pub fn copy_trained_layers_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let params = safetensors_io::load_arrays(path.as_ref())?;
        let params: HashMap<String, ArrayD<f32>> = params
            .into_iter()
            .filter(|(name, _)| !name.ends_with(".grad"))
            .collect();
        self.copy_trained_layers_from(&params)
    }

    /// Подключает слои корневой сети, которые допускают совместное использование.
    ///
    /// Сети должны быть построены из одного описания.
    pub fn share_layers_with(&mut self, root: &mut Network) -> Result<()> {
        if self.layers.len() != root.layers.len() {
            return Err(NetError::LayerMismatch(format!(
                "{} layers vs {} in the root network",
                self.layers.len(),
                root.layers.len()
            )));
        }
        for (layer, root_layer) in self.layers.iter_mut().zip(root.layers.iter_mut()) {
            if layer.name() != root_layer.name() {
                return Err(NetError::LayerMismatch(format!(
                    "layer '{}' vs '{}' in the root network",
                    layer.name(),
                    root_layer.name()
                )));
            }
            if root_layer.share_in_parallel() {
                debug!("Sharing layer {} from root net", layer.name());
                let handle = root_layer.slot_mut().share();
                *layer.slot_mut() = LayerSlot::Shared(handle);
            }
        }
        self.rebuild_params();
        Ok(())
    }

    /// Параметры в порядке слоев: `(<layer>.<index>, значения)`, плюс
    /// `<layer>.<index>.grad` при `with_gradients`.
    pub fn export_params(&self, with_gradients: bool) -> Vec<(String, ArrayD<f32>)> {
        let mut out = Vec::with_capacity(2 * self.params.len());
        for (name, param) in self.param_names.iter().zip(&self.params) {
            out.push((name.clone(), param.to_array()));
            if with_gradients {
                out.push((format!("{}.grad", name), param.gradient_to_array()));
            }
        }
        out
    }

    // --- Доступ ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn layers(&self) -> &[LayerInstance] {
        &self.layers
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&LayerInstance> {
        self.layers.iter().find(|layer| layer.name() == name)
    }

    pub fn layer_need_backward(&self, index: usize) -> bool {
        self.layer_need_backward[index]
    }

    pub fn bottom_need_backward(&self, index: usize) -> &[bool] {
        &self.bottom_need_backward[index]
    }

    pub fn tensor_names(&self) -> &[String] {
        &self.tensor_names
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.tensor_ids.contains_key(name)
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<&Tensor> {
        self.tensor_ids.get(name).map(|&id| &self.tensors[id])
    }

    pub fn tensor_by_name_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        let id = *self.tensor_ids.get(name)?;
        Some(&mut self.tensors[id])
    }

    pub fn input_tensors(&self) -> Vec<&Tensor> {
        self.input_ids.iter().map(|&id| &self.tensors[id]).collect()
    }

    /// Тензоры, которые не читает ни один слой.
    pub fn output_tensors(&self) -> Vec<&Tensor> {
        self.output_ids.iter().map(|&id| &self.tensors[id]).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_ids
            .iter()
            .map(|&id| self.tensor_names[id].as_str())
            .collect()
    }

    /// Вес потерь каждого выхода сети.
    pub fn output_loss_weights(&self) -> Vec<f32> {
        self.output_ids
            .iter()
            .map(|&id| {
                for (i, tops) in self.top_ids.iter().enumerate() {
                    if let Some(j) = tops.iter().position(|&t| t == id) {
                        return self.layers[i].loss_weight(j);
                    }
                }
                0.0
            })
            .collect()
    }

    /// Обучаемые параметры (псевдонимы буферов слоев).
    pub fn learnable_params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn params_lr(&self) -> &[f32] {
        &self.params_lr
    }

    pub fn params_weight_decay(&self) -> &[f32] {
        &self.params_weight_decay
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("layers", &self.layer_names())
            .field("params", &self.param_names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::config::{LayerConfig, ParamSpec};
    use approx::assert_abs_diff_eq;

    fn classifier(inputs: usize, classes: usize) -> NetConfig {
        let mut fc = LayerConfig::new("fc", "InnerProduct")
            .with_bottoms(&["data"])
            .with_tops(&["score"]);
        fc.inner_product.num_output = classes;
        fc.inner_product.weight_filler = crate::nn::FillerConfig::gaussian(0.0, 0.1);
        NetConfig::new("classifier")
            .with_input("data", &[2, inputs])
            .with_input("label", &[2])
            .with_layer(fc)
            .with_layer(
                LayerConfig::new("loss", "SoftmaxWithLoss")
                    .with_bottoms(&["score", "label"])
                    .with_tops(&["loss"]),
            )
            .with_layer(
                LayerConfig::new("accuracy", "Accuracy")
                    .with_bottoms(&["score", "label"])
                    .with_tops(&["accuracy"])
                    .with_phase(Phase::Test),
            )
    }

    fn build(config: &NetConfig, phase: Phase) -> Network {
        let ctx = Arc::new(Context::default().with_seed(3));
        Network::new(config, phase, ctx, &LayerRegistry::with_builtin()).unwrap()
    }

    #[test]
    fn test_phase_filter_and_splits() {
        let train = build(&classifier(3, 2), Phase::Train);
        assert_eq!(train.layer_names(), vec!["fc", "loss"]);
        assert_eq!(train.output_names(), vec!["loss"]);

        let test = build(&classifier(3, 2), Phase::Test);
        assert_eq!(
            test.layer_names(),
            vec!["label_input_split", "fc", "score_fc_split", "loss", "accuracy"]
        );
        assert_eq!(test.output_names(), vec!["loss", "accuracy"]);
        assert_eq!(test.output_loss_weights(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_backward_needs() {
        let net = build(&classifier(3, 2), Phase::Test);
        // Split меток и Accuracy не участвуют в потерях.
        assert!(!net.layer_need_backward(0));
        assert!(net.layer_need_backward(1));
        assert!(net.layer_need_backward(3));
        assert!(!net.layer_need_backward(4));
        // Вход fc не требует градиента, метки тоже.
        assert_eq!(net.bottom_need_backward(1), &[false]);
        assert_eq!(net.bottom_need_backward(3), &[true, false]);
    }

    #[test]
    fn test_frozen_params_skip_backward() {
        let mut config = classifier(3, 2);
        config.layers[0] = config.layers[0]
            .clone()
            .with_params(&[ParamSpec { lr_mult: 0.0, decay_mult: 1.0 }, ParamSpec { lr_mult: 0.0, decay_mult: 0.0 }]);
        let net = build(&config, Phase::Train);
        assert!(!net.layer_need_backward(0));
        assert_eq!(net.params_lr(), &[0.0, 0.0]);
        assert_eq!(net.params_weight_decay(), &[1.0, 0.0]);
        assert_eq!(net.param_names(), &["fc.0".to_string(), "fc.1".to_string()]);
    }

    #[test]
    fn test_configuration_errors() {
        let registry = LayerRegistry::with_builtin();
        let ctx = Arc::new(Context::default());

        let unknown = NetConfig::new("n").with_layer(
            LayerConfig::new("relu", "ReLU").with_bottoms(&["missing"]).with_tops(&["y"]),
        );
        assert!(matches!(
            Network::new(&unknown, Phase::Train, Arc::clone(&ctx), &registry),
            Err(NetError::UnknownBottom { .. })
        ));

        let in_place = NetConfig::new("n")
            .with_input("x", &[2])
            .with_layer(LayerConfig::new("relu", "ReLU").with_bottoms(&["x"]).with_tops(&["x"]));
        assert!(matches!(
            Network::new(&in_place, Phase::Train, Arc::clone(&ctx), &registry),
            Err(NetError::InPlace { .. })
        ));

        let bad_type = NetConfig::new("n")
            .with_input("x", &[2])
            .with_layer(LayerConfig::new("l", "Conv").with_bottoms(&["x"]).with_tops(&["y"]));
        assert!(matches!(
            Network::new(&bad_type, Phase::Train, ctx, &registry),
            Err(NetError::Layer { source: LayerError::UnknownType(_), .. })
        ));
    }

    #[test]
    fn test_forward_backward_accumulates_param_gradients() {
        let mut net = build(&classifier(3, 2), Phase::Train);
        net.tensor_by_name("data")
            .unwrap()
            .set_value(&[1.0, 0.0, -1.0, 0.5, 0.5, 0.5]);
        net.tensor_by_name("label").unwrap().set_value(&[0.0, 1.0]);

        net.clear_param_diffs();
        let loss = net.forward_backward().unwrap();
        assert!(loss > 0.0);
        let first: Vec<f32> = net.learnable_params()[0].gradient().to_vec();
        assert!(first.iter().any(|g| *g != 0.0));

        // Без очистки градиенты параметров складываются.
        net.forward_backward().unwrap();
        let second: Vec<f32> = net.learnable_params()[0].gradient().to_vec();
        for (a, b) in first.iter().zip(&second) {
            assert_abs_diff_eq!(2.0 * a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_share_and_copy_trained_layers() {
        let config = classifier(3, 2);
        let train = build(&config, Phase::Train);
        let mut test = build(&config, Phase::Test);
        test.share_trained_layers_with(&train).unwrap();

        train.learnable_params()[1].fill_value(0.25);
        let bias = test.layer_by_name("fc").unwrap().blob_aliases();
        assert_eq!(&*bias[1].value(), &[0.25, 0.25]);

        let mut copy = build(&config, Phase::Train);
        let exported: HashMap<_, _> = train.export_params(false).into_iter().collect();
        copy.copy_trained_layers_from(&exported).unwrap();
        assert_eq!(
            copy.learnable_params()[0].value().to_vec(),
            train.learnable_params()[0].value().to_vec()
        );
        assert!(!copy.learnable_params()[0].shares_value_with(&train.learnable_params()[0]));
    }

    #[test]
    fn test_export_with_gradients() {
        let net = build(&classifier(3, 2), Phase::Train);
        let names: Vec<String> = net.export_params(true).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["fc.0", "fc.0.grad", "fc.1", "fc.1.grad"]);
    }
}
