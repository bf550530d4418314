//! Реестр слоев: имя типа -> конструктор.

use crate::data::DataLayer;
use crate::losses::SoftmaxWithLoss;
use crate::nn::accuracy::Accuracy;
use crate::nn::activations::ReLU;
use crate::nn::config::{LayerConfig, Phase};
use crate::nn::dropout::Dropout;
use crate::nn::layer::{Layer, LayerError, Result};
use crate::nn::linear::InnerProduct;
use crate::nn::softmax::Softmax;
use crate::nn::split::Split;
use crate::runtime::Context;
use std::collections::HashMap;
use std::sync::Arc;

/// Конструктор слоя по его конфигурации, фазе сети и контексту.
pub type LayerCtor =
    Box<dyn Fn(&LayerConfig, Phase, &Arc<Context>) -> Result<Box<dyn Layer>> + Send + Sync>;

pub struct LayerRegistry {
    ctors: HashMap<String, LayerCtor>,
}

impl LayerRegistry {
    /// Пустой реестр.
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Реестр со всеми встроенными слоями.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ReLU", |config, _, _| Ok(Box::new(ReLU::new(config))));
        registry.register("Dropout", |config, phase, ctx| {
            Ok(Box::new(Dropout::new(config, phase, ctx)?))
        });
        registry.register("InnerProduct", |config, _, ctx| {
            Ok(Box::new(InnerProduct::new(config, ctx)?))
        });
        registry.register("Softmax", |config, _, _| Ok(Box::new(Softmax::new(config))));
        registry.register("SoftmaxWithLoss", |config, _, _| {
            Ok(Box::new(SoftmaxWithLoss::new(config)))
        });
        registry.register("Split", |_, _, _| Ok(Box::new(Split::new())));
        registry.register("Accuracy", |config, _, _| Ok(Box::new(Accuracy::new(config)?)));
        registry.register("Data", |config, phase, ctx| {
            Ok(Box::new(DataLayer::new(config, phase, ctx)?))
        });
        registry
    }

    /// Регистрирует (или заменяет) конструктор для типа `name`.
    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&LayerConfig, Phase, &Arc<Context>) -> Result<Box<dyn Layer>> + Send + Sync + 'static,
    {
        self.ctors.insert(name.to_string(), Box::new(ctor));
    }

    pub fn create(
        &self,
        config: &LayerConfig,
        phase: Phase,
        ctx: &Arc<Context>,
    ) -> Result<Box<dyn Layer>> {
        let ctor = self
            .ctors
            .get(&config.layer_type)
            .ok_or_else(|| LayerError::UnknownType(config.layer_type.clone()))?;
        ctor(config, phase, ctx)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Отсортированный список зарегистрированных типов.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let registry = LayerRegistry::default();
        for name in ["ReLU", "Dropout", "InnerProduct", "Softmax", "SoftmaxWithLoss", "Split", "Accuracy", "Data"] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_create_and_unknown_type() {
        let registry = LayerRegistry::default();
        let ctx = Arc::new(Context::default());
        let layer = registry
            .create(&LayerConfig::new("r", "ReLU"), Phase::Train, &ctx)
            .unwrap();
        assert_eq!(layer.layer_type(), "ReLU");

        let err = registry
            .create(&LayerConfig::new("x", "Convolution"), Phase::Train, &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, LayerError::UnknownType(t) if t == "Convolution"));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = LayerRegistry::new();
        registry.register("Identity", |_, _, _| Ok(Box::new(Split::new())));
        assert_eq!(registry.types(), vec!["Identity"]);
    }
}
