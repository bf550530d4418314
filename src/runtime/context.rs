//! Явный контекст исполнения.
//!
//! Вместо глобального синглтона режим исполнения, генератор случайных чисел
//! и параметры многосолверного обучения хранятся в одном объекте, который
//! создается один раз и передается (через `Arc`) солверу, сетям и слоям.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Режим исполнения: на хосте или на устройстве.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cpu,
    Device,
}

/// Контекст исполнения, разделяемый всеми компонентами одного процесса обучения.
#[derive(Debug)]
pub struct Context {
    mode: Mode,
    solver_count: usize,
    root_solver: bool,
    rng: Mutex<StdRng>,
}

impl Context {
    /// Создает контекст корневого солвера с ГСЧ, засеянным из энтропии ОС.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            solver_count: 1,
            root_solver: true,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Удобный конструктор, сразу оборачивающий контекст в `Arc`.
    pub fn shared(mode: Mode) -> Arc<Self> {
        Arc::new(Self::new(mode))
    }

    /// Фиксирует seed генератора.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Устанавливает количество солверов, работающих над общими параметрами.
    pub fn with_solver_count(mut self, solver_count: usize) -> Self {
        self.solver_count = solver_count.max(1);
        self
    }

    /// Помечает контекст как контекст некорневого (рабочего) солвера.
    pub fn as_worker(mut self) -> Self {
        self.root_solver = false;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn solver_count(&self) -> usize {
        self.solver_count
    }

    /// Только корневой солвер пишет снапшоты, логирует на уровне INFO и тестирует.
    pub fn is_root(&self) -> bool {
        self.root_solver
    }

    /// Пересоздает генератор с заданным seed.
    pub fn set_random_seed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    /// Следующее случайное значение общего генератора.
    pub fn random_u64(&self) -> u64 {
        self.rng.lock().gen()
    }

    /// Независимый генератор, засеянный из общего.
    ///
    /// Используется потоками и слоями, которым нужен собственный ГСЧ
    /// (потоки предвыборки, dropout): последовательность остается
    /// воспроизводимой при фиксированном seed контекста.
    pub fn fork_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.random_u64())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Mode::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_root_cpu() {
        let ctx = Context::default();
        assert_eq!(ctx.mode(), Mode::Cpu);
        assert!(ctx.is_root());
        assert_eq!(ctx.solver_count(), 1);
    }

    #[test]
    fn test_seeded_forks_are_reproducible() {
        let a = Context::new(Mode::Cpu).with_seed(7);
        let b = Context::new(Mode::Cpu).with_seed(7);
        let xa: u32 = a.fork_rng().gen();
        let xb: u32 = b.fork_rng().gen();
        assert_eq!(xa, xb);
    }

    #[test]
    fn test_worker_context() {
        let ctx = Context::new(Mode::Device).with_solver_count(4).as_worker();
        assert!(!ctx.is_root());
        assert_eq!(ctx.solver_count(), 4);
        assert_eq!(ctx.mode(), Mode::Device);
    }
}
