//  src/main.rs
//! Командная строка: обучение, оценка и генерация синтетических данных.

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, Normal};
use rustylayers::data::{Database, Datum, JsonDb, OpenMode, Transaction};
use rustylayers::net::{NetConfig, Network};
use rustylayers::nn::{LayerRegistry, Phase};
use rustylayers::runtime::{Context, Mode};
use rustylayers::solver::{SignalHandler, Solver, SolverAction, SolverConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "RustyLayers: layer-graph training engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Обучить сеть по описанию солвера (JSON).
    Train {
        #[arg(long)]
        solver: PathBuf,
        /// Продолжить обучение с файла `.state`.
        #[arg(long, conflicts_with = "weights")]
        snapshot: Option<PathBuf>,
        /// Начальные веса из файла `.model`.
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Переопределить режим исполнения из описания солвера.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Действие по SIGINT (Ctrl-C).
        #[arg(long, value_enum, default_value = "stop")]
        sigint_effect: EffectArg,
        /// Действие по SIGHUP.
        #[arg(long, value_enum, default_value = "snapshot")]
        sighup_effect: EffectArg,
    },
    /// Оценить обученную модель: средние выходы сети в фазе TEST.
    Test {
        /// Описание сети (JSON).
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        weights: PathBuf,
        #[arg(long, default_value_t = 50)]
        iterations: usize,
        #[arg(long, value_enum, default_value = "cpu")]
        mode: ModeArg,
    },
    /// Записать синтетический набор данных для слоя Data.
    SynthData {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 1000)]
        count: usize,
        #[arg(long, default_value_t = 4)]
        classes: usize,
        #[arg(long, default_value_t = 1)]
        channels: usize,
        #[arg(long, default_value_t = 8)]
        height: usize,
        #[arg(long, default_value_t = 8)]
        width: usize,
        #[arg(long, default_value_t = 0.3)]
        noise: f32,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Cpu,
    Device,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EffectArg {
    Stop,
    Snapshot,
    None,
}

impl From<EffectArg> for SolverAction {
    fn from(effect: EffectArg) -> Self {
        match effect {
            EffectArg::Stop => SolverAction::Stop,
            EffectArg::Snapshot => SolverAction::Snapshot,
            EffectArg::None => SolverAction::None,
        }
    }
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cpu => Mode::Cpu,
            ModeArg::Device => Mode::Device,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Train {
            solver,
            snapshot,
            weights,
            mode,
            sigint_effect,
            sighup_effect,
        } => train(
            solver,
            snapshot,
            weights,
            mode,
            [sigint_effect.into(), sighup_effect.into()],
        ),
        Command::Test {
            model,
            weights,
            iterations,
            mode,
        } => test(model, weights, iterations, mode.into()),
        Command::SynthData {
            output,
            count,
            classes,
            channels,
            height,
            width,
            noise,
            seed,
        } => synth_data(output, count, classes, [channels, height, width], noise, seed),
    }
}

fn train(
    solver_path: PathBuf,
    snapshot: Option<PathBuf>,
    weights: Option<PathBuf>,
    mode: Option<ModeArg>,
    [on_interrupt, on_hangup]: [SolverAction; 2],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SolverConfig::from_file(&solver_path)?;
    if let Some(mode) = mode {
        config.solver_mode = mode.into();
    }
    info!("Using {:?} mode", config.solver_mode);
    let ctx = Context::shared(config.solver_mode);

    // Обработчик должен жить, пока идет обучение.
    let signals = SignalHandler::new(on_interrupt, on_hangup)?;
    let mut solver = Solver::new(config, ctx, &LayerRegistry::with_builtin())?
        .with_action_callback(signals.action_callback());
    if let Some(weights) = &weights {
        info!("Finetuning from {}", weights.display());
        solver.net_mut().copy_trained_layers_from_file(weights)?;
    }
    solver.solve(snapshot.as_deref())?;
    Ok(())
}

fn test(
    model: PathBuf,
    weights: PathBuf,
    iterations: usize,
    mode: Mode,
) -> Result<(), Box<dyn std::error::Error>> {
    let net_config = NetConfig::from_file(&model)?;
    let ctx = Arc::new(Context::new(mode));
    let mut net = Network::new(&net_config, Phase::Test, ctx, &LayerRegistry::with_builtin())?;
    net.copy_trained_layers_from_file(&weights)?;
    info!("Running for {} iterations.", iterations);

    let mut scores: Vec<f32> = Vec::new();
    let mut loss = 0.0;
    for i in 0..iterations {
        loss += net.forward()?;
        let values: Vec<f32> = net
            .output_tensors()
            .iter()
            .flat_map(|tensor| tensor.value().to_vec())
            .collect();
        if i == 0 {
            scores = values;
        } else {
            for (score, value) in scores.iter_mut().zip(values) {
                *score += value;
            }
        }
    }

    let denominator = iterations.max(1) as f32;
    info!("Loss: {}", loss / denominator);
    let mut index = 0;
    for (name, tensor) in net.output_names().into_iter().zip(net.output_tensors()) {
        for _ in 0..tensor.count() {
            info!("{} = {}", name, scores.get(index).copied().unwrap_or(0.0) / denominator);
            index += 1;
        }
    }
    Ok(())
}

/// Классы - гауссовы облака вокруг случайных центров.
fn synth_data(
    output: PathBuf,
    count: usize,
    classes: usize,
    [channels, height, width]: [usize; 3],
    noise: f32,
    seed: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    if classes == 0 {
        return Err("--classes must be positive".into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let len = channels * height * width;
    let centers: Vec<Vec<f32>> = (0..classes)
        .map(|_| (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let normal = Normal::new(0.0, noise)?;

    let mut db = JsonDb::open(&output, OpenMode::New)?;
    {
        let mut txn = db.new_transaction()?;
        for i in 0..count {
            let label = rng.gen_range(0..classes);
            let values: Vec<f32> = centers[label]
                .iter()
                .map(|&c| c + normal.sample(&mut rng))
                .collect();
            let datum = Datum::from_floats(channels, height, width, values, label as i32);
            txn.put(&format!("{:08}", i), datum.encode()?);
        }
        txn.commit()?;
    }
    info!("Wrote {} records to {}", db.len(), output.display());
    Ok(())
}
