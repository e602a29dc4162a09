//! Tune P3M for a random salt-like system, and report the parameters and energies.
//!
//! `RUST_LOG=debug p3m_sample --accuracy 1e-4` shows the tuner's progress.

use std::{error::Error, fs, path::PathBuf};

use clap::{Parser, ValueEnum};
use lin_alg::f64::Vec3;
use log::info;
use p3m::{Differentiation, P3m, P3mConfig, Particles, SimBox, ambient::virial_trace};
use rand::{Rng, SeedableRng, rngs::StdRng};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DiffArg {
    Spectral,
    FiniteDifference,
}

impl From<DiffArg> for Differentiation {
    fn from(v: DiffArg) -> Self {
        match v {
            DiffArg::Spectral => Self::Spectral,
            DiffArg::FiniteDifference => Self::FiniteDifference,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "p3m_sample", about = "Tune and run P3M on random charges", version)]
struct Cli {
    /// Cubic box edge length.
    #[arg(short = 'l', long, default_value_t = 10.)]
    box_len: f64,

    /// Particles per unit volume.
    #[arg(short, long, default_value_t = 0.3)]
    density: f64,

    /// Target RMS force error.
    #[arg(short, long, default_value_t = 1e-2)]
    accuracy: f64,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = DiffArg::Spectral)]
    differentiation: DiffArg,

    /// Time the best candidates over this many evaluations each.
    #[arg(long, default_value_t = 0)]
    timing_trials: usize,

    /// JSON file with a full solver configuration. Overrides the accuracy and
    /// differentiation flags.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => P3mConfig {
            accuracy: cli.accuracy,
            differentiation: cli.differentiation.into(),
            timing_trials: cli.timing_trials,
            ..Default::default()
        },
    };

    let cell = SimBox::cubic(cli.box_len)?;
    let n = ((cli.density * cell.volume()).round() as usize).max(2) & !1;

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let posits: Vec<Vec3> = (0..n)
        .map(|_| {
            Vec3::new(
                rng.random::<f64>() * cli.box_len,
                rng.random::<f64>() * cli.box_len,
                rng.random::<f64>() * cli.box_len,
            )
        })
        .collect();
    let charges: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { 1. } else { -1. }).collect();
    let particles = Particles::new(&posits, &charges)?;

    info!("{n} particles in a box of edge {}", cli.box_len);

    let mut p3m = P3m::new(config)?;
    let tuned = *p3m.tune(&cell, &particles)?;
    let p = tuned.params;

    println!(
        "alpha: {:.5}  mesh: {:?}  order: {}  r_cut: {:.4}",
        p.alpha, p.mesh, p.order, p.r_cut
    );
    println!(
        "Predicted error: real {:.3e}  recip {:.3e}  total {:.3e}",
        tuned.real_error, tuned.recip_error, tuned.total_error
    );

    // Tuning is deterministic for a fixed system.
    let again = *p3m.retune(&cell, &particles)?;
    if again.params != p {
        println!("Retune chose different parameters: {:?}", again.params);
    }

    let out = p3m.compute(&cell, &particles)?;
    let e = out.energy;

    println!(
        "Energy: real {:.6}  recip {:.6}  self {:.6}  neutralization {:.6}  total {:.6}",
        e.real,
        e.recip,
        e.self_energy,
        e.neutralization,
        e.total()
    );

    let net = out.forces.iter().fold(Vec3::new_zero(), |acc, f| acc + *f);
    println!(
        "Virial trace: {:.6}  net force: {:.3e}",
        virial_trace(&out.virial),
        net.magnitude()
    );

    Ok(())
}
