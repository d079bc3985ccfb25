//! Operator tool for checkpoints and the inference engine
//!
//! ```text
//! zero_tool locate <train_dir>
//! zero_tool deploy <train_dir> <serve_dir>
//! zero_tool eval <config.json> [batch_size]
//! ```

use anyhow::{bail, Context};
use rand::Rng;
use std::env;
use std::time::Instant;
use zero_go::core::{EncodedBoard, BOARD_SIZE, FEATURE_LEN, PASS_INDEX};
use zero_go::ml::checkpoint;
use zero_go::{InferenceEngine, ModelConfig, ZeroModel};

const USAGE: &str = "Usage:
  zero_tool locate <train_dir>
  zero_tool deploy <train_dir> <serve_dir>
  zero_tool eval <config.json> [batch_size]";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("locate") if args.len() == 3 => locate(&args[2]),
        Some("deploy") if args.len() == 4 => deploy(&args[2], &args[3]),
        Some("eval") if args.len() == 3 || args.len() == 4 => {
            let batch_size = match args.get(3) {
                Some(n) => n
                    .parse::<usize>()
                    .with_context(|| format!("bad batch size '{}'", n))?,
                None => 8,
            };
            eval(&args[2], batch_size)
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

fn locate(train_dir: &str) -> anyhow::Result<()> {
    let latest = checkpoint::locate(train_dir)?;

    // Output as JSON line
    let output = serde_json::json!({
        "path": latest.path(),
        "global_step": latest.global_step,
        "files": latest.files,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn deploy(train_dir: &str, serve_dir: &str) -> anyhow::Result<()> {
    let deployed = checkpoint::deploy_latest(train_dir, serve_dir)?;

    // verify before anyone serves from it
    let config = ModelConfig::new(serve_dir);
    let engine = InferenceEngine::from_config(&config)
        .with_context(|| format!("deployed checkpoint in {} does not load", serve_dir))?;
    if engine.global_step()? != deployed.global_step {
        bail!(
            "serving dir reports step {} after deploying step {}",
            engine.global_step()?,
            deployed.global_step
        );
    }

    println!(
        "{}",
        serde_json::to_string(&serde_json::json!({
            "path": deployed.path(),
            "global_step": deployed.global_step,
        }))?
    );
    Ok(())
}

fn eval(config_path: &str, batch_size: usize) -> anyhow::Result<()> {
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }
    let config = ModelConfig::load(config_path)?;
    let engine = InferenceEngine::from_config(&config)?;

    let mut rng = rand::thread_rng();
    let batch: Vec<EncodedBoard> = (0..batch_size)
        .map(|_| {
            let bits: Vec<bool> = (0..FEATURE_LEN).map(|_| rng.gen_bool(0.1)).collect();
            EncodedBoard::from_bools(&bits)
        })
        .collect::<Result<_, _>>()?;

    let start = Instant::now();
    let output = engine.forward(&batch)?;
    let elapsed = start.elapsed();

    for (i, (policy, value)) in output.iter().enumerate() {
        let (best, prob) = policy
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (j, &p)| if p > best.1 { (j, p) } else { best });
        let mv = if best == PASS_INDEX {
            "pass".to_string()
        } else {
            format!("({}, {})", best % BOARD_SIZE, best / BOARD_SIZE)
        };
        println!("#{:<3} value={:+.4} best={} p={:.4}", i, value, mv, prob);
    }
    println!(
        "{}: step {} on {}, batch {} in {:.1}ms",
        engine.name(),
        engine.global_step()?,
        engine.device(),
        batch_size,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}
