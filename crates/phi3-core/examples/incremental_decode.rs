//! Greedy incremental decoding on a randomly initialized model.
//!
//! Builds a small Phi-3 from a config (the built-in tiny one, or a
//! `config.json` given on the command line), prefills a prompt into the KV
//! cache, then generates one token per step.
//!
//! Run with:
//! ```bash
//! RUST_LOG=phi3_core=debug cargo run -p phi3-core --example incremental_decode -- [config.json]
//! ```

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use phi3_core::prelude::*;
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const MAX_NEW_TOKENS: usize = 16;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ModelConfig::from_file(Path::new(&path))?,
        None => ModelConfig::tiny(),
    };
    if config.architecture != Architecture::CausalLm {
        anyhow::bail!("greedy decoding needs a causal-lm config");
    }

    println!("Incremental Decode Example");
    println!("==========================\n");
    println!(
        "Model: {} layers, {} hidden, {} heads ({} kv)",
        config.num_hidden_layers,
        config.hidden_size,
        config.num_attention_heads,
        config.num_kv_heads()
    );

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Phi3Model::new(&config, vb)?;

    let bos = config.bos_token_id.unwrap_or(1);
    let prompt: Vec<u32> = std::iter::once(bos)
        .chain((3..10).map(|i| i % config.vocab_size as u32))
        .collect();
    println!("Prompt: {:?}", prompt);

    let mut cache = model.init_cache(1, prompt.len() + MAX_NEW_TOKENS)?;

    // Prefill
    let start = Instant::now();
    let input = Tensor::from_vec(prompt.clone(), (1, prompt.len()), &device)?;
    let output = model.forward(&ForwardInputs::from_ids(input), Some(&mut cache))?;
    let mut next = last_token_argmax(&output.logits)?;
    println!("Prefill: {:?} ({} positions cached)", start.elapsed(), cache.seq_len());

    // Decode
    let mut generated = vec![next];
    let start = Instant::now();
    while generated.len() < MAX_NEW_TOKENS && Some(next) != config.eos_token_id {
        let input = Tensor::new(&[[next]], &device)?;
        let output = model.forward(&ForwardInputs::from_ids(input), Some(&mut cache))?;
        next = last_token_argmax(&output.logits)?;
        generated.push(next);
    }
    let elapsed = start.elapsed();

    println!("Generated: {:?}", generated);
    println!(
        "Decode: {} steps in {:?} ({:.1} tokens/s), {} positions left in cache",
        generated.len() - 1,
        elapsed,
        (generated.len() - 1) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        cache.remaining()
    );

    Ok(())
}

fn last_token_argmax(logits: &Tensor) -> anyhow::Result<u32> {
    let (_, seq_len, _) = logits.dims3()?;
    let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?.squeeze(0)?;
    Ok(last.argmax(D::Minus1)?.to_scalar::<u32>()?)
}
