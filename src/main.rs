use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::env;
use xlm_rs::{
    BeamSearchParams, FwdInput, TransformerConfig, TransformerModel, TransformerWeights,
};

const DIM: usize = 32;
const N_LAYERS: usize = 2;
const N_HEADS: usize = 4;
const N_WORDS: usize = 64;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("Usage: {} [options]", args[0]);
        eprintln!("Options:");
        eprintln!("  --beam <int>            Beam size (default: 0 = greedy/sampling)");
        eprintln!("  --temp <float>          Sampling temperature (default: none = greedy)");
        eprintln!("  --max-len <int>         Max output length (default: 20)");
        eprintln!("  --batch <int>           Number of random source sentences (default: 2)");
        eprintln!("  --seed <int>            Random seed (default: 0)");
        eprintln!("  --length-penalty <f>    Beam length penalty (default: 1.0)");
        eprintln!("  --early-stopping        Stop beams once their pool is full");
        std::process::exit(1);
    }

    let mut beam = 0usize;
    let mut temp: Option<f32> = None;
    let mut max_len = 20usize;
    let mut batch = 2usize;
    let mut seed = 0u64;
    let mut length_penalty = 1.0f32;
    let mut early_stopping = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--beam" => {
                beam = value.and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            "--temp" => {
                temp = value.and_then(|s| s.parse().ok());
                i += 2;
            }
            "--max-len" => {
                max_len = value.and_then(|s| s.parse().ok()).unwrap_or(20);
                i += 2;
            }
            "--batch" => {
                batch = value.and_then(|s| s.parse().ok()).unwrap_or(2);
                i += 2;
            }
            "--seed" => {
                seed = value.and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            "--length-penalty" => {
                length_penalty = value.and_then(|s| s.parse().ok()).unwrap_or(1.0);
                i += 2;
            }
            "--early-stopping" => {
                early_stopping = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);

    let enc_config = TransformerConfig::encoder(DIM, N_LAYERS, N_HEADS, N_WORDS);
    let dec_config = TransformerConfig::decoder(DIM, DIM, N_LAYERS, N_HEADS, N_WORDS);
    let enc_weights = TransformerWeights::random(&enc_config, &mut rng)?;
    let dec_weights = TransformerWeights::random(&dec_config, &mut rng)?;
    let encoder = TransformerModel::new(enc_config, enc_weights)?;
    let decoder = TransformerModel::new(dec_config, dec_weights)?;
    info!(
        "random encoder/decoder: dim={DIM}, layers={N_LAYERS}, heads={N_HEADS}, vocab={N_WORDS}"
    );

    // random source sentences, right-padded
    let src_len: Vec<usize> = (0..batch).map(|_| rng.random_range(2..=10)).collect();
    let slen = src_len.iter().copied().max().unwrap_or(0);
    let pad = encoder.config.pad_index;
    let eos = encoder.config.eos_index;
    let x = Array2::from_shape_fn((slen, batch), |(t, b)| {
        if t >= src_len[b] {
            pad
        } else if t == 0 || t + 1 == src_len[b] {
            eos
        } else {
            // skip the special ids 0..=2
            3 + (t * 7 + b * 13) as u32 % (N_WORDS as u32 - 3)
        }
    });
    let src_enc = encoder.fwd(FwdInput::new(x.view(), &src_len, false), None, None)?;
    // [slen, batch, dim] -> [batch, slen, dim]
    let src_enc = src_enc.permuted_axes([1, 0, 2]).as_standard_layout().into_owned();

    if beam > 0 {
        let params = BeamSearchParams {
            beam_size: beam,
            length_penalty,
            early_stopping,
        };
        let output = decoder.generate_beam(&src_enc, &src_len, 0, &params, max_len)?;
        for sent in 0..batch {
            println!("sentence {sent}:");
            for (r, (&len, score)) in output.hyp_lengths[sent]
                .iter()
                .zip(&output.scores[sent])
                .enumerate()
            {
                let tokens: Vec<u32> = (0..len).map(|t| output.tokens[[t, sent, r]]).collect();
                println!("  {score:>9.4} {tokens:?}");
            }
        }
    } else {
        let (tokens, lengths) = decoder.generate(&src_enc, &src_len, 0, max_len, temp, &mut rng)?;
        for (sent, &len) in lengths.iter().enumerate() {
            let out: Vec<u32> = tokens.column(sent).iter().take(len).copied().collect();
            println!("sentence {sent}: {out:?}");
        }
    }

    Ok(())
}
