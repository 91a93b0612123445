//! Samples the boomerang density with a DRAM kernel described in JSON and
//! writes the chain to `boomerang_chain.csv`.
//!
//! Run with `cargo run --example boomerang --features csv`.

use muq_mcmc::distributions::Boomerang;
use muq_mcmc::io::csv::save_chain_csv;
use muq_mcmc::McmcConfig;
use std::error::Error;

const CONFIG: &str = r#"{
    "Steps": 50000,
    "BurnIn": 5000,
    "Verbose": 2,
    "Kernel": {
        "Method": "DR",
        "NumSteps": 10000,
        "Stages": {
            "Scaled": {
                "Proposal": {
                    "Name": "AM",
                    "PropSize": 2.0,
                    "AdaptSteps": 100,
                    "AdaptStart": 1000,
                    "AdaptScale": 2.4
                },
                "Count": 3,
                "Scale": 2.0
            }
        }
    }
}"#;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let target = Boomerang::default();
    let config = McmcConfig::from_json_str(CONFIG)?;
    let result = config.build(&target)?.sample(&target, &[0.0, 1.0])?;

    let mean = result.mean();
    let cov = result.covariance();
    println!("Mean after burn-in: ({:.3}, {:.3})", mean[0], mean[1]);
    println!(
        "Variance after burn-in: ({:.3}, {:.3})",
        cov[(0, 0)],
        cov[(1, 1)]
    );
    println!("Acceptance rate: {:.3}", result.acceptance_rate);
    println!("ESS: {:?}", result.effective_sample_size().as_slice());

    if let Some(chain) = &result.chain {
        save_chain_csv(chain, "boomerang_chain.csv")?;
        println!("Saved {} states to boomerang_chain.csv", chain.len());
    }
    Ok(())
}
