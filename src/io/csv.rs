/*!
# Saving Chains to CSV

Writes a [`Chain`] to a CSV file. Enable via the `csv` feature.
*/

use std::error::Error;
use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::chain::Chain;

/**
Saves every state of a chain as one CSV row.

The resulting file has a header row `step,burn_in,dim_0,dim_1,...`. `step`
counts from 1, `burn_in` is `true` for the leading states that were excluded
from the statistics, and the remaining columns hold the position.

# Arguments

* `chain` - The chain returned in [`SampleResult::chain`](crate::chain::SampleResult::chain).
* `path` - The file to create or overwrite.

# Examples

```rust
use muq_mcmc::chain::{ChainOptions, SingleChainMcmc};
use muq_mcmc::distributions::Gaussian;
use muq_mcmc::io::csv::save_chain_csv;
use muq_mcmc::kernel::MhKernel;
use muq_mcmc::proposal::MhProposal;

let target = Gaussian::standard(2);
let kernel = MhKernel::new(&target, MhProposal::isotropic(2, 1.0)?)?;
let options = ChainOptions { steps: 100, burn_in: 10, ..ChainOptions::default() };
let result = SingleChainMcmc::new(Box::new(kernel), options)?
    .set_seed(1)
    .sample(&target, &[0.0, 0.0])?;
let path = std::env::temp_dir().join("muq_mcmc_doc_chain.csv");
save_chain_csv(result.chain.as_ref().unwrap(), &path)?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_chain_csv<P: AsRef<Path>>(chain: &Chain, path: P) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let n_dims = chain.states().first().map_or(0, |s| s.dim());

    let mut header: Vec<String> = vec!["step".to_string(), "burn_in".to_string()];
    header.extend((0..n_dims).map(|i| format!("dim_{i}")));
    wtr.write_record(&header)?;

    for (i, state) in chain.states().iter().enumerate() {
        let mut row = vec![(i + 1).to_string(), (i < chain.burn_in()).to_string()];
        row.extend(state.position.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainOptions, SingleChainMcmc};
    use crate::distributions::Gaussian;
    use crate::kernel::MhKernel;
    use crate::proposal::MhProposal;
    use tempfile::NamedTempFile;

    #[test]
    fn writes_header_and_rows() -> Result<(), Box<dyn Error>> {
        let target = Gaussian::standard(3);
        let kernel = MhKernel::new(&target, MhProposal::isotropic(3, 1.0)?)?;
        let options = ChainOptions {
            steps: 20,
            burn_in: 5,
            ..ChainOptions::default()
        };
        let result = SingleChainMcmc::new(Box::new(kernel), options)?
            .set_seed(9)
            .sample(&target, &[0.0, 0.0, 0.0])?;
        let chain = result.chain.ok_or("chain was not kept")?;

        let file = NamedTempFile::new()?;
        save_chain_csv(&chain, file.path())?;

        let mut reader = csv::Reader::from_path(file.path())?;
        let header = reader.headers()?.clone();
        assert_eq!(
            header.iter().collect::<Vec<_>>(),
            vec!["step", "burn_in", "dim_0", "dim_1", "dim_2"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 20);
        assert_eq!(&rows[4][1], "true");
        assert_eq!(&rows[5][1], "false");
        let last: f64 = rows[19][4].parse()?;
        assert_eq!(last, chain.states()[19].position[2]);
        Ok(())
    }
}
