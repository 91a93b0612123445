//! `Verbose` controls every log record the crate emits.
//!
//! The logger is process-global, so the whole check lives in a single test.

use log::{Level, LevelFilter, Log, Metadata, Record};
use muq_mcmc::distributions::Boomerang;
use muq_mcmc::McmcConfig;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

static RECORDS: AtomicUsize = AtomicUsize::new(0);
static DEBUG_RECORDS: AtomicUsize = AtomicUsize::new(0);

struct CountingLogger;

impl Log for CountingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with("muq_mcmc")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            RECORDS.fetch_add(1, Ordering::SeqCst);
            if record.level() == Level::Debug {
                DEBUG_RECORDS.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: CountingLogger = CountingLogger;

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kernel: &Value, verbose: u8) -> (usize, usize) {
        RECORDS.store(0, Ordering::SeqCst);
        DEBUG_RECORDS.store(0, Ordering::SeqCst);
        let config = McmcConfig::from_json_value(json!({
            "Steps": 600,
            "BurnIn": 100,
            "Seed": 5,
            "Verbose": verbose,
            "Kernel": kernel,
        }))
        .expect("valid configuration");
        let target = Boomerang::default();
        config
            .build(&target)
            .expect("kernel builds")
            .sample(&target, &[0.2, 1.2])
            .expect("chain runs");
        (
            RECORDS.load(Ordering::SeqCst),
            DEBUG_RECORDS.load(Ordering::SeqCst),
        )
    }

    #[test]
    fn level_zero_is_silent_and_level_three_logs_adaptation() {
        log::set_logger(&LOGGER).expect("no other logger installed");
        log::set_max_level(LevelFilter::Trace);

        let am = json!({
            "Name": "AM", "PropSize": 1.0, "AdaptSteps": 25,
            "AdaptStart": 50, "AdaptScale": 2.4
        });
        let kernels = [
            ("AM", json!({ "Method": "MHKernel", "Proposal": am.clone() })),
            (
                "DRAM",
                json!({ "Method": "DR", "NumSteps": 600,
                        "Stages": { "Scaled": { "Proposal": am, "Count": 3, "Scale": 2.0 } } }),
            ),
            (
                "TransportMap",
                json!({ "Method": "TransportMap", "AdaptStart": 50, "AdaptStop": 400,
                        "AdaptGap": 50, "AdaptScale": 1e6,
                        "SubMethod": { "Method": "MHKernel",
                            "Proposal": { "Name": "MHProposal", "PropSize": 2.0 } } }),
            ),
            ("NUTS", json!({ "Method": "NUTS", "MaxTreeDepth": 6 })),
        ];

        for (name, kernel) in &kernels {
            let (records, _) = run(kernel, 0);
            assert_eq!(records, 0, "{name}: Verbose 0 emitted {records} records");

            let (records, debug) = run(kernel, 1);
            assert!(records > 0, "{name}: Verbose 1 printed no summary");
            assert_eq!(debug, 0, "{name}: Verbose 1 emitted {debug} debug records");

            let (_, debug) = run(kernel, 3);
            assert!(debug > 0, "{name}: Verbose 3 emitted no debug records");
        }
    }
}
