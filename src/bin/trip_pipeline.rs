use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tripwatch::{
    combined_features, init_logging, interactive_from_env, log_app_start, logging_config_from_env,
    open_mapping_store, pipeline_config_from_env, run_batches, write_features_csv,
    ResolutionRequest, Resolver, SkipResolver,
};

/// Asks on stdin for the column index of each role the heuristics missed.
struct PromptResolver;

impl Resolver for PromptResolver {
    fn choose(&mut self, request: &ResolutionRequest<'_>) -> Option<usize> {
        println!("\nColumn for role '{}' could not be detected:", request.role);
        for candidate in &request.candidates {
            println!(
                "  {:>3}: {} (example: {})",
                candidate.index,
                candidate.name,
                candidate.sample.unwrap_or("-")
            );
        }
        print!("Index for '{}' (empty to skip): ", request.role);
        io::stdout().flush().ok()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        line.trim().parse().ok()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        return Err("usage: trip_pipeline <trips.csv>...".into());
    }

    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging, paths.len());

    let config = pipeline_config_from_env();
    let mut store = open_mapping_store(&config)?;
    let mut resolver: Box<dyn Resolver> = if interactive_from_env() {
        Box::new(PromptResolver)
    } else {
        Box::new(SkipResolver)
    };

    let runs = run_batches(&paths, &mut store, resolver.as_mut(), &config);

    println!("\nMapping overview");
    for run in &runs {
        match &run.outcome {
            Ok(outcome) => {
                println!(
                    "{} | fingerprint={} source={:?} unresolved={:?}",
                    outcome.name, outcome.fingerprint, outcome.mapping_source, outcome.unresolved
                );
                println!(
                    "  rows original={} cleaned={} removed={} excluded={} hours={}",
                    outcome.cleaning.original_rows,
                    outcome.cleaning.cleaned_rows,
                    outcome.cleaning.rows_removed,
                    outcome.aggregation.excluded_rows,
                    outcome.aggregation.hour_buckets
                );
                for (reason, count) in &outcome.cleaning.removed_by_reason {
                    println!("  removed {}={}", reason.as_str(), count);
                }
            }
            Err(err) => println!("{} | failed: {err}", run.name),
        }
    }

    if let Ok(out) = std::env::var("TRIPWATCH_FEATURES_OUT") {
        let rows = combined_features(&runs);
        write_features_csv(&rows, File::create(&out)?)?;
        println!("\nWrote {} hourly rows to {out}", rows.len());
    }

    Ok(())
}
