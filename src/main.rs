use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, debug, error, info};

use sitematrix_pipelines::cli::parse;
use sitematrix_pipelines::config::defs::{PipelineError, RunConfig};
use sitematrix_pipelines::pipelines::site_matrix;
use sitematrix_pipelines::utils::system::{check_processor_budget, detect_cores_and_load};

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n SiteMatrix\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let (physical_cores, cpu_load) = detect_cores_and_load().await?;
    debug!("Detected {} physical cores; CPU load {}%", physical_cores, cpu_load);
    check_processor_budget(args.processors, physical_cores, cpu_load);

    let result = match RunConfig::resolve(args, &dir) {
        Ok(run_config) => site_matrix_run(Arc::new(run_config)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

async fn site_matrix_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    site_matrix::run(run_config).await
}
