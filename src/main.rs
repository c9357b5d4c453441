use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let options = auspex::cli::AuspexdOpts::parse();

    auspex::init_logger(auspex::cli::log_level_from_verbosity(options.verbose));

    match auspex::auspexd::auspexd_run(&options).await {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("{e:?}");
            std::process::exit(1);
        }
    }
}
